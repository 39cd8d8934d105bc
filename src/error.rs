//! Unified error type for the engine's public operations.
//!
//! Per the error taxonomy in spec.md §7, only initialization failures and
//! handle loss are meant to reach an embedding supervisor — everything else
//! (rate-limit drops, parse failures, resolver misses, session-cap eviction)
//! is local and counted, never an [`EngineError`]. `kind()` lets an embedder
//! branch on the failure domain without string-matching `Display` output.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing privilege, unsupported OS, or the kernel component could not
    /// be installed/started. `initialize`/`start` fail outright; no silent retry.
    #[error("fatal initialization error: {0}")]
    FatalInit(String),

    /// A single kernel read returned an error code. Counted and backed off;
    /// only escalated to [`EngineError::HandleInvalid`] after `max_errors`
    /// consecutive failures trigger a repair attempt that itself fails.
    #[error("transient capture error: {0}")]
    TransientCapture(String),

    /// The kernel handle was lost mid-stream. The interceptor transitions to
    /// stopped and this bubbles to the embedding supervisor.
    #[error("capture handle invalid: {0}")]
    HandleInvalid(String),

    /// The kernel refused every rung of the filter fallback ladder.
    #[error("filter rejected by kernel: {0}")]
    FilterRejected(String),

    /// `set_filter` was called with a syntactically invalid expression.
    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    /// `reinject` could not hand the packet back to the kernel.
    #[error("reinject failed: {0}")]
    ReinjectFailed(String),

    /// `start` was called while the interceptor was already running.
    #[error("interceptor already running")]
    AlreadyRunning,

    /// I/O failure unrelated to packet capture itself (service control,
    /// vendored driver file copy, subprocess invocation).
    #[error("I/O error: {0}")]
    Io(String),
}

impl EngineError {
    /// Error kind as a stable string, for embedders that want to branch on
    /// failure domain without matching on `Display` text.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::FatalInit(_) => "FatalInit",
            EngineError::TransientCapture(_) => "TransientCapture",
            EngineError::HandleInvalid(_) => "HandleInvalid",
            EngineError::FilterRejected(_) => "FilterRejected",
            EngineError::InvalidFilter(_) => "InvalidFilter",
            EngineError::ReinjectFailed(_) => "ReinjectFailed",
            EngineError::AlreadyRunning => "AlreadyRunning",
            EngineError::Io(_) => "Io",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::FatalInit(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
