//! Host-based DLP traffic-inspection engine: packet capture, process
//! attribution, protocol parsing, and session tracking, wired together
//! behind a single [`Engine`] an embedder starts and stops.
//!
//! Platform capture backend is chosen at compile time (`interceptor`'s
//! `windivert_backend`/`netfilter_backend`/`pf_backend`); everything above it
//! — resolver, parsers, session table, pipeline — is platform-neutral.

pub mod config;
pub mod error;
pub mod interceptor;
pub mod model;
pub mod parsers;
pub mod pipeline;
pub mod resolver;
pub mod session;

use std::sync::Arc;

use interceptor::{InterceptorHandle, PlatformInterceptor, ProcessAttributor, VerdictSink};
use parsers::ParserManager;
use pipeline::rate_limiter::{AdaptiveLimiter, RateLimiter};
use pipeline::Pipeline;
use resolver::connection_table::ConnectionTableSource;
use resolver::kernel_event::{ConnectionMapper, KernelEventSource};
use resolver::ProcessResolver;
use session::SessionManager;

use config::RuntimeConfig;
use error::Result;
use model::InterceptorStatsSnapshot;

/// Installs a panic hook that logs through `tracing` before running the
/// default hook, and initializes the global subscriber from `RUST_LOG` (or
/// `dlp_core=info`). Idempotent to call more than once is not guaranteed;
/// an embedder should call this exactly once at process startup.
pub fn init_logging() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("panic in dlp_core: {info}");
        default_hook(info);
    }));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "dlp_core=info".into()),
        )
        .try_init();
}

#[cfg(target_os = "windows")]
fn build_backend(resolver: Arc<dyn ProcessAttributor>, limiter: Arc<dyn interceptor::AdmissionControl>) -> Box<dyn PlatformInterceptor> {
    Box::new(interceptor::windivert_backend::WindowsInterceptor::new(resolver, limiter))
}

#[cfg(target_os = "linux")]
fn build_backend(resolver: Arc<dyn ProcessAttributor>, limiter: Arc<dyn interceptor::AdmissionControl>) -> Box<dyn PlatformInterceptor> {
    Box::new(interceptor::netfilter_backend::NetfilterInterceptor::new(resolver, limiter))
}

#[cfg(target_os = "macos")]
fn build_backend(resolver: Arc<dyn ProcessAttributor>, limiter: Arc<dyn interceptor::AdmissionControl>) -> Box<dyn PlatformInterceptor> {
    Box::new(interceptor::pf_backend::PfInterceptor::new(resolver, limiter))
}

/// Owns every long-lived piece of the engine and the background tasks that
/// keep them healthy: resolver cache pruning, session sweeping, and the
/// adaptive rate-limiter's periodic CPU/memory check.
pub struct Engine {
    config: RuntimeConfig,
    interceptor: Arc<InterceptorHandle>,
    resolver: Arc<ProcessResolver>,
    session_manager: Arc<SessionManager>,
    parser_manager: Arc<ParserManager>,
    rate_limiter: Arc<RateLimiter>,
    adaptive_limiter: Arc<AdaptiveLimiter>,
    pipeline: Arc<Pipeline>,
    background: Vec<tokio::task::JoinHandle<()>>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Builds every component but starts nothing: no capture thread is
    /// spawned and no background task runs until [`Engine::start`].
    pub fn new(config: RuntimeConfig) -> Self {
        let mut resolver = ProcessResolver::new(config.interceptor_config.cache_size);
        resolver.register_source(Arc::new(ConnectionTableSource::new()));
        let mapper = Arc::new(ConnectionMapper::new());
        resolver.register_source(Arc::new(KernelEventSource::new(Arc::clone(&mapper))));
        let resolver = Arc::new(resolver);

        let rate_limiter = Arc::new(RateLimiter::new(&config.traffic_limit));
        let adaptive_limiter = Arc::new(AdaptiveLimiter::new(
            Arc::clone(&rate_limiter),
            config.traffic_limit.clone(),
            config.adaptive.clone(),
        ));

        let backend = build_backend(
            Arc::clone(&resolver) as Arc<dyn ProcessAttributor>,
            Arc::clone(&rate_limiter) as Arc<dyn interceptor::AdmissionControl>,
        );
        let interceptor = Arc::new(InterceptorHandle::new(backend));

        let parser_manager = Arc::new(ParserManager::new());
        let session_manager = Arc::new(SessionManager::new(
            config::DEFAULT_MAX_SESSIONS,
            std::time::Duration::from_secs(config::DEFAULT_SESSION_TIMEOUT_SECS),
        ));

        let pipeline = Arc::new(Pipeline::new(&config, Arc::clone(&parser_manager), Arc::clone(&session_manager)));

        Self {
            config,
            interceptor,
            resolver,
            session_manager,
            parser_manager,
            rate_limiter,
            adaptive_limiter,
            pipeline,
            background: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// Initializes the capture backend, starts it, and wires the pipeline
    /// worker pool against the channel it returns. Also spawns the three
    /// periodic maintenance tasks (session sweep, resolver cache prune,
    /// adaptive rate-limiter check).
    pub fn start(&mut self) -> Result<()> {
        self.interceptor.initialize(self.config.interceptor_config.clone())?;
        self.parser_manager.initialize_all(&self.config);

        let rx = self.interceptor.start()?;
        let sink: Arc<dyn VerdictSink> = Arc::clone(&self.interceptor) as Arc<dyn VerdictSink>;
        self.workers = Arc::clone(&self.pipeline).spawn_workers(rx, sink, self.config.interceptor_config.worker_count);

        self.background.push(SessionManager::spawn_cleanup_task(Arc::clone(&self.session_manager)));
        self.background.push(Arc::clone(&self.adaptive_limiter).spawn_check_task());
        self.background.push(spawn_resolver_pruner(Arc::clone(&self.resolver)));

        tracing::info!("engine started in {:?} mode", self.config.interceptor_config.mode);
        Ok(())
    }

    /// Stops the capture backend (which drops its channel senders, ending
    /// the pipeline workers) and aborts the periodic maintenance tasks.
    pub fn stop(&mut self) {
        self.interceptor.stop();
        for handle in self.workers.drain(..) {
            handle.abort();
        }
        for handle in self.background.drain(..) {
            handle.abort();
        }
        self.parser_manager.cleanup_all();
        tracing::info!("engine stopped");
    }

    pub fn health_check(&self) -> interceptor::HealthStatus {
        self.interceptor.health_check()
    }

    pub fn capture_stats(&self) -> InterceptorStatsSnapshot {
        self.interceptor.stats().snapshot()
    }

    pub fn pipeline_stats(&self) -> Arc<pipeline::PipelineStats> {
        self.pipeline.stats()
    }

    pub fn sessions(&self) -> Vec<model::SessionInfo> {
        self.session_manager.all()
    }

    pub fn set_filter(&self, expr: &str) -> Result<()> {
        self.interceptor.set_filter(expr)
    }
}

/// Periodically sweeps the resolver's fingerprint cache for TTL-expired
/// entries, independent of the inline eviction `query()` already does on a
/// cache hit — this catches entries that are never queried again.
fn spawn_resolver_pruner(resolver: Arc<ProcessResolver>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(config::RESOLVER_CACHE_TTL_SECS));
        loop {
            ticker.tick().await;
            resolver.prune_expired();
        }
    })
}
