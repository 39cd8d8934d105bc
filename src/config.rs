//! Centralized runtime constants and the top-level YAML configuration surface.
//!
//! Tunable intervals, thresholds, and counts are collected here so they can be
//! found and adjusted in one place rather than scattered across modules —
//! same rationale the teacher used for its own `config.rs`.

use serde::{Deserialize, Serialize};

use crate::model::InterceptorConfig;

/// Resolver cache TTL (seconds), spec §4.2.
pub const RESOLVER_CACHE_TTL_SECS: u64 = 30;
/// Resolver cache size above which a full prune-expired pass runs.
pub const RESOLVER_CACHE_PRUNE_THRESHOLD: usize = 1000;
/// OS connection-table refresh interval (seconds), spec §4.2.
pub const CONNECTION_TABLE_REFRESH_SECS: u64 = 10;
/// Ceiling for the connection-table refresh backoff (seconds).
pub const CONNECTION_TABLE_REFRESH_MAX_SECS: u64 = 60;
/// Kernel-event connection mapper capacity, spec §4.2.
pub const MAPPER_MAX_ENTRIES: usize = 10_000;
/// How often the mapper sweeps for expired entries (seconds).
pub const MAPPER_CLEANUP_INTERVAL_SECS: u64 = 30;
/// How long a mapper entry survives without being touched (spec's `MAPPING_EXPIRE_TIME`).
pub const MAPPING_EXPIRE_TIME_SECS: u64 = 300;

/// Default max sessions tracked concurrently (spec §4.3 `SessionManager`).
pub const DEFAULT_MAX_SESSIONS: usize = 50_000;
/// Default session idle timeout (seconds).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;
/// Session-table cleanup sweep interval (spec §4.3: "once per minute").
pub const SESSION_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Batch size a capture worker accumulates before handing off, spec §4.1.
pub const CAPTURE_BATCH_SIZE: usize = 5;
/// Max wait before flushing a partial batch (milliseconds).
pub const CAPTURE_BATCH_MAX_WAIT_MS: u64 = 5;
/// Starting per-worker backoff delay on repeated capture errors (microseconds).
pub const CAPTURE_BACKOFF_START_US: u64 = 100;
/// Ceiling for the per-worker backoff delay (milliseconds).
pub const CAPTURE_BACKOFF_MAX_MS: u64 = 1000;
/// Consecutive capture failures before a worker marks the interceptor degraded.
pub const CAPTURE_MAX_ERRORS: u32 = 10;

/// WinDivert handle-open retry backoff base (seconds).
pub const WINDIVERT_RETRY_BASE_SECS: u64 = 1;
/// WinDivert handle-open attempts per filter rung.
pub const WINDIVERT_RETRIES_PER_FILTER: u32 = 2;
/// Pause between driver stop and reinstall during repair (seconds).
pub const WINDIVERT_REPAIR_PAUSE_SECS: u64 = 2;

/// Per-parser timeout before a warning is logged (work is not killed), spec §5.
pub const PARSER_TIMEOUT_SECS: u64 = 30;

/// Adaptive rate-limiter health-check interval, spec §4.4.
pub const ADAPTIVE_CHECK_INTERVAL_SECS: u64 = 60;
/// Minimum gap between token-bucket refills, to avoid tiny refills, spec §4.4.
pub const RATE_LIMITER_MIN_REFILL_MS: u64 = 100;

/// Default application ports the optimized WinDivert/netfilter/pf filters target.
pub const DEFAULT_APPLICATION_PORTS: &[u16] = &[80, 443, 21, 25, 3306];

/// Top-level YAML configuration, matching the keys in spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub interceptor_config: InterceptorConfig,
    #[serde(default)]
    pub traffic_limit: TrafficLimitConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficLimitConfig {
    pub enable: bool,
    pub max_packets_per_second: u32,
    pub max_bytes_per_second: u64,
    pub burst_size: u32,
}

impl Default for TrafficLimitConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_packets_per_second: 10_000,
            max_bytes_per_second: 50_000_000,
            burst_size: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub enable: bool,
    pub check_interval_secs: u64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enable: false,
            check_interval_secs: ADAPTIVE_CHECK_INTERVAL_SECS,
            cpu_threshold: 80.0,
            memory_threshold: 80.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub processes: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
}

impl RuntimeConfig {
    /// Parses a YAML document into a [`RuntimeConfig`].
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interceptor_config: InterceptorConfig::default(),
            traffic_limit: TrafficLimitConfig::default(),
            adaptive: AdaptiveConfig::default(),
            whitelist: WhitelistConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapper_cleanup_interval_divides_expire_time_evenly_enough() {
        // Not an exact divisor requirement, just sanity: cleanup runs more often
        // than entries expire, so nothing survives past its expiry unnoticed.
        assert!(MAPPER_CLEANUP_INTERVAL_SECS < MAPPING_EXPIRE_TIME_SECS);
    }

    #[test]
    fn test_all_intervals_positive() {
        assert!(RESOLVER_CACHE_TTL_SECS > 0);
        assert!(CONNECTION_TABLE_REFRESH_SECS > 0);
        assert!(MAPPER_MAX_ENTRIES > 0);
        assert!(DEFAULT_MAX_SESSIONS > 0);
        assert!(CAPTURE_BATCH_SIZE > 0);
        assert!(CAPTURE_MAX_ERRORS > 0);
    }

    #[test]
    fn test_runtime_config_default_traffic_limit_disabled() {
        let cfg = RuntimeConfig::default();
        assert!(!cfg.traffic_limit.enable);
        assert!(!cfg.adaptive.enable);
    }

    #[test]
    fn test_runtime_config_parses_minimal_yaml() {
        let yaml = r#"
interceptor_config:
  filter: null
  buffer_size: 65535
  channel_size: 500
  worker_count: 4
  cache_size: 1000
  interface: null
  bypass_cidrs: ["127.0.0.0/8"]
  proxy_port: 8080
  mode: Monitor
  auto_reinject: true
  queue_len: 4096
  queue_time_ms: 2000
  allow_diagnostic_passthrough: false
traffic_limit:
  enable: true
  max_packets_per_second: 5000
  max_bytes_per_second: 1000000
  burst_size: 1000
"#;
        let cfg = RuntimeConfig::from_yaml(yaml).unwrap();
        assert!(cfg.traffic_limit.enable);
        assert_eq!(cfg.traffic_limit.max_packets_per_second, 5000);
        assert_eq!(cfg.interceptor_config.worker_count, 4);
        // adaptive/whitelist were omitted — defaults should apply.
        assert!(!cfg.adaptive.enable);
        assert!(cfg.whitelist.processes.is_empty());
    }

    #[test]
    fn test_runtime_config_rejects_malformed_yaml() {
        let bad = "interceptor_config: [this, is, not, a, map]";
        assert!(RuntimeConfig::from_yaml(bad).is_err());
    }
}
