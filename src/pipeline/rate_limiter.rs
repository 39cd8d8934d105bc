//! Adaptive token-bucket rate limiting (spec §4.4): a packets-per-second
//! bucket and a bytes-per-second bucket, each with burst capacity, wrapped
//! by an [`AdaptiveLimiter`] that scales all three limits down under CPU or
//! memory pressure. Grounded in the teacher's `core/rate_limiter.rs`
//! token-bucket idiom, generalized from per-process bandwidth shaping to the
//! capture path's packet admission check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::System;

use crate::config::{AdaptiveConfig, RATE_LIMITER_MIN_REFILL_MS, TrafficLimitConfig};
use crate::interceptor::AdmissionControl;

struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self { rate, burst, tokens: burst, last_refill: Instant::now() }
    }

    /// Refills proportionally to elapsed wall-clock time, but only if at
    /// least [`RATE_LIMITER_MIN_REFILL_MS`] has passed, to avoid tiny
    /// floating-point refills on a hot path.
    fn maybe_refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed < Duration::from_millis(RATE_LIMITER_MIN_REFILL_MS) {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;
    }

    fn try_consume(&mut self, amount: f64) -> bool {
        self.maybe_refill();
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    fn rescale(&mut self, rate: f64, burst: f64) {
        self.rate = rate;
        self.burst = burst;
        self.tokens = self.tokens.min(burst);
    }
}

/// Two independent buckets (packets/sec, bytes/sec); an admission check
/// consumes 1 packet token and `size` byte tokens, dropping if either is
/// short.
pub struct RateLimiter {
    packets: Mutex<TokenBucket>,
    bytes: Mutex<TokenBucket>,
    enabled: bool,
    dropped: AtomicU64,
    admitted: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: &TrafficLimitConfig) -> Self {
        Self {
            packets: Mutex::new(TokenBucket::new(config.max_packets_per_second as f64, config.burst_size as f64)),
            bytes: Mutex::new(TokenBucket::new(config.max_bytes_per_second as f64, (config.max_bytes_per_second * 2) as f64)),
            enabled: config.enable,
            dropped: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Applies a new scaling factor to both buckets, multiplying their
    /// original configured rate/burst rather than compounding on the
    /// already-scaled value.
    fn rescale(&self, packet_rate: f64, packet_burst: f64, byte_rate: f64, byte_burst: f64) {
        self.packets.lock().unwrap().rescale(packet_rate, packet_burst);
        self.bytes.lock().unwrap().rescale(byte_rate, byte_burst);
    }
}

impl AdmissionControl for RateLimiter {
    fn admit(&self, size: usize) -> bool {
        if !self.enabled {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let packet_ok = self.packets.lock().unwrap().try_consume(1.0);
        let byte_ok = self.bytes.lock().unwrap().try_consume(size as f64);
        if packet_ok && byte_ok {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// Wraps a [`RateLimiter`] with a periodic CPU/memory health check that
/// scales all configured limits down under load, per spec §4.4's formula:
/// `factor = min(cpu_threshold/cpu, mem_threshold/mem, 1.0)`, clamped to
/// `[0.1, 1.0]`, applied only when it shifts by more than 0.1 from the
/// currently applied factor.
pub struct AdaptiveLimiter {
    limiter: std::sync::Arc<RateLimiter>,
    original: TrafficLimitConfig,
    config: AdaptiveConfig,
    applied_factor: Mutex<f64>,
}

impl AdaptiveLimiter {
    pub fn new(limiter: std::sync::Arc<RateLimiter>, original: TrafficLimitConfig, config: AdaptiveConfig) -> Self {
        Self { limiter, original, config, applied_factor: Mutex::new(1.0) }
    }

    pub fn applied_factor(&self) -> f64 {
        *self.applied_factor.lock().unwrap()
    }

    /// Runs one check using the given CPU/memory percentages (0-100),
    /// returning `true` if the factor changed and limits were rescaled.
    pub fn check_and_apply(&self, cpu_percent: f64, mem_percent: f64) -> bool {
        if !self.config.enable {
            return false;
        }
        let cpu_ratio = if cpu_percent > 0.0 { self.config.cpu_threshold / cpu_percent } else { 1.0 };
        let mem_ratio = if mem_percent > 0.0 { self.config.memory_threshold / mem_percent } else { 1.0 };
        let factor = cpu_ratio.min(mem_ratio).min(1.0).clamp(0.1, 1.0);

        let mut applied = self.applied_factor.lock().unwrap();
        if (factor - *applied).abs() <= 0.1 {
            return false;
        }

        self.limiter.rescale(
            self.original.max_packets_per_second as f64 * factor,
            self.original.burst_size as f64 * factor,
            self.original.max_bytes_per_second as f64 * factor,
            (self.original.max_bytes_per_second * 2) as f64 * factor,
        );
        tracing::info!("adaptive limiter rescaled to factor {factor:.2} (cpu={cpu_percent:.1}%, mem={mem_percent:.1}%)");
        *applied = factor;
        true
    }

    /// Reads current CPU/memory utilization via `sysinfo` and applies a
    /// check. Two refreshes are needed for `sysinfo`'s CPU usage to settle,
    /// so this is meant to be called on a `check_interval` ticker, not ad hoc.
    pub fn check_system(&self, system: &mut System) -> bool {
        system.refresh_cpu_usage();
        system.refresh_memory();
        let cpu = system.global_cpu_usage() as f64;
        let mem = if system.total_memory() > 0 {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        } else {
            0.0
        };
        self.check_and_apply(cpu, mem)
    }

    pub fn spawn_check_task(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut system = System::new_all();
            let mut ticker = tokio::time::interval(Duration::from_secs(self.config.check_interval_secs));
            loop {
                ticker.tick().await;
                self.check_system(&mut system);
            }
        })
    }
}
