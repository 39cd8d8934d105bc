//! The consumer side of capture: pulls [`PacketInfo`] off a backend's
//! channel, runs it through the protocol parser and the session table, and
//! for `InterceptAndAllow`/`InterceptAndBlock` modes hands a verdict back to
//! the backend through [`VerdictSink`]. `Monitor` mode never needs a verdict
//! here — the backend already reinjects inline as it captures, so the
//! pipeline only observes.
//!
//! Mirrors the teacher's own worker-pool shape (N tasks draining one shared
//! receiver) rather than doing everything on a single consumer thread, since
//! parsing and session bookkeeping are cheap but the channel can be bursty.

pub mod rate_limiter;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::{RuntimeConfig, WhitelistConfig};
use crate::interceptor::{PacketReceiver, VerdictSink};
use crate::model::{InterceptMode, PacketInfo, ParsedData};
use crate::parsers::ParserManager;
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Allow,
    Block,
}

/// Counters surfaced alongside [`crate::model::InterceptorStatsSnapshot`];
/// kept separate since these describe pipeline-layer decisions, not capture.
#[derive(Default)]
pub struct PipelineStats {
    pub parsed: AtomicU64,
    pub whitelisted: AtomicU64,
    pub allowed: AtomicU64,
    pub blocked: AtomicU64,
    pub reinject_failures: AtomicU64,
}

impl PipelineStats {
    fn record_parsed(&self) {
        self.parsed.fetch_add(1, Ordering::Relaxed);
    }
    fn record_whitelisted(&self) {
        self.whitelisted.fetch_add(1, Ordering::Relaxed);
    }
    fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }
    fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }
    fn record_reinject_failure(&self) {
        self.reinject_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Second-layer application filter (spec supplement, §2): consulted after
/// the bypass-CIDR recheck the capture workers already do, using whatever
/// the resolver and the parser were able to attach to the packet.
struct Whitelist {
    processes: HashSet<String>,
    domains: HashSet<String>,
    ips: HashSet<String>,
}

impl Whitelist {
    fn from_config(config: &WhitelistConfig) -> Self {
        Self {
            processes: config.processes.iter().map(|s| s.to_lowercase()).collect(),
            domains: config.domains.iter().map(|s| s.to_lowercase()).collect(),
            ips: config.ips.iter().cloned().collect(),
        }
    }

    fn matches_process_or_ip(&self, pkt: &PacketInfo) -> bool {
        let process_match = pkt
            .process
            .as_ref()
            .map(|p| self.processes.contains(&p.name.to_lowercase()))
            .unwrap_or(false);
        process_match || self.ips.contains(&pkt.src_ip.to_string()) || self.ips.contains(&pkt.dst_ip.to_string())
    }

    fn matches_domain(&self, domain: &str) -> bool {
        self.domains.contains(&domain.to_lowercase())
    }
}

/// Best-effort domain for a parsed packet: an HTTP `Host` header if present,
/// else a cached/observed TLS `server_name`, else none.
fn domain_of(data: &ParsedData) -> Option<String> {
    data.headers
        .get("Host")
        .cloned()
        .or_else(|| data.metadata.get("server_name").and_then(|v| v.as_str()).map(str::to_string))
}

pub struct Pipeline {
    parser_manager: Arc<ParserManager>,
    session_manager: Arc<SessionManager>,
    whitelist: Whitelist,
    mode: InterceptMode,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(config: &RuntimeConfig, parser_manager: Arc<ParserManager>, session_manager: Arc<SessionManager>) -> Self {
        Self {
            parser_manager,
            session_manager,
            whitelist: Whitelist::from_config(&config.whitelist),
            mode: config.interceptor_config.mode,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Parses, tracks, and whitelist-checks one packet, returning the
    /// verdict a non-monitor mode should act on.
    fn process_one(&self, pkt: &PacketInfo) -> Verdict {
        if self.whitelist.matches_process_or_ip(pkt) {
            self.stats.record_whitelisted();
            return Verdict::Allow;
        }

        let data = self.parser_manager.process(pkt);
        self.stats.record_parsed();

        if let Some(domain) = domain_of(&data) {
            if self.whitelist.matches_domain(&domain) {
                self.stats.record_whitelisted();
                return Verdict::Allow;
            }
        }

        self.session_manager.record_packet(
            pkt.five_tuple(),
            &data.protocol,
            pkt.direction,
            pkt.size as u64,
            SystemTime::now(),
        );

        Verdict::Allow
    }

    /// Drains `rx` with `worker_count` concurrent tasks until the channel
    /// closes (the backend's `stop()` drops every sender). Returns the
    /// `JoinHandle`s so the caller can await a clean shutdown.
    pub fn spawn_workers(
        self: Arc<Self>,
        rx: PacketReceiver,
        sink: Arc<dyn VerdictSink>,
        worker_count: usize,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let rx = Arc::new(AsyncMutex::new(rx));
        (0..worker_count.max(1))
            .map(|_| {
                let pipeline = Arc::clone(&self);
                let rx = Arc::clone(&rx);
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    loop {
                        let pkt = {
                            let mut guard = rx.lock().await;
                            guard.recv().await
                        };
                        let Some(pkt) = pkt else { break };
                        pipeline.handle(&pkt, sink.as_ref());
                    }
                })
            })
            .collect()
    }

    /// Processes one packet and, for non-monitor modes, applies the
    /// resulting verdict via `sink`. Monitor mode never reinjects here since
    /// the capture worker already did so inline as it forwarded the packet.
    fn handle(&self, pkt: &PacketInfo, sink: &dyn VerdictSink) {
        let verdict = self.process_one(pkt);

        match self.mode {
            InterceptMode::Monitor => {}
            InterceptMode::InterceptAndAllow => match verdict {
                Verdict::Allow => {
                    self.stats.record_allowed();
                    if let Err(e) = sink.reinject(pkt) {
                        tracing::warn!("pipeline reinject (allow) failed: {e}");
                        self.stats.record_reinject_failure();
                    }
                }
                Verdict::Block => {
                    self.stats.record_blocked();
                    if let Err(e) = sink.drop_packet(pkt) {
                        tracing::warn!("pipeline drop (block) failed: {e}");
                    }
                    tracing::info!("blocked flow {} by policy", pkt.five_tuple().session_id());
                }
            },
            InterceptMode::InterceptAndBlock => match verdict {
                Verdict::Allow => {
                    self.stats.record_allowed();
                    if let Err(e) = sink.reinject(pkt) {
                        tracing::warn!("pipeline reinject (allow) failed: {e}");
                        self.stats.record_reinject_failure();
                    }
                }
                Verdict::Block => {
                    self.stats.record_blocked();
                    if let Err(e) = sink.drop_packet(pkt) {
                        tracing::warn!("pipeline drop (block) failed: {e}");
                    }
                    tracing::info!("blocked flow {} by policy (default-deny mode)", pkt.five_tuple().session_id());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::model::{Direction, L4Protocol, ProcessInfo, ReinjectHandle};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    struct FakeSink {
        reinjected: AtomicUsize,
        fail: bool,
    }

    impl VerdictSink for FakeSink {
        fn reinject(&self, _packet: &PacketInfo) -> crate::error::Result<()> {
            if self.fail {
                return Err(crate::error::EngineError::ReinjectFailed("fake".into()));
            }
            self.reinjected.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn drop_packet(&self, _packet: &PacketInfo) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn http_packet() -> PacketInfo {
        PacketInfo::new(
            1,
            Direction::Outbound,
            L4Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            Ipv4Addr::new(1, 2, 3, 4),
            80,
            b"GET /secrets HTTP/1.1\r\nHost: internal.example.com\r\n\r\n".to_vec(),
            ReinjectHandle::None,
        )
    }

    fn pipeline(config: &RuntimeConfig) -> Pipeline {
        Pipeline::new(
            config,
            Arc::new(ParserManager::new()),
            Arc::new(SessionManager::default()),
        )
    }

    #[test]
    fn test_whitelisted_process_skips_parsing_but_allows() {
        let mut config = RuntimeConfig::default();
        config.whitelist.processes.push("chrome.exe".to_string());
        let pipeline = pipeline(&config);

        let mut pkt = http_packet();
        pkt.process = Some(Arc::new(ProcessInfo { pid: 100, name: "chrome.exe".into(), exe_path: "".into(), user: "".into(), cmdline: "".into() }));

        let verdict = pipeline.process_one(&pkt);
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(pipeline.stats().whitelisted.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().parsed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_whitelisted_domain_checked_after_parsing() {
        let mut config = RuntimeConfig::default();
        config.whitelist.domains.push("internal.example.com".to_string());
        let pipeline = pipeline(&config);

        let verdict = pipeline.process_one(&http_packet());
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(pipeline.stats().parsed.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().whitelisted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_non_whitelisted_packet_records_session() {
        let config = RuntimeConfig::default();
        let pipeline = pipeline(&config);

        pipeline.process_one(&http_packet());
        assert_eq!(pipeline.session_manager.len(), 1);
        assert_eq!(pipeline.stats().whitelisted.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_intercept_and_allow_mode_reinjects_on_allow_verdict() {
        let mut config = RuntimeConfig::default();
        config.interceptor_config.mode = InterceptMode::InterceptAndAllow;
        let pipeline = pipeline(&config);
        let sink = FakeSink { reinjected: AtomicUsize::new(0), fail: false };

        pipeline.handle(&http_packet(), &sink);
        assert_eq!(sink.reinjected.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().allowed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_monitor_mode_never_calls_sink() {
        let config = RuntimeConfig::default();
        let pipeline = pipeline(&config);
        let sink = FakeSink { reinjected: AtomicUsize::new(0), fail: false };

        pipeline.handle(&http_packet(), &sink);
        assert_eq!(sink.reinjected.load(Ordering::Relaxed), 0);
        assert_eq!(pipeline.stats().allowed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_reinject_failure_is_counted_not_propagated() {
        let mut config = RuntimeConfig::default();
        config.interceptor_config.mode = InterceptMode::InterceptAndAllow;
        let pipeline = pipeline(&config);
        let sink = FakeSink { reinjected: AtomicUsize::new(0), fail: true };

        pipeline.handle(&http_packet(), &sink);
        assert_eq!(pipeline.stats().reinject_failures.load(Ordering::Relaxed), 1);
    }
}
