//! Core data types shared across the capture, resolver, parser, and pipeline
//! subsystems.
//!
//! These mirror the entities in the system's data model: a captured packet,
//! the process it was attributed to, an OS connection-table snapshot, a
//! parsed protocol record, flow/session bookkeeping, and the interceptor's
//! running counters. Nothing here owns a subsystem's behavior — this module
//! is data only.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

/// Direction a captured frame was travelling relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Layer-4 protocol of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

/// The 5-tuple identifying a flow: protocol, source, and destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub protocol: L4Protocol,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl FiveTuple {
    pub fn new(
        protocol: L4Protocol,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self {
            protocol,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }

    /// The tuple as seen from the other endpoint — used for reverse lookups
    /// in the connection mapper and process cache.
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }

    /// Cache fingerprint: `"proto:srcIP:srcPort:dstIP:dstPort"`.
    pub fn fingerprint(&self) -> String {
        format!(
            "{:?}:{}:{}:{}:{}",
            self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }

    /// Session id: `"srcIP:srcPort-dstIP:dstPort"`.
    pub fn session_id(&self) -> String {
        format!(
            "{}:{}-{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Opaque per-packet reinjection handle. The pipeline never interprets this —
/// only the backend that produced it knows how to use it on `reinject`.
#[derive(Debug, Clone)]
pub enum ReinjectHandle {
    /// Raw WinDivert address structure bytes, replayed verbatim on reinject.
    WinDivertAddress(Vec<u8>),
    /// netfilter_queue packet id awaiting a verdict.
    NetfilterQueueId(u32),
    /// macOS pf divert socket — no extra state needed per packet.
    PfDivertSocket,
    /// No reinjection is possible for this packet (e.g. synthetic packets in tests).
    None,
}

/// A single captured frame, en route from the platform interceptor to the
/// analysis pipeline.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub id: u64,
    pub timestamp: SystemTime,
    pub direction: Direction,
    pub protocol: L4Protocol,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
    pub size: usize,
    pub metadata: HashMap<String, String>,
    pub process: Option<Arc<ProcessInfo>>,
    pub reinject: ReinjectHandle,
}

impl PacketInfo {
    /// Builds a packet, deriving `size` from the payload so the
    /// `size == len(payload)` invariant always holds by construction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        direction: Direction,
        protocol: L4Protocol,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        payload: Vec<u8>,
        reinject: ReinjectHandle,
    ) -> Self {
        let size = payload.len();
        Self {
            id,
            timestamp: SystemTime::now(),
            direction,
            protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            payload,
            size,
            metadata: HashMap::new(),
            process: None,
            reinject,
        }
    }

    pub fn five_tuple(&self) -> FiveTuple {
        FiveTuple::new(
            self.protocol,
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
        )
    }

    pub fn session_id(&self) -> String {
        self.five_tuple().session_id()
    }

    /// The local port this host owns for this packet — source on the way
    /// out, destination on the way in.
    pub fn local_port(&self) -> u16 {
        match self.direction {
            Direction::Outbound => self.src_port,
            Direction::Inbound => self.dst_port,
        }
    }
}

/// Process identity resolved for a flow.
///
/// `pid == 0` means "unresolved" — callers that need a concrete value for
/// downstream robustness should substitute [`ProcessInfo::unresolved`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe_path: String,
    pub user: String,
    pub cmdline: String,
}

impl ProcessInfo {
    pub fn unresolved() -> Self {
        Self {
            pid: 0,
            name: "unknown_process".to_string(),
            exe_path: String::new(),
            user: String::new(),
            cmdline: String::new(),
        }
    }

    /// Synthetic entry for well-known system PIDs (0, 4, 8, ...) that are
    /// never worth probing with a process-query API.
    pub fn system(pid: u32) -> Self {
        Self {
            pid,
            name: format!("system_process_{pid}"),
            exe_path: String::new(),
            user: "SYSTEM".to_string(),
            cmdline: String::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.pid > 0
    }
}

/// Observed state of an OS-level connection-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Unknown,
    Listening,
    Established,
    Closed,
}

/// A single row from the OS TCP/UDP connection table, or a kernel connect event.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub protocol: L4Protocol,
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub state: ConnectionState,
    pub last_seen: Instant,
    pub pid: Option<u32>,
}

impl ConnectionInfo {
    pub fn is_expired(&self, expire_after: Duration) -> bool {
        self.last_seen.elapsed() > expire_after
    }
}

/// Operating mode applied per captured packet (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InterceptMode {
    /// Reinject immediately, analyze a best-effort copy.
    Monitor = 0,
    /// Hold for analysis, reinject once the pipeline ACKs.
    InterceptAndAllow = 1,
    /// Hold for analysis, reinject or drop per the policy verdict.
    InterceptAndBlock = 2,
}

/// Immutable-after-`initialize` configuration for a [`PlatformInterceptor`](crate::interceptor::PlatformInterceptor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptorConfig {
    /// Overriding kernel filter expression; `None` uses the optimized builder.
    pub filter: Option<String>,
    pub buffer_size: usize,
    pub channel_size: usize,
    pub worker_count: usize,
    pub cache_size: usize,
    pub interface: Option<String>,
    /// CIDRs whose traffic is never captured or analyzed.
    pub bypass_cidrs: Vec<String>,
    pub proxy_port: u16,
    pub mode: InterceptMode,
    pub auto_reinject: bool,
    pub queue_len: u32,
    pub queue_time_ms: u32,
    /// Opt-in to the `"true"` diagnostic fallback filter rung, which disables
    /// the bypass guarantees. Default `false` (Open Question #3 in SPEC_FULL.md).
    pub allow_diagnostic_passthrough: bool,
}

impl InterceptorConfig {
    pub fn default_bypass_cidrs() -> Vec<String> {
        vec![
            "127.0.0.0/8".to_string(),
            "10.0.0.0/8".to_string(),
            "172.16.0.0/12".to_string(),
            "192.168.0.0/16".to_string(),
            "169.254.0.0/16".to_string(),
            "224.0.0.0/4".to_string(),
            "255.255.255.255/32".to_string(),
        ]
    }
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            filter: None,
            buffer_size: 65535,
            channel_size: 500,
            worker_count: 4,
            cache_size: 1000,
            interface: None,
            bypass_cidrs: Self::default_bypass_cidrs(),
            proxy_port: 8080,
            mode: InterceptMode::Monitor,
            auto_reinject: true,
            queue_len: 4096,
            queue_time_ms: 2000,
            allow_diagnostic_passthrough: false,
        }
    }
}

/// Normalized record produced by a protocol parser for one packet.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedData {
    pub protocol: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub content_type: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub sessions: Vec<SessionInfo>,
}

impl ParsedData {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Default::default()
        }
    }
}

/// Lifecycle state of a tracked flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    New,
    Established,
    Closing,
    Closed,
}

/// Bookkeeping for one flow, shared by id across parsers (never by reference —
/// the session table is the single source of truth, per spec §3 ownership rules).
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub protocol: String,
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub start_time: SystemTime,
    pub last_seen: SystemTime,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packet_count: u64,
    pub state: SessionState,
    pub metadata: HashMap<String, String>,
}

impl SessionInfo {
    pub fn new(tuple: FiveTuple, protocol: impl Into<String>, at: SystemTime) -> Self {
        Self {
            session_id: tuple.session_id(),
            protocol: protocol.into(),
            local_addr: tuple.src_ip,
            local_port: tuple.src_port,
            remote_addr: tuple.dst_ip,
            remote_port: tuple.dst_port,
            start_time: at,
            last_seen: at,
            bytes_sent: 0,
            bytes_recv: 0,
            packet_count: 0,
            state: SessionState::New,
            metadata: HashMap::new(),
        }
    }

    /// Updates byte counters and `last_seen` for one packet. `last_seen` is
    /// monotonic by the timestamp of the packet that updated it, not by
    /// wall-clock receipt, so callers should pass the packet's own timestamp.
    pub fn record_packet(&mut self, direction: Direction, bytes: u64, at: SystemTime) {
        match direction {
            Direction::Outbound => self.bytes_sent += bytes,
            Direction::Inbound => self.bytes_recv += bytes,
        }
        self.packet_count += 1;
        if at > self.last_seen {
            self.last_seen = at;
        }
        if self.state == SessionState::New {
            self.state = SessionState::Established;
        }
    }

    pub fn is_timed_out(&self, timeout: Duration, now: SystemTime) -> bool {
        now.duration_since(self.last_seen).unwrap_or(Duration::ZERO) > timeout
    }
}

/// Monotonic counters for a running interceptor. Never reset at runtime.
#[derive(Debug)]
pub struct InterceptorStats {
    pub packets_processed: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_reinjected: AtomicU64,
    pub bytes_processed: AtomicU64,
    pub errors: AtomicU64,
    start_time: Instant,
}

impl InterceptorStats {
    pub fn new() -> Self {
        Self {
            packets_processed: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            packets_reinjected: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_processed(&self, bytes: u64) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reinjected(&self) {
        self.packets_reinjected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> InterceptorStatsSnapshot {
        InterceptorStatsSnapshot {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_reinjected: self.packets_reinjected.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs_f64(),
        }
    }
}

impl Default for InterceptorStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time, serializable view of [`InterceptorStats`].
#[derive(Debug, Clone, Serialize)]
pub struct InterceptorStatsSnapshot {
    pub packets_processed: u64,
    pub packets_dropped: u64,
    pub packets_reinjected: u64,
    pub bytes_processed: u64,
    pub errors: u64,
    pub uptime_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn test_packet_info_size_matches_payload() {
        let pkt = PacketInfo::new(
            1,
            Direction::Outbound,
            L4Protocol::Tcp,
            ip(10, 0, 0, 1),
            5000,
            ip(93, 184, 216, 34),
            80,
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
            ReinjectHandle::None,
        );
        assert_eq!(pkt.size, pkt.payload.len());
    }

    #[test]
    fn test_five_tuple_fingerprint_and_session_id() {
        let tuple = FiveTuple::new(L4Protocol::Tcp, ip(10, 0, 0, 1), 5000, ip(1, 2, 3, 4), 443);
        assert_eq!(tuple.fingerprint(), "Tcp:10.0.0.1:5000:1.2.3.4:443");
        assert_eq!(tuple.session_id(), "10.0.0.1:5000-1.2.3.4:443");
    }

    #[test]
    fn test_five_tuple_reversed_swaps_endpoints() {
        let tuple = FiveTuple::new(L4Protocol::Tcp, ip(10, 0, 0, 1), 5000, ip(1, 2, 3, 4), 443);
        let rev = tuple.reversed();
        assert_eq!(rev.src_ip, ip(1, 2, 3, 4));
        assert_eq!(rev.src_port, 443);
        assert_eq!(rev.dst_ip, ip(10, 0, 0, 1));
        assert_eq!(rev.dst_port, 5000);
    }

    #[test]
    fn test_process_info_unresolved_has_zero_pid() {
        let p = ProcessInfo::unresolved();
        assert_eq!(p.pid, 0);
        assert!(!p.is_resolved());
        assert_eq!(p.name, "unknown_process");
    }

    #[test]
    fn test_process_info_resolved() {
        let p = ProcessInfo {
            pid: 1234,
            name: "chrome.exe".into(),
            exe_path: "C:\\chrome.exe".into(),
            user: "alice".into(),
            cmdline: "chrome.exe --foo".into(),
        };
        assert!(p.is_resolved());
    }

    #[test]
    fn test_session_info_record_packet_updates_counters() {
        let tuple = FiveTuple::new(L4Protocol::Tcp, ip(10, 0, 0, 1), 5000, ip(1, 2, 3, 4), 443);
        let t0 = SystemTime::now();
        let mut session = SessionInfo::new(tuple, "https", t0);
        assert_eq!(session.state, SessionState::New);

        session.record_packet(Direction::Outbound, 100, t0);
        assert_eq!(session.bytes_sent, 100);
        assert_eq!(session.packet_count, 1);
        assert_eq!(session.state, SessionState::Established);

        let t1 = t0 + Duration::from_secs(1);
        session.record_packet(Direction::Inbound, 200, t1);
        assert_eq!(session.bytes_recv, 200);
        assert_eq!(session.packet_count, 2);
        assert_eq!(session.last_seen, t1);
    }

    #[test]
    fn test_session_info_last_seen_never_decreases() {
        let tuple = FiveTuple::new(L4Protocol::Tcp, ip(10, 0, 0, 1), 5000, ip(1, 2, 3, 4), 443);
        let t0 = SystemTime::now();
        let mut session = SessionInfo::new(tuple, "https", t0);
        let t1 = t0 + Duration::from_secs(5);
        session.record_packet(Direction::Outbound, 10, t1);
        // An out-of-order packet with an earlier timestamp must not roll last_seen back.
        session.record_packet(Direction::Outbound, 10, t0);
        assert_eq!(session.last_seen, t1);
    }

    #[test]
    fn test_session_info_timeout() {
        let tuple = FiveTuple::new(L4Protocol::Udp, ip(10, 0, 0, 1), 5000, ip(1, 2, 3, 4), 53);
        let t0 = SystemTime::now();
        let session = SessionInfo::new(tuple, "dns", t0);
        assert!(!session.is_timed_out(Duration::from_secs(60), t0 + Duration::from_secs(30)));
        assert!(session.is_timed_out(Duration::from_secs(60), t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_interceptor_config_default_bypass_includes_private_ranges() {
        let cfg = InterceptorConfig::default();
        assert!(cfg.bypass_cidrs.contains(&"127.0.0.0/8".to_string()));
        assert!(cfg.bypass_cidrs.contains(&"10.0.0.0/8".to_string()));
        assert!(cfg.bypass_cidrs.contains(&"192.168.0.0/16".to_string()));
        assert!(!cfg.allow_diagnostic_passthrough);
    }

    #[test]
    fn test_interceptor_stats_counters_accumulate() {
        let stats = InterceptorStats::new();
        stats.record_processed(100);
        stats.record_processed(50);
        stats.record_dropped();
        stats.record_reinjected();
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.packets_processed, 2);
        assert_eq!(snap.bytes_processed, 150);
        assert_eq!(snap.packets_dropped, 1);
        assert_eq!(snap.packets_reinjected, 1);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn test_connection_info_expiry() {
        let conn = ConnectionInfo {
            protocol: L4Protocol::Tcp,
            local_addr: ip(10, 0, 0, 1),
            local_port: 5000,
            remote_addr: ip(1, 2, 3, 4),
            remote_port: 443,
            state: ConnectionState::Established,
            last_seen: Instant::now() - Duration::from_secs(400),
            pid: Some(42),
        };
        assert!(conn.is_expired(Duration::from_secs(300)));
        assert!(!conn.is_expired(Duration::from_secs(600)));
    }
}
