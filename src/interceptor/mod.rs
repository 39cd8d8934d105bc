//! Platform-specific packet capture backends.
//!
//! Each platform implements capture + re-injection behind [`PlatformInterceptor`]:
//! - Windows: WinDivert 2.x (`windivert_backend`)
//! - Linux: netfilter queue + iptables NAT (`netfilter_backend`)
//! - macOS: pf + divert socket (`pf_backend`)
//!
//! Only one backend is compiled in per target; there is no runtime dispatch
//! across backends in a single binary.

pub mod filter;

#[cfg(target_os = "windows")]
pub mod windivert_backend;

#[cfg(target_os = "linux")]
pub mod netfilter_backend;

#[cfg(target_os = "macos")]
pub mod pf_backend;

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{CAPTURE_BACKOFF_MAX_MS, CAPTURE_BACKOFF_START_US};
use crate::error::Result;
use crate::model::{Direction, FiveTuple, InterceptorConfig, InterceptorStats, L4Protocol, PacketInfo, ProcessInfo};

/// Narrow seam a capture worker uses to attribute a flow to a process,
/// implemented by [`crate::resolver::ProcessResolver`]. Kept as a trait here
/// rather than a direct dependency so `interceptor` never needs to import
/// `resolver`. `direction` disambiguates which end of the tuple is local.
pub trait ProcessAttributor: Send + Sync {
    fn resolve(&self, tuple: FiveTuple, direction: Direction) -> Option<ProcessInfo>;
}

/// Narrow seam a capture worker uses for packet/byte admission, implemented
/// by [`crate::pipeline::rate_limiter::AdaptiveLimiter`].
pub trait AdmissionControl: Send + Sync {
    fn admit(&self, size: usize) -> bool;
}

/// Narrow seam the pipeline consumer uses to hand a policy verdict back to
/// whichever capture backend is running, without the pipeline needing a
/// `&mut dyn PlatformInterceptor` of its own. `reinject` releases a held
/// packet back onto the wire; `drop_packet` releases the backend's held
/// state for a packet without ever letting it back onto the wire.
pub trait VerdictSink: Send + Sync {
    fn reinject(&self, packet: &PacketInfo) -> Result<()>;
    fn drop_packet(&self, packet: &PacketInfo) -> Result<()>;
}

/// Shares one running backend between the owner (who calls `start`/`stop`/
/// `set_filter` through `&mut self`) and the pipeline consumer (who only
/// ever needs the `&self` `reinject` path). The mutex is only ever held for
/// the duration of a single call, never across a channel read or a parse.
pub struct InterceptorHandle {
    inner: std::sync::Mutex<Box<dyn PlatformInterceptor>>,
}

impl InterceptorHandle {
    pub fn new(interceptor: Box<dyn PlatformInterceptor>) -> Self {
        Self { inner: std::sync::Mutex::new(interceptor) }
    }

    pub fn initialize(&self, config: InterceptorConfig) -> Result<()> {
        self.inner.lock().unwrap().initialize(config)
    }

    pub fn start(&self) -> Result<PacketReceiver> {
        self.inner.lock().unwrap().start()
    }

    pub fn stop(&self) {
        self.inner.lock().unwrap().stop();
    }

    pub fn set_filter(&self, expr: &str) -> Result<()> {
        self.inner.lock().unwrap().set_filter(expr)
    }

    pub fn health_check(&self) -> HealthStatus {
        self.inner.lock().unwrap().health_check()
    }

    pub fn stats(&self) -> std::sync::Arc<InterceptorStats> {
        self.inner.lock().unwrap().stats()
    }
}

impl VerdictSink for InterceptorHandle {
    fn reinject(&self, packet: &PacketInfo) -> Result<()> {
        self.inner.lock().unwrap().reinject(packet)
    }

    fn drop_packet(&self, packet: &PacketInfo) -> Result<()> {
        self.inner.lock().unwrap().drop_packet(packet)
    }
}

/// Liveness result for [`PlatformInterceptor::health_check`]. Unlike the
/// `EngineError` taxonomy, a degraded interceptor is not necessarily fatal —
/// the embedder decides whether to restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Degraded(String),
}

/// Run state tracked internally by each backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
}

/// The receiving half of the capture-to-pipeline channel, handed to the
/// pipeline exactly once per `start()`.
pub type PacketReceiver = mpsc::Receiver<PacketInfo>;

/// Behavior every platform capture backend must provide.
///
/// `initialize` and `start` are split so a caller can validate privileges and
/// allocate resources before committing to spawning worker threads.
pub trait PlatformInterceptor: Send {
    fn initialize(&mut self, config: InterceptorConfig) -> Result<()>;

    /// Installs the platform filter, spawns `worker_count` capture threads
    /// plus one reinjection task, and returns the consumer end of the packet
    /// channel. Rejects if already running.
    fn start(&mut self) -> Result<PacketReceiver>;

    /// Signals shutdown, removes platform rules in reverse order, and waits
    /// for workers to drain. Idempotent.
    fn stop(&mut self);

    /// Validates and stores a new filter expression; takes effect on next `start`.
    fn set_filter(&mut self, expr: &str) -> Result<()>;

    /// Re-sends a captured packet using its platform-specific reinject handle.
    /// Only valid for a packet captured under `InterceptAndAllow`/
    /// `InterceptAndBlock`, where the capture worker held it pending this call.
    fn reinject(&self, packet: &PacketInfo) -> Result<()>;

    /// Releases whatever state the backend is holding for a packet without
    /// ever letting it reach the network — the policy verdict was `Block`.
    fn drop_packet(&self, packet: &PacketInfo) -> Result<()>;

    fn health_check(&self) -> HealthStatus;

    fn stats(&self) -> std::sync::Arc<InterceptorStats>;
}

/// IPv4 header fields needed to build a [`PacketInfo`], plus the byte offset
/// where the L4 payload begins. IPv6 is out of scope (spec Non-goals).
#[derive(Debug, Clone, Copy)]
pub struct IpHeader {
    pub protocol: L4Protocol,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_start: usize,
}

/// Parses an IPv4 datagram far enough to recover the 5-tuple and the offset
/// of the TCP/UDP payload. Returns `None` for anything that isn't a
/// well-formed IPv4 TCP or UDP packet — malformed or short packets are
/// silently ignored by capture workers rather than treated as errors.
pub fn parse_ip_packet(data: &[u8]) -> Option<IpHeader> {
    if data.len() < 20 {
        return None;
    }
    let version = data[0] >> 4;
    if version != 4 {
        return None;
    }
    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < 20 || data.len() < ihl {
        return None;
    }
    let protocol = match data[9] {
        6 => L4Protocol::Tcp,
        17 => L4Protocol::Udp,
        _ => return None,
    };

    let src_ip = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst_ip = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    let transport = &data[ihl..];
    if transport.len() < 4 {
        return None;
    }
    let src_port = u16::from_be_bytes([transport[0], transport[1]]);
    let dst_port = u16::from_be_bytes([transport[2], transport[3]]);

    let payload_start = match protocol {
        L4Protocol::Tcp => {
            if transport.len() < 20 {
                return None;
            }
            let data_offset = ((transport[12] >> 4) as usize) * 4;
            if data_offset < 20 {
                return None;
            }
            ihl + data_offset
        }
        L4Protocol::Udp => {
            if transport.len() < 8 {
                return None;
            }
            ihl + 8
        }
    };

    Some(IpHeader {
        protocol,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        payload_start,
    })
}

/// Linear capture-error backoff: 100 µs, 200 µs, ... capped at 1 s, as the
/// interceptor spec requires. Resets to zero on the caller's next success.
pub fn capture_backoff(consecutive_errors: u32) -> Duration {
    let us = (CAPTURE_BACKOFF_START_US).saturating_mul(consecutive_errors.max(1) as u64);
    let capped_ms = CAPTURE_BACKOFF_MAX_MS;
    Duration::from_micros(us).min(Duration::from_millis(capped_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ipv4_packet(protocol: u8, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let header_and_l4 = match protocol {
            6 => 20usize,
            17 => 8usize,
            _ => 4,
        };
        let total_len = 20 + header_and_l4 + payload.len();
        let mut pkt = vec![0u8; total_len];
        pkt[0] = 0x45; // version 4, IHL 5
        pkt[2] = (total_len >> 8) as u8;
        pkt[3] = (total_len & 0xFF) as u8;
        pkt[9] = protocol;
        pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
        pkt[16..20].copy_from_slice(&[93, 184, 216, 34]);
        pkt[20] = (src_port >> 8) as u8;
        pkt[21] = (src_port & 0xFF) as u8;
        pkt[22] = (dst_port >> 8) as u8;
        pkt[23] = (dst_port & 0xFF) as u8;
        if protocol == 6 {
            pkt[20 + 12] = 5 << 4; // data offset = 5 words = 20 bytes
        }
        pkt[20 + header_and_l4..].copy_from_slice(payload);
        pkt
    }

    #[test]
    fn test_parse_empty_packet() {
        assert!(parse_ip_packet(&[]).is_none());
    }

    #[test]
    fn test_parse_too_short_ipv4() {
        let short = vec![0x45; 19];
        assert!(parse_ip_packet(&short).is_none());
    }

    #[test]
    fn test_parse_rejects_ipv6() {
        let mut pkt = vec![0u8; 44];
        pkt[0] = 0x60;
        assert!(parse_ip_packet(&pkt).is_none());
    }

    #[test]
    fn test_parse_valid_tcp_finds_payload_after_options_free_header() {
        let pkt = build_ipv4_packet(6, 12345, 443, b"GET / HTTP/1.1\r\n\r\n");
        let hdr = parse_ip_packet(&pkt).unwrap();
        assert_eq!(hdr.protocol, L4Protocol::Tcp);
        assert_eq!(hdr.src_port, 12345);
        assert_eq!(hdr.dst_port, 443);
        assert_eq!(&pkt[hdr.payload_start..], b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_parse_valid_udp_finds_payload() {
        let pkt = build_ipv4_packet(17, 5353, 53, b"\x00\x00");
        let hdr = parse_ip_packet(&pkt).unwrap();
        assert_eq!(hdr.protocol, L4Protocol::Udp);
        assert_eq!(&pkt[hdr.payload_start..], b"\x00\x00");
    }

    #[test]
    fn test_parse_unknown_protocol() {
        let pkt = build_ipv4_packet(1, 0, 0, b"");
        assert!(parse_ip_packet(&pkt).is_none());
    }

    #[test]
    fn test_parse_truncated_transport() {
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45;
        pkt[2] = 0;
        pkt[3] = 20;
        pkt[9] = 6;
        assert!(parse_ip_packet(&pkt).is_none());
    }

    #[test]
    fn test_capture_backoff_grows_linearly_and_caps() {
        assert_eq!(capture_backoff(1), Duration::from_micros(100));
        assert_eq!(capture_backoff(2), Duration::from_micros(200));
        assert_eq!(capture_backoff(1000), Duration::from_millis(1000));
    }
}
