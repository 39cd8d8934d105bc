//! macOS packet capture using pf (Packet Filter) + a divert socket.
//!
//! Rule management goes through `pfctl` via `std::process::Command`, same
//! approach the teacher uses for its dummynet pipe configuration. Packet
//! capture itself reads from a `PF_INET`/`SOCK_RAW`/`IPPROTO_DIVERT` socket,
//! which macOS's pf redirects matching traffic into.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result as AnyResult};
use tokio::sync::mpsc;

use crate::config::{
    CAPTURE_BATCH_MAX_WAIT_MS, CAPTURE_BATCH_SIZE, CAPTURE_MAX_ERRORS, DEFAULT_APPLICATION_PORTS,
};
use crate::error::{EngineError, Result};
use crate::interceptor::filter::{is_bypassed, parse_bypass_cidrs};
use crate::interceptor::{
    capture_backoff, parse_ip_packet, AdmissionControl, HealthStatus, PacketReceiver,
    PlatformInterceptor, ProcessAttributor,
};
use crate::model::{
    Direction, InterceptMode, InterceptorConfig, InterceptorStats, PacketInfo, ReinjectHandle,
};

const IPPROTO_DIVERT: i32 = 254;
const PF_ANCHOR: &str = "dlp.core";

fn run_pfctl(args: &[&str]) -> AnyResult<()> {
    let status = Command::new("pfctl")
        .args(args)
        .status()
        .with_context(|| format!("failed to spawn pfctl {args:?}"))?;
    if !status.success() {
        return Err(anyhow!("pfctl {args:?} exited with {status}"));
    }
    Ok(())
}

fn rules_text(proxy_port: u16, ports: &[u16]) -> String {
    let port_list = ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ");
    format!(
        "anchor \"{PF_ANCHOR}\" {{\n  rdr pass on lo0 inet proto tcp from any to any port {{ {port_list} }} -> 127.0.0.1 port {proxy_port}\n}}\n"
    )
}

/// Installs the pf redirect rules into a named anchor and enables pf.
fn install_rules(proxy_port: u16, ports: &[u16]) -> AnyResult<()> {
    let rules = rules_text(proxy_port, ports);
    let mut child = Command::new("pfctl")
        .args(["-a", PF_ANCHOR, "-f", "-"])
        .stdin(std::process::Stdio::piped())
        .spawn()
        .context("failed to spawn pfctl -f -")?;
    child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("pfctl stdin unavailable"))?
        .write_all(rules.as_bytes())?;
    let status = child.wait()?;
    if !status.success() {
        return Err(anyhow!("pfctl rule load exited with {status}"));
    }
    run_pfctl(&["-e"]).or_else(|e| {
        // Already enabled returns a non-zero exit on some macOS versions; treat as success.
        tracing::warn!("pfctl -e returned an error (may already be enabled): {e}");
        Ok(())
    })
}

/// Removes this anchor's rules and disables pf, mirroring the lifecycle
/// described for Linux's reverse-order rule teardown.
fn teardown_rules() {
    if let Err(e) = run_pfctl(&["-a", PF_ANCHOR, "-F", "all"]) {
        tracing::warn!("failed to flush pf anchor {PF_ANCHOR}: {e}");
    }
    if let Err(e) = run_pfctl(&["-d"]) {
        tracing::warn!("failed to disable pf: {e}");
    }
}

fn open_divert_socket() -> AnyResult<RawFd> {
    // SAFETY: a raw INET/RAW/DIVERT socket has no high-level nix binding for
    // the DIVERT protocol number; this mirrors the one-off raw syscall style
    // the teacher uses for its Windows service-control FFI.
    let fd = unsafe { nix::libc::socket(nix::libc::AF_INET, nix::libc::SOCK_RAW, IPPROTO_DIVERT) };
    if fd < 0 {
        return Err(anyhow!(
            "failed to open divert socket: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(fd)
}

struct Worker {
    handle: Option<std::thread::JoinHandle<()>>,
}

pub struct PfInterceptor {
    config: Option<InterceptorConfig>,
    filter_override: Option<String>,
    resolver: Arc<dyn ProcessAttributor>,
    limiter: Arc<dyn AdmissionControl>,
    stats: Arc<InterceptorStats>,
    shutdown: Arc<AtomicBool>,
    degraded: Arc<std::sync::Mutex<Option<String>>>,
    workers: Vec<Worker>,
    rules_installed: bool,
    next_packet_id: Arc<AtomicU32>,
    /// The live divert socket fd, set for the duration of one `start()`/
    /// `stop()` cycle. A raw fd can be `send`/`recv`-ed from any thread that
    /// holds it, so `reinject`/`drop_packet` (both `&self`) need no
    /// back-channel the way the nfqueue backend does.
    fd: Arc<AtomicI32>,
    /// `InterceptAndAllow`/`InterceptAndBlock` datagrams awaiting a verdict,
    /// keyed by `PacketInfo::id`. Monitor-mode packets never enter this map.
    pending: Arc<Mutex<HashMap<u64, Vec<u8>>>>,
}

impl PfInterceptor {
    pub fn new(resolver: Arc<dyn ProcessAttributor>, limiter: Arc<dyn AdmissionControl>) -> Self {
        Self {
            config: None,
            filter_override: None,
            resolver,
            limiter,
            stats: Arc::new(InterceptorStats::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            degraded: Arc::new(std::sync::Mutex::new(None)),
            workers: Vec::new(),
            rules_installed: false,
            next_packet_id: Arc::new(AtomicU32::new(1)),
            fd: Arc::new(AtomicI32::new(-1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl PlatformInterceptor for PfInterceptor {
    fn initialize(&mut self, config: InterceptorConfig) -> Result<()> {
        self.config = Some(config);
        Ok(())
    }

    fn start(&mut self) -> Result<PacketReceiver> {
        if !self.workers.is_empty() {
            return Err(EngineError::AlreadyRunning);
        }
        let config = self
            .config
            .clone()
            .ok_or_else(|| EngineError::FatalInit("initialize() was never called".to_string()))?;

        install_rules(config.proxy_port, DEFAULT_APPLICATION_PORTS)
            .map_err(|e| EngineError::FatalInit(e.to_string()))?;
        self.rules_installed = true;

        let fd = open_divert_socket().map_err(|e| EngineError::FatalInit(e.to_string()))?;
        self.fd.store(fd, Ordering::Release);

        self.shutdown.store(false, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(config.channel_size);
        let bypass = parse_bypass_cidrs(&config.bypass_cidrs);

        let shutdown = Arc::clone(&self.shutdown);
        let degraded = Arc::clone(&self.degraded);
        let stats = Arc::clone(&self.stats);
        let resolver = Arc::clone(&self.resolver);
        let limiter = Arc::clone(&self.limiter);
        let mode = config.mode;
        let auto_reinject = config.auto_reinject;
        let buffer_size = config.buffer_size;
        let next_id = Arc::clone(&self.next_packet_id);
        let pending = Arc::clone(&self.pending);

        let join = std::thread::Builder::new()
            .name("pf-divert-worker".to_string())
            .spawn(move || {
                capture_loop(
                    fd, tx, shutdown, degraded, stats, resolver, limiter, bypass, mode,
                    auto_reinject, buffer_size, next_id, pending,
                );
            })
            .map_err(|e| EngineError::Io(e.to_string()))?;
        self.workers.push(Worker { handle: Some(join) });

        Ok(rx)
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for worker in &mut self.workers {
            if let Some(h) = worker.handle.take() {
                let _ = h.join();
            }
        }
        self.workers.clear();
        self.fd.store(-1, Ordering::Release);
        self.pending.lock().unwrap().clear();
        if self.rules_installed {
            teardown_rules();
            self.rules_installed = false;
        }
    }

    fn set_filter(&mut self, expr: &str) -> Result<()> {
        if expr.trim().is_empty() {
            return Err(EngineError::InvalidFilter("empty filter expression".to_string()));
        }
        self.filter_override = Some(expr.to_string());
        Ok(())
    }

    fn reinject(&self, packet: &PacketInfo) -> Result<()> {
        match packet.reinject {
            ReinjectHandle::PfDivertSocket => {
                let data = self.pending.lock().unwrap().remove(&packet.id).ok_or_else(|| {
                    EngineError::ReinjectFailed(format!("no pending capture for packet {}", packet.id))
                })?;
                let fd = self.fd.load(Ordering::Acquire);
                if fd < 0 {
                    return Err(EngineError::ReinjectFailed("interceptor is not running".to_string()));
                }
                let sent = unsafe { nix::libc::send(fd, data.as_ptr() as *const nix::libc::c_void, data.len(), 0) };
                if sent < 0 {
                    return Err(EngineError::ReinjectFailed(std::io::Error::last_os_error().to_string()));
                }
                self.stats.record_reinjected();
                Ok(())
            }
            _ => Err(EngineError::ReinjectFailed(
                "packet carries no pf divert reinject handle".to_string(),
            )),
        }
    }

    fn drop_packet(&self, packet: &PacketInfo) -> Result<()> {
        // The divert socket never releases a held datagram on its own;
        // simply forgetting it without resending is the drop.
        self.pending.lock().unwrap().remove(&packet.id);
        Ok(())
    }

    fn health_check(&self) -> HealthStatus {
        match self.degraded.lock().unwrap().clone() {
            Some(reason) => HealthStatus::Degraded(reason),
            None => HealthStatus::Ok,
        }
    }

    fn stats(&self) -> Arc<InterceptorStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for PfInterceptor {
    fn drop(&mut self) {
        if self.rules_installed {
            teardown_rules();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_loop(
    fd: RawFd,
    tx: mpsc::Sender<PacketInfo>,
    shutdown: Arc<AtomicBool>,
    degraded: Arc<std::sync::Mutex<Option<String>>>,
    stats: Arc<InterceptorStats>,
    resolver: Arc<dyn ProcessAttributor>,
    limiter: Arc<dyn AdmissionControl>,
    bypass: Vec<ipnet::Ipv4Net>,
    mode: InterceptMode,
    auto_reinject: bool,
    buffer_size: usize,
    next_id: Arc<AtomicU32>,
    pending: Arc<Mutex<HashMap<u64, Vec<u8>>>>,
) {
    let mut buf = vec![0u8; buffer_size];
    let mut consecutive_errors: u32 = 0;
    let mut batch: Vec<PacketInfo> = Vec::with_capacity(CAPTURE_BATCH_SIZE);
    let mut last_flush = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        let n = unsafe {
            nix::libc::recv(fd, buf.as_mut_ptr() as *mut nix::libc::c_void, buf.len(), 0)
        };

        if n < 0 {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            consecutive_errors += 1;
            stats.record_error();
            tracing::warn!(
                "pf divert recv error ({consecutive_errors}/{CAPTURE_MAX_ERRORS}): {}",
                std::io::Error::last_os_error()
            );
            std::thread::sleep(capture_backoff(consecutive_errors));
            if consecutive_errors >= CAPTURE_MAX_ERRORS {
                *degraded.lock().unwrap() = Some("pf divert socket unhealthy".to_string());
                break;
            }
            continue;
        }
        consecutive_errors = 0;

        let data = &buf[..n as usize];
        let Some(hdr) = parse_ip_packet(data) else {
            continue;
        };
        if is_bypassed(hdr.dst_ip, &bypass) || is_bypassed(hdr.src_ip, &bypass) {
            continue;
        }

        // Outbound traffic is redirected through the proxy port by pf; any
        // packet reaching this socket was leaving the host.
        let payload = data[hdr.payload_start..].to_vec();
        let id = next_id.fetch_add(1, Ordering::Relaxed) as u64;
        let mut pkt = PacketInfo::new(
            id,
            Direction::Outbound,
            hdr.protocol,
            hdr.src_ip,
            hdr.src_port,
            hdr.dst_ip,
            hdr.dst_port,
            payload,
            ReinjectHandle::PfDivertSocket,
        );

        if !limiter.admit(pkt.size) {
            stats.record_dropped();
            continue;
        }

        pkt.process = resolver.resolve(pkt.five_tuple(), pkt.direction).map(Arc::new);
        stats.record_processed(pkt.size as u64);

        if matches!(mode, InterceptMode::Monitor) {
            if auto_reinject {
                let sent = unsafe { nix::libc::send(fd, data.as_ptr() as *const nix::libc::c_void, data.len(), 0) };
                if sent < 0 {
                    tracing::warn!("pf reinject failed: {}", std::io::Error::last_os_error());
                } else {
                    stats.record_reinjected();
                }
            }
        } else {
            // Held for the pipeline's verdict: `reinject()`/`drop_packet()`
            // pull this back out by id and either resend it through `fd` or
            // let it rot unsent.
            pending.lock().unwrap().insert(pkt.id, data.to_vec());
        }
        batch.push(pkt);

        if batch.len() >= CAPTURE_BATCH_SIZE
            || last_flush.elapsed() >= Duration::from_millis(CAPTURE_BATCH_MAX_WAIT_MS)
        {
            flush_batch(&tx, &mut batch, &stats);
            last_flush = Instant::now();
        }
    }

    flush_batch(&tx, &mut batch, &stats);
    unsafe {
        nix::libc::close(fd);
    }
}

fn flush_batch(tx: &mpsc::Sender<PacketInfo>, batch: &mut Vec<PacketInfo>, stats: &InterceptorStats) {
    for pkt in batch.drain(..) {
        if tx.try_send(pkt).is_err() {
            stats.record_dropped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_text_includes_proxy_port_and_ports() {
        let text = rules_text(8080, &[80, 443]);
        assert!(text.contains("127.0.0.1 port 8080"));
        assert!(text.contains("80, 443"));
        assert!(text.contains(PF_ANCHOR));
    }
}
