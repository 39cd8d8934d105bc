//! Linux packet capture using netfilter queue + iptables NAT redirection.
//!
//! Rule installation goes through `iptables` via `std::process::Command`,
//! recorded in an ordered list so `stop()` can undo them in reverse by
//! substituting `-A` for `-D` — the same "undo what you did, in reverse"
//! discipline as the Windows driver lifecycle's repair path. Capture reads
//! queued packets and returns verdicts through the `nfq` crate family.

use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result as AnyResult};
use nfq::{Message, Queue, Verdict};
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

const NFQUEUE_NUM: u16 = 0;

fn run_iptables(args: &[String]) -> AnyResult<()> {
    let str_args: Vec<&str> = args.iter().map(String::as_str).collect();
    let status = Command::new("iptables")
        .args(&str_args)
        .status()
        .with_context(|| format!("failed to spawn iptables {str_args:?}"))?;
    if !status.success() {
        return Err(anyhow!("iptables {str_args:?} exited with {status}"));
    }
    Ok(())
}

/// Builds the ordered list of `iptables -A ...` rule specs this backend
/// installs, excluding the leading `-A`/chain token (added by the caller).
fn add_rule_specs(proxy_port: u16, ports: &[u16]) -> Vec<Vec<String>> {
    let mut rules = Vec::new();
    rules.push(vec![
        "OUTPUT".into(),
        "-o".into(),
        "lo".into(),
        "-j".into(),
        "ACCEPT".into(),
    ]);
    rules.push(vec![
        "OUTPUT".into(),
        "-m".into(),
        "state".into(),
        "--state".into(),
        "ESTABLISHED,RELATED".into(),
        "-j".into(),
        "ACCEPT".into(),
    ]);
    for port in ports {
        rules.push(vec![
            "OUTPUT".into(),
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            port.to_string(),
            "-j".into(),
            "NFQUEUE".into(),
            "--queue-num".into(),
            NFQUEUE_NUM.to_string(),
        ]);
    }
    let _ = proxy_port; // NFQUEUE mode reinjects in place; no redirect port needed.
    rules
}

/// Installs NAT OUTPUT rules, returning the ordered list actually applied so
/// `stop()` can remove exactly those, in reverse.
fn install_rules(proxy_port: u16, ports: &[u16]) -> AnyResult<Vec<Vec<String>>> {
    let specs = add_rule_specs(proxy_port, ports);
    let mut applied = Vec::new();
    for spec in &specs {
        let mut args = vec!["-A".to_string()];
        args.extend(spec.iter().cloned());
        run_iptables(&args)?;
        applied.push(spec.clone());
    }
    Ok(applied)
}

fn teardown_rules(applied: &[Vec<String>]) {
    for spec in applied.iter().rev() {
        let mut args = vec!["-D".to_string()];
        args.extend(spec.iter().cloned());
        if let Err(e) = run_iptables(&args) {
            tracing::warn!("failed to remove iptables rule {spec:?}: {e}");
        }
    }
}

struct Worker {
    handle: Option<std::thread::JoinHandle<()>>,
}

/// Verdict decided by the pipeline for a held `queue_id`, sent across to the
/// capture thread that owns the only live `Queue` handle.
struct VerdictCmd {
    queue_id: u32,
    allow: bool,
}

pub struct NetfilterInterceptor {
    config: Option<InterceptorConfig>,
    filter_override: Option<String>,
    resolver: Arc<dyn ProcessAttributor>,
    limiter: Arc<dyn AdmissionControl>,
    stats: Arc<InterceptorStats>,
    shutdown: Arc<AtomicBool>,
    degraded: Arc<std::sync::Mutex<Option<String>>>,
    workers: Vec<Worker>,
    applied_rules: Vec<Vec<String>>,
    next_packet_id: Arc<AtomicU32>,
    /// Set for the duration of one `start()`/`stop()` cycle so `reinject`/
    /// `drop_packet` (both `&self`) can hand a verdict to the capture thread,
    /// which is the only place allowed to touch the `Queue` handle.
    verdict_tx: Mutex<Option<std_mpsc::Sender<VerdictCmd>>>,
}

impl NetfilterInterceptor {
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
            applied_rules: Vec::new(),
            next_packet_id: Arc::new(AtomicU32::new(1)),
            verdict_tx: Mutex::new(None),
        }
    }

    /// Hands a verdict for a held `queue_id` to the capture thread. The
    /// actual `queue.verdict()` call happens there — `Queue` isn't shared
    /// across threads.
    fn send_verdict(&self, packet: &PacketInfo, allow: bool) -> Result<()> {
        match packet.reinject {
            ReinjectHandle::NetfilterQueueId(queue_id) => {
                let guard = self.verdict_tx.lock().unwrap();
                let tx = guard
                    .as_ref()
                    .ok_or_else(|| EngineError::ReinjectFailed("interceptor is not running".to_string()))?;
                tx.send(VerdictCmd { queue_id, allow })
                    .map_err(|e| EngineError::ReinjectFailed(e.to_string()))
            }
            _ => Err(EngineError::ReinjectFailed(
                "packet carries no nfqueue reinject handle".to_string(),
            )),
        }
    }
}

impl PlatformInterceptor for NetfilterInterceptor {
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

        self.applied_rules = install_rules(config.proxy_port, DEFAULT_APPLICATION_PORTS)
            .map_err(|e| EngineError::FatalInit(e.to_string()))?;

        let mut queue = Queue::open().map_err(|e| {
            teardown_rules(&self.applied_rules);
            self.applied_rules.clear();
            EngineError::FatalInit(format!("failed to open nfqueue: {e}"))
        })?;
        queue
            .bind(NFQUEUE_NUM)
            .map_err(|e| EngineError::FatalInit(format!("failed to bind nfqueue {NFQUEUE_NUM}: {e}")))?;

        self.shutdown.store(false, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(config.channel_size);
        let bypass = parse_bypass_cidrs(&config.bypass_cidrs);
        let (verdict_tx, verdict_rx) = std_mpsc::channel::<VerdictCmd>();
        *self.verdict_tx.lock().unwrap() = Some(verdict_tx);

        let shutdown = Arc::clone(&self.shutdown);
        let degraded = Arc::clone(&self.degraded);
        let stats = Arc::clone(&self.stats);
        let resolver = Arc::clone(&self.resolver);
        let limiter = Arc::clone(&self.limiter);
        let mode = config.mode;
        let auto_reinject = config.auto_reinject;
        let next_id = Arc::clone(&self.next_packet_id);

        let join = std::thread::Builder::new()
            .name("nfqueue-worker".to_string())
            .spawn(move || {
                capture_loop(
                    queue, tx, shutdown, degraded, stats, resolver, limiter, bypass, mode,
                    auto_reinject, next_id, verdict_rx,
                );
            })
            .map_err(|e| EngineError::Io(e.to_string()))?;
        self.workers.push(Worker { handle: Some(join) });

        Ok(rx)
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        *self.verdict_tx.lock().unwrap() = None;
        for worker in &mut self.workers {
            if let Some(h) = worker.handle.take() {
                let _ = h.join();
            }
        }
        self.workers.clear();
        teardown_rules(&self.applied_rules);
        self.applied_rules.clear();
    }

    fn set_filter(&mut self, expr: &str) -> Result<()> {
        if expr.trim().is_empty() {
            return Err(EngineError::InvalidFilter("empty filter expression".to_string()));
        }
        self.filter_override = Some(expr.to_string());
        Ok(())
    }

    fn reinject(&self, packet: &PacketInfo) -> Result<()> {
        self.send_verdict(packet, true)
    }

    fn drop_packet(&self, packet: &PacketInfo) -> Result<()> {
        self.send_verdict(packet, false)
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

impl Drop for NetfilterInterceptor {
    fn drop(&mut self) {
        teardown_rules(&self.applied_rules);
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_loop(
    mut queue: Queue,
    tx: mpsc::Sender<PacketInfo>,
    shutdown: Arc<AtomicBool>,
    degraded: Arc<std::sync::Mutex<Option<String>>>,
    stats: Arc<InterceptorStats>,
    resolver: Arc<dyn ProcessAttributor>,
    limiter: Arc<dyn AdmissionControl>,
    bypass: Vec<ipnet::Ipv4Net>,
    mode: InterceptMode,
    auto_reinject: bool,
    next_id: Arc<AtomicU32>,
    verdict_rx: std_mpsc::Receiver<VerdictCmd>,
) {
    let mut consecutive_errors: u32 = 0;
    let mut batch: Vec<PacketInfo> = Vec::with_capacity(CAPTURE_BATCH_SIZE);
    let mut last_flush = Instant::now();
    // Intercept-mode packets held past their capture iteration, awaiting a
    // verdict the pipeline sends over `verdict_rx`. Only this thread ever
    // touches `queue`, so the message sits here rather than in `batch`.
    let mut pending: HashMap<u32, Message> = HashMap::new();

    while !shutdown.load(Ordering::Relaxed) {
        apply_pending_verdicts(&mut queue, &mut pending, &verdict_rx, &stats);

        match queue.recv() {
            Ok(mut msg) => {
                consecutive_errors = 0;
                let data = msg.get_payload().to_vec();

                let Some(hdr) = parse_ip_packet(&data) else {
                    msg.set_verdict(Verdict::Accept);
                    let _ = queue.verdict(msg);
                    continue;
                };

                if is_bypassed(hdr.dst_ip, &bypass) || is_bypassed(hdr.src_ip, &bypass) {
                    msg.set_verdict(Verdict::Accept);
                    let _ = queue.verdict(msg);
                    continue;
                }

                let payload = data[hdr.payload_start..].to_vec();
                let id = next_id.fetch_add(1, Ordering::Relaxed) as u64;
                let queue_id = msg.get_id();
                let mut pkt = PacketInfo::new(
                    id,
                    Direction::Outbound,
                    hdr.protocol,
                    hdr.src_ip,
                    hdr.src_port,
                    hdr.dst_ip,
                    hdr.dst_port,
                    payload,
                    ReinjectHandle::NetfilterQueueId(queue_id),
                );

                if !limiter.admit(pkt.size) {
                    stats.record_dropped();
                    msg.set_verdict(if auto_reinject { Verdict::Accept } else { Verdict::Drop });
                    if queue.verdict(msg).is_ok() && auto_reinject {
                        stats.record_reinjected();
                    }
                    continue;
                }

                pkt.process = resolver.resolve(pkt.five_tuple(), pkt.direction).map(Arc::new);
                stats.record_processed(pkt.size as u64);

                // Monitor mode accepts immediately; intercept modes hold the
                // message here until the pipeline's policy decision arrives
                // over `verdict_rx`, at which point `apply_pending_verdicts`
                // issues the real Accept/Drop.
                if matches!(mode, InterceptMode::Monitor) {
                    msg.set_verdict(if auto_reinject { Verdict::Accept } else { Verdict::Drop });
                    if queue.verdict(msg).is_ok() && auto_reinject {
                        stats.record_reinjected();
                    }
                } else {
                    pending.insert(queue_id, msg);
                }

                batch.push(pkt);

                if batch.len() >= CAPTURE_BATCH_SIZE
                    || last_flush.elapsed() >= Duration::from_millis(CAPTURE_BATCH_MAX_WAIT_MS)
                {
                    flush_batch(&tx, &mut batch, &stats);
                    last_flush = Instant::now();
                }
            }
            Err(e) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                consecutive_errors += 1;
                stats.record_error();
                tracing::warn!("nfqueue recv error ({consecutive_errors}/{CAPTURE_MAX_ERRORS}): {e}");
                std::thread::sleep(capture_backoff(consecutive_errors));
                if consecutive_errors >= CAPTURE_MAX_ERRORS {
                    *degraded.lock().unwrap() = Some(format!("nfqueue unhealthy: {e}"));
                    break;
                }
            }
        }
    }

    // Shutting down with packets still held would leak them in the kernel;
    // drop them rather than wait for a verdict that will never arrive.
    for (_, msg) in pending.drain() {
        let mut msg = msg;
        msg.set_verdict(Verdict::Drop);
        let _ = queue.verdict(msg);
    }
    flush_batch(&tx, &mut batch, &stats);
}

/// Drains whatever verdicts the pipeline has decided since the last poll and
/// issues the real `queue.verdict()` call for each matching held message.
/// A verdict for a `queue_id` this thread never held (already flushed,
/// already timed out) is silently ignored.
fn apply_pending_verdicts(
    queue: &mut Queue,
    pending: &mut HashMap<u32, Message>,
    verdict_rx: &std_mpsc::Receiver<VerdictCmd>,
    stats: &InterceptorStats,
) {
    while let Ok(cmd) = verdict_rx.try_recv() {
        if let Some(mut msg) = pending.remove(&cmd.queue_id) {
            msg.set_verdict(if cmd.allow { Verdict::Accept } else { Verdict::Drop });
            if queue.verdict(msg).is_ok() && cmd.allow {
                stats.record_reinjected();
            }
        }
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
    fn test_add_rule_specs_includes_loopback_accept_first() {
        let specs = add_rule_specs(8080, &[80, 443]);
        assert_eq!(specs[0], vec!["OUTPUT", "-o", "lo", "-j", "ACCEPT"]);
    }

    #[test]
    fn test_add_rule_specs_one_nfqueue_rule_per_port() {
        let specs = add_rule_specs(8080, &[80, 443, 21]);
        let nfqueue_rules = specs.iter().filter(|s| s.contains(&"NFQUEUE".to_string())).count();
        assert_eq!(nfqueue_rules, 3);
    }
}
