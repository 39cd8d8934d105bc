//! Windows packet capture and re-injection using WinDivert 2.x.
//!
//! Two responsibilities live here: the kernel driver service lifecycle
//! (install/start/verify/repair, all requiring administrator rights) and the
//! capture worker pool that reads frames, attributes them to a process, rate
//! limits, and dispatches per [`InterceptMode`].

use std::borrow::Cow;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result as AnyResult};
use tokio::sync::mpsc;
use windivert::prelude::*;

use crate::config::{
    CAPTURE_BATCH_MAX_WAIT_MS, CAPTURE_BATCH_SIZE, CAPTURE_MAX_ERRORS, DEFAULT_APPLICATION_PORTS,
    WINDIVERT_REPAIR_PAUSE_SECS, WINDIVERT_RETRIES_PER_FILTER, WINDIVERT_RETRY_BASE_SECS,
};
use crate::error::{EngineError, Result};
use crate::interceptor::filter::{build_ladder, is_bypassed, parse_bypass_cidrs};
use crate::interceptor::{
    capture_backoff, parse_ip_packet, AdmissionControl, HealthStatus, PacketReceiver,
    PlatformInterceptor, ProcessAttributor,
};
use crate::model::{
    Direction, InterceptMode, InterceptorConfig, InterceptorStats, PacketInfo, ReinjectHandle,
};

const SERVICE_NAME: &str = "WinDivert";
const DRIVER_FILE: &str = "WinDivert64.sys";

/// Windows service-control FFI, in the same style as `win_net_table`'s
/// `iphlpapi` bindings: `#[repr(C)]` structs, bounds-checked, never trusting
/// a raw pointer beyond what the API contract guarantees.
mod scm {
    use std::os::raw::c_void;

    pub type ScHandle = *mut c_void;

    pub const SC_MANAGER_ALL_ACCESS: u32 = 0xF003F;
    pub const SERVICE_ALL_ACCESS: u32 = 0xF01FF;
    pub const SERVICE_KERNEL_DRIVER: u32 = 0x00000001;
    pub const SERVICE_DEMAND_START: u32 = 0x00000003;
    pub const SERVICE_ERROR_NORMAL: u32 = 0x00000001;
    pub const SERVICE_RUNNING: u32 = 0x00000004;
    pub const SERVICE_STOPPED: u32 = 0x00000001;
    pub const SERVICE_CONTROL_STOP: u32 = 0x00000001;

    #[repr(C)]
    pub struct ServiceStatus {
        pub service_type: u32,
        pub current_state: u32,
        pub controls_accepted: u32,
        pub win32_exit_code: u32,
        pub service_specific_exit_code: u32,
        pub check_point: u32,
        pub wait_hint: u32,
    }

    #[link(name = "advapi32")]
    extern "system" {
        pub fn OpenSCManagerW(machine: *const u16, database: *const u16, access: u32) -> ScHandle;
        pub fn CreateServiceW(
            sc_manager: ScHandle,
            service_name: *const u16,
            display_name: *const u16,
            access: u32,
            service_type: u32,
            start_type: u32,
            error_control: u32,
            binary_path: *const u16,
            load_order_group: *const u16,
            tag_id: *mut u32,
            dependencies: *const u16,
            service_start_name: *const u16,
            password: *const u16,
        ) -> ScHandle;
        pub fn OpenServiceW(sc_manager: ScHandle, service_name: *const u16, access: u32) -> ScHandle;
        pub fn StartServiceW(service: ScHandle, num_args: u32, args: *const *const u16) -> i32;
        pub fn ControlService(service: ScHandle, control: u32, status: *mut ServiceStatus) -> i32;
        pub fn QueryServiceStatus(service: ScHandle, status: *mut ServiceStatus) -> i32;
        pub fn DeleteService(service: ScHandle) -> i32;
        pub fn CloseServiceHandle(handle: ScHandle) -> i32;
    }
}

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

/// Ensures the WinDivert kernel service is installed and running, per spec
/// §4.1's driver-lifecycle description. Every step requires administrator
/// privilege; failure here is always `FatalInit`.
fn ensure_driver_running(binary_path: &str) -> AnyResult<()> {
    unsafe {
        let manager = scm::OpenSCManagerW(std::ptr::null(), std::ptr::null(), scm::SC_MANAGER_ALL_ACCESS);
        if manager.is_null() {
            return Err(anyhow!("OpenSCManagerW failed — administrator privilege required"));
        }

        let name = wide(SERVICE_NAME);
        let mut service = scm::OpenServiceW(manager, name.as_ptr(), scm::SERVICE_ALL_ACCESS);
        if service.is_null() {
            let display = wide(SERVICE_NAME);
            let path = wide(binary_path);
            service = scm::CreateServiceW(
                manager,
                name.as_ptr(),
                display.as_ptr(),
                scm::SERVICE_ALL_ACCESS,
                scm::SERVICE_KERNEL_DRIVER,
                scm::SERVICE_DEMAND_START,
                scm::SERVICE_ERROR_NORMAL,
                path.as_ptr(),
                std::ptr::null(),
                std::ptr::null_mut(),
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
            );
            if service.is_null() {
                scm::CloseServiceHandle(manager);
                return Err(anyhow!("CreateServiceW failed for {SERVICE_NAME}"));
            }
        }

        let started = scm::StartServiceW(service, 0, std::ptr::null());
        // ERROR_SERVICE_ALREADY_RUNNING is fine; we verify state below regardless.
        let _ = started;

        let mut status = std::mem::zeroed::<scm::ServiceStatus>();
        if scm::QueryServiceStatus(service, &mut status) == 0 {
            scm::CloseServiceHandle(service);
            scm::CloseServiceHandle(manager);
            return Err(anyhow!("QueryServiceStatus failed for {SERVICE_NAME}"));
        }

        scm::CloseServiceHandle(service);
        scm::CloseServiceHandle(manager);

        if status.current_state != scm::SERVICE_RUNNING {
            return Err(anyhow!(
                "{SERVICE_NAME} did not reach SERVICE_RUNNING (state={})",
                status.current_state
            ));
        }
    }
    Ok(())
}

/// Stops and deletes the service, waits, then reinstalls — the repair path
/// triggered after `CAPTURE_MAX_ERRORS` consecutive failures.
fn repair_driver(binary_path: &str) -> AnyResult<()> {
    unsafe {
        let manager = scm::OpenSCManagerW(std::ptr::null(), std::ptr::null(), scm::SC_MANAGER_ALL_ACCESS);
        if !manager.is_null() {
            let name = wide(SERVICE_NAME);
            let service = scm::OpenServiceW(manager, name.as_ptr(), scm::SERVICE_ALL_ACCESS);
            if !service.is_null() {
                let mut status = std::mem::zeroed::<scm::ServiceStatus>();
                scm::ControlService(service, scm::SERVICE_CONTROL_STOP, &mut status);
                scm::DeleteService(service);
                scm::CloseServiceHandle(service);
            }
            scm::CloseServiceHandle(manager);
        }
    }
    std::thread::sleep(Duration::from_secs(WINDIVERT_REPAIR_PAUSE_SECS));
    ensure_driver_running(binary_path)
}

struct Worker {
    handle: Option<std::thread::JoinHandle<()>>,
}

/// A captured frame held past its capture iteration, awaiting a verdict from
/// the pipeline — the data is copied out since the capture buffer it was
/// originally read into is reused on the very next `recv`.
struct PendingPacket {
    data: Vec<u8>,
    address: WinDivertAddress<NetworkLayer>,
}

pub struct WindowsInterceptor {
    config: Option<InterceptorConfig>,
    filter_override: Option<String>,
    resolver: Arc<dyn ProcessAttributor>,
    limiter: Arc<dyn AdmissionControl>,
    stats: Arc<InterceptorStats>,
    shutdown: Arc<AtomicBool>,
    degraded: Arc<std::sync::Mutex<Option<String>>>,
    workers: Vec<Worker>,
    next_packet_id: Arc<AtomicU32>,
    /// The live handle, set for the duration of one `start()`/`stop()` cycle
    /// so `reinject`/`drop_packet` (both `&self`) can act on held packets
    /// without needing the capture thread to do it for them.
    live_handle: Arc<Mutex<Option<Arc<WinDivert<NetworkLayer>>>>>,
    /// `InterceptAndAllow`/`InterceptAndBlock` packets awaiting a verdict,
    /// keyed by `PacketInfo::id`. Monitor-mode packets never enter this map.
    pending: Arc<Mutex<HashMap<u64, PendingPacket>>>,
}

impl WindowsInterceptor {
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
            next_packet_id: Arc::new(AtomicU32::new(1)),
            live_handle: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn open_with_fallback(&self, config: &InterceptorConfig) -> AnyResult<WinDivert<NetworkLayer>> {
        let filter_expr = if let Some(f) = &self.filter_override {
            vec![f.clone()]
        } else {
            build_ladder(config, DEFAULT_APPLICATION_PORTS)
        };

        let mut last_err = None;
        for rung in &filter_expr {
            for attempt in 0..WINDIVERT_RETRIES_PER_FILTER {
                match WinDivert::network(rung, 0, WinDivertFlags::new()) {
                    Ok(handle) => return Ok(handle),
                    Err(e) => {
                        tracing::warn!("WinDivert open failed (rung={rung:?}, attempt={attempt}): {e}");
                        last_err = Some(e);
                        let backoff = Duration::from_secs(WINDIVERT_RETRY_BASE_SECS) * 2u32.pow(attempt);
                        std::thread::sleep(backoff);
                    }
                }
            }
        }
        Err(anyhow!("every filter rung rejected by the kernel: {last_err:?}"))
            .context("WinDivert handle open exhausted the fallback ladder")
    }
}

impl PlatformInterceptor for WindowsInterceptor {
    fn initialize(&mut self, config: InterceptorConfig) -> Result<()> {
        let exe = std::env::current_exe().map_err(EngineError::from)?;
        let binary_path = exe.parent().map(|p| p.join(DRIVER_FILE)).unwrap_or_default();
        ensure_driver_running(&binary_path.to_string_lossy())
            .map_err(|e| EngineError::FatalInit(e.to_string()))?;
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

        let handle = self
            .open_with_fallback(&config)
            .map_err(|e| EngineError::FilterRejected(e.to_string()))?;
        let handle = Arc::new(handle);
        *self.live_handle.lock().unwrap() = Some(Arc::clone(&handle));

        self.shutdown.store(false, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(config.channel_size);
        let bypass = parse_bypass_cidrs(&config.bypass_cidrs);

        for idx in 0..config.worker_count.max(1) {
            let handle = Arc::clone(&handle);
            let tx = tx.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let degraded = Arc::clone(&self.degraded);
            let stats = Arc::clone(&self.stats);
            let resolver = Arc::clone(&self.resolver);
            let limiter = Arc::clone(&self.limiter);
            let bypass = bypass.clone();
            let mode = config.mode;
            let auto_reinject = config.auto_reinject;
            let buffer_size = config.buffer_size;
            let next_id = Arc::clone(&self.next_packet_id);
            let pending = Arc::clone(&self.pending);

            let join = std::thread::Builder::new()
                .name(format!("windivert-worker-{idx}"))
                .spawn(move || {
                    capture_loop(
                        handle, tx, shutdown, degraded, stats, resolver, limiter, bypass, mode,
                        auto_reinject, buffer_size, next_id, pending,
                    );
                })
                .map_err(|e| EngineError::Io(e.to_string()))?;
            self.workers.push(Worker { handle: Some(join) });
        }

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
        *self.live_handle.lock().unwrap() = None;
        self.pending.lock().unwrap().clear();
    }

    fn set_filter(&mut self, expr: &str) -> Result<()> {
        if expr.trim().is_empty() {
            return Err(EngineError::InvalidFilter("empty filter expression".to_string()));
        }
        self.filter_override = Some(expr.to_string());
        Ok(())
    }

    fn reinject(&self, packet: &PacketInfo) -> Result<()> {
        match &packet.reinject {
            ReinjectHandle::WinDivertAddress(_) => {
                let pending = self
                    .pending
                    .lock()
                    .unwrap()
                    .remove(&packet.id)
                    .ok_or_else(|| {
                        EngineError::ReinjectFailed(format!("no pending capture for packet {}", packet.id))
                    })?;
                let handle_guard = self.live_handle.lock().unwrap();
                let handle = handle_guard.as_ref().ok_or_else(|| {
                    EngineError::ReinjectFailed("interceptor is not running".to_string())
                })?;
                let wd_packet = WinDivertPacket::<NetworkLayer> {
                    address: pending.address,
                    data: Cow::Owned(pending.data),
                };
                handle
                    .send(&wd_packet)
                    .map_err(|e| EngineError::ReinjectFailed(e.to_string()))?;
                self.stats.record_reinjected();
                Ok(())
            }
            _ => Err(EngineError::ReinjectFailed(
                "packet carries no WinDivert reinject handle".to_string(),
            )),
        }
    }

    fn drop_packet(&self, packet: &PacketInfo) -> Result<()> {
        // WinDivert never releases a held packet on its own; simply removing
        // it from `pending` without resending is the drop.
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

#[allow(clippy::too_many_arguments)]
fn capture_loop(
    handle: Arc<WinDivert<NetworkLayer>>,
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
    pending: Arc<Mutex<HashMap<u64, PendingPacket>>>,
) {
    let mut buf = vec![0u8; buffer_size];
    let mut consecutive_errors: u32 = 0;
    let mut batch: Vec<PacketInfo> = Vec::with_capacity(CAPTURE_BATCH_SIZE);
    let mut last_flush = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        match handle.recv(Some(&mut buf)) {
            Ok(packet) => {
                consecutive_errors = 0;
                let outbound = packet.address.outbound();
                let direction = if outbound { Direction::Outbound } else { Direction::Inbound };

                let Some(hdr) = parse_ip_packet(&packet.data) else {
                    continue;
                };

                if is_bypassed(hdr.dst_ip, &bypass) || is_bypassed(hdr.src_ip, &bypass) {
                    // Second-layer recheck: the kernel filter may not have
                    // excluded this destination, so drop it here instead.
                    continue;
                }

                let payload = packet.data[hdr.payload_start..].to_vec();
                let id = next_id.fetch_add(1, Ordering::Relaxed) as u64;
                let mut pkt = PacketInfo::new(
                    id,
                    direction,
                    hdr.protocol,
                    hdr.src_ip,
                    hdr.src_port,
                    hdr.dst_ip,
                    hdr.dst_port,
                    payload,
                    ReinjectHandle::WinDivertAddress(Vec::new()),
                );

                if !limiter.admit(pkt.size) {
                    stats.record_dropped();
                    if auto_reinject {
                        if let Err(e) = handle.send(&packet) {
                            tracing::warn!("reinject (rate-limited passthrough) failed: {e}");
                        } else {
                            stats.record_reinjected();
                        }
                    }
                    continue;
                }

                pkt.process = resolver.resolve(pkt.five_tuple(), pkt.direction).map(Arc::new);
                stats.record_processed(pkt.size as u64);

                match mode {
                    InterceptMode::Monitor => {
                        if auto_reinject {
                            if let Err(e) = handle.send(&packet) {
                                tracing::warn!("WinDivert reinject failed: {e}");
                            } else {
                                stats.record_reinjected();
                            }
                        }
                        batch.push(pkt);
                    }
                    InterceptMode::InterceptAndAllow | InterceptMode::InterceptAndBlock => {
                        // Held for the pipeline's verdict: `reinject()`/
                        // `drop_packet()` pull this back out by id and either
                        // resend it through `handle` or let it rot unsent.
                        pending.lock().unwrap().insert(
                            pkt.id,
                            PendingPacket { data: packet.data.to_vec(), address: packet.address.clone() },
                        );
                        batch.push(pkt);
                    }
                }

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
                tracing::warn!("WinDivert recv error ({consecutive_errors}/{CAPTURE_MAX_ERRORS}): {e}");
                std::thread::sleep(capture_backoff(consecutive_errors));

                if consecutive_errors >= CAPTURE_MAX_ERRORS {
                    *degraded.lock().unwrap() = Some(format!("capture handle unhealthy: {e}"));
                    tracing::error!("capture worker degraded after {CAPTURE_MAX_ERRORS} consecutive errors");
                    break;
                }
            }
        }

        if last_flush.elapsed() >= Duration::from_millis(CAPTURE_BATCH_MAX_WAIT_MS) && !batch.is_empty() {
            flush_batch(&tx, &mut batch, &stats);
            last_flush = Instant::now();
        }
    }

    flush_batch(&tx, &mut batch, &stats);
}

fn flush_batch(tx: &mpsc::Sender<PacketInfo>, batch: &mut Vec<PacketInfo>, stats: &InterceptorStats) {
    for pkt in batch.drain(..) {
        if tx.try_send(pkt).is_err() {
            stats.record_dropped();
        }
    }
}
