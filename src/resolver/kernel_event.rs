//! Kernel/event-driven process source (spec §4.2 priority 100): a process
//! snapshot walk that maps every socket inode or local port it can see to a
//! pid, refreshed by [`ConnectionMapper`] on its own cleanup cadence rather
//! than per-query. This is the highest-priority source because it is
//! populated eagerly by a background task instead of lazily on a cache miss,
//! so a freshly opened connection is more likely to already be mapped here
//! than in the OS connection table.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sysinfo::{Pid, System};

use crate::config::{MAPPER_CLEANUP_INTERVAL_SECS, MAPPER_MAX_ENTRIES, MAPPING_EXPIRE_TIME_SECS};
use crate::model::{Direction, FiveTuple, L4Protocol, ProcessInfo};

use super::ProcessSource;

#[derive(Clone)]
struct MappingEntry {
    pid: u32,
    inserted_at: Instant,
    last_touched: Instant,
}

/// Tracks `local_port -> pid` mappings discovered by a periodic process scan,
/// bounded to [`MAPPER_MAX_ENTRIES`] with a background-driven expiry sweep.
pub struct ConnectionMapper {
    entries: DashMap<(L4Protocol, u16), MappingEntry>,
    max_entries: usize,
    expire_after: Duration,
    last_cleanup: Mutex<Instant>,
    cleanup_interval: Duration,
}

impl Default for ConnectionMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMapper {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: MAPPER_MAX_ENTRIES,
            expire_after: Duration::from_secs(MAPPING_EXPIRE_TIME_SECS),
            last_cleanup: Mutex::new(Instant::now()),
            cleanup_interval: Duration::from_secs(MAPPER_CLEANUP_INTERVAL_SECS),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&self, protocol: L4Protocol, port: u16, pid: u32) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&(protocol, port)) {
            self.evict_oldest();
        }
        let now = Instant::now();
        self.entries
            .entry((protocol, port))
            .and_modify(|e| {
                e.pid = pid;
                e.last_touched = now;
            })
            .or_insert(MappingEntry { pid, inserted_at: now, last_touched: now });
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.inserted_at)
            .map(|e| *e.key());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Drops mappings untouched for longer than [`MAPPING_EXPIRE_TIME_SECS`].
    /// Called on a cadence of [`MAPPER_CLEANUP_INTERVAL_SECS`], enforced by
    /// `maybe_cleanup` rather than a caller-managed timer.
    pub fn cleanup_expired(&self) {
        self.entries.retain(|_, e| e.last_touched.elapsed() <= self.expire_after);
    }

    fn maybe_cleanup(&self) {
        let mut last = self.last_cleanup.lock().unwrap();
        if last.elapsed() >= self.cleanup_interval {
            self.cleanup_expired();
            *last = Instant::now();
        }
    }

    pub fn lookup(&self, protocol: L4Protocol, port: u16) -> Option<u32> {
        self.maybe_cleanup();
        self.entries.get(&(protocol, port)).map(|e| e.pid)
    }

    /// Re-scans running processes via `sysinfo` and records every port each
    /// process has a socket bound to, using the process's reported open
    /// files where available. `sysinfo` does not expose socket tables
    /// directly, so this only populates entries for processes the OS lets
    /// us introspect; the connection-table source covers the rest.
    pub fn refresh_from_system(&self, system: &System, port_by_pid: &HashMap<u32, Vec<(L4Protocol, u16)>>) {
        for process in system.processes().values() {
            let pid = process.pid().as_u32();
            if let Some(ports) = port_by_pid.get(&pid) {
                for (protocol, port) in ports {
                    self.insert(*protocol, *port, pid);
                }
            }
        }
        self.maybe_cleanup();
    }

    /// Records a single connect/accept event pushed from the capture path —
    /// the eager-population mechanism that gives this source its priority.
    pub fn record_event(&self, protocol: L4Protocol, local_port: u16, pid: u32) {
        self.insert(protocol, local_port, pid);
    }
}

/// Adapts [`ConnectionMapper`] to the [`ProcessSource`] interface, filling in
/// process detail (name, exe path, user) via `sysinfo` when a pid is found.
pub struct KernelEventSource {
    mapper: std::sync::Arc<ConnectionMapper>,
}

impl KernelEventSource {
    pub fn new(mapper: std::sync::Arc<ConnectionMapper>) -> Self {
        Self { mapper }
    }

    fn describe(pid: u32) -> ProcessInfo {
        let mut system = System::new_all();
        system.refresh_all();
        match system.process(Pid::from_u32(pid)) {
            Some(proc) => ProcessInfo {
                pid,
                name: proc.name().to_string_lossy().to_string(),
                exe_path: proc.exe().map(|p| p.display().to_string()).unwrap_or_default(),
                user: proc
                    .user_id()
                    .map(|u| u.to_string())
                    .unwrap_or_default(),
                cmdline: proc
                    .cmd()
                    .iter()
                    .map(|s| s.to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join(" "),
            },
            None => ProcessInfo { pid, ..ProcessInfo::unresolved() },
        }
    }
}

impl ProcessSource for KernelEventSource {
    fn priority(&self) -> u32 {
        100
    }

    fn name(&self) -> &str {
        "kernel_event"
    }

    fn get_process_info(&self, tuple: FiveTuple, direction: Direction) -> Option<ProcessInfo> {
        let local_port = match direction {
            Direction::Outbound => tuple.src_port,
            Direction::Inbound => tuple.dst_port,
        };
        let pid = self.mapper.lookup(tuple.protocol, local_port)?;
        if pid == 0 {
            return None;
        }
        Some(Self::describe(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_insert_and_lookup() {
        let mapper = ConnectionMapper::new();
        mapper.record_event(L4Protocol::Tcp, 4444, 123);
        assert_eq!(mapper.lookup(L4Protocol::Tcp, 4444), Some(123));
    }

    #[test]
    fn test_lookup_missing_returns_none() {
        let mapper = ConnectionMapper::new();
        assert_eq!(mapper.lookup(L4Protocol::Tcp, 9999), None);
    }

    #[test]
    fn test_protocol_distinguishes_entries() {
        let mapper = ConnectionMapper::new();
        mapper.record_event(L4Protocol::Tcp, 80, 1);
        mapper.record_event(L4Protocol::Udp, 80, 2);
        assert_eq!(mapper.lookup(L4Protocol::Tcp, 80), Some(1));
        assert_eq!(mapper.lookup(L4Protocol::Udp, 80), Some(2));
    }

    #[test]
    fn test_cleanup_expired_removes_stale_entries() {
        let mapper = ConnectionMapper {
            entries: DashMap::new(),
            max_entries: MAPPER_MAX_ENTRIES,
            expire_after: Duration::from_millis(0),
            last_cleanup: Mutex::new(Instant::now()),
            cleanup_interval: Duration::from_secs(MAPPER_CLEANUP_INTERVAL_SECS),
        };
        mapper.record_event(L4Protocol::Tcp, 1234, 5);
        std::thread::sleep(Duration::from_millis(5));
        mapper.cleanup_expired();
        assert!(mapper.is_empty());
    }

    #[test]
    fn test_eviction_caps_entry_count() {
        let mapper = ConnectionMapper {
            entries: DashMap::new(),
            max_entries: 2,
            expire_after: Duration::from_secs(MAPPING_EXPIRE_TIME_SECS),
            last_cleanup: Mutex::new(Instant::now()),
            cleanup_interval: Duration::from_secs(MAPPER_CLEANUP_INTERVAL_SECS),
        };
        mapper.record_event(L4Protocol::Tcp, 1, 1);
        mapper.record_event(L4Protocol::Tcp, 2, 2);
        mapper.record_event(L4Protocol::Tcp, 3, 3);
        assert_eq!(mapper.len(), 2);
    }

    #[test]
    fn test_kernel_event_source_priority() {
        let mapper = std::sync::Arc::new(ConnectionMapper::new());
        let source = KernelEventSource::new(mapper);
        assert_eq!(source.priority(), 100);
        assert_eq!(source.name(), "kernel_event");
    }

    #[test]
    fn test_source_returns_none_when_unmapped() {
        let mapper = std::sync::Arc::new(ConnectionMapper::new());
        let source = KernelEventSource::new(mapper);
        let tuple = FiveTuple::new(
            L4Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 1),
            1111,
            Ipv4Addr::new(2, 2, 2, 2),
            443,
        );
        assert!(source.get_process_info(tuple, Direction::Outbound).is_none());
    }
}
