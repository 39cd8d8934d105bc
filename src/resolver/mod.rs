//! Multi-source process attribution: given a 5-tuple, find the local
//! process that owns it, with caching and a priority-ordered source list.

pub mod connection_table;
pub mod kernel_event;

#[cfg(target_os = "windows")]
pub mod win_net_table;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::{RESOLVER_CACHE_PRUNE_THRESHOLD, RESOLVER_CACHE_TTL_SECS};
use crate::interceptor::ProcessAttributor;
use crate::model::{Direction, FiveTuple, ProcessInfo};

/// A registrable attribution source. `priority` breaks ties when more than
/// one source could answer — higher wins.
pub trait ProcessSource: Send + Sync {
    fn priority(&self) -> u32;
    fn name(&self) -> &str;
    fn get_process_info(&self, tuple: FiveTuple, direction: Direction) -> Option<ProcessInfo>;
}

struct CacheEntry {
    info: ProcessInfo,
    source: String,
    inserted_at: Instant,
    last_access: std::sync::Mutex<Instant>,
}

/// Resolves a flow to a process, consulting a priority-ordered list of
/// [`ProcessSource`]s and caching results by fingerprint.
pub struct ProcessResolver {
    sources: Vec<std::sync::Arc<dyn ProcessSource>>,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
    cache_cap: usize,
    total_queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    successful_lookups: AtomicU64,
}

impl ProcessResolver {
    pub fn new(cache_cap: usize) -> Self {
        Self {
            sources: Vec::new(),
            cache: DashMap::new(),
            ttl: Duration::from_secs(RESOLVER_CACHE_TTL_SECS),
            cache_cap,
            total_queries: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            successful_lookups: AtomicU64::new(0),
        }
    }

    /// Registers a source and keeps the list sorted highest-priority-first.
    pub fn register_source(&mut self, source: std::sync::Arc<dyn ProcessSource>) {
        self.sources.push(source);
        self.sources.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn successful_lookups(&self) -> u64 {
        self.successful_lookups.load(Ordering::Relaxed)
    }

    pub fn query(&self, tuple: FiveTuple, direction: Direction) -> Option<ProcessInfo> {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let fingerprint = tuple.fingerprint();

        if let Some(entry) = self.cache.get(&fingerprint) {
            if entry.inserted_at.elapsed() <= self.ttl {
                *entry.last_access.lock().unwrap() = Instant::now();
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.info.clone());
            }
            drop(entry);
            // Expired — evict inline rather than waiting for the next prune pass.
            self.cache.remove(&fingerprint);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let found = self.sources.iter().find_map(|source| {
            source
                .get_process_info(tuple, direction)
                .filter(|info| info.pid > 0)
                .map(|info| (source.name().to_string(), info))
        });

        if let Some((source_name, info)) = &found {
            self.successful_lookups.fetch_add(1, Ordering::Relaxed);
            self.insert_cache(fingerprint, info.clone(), source_name.clone());
        }

        found.map(|(_, info)| info)
    }

    fn insert_cache(&self, fingerprint: String, info: ProcessInfo, source: String) {
        if self.cache.len() >= RESOLVER_CACHE_PRUNE_THRESHOLD {
            self.prune_expired();
        }
        if self.cache.len() >= self.cache_cap {
            self.evict_lru();
        }
        self.cache.insert(
            fingerprint,
            CacheEntry {
                info,
                source,
                inserted_at: Instant::now(),
                last_access: std::sync::Mutex::new(Instant::now()),
            },
        );
    }

    /// Removes every expired entry in one pass, per spec §4.2 step 4.
    pub fn prune_expired(&self) {
        self.cache.retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
    }

    /// LRU eviction by last access time (Open Question #1 in SPEC_FULL.md:
    /// overrides a plain FIFO sweep). The cache is capped in the low
    /// thousands, so a linear scan for the minimum is cheap relative to a
    /// kernel read or process query.
    fn evict_lru(&self) {
        let oldest = self
            .cache
            .iter()
            .min_by_key(|entry| *entry.last_access.lock().unwrap())
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.cache.remove(&key);
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Source name that answered a given fingerprint, if still cached —
    /// exposed for diagnostics/tests, not part of the hot path.
    pub fn cached_source(&self, tuple: FiveTuple) -> Option<String> {
        self.cache.get(&tuple.fingerprint()).map(|e| e.source.clone())
    }
}

impl ProcessAttributor for ProcessResolver {
    fn resolve(&self, tuple: FiveTuple, direction: Direction) -> Option<ProcessInfo> {
        self.query(tuple, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::L4Protocol;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    struct StaticSource {
        priority: u32,
        name: String,
        pid: u32,
    }

    impl ProcessSource for StaticSource {
        fn priority(&self) -> u32 {
            self.priority
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn get_process_info(&self, _tuple: FiveTuple, _direction: Direction) -> Option<ProcessInfo> {
            Some(ProcessInfo {
                pid: self.pid,
                name: self.name.clone(),
                exe_path: String::new(),
                user: String::new(),
                cmdline: String::new(),
            })
        }
    }

    struct MissSource;
    impl ProcessSource for MissSource {
        fn priority(&self) -> u32 {
            200
        }
        fn name(&self) -> &str {
            "miss"
        }
        fn get_process_info(&self, _tuple: FiveTuple, _direction: Direction) -> Option<ProcessInfo> {
            None
        }
    }

    fn tuple() -> FiveTuple {
        FiveTuple::new(
            L4Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            Ipv4Addr::new(1, 2, 3, 4),
            443,
        )
    }

    #[test]
    fn test_query_prefers_higher_priority_source() {
        let mut resolver = ProcessResolver::new(100);
        resolver.register_source(Arc::new(StaticSource { priority: 50, name: "low".into(), pid: 1 }));
        resolver.register_source(Arc::new(StaticSource { priority: 100, name: "high".into(), pid: 2 }));

        let info = resolver.query(tuple(), Direction::Outbound).unwrap();
        assert_eq!(info.pid, 2);
    }

    #[test]
    fn test_query_falls_through_on_miss() {
        let mut resolver = ProcessResolver::new(100);
        resolver.register_source(Arc::new(MissSource));
        resolver.register_source(Arc::new(StaticSource { priority: 10, name: "fallback".into(), pid: 7 }));

        let info = resolver.query(tuple(), Direction::Outbound).unwrap();
        assert_eq!(info.pid, 7);
    }

    #[test]
    fn test_query_caches_result() {
        let mut resolver = ProcessResolver::new(100);
        resolver.register_source(Arc::new(StaticSource { priority: 50, name: "src".into(), pid: 9 }));

        resolver.query(tuple(), Direction::Outbound);
        assert_eq!(resolver.cache_hits(), 0);
        resolver.query(tuple(), Direction::Outbound);
        assert_eq!(resolver.cache_hits(), 1);
        assert_eq!(resolver.total_queries(), 2);
    }

    #[test]
    fn test_total_equals_hits_plus_misses() {
        let mut resolver = ProcessResolver::new(100);
        resolver.register_source(Arc::new(StaticSource { priority: 50, name: "src".into(), pid: 9 }));
        for _ in 0..5 {
            resolver.query(tuple(), Direction::Outbound);
        }
        assert_eq!(resolver.total_queries(), resolver.cache_hits() + resolver.cache_misses());
        assert!(resolver.successful_lookups() <= resolver.total_queries());
    }

    #[test]
    fn test_query_returns_none_when_no_source_matches() {
        let mut resolver = ProcessResolver::new(100);
        resolver.register_source(Arc::new(MissSource));
        assert!(resolver.query(tuple(), Direction::Outbound).is_none());
    }

    #[test]
    fn test_pid_zero_is_not_a_match() {
        let mut resolver = ProcessResolver::new(100);
        resolver.register_source(Arc::new(StaticSource { priority: 50, name: "zero".into(), pid: 0 }));
        assert!(resolver.query(tuple(), Direction::Outbound).is_none());
    }

    #[test]
    fn test_evict_lru_keeps_recently_accessed() {
        let mut resolver = ProcessResolver::new(2);
        resolver.register_source(Arc::new(StaticSource { priority: 50, name: "src".into(), pid: 1 }));

        let t1 = FiveTuple::new(L4Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), 1, Ipv4Addr::new(2, 2, 2, 2), 1);
        let t2 = FiveTuple::new(L4Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), 2, Ipv4Addr::new(2, 2, 2, 2), 2);
        let t3 = FiveTuple::new(L4Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), 3, Ipv4Addr::new(2, 2, 2, 2), 3);

        resolver.query(t1, Direction::Outbound);
        resolver.query(t2, Direction::Outbound);
        // Touch t1 again so it is more recently used than t2.
        resolver.query(t1, Direction::Outbound);
        // Inserting t3 should evict t2, the least recently used.
        resolver.query(t3, Direction::Outbound);

        assert_eq!(resolver.cache_len(), 2);
        assert!(resolver.cached_source(t1).is_some());
        assert!(resolver.cached_source(t3).is_some());
    }
}
