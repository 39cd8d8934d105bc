//! Global session table (spec §4.3 final paragraph): tracks one
//! [`SessionInfo`] per flow, capped at `max_sessions` with oldest-start-time
//! eviction, and swept once a minute for entries past `session_timeout`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::config::{DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TIMEOUT_SECS, SESSION_CLEANUP_INTERVAL_SECS};
use crate::model::{Direction, FiveTuple, SessionInfo};

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionInfo>>,
    max_sessions: usize,
    session_timeout: Duration,
    cleanup_interval: Duration,
    evicted: std::sync::atomic::AtomicU64,
    timed_out: std::sync::atomic::AtomicU64,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS, Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS))
    }
}

impl SessionManager {
    pub fn new(max_sessions: usize, session_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            session_timeout,
            cleanup_interval: Duration::from_secs(SESSION_CLEANUP_INTERVAL_SECS),
            evicted: std::sync::atomic::AtomicU64::new(0),
            timed_out: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn timed_out_count(&self) -> u64 {
        self.timed_out.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Records one packet against the session for `tuple`, creating it with
    /// `protocol` if this is the first packet seen for the flow.
    pub fn record_packet(&self, tuple: FiveTuple, protocol: &str, direction: Direction, bytes: u64, at: SystemTime) {
        let session_id = tuple.session_id();
        let mut sessions = self.sessions.lock().unwrap();

        if !sessions.contains_key(&session_id) && sessions.len() >= self.max_sessions {
            self.evict_oldest(&mut sessions);
        }

        let entry = sessions.entry(session_id).or_insert_with(|| SessionInfo::new(tuple, protocol, at));
        entry.record_packet(direction, bytes, at);
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    pub fn all(&self) -> Vec<SessionInfo> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    fn evict_oldest(&self, sessions: &mut HashMap<String, SessionInfo>) {
        let oldest = sessions.iter().min_by_key(|(_, s)| s.start_time).map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            sessions.remove(&id);
            self.evicted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Removes sessions whose `last_seen` has exceeded `session_timeout`,
    /// driven by a caller-owned ticker at `cleanup_interval`.
    pub fn sweep_timed_out(&self, now: SystemTime) {
        let mut sessions = self.sessions.lock().unwrap();
        let timeout = self.session_timeout;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_timed_out(timeout, now));
        let removed = before - sessions.len();
        if removed > 0 {
            self.timed_out.fetch_add(removed as u64, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Spawns the once-a-minute cleanup task against a shared handle.
    pub fn spawn_cleanup_task(manager: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.cleanup_interval());
            loop {
                ticker.tick().await;
                manager.sweep_timed_out(SystemTime::now());
            }
        })
    }
}
