//! OS connection-table source (spec §4.2 priority 50): snapshots the kernel's
//! own TCP/UDP tables and matches a flow against them by a descending ladder
//! of specificity, refreshing once if the first pass comes up empty.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{CONNECTION_TABLE_REFRESH_SECS, CONNECTION_TABLE_REFRESH_MAX_SECS};
use crate::model::{ConnectionInfo, ConnectionState, Direction, FiveTuple, L4Protocol, ProcessInfo};

use super::ProcessSource;

#[cfg(target_os = "windows")]
use super::win_net_table;

struct Snapshot {
    rows: Vec<ConnectionInfo>,
    taken_at: Instant,
}

/// Wraps the platform connection table behind a periodically refreshed cache
/// and a five-step lookup ladder (exact four-tuple down to wildcard port).
pub struct ConnectionTableSource {
    snapshot: Mutex<Option<Snapshot>>,
    refresh_interval: Mutex<Duration>,
    max_interval: Duration,
}

impl Default for ConnectionTableSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTableSource {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(None),
            refresh_interval: Mutex::new(Duration::from_secs(CONNECTION_TABLE_REFRESH_SECS)),
            max_interval: Duration::from_secs(CONNECTION_TABLE_REFRESH_MAX_SECS),
        }
    }

    fn take_platform_snapshot() -> Vec<ConnectionInfo> {
        #[cfg(target_os = "windows")]
        {
            win_net_table::snapshot()
        }
        #[cfg(target_os = "linux")]
        {
            linux_proc_net::snapshot()
        }
        #[cfg(target_os = "macos")]
        {
            macos_lsof::snapshot()
        }
        #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
        {
            Vec::new()
        }
    }

    /// Refreshes the cached snapshot if stale. `force` bypasses the interval
    /// check entirely, used for the single retry after a lookup miss.
    fn refresh(&self, force: bool) {
        let mut interval = self.refresh_interval.lock().unwrap();
        let mut guard = self.snapshot.lock().unwrap();
        let stale = match guard.as_ref() {
            None => true,
            Some(s) => s.taken_at.elapsed() >= *interval,
        };
        if !force && !stale {
            return;
        }
        let rows = Self::take_platform_snapshot();
        let empty = rows.is_empty();
        *guard = Some(Snapshot { rows, taken_at: Instant::now() });
        // Back off the refresh cadence on repeated empty tables rather than
        // hammering the kernel interface every call.
        if empty {
            *interval = (*interval * 2).min(self.max_interval);
        } else {
            *interval = Duration::from_secs(CONNECTION_TABLE_REFRESH_SECS);
        }
    }

    fn lookup(&self, local: Ipv4Addr, local_port: u16, remote: Ipv4Addr, remote_port: u16, protocol: L4Protocol) -> Option<u32> {
        let guard = self.snapshot.lock().unwrap();
        let rows = guard.as_ref()?.rows.iter().filter(|r| r.protocol == protocol);

        // 1. exact four-tuple match.
        if let Some(row) = rows.clone().find(|r| {
            r.local_addr == local && r.local_port == local_port && r.remote_addr == remote && r.remote_port == remote_port
        }) {
            return row.pid;
        }
        // 2. local two-tuple match (covers UDP sockets with no fixed peer).
        if let Some(row) = rows.clone().find(|r| r.local_addr == local && r.local_port == local_port) {
            return row.pid;
        }
        // 3. wildcard-bound local address (0.0.0.0:port).
        if let Some(row) = rows.clone().find(|r| r.local_addr == Ipv4Addr::UNSPECIFIED && r.local_port == local_port) {
            return row.pid;
        }
        // 4. loopback-bound local address.
        if let Some(row) = rows.clone().find(|r| r.local_addr == Ipv4Addr::LOCALHOST && r.local_port == local_port) {
            return row.pid;
        }
        // 5. any row ending in the local port, regardless of bound address.
        rows.clone().find(|r| r.local_port == local_port).and_then(|r| r.pid)
    }
}

impl ProcessSource for ConnectionTableSource {
    fn priority(&self) -> u32 {
        50
    }

    fn name(&self) -> &str {
        "connection_table"
    }

    fn get_process_info(&self, tuple: FiveTuple, direction: Direction) -> Option<ProcessInfo> {
        let (local_addr, local_port, remote_addr, remote_port) = match direction {
            Direction::Outbound => (tuple.src_ip, tuple.src_port, tuple.dst_ip, tuple.dst_port),
            Direction::Inbound => (tuple.dst_ip, tuple.dst_port, tuple.src_ip, tuple.src_port),
        };

        self.refresh(false);
        if let Some(pid) = self.lookup(local_addr, local_port, remote_addr, remote_port, tuple.protocol) {
            return Some(ProcessInfo { pid, ..ProcessInfo::unresolved() }).filter(|p| p.pid > 0);
        }

        // Single forced refresh: the table may simply be stale for a
        // just-opened socket.
        self.refresh(true);
        self.lookup(local_addr, local_port, remote_addr, remote_port, tuple.protocol)
            .map(|pid| ProcessInfo { pid, ..ProcessInfo::unresolved() })
            .filter(|p| p.pid > 0)
    }
}

#[cfg(target_os = "linux")]
mod linux_proc_net {
    use super::*;
    use std::fs;

    /// Parses `/proc/net/tcp` and `/proc/net/udp`. Both files share the
    /// column layout: `sl local_address rem_address st ... uid ... inode`.
    /// PID resolution requires a second pass over `/proc/<pid>/fd/*` socket
    /// inode symlinks, which is done lazily only for inodes we actually need.
    pub fn snapshot() -> Vec<ConnectionInfo> {
        let mut rows = Vec::new();
        let inode_to_pid = build_inode_pid_map();
        parse_table("/proc/net/tcp", L4Protocol::Tcp, &inode_to_pid, &mut rows);
        parse_table("/proc/net/udp", L4Protocol::Udp, &inode_to_pid, &mut rows);
        rows
    }

    fn build_inode_pid_map() -> std::collections::HashMap<u64, u32> {
        let mut map = std::collections::HashMap::new();
        let Ok(proc_dir) = fs::read_dir("/proc") else {
            return map;
        };
        for entry in proc_dir.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let fd_dir = entry.path().join("fd");
            let Ok(fds) = fs::read_dir(&fd_dir) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if let Some(name) = link.to_str() {
                        if let Some(inode) = name.strip_prefix("socket:[").and_then(|s| s.strip_suffix(']')) {
                            if let Ok(inode) = inode.parse::<u64>() {
                                map.insert(inode, pid);
                            }
                        }
                    }
                }
            }
        }
        map
    }

    fn parse_table(
        path: &str,
        protocol: L4Protocol,
        inode_to_pid: &std::collections::HashMap<u64, u32>,
        out: &mut Vec<ConnectionInfo>,
    ) {
        let Ok(content) = fs::read_to_string(path) else {
            return;
        };
        let now = std::time::Instant::now();
        for line in content.lines().skip(1) {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 10 {
                continue;
            }
            let Some((local_addr, local_port)) = parse_hex_endpoint(cols[1]) else {
                continue;
            };
            let Some((remote_addr, remote_port)) = parse_hex_endpoint(cols[2]) else {
                continue;
            };
            let state = cols[3]
                .parse::<u32>()
                .map(|raw| match raw {
                    0x0A => ConnectionState::Listening,
                    0x01 => ConnectionState::Established,
                    0x07 | 0x08 | 0x09 => ConnectionState::Closed,
                    _ => ConnectionState::Unknown,
                })
                .unwrap_or(ConnectionState::Unknown);
            let inode = cols[9].parse::<u64>().ok();
            let pid = inode.and_then(|i| inode_to_pid.get(&i).copied());

            out.push(ConnectionInfo {
                protocol,
                local_addr,
                local_port,
                remote_addr,
                remote_port,
                state,
                last_seen: now,
                pid,
            });
        }
    }

    fn parse_hex_endpoint(field: &str) -> Option<(Ipv4Addr, u16)> {
        let (addr_hex, port_hex) = field.split_once(':')?;
        let addr_raw = u32::from_str_radix(addr_hex, 16).ok()?;
        let port = u16::from_str_radix(port_hex, 16).ok()?;
        // /proc/net/tcp stores the address as a little-endian u32.
        Some((Ipv4Addr::from(addr_raw.to_le_bytes()), port))
    }
}

#[cfg(target_os = "macos")]
mod macos_lsof {
    use super::*;
    use std::process::Command;

    /// Shells out to `lsof -nP -iTCP -iUDP` for a connection snapshot —
    /// there is no stable public netstat-table syscall on macOS the way
    /// there is on Linux or Windows.
    pub fn snapshot() -> Vec<ConnectionInfo> {
        let output = Command::new("lsof").args(["-nP", "-iTCP", "-iUDP"]).output();
        let Ok(output) = output else {
            return Vec::new();
        };
        let text = String::from_utf8_lossy(&output.stdout);
        let now = std::time::Instant::now();
        let mut rows = Vec::new();

        for line in text.lines().skip(1) {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 9 {
                continue;
            }
            let Ok(pid) = cols[1].parse::<u32>() else {
                continue;
            };
            let protocol = if cols[7].eq_ignore_ascii_case("tcp") {
                L4Protocol::Tcp
            } else if cols[7].eq_ignore_ascii_case("udp") {
                L4Protocol::Udp
            } else {
                continue;
            };
            let Some((local, remote)) = parse_name_field(cols[8]) else {
                continue;
            };
            rows.push(ConnectionInfo {
                protocol,
                local_addr: local.0,
                local_port: local.1,
                remote_addr: remote.map(|r| r.0).unwrap_or(Ipv4Addr::UNSPECIFIED),
                remote_port: remote.map(|r| r.1).unwrap_or(0),
                state: ConnectionState::Unknown,
                last_seen: now,
                pid: Some(pid),
            });
        }
        rows
    }

    /// `lsof`'s NAME column looks like `10.0.0.1:51820->1.2.3.4:443` or
    /// `*:8080` for a listening socket.
    fn parse_name_field(field: &str) -> Option<((Ipv4Addr, u16), Option<(Ipv4Addr, u16)>)> {
        let (local_str, remote_str) = match field.split_once("->") {
            Some((l, r)) => (l, Some(r)),
            None => (field, None),
        };
        let local = parse_endpoint(local_str)?;
        let remote = remote_str.and_then(parse_endpoint);
        Some((local, remote))
    }

    fn parse_endpoint(s: &str) -> Option<(Ipv4Addr, u16)> {
        let (addr, port) = s.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let addr = if addr == "*" { Ipv4Addr::UNSPECIFIED } else { addr.parse().ok()? };
        Some((addr, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound_tuple() -> FiveTuple {
        FiveTuple::new(
            L4Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 5),
            12345,
            Ipv4Addr::new(93, 184, 216, 34),
            443,
        )
    }

    fn row(local_addr: Ipv4Addr, local_port: u16, remote_addr: Ipv4Addr, remote_port: u16, pid: u32) -> ConnectionInfo {
        ConnectionInfo {
            protocol: L4Protocol::Tcp,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            state: ConnectionState::Established,
            last_seen: Instant::now(),
            pid: Some(pid),
        }
    }

    #[test]
    fn test_exact_four_tuple_match() {
        let source = ConnectionTableSource::new();
        *source.snapshot.lock().unwrap() = Some(Snapshot {
            rows: vec![row(Ipv4Addr::new(10, 0, 0, 5), 12345, Ipv4Addr::new(93, 184, 216, 34), 443, 42)],
            taken_at: Instant::now(),
        });
        let info = source.get_process_info(outbound_tuple(), Direction::Outbound).unwrap();
        assert_eq!(info.pid, 42);
    }

    #[test]
    fn test_falls_back_to_local_two_tuple() {
        let source = ConnectionTableSource::new();
        *source.snapshot.lock().unwrap() = Some(Snapshot {
            rows: vec![row(Ipv4Addr::new(10, 0, 0, 5), 12345, Ipv4Addr::new(1, 1, 1, 1), 9999, 7)],
            taken_at: Instant::now(),
        });
        let info = source.get_process_info(outbound_tuple(), Direction::Outbound).unwrap();
        assert_eq!(info.pid, 7);
    }

    #[test]
    fn test_falls_back_to_wildcard_bind() {
        let source = ConnectionTableSource::new();
        *source.snapshot.lock().unwrap() = Some(Snapshot {
            rows: vec![row(Ipv4Addr::UNSPECIFIED, 12345, Ipv4Addr::UNSPECIFIED, 0, 13)],
            taken_at: Instant::now(),
        });
        let info = source.get_process_info(outbound_tuple(), Direction::Outbound).unwrap();
        assert_eq!(info.pid, 13);
    }

    #[test]
    fn test_no_match_returns_none() {
        let source = ConnectionTableSource::new();
        *source.snapshot.lock().unwrap() = Some(Snapshot { rows: vec![], taken_at: Instant::now() });
        assert!(source.get_process_info(outbound_tuple(), Direction::Outbound).is_none());
    }

    #[test]
    fn test_inbound_direction_uses_dst_as_local() {
        let tuple = FiveTuple::new(
            L4Protocol::Tcp,
            Ipv4Addr::new(93, 184, 216, 34),
            443,
            Ipv4Addr::new(10, 0, 0, 5),
            12345,
        );
        let source = ConnectionTableSource::new();
        *source.snapshot.lock().unwrap() = Some(Snapshot {
            rows: vec![row(Ipv4Addr::new(10, 0, 0, 5), 12345, Ipv4Addr::new(93, 184, 216, 34), 443, 99)],
            taken_at: Instant::now(),
        });
        let info = source.get_process_info(tuple, Direction::Inbound).unwrap();
        assert_eq!(info.pid, 99);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_hex_endpoint() {
        use super::linux_proc_net::*;
        let (addr, port) = parse_hex_endpoint("0100007F:1F90").unwrap();
        assert_eq!(addr, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(port, 8080);
    }
}
