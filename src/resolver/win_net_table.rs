//! Windows IP Helper FFI for enumerating the TCP/UDP connection tables.
//!
//! Wraps `GetExtendedTcpTable` / `GetExtendedUdpTable` from `iphlpapi.dll`.
//! IPv4 only, per the engine's Non-goals; the IPv6 row layouts are omitted.

use crate::model::{ConnectionInfo, ConnectionState, L4Protocol};
use std::net::Ipv4Addr;
use std::time::Instant;

const AF_INET: u32 = 2;
const TCP_TABLE_OWNER_PID_ALL: u32 = 5;
const UDP_TABLE_OWNER_PID: u32 = 1;
const NO_ERROR: u32 = 0;
const ERROR_INSUFFICIENT_BUFFER: u32 = 122;

const MIB_TCP_STATE_LISTEN: u32 = 2;
const MIB_TCP_STATE_ESTAB: u32 = 5;

#[repr(C)]
struct MibTcpRowOwnerPid {
    state: u32,
    local_addr: u32,
    local_port: u32,
    remote_addr: u32,
    remote_port: u32,
    owning_pid: u32,
}

#[repr(C)]
struct MibUdpRowOwnerPid {
    local_addr: u32,
    local_port: u32,
    owning_pid: u32,
}

#[link(name = "iphlpapi")]
extern "system" {
    fn GetExtendedTcpTable(
        pTcpTable: *mut u8,
        pdwSize: *mut u32,
        bOrder: i32,
        ulAf: u32,
        TableClass: u32,
        Reserved: u32,
    ) -> u32;

    fn GetExtendedUdpTable(
        pUdpTable: *mut u8,
        pdwSize: *mut u32,
        bOrder: i32,
        ulAf: u32,
        TableClass: u32,
        Reserved: u32,
    ) -> u32;
}

fn be_ip(addr_ne: u32) -> Ipv4Addr {
    // The tables store addresses in network byte order already, laid out as
    // raw bytes rather than a big-endian integer — reinterpret directly.
    Ipv4Addr::from(addr_ne.to_ne_bytes())
}

fn tcp_state(raw: u32) -> ConnectionState {
    match raw {
        MIB_TCP_STATE_LISTEN => ConnectionState::Listening,
        MIB_TCP_STATE_ESTAB => ConnectionState::Established,
        1 | 8 | 9 | 12 => ConnectionState::Closed,
        _ => ConnectionState::Unknown,
    }
}

/// Snapshots the current IPv4 TCP and UDP connection tables.
pub fn snapshot() -> Vec<ConnectionInfo> {
    let mut rows = Vec::new();
    scan_tcp_table(&mut rows);
    scan_udp_table(&mut rows);
    rows
}

fn scan_tcp_table(out: &mut Vec<ConnectionInfo>) {
    let mut size: u32 = 0;
    let ret = unsafe {
        GetExtendedTcpTable(std::ptr::null_mut(), &mut size, 0, AF_INET, TCP_TABLE_OWNER_PID_ALL, 0)
    };
    if ret != ERROR_INSUFFICIENT_BUFFER {
        return;
    }

    let mut buf = vec![0u8; size as usize];
    let ret = unsafe {
        GetExtendedTcpTable(buf.as_mut_ptr(), &mut size, 0, AF_INET, TCP_TABLE_OWNER_PID_ALL, 0)
    };
    if ret != NO_ERROR {
        tracing::warn!("GetExtendedTcpTable failed with code {ret}");
        return;
    }
    if buf.len() < 4 {
        return;
    }

    let num_entries = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
    let row_size = std::mem::size_of::<MibTcpRowOwnerPid>();
    let now = Instant::now();

    for i in 0..num_entries {
        let offset = 4 + i * row_size;
        if offset + row_size > buf.len() {
            break;
        }
        let row = unsafe { &*(buf.as_ptr().add(offset) as *const MibTcpRowOwnerPid) };
        out.push(ConnectionInfo {
            protocol: L4Protocol::Tcp,
            local_addr: be_ip(row.local_addr),
            local_port: u16::from_be((row.local_port as u16).to_le()),
            remote_addr: be_ip(row.remote_addr),
            remote_port: u16::from_be((row.remote_port as u16).to_le()),
            state: tcp_state(row.state),
            last_seen: now,
            pid: Some(row.owning_pid),
        });
    }
}

fn scan_udp_table(out: &mut Vec<ConnectionInfo>) {
    let mut size: u32 = 0;
    let ret = unsafe {
        GetExtendedUdpTable(std::ptr::null_mut(), &mut size, 0, AF_INET, UDP_TABLE_OWNER_PID, 0)
    };
    if ret != ERROR_INSUFFICIENT_BUFFER {
        return;
    }

    let mut buf = vec![0u8; size as usize];
    let ret = unsafe {
        GetExtendedUdpTable(buf.as_mut_ptr(), &mut size, 0, AF_INET, UDP_TABLE_OWNER_PID, 0)
    };
    if ret != NO_ERROR {
        tracing::warn!("GetExtendedUdpTable failed with code {ret}");
        return;
    }
    if buf.len() < 4 {
        return;
    }

    let num_entries = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
    let row_size = std::mem::size_of::<MibUdpRowOwnerPid>();
    let now = Instant::now();

    for i in 0..num_entries {
        let offset = 4 + i * row_size;
        if offset + row_size > buf.len() {
            break;
        }
        let row = unsafe { &*(buf.as_ptr().add(offset) as *const MibUdpRowOwnerPid) };
        // UDP is connectionless — the table carries no remote endpoint.
        out.push(ConnectionInfo {
            protocol: L4Protocol::Udp,
            local_addr: be_ip(row.local_addr),
            local_port: u16::from_be((row.local_port as u16).to_le()),
            remote_addr: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            state: ConnectionState::Unknown,
            last_seen: now,
            pid: Some(row.owning_pid),
        });
    }
}
