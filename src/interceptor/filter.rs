//! Kernel filter expression builder, fallback ladder, and the bypass-CIDR
//! application-layer recheck.
//!
//! The primary filter expression is built once from the configured
//! application ports and bypass CIDRs. Because kernel filter dialects vary
//! across driver versions (WinDivert most of all), [`build_ladder`] also
//! emits progressively looser fallback rungs so `start()` can retry a
//! rejected filter instead of failing outright.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::model::InterceptorConfig;

/// Parses the configured bypass CIDR strings, skipping (and logging) any
/// that fail to parse rather than failing the whole list.
pub fn parse_bypass_cidrs(cidrs: &[String]) -> Vec<Ipv4Net> {
    cidrs
        .iter()
        .filter_map(|s| match s.parse::<Ipv4Net>() {
            Ok(net) => Some(net),
            Err(e) => {
                tracing::warn!("skipping invalid bypass CIDR {s:?}: {e}");
                None
            }
        })
        .collect()
}

/// True if `ip` falls inside any configured bypass network. This is the
/// application-layer recheck every backend runs after the kernel filter,
/// since the kernel filter can be coarse (spec §4.1).
pub fn is_bypassed(ip: Ipv4Addr, bypass: &[Ipv4Net]) -> bool {
    bypass.iter().any(|net| net.contains(&ip))
}

/// Builds the primary WinDivert-dialect filter expression plus a fallback
/// ladder of progressively looser expressions, for backends (today, only
/// WinDivert) whose kernel filter is a textual expression language.
///
/// Ladder, from strictest to loosest:
/// 0. outbound tcp restricted to the application port set, excluding bypass CIDRs
/// 1. same port set, bypass exclusion dropped (recheck happens in user space instead)
/// 2. `"tcp"` — drop the port restriction too
/// 3. `"true"` — only emitted when `allow_diagnostic_passthrough` is set; this
///    disables every kernel-side guarantee and is an explicit opt-in
///    (Open Question #3 in SPEC_FULL.md).
pub fn build_ladder(config: &InterceptorConfig, ports: &[u16]) -> Vec<String> {
    let port_clause = port_set_clause(ports);
    let bypass = parse_bypass_cidrs(&config.bypass_cidrs);
    let exclude_clause = exclude_clause(&bypass);

    let mut ladder = Vec::new();

    let mut primary = format!("outbound and tcp and ({port_clause})");
    if let Some(exclude) = &exclude_clause {
        primary.push_str(&format!(" and not ({exclude})"));
    }
    ladder.push(primary);

    ladder.push(format!("outbound and tcp and ({port_clause})"));
    ladder.push("tcp".to_string());

    if config.allow_diagnostic_passthrough {
        ladder.push("true".to_string());
    }

    ladder
}

fn port_set_clause(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| format!("tcp.DstPort == {p}"))
        .collect::<Vec<_>>()
        .join(" or ")
}

fn exclude_clause(bypass: &[Ipv4Net]) -> Option<String> {
    if bypass.is_empty() {
        return None;
    }
    Some(
        bypass
            .iter()
            .map(|net| format!("ip.DstAddr >= {} and ip.DstAddr <= {}", net.network(), net.broadcast()))
            .collect::<Vec<_>>()
            .join(" or "),
    )
}
