//! Frozen per-interface policy and the filter chain applied to every proxied
//! request and CONNECT, in the fixed order from spec §4.2: local-destination,
//! method, destination-port, IP-literal, interface block-list, global
//! block-list. The chain is data (an ordered sequence of checks), not an
//! object hierarchy, per the design note in spec §9.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;

use crate::trie::DomainTrie;

/// How long the local-destination filter waits for a DNS resolution before
/// treating the host as unresolved (and thus not locally reachable).
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FilterReason {
    #[error("destination is not allowed: local destination")]
    LocalDestination,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("destination port is not allowed")]
    PortNotAllowed,
    #[error("destination is an IP literal")]
    IpLiteral,
    #[error("Blocked by interface policy")]
    InterfaceBlockList,
    #[error("Blocked by global policy")]
    GlobalBlockList,
}

/// Immutable per-interface policy, built once by `Configuration::check` and
/// shared read-only across every connection task on that interface.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub port: u16,
    pub allow_high_ports: bool,
    pub allow_low_ports: bool,
    pub block_ips: bool,
    pub block_local_services: bool,
    pub local_ips: HashSet<IpAddr>,
    pub direct_networks: Vec<IpNet>,
    pub allowed_methods: HashSet<String>,
    pub block_list: DomainTrie,
    pub block_by_idn: bool,
    pub http_transparent: bool,
    pub https_transparent_port: u16,
    /// Shared reference to the defaults-level block-list, if the interface
    /// doesn't override it. `None` means no global block-list is configured.
    pub global_block_list: Option<Arc<DomainTrie>>,
}

#[derive(Debug, Clone, Copy)]
enum PortSpec {
    Default,
    Explicit(u16),
    Unparseable,
}

/// Splits an HTTP authority (`host`, `host:port`, or a bracketed IPv6
/// literal) into a bare host and a port specification. A present-but-invalid
/// port is distinguished from an absent one so callers can apply the
/// "unparseable ⇒ block" rule at the port-filter step, not earlier.
fn split_authority(authority: &str) -> (String, PortSpec) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            return match rest[end + 1..].strip_prefix(':') {
                Some(port_str) => (
                    host,
                    port_str
                        .parse()
                        .map(PortSpec::Explicit)
                        .unwrap_or(PortSpec::Unparseable),
                ),
                None => (host, PortSpec::Default),
            };
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port_str)) => (
            host.to_string(),
            port_str
                .parse()
                .map(PortSpec::Explicit)
                .unwrap_or(PortSpec::Unparseable),
        ),
        None => (authority.to_string(), PortSpec::Default),
    }
}

/// Resolves `host` to a single IP: parsed directly if it's already a
/// literal, otherwise a best-effort DNS lookup bounded by
/// [`RESOLVE_TIMEOUT`]. Per Open Question 2 this is called at most once per
/// request and the result threaded through every filter that needs it.
pub async fn resolve_host(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    let lookup = tokio::net::lookup_host((host, 0));
    match tokio::time::timeout(RESOLVE_TIMEOUT, lookup).await {
        Ok(Ok(mut addrs)) => addrs.next().map(|addr| addr.ip()),
        _ => None,
    }
}

fn local_destination_filter(
    resolved: Option<IpAddr>,
    policy: &PolicyConfig,
) -> Result<(), FilterReason> {
    let Some(ip) = resolved else {
        return Ok(());
    };
    if policy.block_local_services && policy.local_ips.contains(&ip) {
        return Err(FilterReason::LocalDestination);
    }
    if policy.direct_networks.iter().any(|net| net.contains(&ip)) {
        return Err(FilterReason::LocalDestination);
    }
    Ok(())
}

fn method_filter(method: &str, policy: &PolicyConfig) -> Result<(), FilterReason> {
    if policy.allowed_methods.contains(method) {
        Ok(())
    } else {
        Err(FilterReason::MethodNotAllowed)
    }
}

fn port_filter(
    spec: PortSpec,
    always_allowed_port: u16,
    policy: &PolicyConfig,
) -> Result<(), FilterReason> {
    let port = match spec {
        PortSpec::Default => always_allowed_port,
        PortSpec::Explicit(port) => port,
        PortSpec::Unparseable => return Err(FilterReason::PortNotAllowed),
    };
    if port == always_allowed_port {
        return Ok(());
    }
    if port > 1024 && !policy.allow_high_ports {
        return Err(FilterReason::PortNotAllowed);
    }
    if port <= 1024 && !policy.allow_low_ports {
        return Err(FilterReason::PortNotAllowed);
    }
    Ok(())
}

fn ip_literal_filter(host: &str, policy: &PolicyConfig) -> Result<(), FilterReason> {
    if policy.block_ips && host.parse::<IpAddr>().is_ok() {
        Err(FilterReason::IpLiteral)
    } else {
        Ok(())
    }
}

fn block_list_filter(host: &str, policy: &PolicyConfig) -> Result<(), FilterReason> {
    if policy.block_list.get(host) {
        return Err(FilterReason::InterfaceBlockList);
    }
    if let Some(global) = &policy.global_block_list {
        if global.get(host) {
            return Err(FilterReason::GlobalBlockList);
        }
    }
    Ok(())
}

/// Result of splitting and resolving a request's destination authority,
/// reused across the filter steps below.
pub struct Destination {
    pub host: String,
    pub resolved: Option<IpAddr>,
}

impl Destination {
    pub async fn parse(authority: &str) -> (Self, PortSpecHandle) {
        let (host, spec) = split_authority(authority);
        let resolved = resolve_host(&host).await;
        (Self { host, resolved }, PortSpecHandle(spec))
    }
}

/// Opaque wrapper so callers can't construct or inspect `PortSpec` directly;
/// it only exists to be handed back into `evaluate`.
pub struct PortSpecHandle(PortSpec);

/// Runs the full six-step filter chain in the fixed order from spec §4.2.
/// Used identically for plain HTTP requests (`always_allowed_port = 80`) and
/// for CONNECT (`always_allowed_port = 443`); `method` is the request method
/// for HTTP or the literal `"CONNECT"` for the CONNECT pipeline.
///
/// The CONNECT paragraph in the upstream description only calls out the
/// local-destination/method/port/IP-literal steps explicitly, but the
/// block-list invariant and the transparent-TLS scenario both require a
/// CONNECT to `blocked.example` to be rejected by the block-list, so both
/// entry points share this one chain.
pub fn evaluate(
    destination: &Destination,
    port_spec: PortSpecHandle,
    method: &str,
    always_allowed_port: u16,
    policy: &PolicyConfig,
) -> Result<(), FilterReason> {
    local_destination_filter(destination.resolved, policy)?;
    method_filter(method, policy)?;
    port_filter(port_spec.0, always_allowed_port, policy)?;
    ip_literal_filter(&destination.host, policy)?;
    block_list_filter(&destination.host, policy)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow_high: bool, allow_low: bool) -> PolicyConfig {
        PolicyConfig {
            port: 3128,
            allow_high_ports: allow_high,
            allow_low_ports: allow_low,
            block_ips: false,
            block_local_services: false,
            local_ips: HashSet::new(),
            direct_networks: Vec::new(),
            allowed_methods: ["GET", "HEAD", "CONNECT"].map(String::from).into(),
            block_list: DomainTrie::new(false),
            block_by_idn: false,
            http_transparent: false,
            https_transparent_port: 3129,
            global_block_list: None,
        }
    }

    #[tokio::test]
    async fn port_80_exempt_even_when_low_ports_blocked() {
        let policy = policy(false, false);
        let (dest, spec) = Destination::parse("example.com:80").await;
        assert!(evaluate(&dest, spec, "GET", 80, &policy).is_ok());
    }

    #[tokio::test]
    async fn connect_443_exempt_even_when_high_ports_blocked() {
        let policy = policy(false, false);
        let (dest, spec) = Destination::parse("example.com:443").await;
        assert!(evaluate(&dest, spec, "CONNECT", 443, &policy).is_ok());
    }

    #[tokio::test]
    async fn connect_8443_blocked_without_high_ports() {
        let policy = policy(false, false);
        let (dest, spec) = Destination::parse("example.com:8443").await;
        let err = evaluate(&dest, spec, "CONNECT", 443, &policy).unwrap_err();
        assert_eq!(err, FilterReason::PortNotAllowed);
    }

    #[tokio::test]
    async fn unparseable_port_is_blocked() {
        let policy = policy(true, true);
        let (dest, spec) = Destination::parse("example.com:notaport").await;
        let err = evaluate(&dest, spec, "GET", 80, &policy).unwrap_err();
        assert_eq!(err, FilterReason::PortNotAllowed);
    }

    #[tokio::test]
    async fn interface_block_list_wins_over_global() {
        let mut policy = policy(true, true);
        policy.block_list = DomainTrie::from_patterns(["ads.example"], false);
        policy.global_block_list = Some(Arc::new(DomainTrie::from_patterns(
            ["ads.example"],
            false,
        )));
        let (dest, spec) = Destination::parse("ads.example:80").await;
        let err = evaluate(&dest, spec, "GET", 80, &policy).unwrap_err();
        assert_eq!(err, FilterReason::InterfaceBlockList);
    }

    #[tokio::test]
    async fn global_block_list_applies_when_interface_list_silent() {
        let mut policy = policy(true, true);
        policy.global_block_list = Some(Arc::new(DomainTrie::from_patterns(
            ["tracker.example"],
            false,
        )));
        let (dest, spec) = Destination::parse("tracker.example:80").await;
        let err = evaluate(&dest, spec, "GET", 80, &policy).unwrap_err();
        assert_eq!(err, FilterReason::GlobalBlockList);
    }

    #[tokio::test]
    async fn method_not_in_allowed_set_is_rejected() {
        let policy = policy(true, true);
        let (dest, spec) = Destination::parse("example.com:80").await;
        let err = evaluate(&dest, spec, "DELETE", 80, &policy).unwrap_err();
        assert_eq!(err, FilterReason::MethodNotAllowed);
    }
}
