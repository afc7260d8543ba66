//! Bind address resolution and advertised URLs.

use crate::error::{ListenerError, ListenerResult};
use docsync_replicator::EndpointUrl;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

/// A local interface address: interface name and IP.
type InterfaceAddress = (String, IpAddr);

/// Lists the addresses of the host's network interfaces.
fn interface_addresses() -> Vec<InterfaceAddress> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .map(|iface| {
                let ip = iface.ip();
                (iface.name, ip)
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to list network interfaces");
            Vec::new()
        }
    }
}

/// Resolves the configured interface to the address to bind.
///
/// `interface` may be an IP address, an interface name (`eth0`, `lo`) or a
/// host name. None binds every interface.
pub(crate) fn bind_address(interface: Option<&str>, port: u16) -> ListenerResult<SocketAddr> {
    let Some(interface) = interface else {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    };
    if let Ok(ip) = interface.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    if let Some(ip) = address_of_interface(interface, &interface_addresses()) {
        return Ok(SocketAddr::new(ip, port));
    }
    (interface, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| {
            ListenerError::InvalidConfiguration(format!("unknown network interface {interface:?}"))
        })
}

/// Picks the address of a named interface, preferring IPv4.
fn address_of_interface(name: &str, addresses: &[InterfaceAddress]) -> Option<IpAddr> {
    let mut candidates: Vec<IpAddr> = addresses
        .iter()
        .filter(|(iface, ip)| iface == name && usable(*ip))
        .map(|(_, ip)| *ip)
        .collect();
    candidates.sort_by_key(IpAddr::is_ipv6);
    candidates.first().copied()
}

fn usable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_unspecified() && !v4.is_link_local(),
        // fe80::/10
        IpAddr::V6(v6) => !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

/// Addresses a listener bound to `bound` can be reached at.
pub(crate) fn reachable_addresses(bound: IpAddr) -> Vec<IpAddr> {
    if !bound.is_unspecified() {
        return vec![bound];
    }
    let interfaces = interface_addresses();
    select_addresses(bound, interfaces.into_iter().map(|(_, ip)| ip))
}

/// Loopback first, then one entry per usable interface address. An IPv4
/// wildcard only accepts IPv4 connections, so IPv6 addresses are skipped.
fn select_addresses(bound: IpAddr, candidates: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut addresses = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    for ip in candidates {
        if ip.is_loopback() || !usable(ip) || (bound.is_ipv4() && ip.is_ipv6()) {
            continue;
        }
        if !addresses.contains(&ip) {
            addresses.push(ip);
        }
    }
    addresses
}

/// Builds the advertised URLs of a listener.
pub(crate) fn listener_urls(bound: SocketAddr, tls: bool, database: &str) -> Vec<EndpointUrl> {
    reachable_addresses(bound.ip())
        .into_iter()
        .map(|ip| EndpointUrl::new(tls, ip.to_string(), bound.port(), database))
        .collect()
}
