//! Host address discovery

use nix::ifaddrs::getifaddrs;
use std::net::Ipv4Addr;
use tracing::warn;

/// Every non-loopback IPv4 address of this host.
///
/// Used for the SANs of the self-signed certificate and as the default
/// DNS redirect target.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Failed to enumerate interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for ifaddr in addrs {
        if let Some(address) = ifaddr.address
            && let Some(sin) = address.as_sockaddr_in()
        {
            let ip = Ipv4Addr::from(sin.ip());
            if !ip.is_loopback() {
                out.push(ip);
            }
        }
    }
    out
}

/// The address DNS interception advertises when none is configured
pub fn default_redirect_ip() -> Option<Ipv4Addr> {
    local_ipv4_addresses().into_iter().next()
}
