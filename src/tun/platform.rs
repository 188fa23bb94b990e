//! Virtual interface provisioning constants (§4.7): the private `/16` the
//! TUN device gets assigned, the DNS resolver IP carved out of it, and the
//! narrowed public-space route list that keeps traffic destined for
//! private/link-local ranges off the tunnel.

use std::net::Ipv4Addr;
use std::process::Command;

use crate::error::PlatformError;

/// Default private `/16` the TUN interface is addressed from when no
/// override is configured.
pub const DEFAULT_CIDR: (Ipv4Addr, u8) = (Ipv4Addr::new(198, 18, 0, 0), 16);

/// Address handed to the interface itself (first usable host in the block).
pub const INTERFACE_ADDRESS: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 1);

/// DNS resolver IP advertised to the OS so port-53 traffic is captured by
/// the tunnel and answered in-process.
pub const DNS_RESOLVER_ADDRESS: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 2);

/// A route to be installed against the TUN interface: a `(network, prefix)`
/// pair in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

/// The narrowed public-address-space route table (§4.7): this exact list of
/// prefixes covers the public IPv4 space while leaving RFC1918 and
/// link-local ranges routed normally outside the tunnel.
pub fn default_routes() -> Vec<Route> {
    [
        (Ipv4Addr::new(1, 0, 0, 0), 8),
        (Ipv4Addr::new(2, 0, 0, 0), 7),
        (Ipv4Addr::new(4, 0, 0, 0), 6),
        (Ipv4Addr::new(8, 0, 0, 0), 5),
        (Ipv4Addr::new(16, 0, 0, 0), 4),
        (Ipv4Addr::new(32, 0, 0, 0), 3),
        (Ipv4Addr::new(64, 0, 0, 0), 2),
        (Ipv4Addr::new(128, 0, 0, 0), 1),
        (Ipv4Addr::new(224, 0, 0, 0), 4),
        (Ipv4Addr::new(255, 255, 255, 255), 32),
    ]
    .into_iter()
    .map(|(network, prefix)| Route { network, prefix })
    .collect()
}

/// Assigns the interface address and installs [`default_routes`] against
/// `interface_name` via `ip`(8). The only supported path; other platforms
/// have their own route-table tooling (`netsh`, `route`, `ifconfig`/`route`)
/// which this core does not shell out to.
#[cfg(target_os = "linux")]
pub fn configure_interface(interface_name: &str) -> Result<(), PlatformError> {
    let (network, prefix) = DEFAULT_CIDR;
    run_ip(["addr", "add", &format!("{INTERFACE_ADDRESS}/{prefix}"), "dev", interface_name])?;
    run_ip(["link", "set", "dev", interface_name, "up"])?;
    let _ = network;
    for route in default_routes() {
        run_ip([
            "route",
            "add",
            &format!("{}/{}", route.network, route.prefix),
            "dev",
            interface_name,
        ])?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn configure_interface(_interface_name: &str) -> Result<(), PlatformError> {
    Err(PlatformError::Unsupported)
}

#[cfg(target_os = "linux")]
fn run_ip<const N: usize>(args: [&str; N]) -> Result<(), PlatformError> {
    let command = format!("ip {}", args.join(" "));
    let status = Command::new("ip")
        .args(args)
        .status()
        .map_err(|source| PlatformError::Spawn { command: command.clone(), source })?;
    if !status.success() {
        return Err(PlatformError::CommandFailed { command, status });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_routes_has_the_spec_exact_ten_entries() {
        let routes = default_routes();
        assert_eq!(routes.len(), 10);
        assert_eq!(routes[0], Route { network: Ipv4Addr::new(1, 0, 0, 0), prefix: 8 });
        assert_eq!(routes[9], Route { network: Ipv4Addr::new(255, 255, 255, 255), prefix: 32 });
    }
}
