//! Per-flow descriptor threaded from ingress through the rule engine to dial.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrType {
    Ipv4,
    Ipv6,
    DomainName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundType {
    Http,
    Socks,
    Redir,
    TProxy,
    Mixed,
    Tun,
    TcpTun,
    Shadowsocks,
}

/// Carries addressing and process info for one flow.
///
/// Invariant: `host` is non-empty or `dst_ip` is `Some`.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub network: Network,
    pub addr_type: AddrType,
    pub host: String,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub inbound_type: InboundType,
    pub process_path: Option<String>,
    /// Set once a rule triggers DNS resolution to fill `dst_ip` from `host`.
    /// Diagnostic only; never consulted by rule matching itself.
    pub dns_resolved: bool,
}

impl Metadata {
    /// Builds metadata for a host-addressed (domain name) destination.
    pub fn with_host(
        network: Network,
        host: impl Into<String>,
        dst_port: u16,
        src_ip: IpAddr,
        src_port: u16,
        inbound_type: InboundType,
    ) -> Self {
        Self {
            network,
            addr_type: AddrType::DomainName,
            host: host.into(),
            dst_ip: None,
            dst_port,
            src_ip,
            src_port,
            inbound_type,
            process_path: None,
            dns_resolved: false,
        }
    }

    /// Builds metadata for an IP-addressed destination.
    pub fn with_ip(
        network: Network,
        dst_ip: IpAddr,
        dst_port: u16,
        src_ip: IpAddr,
        src_port: u16,
        inbound_type: InboundType,
    ) -> Self {
        Self {
            network,
            addr_type: if dst_ip.is_ipv4() { AddrType::Ipv4 } else { AddrType::Ipv6 },
            host: String::new(),
            dst_ip: Some(dst_ip),
            dst_port,
            src_ip,
            src_port,
            inbound_type,
            process_path: None,
            dns_resolved: false,
        }
    }

    pub fn has_valid_destination(&self) -> bool {
        !self.host.is_empty() || self.dst_ip.is_some()
    }

    /// The string the rule engine matches domain rules against; falls back
    /// to the dotted IP when only `dst_ip` is known.
    pub fn host_or_ip_string(&self) -> String {
        if !self.host.is_empty() {
            self.host.clone()
        } else {
            self.dst_ip.map(|ip| ip.to_string()).unwrap_or_default()
        }
    }
}
