//! SOCKS5-address-form destination encoding, shared by the Shadowsocks,
//! Trojan, and VMess header writers (§4.1: "write a protocol-specific header
//! encoding the destination in SOCKS5-address form").

use crate::metadata::{AddrType, Metadata};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Encodes `metadata`'s destination as `[atyp][addr][port-be]`.
pub fn encode_socks5_addr(metadata: &Metadata) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    match metadata.addr_type {
        AddrType::DomainName => {
            out.push(ATYP_DOMAIN);
            let host = metadata.host.as_bytes();
            out.push(host.len() as u8);
            out.extend_from_slice(host);
        }
        AddrType::Ipv4 => {
            out.push(ATYP_IPV4);
            if let Some(std::net::IpAddr::V4(ip)) = metadata.dst_ip {
                out.extend_from_slice(&ip.octets());
            } else {
                out.extend_from_slice(&[0u8; 4]);
            }
        }
        AddrType::Ipv6 => {
            out.push(ATYP_IPV6);
            if let Some(std::net::IpAddr::V6(ip)) = metadata.dst_ip {
                out.extend_from_slice(&ip.octets());
            } else {
                out.extend_from_slice(&[0u8; 16]);
            }
        }
    }
    out.extend_from_slice(&metadata.dst_port.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{InboundType, Network};
    use std::net::Ipv4Addr;

    #[test]
    fn encodes_domain_destination() {
        let md = Metadata::with_host(Network::Tcp, "example.com", 443, Ipv4Addr::LOCALHOST.into(), 1, InboundType::Http);
        let encoded = encode_socks5_addr(&md);
        assert_eq!(encoded[0], ATYP_DOMAIN);
        assert_eq!(encoded[1] as usize, "example.com".len());
        assert_eq!(&encoded[encoded.len() - 2..], &443u16.to_be_bytes());
    }

    #[test]
    fn encodes_ipv4_destination() {
        let md = Metadata::with_ip(Network::Tcp, Ipv4Addr::new(1, 2, 3, 4).into(), 80, Ipv4Addr::LOCALHOST.into(), 1, InboundType::Http);
        let encoded = encode_socks5_addr(&md);
        assert_eq!(encoded[0], ATYP_IPV4);
        assert_eq!(&encoded[1..5], &[1, 2, 3, 4]);
    }
}
