//! Raw IP/TCP/UDP frame construction for the TUN stack: resets for rejected
//! flows and synthesized UDP replies injected back into the device (§4.7).

use super::checksum;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Builds a TCP RST+ACK from `server` back to `client`, acknowledging
/// whatever the client last sent, for flows the dispatcher refuses to dial.
pub fn build_tcp_reset(
    client: IpAddr,
    server: IpAddr,
    client_port: u16,
    server_port: u16,
    seq_ack: u32,
) -> Option<Vec<u8>> {
    match (client, server) {
        (IpAddr::V4(client), IpAddr::V4(server)) => Some(build_ipv4_tcp_reset(
            client,
            server,
            client_port,
            server_port,
            seq_ack,
        )),
        (IpAddr::V6(client), IpAddr::V6(server)) => Some(build_ipv6_tcp_reset(
            client,
            server,
            client_port,
            server_port,
            seq_ack,
        )),
        _ => None,
    }
}

fn build_ipv4_tcp_reset(
    client: Ipv4Addr,
    server: Ipv4Addr,
    client_port: u16,
    server_port: u16,
    seq_ack: u32,
) -> Vec<u8> {
    const IPV4_HEADER_LEN: usize = 20;
    const TCP_HEADER_LEN: usize = 20;
    let total_len = IPV4_HEADER_LEN + TCP_HEADER_LEN;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x45;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[8] = 64; // TTL
    buffer[9] = 6; // TCP
    buffer[12..16].copy_from_slice(&server.octets());
    buffer[16..20].copy_from_slice(&client.octets());

    let offset = IPV4_HEADER_LEN;
    buffer[offset..offset + 2].copy_from_slice(&server_port.to_be_bytes());
    buffer[offset + 2..offset + 4].copy_from_slice(&client_port.to_be_bytes());
    buffer[offset + 4..offset + 8].copy_from_slice(&0u32.to_be_bytes());
    buffer[offset + 8..offset + 12].copy_from_slice(&seq_ack.to_be_bytes());
    buffer[offset + 12] = 5 << 4; // data offset
    buffer[offset + 13] = 0x14; // RST | ACK

    let tcp_checksum = checksum::tcp_ipv4(server, client, &buffer[offset..]);
    buffer[offset + 16..offset + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    let ip_checksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    buffer
}

fn build_ipv6_tcp_reset(
    client: Ipv6Addr,
    server: Ipv6Addr,
    client_port: u16,
    server_port: u16,
    seq_ack: u32,
) -> Vec<u8> {
    const IPV6_HEADER_LEN: usize = 40;
    const TCP_HEADER_LEN: usize = 20;
    let mut buffer = vec![0u8; IPV6_HEADER_LEN + TCP_HEADER_LEN];

    buffer[0] = 0x60;
    buffer[4..6].copy_from_slice(&(TCP_HEADER_LEN as u16).to_be_bytes());
    buffer[6] = 6; // TCP
    buffer[7] = 64;
    buffer[8..24].copy_from_slice(&server.octets());
    buffer[24..40].copy_from_slice(&client.octets());

    let offset = IPV6_HEADER_LEN;
    buffer[offset..offset + 2].copy_from_slice(&server_port.to_be_bytes());
    buffer[offset + 2..offset + 4].copy_from_slice(&client_port.to_be_bytes());
    buffer[offset + 8..offset + 12].copy_from_slice(&seq_ack.to_be_bytes());
    buffer[offset + 12] = 5 << 4;
    buffer[offset + 13] = 0x14; // RST | ACK

    let tcp_checksum = checksum::tcp_ipv6(server, client, &buffer[offset..]);
    buffer[offset + 16..offset + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    buffer
}

/// Builds a UDP datagram from `src` to `dst`, used to relay a remote UDP
/// reply back through the TUN device without a smoltcp socket round-trip.
pub fn build_udp_response(
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
    payload: &[u8],
) -> Option<Vec<u8>> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            Some(build_ipv4_udp(src, src_port, dst, dst_port, payload))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            Some(build_ipv6_udp(src, src_port, dst, dst_port, payload))
        }
        _ => None,
    }
}

fn build_ipv4_udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    const IPV4_HEADER_LEN: usize = 20;
    const UDP_HEADER_LEN: usize = 8;
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x45;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[8] = 64;
    buffer[9] = 17; // UDP
    buffer[12..16].copy_from_slice(&src.octets());
    buffer[16..20].copy_from_slice(&dst.octets());

    let udp_offset = IPV4_HEADER_LEN;
    buffer[udp_offset..udp_offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp_offset + 2..udp_offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[udp_offset + 4..udp_offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp_offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv4(src, dst, &buffer[udp_offset..]);
    buffer[udp_offset + 6..udp_offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());
    let ip_checksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    buffer
}

fn build_ipv6_udp(src: Ipv6Addr, src_port: u16, dst: Ipv6Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    const IPV6_HEADER_LEN: usize = 40;
    const UDP_HEADER_LEN: usize = 8;
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buffer = vec![0u8; IPV6_HEADER_LEN + udp_len];

    buffer[0] = 0x60;
    buffer[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[6] = 17;
    buffer[7] = 64;
    buffer[8..24].copy_from_slice(&src.octets());
    buffer[24..40].copy_from_slice(&dst.octets());

    let udp_offset = IPV6_HEADER_LEN;
    buffer[udp_offset..udp_offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp_offset + 2..udp_offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[udp_offset + 4..udp_offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp_offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv6(src, dst, &buffer[udp_offset..]);
    buffer[udp_offset + 6..udp_offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_response_round_trips_port_and_payload() {
        let frame = build_udp_response(
            "198.18.0.2".parse().unwrap(),
            53,
            "10.0.0.2".parse().unwrap(),
            40000,
            b"hello",
        )
        .unwrap();
        assert_eq!(frame[9], 17);
        let udp_offset = 20;
        assert_eq!(u16::from_be_bytes([frame[udp_offset], frame[udp_offset + 1]]), 53);
        assert_eq!(&frame[udp_offset + 8..], b"hello");
    }
}
