//! SOCKS5 TCP CONNECT + UDP ASSOCIATE ingress (§6).
//!
//! No-auth only (`METHOD 0x00`); a deployment needing username/password auth
//! is a config-schema concern outside this core's scope (§1).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::dispatcher::{Dispatcher, UdpResponder};
use crate::error::IngressError;
use crate::metadata::{InboundType, Metadata, Network};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

pub struct Socks5Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Socks5Listener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, IngressError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| IngressError::Bind { addr: addr.to_string(), source })?;
        let local_addr = listener.local_addr()?;
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self, dispatcher: Arc<Dispatcher>) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(cause = %err, "socks5 ingress: accept failed");
                    continue;
                }
            };
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer, &dispatcher).await {
                    debug!(cause = %err, peer = %peer, "socks5 ingress: connection dropped");
                }
            });
        }
    }
}

enum Destination {
    Addr(IpAddr),
    Domain(String),
}

async fn read_destination(stream: &mut TcpStream, atyp: u8) -> Result<Destination, IngressError> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            Ok(Destination::Addr(Ipv4Addr::from(buf).into()))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            Ok(Destination::Addr(Ipv6Addr::from(buf).into()))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let mut domain = vec![0u8; len_buf[0] as usize];
            stream.read_exact(&mut domain).await?;
            Ok(Destination::Domain(String::from_utf8_lossy(&domain).into_owned()))
        }
        other => Err(IngressError::Malformed(format!("unsupported ATYP {other}"))),
    }
}

fn success_reply(bound: SocketAddr) -> Vec<u8> {
    reply(REPLY_SUCCEEDED, bound)
}

fn reply(code: u8, bound: SocketAddr) -> Vec<u8> {
    let mut out = vec![VERSION, code, 0x00];
    match bound.ip() {
        IpAddr::V4(v4) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&bound.port().to_be_bytes());
    out
}

pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: &Arc<Dispatcher>,
) -> Result<(), IngressError> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != VERSION {
        return Err(IngressError::Malformed(format!("unsupported SOCKS version {}", greeting[0])));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut request_head = [0u8; 4];
    stream.read_exact(&mut request_head).await?;
    let cmd = request_head[1];
    let atyp = request_head[3];
    let destination = read_destination(&mut stream, atyp).await?;
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    match cmd {
        CMD_CONNECT => {
            let local = stream.local_addr().unwrap_or(peer);
            stream.write_all(&success_reply(local)).await?;
            let metadata = match destination {
                Destination::Addr(ip) => {
                    Metadata::with_ip(Network::Tcp, ip, port, peer.ip(), peer.port(), InboundType::Socks)
                }
                Destination::Domain(host) => {
                    Metadata::with_host(Network::Tcp, host, port, peer.ip(), peer.port(), InboundType::Socks)
                }
            };
            dispatcher.add_tcp(stream, metadata);
            Ok(())
        }
        CMD_UDP_ASSOCIATE => {
            let udp = UdpSocket::bind(SocketAddr::new(stream.local_addr().map(|a| a.ip()).unwrap_or(peer.ip()), 0))
                .await?;
            let bound = udp.local_addr()?;
            stream.write_all(&success_reply(bound)).await?;
            run_udp_associate(stream, udp, peer, dispatcher.clone()).await
        }
        _ => {
            let local = stream.local_addr().unwrap_or(peer);
            stream.write_all(&reply(REPLY_COMMAND_NOT_SUPPORTED, local)).await?;
            Err(IngressError::Malformed(format!("unsupported SOCKS5 command {cmd}")))
        }
    }
}

/// Parses a SOCKS5 UDP request header (`RSV(2) FRAG(1) ATYP ADDR PORT`)
/// prefixing the datagram payload. Fragmented requests (`FRAG != 0`) are
/// dropped — reassembly is out of this core's scope (§1 non-goal: not a
/// full TCP/IP stack implementation).
fn parse_udp_request(data: &[u8]) -> Option<(Destination, u16, usize)> {
    if data.len() < 4 || data[2] != 0 {
        return None;
    }
    let atyp = data[3];
    let mut offset = 4;
    let destination = match atyp {
        ATYP_IPV4 => {
            if data.len() < offset + 4 {
                return None;
            }
            let addr = Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3]);
            offset += 4;
            Destination::Addr(addr.into())
        }
        ATYP_IPV6 => {
            if data.len() < offset + 16 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[offset..offset + 16]);
            offset += 16;
            Destination::Addr(Ipv6Addr::from(octets).into())
        }
        ATYP_DOMAIN => {
            let len = *data.get(offset)? as usize;
            offset += 1;
            if data.len() < offset + len {
                return None;
            }
            let domain = String::from_utf8_lossy(&data[offset..offset + len]).into_owned();
            offset += len;
            Destination::Domain(domain)
        }
        _ => return None,
    };
    if data.len() < offset + 2 {
        return None;
    }
    let port = u16::from_be_bytes([data[offset], data[offset + 1]]);
    offset += 2;
    Some((destination, port, offset))
}

struct Socks5UdpResponder {
    socket: Arc<UdpSocket>,
}

impl UdpResponder for Socks5UdpResponder {
    fn send(&self, payload: &[u8], to: SocketAddr, from: SocketAddr) {
        let mut framed = vec![0x00, 0x00, 0x00];
        match from.ip() {
            IpAddr::V4(v4) => {
                framed.push(ATYP_IPV4);
                framed.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                framed.push(ATYP_IPV6);
                framed.extend_from_slice(&v6.octets());
            }
        }
        framed.extend_from_slice(&from.port().to_be_bytes());
        framed.extend_from_slice(payload);
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let _ = socket.send_to(&framed, to).await;
        });
    }
}

/// Drives one UDP ASSOCIATE session: relays client datagrams arriving on
/// `udp` into the dispatcher, and tears down as soon as the control TCP
/// connection (`stream`) closes, per the SOCKS5 RFC's "the UDP association
/// terminates when the TCP connection terminates" rule.
async fn run_udp_associate(
    mut stream: TcpStream,
    udp: UdpSocket,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), IngressError> {
    let udp = Arc::new(udp);
    let responder: Arc<dyn UdpResponder> = Arc::new(Socks5UdpResponder { socket: udp.clone() });
    let mut buf = vec![0u8; 64 * 1024];
    let mut control_buf = [0u8; 1];
    loop {
        tokio::select! {
            result = udp.recv_from(&mut buf) => {
                let (n, src) = result?;
                if src.ip() != peer.ip() {
                    continue;
                }
                if let Some((destination, port, payload_start)) = parse_udp_request(&buf[..n]) {
                    let metadata = match destination {
                        Destination::Addr(ip) => {
                            Metadata::with_ip(Network::Udp, ip, port, src.ip(), src.port(), InboundType::Socks)
                        }
                        Destination::Domain(host) => {
                            Metadata::with_host(Network::Udp, host, port, src.ip(), src.port(), InboundType::Socks)
                        }
                    };
                    dispatcher
                        .handle_udp_packet(src, &buf[payload_start..n], metadata, responder.clone())
                        .await;
                }
            }
            result = stream.read(&mut control_buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_domain_udp_request() {
        let mut data = vec![0x00, 0x00, 0x00, ATYP_DOMAIN, 11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&53u16.to_be_bytes());
        data.extend_from_slice(b"payload");
        let (destination, port, offset) = parse_udp_request(&data).unwrap();
        assert!(matches!(destination, Destination::Domain(ref h) if h == "example.com"));
        assert_eq!(port, 53);
        assert_eq!(&data[offset..], b"payload");
    }

    #[test]
    fn rejects_fragmented_udp_request() {
        let data = vec![0x00, 0x00, 0x01, ATYP_IPV4, 1, 2, 3, 4, 0, 53];
        assert!(parse_udp_request(&data).is_none());
    }

    #[test]
    fn success_reply_encodes_ipv4_bound_address() {
        let bound: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let reply = success_reply(bound);
        assert_eq!(reply[0], VERSION);
        assert_eq!(reply[1], REPLY_SUCCEEDED);
        assert_eq!(reply[3], ATYP_IPV4);
    }
}
