use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};

use super::{Adapter, AdapterType, Conn, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;

/// A UDP association bound to an ephemeral local port, free to send to any
/// peer (direct forwarding does not pin a single remote).
pub struct DirectPacketConn {
    socket: UdpSocket,
    chain: Vec<String>,
}

#[async_trait]
impl PacketConn for DirectPacketConn {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<()> {
        self.socket.send_to(payload, target).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn chain(&self) -> &[String] {
        &self.chain
    }
}

/// Dials `dst_host:dst_port` (or the literal `dst_ip`) via the system
/// resolver, no further framing.
pub struct Direct {
    name: String,
}

impl Direct {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Adapter for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Direct
    }

    fn addr(&self) -> String {
        "direct".to_string()
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError> {
        let target = if !metadata.host.is_empty() {
            format!("{}:{}", metadata.host, metadata.dst_port)
        } else {
            let ip = metadata.dst_ip.expect("metadata invariant: host or dst_ip set");
            format!("{ip}:{}", metadata.dst_port)
        };
        let stream = TcpStream::connect(&target).await.map_err(|source| DialError::Io {
            adapter: self.name.clone(),
            host: target.clone(),
            port: metadata.dst_port,
            source,
        })?;
        Ok(Conn::new(&self.name, stream))
    }

    async fn dial_udp(&self, _metadata: &Metadata) -> Result<Box<dyn PacketConn>, DialError> {
        let bind_addr = "0.0.0.0:0";
        let socket = UdpSocket::bind(bind_addr).await.map_err(|source| DialError::Io {
            adapter: self.name.clone(),
            host: bind_addr.to_string(),
            port: 0,
            source,
        })?;
        Ok(Box::new(DirectPacketConn { socket, chain: vec![self.name.clone()] }))
    }

    fn support_udp(&self) -> bool {
        true
    }
}
