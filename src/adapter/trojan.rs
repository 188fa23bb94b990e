use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::{encode_socks5_addr, Adapter, AdapterType, Conn, StreamConn};
use crate::error::DialError;
use crate::metadata::Metadata;

/// XTLS flow variants per §4.1. `None` means the stream connection did not
/// negotiate XTLS at all (plain TLS / gRPC path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XtlsFlow {
    None,
    /// `xtls-rprx-direct`: command byte `XRD`.
    RprxDirect,
    /// `xtls-rprx-origin`: command byte `XRO`.
    RprxOrigin,
}

impl XtlsFlow {
    fn command_byte(self) -> Option<u8> {
        match self {
            XtlsFlow::None => None,
            XtlsFlow::RprxDirect => Some(b'D'), // XRD
            XtlsFlow::RprxOrigin => Some(b'O'), // XRO
        }
    }
}

/// Trojan outbound, TCP mode. gRPC-tunnelled mode (multiplexing over one
/// HTTP/2 transport per dial) is a distinct `StreamConn` implementation
/// supplied by the caller; this adapter's header-framing logic is identical
/// either way.
pub struct Trojan {
    name: String,
    server: String,
    port: u16,
    stream_conn: Arc<dyn StreamConn>,
    flow: XtlsFlow,
}

impl Trojan {
    pub fn new(
        name: impl Into<String>,
        server: impl Into<String>,
        port: u16,
        stream_conn: Arc<dyn StreamConn>,
        flow: XtlsFlow,
    ) -> Self {
        Self { name: name.into(), server: server.into(), port, stream_conn, flow }
    }
}

#[async_trait]
impl Adapter for Trojan {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Trojan
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError> {
        use crate::metadata::Network;

        // §4.1: "disallow UDP on port 443 under XRD/XRO."
        if metadata.network == Network::Udp && metadata.dst_port == 443 && self.flow != XtlsFlow::None {
            return Err(DialError::XtlsUdpForbidden);
        }

        let target = self.addr();
        let raw = TcpStream::connect(&target).await.map_err(|source| DialError::Io {
            adapter: self.name.clone(),
            host: target.clone(),
            port: self.port,
            source,
        })?;
        let mut stream = self
            .stream_conn
            .wrap(Box::pin(raw))
            .await
            .map_err(|_| DialError::Handshake(self.name.clone(), "TLS/XTLS handshake failed".into()))?;

        // §9: query the returned connection's capability rather than downcast.
        let negotiated_xtls = self.stream_conn.is_xtls();

        let mut header = Vec::new();
        if negotiated_xtls {
            if let Some(cmd) = self.flow.command_byte() {
                header.push(cmd);
            }
        }
        header.extend_from_slice(&encode_socks5_addr(metadata));

        stream
            .write_all(&header)
            .await
            .map_err(|source| DialError::Io { adapter: self.name.clone(), host: target, port: self.port, source })?;

        Ok(Conn { chain: vec![self.name.clone()], inner: stream })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PlainStreamConn;
    use crate::metadata::{InboundType, Network};
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn xtls_forbids_udp_on_port_443() {
        let trojan = Trojan::new("t", "example.com", 443, Arc::new(PlainStreamConn), XtlsFlow::RprxDirect);
        let md = Metadata::with_host(Network::Udp, "example.com", 443, Ipv4Addr::LOCALHOST.into(), 1, InboundType::Socks);
        let result = trojan.dial_context(&md).await;
        assert!(matches!(result, Err(DialError::XtlsUdpForbidden)));
    }
}
