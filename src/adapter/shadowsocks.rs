use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::{encode_socks5_addr, Adapter, AdapterType, Conn, StreamConn};
use crate::error::DialError;
use crate::metadata::Metadata;

/// Shadowsocks outbound: TCP to the configured remote, a cipher-handshake
/// `StreamConn` (opaque per §1), then a SOCKS5-address-form header.
pub struct Shadowsocks {
    name: String,
    server: String,
    port: u16,
    stream_conn: Arc<dyn StreamConn>,
}

impl Shadowsocks {
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16, stream_conn: Arc<dyn StreamConn>) -> Self {
        Self { name: name.into(), server: server.into(), port, stream_conn }
    }
}

#[async_trait]
impl Adapter for Shadowsocks {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Shadowsocks
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError> {
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
            .map_err(|_| DialError::Handshake(self.name.clone(), "cipher handshake failed".into()))?;

        let header = encode_socks5_addr(metadata);
        stream
            .write_all(&header)
            .await
            .map_err(|source| DialError::Io { adapter: self.name.clone(), host: target, port: self.port, source })?;

        Ok(Conn { chain: vec![self.name.clone()], inner: stream })
    }
}
