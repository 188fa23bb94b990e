use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{Adapter, AdapterType, Conn};
use crate::error::DialError;
use crate::metadata::Metadata;

/// Dials out through an upstream HTTP CONNECT proxy.
pub struct HttpProxy {
    name: String,
    server: String,
    port: u16,
}

impl HttpProxy {
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Self { name: name.into(), server: server.into(), port }
    }
}

#[async_trait]
impl Adapter for HttpProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Http
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError> {
        let proxy_addr = self.addr();
        let mut stream = TcpStream::connect(&proxy_addr).await.map_err(|source| DialError::Io {
            adapter: self.name.clone(),
            host: proxy_addr.clone(),
            port: self.port,
            source,
        })?;

        let target = format!("{}:{}", metadata.host_or_ip_string(), metadata.dst_port);
        let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        stream.write_all(request.as_bytes()).await.map_err(|source| DialError::Io {
            adapter: self.name.clone(),
            host: proxy_addr.clone(),
            port: self.port,
            source,
        })?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await.map_err(|source| DialError::Io {
            adapter: self.name.clone(),
            host: proxy_addr.clone(),
            port: self.port,
            source,
        })?;
        if !status_line.contains("200") {
            return Err(DialError::Handshake(self.name.clone(), format!("CONNECT rejected: {}", status_line.trim())));
        }
        // Drain the rest of the response headers.
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|source| DialError::Io { adapter: self.name.clone(), host: proxy_addr.clone(), port: self.port, source })?;
            if n == 0 || line == "\r\n" {
                break;
            }
        }

        Ok(Conn::new(&self.name, reader.into_inner()))
    }
}
