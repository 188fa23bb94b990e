//! HTTP CONNECT/HTTP proxy ingress (§6).
//!
//! A plain `TcpListener` accept loop, one of several parallel ingress
//! surfaces feeding the same [`Dispatcher`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::error::IngressError;
use crate::metadata::{InboundType, Metadata, Network};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_HEADER_LINES: usize = 128;

pub struct HttpListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl HttpListener {
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

    /// Accept loop: one task per connection, forever, until the listener
    /// (and thus the underlying socket) is dropped.
    pub async fn serve(self, dispatcher: Arc<Dispatcher>) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(cause = %err, "http ingress: accept failed");
                    continue;
                }
            };
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer, &dispatcher).await {
                    debug!(cause = %err, peer = %peer, "http ingress: connection dropped");
                }
            });
        }
    }
}

struct ParsedRequest {
    method: String,
    target: String,
    header_bytes: Vec<u8>,
}

async fn read_request_head(stream: &mut BufReader<TcpStream>) -> Result<ParsedRequest, IngressError> {
    let mut header_bytes = Vec::new();
    let mut request_line = String::new();
    let n = stream.read_line(&mut request_line).await?;
    if n == 0 {
        return Err(IngressError::Malformed("empty request".into()));
    }
    header_bytes.extend_from_slice(request_line.as_bytes());

    let mut parts = request_line.trim_end().splitn(3, ' ');
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    if method.is_empty() || target.is_empty() {
        return Err(IngressError::Malformed(format!("bad request line: {request_line:?}")));
    }

    for _ in 0..MAX_HEADER_LINES {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(IngressError::Malformed("connection closed mid-headers".into()));
        }
        header_bytes.extend_from_slice(line.as_bytes());
        if header_bytes.len() > MAX_HEADER_BYTES {
            return Err(IngressError::Malformed("headers too large".into()));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    Ok(ParsedRequest { method, target, header_bytes })
}

fn header_value<'a>(head: &'a [u8], name: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(head).ok()?;
    let prefix = format!("{name}:");
    text.lines().find_map(|line| {
        if line.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase()) {
            Some(line.splitn(2, ':').nth(1)?.trim())
        } else {
            None
        }
    })
}

/// Splits a `host:port` or bare `host` authority into its parts, applying
/// `default_port` when no port is present.
fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(stripped) = authority.strip_prefix('[') {
        // IPv6 literal: `[::1]:8080`
        let (host, rest) = stripped.split_once(']')?;
        let port = rest.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(default_port);
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => port.parse().ok().map(|p| (host.to_string(), p)),
        None => Some((authority.to_string(), default_port)),
    }
}

pub(crate) async fn handle_connection(stream: TcpStream, peer: SocketAddr, dispatcher: &Arc<Dispatcher>) -> Result<(), IngressError> {
    let mut reader = BufReader::new(stream);
    let request = read_request_head(&mut reader).await?;

    if request.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(&request.target, 443)
            .ok_or_else(|| IngressError::Malformed(format!("bad CONNECT target: {}", request.target)))?;
        let mut stream = reader.into_inner();
        stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
        let metadata = Metadata::with_host(Network::Tcp, host, port, peer.ip(), peer.port(), InboundType::Http);
        dispatcher.add_tcp(stream, metadata);
        return Ok(());
    }

    // Plain proxy request: absolute-form target (`http://host[:port]/path`)
    // or a relative target plus a `Host:` header. Rewrite the request line
    // to origin-form and replay headers verbatim — this core doesn't
    // rewrite/inspect the body or any other headers.
    let (host, port, origin_form_target) = if let Some(rest) = request.target.strip_prefix("http://") {
        let (authority, path) = rest.split_once('/').map(|(a, p)| (a, format!("/{p}"))).unwrap_or((rest, "/".to_string()));
        let (host, port) = split_authority(authority, 80)
            .ok_or_else(|| IngressError::Malformed(format!("bad absolute-form target: {}", request.target)))?;
        (host, port, path)
    } else {
        let host_header = header_value(&request.header_bytes, "host")
            .ok_or_else(|| IngressError::Malformed("no Host header and no absolute-form target".into()))?;
        let (host, port) = split_authority(host_header, 80)
            .ok_or_else(|| IngressError::Malformed(format!("bad Host header: {host_header}")))?;
        (host, port, request.target.clone())
    };

    let mut preface = format!("{} {} HTTP/1.1\r\n", request.method, origin_form_target).into_bytes();
    // Re-emit every header line after the request line verbatim.
    let first_line_end = request.header_bytes.iter().position(|&b| b == b'\n').map(|i| i + 1).unwrap_or(0);
    preface.extend_from_slice(&request.header_bytes[first_line_end..]);

    let stream = reader.into_inner();
    let metadata = Metadata::with_host(Network::Tcp, host, port, peer.ip(), peer.port(), InboundType::Http);
    dispatcher.add_tcp_with_preface(stream, metadata, preface);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_authority_applies_default_port() {
        assert_eq!(split_authority("example.com", 443), Some(("example.com".to_string(), 443)));
        assert_eq!(split_authority("example.com:8080", 443), Some(("example.com".to_string(), 8080)));
    }

    #[test]
    fn split_authority_handles_ipv6_literal() {
        assert_eq!(split_authority("[::1]:8080", 80), Some(("::1".to_string(), 8080)));
        assert_eq!(split_authority("[::1]", 80), Some(("::1".to_string(), 80)));
    }

    #[test]
    fn header_value_is_case_insensitive() {
        let head = b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        assert_eq!(header_value(head, "host"), Some("example.com:8080"));
    }
}
