use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Adapter, AdapterType, Conn, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;

/// An always-closed TCP sink; UDP is rejected outright at dial time so a
/// caller never gets as far as registering a NAT entry for it, matching
/// §4.1: "returns an immediately-closed sink for TCP; UDP discards."
pub struct Reject {
    name: String,
}

impl Reject {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

struct ClosedStream;

impl AsyncRead for ClosedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ClosedStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Adapter for Reject {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Reject
    }

    fn addr(&self) -> String {
        "reject".to_string()
    }

    async fn dial_context(&self, _metadata: &Metadata) -> Result<Conn, DialError> {
        Ok(Conn::new(&self.name, ClosedStream))
    }

    async fn dial_udp(&self, _metadata: &Metadata) -> Result<Box<dyn PacketConn>, DialError> {
        Err(DialError::UnsupportedUdp(self.name.clone()))
    }

    fn support_udp(&self) -> bool {
        false
    }
}
