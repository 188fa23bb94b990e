//! Mixed ingress (§6): auto-detects HTTP vs SOCKS5 on the connection's first
//! byte (`0x05` is the SOCKS5 version byte; anything else is treated as an
//! HTTP request line) and hands off to the matching handler.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::{http, socks};
use crate::dispatcher::Dispatcher;
use crate::error::IngressError;

const SOCKS5_VERSION_BYTE: u8 = 0x05;

pub struct MixedListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl MixedListener {
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
                    warn!(cause = %err, "mixed ingress: accept failed");
                    continue;
                }
            };
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer, &dispatcher).await {
                    debug!(cause = %err, peer = %peer, "mixed ingress: connection dropped");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, dispatcher: &Arc<Dispatcher>) -> Result<(), IngressError> {
    let mut probe = [0u8; 1];
    // MSG_PEEK: the byte is left in the socket's receive buffer for the
    // delegate handler to read normally.
    let n = stream.peek(&mut probe).await?;
    if n == 0 {
        return Err(IngressError::Malformed("connection closed before first byte".into()));
    }
    if probe[0] == SOCKS5_VERSION_BYTE {
        socks::handle_connection(stream, peer, dispatcher).await
    } else {
        http::handle_connection(stream, peer, dispatcher).await
    }
}

#[cfg(test)]
mod tests {
    use super::SOCKS5_VERSION_BYTE;

    #[test]
    fn socks5_version_byte_is_five() {
        assert_eq!(SOCKS5_VERSION_BYTE, 0x05);
    }
}
