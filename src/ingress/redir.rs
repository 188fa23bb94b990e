//! Redir ingress (§6): Linux `iptables -j REDIRECT` transparent proxying.
//! The kernel rewrites the destination to this listener's port before the
//! TCP handshake completes; the listener recovers the real destination via
//! `getsockopt(SOL_IP, SO_ORIGINAL_DST)`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::error::IngressError;
use crate::metadata::{InboundType, Metadata, Network};

pub struct RedirListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RedirListener {
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
                    warn!(cause = %err, "redir ingress: accept failed");
                    continue;
                }
            };
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer, &dispatcher).await {
                    debug!(cause = %err, peer = %peer, "redir ingress: connection dropped");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, dispatcher: &Arc<Dispatcher>) -> Result<(), IngressError> {
    let original_dst = platform::original_destination(&stream)?;
    let metadata = Metadata::with_ip(
        Network::Tcp,
        original_dst.ip(),
        original_dst.port(),
        peer.ip(),
        peer.port(),
        InboundType::Redir,
    );
    dispatcher.add_tcp(stream, metadata);
    Ok(())
}

#[cfg(target_os = "linux")]
mod platform {
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;

    use tokio::net::TcpStream;

    use crate::error::IngressError;

    /// `SO_ORIGINAL_DST` from `linux/netfilter_ipv4.h`; not exposed by `libc`.
    const SO_ORIGINAL_DST: libc::c_int = 80;

    pub fn original_destination(stream: &TcpStream) -> Result<SocketAddr, IngressError> {
        let fd = stream.as_raw_fd();
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        // Safety: `addr`/`len` describe a valid, appropriately-sized buffer
        // for the kernel to write a `sockaddr_in` into.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(IngressError::Io(std::io::Error::last_os_error()));
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(SocketAddrV4::new(ip, port).into())
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::net::SocketAddr;

    use tokio::net::TcpStream;

    use crate::error::IngressError;

    pub fn original_destination(_stream: &TcpStream) -> Result<SocketAddr, IngressError> {
        Err(IngressError::Unsupported("redir ingress requires Linux SO_ORIGINAL_DST".into()))
    }
}
