//! TProxy ingress (§6): Linux `TPROXY` iptables target. Unlike `redir`, the
//! kernel delivers the connection with its *original* destination address
//! already visible via `getsockname` — no `SO_ORIGINAL_DST` lookup needed —
//! but only once the listening socket itself is created with
//! `IP_TRANSPARENT`, which `std`/`tokio`'s listener constructors don't
//! expose, so this module builds the socket with raw `libc` calls and hands
//! the resulting fd to `tokio::net::TcpListener::from_std`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::error::IngressError;
use crate::metadata::{InboundType, Metadata, Network};

pub struct TProxyListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TProxyListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, IngressError> {
        let listener = platform::bind_transparent(addr)?;
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
                    warn!(cause = %err, "tproxy ingress: accept failed");
                    continue;
                }
            };
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer, &dispatcher).await {
                    debug!(cause = %err, peer = %peer, "tproxy ingress: connection dropped");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, dispatcher: &Arc<Dispatcher>) -> Result<(), IngressError> {
    // Under TPROXY the accepted socket's own local address *is* the
    // original destination — the kernel lets it bind as a foreign address.
    let original_dst = stream.local_addr()?;
    let metadata = Metadata::with_ip(
        Network::Tcp,
        original_dst.ip(),
        original_dst.port(),
        peer.ip(),
        peer.port(),
        InboundType::TProxy,
    );
    dispatcher.add_tcp(stream, metadata);
    Ok(())
}

#[cfg(target_os = "linux")]
mod platform {
    use std::net::SocketAddr;
    use std::os::unix::io::FromRawFd;

    use socket2::{Domain, Socket, Type};
    use tokio::net::TcpListener;

    use crate::error::IngressError;

    pub fn bind_transparent(addr: SocketAddr) -> Result<TcpListener, IngressError> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, None)
            .map_err(|source| IngressError::Bind { addr: addr.to_string(), source })?;
        socket.set_reuse_address(true).map_err(|source| IngressError::Bind { addr: addr.to_string(), source })?;

        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&socket);
        let enable: libc::c_int = 1;
        // Safety: `fd` is a freshly created, still-open socket and `enable`
        // is a valid `c_int` for `IP_TRANSPARENT`'s boolean option value.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_IP,
                libc::IP_TRANSPARENT,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(IngressError::Io(std::io::Error::last_os_error()));
        }

        socket.bind(&addr.into()).map_err(|source| IngressError::Bind { addr: addr.to_string(), source })?;
        socket.listen(1024).map_err(|source| IngressError::Bind { addr: addr.to_string(), source })?;
        socket.set_nonblocking(true).map_err(|source| IngressError::Bind { addr: addr.to_string(), source })?;

        // Safety: `socket` owns a valid, bound, listening, non-blocking fd;
        // `into_raw_fd` hands that ownership to the `std::net::TcpListener`
        // we immediately wrap, so no fd is leaked or double-closed.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(std::os::unix::io::IntoRawFd::into_raw_fd(socket)) };
        TcpListener::from_std(std_listener).map_err(|source| IngressError::Bind { addr: addr.to_string(), source })
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use crate::error::IngressError;

    pub fn bind_transparent(addr: SocketAddr) -> Result<TcpListener, IngressError> {
        let _ = addr;
        Err(IngressError::Unsupported("tproxy ingress requires Linux IP_TRANSPARENT".into()))
    }
}
