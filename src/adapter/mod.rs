//! Outbound adapter abstraction: a uniform dial surface over direct
//! forwarding, rejection, and proxy transports.

mod direct;
mod http;
mod reject;
mod shadowsocks;
mod socks5;
mod stream_conn;
mod trojan;
mod vmess;
mod wire;

pub use direct::Direct;
pub use http::HttpProxy;
pub use reject::Reject;
pub use shadowsocks::Shadowsocks;
pub use socks5::Socks5;
pub use stream_conn::{PlainStreamConn, StreamConn};
pub use trojan::{Trojan, XtlsFlow};
pub use vmess::Vmess;
pub use wire::encode_socks5_addr;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::DialError;
use crate::metadata::Metadata;

/// Concrete or group adapter kind, mirrored 1:1 onto the `AdapterType` enum
/// of spec §3. Group variants hold no state here — groups are a distinct
/// type ([`crate::group`]) implementing the same [`Adapter`] trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterType {
    Direct,
    Reject,
    Pass,
    Relay,
    Selector,
    Fallback,
    UrlTest,
    LoadBalance,
    Shadowsocks,
    Trojan,
    Vmess,
    Snell,
    Http,
    Socks5,
}

impl AdapterType {
    /// Group-type adapters get the §4.2 "mark not-alive immediately on a
    /// failed trial" treatment rather than fail-count accumulation.
    pub fn is_group(self) -> bool {
        matches!(
            self,
            AdapterType::Direct
                | AdapterType::Reject
                | AdapterType::Pass
                | AdapterType::Relay
                | AdapterType::Selector
                | AdapterType::Fallback
                | AdapterType::UrlTest
                | AdapterType::LoadBalance
        )
    }
}

/// A byte stream returned by a dial, tagged with the chain of adapter names
/// it passed through (relay/group adapters append themselves).
pub struct Conn {
    pub chain: Vec<String>,
    pub inner: Pin<Box<dyn AsyncStream>>,
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncStream for T {}

impl Conn {
    pub fn new(adapter_name: &str, inner: impl AsyncStream + 'static) -> Self {
        Self { chain: vec![adapter_name.to_string()], inner: Box::pin(inner) }
    }

    /// Appends a name to the front of the chain (outermost group wraps last).
    pub fn push_chain(&mut self, adapter_name: &str) {
        self.chain.push(adapter_name.to_string());
    }
}

/// A UDP association: send datagrams to arbitrary peers, receive replies.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<()>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn chain(&self) -> &[String];
}

/// The capability set every outbound adapter implements (spec §4.1).
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;
    fn adapter_type(&self) -> AdapterType;
    fn addr(&self) -> String;

    async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError>;

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Box<dyn PacketConn>, DialError> {
        let _ = metadata;
        Err(DialError::UnsupportedUdp(self.name().to_string()))
    }

    fn support_udp(&self) -> bool {
        false
    }

    /// Self-description for the control surface; the control API itself is
    /// out of scope (§1), so this just returns the fields a caller would
    /// serialize into it.
    fn marshal_json(&self) -> serde_json::Value {
        serde_json::json!({ "name": self.name(), "type": format!("{:?}", self.adapter_type()) })
    }

    /// Group adapters resolve to their currently-selected child; concrete
    /// adapters have no child to unwrap.
    fn unwrap_child(&self, _metadata: &Metadata) -> Option<String> {
        None
    }
}
