//! `StreamConn` is the seam §1 draws around "the concrete ciphers of each
//! transport": a trait object applied to a raw dialed TCP stream before the
//! protocol-specific destination header is written. This crate supplies only
//! the pass-through implementation; a real deployment injects a TLS/XTLS/
//! gRPC-over-H2 implementation built against the same trait.

use async_trait::async_trait;

use super::AsyncStream;
use crate::error::DialError;
use std::pin::Pin;

#[async_trait]
pub trait StreamConn: Send + Sync {
    async fn wrap(&self, raw: Pin<Box<dyn AsyncStream>>) -> Result<Pin<Box<dyn AsyncStream>>, DialError>;

    /// §9: "rely on a capability query on the returned connection (is-xtls);
    /// never downcast." Implementations that negotiate XTLS report it here.
    fn is_xtls(&self) -> bool {
        false
    }
}

/// Identity wrapper: no cipher, no TLS. Used where a deployment has not
/// injected a real transport, and by tests.
pub struct PlainStreamConn;

#[async_trait]
impl StreamConn for PlainStreamConn {
    async fn wrap(&self, raw: Pin<Box<dyn AsyncStream>>) -> Result<Pin<Box<dyn AsyncStream>>, DialError> {
        Ok(raw)
    }
}
