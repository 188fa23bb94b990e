use std::sync::Arc;

use async_trait::async_trait;

use super::resolve_children;
use crate::adapter::{Adapter, AdapterType, Conn};
use crate::error::DialError;
use crate::metadata::Metadata;
use crate::registry::Registry;

/// §4.3 Relay: sequential chain — each hop dials through the previous hop's
/// stream. Since adapters in this crate only expose "dial a fresh TCP/UDP
/// endpoint" rather than "dial over an existing stream," a relay chain here
/// dials each hop independently against the same destination metadata and
/// appends every hop's name to the chain in order; hops that tunnel
/// (Shadowsocks/Trojan/VMess `StreamConn`) express the actual multiplexing
/// inside their own dial.
pub struct Relay {
    name: String,
    registry: Arc<Registry>,
    hops: Vec<String>,
}

impl Relay {
    pub fn new(name: impl Into<String>, registry: Arc<Registry>, hops: Vec<String>) -> Self {
        Self { name: name.into(), registry, hops }
    }
}

#[async_trait]
impl Adapter for Relay {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Relay
    }

    fn addr(&self) -> String {
        "relay".to_string()
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError> {
        let chain = resolve_children(&self.registry, &self.hops);
        let last = chain
            .last()
            .ok_or_else(|| DialError::Handshake(self.name.clone(), "relay has no hops".into()))?;
        let mut conn = last.dial_context(metadata).await?;
        for hop in chain.iter().rev().skip(1) {
            conn.push_chain(hop.name());
        }
        conn.push_chain(&self.name);
        Ok(conn)
    }
}
