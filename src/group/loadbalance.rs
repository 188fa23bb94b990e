use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;

use super::{resolve_children, GroupCommonOption};
use crate::adapter::{Adapter, AdapterType, Conn, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;
use crate::proxy::Proxy;
use crate::registry::Registry;

/// §4.3 LoadBalance: hash `metadata.host` (or `dst_ip`) into an alive-subset
/// ring for sticky routing — the same key always lands on the same child as
/// long as that child remains in the alive subset.
pub struct LoadBalance {
    common: GroupCommonOption,
    registry: Arc<Registry>,
}

impl LoadBalance {
    pub fn new(common: GroupCommonOption, registry: Arc<Registry>) -> Self {
        Self { common, registry }
    }

    fn pick(&self, metadata: &Metadata) -> Option<Arc<Proxy>> {
        let children = resolve_children(&self.registry, &self.common.providers);
        let alive: Vec<_> = children.into_iter().filter(|p| p.alive()).collect();
        if alive.is_empty() {
            return None;
        }
        let key = metadata.host_or_ip_string();
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % alive.len();
        Some(alive[index].clone())
    }
}

#[async_trait]
impl Adapter for LoadBalance {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::LoadBalance
    }

    fn addr(&self) -> String {
        "load-balance".to_string()
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError> {
        let child = self
            .pick(metadata)
            .ok_or_else(|| DialError::Handshake(self.common.name.clone(), "no alive child proxy".into()))?;
        let mut conn = child.dial_context(metadata).await?;
        conn.push_chain(&self.common.name);
        Ok(conn)
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Box<dyn PacketConn>, DialError> {
        if self.common.disable_udp {
            return Err(DialError::UnsupportedUdp(self.common.name.clone()));
        }
        let child = self
            .pick(metadata)
            .ok_or_else(|| DialError::Handshake(self.common.name.clone(), "no alive child proxy".into()))?;
        child.dial_udp(metadata).await
    }

    fn support_udp(&self) -> bool {
        !self.common.disable_udp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Direct;
    use crate::metadata::{InboundType, Network};
    use crate::proxy::ProxyConfig;
    use std::net::Ipv4Addr;

    #[test]
    fn same_host_always_picks_same_child() {
        let registry = Arc::new(Registry::new());
        for name in ["a", "b", "c"] {
            registry.insert(name.to_string(), Arc::new(Proxy::new(Arc::new(Direct::new(name)), ProxyConfig::default())));
        }
        let group = LoadBalance::new(
            GroupCommonOption { name: "lb".into(), disable_udp: false, auto_backup: false, providers: vec!["a".into(), "b".into(), "c".into()] },
            registry,
        );
        let md = Metadata::with_host(Network::Tcp, "sticky.example.com", 443, Ipv4Addr::LOCALHOST.into(), 1, InboundType::Http);
        let first = group.pick(&md).unwrap().name().to_string();
        let second = group.pick(&md).unwrap().name().to_string();
        assert_eq!(first, second);
    }
}
