use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{resolve_children, GroupCommonOption, SELECTION_CACHE_TTL};
use crate::adapter::{Adapter, AdapterType, Conn, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;
use crate::proxy::Proxy;
use crate::registry::Registry;

struct Cached {
    name: String,
    computed_at: Instant,
}

/// §4.3 Fallback: first-alive by list order, freshness-cached.
pub struct Fallback {
    common: GroupCommonOption,
    registry: Arc<Registry>,
    cache: Mutex<Option<Cached>>,
}

impl Fallback {
    pub fn new(common: GroupCommonOption, registry: Arc<Registry>) -> Self {
        Self { common, registry, cache: Mutex::new(None) }
    }

    fn selected_proxy(&self, touch: bool) -> Option<Arc<Proxy>> {
        if !touch {
            if let Some(cached) = self.cache.lock().as_ref() {
                if cached.computed_at.elapsed() < SELECTION_CACHE_TTL {
                    if let Some(p) = self.registry.get(&cached.name) {
                        return Some(p);
                    }
                }
            }
        }
        let children = resolve_children(&self.registry, &self.common.providers);
        let chosen = children.iter().find(|p| p.alive()).cloned().or_else(|| children.first().cloned());
        if let Some(p) = &chosen {
            *self.cache.lock() = Some(Cached { name: p.name().to_string(), computed_at: Instant::now() });
        }
        chosen
    }
}

#[async_trait]
impl Adapter for Fallback {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Fallback
    }

    fn addr(&self) -> String {
        "fallback".to_string()
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError> {
        let child = self
            .selected_proxy(false)
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
            .selected_proxy(false)
            .ok_or_else(|| DialError::Handshake(self.common.name.clone(), "no alive child proxy".into()))?;
        child.dial_udp(metadata).await
    }

    fn support_udp(&self) -> bool {
        !self.common.disable_udp
    }
}
