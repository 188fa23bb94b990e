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

/// §4.3 URL-Test: minimum `last_delay` among alive children; ties broken by
/// provider (list) order since `min_by_key` keeps the first minimum.
pub struct UrlTest {
    common: GroupCommonOption,
    registry: Arc<Registry>,
    cache: Mutex<Option<Cached>>,
}

impl UrlTest {
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
        let chosen = children
            .iter()
            .filter(|p| p.alive())
            .min_by_key(|p| p.last_delay())
            .cloned()
            .or_else(|| children.first().cloned());
        if let Some(p) = &chosen {
            *self.cache.lock() = Some(Cached { name: p.name().to_string(), computed_at: Instant::now() });
        }
        chosen
    }
}

#[async_trait]
impl Adapter for UrlTest {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::UrlTest
    }

    fn addr(&self) -> String {
        "url-test".to_string()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Direct;
    use crate::proxy::{DelayHistoryEntry, ProxyConfig};

    fn make_proxy(name: &str, delay_ms: u16) -> Arc<Proxy> {
        let proxy = Proxy::new(Arc::new(Direct::new(name)), ProxyConfig::default());
        // Simulate a successful URL-test having already recorded a delay.
        proxy.record_test_result(DelayHistoryEntry { time_unix_ms: 0, delay_ms, loss_pct: 0, down_from: 0 });
        Arc::new(proxy)
    }

    #[test]
    fn picks_minimum_delay_among_alive_children() {
        let registry = Arc::new(Registry::new());
        registry.insert("slow".into(), make_proxy("slow", 500));
        registry.insert("fast".into(), make_proxy("fast", 150));
        registry.insert("mid".into(), make_proxy("mid", 300));

        let group = UrlTest::new(
            GroupCommonOption {
                name: "ut".into(),
                disable_udp: false,
                auto_backup: false,
                providers: vec!["slow".into(), "fast".into(), "mid".into()],
            },
            registry,
        );
        assert_eq!(group.selected_proxy(true).unwrap().name(), "fast");
    }
}
