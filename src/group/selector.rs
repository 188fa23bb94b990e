use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{resolve_children, GroupCommonOption, SELECTION_CACHE_TTL};
use crate::adapter::{Adapter, AdapterType, Conn, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;
use crate::registry::Registry;

struct Cached {
    name: String,
    computed_at: Instant,
}

/// §4.3 Selector: user-pinned `selected` name, single-flight cached.
pub struct Selector {
    common: GroupCommonOption,
    registry: Arc<Registry>,
    selected: Mutex<Option<String>>,
    cache: Mutex<Option<Cached>>,
}

impl Selector {
    pub fn new(common: GroupCommonOption, registry: Arc<Registry>) -> Self {
        Self { common, registry, selected: Mutex::new(None), cache: Mutex::new(None) }
    }

    /// Pins the selection. Validates `name` is among the group's resolved
    /// proxies before accepting it (grounded on `outboundgroup/selector.go`'s
    /// existence check), and invalidates the cache immediately.
    pub fn set_selected(&self, name: &str) -> Result<(), &'static str> {
        if !self.common.providers_contains(name, &self.registry) {
            return Err("unknown proxy name");
        }
        *self.selected.lock() = Some(name.to_string());
        *self.cache.lock() = None;
        Ok(())
    }

    /// (a) pinned+alive (or no auto-backup) wins; (b) else, with
    /// auto-backup, the alive child with minimum `last_delay`; (c) else the
    /// first listed proxy.
    fn selected_proxy(&self, touch: bool) -> Option<Arc<crate::proxy::Proxy>> {
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
        if children.is_empty() {
            return None;
        }

        let pinned = self.selected.lock().clone();
        let chosen = if let Some(pinned_name) = &pinned {
            if let Some(p) = children.iter().find(|p| p.name() == pinned_name) {
                if p.alive() || !self.common.auto_backup {
                    Some(p.clone())
                } else if self.common.auto_backup {
                    children.iter().filter(|p| p.alive()).min_by_key(|p| p.last_delay()).cloned()
                } else {
                    Some(p.clone())
                }
            } else {
                children.first().cloned()
            }
        } else if self.common.auto_backup {
            children
                .iter()
                .filter(|p| p.alive())
                .min_by_key(|p| p.last_delay())
                .cloned()
                .or_else(|| children.first().cloned())
        } else {
            children.first().cloned()
        };

        if let Some(p) = &chosen {
            *self.cache.lock() = Some(Cached { name: p.name().to_string(), computed_at: Instant::now() });
        }
        chosen
    }
}

impl GroupCommonOption {
    fn providers_contains(&self, name: &str, registry: &Registry) -> bool {
        resolve_children(registry, &self.providers).iter().any(|p| p.name() == name)
    }
}

#[async_trait]
impl Adapter for Selector {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Selector
    }

    fn addr(&self) -> String {
        "selector".to_string()
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

    fn unwrap_child(&self, _metadata: &Metadata) -> Option<String> {
        self.selected_proxy(false).map(|p| p.name().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Direct;
    use crate::proxy::{Proxy, ProxyConfig};

    fn registry_with(names: &[&str]) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        for name in names {
            registry.insert(
                name.to_string(),
                Arc::new(Proxy::new(Arc::new(Direct::new(*name)), ProxyConfig::default())),
            );
        }
        registry
    }

    #[test]
    fn set_selected_rejects_unknown_name() {
        let registry = registry_with(&["a", "b"]);
        let selector = Selector::new(
            GroupCommonOption { name: "sel".into(), disable_udp: false, auto_backup: false, providers: vec!["a".into(), "b".into()] },
            registry,
        );
        assert!(selector.set_selected("a").is_ok());
        assert!(selector.set_selected("ghost").is_err());
    }

    #[test]
    fn defaults_to_first_listed_without_pin() {
        let registry = registry_with(&["a", "b"]);
        let selector = Selector::new(
            GroupCommonOption { name: "sel".into(), disable_udp: false, auto_backup: false, providers: vec!["a".into(), "b".into()] },
            registry,
        );
        assert_eq!(selector.selected_proxy(true).unwrap().name(), "a");
    }
}
