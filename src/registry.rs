//! Name → `Proxy` registry, rebuilt atomically on config reload.
//!
//! Per §5: "Proxy registry: read-mostly; rebuilt atomically on config
//! reload (swap pointer)." Group adapters never hold `Arc<Proxy>` directly
//! to their children — they store names and resolve through this registry
//! at each selection, which is how §9's "cyclic exposure" note says to break
//! the reference cycle between groups-of-groups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::adapter::{Adapter, Direct, HttpProxy, PlainStreamConn, Reject, Shadowsocks, Socks5, Trojan, Vmess, XtlsFlow};
use crate::config::{ProxyConfig as RawProxyConfig, ProxyGroupConfig, RawConfig};
use crate::error::ConfigError;
use crate::group::{Fallback, GroupCommonOption, LoadBalance, Relay, Selector, UrlTest};
use crate::proxy::{Proxy, ProxyConfig};

#[derive(Default)]
pub struct Registry {
    inner: RwLock<Arc<FxHashMap<String, Arc<Proxy>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Arc::new(FxHashMap::default())) }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Proxy>> {
        self.inner.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Atomically replaces the whole map; in-flight readers keep their old
    /// `Arc` snapshot until they re-read.
    pub fn swap(&self, proxies: HashMap<String, Arc<Proxy>>) {
        let map: FxHashMap<String, Arc<Proxy>> = proxies.into_iter().collect();
        *self.inner.write() = Arc::new(map);
    }

    pub fn insert(&self, name: String, proxy: Arc<Proxy>) {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        next.insert(name, proxy);
        *guard = Arc::new(next);
    }
}

/// Builds the outbound adapter for one [`RawProxyConfig`] entry. Cipher/TLS/
/// XTLS/gRPC handshakes are the opaque `StreamConn` seam §1 draws around
/// "the concrete ciphers of each transport" — this core wires the
/// pass-through [`PlainStreamConn`], matching a deployment that hasn't
/// injected a real transport crate behind that trait.
fn build_adapter(cfg: &RawProxyConfig) -> Result<Arc<dyn Adapter>, ConfigError> {
    let stream_conn = Arc::new(PlainStreamConn);
    let adapter: Arc<dyn Adapter> = match cfg.kind.to_ascii_lowercase().as_str() {
        "direct" => Arc::new(Direct::new(cfg.name.clone())),
        "reject" | "pass" => Arc::new(Reject::new(cfg.name.clone())),
        "shadowsocks" | "ss" => Arc::new(Shadowsocks::new(cfg.name.clone(), cfg.server.clone(), cfg.port, stream_conn)),
        "vmess" => Arc::new(Vmess::new(cfg.name.clone(), cfg.server.clone(), cfg.port, stream_conn)),
        "trojan" => {
            let flow = match cfg.xtls.as_deref() {
                Some("xtls-rprx-direct") => XtlsFlow::RprxDirect,
                Some("xtls-rprx-origin") => XtlsFlow::RprxOrigin,
                _ => XtlsFlow::None,
            };
            Arc::new(Trojan::new(cfg.name.clone(), cfg.server.clone(), cfg.port, stream_conn, flow))
        }
        "http" => Arc::new(HttpProxy::new(cfg.name.clone(), cfg.server.clone(), cfg.port)),
        "socks5" => Arc::new(Socks5::new(cfg.name.clone(), cfg.server.clone(), cfg.port)),
        other => {
            return Err(ConfigError::InvalidRule {
                line: cfg.name.clone(),
                reason: format!("unknown proxy type {other:?}"),
            })
        }
    };
    Ok(adapter)
}

fn health_config(cfg: &RawProxyConfig) -> ProxyConfig {
    ProxyConfig {
        timeout: Duration::from_millis(cfg.timeout_ms),
        max_loss: cfg.max_loss,
        max_fail: cfg.max_fail,
        forbid_duration: Duration::from_secs(cfg.forbid_duration_secs),
        ping_addr: cfg.ping_server.clone(),
    }
}

fn group_common(cfg: &ProxyGroupConfig) -> GroupCommonOption {
    let mut providers = cfg.proxies.clone();
    providers.extend(cfg.providers.iter().cloned());
    GroupCommonOption { name: cfg.name.clone(), disable_udp: cfg.disable_udp, auto_backup: cfg.auto_backup, providers }
}

/// Builds a [`Registry`] from §6's config shape: every `proxies[]` entry
/// first (concrete adapters never reference other registry entries), then
/// every `proxy-groups[]` entry (which resolve their children's *names*
/// lazily through the registry at selection time, per §9's cyclic-exposure
/// note, so group-of-group ordering doesn't matter here).
///
/// Always seeds implicit `DIRECT`/`REJECT` entries if the config doesn't
/// define its own, mirroring every `clash`-family config's built-ins —
/// the common `MATCH,DIRECT` catch-all rule would otherwise never resolve.
pub fn build_from_config(cfg: &RawConfig) -> Result<Arc<Registry>, ConfigError> {
    let registry = Arc::new(Registry::new());

    for proxy_cfg in &cfg.proxies {
        let adapter = build_adapter(proxy_cfg)?;
        let proxy = Arc::new(Proxy::new(adapter, health_config(proxy_cfg)));
        registry.insert(proxy_cfg.name.clone(), proxy);
    }

    if !registry.contains("DIRECT") {
        registry.insert("DIRECT".to_string(), Arc::new(Proxy::new(Arc::new(Direct::new("DIRECT")), ProxyConfig::default())));
    }
    if !registry.contains("REJECT") {
        registry.insert("REJECT".to_string(), Arc::new(Proxy::new(Arc::new(Reject::new("REJECT")), ProxyConfig::default())));
    }

    for group_cfg in &cfg.proxy_groups {
        let common = group_common(group_cfg);
        let adapter: Arc<dyn Adapter> = match group_cfg.kind.to_ascii_lowercase().as_str() {
            "selector" => Arc::new(Selector::new(common, registry.clone())),
            "fallback" => Arc::new(Fallback::new(common, registry.clone())),
            "url-test" | "urltest" => Arc::new(UrlTest::new(common, registry.clone())),
            "load-balance" | "loadbalance" => Arc::new(LoadBalance::new(common, registry.clone())),
            "relay" => Arc::new(Relay::new(group_cfg.name.clone(), registry.clone(), common.providers)),
            other => {
                return Err(ConfigError::InvalidRule {
                    line: group_cfg.name.clone(),
                    reason: format!("unknown proxy-group type {other:?}"),
                })
            }
        };
        registry.insert(group_cfg.name.clone(), Arc::new(Proxy::new(adapter, ProxyConfig::default())));
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Direct;
    use crate::proxy::ProxyConfig;

    #[test]
    fn insert_then_get_round_trips() {
        let registry = Registry::new();
        let proxy = Arc::new(Proxy::new(Arc::new(Direct::new("direct")), ProxyConfig::default()));
        registry.insert("direct".to_string(), proxy);
        assert!(registry.get("direct").is_some());
        assert!(registry.get("missing").is_none());
    }
}
