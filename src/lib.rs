//! `routerd`: userspace multi-protocol traffic router core.
//!
//! [`Router`] is the assembly point: it builds the proxy [`registry::Registry`]
//! and [`rule::RuleEngine`] from a loaded [`config::RawConfig`], wires them
//! into a [`dispatcher::Dispatcher`], and binds whichever ingress listeners
//! (§6) the config names. The binary entry point lives in
//! `src/bin/routerd.rs`.

pub mod adapter;
pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod group;
pub mod ingress;
pub mod logging;
pub mod metadata;
pub mod proxy;
pub mod registry;
pub mod rule;
pub mod tun;

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use config::{ListenerConfig, RawConfig};
use dispatcher::Dispatcher;
use dns::SystemResolver;
use error::ConfigError;
use ingress::{resolve_bind_addr, HttpListener, MixedListener, RedirListener, Socks5Listener, TProxyListener};
use registry::Registry;
use rule::{GeoipMatcher, GeositeAsset, RuleEngine};

/// Assembles the registry, rule engine, and dispatcher from a loaded config,
/// and drives whichever ingress listeners the config names (§6).
pub struct Router {
    listeners: ListenerConfig,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
}

impl Router {
    /// Builds the registry, rule engine, and dispatcher eagerly; nothing
    /// here owns its own runtime or TUN device construction, since this
    /// core runs under a plain `#[tokio::main]`.
    pub fn from_config(config: RawConfig) -> Result<Self, ConfigError> {
        let registry = registry::build_from_config(&config)?;

        let geosite = match &config.assets.geosite_path {
            Some(path) => Arc::new(GeositeAsset::open(path).map_err(|err| ConfigError::InvalidRule {
                line: path.clone(),
                reason: err.to_string(),
            })?),
            None => Arc::new(GeositeAsset::empty()),
        };
        let geoip = match &config.assets.geoip_path {
            Some(path) => Arc::new(GeoipMatcher::open(path).map_err(|err| ConfigError::InvalidRule {
                line: path.clone(),
                reason: err.to_string(),
            })?),
            None => Arc::new(GeoipMatcher::disabled()),
        };

        let rule_lines: Vec<String> = config.rules.iter().map(|line| line.0.clone()).collect();
        let rules = RuleEngine::from_lines(&rule_lines)?;
        let rules = Arc::new(RuleEngine::new(rules, geosite, geoip));

        let resolver: Arc<dyn dns::Resolver> = Arc::new(SystemResolver::default());
        let dispatcher = Dispatcher::new(registry.clone(), rules, resolver);

        Ok(Self { listeners: config.listeners, registry, dispatcher })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Binds every configured ingress listener and runs until `shutdown`
    /// resolves. Each listener's accept loop is spawned independently, so a
    /// bind failure on one (most commonly redir/tproxy off Linux) only warns
    /// and skips that listener rather than aborting the others.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let dispatcher = self.dispatcher.clone();
        dispatcher::spawn_udp_nat_janitor(dispatcher.clone());

        if let Some(port) = self.listeners.port {
            let addr = resolve_bind_addr("*", port, self.listeners.allow_lan);
            match HttpListener::bind(addr).await {
                Ok(listener) => {
                    info!(addr = %listener.local_addr(), "http ingress listening");
                    tokio::spawn(listener.serve(dispatcher.clone()));
                }
                Err(err) => warn!(cause = %err, "http ingress unavailable"),
            }
        }
        if let Some(port) = self.listeners.socks_port {
            let addr = resolve_bind_addr("*", port, self.listeners.allow_lan);
            match Socks5Listener::bind(addr).await {
                Ok(listener) => {
                    info!(addr = %listener.local_addr(), "socks5 ingress listening");
                    tokio::spawn(listener.serve(dispatcher.clone()));
                }
                Err(err) => warn!(cause = %err, "socks5 ingress unavailable"),
            }
        }
        if let Some(port) = self.listeners.mixed_port {
            let addr = resolve_bind_addr("*", port, self.listeners.allow_lan);
            match MixedListener::bind(addr).await {
                Ok(listener) => {
                    info!(addr = %listener.local_addr(), "mixed ingress listening");
                    tokio::spawn(listener.serve(dispatcher.clone()));
                }
                Err(err) => warn!(cause = %err, "mixed ingress unavailable"),
            }
        }
        if let Some(port) = self.listeners.redir_port {
            let addr = resolve_bind_addr("*", port, self.listeners.allow_lan);
            match RedirListener::bind(addr).await {
                Ok(listener) => {
                    info!(addr = %listener.local_addr(), "redir ingress listening");
                    tokio::spawn(listener.serve(dispatcher.clone()));
                }
                Err(err) => warn!(cause = %err, "redir ingress unavailable"),
            }
        }
        if let Some(port) = self.listeners.tproxy_port {
            let addr = resolve_bind_addr("*", port, self.listeners.allow_lan);
            match TProxyListener::bind(addr).await {
                Ok(listener) => {
                    info!(addr = %listener.local_addr(), "tproxy ingress listening");
                    tokio::spawn(listener.serve(dispatcher.clone()));
                }
                Err(err) => warn!(cause = %err, "tproxy ingress unavailable"),
            }
        }
        if let Some(device_name) = &self.listeners.tun_device {
            // Provisioning the interface's address/routes is in scope (§4.7);
            // the OS-level TUN fd read/write pump is not, since concrete TUN
            // drivers are out of scope per §1 — `tun::TunStack` exists and is
            // exercised by its own tests, but nothing here feeds it real
            // frames without a platform-specific fd to read them from.
            match tun::platform::configure_interface(device_name) {
                Ok(()) => info!(device = %device_name, "tun interface provisioned"),
                Err(err) => warn!(device = %device_name, cause = %err, "tun interface provisioning failed"),
            }
        }

        shutdown.await;
        Ok(())
    }
}
