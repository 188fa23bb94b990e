//! Typed view of the on-disk YAML configuration.
//!
//! The schema itself — field evolution, defaults, validation beyond basic
//! type-checking — is out of scope; this module exists only so the rest of
//! the crate has something to construct a [`crate::registry::Registry`] and
//! [`crate::rule::RuleEngine`] from.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub cipher: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub xtls: Option<String>,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub alpn: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub grpc_service_name: Option<String>,
    #[serde(default)]
    pub udp: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_loss: u16,
    #[serde(default)]
    pub forbid_duration_secs: u64,
    #[serde(default = "default_max_fail")]
    pub max_fail: u32,
    #[serde(default)]
    pub ping_server: Option<String>,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_fail() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyGroupConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default, rename = "use")]
    pub providers: Vec<String>,
    #[serde(default)]
    pub disable_udp: bool,
    #[serde(default)]
    pub auto_backup: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub socks_port: Option<u16>,
    #[serde(default)]
    pub redir_port: Option<u16>,
    #[serde(default)]
    pub tproxy_port: Option<u16>,
    #[serde(default)]
    pub mixed_port: Option<u16>,
    #[serde(default)]
    pub allow_lan: bool,
    #[serde(default)]
    pub tun_device: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AssetConfig {
    #[serde(default)]
    pub geosite_path: Option<String>,
    #[serde(default)]
    pub geoip_path: Option<String>,
}

/// A raw `"TYPE,PAYLOAD,ADAPTER[,OPTIONS]"` rule line, parsed lazily by
/// [`crate::rule::RuleEngine::from_config`].
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct RuleLine(pub String);

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub proxy_groups: Vec<ProxyGroupConfig>,
    #[serde(default)]
    pub rules: Vec<RuleLine>,
    #[serde(default)]
    pub listeners: ListenerConfig,
    #[serde(default)]
    pub assets: AssetConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: None,
            socks_port: None,
            redir_port: None,
            tproxy_port: None,
            mixed_port: None,
            allow_lan: false,
            tun_device: None,
        }
    }
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self { geosite_path: None, geoip_path: None }
    }
}

impl RawConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn proxies_by_name(&self) -> HashMap<&str, &ProxyConfig> {
        self.proxies.iter().map(|p| (p.name.as_str(), p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let text = r#"
proxies:
  - name: proxy-a
    type: direct
    server: example.com
    port: 443
rules:
  - "MATCH,Direct"
"#;
        let cfg = RawConfig::from_str(text).unwrap();
        assert_eq!(cfg.proxies.len(), 1);
        assert_eq!(cfg.proxies[0].name, "proxy-a");
        assert_eq!(cfg.rules.len(), 1);
    }

    #[test]
    fn defaults_apply_when_fields_omitted() {
        let text = r#"
proxies:
  - name: p
    type: shadowsocks
    server: 1.2.3.4
    port: 8388
"#;
        let cfg = RawConfig::from_str(text).unwrap();
        assert_eq!(cfg.proxies[0].timeout_ms, 5_000);
        assert_eq!(cfg.proxies[0].max_fail, 5);
    }
}
