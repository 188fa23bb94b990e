//! Rule engine: ordered, first-match metadata → adapter-name resolution
//! (spec §4.4).

mod domain;
mod geoip;
mod geosite;
mod ipcidr;
mod port;
mod process;

pub use domain::{domain_exact, domain_keyword, domain_suffix};
pub use geoip::GeoipMatcher;
pub use geosite::{DomainMatcher, GeositeAsset};
pub use ipcidr::ip_in_cidr;
pub use port::port_matches;
pub use process::{process_name_matches, process_path_matches};

use std::net::IpAddr;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::metadata::{Metadata, Network};

/// A single `PORT`/`SRC-PORT` payload: either a singleton or an inclusive
/// range (`"80-90"`).
#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn parse(payload: &str) -> Option<Self> {
        if let Some((low, high)) = payload.split_once('-') {
            Some(Self { low: low.parse().ok()?, high: high.parse().ok()? })
        } else {
            let p: u16 = payload.parse().ok()?;
            Some(Self { low: p, high: p })
        }
    }

    pub fn contains(self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }
}

/// Extra constraints some rule lines carry beyond their primary payload
/// (§3: "each carries... `ruleExtra?`").
#[derive(Debug, Clone, Default)]
pub struct RuleExtra {
    pub network: Option<Network>,
}

impl RuleExtra {
    fn allows(&self, metadata: &Metadata) -> bool {
        self.network.map(|n| n == metadata.network).unwrap_or(true)
    }
}

pub enum Rule {
    Geosite { country: String, adapter: String, extra: RuleExtra },
    Geoip { country: String, adapter: String, no_resolve_ip: bool, extra: RuleExtra },
    Domain { exact: String, adapter: String, extra: RuleExtra },
    DomainSuffix { suffix: String, adapter: String, extra: RuleExtra },
    DomainKeyword { keyword: String, adapter: String, extra: RuleExtra },
    IpCidr { cidr: ipnetwork::IpNetwork, adapter: String, no_resolve_ip: bool, extra: RuleExtra },
    SrcIpCidr { cidr: ipnetwork::IpNetwork, adapter: String, extra: RuleExtra },
    Port { range: PortRange, adapter: String, extra: RuleExtra },
    SrcPort { range: PortRange, adapter: String, extra: RuleExtra },
    ProcessName { name: String, adapter: String, extra: RuleExtra },
    ProcessPath { path: String, adapter: String, extra: RuleExtra },
    Match { adapter: String },
}

impl Rule {
    pub fn adapter(&self) -> &str {
        match self {
            Rule::Geosite { adapter, .. }
            | Rule::Geoip { adapter, .. }
            | Rule::Domain { adapter, .. }
            | Rule::DomainSuffix { adapter, .. }
            | Rule::DomainKeyword { adapter, .. }
            | Rule::IpCidr { adapter, .. }
            | Rule::SrcIpCidr { adapter, .. }
            | Rule::Port { adapter, .. }
            | Rule::SrcPort { adapter, .. }
            | Rule::ProcessName { adapter, .. }
            | Rule::ProcessPath { adapter, .. }
            | Rule::Match { adapter } => adapter,
        }
    }

    /// §4.4 step 1: "resolve iff ¬noResolveIP for that rule" — only GEOIP
    /// and IP-CIDR ever need resolution.
    pub fn should_resolve_ip(&self) -> bool {
        match self {
            Rule::Geoip { no_resolve_ip, .. } => !no_resolve_ip,
            Rule::IpCidr { no_resolve_ip, .. } => !no_resolve_ip,
            _ => false,
        }
    }

    fn needs_dst_ip(&self) -> bool {
        matches!(self, Rule::Geoip { .. } | Rule::IpCidr { .. })
    }

    pub fn matches(&self, metadata: &Metadata, geosite: &geosite::GeositeAsset, geoip: &geoip::GeoipMatcher) -> bool {
        let extra_ok = match self {
            Rule::Geosite { extra, .. }
            | Rule::Geoip { extra, .. }
            | Rule::Domain { extra, .. }
            | Rule::DomainSuffix { extra, .. }
            | Rule::DomainKeyword { extra, .. }
            | Rule::IpCidr { extra, .. }
            | Rule::SrcIpCidr { extra, .. }
            | Rule::Port { extra, .. }
            | Rule::SrcPort { extra, .. }
            | Rule::ProcessName { extra, .. }
            | Rule::ProcessPath { extra, .. } => extra.allows(metadata),
            Rule::Match { .. } => true,
        };
        if !extra_ok {
            return false;
        }

        match self {
            Rule::Match { .. } => true,
            Rule::Domain { exact, .. } => domain::domain_exact(&metadata.host, exact),
            Rule::DomainSuffix { suffix, .. } => domain::domain_suffix(&metadata.host, suffix),
            Rule::DomainKeyword { keyword, .. } => domain::domain_keyword(&metadata.host, keyword),
            Rule::Geosite { country, .. } => geosite.matches(country, &metadata.host),
            Rule::Geoip { country, .. } => {
                metadata.dst_ip.map(|ip| geoip.country_is(ip, country)).unwrap_or(false)
            }
            Rule::IpCidr { cidr, .. } => metadata.dst_ip.map(|ip| ipcidr::ip_in_cidr(ip, *cidr)).unwrap_or(false),
            Rule::SrcIpCidr { cidr, .. } => ipcidr::ip_in_cidr(metadata.src_ip, *cidr),
            Rule::Port { range, .. } => range.contains(metadata.dst_port),
            Rule::SrcPort { range, .. } => range.contains(metadata.src_port),
            Rule::ProcessName { name, .. } => process::process_name_matches(metadata.process_path.as_deref(), name),
            Rule::ProcessPath { path, .. } => process::process_path_matches(metadata.process_path.as_deref(), path),
        }
    }
}

/// Ordered rule list plus the compiled GeoSite/GeoIP collaborators every
/// rule evaluation shares.
pub struct RuleEngine {
    rules: Vec<Rule>,
    geosite: Arc<geosite::GeositeAsset>,
    geoip: Arc<geoip::GeoipMatcher>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>, geosite: Arc<geosite::GeositeAsset>, geoip: Arc<geoip::GeoipMatcher>) -> Self {
        Self { rules, geosite, geoip }
    }

    /// Parses `"TYPE,PAYLOAD,ADAPTER[,OPTIONS]"` lines from config into
    /// [`Rule`]s. External config schema concerns stop at this boundary.
    pub fn parse_line(line: &str) -> Result<Rule, ConfigError> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let malformed = || ConfigError::InvalidRule { line: line.to_string(), reason: "expected TYPE,PAYLOAD,ADAPTER".into() };

        if parts.len() == 2 && parts[0].eq_ignore_ascii_case("MATCH") {
            return Ok(Rule::Match { adapter: parts[1].to_string() });
        }
        if parts.len() < 3 {
            return Err(malformed());
        }
        let (kind, payload, adapter) = (parts[0], parts[1], parts[2]);
        let no_resolve_ip = parts.get(3).map(|o| o.eq_ignore_ascii_case("no-resolve")).unwrap_or(false);
        let extra = RuleExtra::default();

        let rule = match kind.to_ascii_uppercase().as_str() {
            "GEOSITE" => Rule::Geosite { country: payload.to_string(), adapter: adapter.to_string(), extra },
            "GEOIP" => Rule::Geoip { country: payload.to_string(), adapter: adapter.to_string(), no_resolve_ip, extra },
            "DOMAIN" => Rule::Domain { exact: payload.to_ascii_lowercase(), adapter: adapter.to_string(), extra },
            "DOMAIN-SUFFIX" => Rule::DomainSuffix { suffix: payload.to_ascii_lowercase(), adapter: adapter.to_string(), extra },
            "DOMAIN-KEYWORD" => Rule::DomainKeyword { keyword: payload.to_ascii_lowercase(), adapter: adapter.to_string(), extra },
            "IP-CIDR" | "IP-CIDR6" => {
                let cidr: ipnetwork::IpNetwork = payload.parse().map_err(|_| malformed())?;
                Rule::IpCidr { cidr, adapter: adapter.to_string(), no_resolve_ip, extra }
            }
            "SRC-IP-CIDR" => {
                let cidr: ipnetwork::IpNetwork = payload.parse().map_err(|_| malformed())?;
                Rule::SrcIpCidr { cidr, adapter: adapter.to_string(), extra }
            }
            "PORT" => Rule::Port { range: PortRange::parse(payload).ok_or_else(malformed)?, adapter: adapter.to_string(), extra },
            "SRC-PORT" => Rule::SrcPort { range: PortRange::parse(payload).ok_or_else(malformed)?, adapter: adapter.to_string(), extra },
            "PROCESS-NAME" => Rule::ProcessName { name: payload.to_string(), adapter: adapter.to_string(), extra },
            "PROCESS-PATH" => Rule::ProcessPath { path: payload.to_string(), adapter: adapter.to_string(), extra },
            _ => return Err(malformed()),
        };
        Ok(rule)
    }

    pub fn from_lines(lines: &[String]) -> Result<Vec<Rule>, ConfigError> {
        lines.iter().map(|l| Self::parse_line(l)).collect()
    }

    /// §4.4 step 3: first rule that matches wins; `MATCH` is the catch-all.
    pub fn resolve(&self, metadata: &Metadata) -> Option<&str> {
        self.rules.iter().find(|r| r.matches(metadata, &self.geosite, &self.geoip)).map(|r| r.adapter())
    }

    /// §4.4 step 1: whether any IP-needing rule in this engine would require
    /// resolving `metadata.host` first, given metadata currently lacks
    /// `dst_ip`.
    pub fn any_rule_needs_resolution(&self, metadata: &Metadata) -> bool {
        metadata.dst_ip.is_none() && self.rules.iter().any(|r| r.needs_dst_ip() && r.should_resolve_ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InboundType;
    use std::net::Ipv4Addr;

    fn engine(rules: Vec<Rule>) -> RuleEngine {
        RuleEngine::new(rules, Arc::new(geosite::GeositeAsset::empty()), Arc::new(geoip::GeoipMatcher::disabled()))
    }

    #[test]
    fn first_match_wins_deterministically() {
        let rules = vec![
            Rule::DomainSuffix { suffix: "example.com".into(), adapter: "proxy".into(), extra: RuleExtra::default() },
            Rule::Match { adapter: "direct".into() },
        ];
        let engine = engine(rules);
        let md = Metadata::with_host(Network::Tcp, "www.example.com", 443, Ipv4Addr::LOCALHOST.into(), 1, InboundType::Http);
        assert_eq!(engine.resolve(&md), Some("proxy"));

        let md2 = Metadata::with_host(Network::Tcp, "other.org", 443, Ipv4Addr::LOCALHOST.into(), 1, InboundType::Http);
        assert_eq!(engine.resolve(&md2), Some("direct"));
    }

    #[test]
    fn parses_match_catch_all() {
        let rule = RuleEngine::parse_line("MATCH,Direct").unwrap();
        assert_eq!(rule.adapter(), "Direct");
    }

    #[test]
    fn parses_ip_cidr() {
        let rule = RuleEngine::parse_line("IP-CIDR,8.8.8.8/32,Reject").unwrap();
        assert!(matches!(rule, Rule::IpCidr { .. }));
    }
}
