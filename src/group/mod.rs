//! Proxy groups: composite adapters that pick among child adapters using
//! freshness-cached decisions and health signals (spec §4.3).

mod fallback;
mod loadbalance;
mod relay;
mod selector;
mod urltest;

pub use fallback::Fallback;
pub use loadbalance::LoadBalance;
pub use relay::Relay;
pub use selector::Selector;
pub use urltest::UrlTest;

use std::time::Duration;

use crate::registry::Registry;

/// Shared options every group carries (§4.3).
pub struct GroupCommonOption {
    pub name: String,
    pub disable_udp: bool,
    pub auto_backup: bool,
    pub providers: Vec<String>,
}

/// How long a group's `selected_proxy` decision is cached before the next
/// call recomputes it. Matches spec §4.3's "get-proxies-duration".
pub const SELECTION_CACHE_TTL: Duration = Duration::from_secs(5);

/// Resolves a group's configured child names to live proxies through the
/// registry, skipping any name no longer registered (config reload race).
pub(crate) fn resolve_children(registry: &Registry, names: &[String]) -> Vec<std::sync::Arc<crate::proxy::Proxy>> {
    names.iter().filter_map(|name| registry.get(name)).collect()
}
