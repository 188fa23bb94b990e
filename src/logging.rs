//! Tracing subscriber bootstrap.
//!
//! Replaces the bridge-era FFI log sink: instead of a host app installing a
//! C callback and a breadcrumb bitmask, modules emit `tracing` events against
//! per-subsystem targets (`router::tun`, `router::dispatcher`, `router::dns`,
//! ...) and the operator selects verbosity with `RUST_LOG`.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `fmt` subscriber. Call once at process startup.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}
