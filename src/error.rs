use std::net::IpAddr;

use thiserror::Error;

/// Errors surfaced by an outbound adapter's dial path.
///
/// Dial errors are returned to the caller verbatim and separately inspected
/// by the [`crate::proxy::Proxy`] wrapper for liveness accounting only; they
/// never abort the process.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial {adapter} -> {host}:{port} failed: {source}")]
    Io {
        adapter: String,
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("adapter {0} does not support UDP")]
    UnsupportedUdp(String),
    #[error("XTLS flow forbids UDP on port 443")]
    XtlsUdpForbidden,
    #[error("handshake with {0} failed: {1}")]
    Handshake(String, String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("unknown adapter {0}")]
    Unknown(String),
}

/// Errors from rule evaluation. A rule that cannot be evaluated (missing
/// asset) simply fails to match; it never aborts the whole engine.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("geosite asset missing or unreadable: {0}")]
    AssetMissing(String),
    #[error("geoip lookup failed for {0}: {1}")]
    GeoipLookup(IpAddr, String),
    #[error("malformed rule line: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("rule line {line:?} is malformed: {reason}")]
    InvalidRule { line: String, reason: String },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no rule matched and no MATCH catch-all is configured")]
    NoRuleMatched,
    #[error("adapter {0} is not registered")]
    AdapterNotFound(String),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Resolve(#[from] crate::dns::ResolveError),
}

/// Errors from an ingress listener's accept loop or per-connection framing.
/// None of these abort the process (§7): a malformed request just drops the
/// one connection and the listener keeps accepting.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors provisioning the TUN interface's OS-level routes and address (§4.7).
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("route/address provisioning is not implemented for this platform")]
    Unsupported,
    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: std::process::ExitStatus },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
