use async_trait::async_trait;
use tokio_socks::tcp::Socks5Stream;

use super::{Adapter, AdapterType, Conn};
use crate::error::DialError;
use crate::metadata::Metadata;

/// Dials out through an upstream SOCKS5 proxy server. Grounded on
/// `tokio_socks::tcp::Socks5Stream`, the SOCKS5 client idiom used by
/// `other_examples/8cf27c49_Ikaleio-geofront`.
pub struct Socks5 {
    name: String,
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5 {
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Self { name: name.into(), server: server.into(), port, username: None, password: None }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

#[async_trait]
impl Adapter for Socks5 {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Socks5
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError> {
        let proxy_addr = self.addr();
        let target = (metadata.host_or_ip_string(), metadata.dst_port);

        let stream = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                Socks5Stream::connect_with_password(proxy_addr.as_str(), target, user, pass).await
            }
            _ => Socks5Stream::connect(proxy_addr.as_str(), target).await,
        }
        .map_err(|err| DialError::Handshake(self.name.clone(), err.to_string()))?;

        Ok(Conn::new(&self.name, stream.into_inner()))
    }
}
