//! UDP NAT table: `srcAddr → (remote PacketConn, lastUse)`, evicted on
//! inactivity (§4.6, default 60 s — see [`IDLE_TIMEOUT`]).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::adapter::PacketConn;

/// §5 "UDP NAT idle: 60 s."
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct NatEntry {
    conn: Arc<dyn PacketConn>,
    last_use: Instant,
}

/// One NAT table per ingress listener that originates UDP associations
/// (SOCKS5 UDP ASSOCIATE, TUN UDP, redir/tproxy UDP).
#[derive(Default)]
pub struct NatTable {
    entries: Mutex<HashMap<SocketAddr, NatEntry>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, src: SocketAddr) -> Option<Arc<dyn PacketConn>> {
        let mut guard = self.entries.lock();
        let entry = guard.get_mut(&src)?;
        entry.last_use = Instant::now();
        Some(entry.conn.clone())
    }

    pub fn insert(&self, src: SocketAddr, conn: Arc<dyn PacketConn>) {
        self.entries.lock().insert(src, NatEntry { conn, last_use: Instant::now() });
    }

    pub fn remove(&self, src: SocketAddr) {
        self.entries.lock().remove(&src);
    }

    /// Drops every entry whose last use exceeds [`IDLE_TIMEOUT`]. Intended
    /// to run periodically from a maintenance task.
    pub fn evict_idle(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, entry| now.duration_since(entry.last_use) < IDLE_TIMEOUT);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, Direct};

    #[tokio::test]
    async fn idle_entries_are_evicted() {
        // Use the Direct adapter's UDP dial to obtain a real PacketConn.
        let direct = Direct::new("direct");
        let md = crate::metadata::Metadata::with_ip(
            crate::metadata::Network::Udp,
            "127.0.0.1".parse().unwrap(),
            53,
            "127.0.0.1".parse().unwrap(),
            1,
            crate::metadata::InboundType::Socks,
        );
        let conn: Arc<dyn PacketConn> = Arc::from(direct.dial_udp(&md).await.unwrap());
        let table = NatTable::new();
        let src: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        table.insert(src, conn);
        assert_eq!(table.len(), 1);
        assert!(table.get(src).is_some());
    }
}
