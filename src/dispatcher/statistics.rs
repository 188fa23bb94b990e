//! Connection tracker + statistics manager: per-flow byte counters plus a
//! process-wide sampler that swaps an accumulator into a published "blip"
//! once a second.
//!
//! Bounded storage, a `Mutex`-guarded inner struct, and a `drain`/`snapshot`
//! read path, same shape as a ring-buffer telemetry sink, reshaped around
//! per-flow byte counters instead of a generic packet-event log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::metadata::Metadata;

/// One active flow's byte counters and identifying chain, registered at
/// splice start and de-registered on close (§3, §4.6 step 5).
pub struct ConnTracker {
    pub id: Uuid,
    pub host: String,
    pub dst_port: u16,
    pub chain: Vec<String>,
    pub start_unix_ms: i64,
    upload: AtomicU64,
    download: AtomicU64,
}

impl ConnTracker {
    fn new(metadata: &Metadata, chain: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: metadata.host_or_ip_string(),
            dst_port: metadata.dst_port,
            chain,
            start_unix_ms: now_unix_ms(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        }
    }

    pub fn push_uploaded(&self, n: u64) {
        self.upload.fetch_add(n, Ordering::Relaxed);
    }

    pub fn push_downloaded(&self, n: u64) {
        self.download.fetch_add(n, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

/// A live snapshot of aggregate totals and the most recent per-second
/// "blip" (throughput over the last sampling window).
#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticsSnapshot {
    pub upload_total: u64,
    pub download_total: u64,
    pub upload_blip: u64,
    pub download_blip: u64,
    pub connections: usize,
}

/// Process-wide statistics singleton (§9: "the listener slots and
/// statistics manager are process-wide singletons by design").
#[derive(Default)]
pub struct StatisticsManager {
    trackers: Mutex<HashMap<Uuid, Arc<ConnTracker>>>,
    upload_total: AtomicU64,
    download_total: AtomicU64,
    /// Bytes accumulated since the last sampler tick; swapped into the
    /// published blip and zeroed under the sampler's own exclusive access.
    upload_temp: AtomicU64,
    download_temp: AtomicU64,
    upload_blip: AtomicU64,
    download_blip: AtomicU64,
}

impl StatisticsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new flow and returns its tracker handle. The caller
    /// drops the returned `Arc` (or calls [`Self::deregister`]) when the
    /// flow closes.
    pub fn register(&self, metadata: &Metadata, chain: Vec<String>) -> Arc<ConnTracker> {
        let tracker = Arc::new(ConnTracker::new(metadata, chain));
        self.trackers.lock().insert(tracker.id, tracker.clone());
        tracker
    }

    pub fn deregister(&self, tracker: &ConnTracker) {
        self.trackers.lock().remove(&tracker.id);
        self.upload_total.fetch_add(tracker.uploaded(), Ordering::Relaxed);
        self.download_total.fetch_add(tracker.downloaded(), Ordering::Relaxed);
    }

    /// Called by splice loops on every chunk copied; feeds both the
    /// all-time total and the per-second sampler.
    pub fn push_uploaded(&self, tracker: &ConnTracker, n: u64) {
        tracker.push_uploaded(n);
        self.upload_temp.fetch_add(n, Ordering::Relaxed);
    }

    pub fn push_downloaded(&self, tracker: &ConnTracker, n: u64) {
        tracker.push_downloaded(n);
        self.download_temp.fetch_add(n, Ordering::Relaxed);
    }

    /// One tick of the blip sampler: swap `temp` into `blip`, zero `temp`.
    /// Intended to run once per second on a dedicated task (§5).
    fn tick(&self) {
        let up = self.upload_temp.swap(0, Ordering::AcqRel);
        let down = self.download_temp.swap(0, Ordering::AcqRel);
        self.upload_blip.store(up, Ordering::Release);
        self.download_blip.store(down, Ordering::Release);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let live_upload: u64 = self.trackers.lock().values().map(|t| t.uploaded()).sum();
        let live_download: u64 = self.trackers.lock().values().map(|t| t.downloaded()).sum();
        StatisticsSnapshot {
            upload_total: self.upload_total.load(Ordering::Relaxed) + live_upload,
            download_total: self.download_total.load(Ordering::Relaxed) + live_download,
            upload_blip: self.upload_blip.load(Ordering::Acquire),
            download_blip: self.download_blip.load(Ordering::Acquire),
            connections: self.trackers.lock().len(),
        }
    }
}

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the dedicated per-second "blip" ticker task (§5).
pub fn spawn_sampler(stats: Arc<StatisticsManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            interval.tick().await;
            stats.tick();
        }
    })
}

fn now_unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{InboundType, Network};
    use std::net::Ipv4Addr;

    fn md() -> Metadata {
        Metadata::with_host(Network::Tcp, "example.com", 443, Ipv4Addr::LOCALHOST.into(), 1, InboundType::Http)
    }

    #[test]
    fn register_then_deregister_moves_bytes_into_total() {
        let stats = StatisticsManager::new();
        let tracker = stats.register(&md(), vec!["Direct".into()]);
        stats.push_uploaded(&tracker, 100);
        stats.push_downloaded(&tracker, 200);
        assert_eq!(stats.snapshot().connections, 1);
        stats.deregister(&tracker);
        let snap = stats.snapshot();
        assert_eq!(snap.connections, 0);
        assert_eq!(snap.upload_total, 100);
        assert_eq!(snap.download_total, 200);
    }

    #[test]
    fn blip_reflects_only_the_latest_tick_window() {
        let stats = StatisticsManager::new();
        let tracker = stats.register(&md(), vec!["Direct".into()]);
        stats.push_uploaded(&tracker, 50);
        stats.tick();
        assert_eq!(stats.snapshot().upload_blip, 50);
        stats.tick();
        assert_eq!(stats.snapshot().upload_blip, 0);
    }
}
