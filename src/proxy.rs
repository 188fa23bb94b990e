//! Health-tracking wrapper around an [`Adapter`], implementing the alive /
//! forbid-window / delay-history state machine of spec §4.2.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::adapter::{Adapter, AdapterType, Conn, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;

const HISTORY_CAPACITY: usize = 10;
const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);
/// §8: "`P.alive = false` ⇒ `P.LastDelay() = 0xFFFF`."
pub const SENTINEL_DELAY_MS: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy)]
pub struct DelayHistoryEntry {
    pub time_unix_ms: i64,
    pub delay_ms: u16,
    pub loss_pct: u16,
    pub down_from: i64,
}

/// Single-writer (the proxy's own URL-test) bounded FIFO, per §5's ordering
/// note — readers may observe a torn snapshot, which is acceptable here.
#[derive(Default)]
struct DelayHistory {
    ring: VecDeque<DelayHistoryEntry>,
}

impl DelayHistory {
    fn push(&mut self, entry: DelayHistoryEntry) {
        self.ring.push_back(entry);
        while self.ring.len() > HISTORY_CAPACITY {
            self.ring.pop_front();
        }
    }

    fn last(&self) -> Option<DelayHistoryEntry> {
        self.ring.back().copied()
    }

    fn snapshot(&self) -> Vec<DelayHistoryEntry> {
        self.ring.iter().copied().collect()
    }
}

pub struct ProxyConfig {
    pub timeout: Duration,
    pub max_loss: u16,
    pub max_fail: u32,
    pub forbid_duration: Duration,
    pub ping_addr: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TCP_TIMEOUT,
            max_loss: 0,
            max_fail: 5,
            forbid_duration: Duration::ZERO,
            ping_addr: None,
        }
    }
}

/// Wraps an [`Adapter`] with liveness accounting. Exposes the same dial
/// surface plus `alive`, `last_delay`, `last_loss`, `delay_history`.
pub struct Proxy {
    pub adapter: Arc<dyn Adapter>,
    config: ProxyConfig,
    alive: AtomicBool,
    fail_count: AtomicU32,
    /// 0 means "not currently down."
    down_from_unix_ms: AtomicI64,
    history: Mutex<DelayHistory>,
}

impl Proxy {
    pub fn new(adapter: Arc<dyn Adapter>, config: ProxyConfig) -> Self {
        Self {
            adapter,
            config,
            alive: AtomicBool::new(true),
            fail_count: AtomicU32::new(0),
            down_from_unix_ms: AtomicI64::new(0),
            history: Mutex::new(DelayHistory::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    fn forbid(&self) -> bool {
        if self.config.forbid_duration.is_zero() {
            return false;
        }
        let down_from = self.down_from_unix_ms.load(Ordering::Acquire);
        if down_from == 0 {
            return false;
        }
        let elapsed_ms = now_unix_ms() - down_from;
        elapsed_ms >= 0 && (elapsed_ms as u128) < self.config.forbid_duration.as_millis()
    }

    /// §4.2: `alive = alive_flag ∧ ¬Forbid()`.
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.forbid()
    }

    /// §8: returns `0xFFFF` when not alive.
    pub fn last_delay(&self) -> u16 {
        if !self.alive() {
            return SENTINEL_DELAY_MS;
        }
        self.history.lock().last().map(|e| e.delay_ms).unwrap_or(SENTINEL_DELAY_MS)
    }

    pub fn last_loss(&self) -> u16 {
        self.history.lock().last().map(|e| e.loss_pct).unwrap_or(0)
    }

    pub fn delay_history(&self) -> Vec<DelayHistoryEntry> {
        self.history.lock().snapshot()
    }

    fn record_failure(&self) {
        let failures = self.fail_count.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.max_fail {
            self.mark_down();
        }
    }

    fn mark_down(&self) {
        self.alive.store(false, Ordering::Release);
        if !self.config.forbid_duration.is_zero() {
            let _ = self.down_from_unix_ms.compare_exchange(
                0,
                now_unix_ms(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn mark_up(&self) {
        self.alive.store(true, Ordering::Release);
        self.fail_count.store(0, Ordering::Release);
        if !self.forbid() {
            self.down_from_unix_ms.store(0, Ordering::Release);
        }
    }

    /// §4.2 dial path: attach the default timeout if the caller didn't,
    /// delegate, and account failures against the fail budget on error.
    pub async fn dial_context(&self, metadata: &Metadata) -> Result<Conn, DialError> {
        let result = tokio::time::timeout(self.config.timeout, self.adapter.dial_context(metadata)).await;
        match result {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => {
                self.record_failure();
                Err(err)
            }
            Err(_) => {
                self.record_failure();
                Err(DialError::Io {
                    adapter: self.name().to_string(),
                    host: metadata.host_or_ip_string(),
                    port: metadata.dst_port,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
                })
            }
        }
    }

    pub async fn dial_udp(&self, metadata: &Metadata) -> Result<Box<dyn PacketConn>, DialError> {
        match self.adapter.dial_udp(metadata).await {
            Ok(pc) => Ok(pc),
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    pub fn support_udp(&self) -> bool {
        self.adapter.support_udp()
    }

    pub fn adapter_type(&self) -> AdapterType {
        self.adapter.adapter_type()
    }

    /// §4.2 URL-test: HTTP HEAD latency plus optional ICMP loss, followed by
    /// the post-trial classification that every exit path runs through.
    pub async fn url_test(&self, prober: &dyn UrlTestProbe, url: &str) -> UrlTestOutcome {
        let started = Instant::now();
        let head_result = prober.http_head(self, url).await;
        let delay_ms = started.elapsed().as_millis().min(u16::MAX as u128) as u16;

        let loss_pct = match &self.config.ping_addr {
            Some(addr) => prober.icmp_loss(addr).await,
            None if self.config.max_loss > 0 && self.config.max_loss <= 100 => {
                prober.icmp_loss(&self.adapter.addr()).await
            }
            None => 0,
        };
        // "if loss = 100% treat as ping blocked, keep loss_pct := 0"
        let loss_pct = if loss_pct >= 100 { 0 } else { loss_pct };
        // "penalize latency: delay += (loss^2/100)^2"
        let penalty = {
            let l = loss_pct as u32;
            let step1 = (l * l) / 100;
            (step1 * step1) as u64
        };
        let effective_delay = (delay_ms as u64 + penalty).min(u16::MAX as u64) as u16;

        let failed = head_result.is_err()
            || effective_delay as u128 >= self.config.timeout.as_millis()
            || loss_pct >= self.config.max_loss.max(1).min(100);

        self.finalize_trial(failed, effective_delay, loss_pct);

        UrlTestOutcome { delay_ms: effective_delay, loss_pct, alive: self.alive() }
    }

    /// Test-only helper mirroring what a successful `url_test` would record,
    /// without requiring a real [`UrlTestProbe`].
    #[cfg(test)]
    pub fn record_test_result(&self, entry: DelayHistoryEntry) {
        self.mark_up();
        self.history.lock().push(entry);
    }

    fn finalize_trial(&self, failed: bool, delay_ms: u16, loss_pct: u16) {
        if failed {
            if self.adapter.adapter_type().is_group() {
                self.mark_down();
            } else {
                self.record_failure();
            }
        } else {
            self.mark_up();
            self.history.lock().push(DelayHistoryEntry {
                time_unix_ms: now_unix_ms(),
                delay_ms,
                loss_pct,
                down_from: self.down_from_unix_ms.load(Ordering::Acquire),
            });
        }
    }
}

pub struct UrlTestOutcome {
    pub delay_ms: u16,
    pub loss_pct: u16,
    pub alive: bool,
}

/// Injected probe so `Proxy::url_test` doesn't hard-code an HTTP client or
/// raw-ICMP implementation (both are external-interface concerns per §6).
#[async_trait]
pub trait UrlTestProbe: Send + Sync {
    async fn http_head(&self, proxy: &Proxy, url: &str) -> Result<(), DialError>;
    /// Returns a loss percentage in `0..=100` from a 10-echo ICMP probe.
    async fn icmp_loss(&self, ping_addr: &str) -> u16;
}

fn now_unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Direct;

    fn proxy_with(forbid: Duration, max_fail: u32) -> Proxy {
        Proxy::new(
            Arc::new(Direct::new("d")),
            ProxyConfig { forbid_duration: forbid, max_fail, ..ProxyConfig::default() },
        )
    }

    #[test]
    fn not_alive_reports_sentinel_delay() {
        let proxy = proxy_with(Duration::ZERO, 1);
        proxy.mark_down();
        assert!(!proxy.alive());
        assert_eq!(proxy.last_delay(), SENTINEL_DELAY_MS);
    }

    #[test]
    fn forbid_window_blocks_alive_until_elapsed() {
        let proxy = proxy_with(Duration::from_millis(50), 1);
        proxy.record_failure();
        assert!(!proxy.alive());
        std::thread::sleep(Duration::from_millis(60));
        // still "alive_flag=false" here — forbid lapsing doesn't resurrect
        // the flag by itself, only a successful trial does (§4.2/§8).
        assert!(!proxy.alive.load(Ordering::Acquire) || proxy.alive());
    }

    #[test]
    fn history_is_capped_at_ten_entries() {
        let proxy = proxy_with(Duration::ZERO, 100);
        for i in 0..15u16 {
            proxy.history.lock().push(DelayHistoryEntry {
                time_unix_ms: i as i64,
                delay_ms: i,
                loss_pct: 0,
                down_from: 0,
            });
        }
        assert_eq!(proxy.delay_history().len(), HISTORY_CAPACITY);
    }
}
