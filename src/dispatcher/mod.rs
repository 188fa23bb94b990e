//! Tunnel dispatcher (§4.6): the single logical sink every ingress listener
//! and the TUN stack feeds into. Resolves a flow's rule, dials the chosen
//! adapter, and splices bytes while tracking statistics.
//!
//! Collapses the request/callback dial seam some bridging designs use for
//! cross-FFI dispatch into a single direct `async fn` call: no request id,
//! no later out-of-band result delivery — this dispatcher just awaits
//! `Proxy::dial_context` in place.

pub mod nat;
pub mod statistics;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapter::{Conn, PacketConn};
use crate::dns::Resolver;
use crate::error::DispatchError;
use crate::metadata::{Metadata, Network};
use crate::registry::Registry;
use crate::rule::RuleEngine;

use nat::NatTable;
use statistics::{ConnTracker, StatisticsManager};

const SPLICE_BUFFER_SIZE: usize = 16 * 1024;
const DEFAULT_WORKER_COUNT: usize = 4;

/// Where a UDP reply gets written back to once the remote side answers.
/// Ingress-specific: a SOCKS5 UDP ASSOCIATE responder writes through the
/// listener's bound socket; the TUN stack's responder synthesizes a raw
/// IP/UDP reply frame via its own packet-builder (§4.7).
pub trait UdpResponder: Send + Sync {
    /// `payload` arrived from `from` (the remote peer the client's datagram
    /// was addressed to) and must be delivered back to `to` (the client's
    /// own address, as seen on ingress).
    fn send(&self, payload: &[u8], to: SocketAddr, from: SocketAddr);
}

struct TcpJob {
    stream: TcpStream,
    metadata: Metadata,
    /// Bytes already read off `stream` by the ingress listener (e.g. a
    /// plain HTTP proxy request line + headers) that must reach the remote
    /// side before the ordinary splice loop takes over.
    preface: Vec<u8>,
}

/// Single logical dispatcher consumed by all ingresses (§4.6).
pub struct Dispatcher {
    registry: Arc<Registry>,
    rules: Arc<RuleEngine>,
    resolver: Arc<dyn Resolver>,
    stats: Arc<StatisticsManager>,
    nat: Arc<NatTable>,
    tcp_tx: mpsc::UnboundedSender<TcpJob>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, rules: Arc<RuleEngine>, resolver: Arc<dyn Resolver>) -> Arc<Self> {
        Self::with_worker_count(registry, rules, resolver, DEFAULT_WORKER_COUNT)
    }

    pub fn with_worker_count(
        registry: Arc<Registry>,
        rules: Arc<RuleEngine>,
        resolver: Arc<dyn Resolver>,
        worker_count: usize,
    ) -> Arc<Self> {
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel::<TcpJob>();
        let dispatcher = Arc::new(Self {
            registry,
            rules,
            resolver,
            stats: Arc::new(StatisticsManager::new()),
            nat: Arc::new(NatTable::new()),
            tcp_tx,
        });

        // §4.6 "a fixed worker pool dequeues and runs handleTCPConn." The
        // channel has one consumer-side receiver shared across N worker
        // tasks via a mutex-guarded recv loop, the simplest fair-dequeue
        // shape for an mpsc without pulling in a dedicated work-stealing
        // queue crate.
        let rx = Arc::new(tokio::sync::Mutex::new(tcp_rx));
        for worker_id in 0..worker_count.max(1) {
            let dispatcher = dispatcher.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    debug!(worker_id, "tcp worker picked up flow");
                    dispatcher.handle_tcp_conn(job.stream, job.metadata, job.preface).await;
                }
            });
        }

        statistics::spawn_sampler(dispatcher.stats.clone());
        dispatcher
    }

    pub fn stats(&self) -> &Arc<StatisticsManager> {
        &self.stats
    }

    /// `Add(tcpFlow)`: enqueue onto the unbounded MPSC channel for the
    /// worker pool to pick up.
    pub fn add_tcp(&self, stream: TcpStream, metadata: Metadata) {
        let _ = self.tcp_tx.send(TcpJob { stream, metadata, preface: Vec::new() });
    }

    /// Same as [`Self::add_tcp`] but replays `preface` to the dialed remote
    /// before the ordinary splice loop begins. Used by the HTTP ingress for
    /// plain (non-CONNECT) proxy requests, whose request line and headers
    /// were already consumed off `stream` while sniffing the target host.
    pub fn add_tcp_with_preface(&self, stream: TcpStream, metadata: Metadata, preface: Vec<u8>) {
        let _ = self.tcp_tx.send(TcpJob { stream, metadata, preface });
    }

    /// Resolves `metadata`'s destination adapter via the rule engine,
    /// performing DNS resolution first if some IP-needing rule requires it
    /// and only a hostname is known (§4.4 step 1).
    async fn resolve_adapter_name(&self, metadata: &mut Metadata) -> Result<String, DispatchError> {
        if self.rules.any_rule_needs_resolution(metadata) {
            let outcome = self.resolver.resolve(&metadata.host)?;
            if let Some(addr) = outcome.addresses.first().and_then(|s| s.parse().ok()) {
                metadata.dst_ip = Some(addr);
                metadata.dns_resolved = true;
            }
        }
        self.rules.resolve(metadata).map(str::to_string).ok_or(DispatchError::NoRuleMatched)
    }

    /// `handleTCPConn` (§4.6): rule match → dial → splice with statistics.
    async fn handle_tcp_conn(&self, client: TcpStream, mut metadata: Metadata, preface: Vec<u8>) {
        let adapter_name = match self.resolve_adapter_name(&mut metadata).await {
            Ok(name) => name,
            Err(err) => {
                warn!(host = %metadata.host_or_ip_string(), cause = %err, "dropping flow: no adapter resolved");
                return;
            }
        };
        let Some(proxy) = self.registry.get(&adapter_name) else {
            warn!(adapter = %adapter_name, "dropping flow: adapter not registered");
            return;
        };

        let mut conn = match proxy.dial_context(&metadata).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(adapter = %adapter_name, host = %metadata.host_or_ip_string(), cause = %err, "dial failed");
                return;
            }
        };

        if !preface.is_empty() && conn.inner.write_all(&preface).await.is_err() {
            return;
        }

        let tracker = self.stats.register(&metadata, conn.chain.clone());
        info!(adapter = %adapter_name, host = %metadata.host_or_ip_string(), chain = ?tracker.chain, "flow dialed");
        if !preface.is_empty() {
            self.stats.push_uploaded(&tracker, preface.len() as u64);
        }
        splice(client, conn, &self.stats, &tracker).await;
        self.stats.deregister(&tracker);
    }

    /// `handleUDPPacket` (§4.6): NAT lookup; on miss, rule-match + DialUDP,
    /// then spawn a reader relaying replies back to `src` until idle.
    pub async fn handle_udp_packet(
        &self,
        src: SocketAddr,
        payload: &[u8],
        mut metadata: Metadata,
        responder: Arc<dyn UdpResponder>,
    ) {
        debug_assert_eq!(metadata.network, Network::Udp);

        if let Some(conn) = self.nat.get(src) {
            if let Some(target) = metadata.dst_ip.map(|ip| SocketAddr::new(ip, metadata.dst_port)) {
                let _ = conn.send_to(payload, target).await;
            }
            return;
        }

        let adapter_name = match self.resolve_adapter_name(&mut metadata).await {
            Ok(name) => name,
            Err(err) => {
                debug!(host = %metadata.host_or_ip_string(), cause = %err, "dropping udp packet: no adapter resolved");
                return;
            }
        };
        let Some(proxy) = self.registry.get(&adapter_name) else {
            debug!(adapter = %adapter_name, "dropping udp packet: adapter not registered");
            return;
        };
        let conn: Arc<dyn PacketConn> = match proxy.dial_udp(&metadata).await {
            Ok(conn) => Arc::from(conn),
            Err(err) => {
                debug!(adapter = %adapter_name, cause = %err, "udp dial failed");
                return;
            }
        };

        self.nat.insert(src, conn.clone());
        spawn_udp_reader(conn.clone(), src, responder, self.nat.clone());

        if let Some(target) = metadata.dst_ip.map(|ip| SocketAddr::new(ip, metadata.dst_port)) {
            let _ = conn.send_to(payload, target).await;
        }
    }

    /// Periodic idle-UDP-NAT sweep (§4.6 "evicted on inactivity"); callers
    /// spawn this on an interval alongside the statistics sampler.
    pub fn evict_idle_udp(&self) {
        self.nat.evict_idle();
    }

    /// TUN-flow entry point (§4.7): the TUN stack has no `TcpStream` to hand
    /// over (traffic arrives as raw IP frames through a smoltcp socket), so
    /// instead of `add_tcp` it gets a pair of byte channels bridged onto the
    /// dialed `Conn` by a background pump task. Returns `None` if no rule
    /// resolves or the dial fails; the caller should reset the flow.
    pub async fn add_tun_flow(&self, mut metadata: Metadata) -> Option<TunFlowChannels> {
        let adapter_name = match self.resolve_adapter_name(&mut metadata).await {
            Ok(name) => name,
            Err(err) => {
                debug!(host = %metadata.host_or_ip_string(), cause = %err, "tun flow: no adapter resolved");
                return None;
            }
        };
        let proxy = self.registry.get(&adapter_name)?;
        let conn = match proxy.dial_context(&metadata).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(adapter = %adapter_name, host = %metadata.host_or_ip_string(), cause = %err, "tun dial failed");
                return None;
            }
        };

        let tracker = self.stats.register(&metadata, conn.chain.clone());
        info!(adapter = %adapter_name, host = %metadata.host_or_ip_string(), chain = ?tracker.chain, "tun flow dialed");

        let (to_remote_tx, to_remote_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (from_remote_tx, from_remote_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let stats = self.stats.clone();
        tokio::spawn(pump_tun_flow(conn, to_remote_rx, from_remote_tx, stats, tracker));

        Some(TunFlowChannels { to_remote: to_remote_tx, from_remote: from_remote_rx })
    }
}

/// Byte channels bridging a smoltcp-side TUN flow to its dialed [`Conn`].
/// `to_remote` carries client→remote bytes; `from_remote` yields remote→client.
pub struct TunFlowChannels {
    pub to_remote: mpsc::UnboundedSender<Vec<u8>>,
    pub from_remote: mpsc::UnboundedReceiver<Vec<u8>>,
}

async fn pump_tun_flow(
    remote: Conn,
    mut to_remote_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    from_remote_tx: mpsc::UnboundedSender<Vec<u8>>,
    stats: Arc<StatisticsManager>,
    tracker: Arc<ConnTracker>,
) {
    let (mut remote_rd, mut remote_wr) = io::split(remote.inner);

    let upload_stats = stats.clone();
    let upload_tracker = tracker.clone();
    let upload = async move {
        while let Some(chunk) = to_remote_rx.recv().await {
            if remote_wr.write_all(&chunk).await.is_err() {
                break;
            }
            upload_stats.push_uploaded(&upload_tracker, chunk.len() as u64);
        }
        let _ = remote_wr.shutdown().await;
    };

    let download_stats = stats.clone();
    let download_tracker = tracker.clone();
    let download = async move {
        let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
        loop {
            let n = match remote_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            download_stats.push_downloaded(&download_tracker, n as u64);
            if from_remote_tx.send(buf[..n].to_vec()).is_err() {
                break;
            }
        }
    };

    tokio::join!(upload, download);
    stats.deregister(&tracker);
}

/// Spawns the dedicated idle-UDP-NAT janitor task, ticking at a fraction of
/// [`nat::IDLE_TIMEOUT`] so stale entries are reclaimed promptly.
pub fn spawn_udp_nat_janitor(dispatcher: Arc<Dispatcher>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(nat::IDLE_TIMEOUT / 4);
        loop {
            interval.tick().await;
            dispatcher.evict_idle_udp();
        }
    })
}

fn spawn_udp_reader(conn: Arc<dyn PacketConn>, src: SocketAddr, responder: Arc<dyn UdpResponder>, nat: Arc<NatTable>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let deadline = tokio::time::sleep(nat::IDLE_TIMEOUT);
            tokio::select! {
                result = conn.recv_from(&mut buf) => {
                    match result {
                        Ok((n, from)) => responder.send(&buf[..n], src, from),
                        Err(_) => break,
                    }
                }
                _ = deadline => break,
            }
        }
        nat.remove(src);
    });
}

/// Two parallel copy loops (client↔remote), each tracking bytes via the
/// tracker; first error or EOF closes both sides (§4.6 step 6).
async fn splice(client: TcpStream, remote: Conn, stats: &Arc<StatisticsManager>, tracker: &Arc<ConnTracker>) {
    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut remote_rd, mut remote_wr) = io::split(remote.inner);

    let upload_stats = stats.clone();
    let upload_tracker = tracker.clone();
    let upload = async move {
        let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
        loop {
            let n = match client_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if remote_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
            upload_stats.push_uploaded(&upload_tracker, n as u64);
        }
        let _ = remote_wr.shutdown().await;
    };

    let download_stats = stats.clone();
    let download_tracker = tracker.clone();
    let download = async move {
        let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
        loop {
            let n = match remote_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if client_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
            download_stats.push_downloaded(&download_tracker, n as u64);
        }
        let _ = client_wr.shutdown().await;
    };

    tokio::join!(upload, download);
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::adapter::Reject;
    use crate::dns::SystemResolver;
    use crate::metadata::InboundType;
    use crate::proxy::{Proxy, ProxyConfig};
    use crate::rule::{GeoipMatcher, GeositeAsset, Rule, RuleEngine};

    #[derive(Default)]
    struct RecordingResponder {
        sent: StdMutex<Vec<(SocketAddr, SocketAddr)>>,
    }

    impl UdpResponder for RecordingResponder {
        fn send(&self, _payload: &[u8], to: SocketAddr, from: SocketAddr) {
            self.sent.lock().unwrap().push((to, from));
        }
    }

    /// §8 Scenario 2: a datagram matched by a rule pointing at `Reject` must
    /// be dropped with no NAT entry created at all, not merely discarded
    /// after a black-hole dial succeeds.
    #[tokio::test]
    async fn rejected_udp_flow_creates_no_nat_entry() {
        let registry = Arc::new(Registry::new());
        registry.insert("REJECT".to_string(), Arc::new(Proxy::new(Arc::new(Reject::new("REJECT")), ProxyConfig::default())));

        let rules = vec![
            RuleEngine::parse_line("IP-CIDR,8.8.8.8/32,REJECT").unwrap(),
            Rule::Match { adapter: "REJECT".to_string() },
        ];
        let rules = Arc::new(RuleEngine::new(rules, Arc::new(GeositeAsset::empty()), Arc::new(GeoipMatcher::disabled())));
        let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver::default());

        let dispatcher = Dispatcher::with_worker_count(registry, rules, resolver, 1);

        let src: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let metadata = Metadata::with_ip(
            Network::Udp,
            Ipv4Addr::new(8, 8, 8, 8).into(),
            53,
            Ipv4Addr::LOCALHOST.into(),
            40000,
            InboundType::Socks,
        );
        let responder = Arc::new(RecordingResponder::default());

        dispatcher.handle_udp_packet(src, b"\x00\x00\x01", metadata, responder.clone()).await;

        assert_eq!(dispatcher.nat.len(), 0);
        assert!(responder.sent.lock().unwrap().is_empty());
    }
}
