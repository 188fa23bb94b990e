//! Flow state machine driving the TUN virtual interface (§4.7). Pooled
//! smoltcp sockets stand in for a real per-flow dial/send/close surface,
//! calling straight into [`Dispatcher::add_tun_flow`] and
//! [`Dispatcher::handle_udp_packet`] instead of crossing any FFI boundary.
//!
//! TCP flows still ride a pooled smoltcp `tcp::Socket` so the three-way
//! handshake and retransmission are handled for us. UDP has no handshake to
//! emulate, so it skips the smoltcp socket layer entirely: packets are
//! parsed straight off the inbound frame and replies are synthesized with
//! [`packet_builder::build_udp_response`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer, State as TcpState};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpListenEndpoint, Ipv4Address, Ipv6Address};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::dispatcher::{Dispatcher, TunFlowChannels, UdpResponder};
use crate::metadata::{InboundType, Metadata, Network};

use super::device::{self, ParsedPacket, TcpPacket, TunDevice, TunHandle};
use super::packet_builder;
use super::platform;

const TCP_SOCKET_COUNT: usize = 128;
const TCP_RX_BUFFER_SIZE: usize = 16 * 1024;
const TCP_TX_BUFFER_SIZE: usize = 16 * 1024;
const MAX_BUFFERED_PAYLOADS: usize = 8;
const MAX_BUFFERED_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    src_ip: IpAddr,
    src_port: u16,
    dst_ip: IpAddr,
    dst_port: u16,
}

enum FlowState {
    PendingDial,
    Ready(TunFlowChannels),
}

struct FlowEntry {
    socket: SocketHandle,
    state: FlowState,
    buffered: Vec<Vec<u8>>,
    buffered_bytes: usize,
}

/// Owns the smoltcp interface/socket pool and the map of admitted TCP flows.
/// Not `Send`-shared: a single task owns it and drives `poll()` in a loop,
/// waking on `wake()` whenever the device or a dial result has new work.
pub struct TunStack {
    interface: Interface,
    sockets: SocketSet<'static>,
    device: TunDevice,
    tcp_pool: Vec<SocketHandle>,
    flows: HashMap<FlowKey, FlowEntry>,
    dispatcher: Arc<Dispatcher>,
    wake: Arc<Notify>,
    ready_tx: mpsc::UnboundedSender<(FlowKey, Option<TunFlowChannels>)>,
    ready_rx: mpsc::UnboundedReceiver<(FlowKey, Option<TunFlowChannels>)>,
}

impl TunStack {
    pub fn new(mtu: usize, dispatcher: Arc<Dispatcher>) -> Self {
        let wake = Arc::new(Notify::new());
        let mut device = TunDevice::new(mtu, wake.clone(), 2048);
        let (interface, sockets, tcp_pool) = build_interface_and_sockets(&mut device);
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            interface,
            sockets,
            device,
            tcp_pool,
            flows: HashMap::new(),
            dispatcher,
            wake,
            ready_tx,
            ready_rx,
        }
    }

    /// Handle the platform read/write tasks use to push inbound bytes read
    /// from the OS TUN fd and drain outbound bytes to write back to it.
    pub fn device_handle(&self) -> TunHandle {
        self.device.handle()
    }

    /// Notified whenever the stack has new work for `poll` to pick up
    /// (a frame arrived, or a dial finished) — the driving task should
    /// `select!` on this alongside its poll interval.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Feeds one raw IP frame read from the TUN fd into the stack. UDP
    /// packets are intercepted here and never reach the smoltcp device.
    pub fn accept_inbound(&mut self, frame: &[u8]) {
        match device::parse_packet_validated(frame) {
            Ok(ParsedPacket::Tcp(tcp)) => {
                self.admit_tcp(&tcp);
                self.device.handle().push_inbound(frame);
            }
            Ok(ParsedPacket::Udp(udp)) => {
                self.dispatch_udp(udp.src, udp.dst, udp.src_port, udp.dst_port, udp.payload);
            }
            Ok(ParsedPacket::Other) | Err(_) => {
                self.device.handle().push_inbound(frame);
            }
        }
    }

    fn dispatch_udp(&self, src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, payload: &[u8]) {
        let metadata = Metadata::with_ip(Network::Udp, dst, dst_port, src, src_port, InboundType::Tun);
        let responder: Arc<dyn UdpResponder> = Arc::new(TunUdpResponder { device: self.device.handle() });
        let dispatcher = self.dispatcher.clone();
        let client = SocketAddr::new(src, src_port);
        let payload = payload.to_vec();
        tokio::spawn(async move {
            dispatcher.handle_udp_packet(client, &payload, metadata, responder).await;
        });
    }

    fn admit_tcp(&mut self, tcp: &TcpPacket<'_>) {
        let key = FlowKey {
            src_ip: tcp.src,
            src_port: tcp.src_port,
            dst_ip: tcp.dst,
            dst_port: tcp.dst_port,
        };
        if self.flows.contains_key(&key) {
            return;
        }
        let Some(socket_handle) = self.tcp_pool.pop() else {
            warn!("tun tcp pool exhausted, dropping SYN");
            return;
        };
        let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
        let endpoint = IpListenEndpoint { addr: Some(to_smoltcp_addr(key.dst_ip)), port: key.dst_port };
        let _ = socket.listen(endpoint);

        self.flows.insert(
            key,
            FlowEntry { socket: socket_handle, state: FlowState::PendingDial, buffered: Vec::new(), buffered_bytes: 0 },
        );

        let metadata = Metadata::with_ip(Network::Tcp, key.dst_ip, key.dst_port, key.src_ip, key.src_port, InboundType::Tun);
        let dispatcher = self.dispatcher.clone();
        let ready_tx = self.ready_tx.clone();
        tokio::spawn(async move {
            let channels = dispatcher.add_tun_flow(metadata).await;
            let _ = ready_tx.send((key, channels));
        });
    }

    /// Drives the smoltcp interface, applies any dial results that arrived,
    /// and pumps bytes between ready sockets and their dispatcher channels.
    /// Returns whether any work happened.
    pub fn poll(&mut self, now: Instant) -> bool {
        let mut did_work = false;

        while let Ok((key, channels)) = self.ready_rx.try_recv() {
            did_work = true;
            match channels {
                Some(channels) => self.on_dial_ready(key, channels),
                None => self.on_dial_failed(key),
            }
        }

        if self.interface.poll(now, &mut self.device, &mut self.sockets) {
            did_work = true;
        }

        if self.buffer_pending_flows() {
            did_work = true;
        }

        if self.pump_ready_flows() {
            did_work = true;
        }

        if self.reap_closed_flows() {
            did_work = true;
        }

        did_work
    }

    fn on_dial_ready(&mut self, key: FlowKey, channels: TunFlowChannels) {
        let Some(entry) = self.flows.get_mut(&key) else { return };
        for payload in entry.buffered.drain(..) {
            let _ = channels.to_remote.send(payload);
        }
        entry.buffered_bytes = 0;
        entry.state = FlowState::Ready(channels);
        debug!(dst = %key.dst_ip, port = key.dst_port, "tun tcp flow ready");
    }

    fn on_dial_failed(&mut self, key: FlowKey) {
        if let Some(entry) = self.flows.remove(&key) {
            let socket = self.sockets.get_mut::<TcpSocket>(entry.socket);
            socket.abort();
            self.tcp_pool.push(entry.socket);
        }
        if let Some(frame) = packet_builder::build_tcp_reset(key.src_ip, key.dst_ip, key.src_port, key.dst_port, 0) {
            self.device.handle().push_outbound(frame);
        }
    }

    /// Drains client bytes waiting on a socket whose dial hasn't resolved
    /// yet, so they aren't lost once the remote channel is ready.
    fn buffer_pending_flows(&mut self) -> bool {
        let mut did_work = false;
        let pending_keys: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, entry)| matches!(entry.state, FlowState::PendingDial))
            .map(|(key, _)| *key)
            .collect();

        for key in pending_keys {
            let Some(socket_handle) = self.flows.get(&key).map(|entry| entry.socket) else { continue };
            let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
            let mut payloads: Vec<Vec<u8>> = Vec::new();
            while socket.can_recv() {
                let mut payload = Vec::new();
                let received = socket.recv(|data| {
                    payload.extend_from_slice(data);
                    (data.len(), ())
                });
                if received.is_err() || payload.is_empty() {
                    break;
                }
                payloads.push(payload);
            }
            if payloads.is_empty() {
                continue;
            }
            let Some(entry) = self.flows.get_mut(&key) else { continue };
            for payload in payloads {
                did_work = true;
                if !buffer_payload(entry, &payload) {
                    warn!(dst = %key.dst_ip, port = key.dst_port, "tun tcp pending-dial buffer full, dropping bytes");
                }
            }
        }
        did_work
    }

    fn pump_ready_flows(&mut self) -> bool {
        let mut did_work = false;
        let ready_keys: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, entry)| matches!(entry.state, FlowState::Ready(_)))
            .map(|(key, _)| *key)
            .collect();

        for key in ready_keys {
            let Some(socket_handle) = self.flows.get(&key).map(|entry| entry.socket) else { continue };
            let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);

            let mut upload_payloads: Vec<Vec<u8>> = Vec::new();
            while socket.can_recv() {
                let mut payload = Vec::new();
                let received = socket.recv(|data| {
                    payload.extend_from_slice(data);
                    (data.len(), ())
                });
                if received.is_err() || payload.is_empty() {
                    break;
                }
                upload_payloads.push(payload);
            }
            let can_send = socket.can_send();

            let Some(entry) = self.flows.get_mut(&key) else { continue };
            let FlowState::Ready(channels) = &mut entry.state else { continue };

            for payload in upload_payloads {
                did_work = true;
                if channels.to_remote.send(payload).is_err() {
                    break;
                }
            }

            if can_send {
                loop {
                    match channels.from_remote.try_recv() {
                        Ok(payload) if payload.is_empty() => continue,
                        Ok(payload) => {
                            did_work = true;
                            let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                            if socket.send_slice(&payload).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        did_work
    }

    fn reap_closed_flows(&mut self) -> bool {
        let closed: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, entry)| {
                matches!(self.sockets.get::<TcpSocket>(entry.socket).state(), TcpState::Closed)
            })
            .map(|(key, _)| *key)
            .collect();

        for key in &closed {
            if let Some(entry) = self.flows.remove(key) {
                self.tcp_pool.push(entry.socket);
            }
        }
        !closed.is_empty()
    }
}

/// Buffers client bytes that arrive before the dial for their flow resolves;
/// bounded, since an unbounded buffer for a flow that never dials is a
/// memory leak waiting to happen.
fn buffer_payload(entry: &mut FlowEntry, payload: &[u8]) -> bool {
    if entry.buffered.len() >= MAX_BUFFERED_PAYLOADS || entry.buffered_bytes + payload.len() > MAX_BUFFERED_BYTES {
        return false;
    }
    entry.buffered_bytes += payload.len();
    entry.buffered.push(payload.to_vec());
    true
}

struct TunUdpResponder {
    device: TunHandle,
}

impl UdpResponder for TunUdpResponder {
    fn send(&self, payload: &[u8], to: SocketAddr, from: SocketAddr) {
        // `from` is whichever remote peer actually answered this send — a
        // NAT entry can relay to several remote destinations over its
        // lifetime (§4.6), so the reply frame's source must reflect the
        // peer that sent this particular datagram, not the flow's first one.
        if let Some(frame) = packet_builder::build_udp_response(from.ip(), from.port(), to.ip(), to.port(), payload) {
            self.device.push_outbound(frame);
        }
    }
}

fn to_smoltcp_addr(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
    }
}

fn build_interface_and_sockets(device: &mut TunDevice) -> (Interface, SocketSet<'static>, Vec<SocketHandle>) {
    let ipv4_addr = Ipv4Address::from_bytes(&platform::INTERFACE_ADDRESS.octets());
    let (_, prefix) = platform::DEFAULT_CIDR;

    let mut config = IfaceConfig::new(HardwareAddress::Ip);
    config.random_seed = 0;
    let mut interface = Interface::new(config, device, Instant::from_millis(0));
    interface.set_any_ip(true);
    interface.update_ip_addrs(|ip_addrs| {
        ip_addrs.clear();
        let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv4(ipv4_addr), prefix));
    });
    {
        let routes = interface.routes_mut();
        routes.add_default_ipv4_route(ipv4_addr).ok();
    }

    let mut sockets = SocketSet::new(Vec::new());
    let mut tcp_pool = Vec::with_capacity(TCP_SOCKET_COUNT);
    for _ in 0..TCP_SOCKET_COUNT {
        let socket = TcpSocket::new(
            TcpSocketBuffer::new(vec![0; TCP_RX_BUFFER_SIZE]),
            TcpSocketBuffer::new(vec![0; TCP_TX_BUFFER_SIZE]),
        );
        tcp_pool.push(sockets.add(socket));
    }

    (interface, sockets, tcp_pool)
}

#[cfg(test)]
mod tests;
