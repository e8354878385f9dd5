//! Reliable-datagram transport over UDP
//!
//! Owns the UDP socket and the connected peer set. A reader task hands raw
//! datagrams to the owner through a channel; `poll` is the only consumer, so
//! the transport is never touched by two threads at once.
//!
//! Below the application tag byte sits a small control layer:
//!
//! ```text
//! HELLO   0x01  cookie(u32)                  connect request
//! WELCOME 0x02  cookie(u32) peer_id(u32)     connect accept
//! BYE     0x03                               graceful close / refusal
//! PING    0x04 / PONG 0x05                   keepalive
//! ACK     0x06  seq(u16)                     reliable delivery receipt
//! DATA    0x10  channel(u8) flags(u8) seq(u16) tag || body
//! ```
//!
//! Channel 0 is ordered/reliable: per-peer u16 sequence numbers, every
//! datagram ack-elicited, retransmitted until acknowledged, delivered in
//! order with out-of-order arrivals buffered. Channel 1 is fire-and-forget.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::net::peers::{PeerId, PeerRegistry, RegistryError};

pub const CTRL_HELLO: u8 = 0x01;
pub const CTRL_WELCOME: u8 = 0x02;
pub const CTRL_BYE: u8 = 0x03;
pub const CTRL_PING: u8 = 0x04;
pub const CTRL_PONG: u8 = 0x05;
pub const CTRL_ACK: u8 = 0x06;
pub const CTRL_DATA: u8 = 0x10;

pub const FLAG_RELIABLE: u8 = 0x01;

/// Ordered/reliable channel
pub const CHANNEL_ORDERED: u8 = 0;
/// Unreliable channel
pub const CHANNEL_LOOSE: u8 = 1;

/// Transport failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket: {0}")]
    Init(std::io::Error),
}

/// Typed events handed to the tick loop
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connect { peer: PeerId },
    Disconnect { peer: PeerId },
    Receive { peer: PeerId, tag: u8, body: Vec<u8> },
}

/// Retransmission and liveness tuning
#[derive(Debug, Clone)]
pub struct TransportTuning {
    pub retransmit_interval: Duration,
    pub max_retries: u32,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            retransmit_interval: Duration::from_millis(200),
            max_retries: 10,
            keepalive_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

struct Pending {
    datagram: Vec<u8>,
    last_sent: Instant,
    retries: u32,
}

struct PeerLink {
    addr: SocketAddr,
    next_seq: u16,
    pending: BTreeMap<u16, Pending>,
    recv_next: u16,
    recv_buffer: BTreeMap<u16, Vec<u8>>,
    last_recv: Instant,
    last_keepalive: Instant,
}

impl PeerLink {
    fn new(addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            addr,
            next_seq: 0,
            pending: BTreeMap::new(),
            recv_next: 0,
            recv_buffer: BTreeMap::new(),
            last_recv: now,
            last_keepalive: now,
        }
    }
}

/// `a` is strictly ahead of `b` in u16 sequence space
#[inline]
fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

fn send_raw(socket: &UdpSocket, addr: SocketAddr, datagram: &[u8]) -> bool {
    socket.try_send_to(datagram, addr).is_ok()
}

fn welcome_datagram(cookie: u32, peer: PeerId) -> Vec<u8> {
    let mut d = Vec::with_capacity(9);
    d.push(CTRL_WELCOME);
    d.extend_from_slice(&cookie.to_le_bytes());
    d.extend_from_slice(&peer.to_le_bytes());
    d
}

fn ack_datagram(seq: u16) -> Vec<u8> {
    let mut d = Vec::with_capacity(3);
    d.push(CTRL_ACK);
    d.extend_from_slice(&seq.to_le_bytes());
    d
}

/// UDP host: peer lifecycle, two channels, send/broadcast
pub struct ReliableTransport {
    socket: Arc<UdpSocket>,
    registry: Arc<PeerRegistry>,
    links: HashMap<PeerId, PeerLink>,
    rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    reader: tokio::task::JoinHandle<()>,
    tuning: TransportTuning,
    pending_disconnects: Vec<PeerId>,
    local_addr: SocketAddr,
}

impl ReliableTransport {
    /// Bind the UDP socket and start the reader task
    pub async fn bind(
        bind_address: IpAddr,
        port: u16,
        max_clients: usize,
    ) -> Result<Self, TransportError> {
        Self::bind_with(bind_address, port, max_clients, TransportTuning::default()).await
    }

    pub async fn bind_with(
        bind_address: IpAddr,
        port: u16,
        max_clients: usize,
        tuning: TransportTuning,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((bind_address, port))
            .await
            .map_err(TransportError::Init)?;
        let local_addr = socket.local_addr().map_err(TransportError::Init)?;
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::unbounded_channel();
        let reader_socket = socket.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        if tx.send((addr, buf[..len].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("UDP receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        info!("transport listening on {}", local_addr);

        Ok(Self {
            socket,
            registry: Arc::new(PeerRegistry::new(max_clients)),
            links: HashMap::new(),
            rx,
            reader,
            tuning,
            pending_disconnects: Vec::new(),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to the peer registry
    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub fn connected_peers(&self) -> usize {
        self.links.len()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.links.contains_key(&peer)
    }

    /// Drain pending events, waiting at most `timeout` for the first one
    pub async fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        for peer in self.pending_disconnects.drain(..) {
            events.push(TransportEvent::Disconnect { peer });
        }

        if events.is_empty() {
            if let Ok(Some((addr, data))) = tokio::time::timeout(timeout, self.rx.recv()).await {
                self.handle_datagram(addr, &data, &mut events);
            }
        }

        while let Ok((addr, data)) = self.rx.try_recv() {
            self.handle_datagram(addr, &data, &mut events);
        }

        self.service(Instant::now(), &mut events);
        events
    }

    /// Send a tagged payload to one peer. Returns false when the peer is
    /// unknown or the datagram could not be handed to the socket; a reliable
    /// payload that was queued is still retransmitted later.
    pub fn send(&mut self, peer: PeerId, tag: u8, body: &[u8], reliable: bool) -> bool {
        let Some(link) = self.links.get_mut(&peer) else {
            return false;
        };

        let mut datagram = Vec::with_capacity(6 + body.len());
        datagram.push(CTRL_DATA);
        datagram.push(if reliable { CHANNEL_ORDERED } else { CHANNEL_LOOSE });
        datagram.push(if reliable { FLAG_RELIABLE } else { 0 });

        let seq = if reliable {
            let seq = link.next_seq;
            link.next_seq = link.next_seq.wrapping_add(1);
            seq
        } else {
            0
        };
        datagram.extend_from_slice(&seq.to_le_bytes());
        datagram.push(tag);
        datagram.extend_from_slice(body);

        let sent = send_raw(&self.socket, link.addr, &datagram);
        if reliable {
            link.pending.insert(
                seq,
                Pending {
                    datagram,
                    last_sent: Instant::now(),
                    retries: 0,
                },
            );
        }
        sent
    }

    /// Send a tagged payload to every connected peer except `exclude`
    pub fn broadcast(&mut self, tag: u8, body: &[u8], exclude: Option<PeerId>) -> bool {
        let peers: Vec<PeerId> = self
            .links
            .keys()
            .copied()
            .filter(|p| Some(*p) != exclude)
            .collect();

        let mut all_sent = true;
        for peer in peers {
            if !self.send(peer, tag, body, false) {
                all_sent = false;
            }
        }
        all_sent
    }

    /// Initiate a graceful close. The synthetic Disconnect event surfaces on
    /// the next poll so the caller tears state down on its own path.
    pub fn disconnect(&mut self, peer: PeerId) {
        if let Some(link) = self.links.remove(&peer) {
            send_raw(&self.socket, link.addr, &[CTRL_BYE]);
            self.registry.detach_id(peer);
            self.pending_disconnects.push(peer);
            info!("disconnecting peer {}", peer);
        }
    }

    /// Close every connection and stop the reader task
    pub fn close(&mut self) {
        for link in self.links.values() {
            send_raw(&self.socket, link.addr, &[CTRL_BYE]);
        }
        for peer in self.links.keys().copied().collect::<Vec<_>>() {
            self.registry.detach_id(peer);
        }
        self.links.clear();
        self.reader.abort();
    }

    fn handle_datagram(&mut self, addr: SocketAddr, data: &[u8], events: &mut Vec<TransportEvent>) {
        let Some(&ctrl) = data.first() else {
            return;
        };

        match ctrl {
            CTRL_HELLO => self.handle_hello(addr, data, events),
            CTRL_BYE => {
                if let Some(peer) = self.registry.reverse(addr) {
                    info!("peer {} said goodbye", peer);
                    self.drop_peer(peer, events);
                }
            }
            CTRL_PING => {
                if let Some(peer) = self.registry.reverse(addr) {
                    if let Some(link) = self.links.get_mut(&peer) {
                        link.last_recv = Instant::now();
                        send_raw(&self.socket, addr, &[CTRL_PONG]);
                    }
                }
            }
            CTRL_PONG => {
                if let Some(peer) = self.registry.reverse(addr) {
                    if let Some(link) = self.links.get_mut(&peer) {
                        link.last_recv = Instant::now();
                    }
                }
            }
            CTRL_ACK => {
                if data.len() < 3 {
                    return;
                }
                let seq = u16::from_le_bytes([data[1], data[2]]);
                if let Some(peer) = self.registry.reverse(addr) {
                    if let Some(link) = self.links.get_mut(&peer) {
                        link.pending.remove(&seq);
                        link.last_recv = Instant::now();
                    }
                }
            }
            CTRL_DATA => self.handle_data(addr, data, events),
            other => {
                debug!("unknown control byte 0x{:02x} from {}", other, addr);
            }
        }
    }

    fn handle_hello(&mut self, addr: SocketAddr, data: &[u8], events: &mut Vec<TransportEvent>) {
        if data.len() < 5 {
            return;
        }
        let cookie = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);

        // Duplicate HELLO: the WELCOME was lost, repeat it
        if let Some(peer) = self.registry.reverse(addr) {
            send_raw(&self.socket, addr, &welcome_datagram(cookie, peer));
            return;
        }

        match self.registry.attach(addr) {
            Ok(peer) => {
                self.links.insert(peer, PeerLink::new(addr));
                send_raw(&self.socket, addr, &welcome_datagram(cookie, peer));
                info!("peer {} connected from {}", peer, addr);
                events.push(TransportEvent::Connect { peer });
            }
            Err(RegistryError::Full(capacity)) => {
                warn!("refusing connection from {}: at capacity {}", addr, capacity);
                send_raw(&self.socket, addr, &[CTRL_BYE]);
            }
            Err(e) => {
                warn!("failed to attach {}: {}", addr, e);
            }
        }
    }

    fn handle_data(&mut self, addr: SocketAddr, data: &[u8], events: &mut Vec<TransportEvent>) {
        if data.len() < 6 {
            return;
        }
        let Some(peer) = self.registry.reverse(addr) else {
            // Data from a stranger: tell it to reconnect
            send_raw(&self.socket, addr, &[CTRL_BYE]);
            return;
        };
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };

        let flags = data[2];
        let seq = u16::from_le_bytes([data[3], data[4]]);
        let payload = &data[5..];

        link.last_recv = Instant::now();

        if flags & FLAG_RELIABLE != 0 {
            send_raw(&self.socket, addr, &ack_datagram(seq));

            if seq == link.recv_next {
                push_receive(events, peer, payload);
                link.recv_next = link.recv_next.wrapping_add(1);
                while let Some(buffered) = link.recv_buffer.remove(&link.recv_next) {
                    push_receive(events, peer, &buffered);
                    link.recv_next = link.recv_next.wrapping_add(1);
                }
            } else if seq_newer(seq, link.recv_next) {
                link.recv_buffer.insert(seq, payload.to_vec());
            }
            // Older sequence: duplicate of something already delivered
        } else {
            push_receive(events, peer, payload);
        }
    }

    fn service(&mut self, now: Instant, events: &mut Vec<TransportEvent>) {
        let mut expired: Vec<(PeerId, &'static str)> = Vec::new();

        for (&peer, link) in self.links.iter_mut() {
            if now.saturating_duration_since(link.last_recv) > self.tuning.idle_timeout {
                expired.push((peer, "idle timeout"));
                continue;
            }

            let mut exhausted = false;
            for pending in link.pending.values_mut() {
                if now.saturating_duration_since(pending.last_sent)
                    >= self.tuning.retransmit_interval
                {
                    if pending.retries >= self.tuning.max_retries {
                        exhausted = true;
                        break;
                    }
                    send_raw(&self.socket, link.addr, &pending.datagram);
                    pending.last_sent = now;
                    pending.retries += 1;
                }
            }
            if exhausted {
                expired.push((peer, "retransmit limit"));
                continue;
            }

            if now.saturating_duration_since(link.last_keepalive) >= self.tuning.keepalive_interval
            {
                send_raw(&self.socket, link.addr, &[CTRL_PING]);
                link.last_keepalive = now;
            }
        }

        for (peer, reason) in expired {
            warn!("dropping peer {}: {}", peer, reason);
            self.drop_peer(peer, events);
        }
    }

    fn drop_peer(&mut self, peer: PeerId, events: &mut Vec<TransportEvent>) {
        if self.links.remove(&peer).is_some() {
            self.registry.detach_id(peer);
            events.push(TransportEvent::Disconnect { peer });
        }
    }
}

impl Drop for ReliableTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn push_receive(events: &mut Vec<TransportEvent>, peer: PeerId, payload: &[u8]) {
    if payload.is_empty() {
        return;
    }
    events.push(TransportEvent::Receive {
        peer,
        tag: payload[0],
        body: payload[1..].to_vec(),
    });
}
