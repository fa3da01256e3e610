//! Shared transport core for both endpoint roles.
//!
//! Owns the data socket, the peer registry, the outbound work queue and
//! the retransmission scheduler. The listener loops live with the roles
//! (server / client dispatch differs); everything below the dispatch --
//! sequencing, acknowledgements, chunking, retransmit tasks, eviction --
//! is shared here.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use weftwire::{Channel, ChunkInfo, Delivery, Frame};

use crate::config::Config;
use crate::event::{Event, EventQueue, Severity};
use crate::peer::{Peer, PeerRegistry, SendKey};

/// Completion callback of a send: `true` once the frame reached the
/// socket, `false` when the send was ineligible.
pub type SendCompletion = Box<dyn FnOnce(bool) + Send + 'static>;

/// Cooperative shutdown flag shared by every worker task.
#[derive(Default)]
pub(crate) struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Endpoint role; eviction side effects differ between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

/// Work items drained by the sender task.
pub(crate) enum Outbound {
    /// Stateless connection/discovery frame to an explicit address.
    Control { to: SocketAddr, frame: Frame },
    /// Application data, sequenced on the receiving peer's counters.
    Sequenced {
        to: u8,
        channel: Channel,
        sender: u8,
        dest: u8,
        module_id: Bytes,
        payload: Bytes,
        completion: Option<SendCompletion>,
    },
    /// Peer display attributes, sequenced on the reliable-ordered channel.
    Info {
        to: u8,
        peer_id: u8,
        username: String,
        color: weftwire::Color,
    },
}

/// Shared endpoint state.
pub(crate) struct Transport {
    pub config: Arc<Config>,
    pub socket: Arc<UdpSocket>,
    /// The address the loopback echo guard compares frame sources against.
    pub local_addr: SocketAddr,
    pub peers: PeerRegistry,
    pub events: Arc<EventQueue>,
    pub shutdown: Arc<Shutdown>,
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub role: Role,
    /// Frames dropped for bad checksum, short length or unknown type.
    malformed: AtomicU64,
}

impl Transport {
    pub fn new(
        config: Arc<Config>,
        socket: Arc<UdpSocket>,
        local_addr: SocketAddr,
        events: Arc<EventQueue>,
        shutdown: Arc<Shutdown>,
        outbound: mpsc::UnboundedSender<Outbound>,
        role: Role,
    ) -> Self {
        Self {
            config,
            socket,
            local_addr,
            peers: PeerRegistry::new(),
            events,
            shutdown,
            outbound,
            role,
            malformed: AtomicU64::new(0),
        }
    }

    /// Frames dropped as malformed since session start.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Decode a received datagram, applying the loopback echo guard and
    /// the malformed-frame policy (count, drop silently).
    pub fn decode_datagram(&self, src: SocketAddr, data: &[u8]) -> Option<Frame> {
        if src == self.local_addr {
            trace!(%src, "loopback echo dropped");
            return None;
        }
        if self.config.debug {
            trace!(%src, frame = %hex(data), "recv");
        }
        match Frame::decode(data) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                trace!(%src, error = %e, "malformed frame dropped");
                None
            }
        }
    }

    /// Serialize and transmit a frame. Returns whether the socket accepted
    /// the datagram.
    pub async fn send_frame(&self, to: SocketAddr, frame: &Frame) -> bool {
        let wire = frame.encode();
        if self.config.debug {
            trace!(%to, frame = %hex(&wire), "send");
        }
        match self.socket.send_to(&wire, to).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%to, error = %e, "socket send failed");
                false
            }
        }
    }

    /// Run an inbound sequenced frame through the peer's receive pipeline,
    /// queueing any produced acknowledgements. Returns the released
    /// packets in delivery order.
    pub fn ingest_sequenced(&self, peer: &Peer, frame: Frame) -> Vec<Delivery> {
        peer.touch();
        let ingested = {
            let mut sequencer = peer.sequencer.lock();
            sequencer.ingest(frame)
        };
        match ingested {
            Ok(out) => {
                for ack in out.acks {
                    let frame = Frame::Ack {
                        seq: ack.seq,
                        slice: ack.slice,
                    };
                    let _ = self.outbound.send(Outbound::Control {
                        to: peer.addr,
                        frame,
                    });
                }
                out.deliveries
            }
            Err(e) => {
                warn!(peer = peer.id, error = %e, "receive pipeline rejected frame");
                Vec::new()
            }
        }
    }

    /// Sender task: drains the outbound queue until shutdown.
    pub async fn run_sender(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                item = rx.recv() => match item {
                    Some(item) => self.handle_outbound(item).await,
                    None => break,
                },
            }
        }
        // Completion callbacks always fire: anything still queued at
        // teardown resolves to ineligible.
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Sequenced {
                completion: Some(completion),
                ..
            } = item
            {
                completion(false);
            }
        }
        debug!("sender task stopped");
    }

    async fn handle_outbound(self: &Arc<Self>, item: Outbound) {
        match item {
            Outbound::Control { to, frame } => {
                self.send_frame(to, &frame).await;
            }
            Outbound::Sequenced {
                to,
                channel,
                sender,
                dest,
                module_id,
                payload,
                completion,
            } => {
                let delivered = self
                    .transmit_sequenced(to, channel, sender, dest, module_id, payload)
                    .await;
                if let Some(completion) = completion {
                    completion(delivered);
                }
            }
            Outbound::Info {
                to,
                peer_id,
                username,
                color,
            } => {
                let Some(peer) = self.peers.get(to) else {
                    trace!(to, "client info dropped, peer departed");
                    return;
                };
                let seq = peer.next_reliable();
                let frame = Frame::ClientInfo {
                    seq,
                    peer_id,
                    username,
                    color,
                };
                let wire = frame.encode();
                peer.store_unacked(SendKey::Packet(seq), wire.clone());
                self.send_frame(peer.addr, &frame).await;
                self.arm_retransmit(peer.id, SendKey::Packet(seq));
            }
        }
    }

    /// Assign a sequence, transmit (chunking oversized reliable payloads)
    /// and arm retransmission for reliable frames.
    async fn transmit_sequenced(
        self: &Arc<Self>,
        to: u8,
        channel: Channel,
        sender: u8,
        dest: u8,
        module_id: Bytes,
        payload: Bytes,
    ) -> bool {
        let Some(peer) = self.peers.get(to) else {
            trace!(to, "sequenced send dropped, peer departed");
            return false;
        };
        if module_id.len() > u8::MAX as usize {
            self.events
                .log(Severity::Error, "module id exceeds 255 bytes, send rejected");
            return false;
        }

        let mtu = self.config.mtu;
        if !channel.is_reliable() {
            if payload.len() > mtu {
                self.events.log(
                    Severity::Error,
                    format!(
                        "unreliable payload of {} bytes exceeds mtu {}, send rejected",
                        payload.len(),
                        mtu
                    ),
                );
                return false;
            }
            let seq = peer.next_unreliable();
            let frame = Frame::Data {
                channel,
                seq,
                chunk: None,
                sender,
                dest,
                module_id,
                payload,
            };
            return self.send_frame(peer.addr, &frame).await;
        }

        let seq = peer.next_reliable();
        if payload.len() <= mtu {
            let frame = Frame::Data {
                channel,
                seq,
                chunk: None,
                sender,
                dest,
                module_id,
                payload,
            };
            let wire = frame.encode();
            peer.store_unacked(SendKey::Packet(seq), wire);
            let sent = self.send_frame(peer.addr, &frame).await;
            self.arm_retransmit(peer.id, SendKey::Packet(seq));
            return sent;
        }

        // Oversized reliable payload: one logical sequence, MTU-sized
        // slices, each retransmitted independently.
        let count = payload.len().div_ceil(mtu);
        if count > u16::MAX as usize {
            self.events.log(
                Severity::Error,
                format!("payload of {} bytes needs too many slices", payload.len()),
            );
            return false;
        }
        let count = count as u16;
        let mut sent = true;
        for index in 0..count {
            let start = index as usize * mtu;
            let end = usize::min(start + mtu, payload.len());
            let frame = Frame::Data {
                channel,
                seq,
                chunk: Some(ChunkInfo { index, count }),
                sender,
                dest,
                module_id: module_id.clone(),
                payload: payload.slice(start..end),
            };
            let wire = frame.encode();
            peer.store_unacked(SendKey::Chunk(seq, index), wire);
            sent &= self.send_frame(peer.addr, &frame).await;
            self.arm_retransmit(peer.id, SendKey::Chunk(seq, index));
        }
        trace!(peer = peer.id, seq, count, "chunked send complete");
        sent
    }

    /// Arm the delayed resend task for one reliable frame. The task exits
    /// quietly once the acknowledgement clears the buffer entry or the
    /// peer departs; after `max_resend_reliable_packets` retransmissions
    /// the peer is evicted as unreachable.
    pub(crate) fn arm_retransmit(self: &Arc<Self>, peer_id: u8, key: SendKey) {
        let transport = Arc::clone(self);
        let delay = transport.config.retransmit_delay();
        let max_resend = transport.config.max_resend_reliable_packets;
        tokio::spawn(async move {
            let mut resends = 0u32;
            loop {
                tokio::time::sleep(delay).await;
                if transport.shutdown.is_set() {
                    break;
                }
                let Some(peer) = transport.peers.get(peer_id) else {
                    break;
                };
                let Some(wire) = peer.pending(key) else {
                    break; // acknowledged
                };
                if resends >= max_resend {
                    warn!(peer = peer_id, ?key, resends, "retry budget exhausted");
                    transport.evict(peer_id, "unreachable").await;
                    break;
                }
                if let Err(e) = transport.socket.send_to(&wire, peer.addr).await {
                    warn!(peer = peer_id, error = %e, "retransmit send failed");
                }
                resends += 1;
                trace!(peer = peer_id, ?key, resends, "frame retransmitted");
            }
        });
    }

    /// Remove a peer and raise the role-appropriate notifications.
    pub(crate) async fn evict(&self, peer_id: u8, reason: &str) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };
        self.events.log(
            Severity::Warning,
            format!("peer {} ({}) dropped: {}", peer.id, peer.username, reason),
        );
        match self.role {
            Role::Server => {
                for other in self.peers.all() {
                    self.send_frame(other.addr, &Frame::ClientDisconnected { peer_id })
                        .await;
                }
                self.events.push(Event::PeerDisconnected(peer_id));
                self.events.push(Event::PeerListChanged);
            }
            Role::Client => {
                self.events.push(Event::Disconnected);
            }
        }
    }
}

/// Whether a socket error leaves the listener able to continue.
pub(crate) fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
    )
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventQueue;

    async fn test_transport(role: Role) -> (Arc<Transport>, mpsc::UnboundedReceiver<Outbound>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = socket.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport::new(
            Arc::new(Config {
                allow_virtual_ips: true,
                ..Config::default()
            }),
            socket,
            local_addr,
            Arc::new(EventQueue::new()),
            Arc::new(Shutdown::new()),
            tx,
            role,
        ));
        (transport, rx)
    }

    #[tokio::test]
    async fn loopback_echo_is_dropped() {
        let (transport, _rx) = test_transport(Role::Server).await;
        let wire = Frame::ConnectionRequest.encode();
        assert!(transport.decode_datagram(transport.local_addr, &wire).is_none());

        let other: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(transport.decode_datagram(other, &wire).is_some());
    }

    #[tokio::test]
    async fn malformed_frames_are_counted_not_surfaced() {
        let (transport, _rx) = test_transport(Role::Server).await;
        let src: SocketAddr = "127.0.0.1:1".parse().unwrap();

        assert!(transport.decode_datagram(src, &[1, 2, 3]).is_none());
        let mut wire = Frame::ConnectionRequest.encode().to_vec();
        wire[0] ^= 0xFF;
        assert!(transport.decode_datagram(src, &wire).is_none());
        assert_eq!(transport.malformed_frames(), 2);
    }

    #[tokio::test]
    async fn ingest_queues_acks_for_reliable_frames() {
        let (transport, mut rx) = test_transport(Role::Server).await;
        let peer = Peer::new(2, "127.0.0.1:1".parse().unwrap(), "a".into(), weftwire::Color::WHITE);

        let frame = Frame::Data {
            channel: Channel::ReliableOrdered,
            seq: 1,
            chunk: None,
            sender: 2,
            dest: 1,
            module_id: Bytes::from_static(&[0x01]),
            payload: Bytes::from_static(b"x"),
        };
        let deliveries = transport.ingest_sequenced(&peer, frame);
        assert_eq!(deliveries.len(), 1);

        match rx.try_recv() {
            Ok(Outbound::Control {
                frame: Frame::Ack { seq: 1, slice: None },
                ..
            }) => {}
            _ => panic!("expected a queued ACK"),
        }
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let shutdown = Arc::new(Shutdown::new());
        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { shutdown.wait().await })
        };
        shutdown.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake")
            .unwrap();
        assert!(shutdown.is_set());
    }
}
