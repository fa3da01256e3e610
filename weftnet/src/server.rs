//! Server endpoint: accepts handshakes, relays data between peers and
//! broadcasts discovery beacons.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use weftwire::{Channel, Color, Delivery, Frame, BROADCAST_ID, SERVER_ID};

use crate::config::Config;
use crate::discovery;
use crate::error::Result;
use crate::event::{Event, EventQueue, SessionHandler, Severity};
use crate::handshake::PendingConnections;
use crate::iface;
use crate::peer::Peer;
use crate::transport::{is_transient, Outbound, Role, SendCompletion, Shutdown, Transport};

/// A running server session.
///
/// The session spawns its worker tasks on the current tokio runtime. The
/// host drives upcalls by calling [`Server::tick`] from its own thread.
pub struct Server {
    transport: Arc<Transport>,
    pending: Arc<PendingConnections>,
}

impl Server {
    /// Validate the configuration, bind the data socket and start the
    /// listener, sender and beacon tasks.
    pub async fn start(config: Config) -> Result<Server> {
        config.validate()?;
        let local_ip = iface::resolve_local_ip(config.allow_virtual_ips)?;
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?);
        let local_addr = SocketAddr::new(local_ip, socket.local_addr()?.port());

        let events = Arc::new(EventQueue::new());
        let shutdown = Arc::new(Shutdown::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport::new(
            Arc::new(config),
            socket,
            local_addr,
            events,
            shutdown,
            outbound_tx,
            Role::Server,
        ));
        let pending = Arc::new(PendingConnections::new());

        tokio::spawn(Arc::clone(&transport).run_sender(outbound_rx));
        tokio::spawn(run_listener(Arc::clone(&transport), Arc::clone(&pending)));
        tokio::spawn(discovery::run_beacon(Arc::clone(&transport)));

        transport.events.log(
            Severity::Info,
            format!(
                "server '{}' listening on {}",
                transport.config.servername, local_addr
            ),
        );
        Ok(Server { transport, pending })
    }

    /// Drain queued upcalls into the handler. Call periodically from the
    /// host thread.
    pub fn tick(&self, handler: &mut dyn SessionHandler) -> usize {
        self.transport.events.drain(handler)
    }

    /// Send on the reliable-ordered channel.
    pub fn send_reliable(
        &self,
        module_id: &[u8],
        payload: &[u8],
        completion: impl FnOnce(bool) + Send + 'static,
        receiver: Option<u8>,
    ) {
        self.enqueue(Channel::ReliableOrdered, module_id, payload, Box::new(completion), receiver);
    }

    /// Send on the reliable-unordered channel.
    pub fn send_reliable_unordered(
        &self,
        module_id: &[u8],
        payload: &[u8],
        completion: impl FnOnce(bool) + Send + 'static,
        receiver: Option<u8>,
    ) {
        self.enqueue(Channel::ReliableUnordered, module_id, payload, Box::new(completion), receiver);
    }

    /// Send on the unreliable-ordered channel.
    pub fn send_unreliable(
        &self,
        module_id: &[u8],
        payload: &[u8],
        completion: impl FnOnce(bool) + Send + 'static,
        receiver: Option<u8>,
    ) {
        self.enqueue(Channel::UnreliableOrdered, module_id, payload, Box::new(completion), receiver);
    }

    /// Send on the unreliable-unordered channel.
    pub fn send_unreliable_unordered(
        &self,
        module_id: &[u8],
        payload: &[u8],
        completion: impl FnOnce(bool) + Send + 'static,
        receiver: Option<u8>,
    ) {
        self.enqueue(Channel::UnreliableUnordered, module_id, payload, Box::new(completion), receiver);
    }

    fn enqueue(
        &self,
        channel: Channel,
        module_id: &[u8],
        payload: &[u8],
        completion: SendCompletion,
        receiver: Option<u8>,
    ) {
        if self.transport.shutdown.is_set() {
            completion(false);
            return;
        }
        let module_id = Bytes::copy_from_slice(module_id);
        let payload = Bytes::copy_from_slice(payload);
        match receiver {
            Some(id) => {
                if self.transport.peers.get(id).is_none() {
                    completion(false);
                    return;
                }
                let _ = self.transport.outbound.send(Outbound::Sequenced {
                    to: id,
                    channel,
                    sender: SERVER_ID,
                    dest: id,
                    module_id,
                    payload,
                    completion: Some(completion),
                });
            }
            None => {
                let peers = self.transport.peers.all();
                let Some((last, rest)) = peers.split_last() else {
                    // Nothing on the wire to wait for.
                    completion(true);
                    return;
                };
                for peer in rest {
                    let _ = self.transport.outbound.send(Outbound::Sequenced {
                        to: peer.id,
                        channel,
                        sender: SERVER_ID,
                        dest: BROADCAST_ID,
                        module_id: module_id.clone(),
                        payload: payload.clone(),
                        completion: None,
                    });
                }
                let _ = self.transport.outbound.send(Outbound::Sequenced {
                    to: last.id,
                    channel,
                    sender: SERVER_ID,
                    dest: BROADCAST_ID,
                    module_id,
                    payload,
                    completion: Some(completion),
                });
            }
        }
    }

    /// Address peers and the loopback guard see this server under.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.transport.peers.len()
    }

    /// Snapshot of connected peers, ordered by ID.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.transport.peers.all()
    }

    /// Frames dropped as malformed since session start.
    pub fn malformed_frames(&self) -> u64 {
        self.transport.malformed_frames()
    }

    /// Outstanding handshake challenges.
    pub fn pending_connections(&self) -> usize {
        self.pending.outstanding()
    }

    /// Notify peers, stop the worker tasks and tear down the session.
    pub async fn shutdown(&self) {
        for peer in self.transport.peers.all() {
            self.transport
                .send_frame(peer.addr, &Frame::ConnectionClosed)
                .await;
        }
        self.transport.peers.clear();
        self.transport.shutdown.trigger();
        self.transport.events.push(Event::Disconnected);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.transport.shutdown.trigger();
    }
}

async fn run_listener(transport: Arc<Transport>, pending: Arc<PendingConnections>) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = transport.shutdown.wait() => break,
            received = transport.socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => handle_datagram(&transport, &pending, src, &buf[..len]).await,
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "transient socket error");
                }
                Err(e) => {
                    transport
                        .events
                        .log(Severity::Error, format!("data socket failed: {e}"));
                    transport.events.push(Event::Disconnected);
                    transport.shutdown.trigger();
                    break;
                }
            }
        }
    }
    debug!("listener task stopped");
}

async fn handle_datagram(
    transport: &Arc<Transport>,
    pending: &PendingConnections,
    src: SocketAddr,
    data: &[u8],
) {
    let Some(frame) = transport.decode_datagram(src, data) else {
        return;
    };
    match frame {
        Frame::ConnectionRequest => handle_request(transport, pending, src).await,
        Frame::ChallengeAnswer {
            username,
            color,
            proof,
        } => handle_answer(transport, pending, src, username, color, proof).await,
        Frame::ConnectionClosed => {
            if let Some(peer) = transport.peers.by_addr(src) {
                transport.evict(peer.id, "connection closed by peer").await;
            }
        }
        Frame::Ack { seq, slice } => {
            if let Some(peer) = transport.peers.by_addr(src) {
                peer.touch();
                peer.acknowledge(seq, slice);
            }
        }
        frame @ (Frame::Data { .. } | Frame::ClientInfo { .. }) => {
            let Some(peer) = transport.peers.by_addr(src) else {
                trace!(%src, "sequenced frame from unknown address dropped");
                return;
            };
            let from = peer.id;
            for delivery in transport.ingest_sequenced(&peer, frame) {
                route_delivery(transport, from, delivery);
            }
        }
        other => trace!(%src, ty = ?other.frame_type(), "unexpected frame dropped"),
    }
}

/// ConnectionRequest: resend the accept for known peers, deny at
/// capacity, otherwise issue a fresh challenge.
async fn handle_request(
    transport: &Arc<Transport>,
    pending: &PendingConnections,
    src: SocketAddr,
) {
    if let Some(peer) = transport.peers.by_addr(src) {
        // The accept datagram may have been lost; resending is idempotent.
        transport
            .send_frame(src, &Frame::ConnectionAccepted { peer_id: peer.id })
            .await;
        return;
    }
    if transport.peers.len() >= transport.config.max_clients as usize {
        transport.send_frame(src, &Frame::ConnectionDenied).await;
        transport.events.log(
            Severity::Warning,
            format!("connection from {src} denied: server full"),
        );
        return;
    }
    let nonce = pending.challenge(src);
    transport
        .send_frame(src, &Frame::ConnectionChallenge { nonce })
        .await;
    trace!(%src, "challenge issued");
}

/// ChallengeAnswer: verify the stored digest byte-for-byte, then create
/// the peer and fan out the mutual introductions.
async fn handle_answer(
    transport: &Arc<Transport>,
    pending: &PendingConnections,
    src: SocketAddr,
    username: String,
    color: Color,
    proof: [u8; 32],
) {
    let Some(expected) = pending.take(src) else {
        trace!(%src, "challenge answer without outstanding challenge");
        return;
    };
    if expected != proof {
        transport.send_frame(src, &Frame::ConnectionDenied).await;
        transport.events.log(
            Severity::Warning,
            format!("connection from {src} denied: challenge mismatch"),
        );
        return;
    }
    let Some(peer) =
        transport
            .peers
            .add_client(src, username, color, transport.config.max_clients)
    else {
        transport.send_frame(src, &Frame::ConnectionDenied).await;
        transport.events.log(
            Severity::Warning,
            format!("connection from {src} denied: server full"),
        );
        return;
    };
    transport
        .send_frame(src, &Frame::ConnectionAccepted { peer_id: peer.id })
        .await;

    // Introduce the server itself, then the new peer and the existing
    // peers to each other, all on the reliable-ordered channel.
    let _ = transport.outbound.send(Outbound::Info {
        to: peer.id,
        peer_id: SERVER_ID,
        username: transport.config.username.clone(),
        color: transport.config.color,
    });
    for other in transport.peers.all() {
        if other.id == peer.id {
            continue;
        }
        let _ = transport.outbound.send(Outbound::Info {
            to: other.id,
            peer_id: peer.id,
            username: peer.username.clone(),
            color: peer.color,
        });
        let _ = transport.outbound.send(Outbound::Info {
            to: peer.id,
            peer_id: other.id,
            username: other.username.clone(),
            color: other.color,
        });
    }

    transport.events.push(Event::PeerConnected(peer.id));
    transport.events.push(Event::PeerListChanged);
    transport.events.log(
        Severity::Info,
        format!("peer {} ({}) connected from {}", peer.id, peer.username, src),
    );
}

/// Route one released packet: deliver locally, fan out a broadcast, or
/// forward to the addressed peer.
fn route_delivery(transport: &Arc<Transport>, from: u8, delivery: Delivery) {
    match delivery {
        Delivery::Data {
            channel,
            dest,
            module_id,
            payload,
            ..
        } => match dest {
            SERVER_ID => {
                transport.events.push(Event::DataReceived {
                    module_id,
                    sender: from,
                    payload,
                });
            }
            BROADCAST_ID => {
                transport.events.push(Event::DataReceived {
                    module_id: module_id.clone(),
                    sender: from,
                    payload: payload.clone(),
                });
                for other in transport.peers.all() {
                    if other.id == from {
                        continue;
                    }
                    let _ = transport.outbound.send(Outbound::Sequenced {
                        to: other.id,
                        channel,
                        sender: from,
                        dest: BROADCAST_ID,
                        module_id: module_id.clone(),
                        payload: payload.clone(),
                        completion: None,
                    });
                }
            }
            dest => {
                if transport.peers.get(dest).is_some() {
                    let _ = transport.outbound.send(Outbound::Sequenced {
                        to: dest,
                        channel,
                        sender: from,
                        dest,
                        module_id,
                        payload,
                        completion: None,
                    });
                } else if let Some(origin) = transport.peers.get(from) {
                    // Let the sender prune its peer list.
                    let _ = transport.outbound.send(Outbound::Control {
                        to: origin.addr,
                        frame: Frame::ClientDisconnected { peer_id: dest },
                    });
                }
            }
        },
        Delivery::PeerInfo { peer_id, .. } => {
            trace!(from, peer_id, "client info from peer ignored");
        }
    }
}
