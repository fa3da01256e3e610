//! Client endpoint: discovers servers, performs the handshake and
//! exchanges data through the server.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use weftwire::{Channel, Color, Delivery, Frame, BROADCAST_ID, SERVER_ID};

use crate::config::Config;
use crate::discovery::{self, DiscoveredServers, ServerEntry};
use crate::error::{NetError, Result};
use crate::event::{Event, EventQueue, SessionHandler, Severity};
use crate::handshake::challenge_proof;
use crate::iface;
use crate::peer::Peer;
use crate::transport::{is_transient, Outbound, Role, SendCompletion, Shutdown, Transport};

/// Handshake phase. Connected-ness itself is tracked by the presence of
/// the server's peer record in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
}

/// A peer known through the server's ClientInfo introductions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub id: u8,
    pub username: String,
    pub color: Color,
}

struct ClientShared {
    phase: Mutex<Phase>,
    own_id: AtomicU8,
    server_addr: Mutex<Option<SocketAddr>>,
    known_peers: RwLock<BTreeMap<u8, RemotePeer>>,
    handshake_done: Notify,
}

/// A running client session.
pub struct Client {
    transport: Arc<Transport>,
    shared: Arc<ClientShared>,
    servers: Arc<DiscoveredServers>,
}

impl Client {
    /// Validate the configuration, bind an ephemeral data socket and start
    /// the listener, sender and discovery tasks.
    pub async fn start(config: Config) -> Result<Client> {
        config.validate()?;
        let local_ip = iface::resolve_local_ip(config.allow_virtual_ips)?;
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
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
            Role::Client,
        ));
        let shared = Arc::new(ClientShared {
            phase: Mutex::new(Phase::Idle),
            own_id: AtomicU8::new(0),
            server_addr: Mutex::new(None),
            known_peers: RwLock::new(BTreeMap::new()),
            handshake_done: Notify::new(),
        });
        let servers = Arc::new(DiscoveredServers::new(
            transport.config.server_discovery_timeout,
        ));

        tokio::spawn(Arc::clone(&transport).run_sender(outbound_rx));
        tokio::spawn(run_listener(Arc::clone(&transport), Arc::clone(&shared)));
        tokio::spawn(discovery::run_discovery(
            Arc::clone(&transport),
            Arc::clone(&servers),
        ));

        Ok(Client {
            transport,
            shared,
            servers,
        })
    }

    /// Drain queued upcalls into the handler. Call periodically from the
    /// host thread.
    pub fn tick(&self, handler: &mut dyn SessionHandler) -> usize {
        self.transport.events.drain(handler)
    }

    /// Handshake with the server at `addr`, waiting up to
    /// `server_connection_timeout` for completion.
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        connect_flow(&self.transport, &self.shared, addr).await
    }

    /// Reconnect to the last remembered server endpoint.
    pub async fn reconnect(&self) -> Result<()> {
        let addr = (*self.shared.server_addr.lock()).ok_or(NetError::NoKnownServer)?;
        self.connect(addr).await
    }

    /// Notify the server and tear the session down.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(peer) = self.transport.peers.get(SERVER_ID) else {
            return Err(NetError::NotConnected);
        };
        self.transport
            .send_frame(peer.addr, &Frame::ConnectionClosed)
            .await;
        teardown(&self.transport, &self.shared, "disconnected").await;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.peers.get(SERVER_ID).is_some()
    }

    /// The peer ID the server assigned to this client, once connected.
    pub fn own_id(&self) -> Option<u8> {
        match self.shared.own_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    /// Servers currently visible through discovery beacons.
    pub fn servers(&self) -> Vec<ServerEntry> {
        self.servers.list()
    }

    /// Peers known through the server's introductions, ordered by ID.
    pub fn known_peers(&self) -> Vec<RemotePeer> {
        self.shared.known_peers.read().values().cloned().collect()
    }

    /// Frames dropped as malformed since session start.
    pub fn malformed_frames(&self) -> u64 {
        self.transport.malformed_frames()
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
        if !self.is_connected() || self.transport.shutdown.is_set() {
            completion(false);
            return;
        }
        let sender = self.shared.own_id.load(Ordering::Relaxed);
        let _ = self.transport.outbound.send(Outbound::Sequenced {
            to: SERVER_ID,
            channel,
            sender,
            dest: receiver.unwrap_or(BROADCAST_ID),
            module_id: Bytes::copy_from_slice(module_id),
            payload: Bytes::copy_from_slice(payload),
            completion: Some(completion),
        });
    }

    /// Stop the worker tasks, notifying the server when connected.
    pub async fn shutdown(&self) {
        if let Some(peer) = self.transport.peers.get(SERVER_ID) {
            self.transport
                .send_frame(peer.addr, &Frame::ConnectionClosed)
                .await;
        }
        self.transport.peers.clear();
        self.transport.shutdown.trigger();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.transport.shutdown.trigger();
    }
}

/// Issue a ConnectionRequest and wait for the handshake to resolve.
async fn connect_flow(
    transport: &Arc<Transport>,
    shared: &Arc<ClientShared>,
    addr: SocketAddr,
) -> Result<()> {
    if transport.peers.get(SERVER_ID).is_some() {
        return Err(NetError::AlreadyConnected);
    }
    {
        let mut phase = shared.phase.lock();
        if *phase == Phase::Connecting {
            return Err(NetError::ConnectPending);
        }
        *phase = Phase::Connecting;
    }
    shared.known_peers.write().clear();
    *shared.server_addr.lock() = Some(addr);
    transport.events.push(Event::Connecting);
    transport
        .send_frame(addr, &Frame::ConnectionRequest)
        .await;

    let deadline = Instant::now() + transport.config.server_connection_timeout;
    loop {
        if transport.peers.get(SERVER_ID).is_some() {
            return Ok(());
        }
        if *shared.phase.lock() == Phase::Idle {
            return Err(NetError::ConnectionRefused);
        }
        let now = Instant::now();
        if now >= deadline {
            *shared.phase.lock() = Phase::Idle;
            transport
                .events
                .log(Severity::Warning, format!("connection to {addr} timed out"));
            return Err(NetError::ConnectTimeout);
        }
        let _ = tokio::time::timeout(deadline - now, shared.handshake_done.notified()).await;
    }
}

/// Clear every piece of session state and raise `Disconnected`.
async fn teardown(transport: &Arc<Transport>, shared: &Arc<ClientShared>, reason: &str) {
    transport.peers.clear();
    shared.known_peers.write().clear();
    shared.own_id.store(0, Ordering::Relaxed);
    *shared.phase.lock() = Phase::Idle;
    transport.events.log(Severity::Info, reason.to_string());
    transport.events.push(Event::Disconnected);
}

async fn run_listener(transport: Arc<Transport>, shared: Arc<ClientShared>) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = transport.shutdown.wait() => break,
            received = transport.socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => handle_datagram(&transport, &shared, src, &buf[..len]).await,
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
    shared: &Arc<ClientShared>,
    src: SocketAddr,
    data: &[u8],
) {
    let Some(frame) = transport.decode_datagram(src, data) else {
        return;
    };
    let server_addr = *shared.server_addr.lock();
    match frame {
        Frame::ConnectionChallenge { nonce } => {
            if server_addr == Some(src) && *shared.phase.lock() == Phase::Connecting {
                let answer = Frame::ChallengeAnswer {
                    username: transport.config.username.clone(),
                    color: transport.config.color,
                    proof: challenge_proof(nonce),
                };
                transport.send_frame(src, &answer).await;
            }
        }
        Frame::ConnectionAccepted { peer_id } => {
            if server_addr != Some(src) || transport.peers.get(SERVER_ID).is_some() {
                return;
            }
            shared.own_id.store(peer_id, Ordering::Relaxed);
            // The server's display name follows in its ClientInfo
            // introduction on the reliable channel.
            transport.peers.insert(Arc::new(Peer::new(
                SERVER_ID,
                src,
                String::new(),
                Color::WHITE,
            )));
            *shared.phase.lock() = Phase::Idle;
            transport.events.push(Event::Connected);
            transport.events.log(
                Severity::Info,
                format!("connected to {src} as peer {peer_id}"),
            );
            shared.handshake_done.notify_one();
        }
        Frame::ConnectionDenied => {
            if server_addr == Some(src) && *shared.phase.lock() == Phase::Connecting {
                *shared.phase.lock() = Phase::Idle;
                transport
                    .events
                    .log(Severity::Warning, "connection denied by server");
                shared.handshake_done.notify_one();
            }
        }
        Frame::ConnectionClosed => {
            if server_addr == Some(src) && transport.peers.get(SERVER_ID).is_some() {
                teardown(transport, shared, "server closed the session").await;
                if transport.config.reconnect_after_recompile {
                    let transport = Arc::clone(transport);
                    let shared = Arc::clone(shared);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        if transport.shutdown.is_set() {
                            return;
                        }
                        match connect_flow(&transport, &shared, src).await {
                            Ok(()) => debug!(%src, "reconnected"),
                            Err(e) => warn!(%src, error = %e, "reconnect failed"),
                        }
                    });
                }
            }
        }
        Frame::ClientDisconnected { peer_id } => {
            if server_addr == Some(src) {
                let removed = shared.known_peers.write().remove(&peer_id).is_some();
                if removed {
                    transport.events.push(Event::PeerDisconnected(peer_id));
                    transport.events.push(Event::PeerListChanged);
                }
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
            for delivery in transport.ingest_sequenced(&peer, frame) {
                apply_delivery(transport, shared, delivery);
            }
        }
        other => trace!(%src, ty = ?other.frame_type(), "unexpected frame dropped"),
    }
}

fn apply_delivery(transport: &Arc<Transport>, shared: &Arc<ClientShared>, delivery: Delivery) {
    match delivery {
        Delivery::Data {
            sender,
            module_id,
            payload,
            ..
        } => {
            transport.events.push(Event::DataReceived {
                module_id,
                sender,
                payload,
            });
        }
        Delivery::PeerInfo {
            peer_id,
            username,
            color,
        } => {
            let newly_known = {
                let mut known = shared.known_peers.write();
                known
                    .insert(
                        peer_id,
                        RemotePeer {
                            id: peer_id,
                            username,
                            color,
                        },
                    )
                    .is_none()
            };
            if newly_known {
                transport.events.push(Event::PeerConnected(peer_id));
            }
            transport.events.push(Event::PeerListChanged);
        }
    }
}
