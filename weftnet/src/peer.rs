//! Per-peer session state and the peer registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use weftwire::{Color, Sequencer};

/// Key of a reliable frame awaiting acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SendKey {
    /// Whole packet, keyed by its sequence.
    Packet(u16),
    /// One slice of a chunked packet, keyed by (sequence, slice index).
    Chunk(u16, u16),
}

/// A remote endpoint with a completed handshake.
///
/// The sequence counters have a single writer each: the sender task
/// advances the local-out counters, the listener task drives the
/// [`Sequencer`] holding the remote-in counters.
pub struct Peer {
    pub id: u8,
    pub addr: SocketAddr,
    pub username: String,
    pub color: Color,
    /// Wall clock of the most recent inbound frame.
    last_heard: Mutex<Instant>,
    /// Last reliable sequence assigned to an outgoing frame.
    reliable_out: AtomicU16,
    /// Last unreliable sequence assigned to an outgoing frame.
    unreliable_out: AtomicU16,
    /// Serialized reliable frames awaiting acknowledgement.
    unacked: Mutex<HashMap<SendKey, Bytes>>,
    /// Receive pipeline for frames arriving from this peer.
    pub(crate) sequencer: Mutex<Sequencer>,
}

impl Peer {
    pub(crate) fn new(id: u8, addr: SocketAddr, username: String, color: Color) -> Self {
        Self {
            id,
            addr,
            username,
            color,
            last_heard: Mutex::new(Instant::now()),
            reliable_out: AtomicU16::new(0),
            unreliable_out: AtomicU16::new(0),
            unacked: Mutex::new(HashMap::new()),
            sequencer: Mutex::new(Sequencer::new()),
        }
    }

    /// Assign the next outgoing reliable sequence.
    pub(crate) fn next_reliable(&self) -> u16 {
        self.reliable_out.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Assign the next outgoing unreliable sequence.
    pub(crate) fn next_unreliable(&self) -> u16 {
        self.unreliable_out.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Record a reliable frame until its acknowledgement arrives.
    pub(crate) fn store_unacked(&self, key: SendKey, frame: Bytes) {
        self.unacked.lock().insert(key, frame);
    }

    /// The serialized frame still awaiting acknowledgement, if any.
    pub(crate) fn pending(&self, key: SendKey) -> Option<Bytes> {
        self.unacked.lock().get(&key).cloned()
    }

    /// Drop the buffer entry for an acknowledged frame. Returns whether the
    /// entry was still present.
    pub(crate) fn acknowledge(&self, seq: u16, slice: Option<u16>) -> bool {
        let key = match slice {
            Some(index) => SendKey::Chunk(seq, index),
            None => SendKey::Packet(seq),
        };
        self.unacked.lock().remove(&key).is_some()
    }

    /// Number of reliable frames awaiting acknowledgement.
    #[cfg(test)]
    pub(crate) fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }

    /// Refresh the last-heard timestamp.
    pub(crate) fn touch(&self) {
        *self.last_heard.lock() = Instant::now();
    }

    /// Instant of the most recent inbound frame.
    pub fn last_heard(&self) -> Instant {
        *self.last_heard.lock()
    }
}

/// Registry of connected peers, keyed by peer ID.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<u8, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u8) -> Option<Arc<Peer>> {
        self.peers.read().get(&id).cloned()
    }

    pub fn by_addr(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .find(|p| p.addr == addr)
            .cloned()
    }

    /// Allocate the lowest unused peer ID >= 2 and insert a new peer.
    /// Returns `None` when `max_clients` peers are already connected.
    pub(crate) fn add_client(
        &self,
        addr: SocketAddr,
        username: String,
        color: Color,
        max_clients: u8,
    ) -> Option<Arc<Peer>> {
        let mut peers = self.peers.write();
        if peers.len() >= max_clients as usize {
            return None;
        }
        let id = (2..=u8::MAX).find(|id| !peers.contains_key(id))?;
        let peer = Arc::new(Peer::new(id, addr, username, color));
        peers.insert(id, Arc::clone(&peer));
        Some(peer)
    }

    /// Insert a peer under a fixed ID (the client role's server record).
    pub(crate) fn insert(&self, peer: Arc<Peer>) {
        self.peers.write().insert(peer.id, peer);
    }

    /// Atomic remove-if-present.
    pub(crate) fn remove(&self, id: u8) -> Option<Arc<Peer>> {
        self.peers.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Snapshot of every connected peer, ordered by ID.
    pub fn all(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    pub(crate) fn clear(&self) {
        self.peers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn sequence_assignment_starts_at_one_and_wraps() {
        let peer = Peer::new(2, addr(1000), "a".into(), Color::WHITE);
        assert_eq!(peer.next_reliable(), 1);
        assert_eq!(peer.next_reliable(), 2);
        assert_eq!(peer.next_unreliable(), 1);

        let peer = Peer::new(2, addr(1000), "a".into(), Color::WHITE);
        for _ in 0..u16::MAX {
            peer.next_reliable();
        }
        assert_eq!(peer.next_reliable(), 0);
        assert_eq!(peer.next_reliable(), 1);
    }

    #[test]
    fn acknowledge_clears_exactly_one_entry() {
        let peer = Peer::new(2, addr(1000), "a".into(), Color::WHITE);
        peer.store_unacked(SendKey::Packet(1), Bytes::from_static(b"x"));
        peer.store_unacked(SendKey::Chunk(2, 0), Bytes::from_static(b"y"));
        peer.store_unacked(SendKey::Chunk(2, 1), Bytes::from_static(b"z"));
        assert_eq!(peer.unacked_count(), 3);

        assert!(peer.acknowledge(1, None));
        assert!(!peer.acknowledge(1, None));
        assert!(peer.acknowledge(2, Some(1)));
        assert_eq!(peer.unacked_count(), 1);
        assert!(peer.pending(SendKey::Chunk(2, 0)).is_some());
        assert!(peer.pending(SendKey::Chunk(2, 1)).is_none());
    }

    #[test]
    fn registry_allocates_lowest_unused_id() {
        let registry = PeerRegistry::new();
        let a = registry.add_client(addr(1), "a".into(), Color::WHITE, 8).unwrap();
        let b = registry.add_client(addr(2), "b".into(), Color::WHITE, 8).unwrap();
        let c = registry.add_client(addr(3), "c".into(), Color::WHITE, 8).unwrap();
        assert_eq!((a.id, b.id, c.id), (2, 3, 4));

        registry.remove(3);
        let d = registry.add_client(addr(4), "d".into(), Color::WHITE, 8).unwrap();
        assert_eq!(d.id, 3, "freed IDs are reused lowest-first");
    }

    #[test]
    fn registry_enforces_capacity() {
        let registry = PeerRegistry::new();
        assert!(registry.add_client(addr(1), "a".into(), Color::WHITE, 1).is_some());
        assert!(registry.add_client(addr(2), "b".into(), Color::WHITE, 1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_by_address() {
        let registry = PeerRegistry::new();
        registry.add_client(addr(9), "a".into(), Color::WHITE, 8).unwrap();
        assert!(registry.by_addr(addr(9)).is_some());
        assert!(registry.by_addr(addr(10)).is_none());
    }
}
