//! LAN discovery: the server's beacon loop and the client's passive
//! beacon listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use weftwire::Frame;

use crate::event::Event;
use crate::iface;
use crate::transport::Transport;

/// A server currently visible on the LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    /// Source address of the beacon.
    pub addr: SocketAddr,
    /// Address to hand to `Client::connect` (beacon source IP, data port).
    pub data_addr: SocketAddr,
    pub servername: String,
    pub max_peers: u8,
    pub peer_count: u8,
}

struct EntryState {
    entry: ServerEntry,
    last_seen: Instant,
}

/// Rolling set of discovered servers keyed by beacon source address.
/// Entries expire after the configured timeout without a fresh beacon.
pub(crate) struct DiscoveredServers {
    entries: Mutex<HashMap<SocketAddr, EntryState>>,
    timeout: Duration,
}

impl DiscoveredServers {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Record a beacon. Returns whether the visible list changed.
    pub fn observe(&self, entry: ServerEntry) -> bool {
        let mut entries = self.entries.lock();
        let state = entries.get_mut(&entry.addr);
        match state {
            Some(state) => {
                let changed = state.entry != entry;
                state.entry = entry;
                state.last_seen = Instant::now();
                changed
            }
            None => {
                entries.insert(
                    entry.addr,
                    EntryState {
                        entry,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// Drop entries whose last beacon is older than the timeout. Returns
    /// whether anything expired.
    pub fn sweep(&self) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, state| state.last_seen.elapsed() < self.timeout);
        entries.len() != before
    }

    /// Snapshot of the visible servers, ordered by address.
    pub fn list(&self) -> Vec<ServerEntry> {
        let mut list: Vec<_> = self
            .entries
            .lock()
            .values()
            .map(|state| state.entry.clone())
            .collect();
        list.sort_by_key(|entry| entry.addr);
        list
    }
}

/// Server role: broadcast a ServerInformation beacon every heartbeat
/// interval. The advertised peer count includes the server itself.
pub(crate) async fn run_beacon(transport: Arc<Transport>) {
    let socket = match iface::beacon_socket() {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "beacon socket unavailable, discovery disabled");
            return;
        }
    };
    let target = SocketAddr::new(
        transport.config.broadcast_address,
        transport.config.discovery_port,
    );
    let mut interval = tokio::time::interval(transport.config.server_heartbeat_delay);
    loop {
        tokio::select! {
            _ = transport.shutdown.wait() => break,
            _ = interval.tick() => {
                let frame = Frame::ServerInformation {
                    servername: transport.config.servername.clone(),
                    max_peers: transport.config.max_clients,
                    peer_count: transport.peers.len() as u8 + 1,
                };
                if let Err(e) = socket.send_to(&frame.encode(), target).await {
                    warn!(%target, error = %e, "beacon send failed");
                } else {
                    trace!(%target, "beacon sent");
                }
            }
        }
    }
    debug!("beacon task stopped");
}

/// Client role: collect beacons on the discovery port into the rolling
/// server set, raising `ServerListChanged` on every visible change.
pub(crate) async fn run_discovery(transport: Arc<Transport>, servers: Arc<DiscoveredServers>) {
    let socket = match iface::discovery_socket(transport.config.discovery_port) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "discovery socket unavailable, discovery disabled");
            return;
        }
    };
    let poll = Duration::from_millis(250);
    let mut buf = vec![0u8; 65536];
    loop {
        if transport.shutdown.is_set() {
            break;
        }
        let mut changed = false;
        tokio::select! {
            _ = transport.shutdown.wait() => break,
            received = tokio::time::timeout(poll, socket.recv_from(&mut buf)) => {
                match received {
                    Ok(Ok((len, src))) => {
                        if let Some(Frame::ServerInformation {
                            servername,
                            max_peers,
                            peer_count,
                        }) = transport.decode_datagram(src, &buf[..len])
                        {
                            let entry = ServerEntry {
                                addr: src,
                                data_addr: SocketAddr::new(src.ip(), transport.config.port),
                                servername,
                                max_peers,
                                peer_count,
                            };
                            changed |= servers.observe(entry);
                        }
                    }
                    Ok(Err(e)) => warn!(error = %e, "discovery receive failed"),
                    Err(_) => {} // poll timeout, fall through to the sweep
                }
            }
        }
        changed |= servers.sweep();
        if changed {
            transport.events.push(Event::ServerListChanged);
        }
    }
    debug!("discovery task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16, count: u8) -> ServerEntry {
        ServerEntry {
            addr: format!("192.168.1.7:{port}").parse().unwrap(),
            data_addr: "192.168.1.7:24690".parse().unwrap(),
            servername: "lan".into(),
            max_peers: 8,
            peer_count: count,
        }
    }

    #[test]
    fn first_beacon_changes_the_list() {
        let servers = DiscoveredServers::new(Duration::from_secs(5));
        assert!(servers.observe(entry(5000, 1)));
        assert_eq!(servers.list().len(), 1);
    }

    #[test]
    fn repeated_identical_beacon_is_quiet() {
        let servers = DiscoveredServers::new(Duration::from_secs(5));
        servers.observe(entry(5000, 1));
        assert!(!servers.observe(entry(5000, 1)));
        assert!(servers.observe(entry(5000, 2)), "peer count change is visible");
    }

    #[test]
    fn entries_expire_after_timeout() {
        let servers = DiscoveredServers::new(Duration::from_millis(0));
        servers.observe(entry(5000, 1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(servers.sweep());
        assert!(servers.list().is_empty());
    }

    #[test]
    fn distinct_sources_tracked_separately() {
        let servers = DiscoveredServers::new(Duration::from_secs(5));
        servers.observe(entry(5000, 1));
        servers.observe(entry(5001, 1));
        assert_eq!(servers.list().len(), 2);
    }
}
