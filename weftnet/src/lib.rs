//! weftnet -- endpoint layer of the weft LAN messaging framework.
//!
//! A session is one UDP endpoint in one of two roles: a [`Server`] accepts
//! handshakes, relays data between peers and broadcasts discovery beacons;
//! a [`Client`] discovers servers, connects and exchanges data through
//! one. Both roles share the transport underneath: per-peer sequence
//! engines on the four delivery channels, chunking of oversized reliable
//! payloads, and time-based retransmission bounded by a retry budget.
//!
//! Application-visible effects never fire on network tasks: they queue as
//! events and reach the host's [`SessionHandler`] when it calls `tick()`.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod handshake;
pub mod peer;
pub mod server;

mod iface;
mod transport;

// Re-export key public types at crate root.
pub use client::{Client, RemotePeer};
pub use config::Config;
pub use discovery::ServerEntry;
pub use error::{NetError, Result};
pub use event::{Event, EventQueue, SessionHandler, Severity};
pub use peer::{Peer, PeerRegistry};
pub use server::Server;
pub use transport::SendCompletion;

// The wire-layer types a host needs when talking to the endpoint API.
pub use weftwire::{Channel, Color};
