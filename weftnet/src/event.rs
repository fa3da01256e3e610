//! Host-facing upcall queue.
//!
//! Network tasks never call into the host application directly. Every
//! application-visible effect is pushed onto a lock-free queue and handed
//! to the host's [`SessionHandler`] when it drains the queue via the
//! endpoint's `tick()`. This keeps host callbacks off network tasks and
//! avoids re-entrancy into the transport.

use std::time::SystemTime;

use bytes::Bytes;
use crossbeam_queue::SegQueue;

/// Severity of a session log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A queued upcall.
#[derive(Debug, Clone)]
pub enum Event {
    Connecting,
    Connected,
    Disconnected,
    PeerConnected(u8),
    PeerDisconnected(u8),
    PeerListChanged,
    ServerListChanged,
    DataReceived {
        module_id: Bytes,
        sender: u8,
        payload: Bytes,
    },
    Log {
        severity: Severity,
        timestamp: SystemTime,
        text: String,
    },
}

/// Callbacks exposed to the host application.
///
/// All methods default to no-ops so a host implements only what it needs.
pub trait SessionHandler {
    fn on_connecting(&mut self) {}
    fn on_connected(&mut self) {}
    fn on_disconnected(&mut self) {}
    fn on_peer_connected(&mut self, _peer_id: u8) {}
    fn on_peer_disconnected(&mut self, _peer_id: u8) {}
    fn on_peer_list_changed(&mut self) {}
    fn on_server_list_changed(&mut self) {}
    fn data_received(&mut self, _module_id: &[u8], _sender: u8, _payload: &[u8]) {}
    fn on_log_message(&mut self, _severity: Severity, _timestamp: SystemTime, _text: &str) {}
}

/// Lock-free upcall queue drained by the host thread.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: SegQueue<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.queue.push(event);
    }

    /// Queue a session log line for the host.
    pub fn log(&self, severity: Severity, text: impl Into<String>) {
        self.queue.push(Event::Log {
            severity,
            timestamp: SystemTime::now(),
            text: text.into(),
        });
    }

    /// Dispatch every queued event to the handler. Returns the number of
    /// events dispatched.
    pub fn drain(&self, handler: &mut dyn SessionHandler) -> usize {
        let mut dispatched = 0;
        while let Some(event) = self.queue.pop() {
            dispatched += 1;
            match event {
                Event::Connecting => handler.on_connecting(),
                Event::Connected => handler.on_connected(),
                Event::Disconnected => handler.on_disconnected(),
                Event::PeerConnected(id) => handler.on_peer_connected(id),
                Event::PeerDisconnected(id) => handler.on_peer_disconnected(id),
                Event::PeerListChanged => handler.on_peer_list_changed(),
                Event::ServerListChanged => handler.on_server_list_changed(),
                Event::DataReceived {
                    module_id,
                    sender,
                    payload,
                } => handler.data_received(&module_id, sender, &payload),
                Event::Log {
                    severity,
                    timestamp,
                    text,
                } => handler.on_log_message(severity, timestamp, &text),
            }
        }
        dispatched
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
