//! Per-peer receive pipeline.
//!
//! Applies the delivery discipline of each inbound sequenced frame:
//! reliable-ordered frames are acknowledged, deduplicated and released in
//! strict sequence order (buffering ahead-of-order arrivals), reliable
//! unordered frames are acknowledged and released immediately, unreliable
//! ordered frames pass a newness filter, unreliable unordered frames pass
//! straight through. Chunked reliable frames detour through the
//! [`Reassembler`] and re-enter as a single packet once complete.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::trace;

use crate::channel::Channel;
use crate::error::{Result, WireError};
use crate::frame::{Color, Frame};
use crate::reassembly::Reassembler;
use crate::sequence::{is_new, is_next, next};

/// A packet released to the application by the receive pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Data {
        channel: Channel,
        seq: u16,
        sender: u8,
        dest: u8,
        module_id: Bytes,
        payload: Bytes,
    },
    PeerInfo {
        peer_id: u8,
        username: String,
        color: Color,
    },
}

/// An acknowledgement the pipeline wants transmitted back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub seq: u16,
    pub slice: Option<u16>,
}

/// Output of one [`Sequencer::ingest`] step.
#[derive(Debug, Default)]
pub struct Ingested {
    /// Packets released in delivery order.
    pub deliveries: Vec<Delivery>,
    /// Acknowledgements to emit.
    pub acks: Vec<Ack>,
}

/// Receive-side sequence engine for a single remote peer.
#[derive(Debug, Default)]
pub struct Sequencer {
    /// Last reliable sequence released in order.
    reliable_remote: u16,
    /// Most recent unreliable ordered sequence observed.
    unreliable_remote: u16,
    /// Reliable-ordered packets held until their predecessors arrive.
    held: BTreeMap<u16, Delivery>,
    /// Chunk bookkeeping for both reliable channels.
    reassembly: Reassembler,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one inbound sequenced frame through the pipeline.
    ///
    /// Accepts `Data` and `ClientInfo` frames; anything else is a dispatch
    /// error in the caller.
    pub fn ingest(&mut self, frame: Frame) -> Result<Ingested> {
        let mut out = Ingested::default();
        match frame {
            Frame::Data {
                channel,
                seq,
                chunk,
                sender,
                dest,
                module_id,
                payload,
            } => {
                let item = |payload: Bytes| Delivery::Data {
                    channel,
                    seq,
                    sender,
                    dest,
                    module_id: module_id.clone(),
                    payload,
                };
                match channel {
                    Channel::UnreliableUnordered => {
                        out.deliveries.push(item(payload));
                    }
                    Channel::UnreliableOrdered => {
                        if is_new(seq, self.unreliable_remote) {
                            self.unreliable_remote = seq;
                            out.deliveries.push(item(payload));
                        } else {
                            trace!(seq, last = self.unreliable_remote, "stale unreliable frame dropped");
                        }
                    }
                    Channel::ReliableUnordered => {
                        out.acks.push(Ack {
                            seq,
                            slice: chunk.map(|c| c.index),
                        });
                        match chunk {
                            Some(chunk) => {
                                if let Some(full) = self.reassembly.insert(seq, chunk, payload)? {
                                    out.deliveries.push(item(full));
                                }
                            }
                            None => out.deliveries.push(item(payload)),
                        }
                    }
                    Channel::ReliableOrdered => {
                        out.acks.push(Ack {
                            seq,
                            slice: chunk.map(|c| c.index),
                        });
                        if !is_new(seq, self.reliable_remote) {
                            trace!(seq, last = self.reliable_remote, "duplicate reliable frame dropped");
                            return Ok(out);
                        }
                        match chunk {
                            Some(chunk) => {
                                if let Some(full) = self.reassembly.insert(seq, chunk, payload)? {
                                    self.ordered(seq, item(full), &mut out.deliveries);
                                }
                            }
                            None => self.ordered(seq, item(payload), &mut out.deliveries),
                        }
                    }
                }
                Ok(out)
            }
            Frame::ClientInfo {
                seq,
                peer_id,
                username,
                color,
            } => {
                out.acks.push(Ack { seq, slice: None });
                if is_new(seq, self.reliable_remote) {
                    self.ordered(
                        seq,
                        Delivery::PeerInfo {
                            peer_id,
                            username,
                            color,
                        },
                        &mut out.deliveries,
                    );
                }
                Ok(out)
            }
            other => Err(WireError::Internal(format!(
                "sequencer received non-sequenced frame {:?}",
                other.frame_type()
            ))),
        }
    }

    /// Reliable-ordered release: deliver when contiguous, then drain every
    /// buffered successor; otherwise hold for later.
    fn ordered(&mut self, seq: u16, item: Delivery, out: &mut Vec<Delivery>) {
        if is_next(seq, self.reliable_remote) {
            self.reliable_remote = seq;
            out.push(item);
            loop {
                let follow = next(self.reliable_remote);
                match self.held.remove(&follow) {
                    Some(held) => {
                        self.reliable_remote = follow;
                        out.push(held);
                    }
                    None => break,
                }
            }
        } else {
            trace!(seq, last = self.reliable_remote, "reliable frame held for ordering");
            self.held.insert(seq, item);
        }
    }

    /// Last reliable sequence released in order.
    pub fn reliable_remote(&self) -> u16 {
        self.reliable_remote
    }

    /// Most recent unreliable ordered sequence observed.
    pub fn unreliable_remote(&self) -> u16 {
        self.unreliable_remote
    }

    /// Number of packets currently held awaiting ordering.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}
