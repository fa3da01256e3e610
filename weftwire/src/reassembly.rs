//! Chunked-packet reassembly.
//!
//! Oversized reliable payloads travel as slices sharing one logical
//! sequence number, each tagged with its index and the total slice count.
//! Slices are recorded under `sequence -> slice index -> bytes`; once every
//! slice of a sequence has arrived the payload is concatenated in index
//! order and handed back as a single logical packet. Partially collected
//! sequences persist until completion or session end.

use std::collections::{BTreeMap, HashMap};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Result, WireError};
use crate::frame::ChunkInfo;

/// Per-peer chunk bookkeeping.
#[derive(Debug, Default)]
pub struct Reassembler {
    /// Slice sets keyed by logical sequence number.
    chunks: HashMap<u16, SliceSet>,
}

#[derive(Debug)]
struct SliceSet {
    /// Declared slice count, taken from the first slice recorded.
    count: u16,
    /// Collected slices, ordered by index for concatenation.
    slices: BTreeMap<u16, Bytes>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one slice. Returns the concatenated payload once the set is
    /// complete; the finished set is dropped from the bookkeeping.
    ///
    /// Duplicate slices overwrite in place, so a retransmitted slice never
    /// double-counts toward completion.
    pub fn insert(&mut self, seq: u16, chunk: ChunkInfo, payload: Bytes) -> Result<Option<Bytes>> {
        if chunk.count == 0 || chunk.index >= chunk.count {
            return Err(WireError::SliceOutOfRange {
                index: chunk.index,
                count: chunk.count,
            });
        }

        let set = self.chunks.entry(seq).or_insert_with(|| SliceSet {
            count: chunk.count,
            slices: BTreeMap::new(),
        });
        set.slices.insert(chunk.index, payload);

        if set.slices.len() < set.count as usize {
            trace!(
                seq,
                collected = set.slices.len(),
                total = set.count,
                "chunk slice recorded"
            );
            return Ok(None);
        }

        let Some(set) = self.chunks.remove(&seq) else {
            return Ok(None);
        };
        let total: usize = set.slices.values().map(Bytes::len).sum();
        let mut full = BytesMut::with_capacity(total);
        for slice in set.slices.into_values() {
            full.put_slice(&slice);
        }
        trace!(seq, len = full.len(), "chunked packet reassembled");
        Ok(Some(full.freeze()))
    }

    /// Number of sequences with partially collected slice sets.
    pub fn pending(&self) -> usize {
        self.chunks.len()
    }
}
