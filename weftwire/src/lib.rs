//! weftwire -- wire layer of the weft LAN messaging framework.
//!
//! Pure protocol logic with no sockets or clocks:
//! - checksummed frame codec (CRC32 header + type byte)
//! - wrap-safe 16-bit sequence arithmetic
//! - the four delivery disciplines of the per-peer receive pipeline
//! - chunked-packet reassembly

pub mod channel;
pub mod error;
pub mod frame;
pub mod reassembly;
pub mod sequence;
pub mod sequencer;

// Re-export key public types at crate root.
pub use channel::Channel;
pub use error::{Result, WireError};
pub use frame::{
    validate_name, ChunkInfo, Color, Frame, FrameType, BROADCAST_ID, CHUNK_FLAG, MAX_NAME_LEN,
    SERVER_ID,
};
pub use reassembly::Reassembler;
pub use sequencer::{Ack, Delivery, Ingested, Sequencer};
