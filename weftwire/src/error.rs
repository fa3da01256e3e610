use thiserror::Error;

/// All errors produced by the weftwire codec and receive pipeline.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("checksum mismatch: header 0x{header:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { header: u32, computed: u32 },

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("chunk flag set on non-chunkable frame type 0x{0:02x}")]
    InvalidChunkFlag(u8),

    #[error("name field is not pure ASCII")]
    NonAsciiName,

    #[error("name field too long: {len} bytes exceeds maximum {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("slice index {index} out of range for slice count {count}")]
    SliceOutOfRange { index: u16, count: u16 },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WireError>;
