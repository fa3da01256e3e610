//! The four delivery disciplines carried by data frames.

use crate::error::{Result, WireError};
use crate::frame::FrameType;

/// Delivery discipline of a data frame.
///
/// | Kind                | Dedupe old | Buffer out-of-order | ACK |
/// |---------------------|------------|---------------------|-----|
/// | ReliableOrdered     | yes        | yes                 | yes |
/// | ReliableUnordered   | no         | no                  | yes |
/// | UnreliableOrdered   | yes        | no                  | no  |
/// | UnreliableUnordered | no         | no                  | no  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ReliableOrdered,
    ReliableUnordered,
    UnreliableOrdered,
    UnreliableUnordered,
}

impl Channel {
    /// Whether frames on this channel are acknowledged and retransmitted.
    pub fn is_reliable(self) -> bool {
        matches!(self, Channel::ReliableOrdered | Channel::ReliableUnordered)
    }

    /// Whether frames on this channel are subject to sequence ordering.
    pub fn is_ordered(self) -> bool {
        matches!(self, Channel::ReliableOrdered | Channel::UnreliableOrdered)
    }

    /// The wire frame type carrying data on this channel.
    pub fn frame_type(self) -> FrameType {
        match self {
            Channel::ReliableOrdered => FrameType::ReliableData,
            Channel::ReliableUnordered => FrameType::ReliableUnorderedData,
            Channel::UnreliableOrdered => FrameType::UnreliableData,
            Channel::UnreliableUnordered => FrameType::UnreliableUnorderedData,
        }
    }

    /// The channel a data frame type maps to.
    pub fn from_frame_type(ty: FrameType) -> Result<Self> {
        match ty {
            FrameType::ReliableData => Ok(Channel::ReliableOrdered),
            FrameType::ReliableUnorderedData => Ok(Channel::ReliableUnordered),
            FrameType::UnreliableData => Ok(Channel::UnreliableOrdered),
            FrameType::UnreliableUnorderedData => Ok(Channel::UnreliableUnordered),
            other => Err(WireError::Internal(format!(
                "frame type {other:?} is not a data kind"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliability_and_ordering_predicates() {
        assert!(Channel::ReliableOrdered.is_reliable());
        assert!(Channel::ReliableOrdered.is_ordered());
        assert!(Channel::ReliableUnordered.is_reliable());
        assert!(!Channel::ReliableUnordered.is_ordered());
        assert!(!Channel::UnreliableOrdered.is_reliable());
        assert!(Channel::UnreliableOrdered.is_ordered());
        assert!(!Channel::UnreliableUnordered.is_reliable());
        assert!(!Channel::UnreliableUnordered.is_ordered());
    }

    #[test]
    fn frame_type_round_trip() {
        for ch in [
            Channel::ReliableOrdered,
            Channel::ReliableUnordered,
            Channel::UnreliableOrdered,
            Channel::UnreliableUnordered,
        ] {
            assert_eq!(Channel::from_frame_type(ch.frame_type()).unwrap(), ch);
        }
    }

    #[test]
    fn non_data_type_rejected() {
        assert!(Channel::from_frame_type(FrameType::Ack).is_err());
    }
}
