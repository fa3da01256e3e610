use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::Channel;
use crate::error::{Result, WireError};

/// Peer ID of the server endpoint itself.
pub const SERVER_ID: u8 = 1;
/// Destination ID addressing every connected peer.
pub const BROADCAST_ID: u8 = 0;
/// Maximum byte length of usernames and servernames.
pub const MAX_NAME_LEN: usize = 100;

/// High bit of the type byte: marks the chunked variant of a reliable data
/// frame. Masked off before dispatching on the frame type.
pub const CHUNK_FLAG: u8 = 0x80;

/// Frame type identifiers.
///
/// Values 1-8 are connection lifecycle and discovery frames, 9 is the
/// acknowledgement, 10-13 carry application data on the four delivery
/// channels, 14 carries peer display attributes on the reliable-ordered
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    ConnectionRequest = 1,
    ConnectionChallenge = 2,
    ChallengeAnswer = 3,
    ConnectionAccepted = 4,
    ConnectionDenied = 5,
    ConnectionClosed = 6,
    ClientDisconnected = 7,
    ServerInformation = 8,
    Ack = 9,
    ReliableData = 10,
    ReliableUnorderedData = 11,
    UnreliableData = 12,
    UnreliableUnorderedData = 13,
    ClientInfo = 14,
}

impl FrameType {
    /// Whether this type may carry the chunk flag.
    pub fn is_chunkable(self) -> bool {
        matches!(self, FrameType::ReliableData | FrameType::ReliableUnorderedData)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameType::ConnectionRequest),
            2 => Ok(FrameType::ConnectionChallenge),
            3 => Ok(FrameType::ChallengeAnswer),
            4 => Ok(FrameType::ConnectionAccepted),
            5 => Ok(FrameType::ConnectionDenied),
            6 => Ok(FrameType::ConnectionClosed),
            7 => Ok(FrameType::ClientDisconnected),
            8 => Ok(FrameType::ServerInformation),
            9 => Ok(FrameType::Ack),
            10 => Ok(FrameType::ReliableData),
            11 => Ok(FrameType::ReliableUnorderedData),
            12 => Ok(FrameType::UnreliableData),
            13 => Ok(FrameType::UnreliableUnorderedData),
            14 => Ok(FrameType::ClientInfo),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

/// RGBA display color attached to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Self = Self { r: 255, g: 255, b: 255, a: 255 };
}

/// Slice position of a chunked data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Zero-based index of this slice.
    pub index: u16,
    /// Total number of slices in the logical packet.
    pub count: u16,
}

/// Weft wire frame.
///
/// Binary layout (all fields big-endian):
///
/// ```text
/// +----------+-------+--- variable ---+
/// | crc32    | type  | body per type  |
/// | (4B)     | (1B)  |                |
/// +----------+-------+----------------+
/// ```
///
/// The CRC spans everything after itself. Names and module IDs are length
/// prefixed with one byte; payloads with two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opens the handshake. Empty body.
    ConnectionRequest,
    /// Liveness challenge: nonce(8).
    ConnectionChallenge { nonce: u64 },
    /// Challenge reply: username(1+n) + color(4) + proof(32).
    ChallengeAnswer {
        username: String,
        color: Color,
        proof: [u8; 32],
    },
    /// Handshake completion: peer_id(1).
    ConnectionAccepted { peer_id: u8 },
    /// Handshake refusal. Empty body.
    ConnectionDenied,
    /// Session close, either direction. Empty body.
    ConnectionClosed,
    /// Server notification that a peer left: peer_id(1).
    ClientDisconnected { peer_id: u8 },
    /// Discovery beacon: servername(1+n) + max_peers(1) + peer_count(1).
    ServerInformation {
        servername: String,
        max_peers: u8,
        peer_count: u8,
    },
    /// Acknowledgement: seq(2) + slice_present(1) + slice(2 when present).
    Ack { seq: u16, slice: Option<u16> },
    /// Application data: seq(2) + [index(2) + count(2)] + sender(1) +
    /// dest(1) + module_id(1+n) + payload(2+n). The chunk fields are present
    /// iff the chunk flag is set on the type byte.
    Data {
        channel: Channel,
        seq: u16,
        chunk: Option<ChunkInfo>,
        sender: u8,
        dest: u8,
        module_id: Bytes,
        payload: Bytes,
    },
    /// Peer display attributes, sequenced on the reliable-ordered channel:
    /// seq(2) + peer_id(1) + username(1+n) + color(4).
    ClientInfo {
        seq: u16,
        peer_id: u8,
        username: String,
        color: Color,
    },
}

impl Frame {
    /// Return the frame type discriminant.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::ConnectionRequest => FrameType::ConnectionRequest,
            Frame::ConnectionChallenge { .. } => FrameType::ConnectionChallenge,
            Frame::ChallengeAnswer { .. } => FrameType::ChallengeAnswer,
            Frame::ConnectionAccepted { .. } => FrameType::ConnectionAccepted,
            Frame::ConnectionDenied => FrameType::ConnectionDenied,
            Frame::ConnectionClosed => FrameType::ConnectionClosed,
            Frame::ClientDisconnected { .. } => FrameType::ClientDisconnected,
            Frame::ServerInformation { .. } => FrameType::ServerInformation,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Data { channel, .. } => channel.frame_type(),
            Frame::ClientInfo { .. } => FrameType::ClientInfo,
        }
    }

    /// The type byte as it appears on the wire, chunk flag included.
    fn type_byte(&self) -> u8 {
        let base = self.frame_type() as u8;
        match self {
            Frame::Data { chunk: Some(_), .. } => base | CHUNK_FLAG,
            _ => base,
        }
    }

    /// Encode this frame into a checksummed wire buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(0); // checksum, patched below
        buf.put_u8(self.type_byte());
        self.encode_body(&mut buf);
        let crc = crc32fast::hash(&buf[4..]);
        buf[..4].copy_from_slice(&crc.to_be_bytes());
        buf.freeze()
    }

    /// Encode the type-specific body.
    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Frame::ConnectionRequest | Frame::ConnectionDenied | Frame::ConnectionClosed => {}
            Frame::ConnectionChallenge { nonce } => {
                buf.put_u64(*nonce);
            }
            Frame::ChallengeAnswer {
                username,
                color,
                proof,
            } => {
                put_name(buf, username);
                put_color(buf, *color);
                buf.put_slice(proof);
            }
            Frame::ConnectionAccepted { peer_id } => {
                buf.put_u8(*peer_id);
            }
            Frame::ClientDisconnected { peer_id } => {
                buf.put_u8(*peer_id);
            }
            Frame::ServerInformation {
                servername,
                max_peers,
                peer_count,
            } => {
                put_name(buf, servername);
                buf.put_u8(*max_peers);
                buf.put_u8(*peer_count);
            }
            Frame::Ack { seq, slice } => {
                buf.put_u16(*seq);
                match slice {
                    Some(index) => {
                        buf.put_u8(1);
                        buf.put_u16(*index);
                    }
                    None => buf.put_u8(0),
                }
            }
            Frame::Data {
                seq,
                chunk,
                sender,
                dest,
                module_id,
                payload,
                ..
            } => {
                buf.put_u16(*seq);
                if let Some(chunk) = chunk {
                    buf.put_u16(chunk.index);
                    buf.put_u16(chunk.count);
                }
                buf.put_u8(*sender);
                buf.put_u8(*dest);
                buf.put_u8(module_id.len() as u8);
                buf.put_slice(module_id);
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
            Frame::ClientInfo {
                seq,
                peer_id,
                username,
                color,
            } => {
                buf.put_u16(*seq);
                buf.put_u8(*peer_id);
                put_name(buf, username);
                put_color(buf, *color);
            }
        }
    }

    /// The total number of bytes this frame will occupy when encoded.
    pub fn encoded_len(&self) -> usize {
        // 4 bytes checksum + 1 byte type in every variant
        5 + match self {
            Frame::ConnectionRequest | Frame::ConnectionDenied | Frame::ConnectionClosed => 0,
            Frame::ConnectionChallenge { .. } => 8,
            Frame::ChallengeAnswer { username, .. } => 1 + username.len() + 4 + 32,
            Frame::ConnectionAccepted { .. } => 1,
            Frame::ClientDisconnected { .. } => 1,
            Frame::ServerInformation { servername, .. } => 1 + servername.len() + 2,
            Frame::Ack { slice, .. } => 2 + 1 + if slice.is_some() { 2 } else { 0 },
            Frame::Data {
                chunk,
                module_id,
                payload,
                ..
            } => {
                2 + if chunk.is_some() { 4 } else { 0 }
                    + 2
                    + 1
                    + module_id.len()
                    + 2
                    + payload.len()
            }
            Frame::ClientInfo { username, .. } => 2 + 1 + 1 + username.len() + 4,
        }
    }

    /// Decode a frame from a full datagram, validating the checksum.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(WireError::FrameTooShort {
                expected: 5,
                actual: data.len(),
            });
        }

        let header = (&data[0..4]).get_u32();
        let computed = crc32fast::hash(&data[4..]);
        if header != computed {
            return Err(WireError::ChecksumMismatch { header, computed });
        }

        let raw = data[4];
        let chunked = raw & CHUNK_FLAG != 0;
        let frame_type = FrameType::try_from(raw & !CHUNK_FLAG)?;
        if chunked && !frame_type.is_chunkable() {
            return Err(WireError::InvalidChunkFlag(raw));
        }

        let mut body = &data[5..];
        match frame_type {
            FrameType::ConnectionRequest => Ok(Frame::ConnectionRequest),
            FrameType::ConnectionDenied => Ok(Frame::ConnectionDenied),
            FrameType::ConnectionClosed => Ok(Frame::ConnectionClosed),
            FrameType::ConnectionChallenge => {
                ensure_len(body, 8)?;
                Ok(Frame::ConnectionChallenge {
                    nonce: body.get_u64(),
                })
            }
            FrameType::ChallengeAnswer => {
                let username = get_name(&mut body)?;
                let color = get_color(&mut body)?;
                ensure_len(body, 32)?;
                let mut proof = [0u8; 32];
                proof.copy_from_slice(&body[..32]);
                Ok(Frame::ChallengeAnswer {
                    username,
                    color,
                    proof,
                })
            }
            FrameType::ConnectionAccepted => {
                ensure_len(body, 1)?;
                Ok(Frame::ConnectionAccepted {
                    peer_id: body.get_u8(),
                })
            }
            FrameType::ClientDisconnected => {
                ensure_len(body, 1)?;
                Ok(Frame::ClientDisconnected {
                    peer_id: body.get_u8(),
                })
            }
            FrameType::ServerInformation => {
                let servername = get_name(&mut body)?;
                ensure_len(body, 2)?;
                Ok(Frame::ServerInformation {
                    servername,
                    max_peers: body.get_u8(),
                    peer_count: body.get_u8(),
                })
            }
            FrameType::Ack => {
                ensure_len(body, 3)?;
                let seq = body.get_u16();
                let slice = match body.get_u8() {
                    0 => None,
                    _ => {
                        ensure_len(body, 2)?;
                        Some(body.get_u16())
                    }
                };
                Ok(Frame::Ack { seq, slice })
            }
            FrameType::ReliableData
            | FrameType::ReliableUnorderedData
            | FrameType::UnreliableData
            | FrameType::UnreliableUnorderedData => {
                let channel = Channel::from_frame_type(frame_type)?;
                ensure_len(body, 2)?;
                let seq = body.get_u16();
                let chunk = if chunked {
                    ensure_len(body, 4)?;
                    let index = body.get_u16();
                    let count = body.get_u16();
                    Some(ChunkInfo { index, count })
                } else {
                    None
                };
                ensure_len(body, 2)?;
                let sender = body.get_u8();
                let dest = body.get_u8();
                ensure_len(body, 1)?;
                let module_len = body.get_u8() as usize;
                ensure_len(body, module_len)?;
                let module_id = Bytes::copy_from_slice(&body[..module_len]);
                body.advance(module_len);
                ensure_len(body, 2)?;
                let payload_len = body.get_u16() as usize;
                ensure_len(body, payload_len)?;
                let payload = Bytes::copy_from_slice(&body[..payload_len]);
                Ok(Frame::Data {
                    channel,
                    seq,
                    chunk,
                    sender,
                    dest,
                    module_id,
                    payload,
                })
            }
            FrameType::ClientInfo => {
                ensure_len(body, 3)?;
                let seq = body.get_u16();
                let peer_id = body.get_u8();
                let username = get_name(&mut body)?;
                let color = get_color(&mut body)?;
                Ok(Frame::ClientInfo {
                    seq,
                    peer_id,
                    username,
                    color,
                })
            }
        }
    }
}

fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(WireError::FrameTooShort {
            expected: needed,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}

/// Validate a username or servername: pure ASCII, at most [`MAX_NAME_LEN`] bytes.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    if !name.is_ascii() {
        return Err(WireError::NonAsciiName);
    }
    Ok(())
}

fn put_name(buf: &mut BytesMut, name: &str) {
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
}

fn get_name(body: &mut &[u8]) -> Result<String> {
    ensure_len(body, 1)?;
    let len = body.get_u8() as usize;
    ensure_len(body, len)?;
    let raw = &body[..len];
    if !raw.is_ascii() {
        return Err(WireError::NonAsciiName);
    }
    if len > MAX_NAME_LEN {
        return Err(WireError::NameTooLong {
            len,
            max: MAX_NAME_LEN,
        });
    }
    let name = String::from_utf8_lossy(raw).into_owned();
    body.advance(len);
    Ok(name)
}

fn put_color(buf: &mut BytesMut, color: Color) {
    buf.put_u8(color.r);
    buf.put_u8(color.g);
    buf.put_u8(color.b);
    buf.put_u8(color.a);
}

fn get_color(body: &mut &[u8]) -> Result<Color> {
    ensure_len(body, 4)?;
    Ok(Color {
        r: body.get_u8(),
        g: body.get_u8(),
        b: body.get_u8(),
        a: body.get_u8(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let wire = frame.encode();
        assert_eq!(wire.len(), frame.encoded_len());
        Frame::decode(&wire).unwrap()
    }

    #[test]
    fn handshake_frames_round_trip() {
        assert_eq!(round_trip(Frame::ConnectionRequest), Frame::ConnectionRequest);
        assert_eq!(
            round_trip(Frame::ConnectionChallenge { nonce: 0xDEAD_BEEF_CAFE_F00D }),
            Frame::ConnectionChallenge { nonce: 0xDEAD_BEEF_CAFE_F00D }
        );
        let answer = Frame::ChallengeAnswer {
            username: "alice".into(),
            color: Color { r: 1, g: 2, b: 3, a: 4 },
            proof: [7u8; 32],
        };
        assert_eq!(round_trip(answer.clone()), answer);
        assert_eq!(
            round_trip(Frame::ConnectionAccepted { peer_id: 2 }),
            Frame::ConnectionAccepted { peer_id: 2 }
        );
    }

    #[test]
    fn ack_with_and_without_slice() {
        assert_eq!(
            round_trip(Frame::Ack { seq: 42, slice: None }),
            Frame::Ack { seq: 42, slice: None }
        );
        assert_eq!(
            round_trip(Frame::Ack { seq: 42, slice: Some(3) }),
            Frame::Ack { seq: 42, slice: Some(3) }
        );
    }

    #[test]
    fn data_frame_round_trip() {
        let frame = Frame::Data {
            channel: Channel::ReliableOrdered,
            seq: 1000,
            chunk: None,
            sender: 2,
            dest: 0,
            module_id: Bytes::from_static(&[0x01]),
            payload: Bytes::from_static(&[0xDE, 0xAD]),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn chunked_data_sets_high_bit() {
        let frame = Frame::Data {
            channel: Channel::ReliableOrdered,
            seq: 7,
            chunk: Some(ChunkInfo { index: 1, count: 3 }),
            sender: 3,
            dest: 1,
            module_id: Bytes::from_static(b"m"),
            payload: Bytes::from_static(b"slice"),
        };
        let wire = frame.encode();
        assert_eq!(wire[4], FrameType::ReliableData as u8 | CHUNK_FLAG);
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn chunk_flag_on_unreliable_rejected() {
        let frame = Frame::Data {
            channel: Channel::UnreliableOrdered,
            seq: 7,
            chunk: None,
            sender: 3,
            dest: 1,
            module_id: Bytes::new(),
            payload: Bytes::new(),
        };
        let mut wire = BytesMut::from(&frame.encode()[..]);
        wire[4] |= CHUNK_FLAG;
        let crc = crc32fast::hash(&wire[4..]);
        wire[..4].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            Frame::decode(&wire),
            Err(WireError::InvalidChunkFlag(_))
        ));
    }

    #[test]
    fn client_info_round_trip() {
        let frame = Frame::ClientInfo {
            seq: 9,
            peer_id: 4,
            username: "bob".into(),
            color: Color::WHITE,
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn server_information_round_trip() {
        let frame = Frame::ServerInformation {
            servername: "lan party".into(),
            max_peers: 8,
            peer_count: 3,
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let mut wire = BytesMut::from(&Frame::ConnectionRequest.encode()[..]);
        wire[0] ^= 0xFF;
        assert!(matches!(
            Frame::decode(&wire),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn flipped_body_bit_rejected() {
        let frame = Frame::ConnectionChallenge { nonce: 1 };
        let mut wire = BytesMut::from(&frame.encode()[..]);
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(matches!(
            Frame::decode(&wire),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn short_frame_rejected() {
        assert!(matches!(
            Frame::decode(&[0, 1, 2]),
            Err(WireError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u32(0);
        wire.put_u8(0x3F);
        let crc = crc32fast::hash(&wire[4..]);
        wire[..4].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            Frame::decode(&wire),
            Err(WireError::UnknownFrameType(0x3F))
        ));
    }

    #[test]
    fn truncated_body_rejected() {
        let wire = Frame::ConnectionChallenge { nonce: 1 }.encode();
        // Re-checksum a truncated copy so only the length check can fail.
        let mut cut = BytesMut::from(&wire[..wire.len() - 2]);
        let crc = crc32fast::hash(&cut[4..]);
        cut[..4].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            Frame::decode(&cut),
            Err(WireError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("alice").is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(matches!(
            validate_name(&"x".repeat(MAX_NAME_LEN + 1)),
            Err(WireError::NameTooLong { .. })
        ));
        assert!(matches!(
            validate_name("über"),
            Err(WireError::NonAsciiName)
        ));
    }
}
