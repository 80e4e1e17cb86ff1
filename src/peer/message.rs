use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::block::{Block, BlockRequest};
use super::error::PeerError;
use super::peer_id::PeerId;
use crate::info_hash::InfoHash;

/// The protocol name we speak.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Handshake length for a protocol name of `n` bytes.
pub fn handshake_len(n: usize) -> usize {
    49 + n
}

/// A single negotiable protocol extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// DHT port announcements.
    Dht,
    /// Fast extension message set.
    Fast,
    /// Extended (dictionary) messaging.
    Extended,
}

impl Capability {
    fn bit(self) -> u64 {
        match self {
            Capability::Dht => 1 << 0,
            Capability::Fast => 1 << 2,
            Capability::Extended => 1 << 20,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Dht => write!(f, "dht"),
            Capability::Fast => write!(f, "fast"),
            Capability::Extended => write!(f, "extended messaging"),
        }
    }
}

/// The handshake reserved field as a capability set.
///
/// The eight reserved bytes read as a big-endian integer; bit positions
/// count from the least significant end. Bit 20 is extended messaging,
/// bit 2 the fast extension, bit 0 DHT.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u64);

impl Capabilities {
    /// Everything this crate negotiates on its own behalf.
    pub fn ours() -> Self {
        Capabilities(Capability::Extended.bit() | Capability::Fast.bit())
    }

    pub fn none() -> Self {
        Capabilities(0)
    }

    pub fn from_reserved(bytes: [u8; 8]) -> Self {
        Capabilities(u64::from_be_bytes(bytes))
    }

    pub fn to_reserved(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Capabilities both sides advertised.
    pub fn intersect(self, other: Self) -> Self {
        Capabilities(self.0 & other.0)
    }

    pub fn supports(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn with(self, cap: Capability) -> Self {
        Capabilities(self.0 | cap.bit())
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for cap in [Capability::Dht, Capability::Fast, Capability::Extended] {
            if self.supports(cap) {
                set.entry(&format_args!("{}", cap));
            }
        }
        set.finish()
    }
}

/// The first bytes exchanged on a new connection.
///
/// Layout: 1-byte protocol name length, the name itself, 8 reserved
/// capability bytes, the 20-byte info-hash, and the 20-byte peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol: Bytes,
    pub caps: Capabilities,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// A handshake for our protocol with our default capabilities.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: Bytes::from_static(PROTOCOL),
            caps: Capabilities::ours(),
            info_hash,
            peer_id,
        }
    }

    /// Encoded length on the wire.
    pub fn wire_len(&self) -> usize {
        handshake_len(self.protocol.len())
    }

    pub fn encode(&self) -> Bytes {
        debug_assert!(!self.protocol.is_empty() && self.protocol.len() <= 255);
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u8(self.protocol.len() as u8);
        buf.put_slice(&self.protocol);
        buf.put_slice(&self.caps.to_reserved());
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let n = *data.first().ok_or(PeerError::UnexpectedProtocol)? as usize;
        if n == 0 || data.len() < handshake_len(n) {
            return Err(PeerError::UnexpectedProtocol);
        }
        let protocol = Bytes::copy_from_slice(&data[1..1 + n]);
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[1 + n..9 + n]);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&data[9 + n..29 + n]);
        let mut id = [0u8; 20];
        id.copy_from_slice(&data[29 + n..49 + n]);
        Ok(Self {
            protocol,
            caps: Capabilities::from_reserved(reserved),
            info_hash: InfoHash::from_bytes(hash),
            peer_id: PeerId(id),
        })
    }
}

/// Message ids in the peer wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extended messaging
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            13 => MessageId::Suggest,
            14 => MessageId::HaveAll,
            15 => MessageId::HaveNone,
            16 => MessageId::Reject,
            17 => MessageId::AllowedFast,
            20 => MessageId::Extended,
            other => return Err(other),
        })
    }
}

/// A peer wire message.
///
/// Frames are a 4-byte big-endian length followed by a 1-byte id and
/// payload; a zero length is a keepalive. Unknown ids decode to
/// [`Message::Unknown`] so a connection can skip them without dying.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    Port(u16),
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject(BlockRequest),
    AllowedFast { piece: u32 },
    Extended { id: u8, payload: Bytes },
    /// A frame with an id we do not speak; payload discarded.
    Unknown { id: u8 },
}

impl Message {
    /// Encodes the message, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => Self::put_bare(&mut buf, MessageId::Choke),
            Message::Unchoke => Self::put_bare(&mut buf, MessageId::Unchoke),
            Message::Interested => Self::put_bare(&mut buf, MessageId::Interested),
            Message::NotInterested => Self::put_bare(&mut buf, MessageId::NotInterested),
            Message::Have { piece } => Self::put_piece_index(&mut buf, MessageId::Have, *piece),
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request(req) => Self::put_block(&mut buf, MessageId::Request, req),
            Message::Piece(block) => {
                buf.put_u32(9 + block.data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(block.piece);
                buf.put_u32(block.offset);
                buf.put_slice(&block.data);
            }
            Message::Cancel(req) => Self::put_block(&mut buf, MessageId::Cancel, req),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::Suggest { piece } => {
                Self::put_piece_index(&mut buf, MessageId::Suggest, *piece)
            }
            Message::HaveAll => Self::put_bare(&mut buf, MessageId::HaveAll),
            Message::HaveNone => Self::put_bare(&mut buf, MessageId::HaveNone),
            Message::Reject(req) => Self::put_block(&mut buf, MessageId::Reject, req),
            Message::AllowedFast { piece } => {
                Self::put_piece_index(&mut buf, MessageId::AllowedFast, *piece)
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::Unknown { id } => {
                buf.put_u32(1);
                buf.put_u8(*id);
            }
        }
        buf.freeze()
    }

    /// Decodes one frame, length prefix included.
    ///
    /// Fixed-shape ids are validated strictly; a length that disagrees
    /// with the id is a [`PeerError::Decoding`] error. Unknown ids are
    /// consumed whole and surfaced as [`Message::Unknown`].
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.len() < 4 {
            return Err(PeerError::Decoding("truncated frame".into()));
        }
        let length = frame.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if frame.remaining() != length {
            return Err(PeerError::Decoding(format!(
                "frame announces {} bytes, carries {}",
                length,
                frame.remaining()
            )));
        }

        let raw = frame.get_u8();
        let id = match MessageId::try_from(raw) {
            Ok(id) => id,
            Err(raw) => return Ok(Message::Unknown { id: raw }),
        };

        match id {
            MessageId::Choke => Self::bare(id, length, Message::Choke),
            MessageId::Unchoke => Self::bare(id, length, Message::Unchoke),
            MessageId::Interested => Self::bare(id, length, Message::Interested),
            MessageId::NotInterested => Self::bare(id, length, Message::NotInterested),
            MessageId::HaveAll => Self::bare(id, length, Message::HaveAll),
            MessageId::HaveNone => Self::bare(id, length, Message::HaveNone),
            MessageId::Have => {
                Self::expect(id, length, 5)?;
                Ok(Message::Have {
                    piece: frame.get_u32(),
                })
            }
            MessageId::Suggest => {
                Self::expect(id, length, 5)?;
                Ok(Message::Suggest {
                    piece: frame.get_u32(),
                })
            }
            MessageId::AllowedFast => {
                Self::expect(id, length, 5)?;
                Ok(Message::AllowedFast {
                    piece: frame.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(frame.copy_to_bytes(length - 1))),
            MessageId::Request => Ok(Message::Request(Self::get_block(id, length, &mut frame)?)),
            MessageId::Cancel => Ok(Message::Cancel(Self::get_block(id, length, &mut frame)?)),
            MessageId::Reject => Ok(Message::Reject(Self::get_block(id, length, &mut frame)?)),
            MessageId::Piece => {
                if length < 9 {
                    return Err(PeerError::Decoding(format!(
                        "piece frame of {} bytes",
                        length
                    )));
                }
                let piece = frame.get_u32();
                let offset = frame.get_u32();
                Ok(Message::Piece(Block::new(
                    piece,
                    offset,
                    frame.copy_to_bytes(length - 9),
                )))
            }
            MessageId::Port => {
                Self::expect(id, length, 3)?;
                Ok(Message::Port(frame.get_u16()))
            }
            MessageId::Extended => {
                if length < 2 {
                    return Err(PeerError::Decoding("extended frame without id".into()));
                }
                let ext_id = frame.get_u8();
                Ok(Message::Extended {
                    id: ext_id,
                    payload: frame.copy_to_bytes(length - 2),
                })
            }
        }
    }

    /// The capability a peer must have negotiated to exchange this
    /// message, if any.
    pub fn capability(&self) -> Option<Capability> {
        match self {
            Message::Port(_) => Some(Capability::Dht),
            Message::Extended { .. } => Some(Capability::Extended),
            Message::Suggest { .. }
            | Message::HaveAll
            | Message::HaveNone
            | Message::Reject(_)
            | Message::AllowedFast { .. } => Some(Capability::Fast),
            _ => None,
        }
    }

    /// Byte accounting as `(overhead, control, payload)`.
    ///
    /// Overhead is framing (length prefix and id byte), control is
    /// non-piece payload, payload is piece block bytes.
    pub fn traffic(&self) -> (u64, u64, u64) {
        match self {
            Message::KeepAlive => (4, 0, 0),
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone
            | Message::Unknown { .. } => (5, 0, 0),
            Message::Have { .. } | Message::Suggest { .. } | Message::AllowedFast { .. } => {
                (5, 4, 0)
            }
            Message::Bitfield(bits) => (5, bits.len() as u64, 0),
            Message::Request(_) | Message::Cancel(_) | Message::Reject(_) => (5, 12, 0),
            Message::Piece(block) => (5, 8, block.data.len() as u64),
            Message::Port(_) => (5, 2, 0),
            Message::Extended { payload, .. } => (5, 1 + payload.len() as u64, 0),
        }
    }

    fn put_bare(buf: &mut BytesMut, id: MessageId) {
        buf.put_u32(1);
        buf.put_u8(id as u8);
    }

    fn put_piece_index(buf: &mut BytesMut, id: MessageId, piece: u32) {
        buf.put_u32(5);
        buf.put_u8(id as u8);
        buf.put_u32(piece);
    }

    fn put_block(buf: &mut BytesMut, id: MessageId, req: &BlockRequest) {
        buf.put_u32(13);
        buf.put_u8(id as u8);
        buf.put_u32(req.piece);
        buf.put_u32(req.offset);
        buf.put_u32(req.length);
    }

    fn bare(id: MessageId, length: usize, msg: Message) -> Result<Message, PeerError> {
        Self::expect(id, length, 1)?;
        Ok(msg)
    }

    fn expect(id: MessageId, length: usize, want: usize) -> Result<(), PeerError> {
        if length != want {
            return Err(PeerError::Decoding(format!(
                "{:?} frame of {} bytes, expected {}",
                id, length, want
            )));
        }
        Ok(())
    }

    fn get_block(
        id: MessageId,
        length: usize,
        frame: &mut Bytes,
    ) -> Result<BlockRequest, PeerError> {
        Self::expect(id, length, 13)?;
        Ok(BlockRequest {
            piece: frame.get_u32(),
            offset: frame.get_u32(),
            length: frame.get_u32(),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keepalive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not-interested"),
            Message::Have { piece } => write!(f, "have {}", piece),
            Message::Bitfield(bits) => write!(f, "bitfield of {} bytes", bits.len()),
            Message::Request(r) => write!(f, "request {}+{}:{}", r.piece, r.offset, r.length),
            Message::Piece(b) => write!(f, "piece {}+{}:{}", b.piece, b.offset, b.data.len()),
            Message::Cancel(r) => write!(f, "cancel {}+{}:{}", r.piece, r.offset, r.length),
            Message::Port(port) => write!(f, "port {}", port),
            Message::Suggest { piece } => write!(f, "suggest {}", piece),
            Message::HaveAll => write!(f, "have-all"),
            Message::HaveNone => write!(f, "have-none"),
            Message::Reject(r) => write!(f, "reject {}+{}:{}", r.piece, r.offset, r.length),
            Message::AllowedFast { piece } => write!(f, "allowed-fast {}", piece),
            Message::Extended { id, payload } => {
                write!(f, "extended {} of {} bytes", id, payload.len())
            }
            Message::Unknown { id } => write!(f, "unknown id {}", id),
        }
    }
}
