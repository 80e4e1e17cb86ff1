//! Peer wire protocol: framing, handshakes, capabilities, and the
//! per-connection state machine.
//!
//! The types here are deliberately free of scheduling policy; which
//! blocks to ask a peer for is the scheduler's business.

mod bitfield;
mod block;
mod connection;
mod error;
mod extension;
mod flood;
mod message;
mod peer_id;
mod transport;

pub use bitfield::Bitfield;
pub use block::{block_count, block_length, blocks, Block, BlockRequest};
pub use connection::{
    ChokeState, ConnectionOptions, ConnectionShared, ConnectionStats, PeerConnection,
};
pub use error::PeerError;
pub use extension::{
    ExtendedHandshake, ExtensionMap, MetadataGuard, EXTENDED_HANDSHAKE_ID, UT_METADATA,
    UT_METADATA_LOCAL_ID,
};
pub use flood::{FloodDetector, FloodOptions, RatioFlood, TrafficStats};
pub use message::{Capabilities, Capability, Handshake, Message, MessageId, PROTOCOL};
pub use peer_id::PeerId;
pub use transport::{FrameReader, FrameWriter, Transport};
