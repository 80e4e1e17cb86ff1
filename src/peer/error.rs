use thiserror::Error;

use super::flood::TrafficStats;
use super::message::Capability;
use super::peer_id::PeerId;
use crate::info_hash::InfoHash;

/// Errors that end one peer connection.
///
/// None of these are fatal to the session: the session logs the error,
/// charges [`penalty`](PeerError::penalty) against the peer's
/// reputation, and reschedules the peer's in-flight blocks.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake could not be parsed at all.
    #[error("malformed handshake")]
    UnexpectedProtocol,

    /// The handshake named a protocol other than ours.
    #[error("handshake for foreign protocol ({0} bytes)")]
    InvalidProtocol(usize),

    /// The handshake named a swarm other than the expected one.
    #[error("handshake for swarm {got}, expected {expected}")]
    UnexpectedTopic { expected: InfoHash, got: InfoHash },

    /// The peer identified itself differently than the caller required.
    #[error("peer identified as {got}, expected {expected}")]
    UnexpectedPeerId {
        expected: Box<PeerId>,
        got: Box<PeerId>,
    },

    /// An inbound handshake named a swarm we have no session for.
    #[error("no session for swarm {0}")]
    UnknownTopic(InfoHash),

    /// Both sides advertised extended messaging but the peer's first
    /// data-bearing frame was not the extended handshake.
    #[error("peer skipped the extended handshake")]
    HandshakeRefused,

    /// A second bitfield arrived (or was about to be sent) on a
    /// connection that already exchanged one.
    #[error("peer {0} sent a second bitfield")]
    BitfieldAlreadySent(PeerId),

    /// A message arrived whose capability was never negotiated.
    #[error("message from {remote} requires the {required} capability")]
    DisallowedMessage {
        remote: PeerId,
        required: Capability,
    },

    /// A frame disagreed with its message id's wire shape.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The socket closed, timed out, or the peer went silent.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// The flood predicate tripped on the peer's traffic mix.
    #[error("flooding: {0}")]
    FloodDetected(TrafficStats),

    /// A higher layer asked for the connection to be closed.
    #[error("disconnect requested")]
    DisconnectPeer,
}

impl PeerError {
    /// Reputation penalty charged to the peer for this error.
    ///
    /// Spec violations cost 1; mismatched swarms and graceful or
    /// network-level disconnects cost nothing.
    pub fn penalty(&self) -> u32 {
        match self {
            PeerError::Io(_)
            | PeerError::UnknownTopic(_)
            | PeerError::PeerDisconnected
            | PeerError::DisconnectPeer => 0,
            _ => 1,
        }
    }
}
