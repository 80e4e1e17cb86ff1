use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::extension::{
    metadata_request, ExtendedHandshake, ExtensionMap, MetadataGuard, EXTENDED_HANDSHAKE_ID,
    UT_METADATA, UT_METADATA_LOCAL_ID,
};
use super::flood::{FloodDetector, FloodOptions, TrafficStats};
use super::message::{Capabilities, Capability, Handshake, Message};
use super::peer_id::PeerId;
use crate::constants::{
    HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT, METADATA_FACTOR,
};
use crate::info_hash::InfoHash;

/// Tuning knobs for one peer connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Send a keepalive after this long without outgoing traffic.
    pub keepalive_interval: Duration,
    /// Drop the peer after this long without incoming bytes.
    pub keepalive_timeout: Duration,
    /// Bound on the handshake exchange.
    pub handshake_timeout: Duration,
    pub flood: FloodOptions,
    /// Metadata requests tolerated per info-piece index.
    pub metadata_factor: u32,
    /// When set, the remote must identify exactly as this peer.
    pub expected_peer_id: Option<PeerId>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            flood: FloodOptions::default(),
            metadata_factor: METADATA_FACTOR,
            expected_peer_id: None,
        }
    }
}

/// Choke and interest flags for both sides of a connection.
///
/// Fresh connections start mutually choked and uninterested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokeState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Traffic counters and activity timestamps for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub received: TrafficStats,
    pub sent: TrafficStats,
    pub last_received: Instant,
    pub last_sent: Instant,
}

impl ConnectionStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            received: TrafficStats::default(),
            sent: TrafficStats::default(),
            last_received: now,
            last_sent: now,
        }
    }
}

/// Connection state visible outside the reader task.
///
/// Received-side counters are written by the reader, sent-side
/// counters by whoever enqueues outgoing messages; everyone else takes
/// snapshots.
#[derive(Debug)]
pub struct ConnectionShared {
    /// Effective capabilities: ours AND theirs.
    pub caps: Capabilities,
    pub remote_id: PeerId,
    pub local_id: PeerId,
    stats: RwLock<ConnectionStats>,
    flags: RwLock<ChokeState>,
    bitfield_sent: AtomicBool,
}

impl ConnectionShared {
    fn new(caps: Capabilities, remote_id: PeerId, local_id: PeerId) -> Self {
        Self {
            caps,
            remote_id,
            local_id,
            stats: RwLock::new(ConnectionStats::new()),
            flags: RwLock::new(ChokeState::default()),
            bitfield_sent: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        *self.stats.read()
    }

    pub fn flags(&self) -> ChokeState {
        *self.flags.read()
    }

    /// Gate for an outgoing message: capability admission, the
    /// bitfield-once rule, flag bookkeeping, and traffic accounting.
    pub fn gate_outgoing(&self, msg: &Message) -> Result<(), PeerError> {
        if let Some(cap) = msg.capability() {
            if !self.caps.supports(cap) {
                return Err(PeerError::DisallowedMessage {
                    remote: self.remote_id,
                    required: cap,
                });
            }
        }
        if matches!(msg, Message::Bitfield(_)) && self.bitfield_sent.swap(true, Ordering::AcqRel)
        {
            return Err(PeerError::BitfieldAlreadySent(self.local_id));
        }
        {
            let mut flags = self.flags.write();
            match msg {
                Message::Choke => flags.am_choking = true,
                Message::Unchoke => flags.am_choking = false,
                Message::Interested => flags.am_interested = true,
                Message::NotInterested => flags.am_interested = false,
                _ => {}
            }
        }
        let mut stats = self.stats.write();
        stats.sent.record(msg.traffic());
        stats.last_sent = Instant::now();
        Ok(())
    }

    fn record_received(&self, msg: &Message) -> TrafficStats {
        let mut stats = self.stats.write();
        stats.received.record(msg.traffic());
        stats.last_received = Instant::now();
        stats.received
    }

    fn flip_incoming_flags(&self, msg: &Message) {
        let mut flags = self.flags.write();
        match msg {
            Message::Choke => flags.peer_choking = true,
            Message::Unchoke => flags.peer_choking = false,
            Message::Interested => flags.peer_interested = true,
            Message::NotInterested => flags.peer_interested = false,
            _ => {}
        }
    }
}

/// Everything the reader task knows about one remote peer.
#[derive(Debug)]
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub protocol: Bytes,
    pub info_hash: InfoHash,
    pub options: ConnectionOptions,
    pub shared: Arc<ConnectionShared>,
    pub extensions: ExtensionMap,
    pub remote_bitfield: Bitfield,
    num_pieces: usize,
    bitfield_received: bool,
    saw_extended_handshake: bool,
    metadata_guard: MetadataGuard,
    detector: Arc<dyn FloodDetector>,
}

impl PeerConnection {
    /// Validates an outbound handshake exchange.
    ///
    /// Checks run in order: protocol name, info-hash, then the
    /// caller-supplied peer id, if any.
    pub fn outbound(
        addr: SocketAddr,
        num_pieces: usize,
        local: &Handshake,
        remote: &Handshake,
        options: ConnectionOptions,
        detector: Arc<dyn FloodDetector>,
    ) -> Result<Self, PeerError> {
        if remote.protocol != local.protocol {
            return Err(PeerError::InvalidProtocol(remote.protocol.len()));
        }
        if remote.info_hash != local.info_hash {
            return Err(PeerError::UnexpectedTopic {
                expected: local.info_hash,
                got: remote.info_hash,
            });
        }
        if let Some(expected) = options.expected_peer_id {
            if remote.peer_id != expected {
                return Err(PeerError::UnexpectedPeerId {
                    expected: Box::new(expected),
                    got: Box::new(remote.peer_id),
                });
            }
        }
        Ok(Self::assemble(
            addr, num_pieces, local, remote, options, detector,
        ))
    }

    /// Validates an inbound handshake whose swarm was already resolved.
    pub fn inbound(
        addr: SocketAddr,
        num_pieces: usize,
        local: &Handshake,
        remote: &Handshake,
        options: ConnectionOptions,
        detector: Arc<dyn FloodDetector>,
    ) -> Result<Self, PeerError> {
        if remote.protocol != local.protocol {
            return Err(PeerError::InvalidProtocol(remote.protocol.len()));
        }
        Ok(Self::assemble(
            addr, num_pieces, local, remote, options, detector,
        ))
    }

    fn assemble(
        addr: SocketAddr,
        num_pieces: usize,
        local: &Handshake,
        remote: &Handshake,
        options: ConnectionOptions,
        detector: Arc<dyn FloodDetector>,
    ) -> Self {
        let caps = local.caps.intersect(remote.caps);
        let mut extensions = ExtensionMap::default();
        if caps.supports(Capability::Extended) {
            extensions.advertise(UT_METADATA, UT_METADATA_LOCAL_ID);
        }
        let metadata_factor = options.metadata_factor;
        Self {
            addr,
            protocol: local.protocol.clone(),
            info_hash: local.info_hash,
            options,
            shared: Arc::new(ConnectionShared::new(caps, remote.peer_id, local.peer_id)),
            extensions,
            remote_bitfield: Bitfield::new(num_pieces),
            num_pieces,
            bitfield_received: false,
            saw_extended_handshake: false,
            metadata_guard: MetadataGuard::new(metadata_factor),
            detector,
        }
    }

    pub fn remote_id(&self) -> PeerId {
        self.shared.remote_id
    }

    /// Whether the peer still owes us its extended handshake.
    pub fn awaiting_extended_handshake(&self) -> bool {
        self.shared.caps.supports(Capability::Extended) && !self.saw_extended_handshake
    }

    /// Admission pipeline for an incoming frame: capability check,
    /// traffic accounting, flood evaluation, extended-handshake
    /// obligation. Runs before any state change from the message.
    pub fn admit_incoming(&mut self, msg: &Message) -> Result<(), PeerError> {
        if let Some(cap) = msg.capability() {
            if !self.shared.caps.supports(cap) {
                return Err(PeerError::DisallowedMessage {
                    remote: self.shared.remote_id,
                    required: cap,
                });
            }
        }
        let received = self.shared.record_received(msg);
        if self.detector.is_flooded(&received, &self.options.flood) {
            return Err(PeerError::FloodDetected(received));
        }
        if self.awaiting_extended_handshake() {
            match msg {
                Message::KeepAlive => {}
                Message::Extended {
                    id: EXTENDED_HANDSHAKE_ID,
                    ..
                } => {}
                _ => return Err(PeerError::HandshakeRefused),
            }
        }
        Ok(())
    }

    /// State effects of an admitted incoming message.
    pub fn apply_incoming(&mut self, msg: &Message) -> Result<(), PeerError> {
        self.shared.flip_incoming_flags(msg);
        match msg {
            Message::Bitfield(bits) => {
                self.take_bitfield_slot()?;
                self.remote_bitfield = Bitfield::from_wire(bits.clone(), self.num_pieces)?;
            }
            Message::HaveAll => {
                self.take_bitfield_slot()?;
                self.remote_bitfield = Bitfield::full(self.num_pieces);
            }
            Message::HaveNone => {
                self.take_bitfield_slot()?;
                self.remote_bitfield = Bitfield::new(self.num_pieces);
            }
            Message::Have { piece } => {
                if *piece as usize >= self.num_pieces {
                    return Err(PeerError::Decoding(format!(
                        "have for piece {} of {}",
                        piece, self.num_pieces
                    )));
                }
                self.remote_bitfield.set(*piece as usize);
            }
            Message::Extended { id, payload } => self.apply_extended(*id, payload)?,
            _ => {}
        }
        Ok(())
    }

    fn take_bitfield_slot(&mut self) -> Result<(), PeerError> {
        if self.bitfield_received {
            return Err(PeerError::BitfieldAlreadySent(self.shared.remote_id));
        }
        self.bitfield_received = true;
        Ok(())
    }

    fn apply_extended(&mut self, id: u8, payload: &Bytes) -> Result<(), PeerError> {
        if id == EXTENDED_HANDSHAKE_ID {
            let hs = ExtendedHandshake::decode(payload)?;
            self.extensions.apply_remote(&hs);
            self.saw_extended_handshake = true;
            return Ok(());
        }
        match self.extensions.incoming_name(id) {
            Some(UT_METADATA) => {
                if let Some(piece) = metadata_request(payload) {
                    if !self.metadata_guard.admit(piece) {
                        return Err(PeerError::FloodDetected(self.shared.stats().received));
                    }
                    // We never offer metadata; admitted requests are dropped.
                    tracing::trace!(piece, "metadata request ignored");
                }
            }
            Some(other) => tracing::trace!(extension = other, "no handler for extension"),
            None => tracing::debug!(id, "extended message for unadvertised id"),
        }
        Ok(())
    }
}
