//! Extended messaging: the post-handshake dictionary and the per-peer
//! extension id maps.
//!
//! Each side assigns small message ids to the extension names it
//! speaks and announces them in a bencoded handshake dictionary. The
//! map is mutable for the life of the connection: a peer may
//! rehandshake, and an id of zero retracts a name.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::PeerError;

/// Extended-message id of the extended handshake itself.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// Extension name for metadata exchange.
pub const UT_METADATA: &str = "ut_metadata";

/// The local id under which we accept `ut_metadata` messages.
pub const UT_METADATA_LOCAL_ID: u8 = 1;

/// The extended-handshake dictionary.
///
/// Unknown keys are ignored on decode; unknown extension names in `m`
/// are kept and never dispatched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedHandshake {
    /// Extension name to message id assignments.
    #[serde(default)]
    pub m: BTreeMap<String, i64>,
    /// Client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// Request queue depth the sender will honor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,
    /// Size of the info dictionary, when metadata exchange is offered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
}

impl ExtendedHandshake {
    /// The dictionary we announce.
    pub fn ours(extensions: &[(&str, u8)]) -> Self {
        let mut hs = Self {
            v: Some(concat!("strand/", env!("CARGO_PKG_VERSION")).to_string()),
            ..Self::default()
        };
        for &(name, id) in extensions {
            hs.m.insert(name.to_string(), id as i64);
        }
        hs
    }

    pub fn encode(&self) -> Result<Bytes, PeerError> {
        serde_bencode::to_bytes(self)
            .map(Bytes::from)
            .map_err(|e| PeerError::Decoding(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        serde_bencode::from_bytes(payload).map_err(|e| PeerError::Decoding(e.to_string()))
    }
}

/// Name and id assignments for both directions of one connection.
#[derive(Debug, Default)]
pub struct ExtensionMap {
    // name -> id we advertised; the peer addresses us with these.
    ours: BTreeMap<String, u8>,
    // name -> id the peer advertised; we address the peer with these.
    theirs: BTreeMap<String, u8>,
}

impl ExtensionMap {
    /// Registers an extension we accept under a local id.
    pub fn advertise(&mut self, name: &str, id: u8) {
        self.ours.insert(name.to_string(), id);
    }

    /// Applies a (re)handshake from the peer.
    ///
    /// An id of zero retracts the name; anything else assigns it.
    /// Names we do not recognize are kept so they round-trip through
    /// queries, but nothing ever dispatches on them.
    pub fn apply_remote(&mut self, hs: &ExtendedHandshake) {
        for (name, &id) in &hs.m {
            if id == 0 {
                self.theirs.remove(name);
            } else if (1..=255).contains(&id) {
                self.theirs.insert(name.clone(), id as u8);
            }
        }
    }

    /// Resolves the name behind an id the peer used to address us.
    pub fn incoming_name(&self, id: u8) -> Option<&str> {
        self.ours
            .iter()
            .find(|(_, &local)| local == id)
            .map(|(name, _)| name.as_str())
    }

    /// The id to use when sending `name` to the peer.
    pub fn outgoing_id(&self, name: &str) -> Option<u8> {
        self.theirs.get(name).copied()
    }
}

/// Caps repeated metadata-piece requests per info-piece index.
#[derive(Debug)]
pub struct MetadataGuard {
    counts: HashMap<u32, u32>,
    cap: u32,
}

impl MetadataGuard {
    pub fn new(cap: u32) -> Self {
        Self {
            counts: HashMap::new(),
            cap,
        }
    }

    /// Admits one request for `piece`; `false` once the cap is spent.
    pub fn admit(&mut self, piece: u32) -> bool {
        let seen = self.counts.entry(piece).or_insert(0);
        if *seen >= self.cap {
            return false;
        }
        *seen += 1;
        true
    }
}

#[derive(Debug, Deserialize)]
struct MetadataHeader {
    msg_type: i64,
    piece: i64,
}

/// The piece index of a metadata request, if `payload` is one.
///
/// Data and reject messages (and anything unparsable) return `None`.
pub fn metadata_request(payload: &[u8]) -> Option<u32> {
    let header: MetadataHeader = serde_bencode::from_bytes(payload).ok()?;
    (header.msg_type == 0 && header.piece >= 0).then_some(header.piece as u32)
}
