//! strand - a BitTorrent peer wire exchange library
//!
//! The crate downloads content-addressed datasets from swarms of
//! peers: it negotiates connections, schedules block requests across
//! them, reassembles and verifies pieces, and commits them to a
//! storage backend supplied by the caller.
//!
//! # Modules
//!
//! - [`peer`] - Wire codec, capabilities, and the per-connection state machine
//! - [`scheduler`] - Block/piece scheduling: rarest-first, endgame, timeouts
//! - [`session`] - Per-swarm coordinator multiplexing many peer connections
//! - [`manager`] - Listener and connector pool dispatching peers by info-hash
//! - [`storage`] - The piece storage contract sessions download into
//! - [`tracker`] - The announce/scrape contract sessions report through
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strand::{InfoHash, MemoryStorage, Session, SessionParams};
//!
//! # async fn example() -> Result<(), strand::SessionError> {
//! let info_hash = InfoHash::from_hex("c12fe1c06bba254a9dc9f519b335aa7c1367a88a").unwrap();
//! let hashes = vec![[0u8; 20]; 4];
//! let storage = Arc::new(MemoryStorage::new(hashes.clone(), 32768, 4 * 32768));
//!
//! let session = Session::new(SessionParams::new(info_hash, hashes, 32768, 4 * 32768, storage));
//! session.start().await?;
//! session.connect("203.0.113.9:6881".parse().unwrap()).await?;
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod info_hash;
pub mod manager;
pub mod peer;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod tracker;

pub use info_hash::InfoHash;
pub use manager::{Manager, ManagerOptions};
pub use peer::{
    Bitfield, Block, BlockRequest, Capabilities, Capability, ConnectionOptions, FloodDetector,
    FloodOptions, Handshake, Message, PeerConnection, PeerError, PeerId, RatioFlood, TrafficStats,
};
pub use scheduler::{BlockOutcome, Intent, Scheduler, SchedulerOptions};
pub use session::{
    Session, SessionError, SessionEvent, SessionOptions, SessionParams, SessionProgress,
};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use tracker::{
    AnnounceParams, AnnounceResponse, ScrapeResponse, Tracker, TrackerError, TrackerEvent,
};
