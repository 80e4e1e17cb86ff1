//! Protocol constants and tuning parameters.
//!
//! Defaults lean on the values common across mainstream clients
//! (libtorrent, Transmission, qBittorrent) where the wire protocol does
//! not pin them down.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Peer ID prefix, Azureus-style.
pub const CLIENT_PREFIX: &[u8] = b"-ST0001-";

// ============================================================================
// Blocks and frames
// ============================================================================

/// Request unit within a piece (16 KiB).
pub const BLOCK_SIZE: u32 = 16_384;

/// Largest block length we will serve. Requests above this are suspicious.
pub const MAX_REQUEST_LENGTH: u32 = 131_072;

/// Upper bound on a single wire frame. Anything larger is a decoding error.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Liveness
// ============================================================================

/// Send a keepalive after this long without outgoing traffic.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Drop a connection after this long without incoming bytes.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(180);

/// Time allowed for the full handshake exchange on a new socket.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Time allowed for an outbound TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Request scheduling
// ============================================================================

/// Initial per-peer in-flight request window.
pub const REQUEST_WINDOW: usize = 16;

/// An in-flight request older than this goes back to pending.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Request timeouts tolerated from one peer before disconnecting it.
pub const MAX_REQUEST_TIMEOUTS: u32 = 3;

// ============================================================================
// Flood detection
// ============================================================================

/// Received bytes before the flood predicate may fire.
pub const FLOOD_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Weight of overhead+control bytes against payload bytes.
pub const FLOOD_FACTOR: u64 = 1;

/// Metadata-piece requests allowed per info-piece index per connection.
pub const METADATA_FACTOR: u32 = 16;

// ============================================================================
// Connection limits and queues
// ============================================================================

/// Peers per session.
pub const MAX_PEERS_PER_SESSION: usize = 50;

/// Connections across all sessions of one manager.
pub const MAX_GLOBAL_CONNECTIONS: usize = 200;

/// Concurrent inbound handshake workers.
pub const MAX_ACCEPT_WORKERS: usize = 16;

/// Session event channel depth; full means readers stop reading.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Per-connection outgoing queue depth; full pauses request issue.
pub const OUTGOING_QUEUE_CAPACITY: usize = 64;

/// Observable session event stream depth.
pub const EVENT_STREAM_CAPACITY: usize = 64;

// ============================================================================
// Tracker
// ============================================================================

/// Peers requested per announce when the caller does not say.
pub const NUMWANT_DEFAULT: u32 = 50;

/// Hard cap on peers requested per announce.
pub const NUMWANT_CAP: u32 = 200;
