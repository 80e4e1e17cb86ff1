//! Traffic accounting and flood detection.
//!
//! Every frame on a connection is charged to one of three classes:
//! framing overhead, control payload, and piece payload. A peer whose
//! mix is heavy on the first two relative to the third is flooding.

use std::fmt;

use crate::constants::{FLOOD_FACTOR, FLOOD_THRESHOLD};

/// Byte counters for one direction of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Length prefixes and message id bytes.
    pub overhead: u64,
    /// Non-piece message payload.
    pub control: u64,
    /// Piece block bytes.
    pub payload: u64,
}

impl TrafficStats {
    /// Total bytes across all classes.
    pub fn transmitted(&self) -> u64 {
        self.overhead + self.control + self.payload
    }

    pub fn record(&mut self, (overhead, control, payload): (u64, u64, u64)) {
        self.overhead += overhead;
        self.control += control;
        self.payload += payload;
    }
}

impl fmt::Display for TrafficStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "overhead {} control {} payload {}",
            self.overhead, self.control, self.payload
        )
    }
}

/// Tuning for the flood predicate.
#[derive(Debug, Clone, Copy)]
pub struct FloodOptions {
    /// Weight of overhead+control bytes against payload bytes.
    pub factor: u64,
    /// Received bytes before the predicate may fire.
    pub threshold: u64,
}

impl Default for FloodOptions {
    fn default() -> Self {
        Self {
            factor: FLOOD_FACTOR,
            threshold: FLOOD_THRESHOLD,
        }
    }
}

/// Decides whether a traffic mix amounts to a flood.
///
/// Supplied as a value at session construction so callers can swap the
/// policy without touching the connection machinery.
pub trait FloodDetector: Send + Sync + std::fmt::Debug {
    fn is_flooded(&self, stats: &TrafficStats, opts: &FloodOptions) -> bool;
}

/// The stock detector: fires once enough bytes arrived and the
/// overhead-plus-control share outweighs the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct RatioFlood;

impl FloodDetector for RatioFlood {
    fn is_flooded(&self, stats: &TrafficStats, opts: &FloodOptions) -> bool {
        stats.transmitted() > opts.threshold
            && opts.factor * (stats.overhead + stats.control) > stats.payload
    }
}
