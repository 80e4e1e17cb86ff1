//! The tracker contract this crate announces through.
//!
//! HTTP and UDP announce transports live elsewhere; the session only
//! needs something that takes progress counters and hands back peer
//! addresses. The session reports `Started` on its first announce,
//! `Completed` on reaching a full bitfield, and `Stopped` on shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::constants::{NUMWANT_CAP, NUMWANT_DEFAULT};
use crate::info_hash::InfoHash;
use crate::peer::PeerId;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Lifecycle notice attached to an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Completed,
    Stopped,
}

/// One announce request.
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<TrackerEvent>,
    pub numwant: u32,
}

impl AnnounceParams {
    /// Clamps the peer-count request to the protocol cap.
    pub fn with_numwant(mut self, numwant: u32) -> Self {
        self.numwant = numwant.min(NUMWANT_CAP);
        self
    }

    pub fn default_numwant() -> u32 {
        NUMWANT_DEFAULT
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub peers: Vec<SocketAddr>,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeResponse {
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

/// A tracker transport.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(&self, params: AnnounceParams) -> Result<AnnounceResponse, TrackerError>;

    async fn scrape(&self, info_hash: InfoHash) -> Result<ScrapeResponse, TrackerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;

    #[test]
    fn numwant_is_capped() {
        let params = AnnounceParams {
            info_hash: InfoHash::from_bytes([0; 20]),
            peer_id: PeerId::generate(),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: Some(TrackerEvent::Started),
            numwant: AnnounceParams::default_numwant(),
        };
        assert_eq!(params.numwant, 50);
        assert_eq!(params.with_numwant(10_000).numwant, 200);
    }
}
