//! A piece mid-download: its buffer and per-block request slots.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::peer::{block_count, block_length, BlockRequest};
use crate::constants::BLOCK_SIZE;

/// Assignment state of one block slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not asked of anyone.
    Pending,
    /// Requested from one peer, or several during endgame.
    InFlight,
    /// Block bytes are in the buffer.
    Received,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    // Peers with this block in flight; more than one only in endgame.
    owners: Vec<SocketAddr>,
    sent_at: Option<Instant>,
}

impl Slot {
    fn fresh() -> Self {
        Self {
            state: SlotState::Pending,
            owners: Vec::new(),
            sent_at: None,
        }
    }
}

/// What happened when a block was offered to a piece.
#[derive(Debug)]
pub enum StoreResult {
    /// Wrong offset, length, or slot; nothing stored.
    Malformed,
    /// The slot already holds its block.
    Duplicate,
    /// Stored; the listed peers held duplicate in-flight requests.
    Stored { cancel_peers: Vec<SocketAddr> },
}

/// A piece being reassembled from blocks fetched across peers.
///
/// Created when the scheduler first assigns one of its blocks;
/// destroyed on successful verification or abandoned state cleanup.
#[derive(Debug)]
pub struct PieceInProgress {
    pub index: u32,
    pub length: u32,
    buf: Vec<u8>,
    slots: Vec<Slot>,
    received: usize,
    contributors: HashSet<SocketAddr>,
}

impl PieceInProgress {
    pub fn new(index: u32, length: u32) -> Self {
        let slots = (0..block_count(length)).map(|_| Slot::fresh()).collect();
        Self {
            index,
            length,
            buf: vec![0; length as usize],
            slots,
            received: 0,
            contributors: HashSet::new(),
        }
    }

    /// The block address behind a slot index.
    pub fn block_at(&self, slot: usize) -> BlockRequest {
        BlockRequest {
            piece: self.index,
            offset: slot as u32 * BLOCK_SIZE,
            length: block_length(self.length, slot as u32),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Pending)
            .count()
    }

    /// Indices of unassigned slots, in offset order.
    pub fn pending_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Pending)
            .map(|(i, _)| i)
            .collect()
    }

    /// In-flight slots this peer does not already own; endgame fodder.
    pub fn inflight_slots_not_owned_by(&self, peer: SocketAddr) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::InFlight && !s.owners.contains(&peer))
            .map(|(i, _)| i)
            .collect()
    }

    /// Puts a slot in flight for `peer`.
    pub fn assign(&mut self, slot: usize, peer: SocketAddr, now: Instant) {
        let s = &mut self.slots[slot];
        debug_assert_ne!(s.state, SlotState::Received);
        s.state = SlotState::InFlight;
        if !s.owners.contains(&peer) {
            s.owners.push(peer);
        }
        s.sent_at = Some(now);
    }

    /// Offers a received block to the piece.
    ///
    /// Blocks are accepted whether or not they were solicited from
    /// `peer`; a slot fills exactly once and later copies are
    /// duplicates.
    pub fn store(&mut self, peer: SocketAddr, req: &BlockRequest, data: &[u8]) -> StoreResult {
        let slot = req.slot();
        if slot >= self.slots.len()
            || !req.is_aligned(self.length)
            || data.len() != req.length as usize
        {
            return StoreResult::Malformed;
        }
        let s = &mut self.slots[slot];
        if s.state == SlotState::Received {
            return StoreResult::Duplicate;
        }
        let start = req.offset as usize;
        self.buf[start..start + data.len()].copy_from_slice(data);
        let cancel_peers = s.owners.iter().copied().filter(|p| *p != peer).collect();
        s.state = SlotState::Received;
        s.owners.clear();
        s.sent_at = None;
        self.received += 1;
        self.contributors.insert(peer);
        StoreResult::Stored { cancel_peers }
    }

    /// Withdraws a peer from every slot it owns; ownerless slots go
    /// back to pending. Received blocks are kept.
    pub fn release(&mut self, peer: SocketAddr) {
        for s in &mut self.slots {
            if s.state != SlotState::InFlight {
                continue;
            }
            s.owners.retain(|p| *p != peer);
            if s.owners.is_empty() {
                s.state = SlotState::Pending;
                s.sent_at = None;
            }
        }
    }

    /// Reverts in-flight slots older than `timeout` to pending.
    ///
    /// Returns the owners each expired slot was charged to.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(usize, Vec<SocketAddr>)> {
        let mut expired = Vec::new();
        for (i, s) in self.slots.iter_mut().enumerate() {
            if s.state != SlotState::InFlight {
                continue;
            }
            let stale = s
                .sent_at
                .is_some_and(|sent| now.duration_since(sent) >= timeout);
            if stale {
                s.state = SlotState::Pending;
                s.sent_at = None;
                expired.push((i, std::mem::take(&mut s.owners)));
            }
        }
        expired
    }

    /// Forgets everything after a failed hash check so the piece is
    /// rescheduled from scratch. Returns the peers that contributed.
    pub fn reset(&mut self) -> Vec<SocketAddr> {
        for s in &mut self.slots {
            *s = Slot::fresh();
        }
        self.received = 0;
        self.buf.fill(0);
        self.contributors.drain().collect()
    }

    /// The reassembled piece buffer.
    pub fn assemble(&self) -> Bytes {
        debug_assert!(self.is_complete());
        Bytes::copy_from_slice(&self.buf)
    }

    pub fn contributors(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.contributors.iter().copied()
    }
}
