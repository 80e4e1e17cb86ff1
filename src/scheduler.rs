//! The download scheduler: which blocks to ask which peers for.
//!
//! A pure-logic engine with no sockets or clocks of its own. The
//! session feeds it peer state and received blocks; it answers with
//! request and cancel intents and with verification outcomes. All of
//! the piece-selection policy lives here: continuing in-progress
//! pieces, rarest-first with random tie breaks, the endgame, and
//! request timeouts.

pub mod piece;


use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::constants::{MAX_REQUEST_TIMEOUTS, REQUEST_TIMEOUT, REQUEST_WINDOW};
use crate::peer::{Bitfield, Block, BlockRequest};
use piece::{PieceInProgress, StoreResult};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Initial per-peer in-flight window.
    pub window: usize,
    /// In-flight requests older than this revert to pending.
    pub request_timeout: Duration,
    /// Timeout sweeps a peer may be caught in before disconnection.
    pub max_timeouts: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            window: REQUEST_WINDOW,
            request_timeout: REQUEST_TIMEOUT,
            max_timeouts: MAX_REQUEST_TIMEOUTS,
        }
    }
}

/// An instruction for the session to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Request { peer: SocketAddr, block: BlockRequest },
    Cancel { peer: SocketAddr, block: BlockRequest },
}

/// What became of a received block.
#[derive(Debug)]
pub enum BlockOutcome {
    /// Malformed, unsolicited for an unknown piece, or late.
    Ignored,
    /// The slot already had its block.
    Duplicate,
    /// Stored; endgame duplicates of it should be cancelled.
    Accepted { cancels: Vec<Intent> },
    /// The piece completed and its hash checked out.
    Verified {
        piece: u32,
        data: Bytes,
        cancels: Vec<Intent>,
    },
    /// The piece completed but failed its hash; contributors are to
    /// be penalized and the piece was rescheduled.
    Rejected {
        piece: u32,
        contributors: Vec<SocketAddr>,
        cancels: Vec<Intent>,
    },
}

/// Aftermath of a timeout sweep.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Peers that crossed the unreliability threshold.
    pub disconnects: Vec<SocketAddr>,
}

/// Verified-byte progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub left: u64,
}

// Per-peer scheduling state.
struct PeerBook {
    bitfield: Bitfield,
    choking_us: bool,
    in_flight: HashMap<BlockRequest, Instant>,
    window: usize,
    allowed_fast: HashSet<u32>,
    strikes: u32,
    paused: bool,
}

/// The per-swarm download scheduler.
pub struct Scheduler {
    num_pieces: usize,
    piece_length: u32,
    total_length: u64,
    hashes: Vec<[u8; 20]>,
    ours: Arc<RwLock<Bitfield>>,
    // Swarm-wide availability per piece.
    counts: Vec<u32>,
    peers: HashMap<SocketAddr, PeerBook>,
    pieces: HashMap<u32, PieceInProgress>,
    rng: StdRng,
    endgame: bool,
    options: SchedulerOptions,
}

impl Scheduler {
    /// Builds a scheduler over shared ownership of the session
    /// bitfield. Only the scheduler ever writes to it.
    pub fn new(
        hashes: Vec<[u8; 20]>,
        piece_length: u32,
        total_length: u64,
        ours: Arc<RwLock<Bitfield>>,
        rng: StdRng,
        options: SchedulerOptions,
    ) -> Self {
        let num_pieces = hashes.len();
        Self {
            num_pieces,
            piece_length,
            total_length,
            hashes,
            ours,
            counts: vec![0; num_pieces],
            peers: HashMap::new(),
            pieces: HashMap::new(),
            rng,
            endgame: false,
            options,
        }
    }

    pub fn add_peer(&mut self, addr: SocketAddr) {
        self.peers.entry(addr).or_insert_with(|| PeerBook {
            bitfield: Bitfield::new(self.num_pieces),
            choking_us: true,
            in_flight: HashMap::new(),
            window: self.options.window,
            allowed_fast: HashSet::new(),
            strikes: 0,
            paused: false,
        });
        self.update_endgame();
    }

    /// Replaces a peer's bitfield, keeping the rarity histogram
    /// consistent. Returns whether the peer now interests us.
    pub fn peer_bitfield(&mut self, addr: SocketAddr, bitfield: Bitfield) -> bool {
        let Some(book) = self.peers.get_mut(&addr) else {
            return false;
        };
        let old = std::mem::replace(&mut book.bitfield, bitfield);
        for i in old.ones() {
            self.counts[i] = self.counts[i].saturating_sub(1);
        }
        let ones: Vec<usize> = self.peers[&addr].bitfield.ones().collect();
        for i in ones {
            self.counts[i] += 1;
        }
        self.interested_in(addr)
    }

    /// Marks one more piece at a peer. Returns current interest.
    pub fn peer_have(&mut self, addr: SocketAddr, piece: u32) -> bool {
        if let Some(book) = self.peers.get_mut(&addr) {
            if (piece as usize) < self.num_pieces && !book.bitfield.has(piece as usize) {
                book.bitfield.set(piece as usize);
                self.counts[piece as usize] += 1;
            }
        }
        self.interested_in(addr)
    }

    /// Whether the peer advertises the given piece.
    pub fn peer_has(&self, addr: SocketAddr, piece: u32) -> bool {
        self.peers
            .get(&addr)
            .is_some_and(|book| book.bitfield.has(piece as usize))
    }

    /// Whether the peer advertises a piece we still need.
    pub fn interested_in(&self, addr: SocketAddr) -> bool {
        let Some(book) = self.peers.get(&addr) else {
            return false;
        };
        let ours = self.ours.read();
        book.bitfield.ones().any(|i| !ours.has(i))
    }

    /// The peer choked us: its in-flight blocks return to the pool,
    /// except those it advertised as fast-allowed.
    pub fn peer_choked(&mut self, addr: SocketAddr) {
        let Some(book) = self.peers.get_mut(&addr) else {
            return;
        };
        book.choking_us = true;
        let keep = book.allowed_fast.clone();
        book.in_flight.retain(|req, _| keep.contains(&req.piece));
        for (idx, piece) in self.pieces.iter_mut() {
            if !keep.contains(idx) {
                piece.release(addr);
            }
        }
        self.update_endgame();
    }

    pub fn peer_unchoked(&mut self, addr: SocketAddr) {
        if let Some(book) = self.peers.get_mut(&addr) {
            book.choking_us = false;
        }
    }

    /// Records a fast-allowed advertisement from the peer.
    pub fn allowed_fast(&mut self, addr: SocketAddr, piece: u32) {
        if let Some(book) = self.peers.get_mut(&addr) {
            book.allowed_fast.insert(piece);
        }
    }

    /// Stops issuing requests to a peer whose queue is full.
    pub fn pause_peer(&mut self, addr: SocketAddr) {
        if let Some(book) = self.peers.get_mut(&addr) {
            book.paused = true;
        }
    }

    pub fn resume_peer(&mut self, addr: SocketAddr) {
        if let Some(book) = self.peers.get_mut(&addr) {
            book.paused = false;
        }
    }

    /// Adjusts a peer's in-flight window.
    pub fn set_window(&mut self, addr: SocketAddr, window: usize) {
        if let Some(book) = self.peers.get_mut(&addr) {
            book.window = window;
        }
    }

    /// Fills the peer's request window, at most `limit` new requests.
    ///
    /// Preference order: blocks of pieces already in progress that the
    /// peer holds, then fresh pieces by rarest-first (ties broken at
    /// random), then — in endgame only — duplicates of blocks in
    /// flight elsewhere. A choked peer is only asked for blocks of
    /// pieces it marked fast-allowed.
    pub fn next_requests(&mut self, addr: SocketAddr, limit: usize) -> Vec<Intent> {
        let now = Instant::now();
        let Some(book) = self.peers.get(&addr) else {
            return Vec::new();
        };
        if book.paused {
            return Vec::new();
        }
        let mut budget = book.window.saturating_sub(book.in_flight.len()).min(limit);
        if budget == 0 {
            return Vec::new();
        }
        let choked = book.choking_us;
        let bitfield = book.bitfield.clone();
        let allowed = book.allowed_fast.clone();
        let already: HashSet<BlockRequest> = book.in_flight.keys().copied().collect();
        let requestable =
            |idx: u32| bitfield.has(idx as usize) && (!choked || allowed.contains(&idx));

        let mut picked: Vec<BlockRequest> = Vec::new();

        // Continue pieces already underway.
        let mut underway: Vec<u32> = self.pieces.keys().copied().collect();
        underway.sort_unstable();
        for idx in &underway {
            if budget == 0 {
                break;
            }
            if !requestable(*idx) {
                continue;
            }
            let piece = self.pieces.get_mut(idx).expect("key from map");
            for slot in piece.pending_slots() {
                if budget == 0 {
                    break;
                }
                let block = piece.block_at(slot);
                if already.contains(&block) {
                    continue;
                }
                piece.assign(slot, addr, now);
                picked.push(block);
                budget -= 1;
            }
        }

        // Open fresh pieces.
        while budget > 0 {
            let Some(idx) = self.pick_fresh_piece(&bitfield, choked, &allowed) else {
                break;
            };
            let mut piece = PieceInProgress::new(idx, self.piece_size(idx));
            for slot in piece.pending_slots() {
                if budget == 0 {
                    break;
                }
                picked.push(piece.block_at(slot));
                piece.assign(slot, addr, now);
                budget -= 1;
            }
            self.pieces.insert(idx, piece);
        }

        // Endgame: shadow other peers' outstanding blocks.
        if budget > 0 && self.endgame {
            'pieces: for idx in &underway {
                if !requestable(*idx) {
                    continue;
                }
                let piece = self.pieces.get_mut(idx).expect("key from map");
                for slot in piece.inflight_slots_not_owned_by(addr) {
                    if budget == 0 {
                        break 'pieces;
                    }
                    let block = piece.block_at(slot);
                    if already.contains(&block) {
                        continue;
                    }
                    piece.assign(slot, addr, now);
                    picked.push(block);
                    budget -= 1;
                }
            }
        }

        let book = self.peers.get_mut(&addr).expect("present above");
        let mut intents = Vec::with_capacity(picked.len());
        for block in picked {
            book.in_flight.insert(block, now);
            intents.push(Intent::Request { peer: addr, block });
        }
        self.update_endgame();
        intents
    }

    /// Feeds a received block in. Completion triggers SHA-1
    /// verification against the piece hash.
    pub fn block_received(&mut self, addr: SocketAddr, block: Block) -> BlockOutcome {
        let req = block.request();
        if let Some(book) = self.peers.get_mut(&addr) {
            book.in_flight.remove(&req);
        }
        if self.ours.read().has(req.piece as usize) {
            return BlockOutcome::Ignored;
        }
        let Some(piece) = self.pieces.get_mut(&req.piece) else {
            tracing::debug!(piece = req.piece, "block for a piece not in progress");
            return BlockOutcome::Ignored;
        };
        match piece.store(addr, &req, &block.data) {
            StoreResult::Malformed => {
                tracing::warn!(peer = %addr, "malformed block {}+{}:{}", req.piece, req.offset, req.length);
                BlockOutcome::Ignored
            }
            StoreResult::Duplicate => BlockOutcome::Duplicate,
            StoreResult::Stored { cancel_peers } => {
                let mut cancels = Vec::new();
                for peer in cancel_peers {
                    if let Some(book) = self.peers.get_mut(&peer) {
                        book.in_flight.remove(&req);
                    }
                    cancels.push(Intent::Cancel { peer, block: req });
                }
                if self.pieces[&req.piece].is_complete() {
                    self.finish_piece(req.piece, cancels)
                } else {
                    self.update_endgame();
                    BlockOutcome::Accepted { cancels }
                }
            }
        }
    }

    /// Forgets a departed peer; its slots return to the pool but
    /// partly downloaded pieces are retained.
    pub fn drop_peer(&mut self, addr: SocketAddr) {
        if let Some(book) = self.peers.remove(&addr) {
            for i in book.bitfield.ones() {
                self.counts[i] = self.counts[i].saturating_sub(1);
            }
            for piece in self.pieces.values_mut() {
                piece.release(addr);
            }
        }
        self.update_endgame();
    }

    /// Sweeps request timeouts. Expired slots go back to pending; a
    /// peer caught in too many sweeps should be disconnected.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let timeout = self.options.request_timeout;
        let mut caught: HashSet<SocketAddr> = HashSet::new();
        let mut freed: Vec<(SocketAddr, BlockRequest)> = Vec::new();
        for piece in self.pieces.values_mut() {
            for (slot, owners) in piece.expire(now, timeout) {
                let block = piece.block_at(slot);
                for owner in owners {
                    caught.insert(owner);
                    freed.push((owner, block));
                }
            }
        }
        for (peer, block) in freed {
            if let Some(book) = self.peers.get_mut(&peer) {
                book.in_flight.remove(&block);
            }
        }
        let mut report = TickReport::default();
        for peer in caught {
            if let Some(book) = self.peers.get_mut(&peer) {
                book.strikes += 1;
                tracing::debug!(peer = %peer, strikes = book.strikes, "request timeout");
                if book.strikes >= self.options.max_timeouts {
                    report.disconnects.push(peer);
                }
            }
        }
        self.update_endgame();
        report
    }

    /// Verified bytes downloaded and bytes still missing.
    pub fn progress(&self) -> Progress {
        let ours = self.ours.read();
        let downloaded: u64 = ours.ones().map(|i| self.piece_size(i as u32) as u64).sum();
        Progress {
            downloaded,
            left: self.total_length - downloaded,
        }
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn piece_size(&self, index: u32) -> u32 {
        if (index as usize) < self.num_pieces.saturating_sub(1) {
            self.piece_length
        } else {
            let tail = self.total_length - (self.num_pieces as u64 - 1) * self.piece_length as u64;
            tail as u32
        }
    }

    fn finish_piece(&mut self, index: u32, cancels: Vec<Intent>) -> BlockOutcome {
        let piece = self.pieces.get_mut(&index).expect("completed piece");
        let data = piece.assemble();
        let digest: [u8; 20] = Sha1::digest(&data).into();
        if digest == self.hashes[index as usize] {
            self.pieces.remove(&index);
            self.ours.write().set(index as usize);
            self.update_endgame();
            BlockOutcome::Verified {
                piece: index,
                data,
                cancels,
            }
        } else {
            tracing::warn!(piece = index, "piece failed verification");
            let contributors = piece.reset();
            self.update_endgame();
            BlockOutcome::Rejected {
                piece: index,
                contributors,
                cancels,
            }
        }
    }

    // Rarest-first over pieces not yet started; ties resolved with the
    // session PRNG.
    fn pick_fresh_piece(
        &mut self,
        bitfield: &Bitfield,
        choked: bool,
        allowed: &HashSet<u32>,
    ) -> Option<u32> {
        let mut best = u32::MAX;
        let mut ties: Vec<u32> = Vec::new();
        {
            let ours = self.ours.read();
            for i in 0..self.num_pieces {
                let idx = i as u32;
                if !bitfield.has(i) || ours.has(i) || self.pieces.contains_key(&idx) {
                    continue;
                }
                if choked && !allowed.contains(&idx) {
                    continue;
                }
                match self.counts[i].cmp(&best) {
                    std::cmp::Ordering::Less => {
                        best = self.counts[i];
                        ties.clear();
                        ties.push(idx);
                    }
                    std::cmp::Ordering::Equal => ties.push(idx),
                    std::cmp::Ordering::Greater => {}
                }
            }
        }
        if ties.is_empty() {
            None
        } else {
            Some(ties[self.rng.random_range(0..ties.len())])
        }
    }

    // Endgame while the unrequested tail is smaller than the swarm we
    // are connected to; off again as soon as that stops holding or the
    // download finishes.
    fn update_endgame(&mut self) {
        let remaining = self.unrequested_blocks();
        let endgame = !self.ours.read().is_complete() && remaining < self.peers.len();
        if endgame != self.endgame {
            tracing::debug!(endgame, remaining, "endgame toggled");
            self.endgame = endgame;
        }
    }

    // Unassigned blocks across pieces in progress; pieces nobody has
    // started do not count.
    fn unrequested_blocks(&self) -> usize {
        self.pieces.values().map(|p| p.pending_count()).sum()
    }
}
