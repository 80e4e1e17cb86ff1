//! One session per swarm: the coordinator that multiplexes peer
//! connections, drives the scheduler, and talks to storage.
//!
//! Each peer connection runs as a reader task and a writer task so a
//! slow direction never blocks the other. A third task per session
//! owns the [`Scheduler`] and consumes events from every connection
//! over one bounded channel; when the channel is full, readers simply
//! stop reading and the sockets push back. Connection-local failures
//! never kill the session: they surface on the observable event
//! stream with the offender's penalty, and the peer's in-flight
//! blocks return to the pool.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    CONNECT_TIMEOUT, EVENT_CHANNEL_CAPACITY, EVENT_STREAM_CAPACITY, MAX_PEERS_PER_SESSION,
    MAX_REQUEST_LENGTH, NUMWANT_DEFAULT, OUTGOING_QUEUE_CAPACITY,
};
use crate::info_hash::InfoHash;
use crate::peer::{
    Bitfield, Block, BlockRequest, Capability, ConnectionOptions, ConnectionShared,
    ExtendedHandshake, FloodDetector, FrameReader, FrameWriter, Handshake, Message,
    PeerConnection, PeerError, PeerId, RatioFlood, Transport, EXTENDED_HANDSHAKE_ID, UT_METADATA,
    UT_METADATA_LOCAL_ID,
};
use crate::scheduler::{BlockOutcome, Intent, Scheduler, SchedulerOptions};
use crate::storage::{Storage, StorageError};
use crate::tracker::{AnnounceParams, Tracker, TrackerEvent};

/// Failures a session surfaces directly to its caller.
///
/// Only [`Session::start`] and [`Session::connect`] fail this way;
/// everything that goes wrong mid-session is reported on the event
/// stream instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("session is not running")]
    NotRunning,

    #[error("peer limit reached")]
    PeerLimit,
}

/// Observable session happenings.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerConnected {
        addr: SocketAddr,
        id: PeerId,
    },
    PeerDisconnected {
        addr: SocketAddr,
        reason: Option<String>,
        penalty: u32,
    },
    /// A tracker announce returned fresh peer addresses.
    PeersDiscovered(Vec<SocketAddr>),
    PieceVerified {
        piece: u32,
    },
    /// A completed piece failed its hash and was rescheduled.
    PieceRejected {
        piece: u32,
    },
    Completed,
    Stopped,
}

/// Byte counters for [`Session::progress`]. Downloaded counts
/// verified pieces only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionProgress {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connection: ConnectionOptions,
    pub scheduler: SchedulerOptions,
    pub max_peers: usize,
    /// Outgoing queue depth per connection.
    pub queue_capacity: usize,
    /// Event channel depth shared by all connection readers.
    pub event_capacity: usize,
    /// Port reported to trackers.
    pub listen_port: u16,
    pub numwant: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            scheduler: SchedulerOptions::default(),
            max_peers: MAX_PEERS_PER_SESSION,
            queue_capacity: OUTGOING_QUEUE_CAPACITY,
            event_capacity: EVENT_CHANNEL_CAPACITY,
            listen_port: 6881,
            numwant: NUMWANT_DEFAULT,
        }
    }
}

/// Everything needed to build a [`Session`].
pub struct SessionParams {
    pub info_hash: InfoHash,
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: u32,
    pub total_length: u64,
    pub storage: Arc<dyn Storage>,
    pub tracker: Option<Arc<dyn Tracker>>,
    pub local_id: PeerId,
    pub detector: Arc<dyn FloodDetector>,
    pub options: SessionOptions,
}

impl SessionParams {
    pub fn new(
        info_hash: InfoHash,
        piece_hashes: Vec<[u8; 20]>,
        piece_length: u32,
        total_length: u64,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            info_hash,
            piece_hashes,
            piece_length,
            total_length,
            storage,
            tracker: None,
            local_id: PeerId::generate(),
            detector: Arc::new(RatioFlood),
            options: SessionOptions::default(),
        }
    }
}

// What a connection reader reports to the session scheduler task.
enum PeerEvent {
    Joined {
        addr: SocketAddr,
        seat: PeerSeat,
    },
    Bitfield {
        addr: SocketAddr,
        bitfield: Bitfield,
    },
    Have {
        addr: SocketAddr,
        piece: u32,
    },
    Choke {
        addr: SocketAddr,
    },
    Unchoke {
        addr: SocketAddr,
    },
    Interested {
        addr: SocketAddr,
    },
    NotInterested {
        addr: SocketAddr,
    },
    AllowedFast {
        addr: SocketAddr,
        piece: u32,
    },
    Block {
        addr: SocketAddr,
        block: Block,
    },
    Request {
        addr: SocketAddr,
        request: BlockRequest,
    },
    CancelRequest {
        addr: SocketAddr,
        request: BlockRequest,
    },
    Left {
        addr: SocketAddr,
        error: Option<PeerError>,
    },
    Stop,
}

// The scheduler task's handle on one connection.
struct PeerSeat {
    out_tx: mpsc::Sender<Message>,
    shared: Arc<ConnectionShared>,
    cancel: CancellationToken,
}

struct Inner {
    info_hash: InfoHash,
    local_id: PeerId,
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u32,
    total_length: u64,
    num_pieces: usize,
    storage: Arc<dyn Storage>,
    tracker: Option<Arc<dyn Tracker>>,
    detector: Arc<dyn FloodDetector>,
    options: SessionOptions,
    // Written by the scheduler task only; everyone else reads.
    ours: Arc<RwLock<Bitfield>>,
    event_tx: mpsc::Sender<PeerEvent>,
    scheduler_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    running: AtomicBool,
    peer_count: AtomicUsize,
    uploaded: AtomicU64,
    reputation: Mutex<HashMap<SocketAddr, i64>>,
}

impl Inner {
    fn piece_size(&self, index: u32) -> u32 {
        if (index as usize) < self.num_pieces.saturating_sub(1) {
            self.piece_length
        } else {
            (self.total_length - (self.num_pieces as u64 - 1) * self.piece_length as u64) as u32
        }
    }
}

/// A cloneable handle on one swarm's session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        let num_pieces = params.piece_hashes.len();
        let (event_tx, event_rx) = mpsc::channel(params.options.event_capacity);
        let (events, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        Session {
            inner: Arc::new(Inner {
                info_hash: params.info_hash,
                local_id: params.local_id,
                piece_hashes: params.piece_hashes,
                piece_length: params.piece_length,
                total_length: params.total_length,
                num_pieces,
                storage: params.storage,
                tracker: params.tracker,
                detector: params.detector,
                options: params.options,
                ours: Arc::new(RwLock::new(Bitfield::new(num_pieces))),
                event_tx,
                scheduler_rx: Mutex::new(Some(event_rx)),
                events,
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
                peer_count: AtomicUsize::new(0),
                uploaded: AtomicU64::new(0),
                reputation: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.inner.info_hash
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peer_count.load(Ordering::SeqCst)
    }

    /// Snapshot of the pieces we hold.
    pub fn bitfield(&self) -> Bitfield {
        self.inner.ours.read().clone()
    }

    /// Long-term standing of a peer address, fed by error penalties
    /// and failed hash checks.
    pub fn reputation(&self, addr: SocketAddr) -> i64 {
        self.inner.reputation.lock().get(&addr).copied().unwrap_or(0)
    }

    /// Subscribes to the observable event stream.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn progress(&self) -> SessionProgress {
        let inner = &self.inner;
        let downloaded: u64 = inner
            .ours
            .read()
            .ones()
            .map(|i| inner.piece_size(i as u32) as u64)
            .sum();
        SessionProgress {
            downloaded,
            uploaded: inner.uploaded.load(Ordering::Relaxed),
            left: inner.total_length - downloaded,
        }
    }

    /// Recovers the bitfield from storage, spawns the scheduler task,
    /// and announces `Started`.
    pub async fn start(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        for index in 0..inner.num_pieces as u32 {
            if inner.storage.verify_piece(index).await? {
                inner.ours.write().set(index as usize);
            }
        }
        let Some(rx) = inner.scheduler_rx.lock().take() else {
            // A stopped session does not restart.
            return Err(SessionError::NotRunning);
        };
        let scheduler = Scheduler::new(
            inner.piece_hashes.clone(),
            inner.piece_length,
            inner.total_length,
            inner.ours.clone(),
            StdRng::from_os_rng(),
            inner.options.scheduler.clone(),
        );
        inner.running.store(true, Ordering::SeqCst);
        tracing::info!(
            swarm = %inner.info_hash,
            have = inner.ours.read().count(),
            pieces = inner.num_pieces,
            "session started"
        );
        tokio::spawn(
            SchedulerTask {
                inner: self.inner.clone(),
                sched: scheduler,
                seats: HashMap::new(),
                paused: HashSet::new(),
            }
            .run(rx),
        );
        let peers = announce(inner, Some(TrackerEvent::Started)).await;
        if !peers.is_empty() {
            let _ = inner.events.send(SessionEvent::PeersDiscovered(peers));
        }
        Ok(())
    }

    /// Opens an outbound connection and binds it to this session.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId, SessionError> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return Err(SessionError::NotRunning);
        }
        if inner.peer_count.load(Ordering::SeqCst) >= inner.options.max_peers {
            return Err(SessionError::PeerLimit);
        }
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })??;
        let mut transport = Transport::new(stream);
        let local = Handshake::new(inner.info_hash, inner.local_id);
        let limit = inner.options.connection.handshake_timeout;
        transport.send_handshake(&local, limit).await?;
        let remote = transport.read_handshake(limit).await?;
        let conn = PeerConnection::outbound(
            addr,
            inner.num_pieces,
            &local,
            &remote,
            inner.options.connection.clone(),
            inner.detector.clone(),
        )?;
        self.adopt(transport, conn).await
    }

    /// Adopts an inbound connection whose handshake already resolved
    /// to this swarm. Sends our handshake back, then validates.
    pub async fn accept(
        &self,
        mut transport: Transport,
        remote: Handshake,
    ) -> Result<PeerId, SessionError> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return Err(SessionError::NotRunning);
        }
        if inner.peer_count.load(Ordering::SeqCst) >= inner.options.max_peers {
            return Err(SessionError::PeerLimit);
        }
        let addr = transport.peer_addr().map_err(PeerError::Io)?;
        let local = Handshake::new(inner.info_hash, inner.local_id);
        transport
            .send_handshake(&local, inner.options.connection.handshake_timeout)
            .await?;
        let conn = PeerConnection::inbound(
            addr,
            inner.num_pieces,
            &local,
            &remote,
            inner.options.connection.clone(),
            inner.detector.clone(),
        )?;
        self.adopt(transport, conn).await
    }

    /// Gracefully winds the session down: every peer gets a
    /// not-interested, sockets close, and `Stopped` is announced.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if inner.event_tx.send(PeerEvent::Stop).await.is_err() {
            inner.cancel.cancel();
        }
        announce(inner, Some(TrackerEvent::Stopped)).await;
        tracing::info!(swarm = %inner.info_hash, "session stopped");
    }

    async fn adopt(
        &self,
        transport: Transport,
        conn: PeerConnection,
    ) -> Result<PeerId, SessionError> {
        let inner = &self.inner;
        let addr = conn.addr;
        let remote_id = conn.remote_id();
        let shared = conn.shared.clone();
        let (out_tx, out_rx) = mpsc::channel(inner.options.queue_capacity);
        let cancel = inner.cancel.child_token();

        let (reader, writer) = transport.split();
        tokio::spawn(writer_task(
            writer,
            out_rx,
            shared.clone(),
            inner.options.connection.keepalive_interval,
        ));

        // The extended handshake precedes any data-bearing message.
        if shared.caps.supports(Capability::Extended) {
            let ours = ExtendedHandshake::ours(&[(UT_METADATA, UT_METADATA_LOCAL_ID)]);
            let msg = Message::Extended {
                id: EXTENDED_HANDSHAKE_ID,
                payload: ours.encode()?,
            };
            shared.gate_outgoing(&msg)?;
            let _ = out_tx.send(msg).await;
        }
        {
            let ours = inner.ours.read().clone();
            if !ours.is_empty() {
                let msg = Message::Bitfield(ours.to_bytes());
                shared.gate_outgoing(&msg)?;
                let _ = out_tx.send(msg).await;
            }
        }

        inner.peer_count.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(reader_task(reader, conn, inner.event_tx.clone(), cancel.clone()));

        let seat = PeerSeat {
            out_tx,
            shared,
            cancel,
        };
        if inner
            .event_tx
            .send(PeerEvent::Joined { addr, seat })
            .await
            .is_err()
        {
            inner.peer_count.fetch_sub(1, Ordering::SeqCst);
            return Err(SessionError::NotRunning);
        }
        let _ = inner
            .events
            .send(SessionEvent::PeerConnected { addr, id: remote_id });
        tracing::info!(peer = %addr, id = %remote_id, "peer connected");
        Ok(remote_id)
    }
}

async fn announce(inner: &Inner, event: Option<TrackerEvent>) -> Vec<SocketAddr> {
    let Some(tracker) = &inner.tracker else {
        return Vec::new();
    };
    let downloaded: u64 = inner
        .ours
        .read()
        .ones()
        .map(|i| inner.piece_size(i as u32) as u64)
        .sum();
    let params = AnnounceParams {
        info_hash: inner.info_hash,
        peer_id: inner.local_id,
        port: inner.options.listen_port,
        uploaded: inner.uploaded.load(Ordering::Relaxed),
        downloaded,
        left: inner.total_length - downloaded,
        event,
        numwant: NUMWANT_DEFAULT,
    }
    .with_numwant(inner.options.numwant);
    match tracker.announce(params).await {
        Ok(response) => response.peers,
        Err(e) => {
            tracing::warn!(swarm = %inner.info_hash, "announce failed: {}", e);
            Vec::new()
        }
    }
}

// Decodes frames, feeds the connection state machine, posts events.
// Applying socket backpressure is implicit: a full event channel
// blocks the send and we stop reading.
async fn reader_task(
    mut frames: FrameReader,
    mut conn: PeerConnection,
    event_tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    let addr = conn.addr;
    let idle = conn.options.keepalive_timeout;
    let error = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break None,
            frame = frames.read_frame(idle) => match frame {
                Ok(frame) => frame,
                Err(e) => break Some(e),
            },
        };
        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(e) => break Some(e),
        };
        tracing::trace!(peer = %addr, "read: {}", msg);
        if let Err(e) = conn.admit_incoming(&msg) {
            break Some(e);
        }
        if let Err(e) = conn.apply_incoming(&msg) {
            break Some(e);
        }
        let event = match msg {
            Message::Choke => Some(PeerEvent::Choke { addr }),
            Message::Unchoke => Some(PeerEvent::Unchoke { addr }),
            Message::Interested => Some(PeerEvent::Interested { addr }),
            Message::NotInterested => Some(PeerEvent::NotInterested { addr }),
            Message::Have { piece } => Some(PeerEvent::Have { addr, piece }),
            Message::Bitfield(_) | Message::HaveAll | Message::HaveNone => {
                Some(PeerEvent::Bitfield {
                    addr,
                    bitfield: conn.remote_bitfield.clone(),
                })
            }
            Message::Piece(block) => Some(PeerEvent::Block { addr, block }),
            Message::Request(request) => Some(PeerEvent::Request { addr, request }),
            Message::Cancel(request) => Some(PeerEvent::CancelRequest { addr, request }),
            Message::AllowedFast { piece } => Some(PeerEvent::AllowedFast { addr, piece }),
            Message::Unknown { id } => {
                tracing::debug!(peer = %addr, id, "skipping unknown message");
                None
            }
            _ => None,
        };
        if let Some(event) = event {
            if event_tx.send(event).await.is_err() {
                break None;
            }
        }
    };
    let _ = event_tx.send(PeerEvent::Left { addr, error }).await;
}

// Drains the outgoing queue; sends keepalives when it idles. Ends
// when the queue closes or the socket dies.
async fn writer_task(
    mut sink: FrameWriter,
    mut out_rx: mpsc::Receiver<Message>,
    shared: Arc<ConnectionShared>,
    keepalive: Duration,
) {
    let mut last_sent = tokio::time::Instant::now();
    loop {
        tokio::select! {
            msg = out_rx.recv() => {
                let Some(msg) = msg else { break };
                tracing::trace!("send: {}", msg);
                if sink.write_frame(&msg.encode()).await.is_err() {
                    break;
                }
                last_sent = tokio::time::Instant::now();
            }
            _ = tokio::time::sleep_until(last_sent + keepalive) => {
                let msg = Message::KeepAlive;
                let _ = shared.gate_outgoing(&msg);
                if sink.write_frame(&msg.encode()).await.is_err() {
                    break;
                }
                last_sent = tokio::time::Instant::now();
            }
        }
    }
}

// The per-session scheduler task: sole owner of the Scheduler and of
// the seat table, and the only writer of the session bitfield.
struct SchedulerTask {
    inner: Arc<Inner>,
    sched: Scheduler,
    seats: HashMap<SocketAddr, PeerSeat>,
    paused: HashSet<SocketAddr>,
}

impl SchedulerTask {
    async fn run(mut self, mut rx: mpsc::Receiver<PeerEvent>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => self.on_tick(),
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if self.on_event(event).await.is_break() {
                        break;
                    }
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let report = self.sched.tick(Instant::now());
        for addr in report.disconnects {
            tracing::warn!(peer = %addr, "disconnecting unreliable peer");
            self.drop_seat(addr, Some(PeerError::DisconnectPeer));
        }
        for addr in self.paused.clone() {
            let Some(seat) = self.seats.get(&addr) else {
                self.paused.remove(&addr);
                continue;
            };
            if seat.out_tx.capacity() > 0 {
                self.paused.remove(&addr);
                self.sched.resume_peer(addr);
                self.pump(addr);
            }
        }
    }

    async fn on_event(&mut self, event: PeerEvent) -> ControlFlow<()> {
        match event {
            PeerEvent::Joined { addr, seat } => {
                self.sched.add_peer(addr);
                self.seats.insert(addr, seat);
            }
            PeerEvent::Bitfield { addr, bitfield } => {
                let interested = self.sched.peer_bitfield(addr, bitfield);
                self.sync_interest(addr, interested);
                self.pump(addr);
            }
            PeerEvent::Have { addr, piece } => {
                let interested = self.sched.peer_have(addr, piece);
                self.sync_interest(addr, interested);
                self.pump(addr);
            }
            PeerEvent::Choke { addr } => self.sched.peer_choked(addr),
            PeerEvent::Unchoke { addr } => {
                self.sched.peer_unchoked(addr);
                self.pump(addr);
            }
            PeerEvent::Interested { addr } => {
                // Plain reciprocity for now; the choke policy is not
                // rate-based.
                if let Some(seat) = self.seats.get(&addr) {
                    if seat.shared.flags().am_choking {
                        self.send_to(addr, Message::Unchoke);
                    }
                }
            }
            PeerEvent::NotInterested { addr } => {
                if let Some(seat) = self.seats.get(&addr) {
                    if !seat.shared.flags().am_choking {
                        self.send_to(addr, Message::Choke);
                    }
                }
            }
            PeerEvent::AllowedFast { addr, piece } => {
                self.sched.allowed_fast(addr, piece);
                self.pump(addr);
            }
            PeerEvent::Block { addr, block } => return self.on_block(addr, block).await,
            PeerEvent::Request { addr, request } => self.serve_request(addr, request).await,
            PeerEvent::CancelRequest { addr, request } => {
                // Blocks are served inline, so there is never a queued
                // read to abort.
                tracing::trace!(peer = %addr, "cancel for {}+{}", request.piece, request.offset);
            }
            PeerEvent::Left { addr, error } => self.drop_seat(addr, error),
            PeerEvent::Stop => {
                self.graceful_stop();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_block(&mut self, addr: SocketAddr, block: Block) -> ControlFlow<()> {
        match self.sched.block_received(addr, block) {
            BlockOutcome::Ignored => {}
            BlockOutcome::Duplicate => {
                tracing::debug!(peer = %addr, "duplicate block discarded");
            }
            BlockOutcome::Accepted { cancels } => self.dispatch(cancels),
            BlockOutcome::Verified {
                piece,
                data,
                cancels,
            } => {
                self.dispatch(cancels);
                if let Err(e) = self.inner.storage.write_piece(piece, data).await {
                    // A storage that cannot take verified pieces ends
                    // the session.
                    tracing::error!(piece, "storage write failed: {}", e);
                    self.inner.running.store(false, Ordering::SeqCst);
                    let _ = self.inner.events.send(SessionEvent::Stopped);
                    self.inner.cancel.cancel();
                    return ControlFlow::Break(());
                }
                tracing::info!(piece, "piece verified and committed");
                let _ = self.inner.events.send(SessionEvent::PieceVerified { piece });
                self.broadcast_have(piece);
                self.refresh_interest();
                if self.inner.ours.read().is_complete() {
                    tracing::info!(swarm = %self.inner.info_hash, "download complete");
                    let _ = self.inner.events.send(SessionEvent::Completed);
                    announce(&self.inner, Some(TrackerEvent::Completed)).await;
                }
            }
            BlockOutcome::Rejected {
                piece,
                contributors,
                cancels,
            } => {
                self.dispatch(cancels);
                {
                    let mut reputation = self.inner.reputation.lock();
                    for peer in &contributors {
                        *reputation.entry(*peer).or_insert(0) -= 1;
                    }
                }
                let _ = self.inner.events.send(SessionEvent::PieceRejected { piece });
                for peer in contributors {
                    self.pump(peer);
                }
            }
        }
        self.pump(addr);
        ControlFlow::Continue(())
    }

    // Fill the peer's window, bounded by free queue space. A full
    // queue pauses the peer until the tick notices it drained.
    fn pump(&mut self, addr: SocketAddr) {
        let Some(seat) = self.seats.get(&addr) else {
            return;
        };
        let room = seat.out_tx.capacity();
        if room == 0 {
            self.sched.pause_peer(addr);
            self.paused.insert(addr);
            return;
        }
        let intents = self.sched.next_requests(addr, room);
        self.dispatch(intents);
    }

    fn dispatch(&mut self, intents: Vec<Intent>) {
        for intent in intents {
            match intent {
                Intent::Request { peer, block } => self.send_to(peer, Message::Request(block)),
                Intent::Cancel { peer, block } => self.send_to(peer, Message::Cancel(block)),
            }
        }
    }

    // Never blocks the scheduler on one connection: a queue with no
    // room drops the frame instead.
    fn send_to(&self, addr: SocketAddr, msg: Message) {
        let Some(seat) = self.seats.get(&addr) else {
            return;
        };
        let Ok(permit) = seat.out_tx.try_reserve() else {
            tracing::warn!(peer = %addr, "outgoing queue full, dropping: {}", msg);
            return;
        };
        match seat.shared.gate_outgoing(&msg) {
            Ok(()) => permit.send(msg),
            Err(e) => tracing::warn!(peer = %addr, "suppressed outgoing message: {}", e),
        }
    }

    fn sync_interest(&mut self, addr: SocketAddr, interested: bool) {
        let Some(seat) = self.seats.get(&addr) else {
            return;
        };
        let flags = seat.shared.flags();
        if interested && !flags.am_interested {
            self.send_to(addr, Message::Interested);
        } else if !interested && flags.am_interested {
            self.send_to(addr, Message::NotInterested);
        }
    }

    // Our bitfield grew; peers that only had what we now have stop
    // being interesting.
    fn refresh_interest(&mut self) {
        for addr in self.seats.keys().copied().collect::<Vec<_>>() {
            let interested = self.sched.interested_in(addr);
            self.sync_interest(addr, interested);
        }
    }

    // Announce a committed piece to peers that do not have it.
    fn broadcast_have(&mut self, piece: u32) {
        for addr in self.seats.keys().copied().collect::<Vec<_>>() {
            if self.sched.peer_has(addr, piece) {
                continue;
            }
            self.send_to(addr, Message::Have { piece });
        }
    }

    async fn serve_request(&mut self, addr: SocketAddr, request: BlockRequest) {
        let Some(seat) = self.seats.get(&addr) else {
            return;
        };
        if seat.shared.flags().am_choking {
            tracing::debug!(peer = %addr, "request while choked ignored");
            return;
        }
        if request.length > MAX_REQUEST_LENGTH
            || !self.inner.ours.read().has(request.piece as usize)
        {
            tracing::warn!(peer = %addr, "unserviceable request {}+{}:{}", request.piece, request.offset, request.length);
            return;
        }
        match self.inner.storage.read_piece(request.piece).await {
            Ok(data) => {
                let start = request.offset as usize;
                let end = start + request.length as usize;
                if end > data.len() {
                    tracing::warn!(peer = %addr, "request past piece end");
                    return;
                }
                let block = Block::new(request.piece, request.offset, data.slice(start..end));
                self.inner
                    .uploaded
                    .fetch_add(request.length as u64, Ordering::Relaxed);
                self.send_to(addr, Message::Piece(block));
            }
            Err(e) => tracing::warn!(piece = request.piece, "read for peer failed: {}", e),
        }
    }

    fn drop_seat(&mut self, addr: SocketAddr, error: Option<PeerError>) {
        let Some(seat) = self.seats.remove(&addr) else {
            return;
        };
        seat.cancel.cancel();
        self.paused.remove(&addr);
        self.sched.drop_peer(addr);
        self.inner.peer_count.fetch_sub(1, Ordering::SeqCst);
        let penalty = error.as_ref().map(PeerError::penalty).unwrap_or(0);
        if penalty > 0 {
            *self.inner.reputation.lock().entry(addr).or_insert(0) -= penalty as i64;
        }
        match &error {
            Some(e) => tracing::warn!(peer = %addr, penalty, "peer dropped: {}", e),
            None => tracing::debug!(peer = %addr, "peer left"),
        }
        let _ = self.inner.events.send(SessionEvent::PeerDisconnected {
            addr,
            reason: error.map(|e| e.to_string()),
            penalty,
        });
        // Freed blocks may suit the remaining peers.
        for peer in self.seats.keys().copied().collect::<Vec<_>>() {
            self.pump(peer);
        }
    }

    fn graceful_stop(&mut self) {
        for addr in self.seats.keys().copied().collect::<Vec<_>>() {
            self.send_to(addr, Message::NotInterested);
        }
        for (_, seat) in self.seats.drain() {
            // Readers stop now; writers drain their queues and exit
            // when the dropped senders close them.
            seat.cancel.cancel();
        }
        let _ = self.inner.events.send(SessionEvent::Stopped);
    }
}

#[cfg(test)]
mod tests;
