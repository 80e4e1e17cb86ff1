use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::*;
use crate::constants::BLOCK_SIZE;
use crate::manager::{Manager, ManagerOptions};
use crate::storage::MemoryStorage;
use crate::tracker::{
    AnnounceResponse, ScrapeResponse, Tracker, TrackerError, TrackerEvent,
};
use crate::peer::Capabilities;

const HS_LIMIT: Duration = Duration::from_secs(5);

fn swarm() -> InfoHash {
    InfoHash::from_bytes([0x21; 20])
}

fn piece_bytes(seed: u8, len: usize) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| seed.wrapping_add(i as u8))
            .collect::<Vec<u8>>(),
    )
}

fn make_session(
    pieces: &[Bytes],
    piece_len: u32,
    options: SessionOptions,
) -> (Session, Arc<MemoryStorage>) {
    let hashes: Vec<[u8; 20]> = pieces.iter().map(|p| Sha1::digest(p).into()).collect();
    let total: u64 = pieces.iter().map(|p| p.len() as u64).sum();
    let storage = Arc::new(MemoryStorage::new(hashes.clone(), piece_len as usize, total));
    let mut params = SessionParams::new(swarm(), hashes, piece_len, total, storage.clone());
    params.options = options;
    (Session::new(params), storage)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting until {}", what));
}

// A scripted remote peer speaking the raw wire protocol.
#[derive(Default, Clone)]
struct PeerScript {
    serve: bool,
    unchoke: bool,
    unchoke_delay: Duration,
    corrupt: Option<BlockRequest>,
    second_bitfield: bool,
    flood_haves: usize,
}

impl PeerScript {
    fn serving() -> Self {
        Self {
            serve: true,
            unchoke: true,
            ..Self::default()
        }
    }
}

struct ScriptedPeer {
    addr: SocketAddr,
    received: Arc<StdMutex<Vec<Message>>>,
}

impl ScriptedPeer {
    fn saw(&self, msg: &Message) -> bool {
        self.received.lock().unwrap().contains(msg)
    }

    fn requests(&self) -> Vec<BlockRequest> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                Message::Request(req) => Some(*req),
                _ => None,
            })
            .collect()
    }

    fn haves(&self) -> Vec<u32> {
        let mut haves: Vec<u32> = self
            .received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                Message::Have { piece } => Some(*piece),
                _ => None,
            })
            .collect();
        haves.sort_unstable();
        haves
    }
}

// Listens for one connection from the session under test.
async fn spawn_peer(
    info_hash: InfoHash,
    pieces: Vec<Option<Bytes>>,
    script: PeerScript,
) -> ScriptedPeer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(StdMutex::new(Vec::new()));
    let log = received.clone();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut transport = Transport::new(stream);
        if transport.read_handshake(HS_LIMIT).await.is_err() {
            return;
        }
        let mut hs = Handshake::new(info_hash, PeerId::generate());
        hs.caps = Capabilities::none();
        if transport.send_handshake(&hs, HS_LIMIT).await.is_err() {
            return;
        }
        run_wire(transport, pieces, script, log).await;
    });
    ScriptedPeer { addr, received }
}

// Dials a listener (the manager) instead of accepting. The handle
// resolves to whether the handshake was answered.
async fn dial_peer(
    target: SocketAddr,
    info_hash: InfoHash,
    pieces: Vec<Option<Bytes>>,
    script: PeerScript,
) -> (Arc<StdMutex<Vec<Message>>>, JoinHandle<bool>) {
    let received = Arc::new(StdMutex::new(Vec::new()));
    let log = received.clone();
    let handle = tokio::spawn(async move {
        let Ok(stream) = TcpStream::connect(target).await else {
            return false;
        };
        let mut transport = Transport::new(stream);
        let mut hs = Handshake::new(info_hash, PeerId::generate());
        hs.caps = Capabilities::none();
        if transport.send_handshake(&hs, HS_LIMIT).await.is_err() {
            return false;
        }
        if transport.read_handshake(HS_LIMIT).await.is_err() {
            return false;
        }
        run_wire(transport, pieces, script, log).await;
        true
    });
    (received, handle)
}

async fn run_wire(
    transport: Transport,
    pieces: Vec<Option<Bytes>>,
    script: PeerScript,
    log: Arc<StdMutex<Vec<Message>>>,
) {
    let (mut reader, mut writer) = transport.split();
    let mut bitfield = Bitfield::new(pieces.len());
    for (i, piece) in pieces.iter().enumerate() {
        if piece.is_some() {
            bitfield.set(i);
        }
    }
    let bits = Message::Bitfield(bitfield.to_bytes()).encode();
    if writer.write_frame(&bits).await.is_err() {
        return;
    }
    if script.second_bitfield {
        let _ = writer.write_frame(&bits).await;
    }
    for _ in 0..script.flood_haves {
        if writer
            .write_frame(&Message::Have { piece: 0 }.encode())
            .await
            .is_err()
        {
            return;
        }
    }
    if script.unchoke {
        tokio::time::sleep(script.unchoke_delay).await;
        if writer
            .write_frame(&Message::Unchoke.encode())
            .await
            .is_err()
        {
            return;
        }
    }
    loop {
        let frame = match reader.read_frame(Duration::from_secs(30)).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let Ok(msg) = Message::decode(frame) else {
            return;
        };
        log.lock().unwrap().push(msg.clone());
        let Message::Request(req) = msg else {
            continue;
        };
        if !script.serve {
            continue;
        }
        let Some(data) = pieces.get(req.piece as usize).and_then(|p| p.clone()) else {
            continue;
        };
        let mut chunk = data.slice(req.offset as usize..(req.offset + req.length) as usize);
        if script.corrupt == Some(req) {
            chunk = Bytes::from(vec![0xEE; req.length as usize]);
        }
        let piece = Message::Piece(Block::new(req.piece, req.offset, chunk));
        if writer.write_frame(&piece.encode()).await.is_err() {
            return;
        }
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn two_peer_complete_download() {
    let piece_len = 2 * BLOCK_SIZE;
    let data: Vec<Bytes> = (0..4)
        .map(|i| piece_bytes(i as u8 * 3 + 1, piece_len as usize))
        .collect();
    let (session, storage) = make_session(&data, piece_len, SessionOptions::default());
    session.start().await.unwrap();
    let mut events = session.events();

    let hold = |set: &[usize]| -> Vec<Option<Bytes>> {
        (0..4)
            .map(|i| set.contains(&i).then(|| data[i].clone()))
            .collect()
    };
    // delay the unchokes so both peers are connected before any
    // request flows; the piece split is then fully determined
    let script = PeerScript {
        unchoke_delay: Duration::from_millis(500),
        ..PeerScript::serving()
    };
    let peer_a = spawn_peer(swarm(), hold(&[0, 2]), script.clone()).await;
    let peer_b = spawn_peer(swarm(), hold(&[1, 2, 3]), script).await;
    session.connect(peer_a.addr).await.unwrap();
    session.connect(peer_b.addr).await.unwrap();

    wait_for(&mut events, |ev| matches!(ev, SessionEvent::Completed)).await;
    assert!(session.bitfield().is_complete());
    for i in 0..4u32 {
        assert!(storage.verify_piece(i).await.unwrap());
        assert_eq!(storage.read_piece(i).await.unwrap(), data[i as usize]);
    }
    assert_eq!(
        session.progress(),
        SessionProgress {
            downloaded: 4 * piece_len as u64,
            uploaded: 0,
            left: 0
        }
    );

    // let the trailing have frames flush
    tokio::time::sleep(Duration::from_millis(300)).await;

    // requests only ever name advertised pieces, and every block of
    // the dataset was fetched from somebody
    let a_reqs = peer_a.requests();
    let b_reqs = peer_b.requests();
    assert!(a_reqs.iter().all(|r| [0, 2].contains(&(r.piece as usize))));
    assert!(b_reqs
        .iter()
        .all(|r| [1, 2, 3].contains(&(r.piece as usize))));
    let mut fetched: Vec<(u32, u32)> = a_reqs
        .iter()
        .chain(b_reqs.iter())
        .map(|r| (r.piece, r.offset))
        .collect();
    fetched.sort_unstable();
    fetched.dedup();
    let expected: Vec<(u32, u32)> = (0..4u32)
        .flat_map(|p| [(p, 0), (p, BLOCK_SIZE)])
        .collect();
    assert_eq!(fetched, expected);

    // have frames go exactly once to each peer that lacks the piece
    assert_eq!(peer_a.haves(), vec![1, 3]);
    assert_eq!(peer_b.haves(), vec![0]);

    session.stop().await;
}

#[tokio::test]
async fn hash_mismatch_resets_piece_and_penalizes_contributor() {
    let piece_len = 2 * BLOCK_SIZE;
    let data = vec![piece_bytes(5, piece_len as usize)];
    let (session, _storage) = make_session(&data, piece_len, SessionOptions::default());
    session.start().await.unwrap();
    let mut events = session.events();

    let script = PeerScript {
        corrupt: Some(BlockRequest::new(0, BLOCK_SIZE, BLOCK_SIZE)),
        ..PeerScript::serving()
    };
    let peer = spawn_peer(swarm(), vec![Some(data[0].clone())], script).await;
    session.connect(peer.addr).await.unwrap();

    wait_for(&mut events, |ev| {
        matches!(ev, SessionEvent::PieceRejected { piece: 0 })
    })
    .await;
    assert!(!session.bitfield().has(0));
    assert_eq!(session.progress().downloaded, 0);
    assert!(session.reputation(peer.addr) <= -1);
    session.stop().await;
}

#[tokio::test]
async fn endgame_duplicates_last_block_and_cancels_loser() {
    let piece_len = BLOCK_SIZE;
    let data = vec![piece_bytes(9, piece_len as usize)];
    let (session, _storage) = make_session(&data, piece_len, SessionOptions::default());
    session.start().await.unwrap();
    let mut events = session.events();

    // the recorder takes the request first and sits on it
    let recorder = spawn_peer(
        swarm(),
        vec![Some(data[0].clone())],
        PeerScript {
            unchoke: true,
            ..PeerScript::default()
        },
    )
    .await;
    let server = spawn_peer(
        swarm(),
        vec![Some(data[0].clone())],
        PeerScript {
            unchoke_delay: Duration::from_millis(400),
            ..PeerScript::serving()
        },
    )
    .await;
    session.connect(recorder.addr).await.unwrap();
    session.connect(server.addr).await.unwrap();

    wait_for(&mut events, |ev| matches!(ev, SessionEvent::Completed)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // the slow peer got the request and then a matching cancel
    let block = BlockRequest::new(0, 0, BLOCK_SIZE);
    assert!(recorder.saw(&Message::Request(block)));
    assert!(recorder.saw(&Message::Cancel(block)));
    session.stop().await;
}

#[tokio::test]
async fn second_bitfield_drops_the_peer() {
    let data = vec![piece_bytes(2, BLOCK_SIZE as usize)];
    let (session, _storage) = make_session(&data, BLOCK_SIZE, SessionOptions::default());
    session.start().await.unwrap();
    let mut events = session.events();

    let script = PeerScript {
        second_bitfield: true,
        unchoke: true,
        ..PeerScript::default()
    };
    let peer = spawn_peer(swarm(), vec![Some(data[0].clone())], script).await;
    session.connect(peer.addr).await.unwrap();

    let event = wait_for(&mut events, |ev| {
        matches!(ev, SessionEvent::PeerDisconnected { .. })
    })
    .await;
    let SessionEvent::PeerDisconnected { reason, penalty, .. } = event else {
        unreachable!()
    };
    assert_eq!(penalty, 1);
    assert!(reason.unwrap().contains("second bitfield"));
    assert_eq!(session.peer_count(), 0);
    session.stop().await;
}

#[tokio::test]
async fn control_flood_drops_the_peer() {
    let data = vec![piece_bytes(4, BLOCK_SIZE as usize)];
    let mut options = SessionOptions::default();
    options.connection.flood.threshold = 2048;
    let (session, _storage) = make_session(&data, BLOCK_SIZE, options);
    session.start().await.unwrap();
    let mut events = session.events();

    let script = PeerScript {
        flood_haves: 400,
        ..PeerScript::default()
    };
    let peer = spawn_peer(swarm(), vec![None], script).await;
    session.connect(peer.addr).await.unwrap();

    let event = wait_for(&mut events, |ev| {
        matches!(ev, SessionEvent::PeerDisconnected { .. })
    })
    .await;
    let SessionEvent::PeerDisconnected { reason, penalty, .. } = event else {
        unreachable!()
    };
    assert_eq!(penalty, 1);
    assert!(reason.unwrap().contains("flooding"));
    session.stop().await;
}

#[tokio::test]
async fn silent_peer_times_out_without_penalty() {
    let data = vec![piece_bytes(6, BLOCK_SIZE as usize)];
    let mut options = SessionOptions::default();
    options.connection.keepalive_timeout = Duration::from_millis(400);
    let (session, _storage) = make_session(&data, BLOCK_SIZE, options);
    session.start().await.unwrap();
    let mut events = session.events();

    // bitfield and unchoke, then silence
    let script = PeerScript {
        unchoke: true,
        ..PeerScript::default()
    };
    let peer = spawn_peer(swarm(), vec![Some(data[0].clone())], script).await;
    session.connect(peer.addr).await.unwrap();

    let event = wait_for(&mut events, |ev| {
        matches!(ev, SessionEvent::PeerDisconnected { .. })
    })
    .await;
    let SessionEvent::PeerDisconnected { penalty, .. } = event else {
        unreachable!()
    };
    assert_eq!(penalty, 0);
    session.stop().await;
}

#[tokio::test]
async fn stop_sends_not_interested_before_closing() {
    let data = vec![piece_bytes(8, BLOCK_SIZE as usize)];
    let (session, _storage) = make_session(&data, BLOCK_SIZE, SessionOptions::default());
    session.start().await.unwrap();
    let mut events = session.events();

    let peer = spawn_peer(swarm(), vec![Some(data[0].clone())], PeerScript::default()).await;
    session.connect(peer.addr).await.unwrap();
    wait_until("the session declares interest", || {
        peer.saw(&Message::Interested)
    })
    .await;

    session.stop().await;
    wait_for(&mut events, |ev| matches!(ev, SessionEvent::Stopped)).await;
    wait_until("the peer hears not-interested", || {
        peer.saw(&Message::NotInterested)
    })
    .await;
}

#[tokio::test]
async fn start_recovers_bitfield_from_storage() {
    let piece_len = 2 * BLOCK_SIZE;
    let data = vec![
        piece_bytes(1, piece_len as usize),
        piece_bytes(2, piece_len as usize),
    ];
    let total = 2 * piece_len as u64;
    let storage = Arc::new(MemoryStorage::seeded(
        data.clone(),
        piece_len as usize,
        total,
    ));
    let hashes = data.iter().map(|p| Sha1::digest(p).into()).collect();
    let session = Session::new(SessionParams::new(
        swarm(),
        hashes,
        piece_len,
        total,
        storage,
    ));
    session.start().await.unwrap();
    assert!(session.bitfield().is_complete());
    assert_eq!(session.progress().left, 0);
    session.stop().await;
}

// ============================================================================
// Manager
// ============================================================================

#[tokio::test]
async fn manager_dispatches_inbound_by_info_hash() {
    let data = vec![piece_bytes(3, BLOCK_SIZE as usize)];
    let (session, storage) = make_session(&data, BLOCK_SIZE, SessionOptions::default());
    session.start().await.unwrap();
    let mut events = session.events();

    let manager = Manager::bind(ManagerOptions {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..ManagerOptions::default()
    })
    .await
    .unwrap();
    manager.register(session.clone());
    let target = manager.local_addr();
    let runner = manager.clone();
    tokio::spawn(async move { runner.run().await });

    // a stranger's swarm is turned away before our handshake goes out
    let (_, stranger) = dial_peer(
        target,
        InfoHash::from_bytes([0x77; 20]),
        vec![],
        PeerScript::default(),
    )
    .await;
    assert!(!stranger.await.unwrap());

    // the right swarm is adopted and drained to completion
    let (_log, _peer) = dial_peer(
        target,
        swarm(),
        vec![Some(data[0].clone())],
        PeerScript::serving(),
    )
    .await;
    wait_for(&mut events, |ev| matches!(ev, SessionEvent::Completed)).await;
    assert!(storage.verify_piece(0).await.unwrap());
    assert_eq!(manager.connection_count(), 1);

    manager.stop();
    session.stop().await;
}

// ============================================================================
// Tracker reporting
// ============================================================================

struct RecordingTracker {
    calls: StdMutex<Vec<(Option<TrackerEvent>, u64, u32)>>,
    peers: Vec<SocketAddr>,
}

#[async_trait]
impl Tracker for RecordingTracker {
    async fn announce(&self, params: AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
        self.calls
            .lock()
            .unwrap()
            .push((params.event, params.left, params.numwant));
        Ok(AnnounceResponse {
            peers: self.peers.clone(),
            interval: Duration::from_secs(1800),
        })
    }

    async fn scrape(&self, _info_hash: InfoHash) -> Result<ScrapeResponse, TrackerError> {
        Ok(ScrapeResponse::default())
    }
}

#[tokio::test]
async fn tracker_hears_started_completed_stopped() {
    let data = vec![piece_bytes(7, BLOCK_SIZE as usize)];
    let peer = spawn_peer(swarm(), vec![Some(data[0].clone())], PeerScript::serving()).await;

    let hashes: Vec<[u8; 20]> = data.iter().map(|p| Sha1::digest(p).into()).collect();
    let total = BLOCK_SIZE as u64;
    let storage = Arc::new(MemoryStorage::new(hashes.clone(), BLOCK_SIZE as usize, total));
    let tracker = Arc::new(RecordingTracker {
        calls: StdMutex::new(Vec::new()),
        peers: vec![peer.addr],
    });
    let mut params = SessionParams::new(swarm(), hashes, BLOCK_SIZE, total, storage);
    params.tracker = Some(tracker.clone());
    let session = Session::new(params);

    let mut events = session.events();
    session.start().await.unwrap();
    let SessionEvent::PeersDiscovered(found) = wait_for(&mut events, |ev| {
        matches!(ev, SessionEvent::PeersDiscovered(_))
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(found, vec![peer.addr]);

    session.connect(peer.addr).await.unwrap();
    wait_for(&mut events, |ev| matches!(ev, SessionEvent::Completed)).await;
    session.stop().await;

    let calls = tracker.calls.lock().unwrap().clone();
    let sequence: Vec<Option<TrackerEvent>> = calls.iter().map(|c| c.0).collect();
    assert_eq!(
        sequence,
        vec![
            Some(TrackerEvent::Started),
            Some(TrackerEvent::Completed),
            Some(TrackerEvent::Stopped)
        ]
    );
    // started with everything left, completed with nothing
    assert_eq!(calls[0].1, total);
    assert_eq!(calls[1].1, 0);
    assert!(calls.iter().all(|c| c.2 == 50));
}
