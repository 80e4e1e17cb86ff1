//! The connection manager: one listener, many swarms.
//!
//! Inbound sockets are handed to a bounded pool of handshake workers;
//! each reads the handshake, resolves the session by info-hash, and
//! either adopts the peer or drops it as an unknown swarm. Outbound
//! connects run through [`Manager::connect_swarm`], which honors the
//! per-session peer limit (enforced by the session) and the global
//! connection cap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::constants::{HANDSHAKE_TIMEOUT, MAX_ACCEPT_WORKERS, MAX_GLOBAL_CONNECTIONS};
use crate::info_hash::InfoHash;
use crate::peer::{PeerError, Transport};
use crate::session::Session;

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub listen_addr: SocketAddr,
    /// Concurrent inbound handshake workers.
    pub accept_workers: usize,
    /// Connections across every registered session.
    pub max_connections: usize,
    pub handshake_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6881".parse().expect("literal address"),
            accept_workers: MAX_ACCEPT_WORKERS,
            max_connections: MAX_GLOBAL_CONNECTIONS,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

struct ManagerInner {
    sessions: DashMap<InfoHash, Session>,
    options: ManagerOptions,
    cancel: CancellationToken,
    workers: Arc<Semaphore>,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl ManagerInner {
    fn connection_count(&self) -> usize {
        self.sessions.iter().map(|s| s.peer_count()).sum()
    }

    async fn handle_inbound(&self, stream: TcpStream, addr: SocketAddr) {
        if self.connection_count() >= self.options.max_connections {
            tracing::warn!(peer = %addr, "connection cap reached, dropping inbound");
            return;
        }
        let mut transport = Transport::new(stream);
        let handshake = match transport.read_handshake(self.options.handshake_timeout).await {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::debug!(peer = %addr, "inbound handshake failed: {}", e);
                return;
            }
        };
        let session = match self.sessions.get(&handshake.info_hash) {
            Some(session) => session.clone(),
            None => {
                let err = PeerError::UnknownTopic(handshake.info_hash);
                tracing::warn!(peer = %addr, penalty = err.penalty(), "{}", err);
                return;
            }
        };
        if let Err(e) = session.accept(transport, handshake).await {
            tracing::warn!(peer = %addr, "inbound adoption failed: {}", e);
        }
    }
}

/// Listener plus connector pool, dispatching peers to sessions by
/// info-hash.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Binds the listener; `run` must be called to start accepting.
    pub async fn bind(options: ManagerOptions) -> std::io::Result<Self> {
        let listener = TcpListener::bind(options.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening");
        let workers = Arc::new(Semaphore::new(options.accept_workers));
        Ok(Self {
            inner: Arc::new(ManagerInner {
                sessions: DashMap::new(),
                options,
                cancel: CancellationToken::new(),
                workers,
                listener: parking_lot::Mutex::new(Some(listener)),
                local_addr,
            }),
        })
    }

    /// The bound listen address; useful with an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn register(&self, session: Session) {
        self.inner.sessions.insert(session.info_hash(), session);
    }

    pub fn deregister(&self, info_hash: &InfoHash) -> Option<Session> {
        self.inner.sessions.remove(info_hash).map(|(_, s)| s)
    }

    pub fn session(&self, info_hash: &InfoHash) -> Option<Session> {
        self.inner.sessions.get(info_hash).map(|s| s.clone())
    }

    /// Connections across every registered session.
    pub fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }

    /// Accept loop; runs until [`Manager::stop`].
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or_else(|| std::io::Error::other("manager already running"))?;
        loop {
            let permit = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                permit = self.inner.workers.clone().acquire_owned() => {
                    permit.expect("semaphore is never closed")
                }
            };
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        inner.handle_inbound(stream, addr).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Dials addresses for one swarm until its session or the global
    /// cap pushes back. Returns how many peers connected.
    pub async fn connect_swarm(&self, info_hash: InfoHash, addrs: &[SocketAddr]) -> usize {
        let Some(session) = self.session(&info_hash) else {
            return 0;
        };
        let mut connected = 0;
        for addr in addrs {
            if self.connection_count() >= self.inner.options.max_connections {
                tracing::debug!("connection cap reached, not dialing further");
                break;
            }
            match session.connect(*addr).await {
                Ok(_) => connected += 1,
                Err(e) => tracing::debug!(peer = %addr, "outbound connect failed: {}", e),
            }
        }
        connected
    }
}
