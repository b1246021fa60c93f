//! Accept loop and server-wide shutdown coordination.
//!
//! # Phases
//!
//! ```text
//! Accepting ──shutdown()──► Draining ──live set empty──► Stopped
//! ```
//!
//! [`ServerHandle::shutdown`] (also reachable through the `/shutdown`
//! command) flips `terminating` once, interrupts the pending accept, closes
//! the registry while taking a snapshot of the live sessions, and requests
//! termination of each of them after the lock is released. [`Server::run`]
//! then waits for the reaper to report that every session was reclaimed.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig,
    error::ServerError,
    reaper::{ReclaimQueue, ReclaimSender, Reaper},
    registry::Registry,
    session::{Session, SessionId},
};

/// Pause after a failed `accept()` so a persistent error (e.g. descriptor
/// exhaustion) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle phase of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerPhase {
    /// Accepting new connections.
    Accepting = 0,
    /// Shutdown requested; waiting for sessions to be reclaimed.
    Draining = 1,
    /// Every session reclaimed, reaper stopped.
    Stopped = 2,
}

impl ServerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Accepting,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepting => write!(f, "Accepting"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// State shared by the accept loop, every session and the reaper.
pub(crate) struct SharedState {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Registry,
    reclaim: ReclaimSender,
    terminating: AtomicBool,
    phase: AtomicU8,
    /// Cancelled by shutdown to wake the accept loop
    accept_interrupt: CancellationToken,
    /// Cancelled once shutdown has emptied the live set
    drained: CancellationToken,
    next_session_id: AtomicU64,
}

impl SharedState {
    pub(crate) fn new(config: ServerConfig) -> (Arc<Self>, ReclaimQueue) {
        let (reclaim, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            config,
            registry: Registry::new(),
            reclaim,
            terminating: AtomicBool::new(false),
            phase: AtomicU8::new(ServerPhase::Accepting as u8),
            accept_interrupt: CancellationToken::new(),
            drained: CancellationToken::new(),
            next_session_id: AtomicU64::new(1),
        });
        (shared, queue)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> (Arc<Self>, ReclaimQueue) {
        Self::new(ServerConfig { max_line_length: 256, ..ServerConfig::local() })
    }

    pub(crate) fn new_session(self: &Arc<Self>, peer: Option<SocketAddr>) -> Arc<Session> {
        let id: SessionId = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Session::new(id, peer, Arc::clone(self)))
    }

    /// Hand a quiesced session to the reaper.
    pub(crate) fn enqueue_reclaim(&self, session: Arc<Session>) {
        let id = session.id();
        if self.reclaim.send(session).is_err() {
            // Only possible once the reaper is gone, i.e. after a fatal error
            tracing::error!(session = id, "reaper not running, session not reclaimed");
        }
    }

    pub(crate) fn drained_token(&self) -> CancellationToken {
        self.drained.clone()
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    fn phase(&self) -> ServerPhase {
        ServerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: ServerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Begin server-wide shutdown. Only the first call has any effect.
    pub(crate) fn shutdown(&self) {
        if self.terminating.swap(true, Ordering::AcqRel) {
            tracing::debug!("shutdown already in progress");
            return;
        }
        self.set_phase(ServerPhase::Draining);
        // Before anything can drain: the accept loop must observe the
        // interrupt no later than the reaper's exit.
        self.accept_interrupt.cancel();

        // Snapshot under the registry lock, terminate outside it
        let sessions = self.registry.close();
        tracing::info!(sessions = sessions.len(), "shutting down");
        for session in &sessions {
            session.request_termination();
        }
        if sessions.is_empty() {
            self.drained.cancel();
        }
    }
}

/// Cheap handle for observing and stopping a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<SharedState>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Stop accepting, terminate every session, and let the server drain.
    ///
    /// Idempotent. Returns immediately; [`Server::run`] returns once the
    /// drain has completed.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Current phase.
    pub fn phase(&self) -> ServerPhase {
        self.shared.phase()
    }

    /// True once shutdown has been requested.
    pub fn is_terminating(&self) -> bool {
        self.shared.is_terminating()
    }

    /// Number of sessions not yet reclaimed.
    pub fn live_sessions(&self) -> usize {
        self.shared.registry.live_count()
    }

    /// Number of sessions that completed name registration.
    pub fn named_sessions(&self) -> usize {
        self.shared.registry.name_count()
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait until shutdown has emptied the live set.
    pub async fn drained(&self) {
        self.shared.drained.cancelled().await;
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Line-oriented chat server.
///
/// Owns the listening socket, the registry and the reaper.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<SharedState>,
    reaper: JoinHandle<()>,
}

impl Server {
    /// Bind the listening socket and start the reaper.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        if config.max_line_length == 0 {
            return Err(ServerError::Config("max line length must be positive".to_string()));
        }

        let addr = config.bind_address;
        let listener =
            TcpListener::bind(addr).await.map_err(|source| ServerError::Bind { addr, source })?;

        let local_addr = listener.local_addr()?;

        let (shared, queue) = SharedState::new(config);
        let reaper = Reaper::spawn(Arc::clone(&shared), queue);

        tracing::info!("listening on {local_addr}");

        Ok(Self { listener, local_addr, shared, reaper })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for shutting the server down from elsewhere.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle { shared: Arc::clone(&self.shared), local_addr: self.local_addr }
    }

    /// Accept clients until shutdown, then wait for every session to be
    /// reclaimed.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self { listener, shared, mut reaper, .. } = self;

        loop {
            tokio::select! {
                biased;

                () = shared.accept_interrupt.cancelled() => break,
                joined = &mut reaper => return Err(reaper_died(joined)),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => admit(&shared, stream, peer),
                    Err(err) => {
                        tracing::warn!("accept failed: {err}");
                        back_off(&shared.accept_interrupt, ACCEPT_BACKOFF).await;
                    },
                },
            }
        }

        // Refuse further connections at the socket level
        drop(listener);
        tracing::info!(live = shared.registry.live_count(), "accept loop stopped, draining");

        tokio::select! {
            biased;

            () = shared.drained.cancelled() => {},
            joined = &mut reaper => return Err(reaper_died(joined)),
        }
        if let Err(err) = reaper.await {
            return Err(ServerError::Internal(format!("reaper failed: {err}")));
        }

        shared.set_phase(ServerPhase::Stopped);
        tracing::info!("server stopped");
        Ok(())
    }
}

fn admit(shared: &Arc<SharedState>, stream: TcpStream, peer: SocketAddr) {
    let session = shared.new_session(Some(peer));
    if !shared.registry.admit(Arc::clone(&session)) {
        // Shutdown won the race; dropping the stream closes it
        tracing::debug!(%peer, "connection refused during shutdown");
        return;
    }

    tracing::info!(session = session.id(), %peer, "client connected");
    let (input, output) = stream.into_split();
    session.start(input, output);
}

/// Sleep for `delay`, cut short by `interrupt`.
async fn back_off(interrupt: &CancellationToken, delay: Duration) {
    tokio::select! {
        () = interrupt.cancelled() => {},
        () = tokio::time::sleep(delay) => {},
    }
}

fn reaper_died(joined: Result<(), JoinError>) -> ServerError {
    let reason = match joined {
        Ok(()) => "reaper exited before the server drained".to_string(),
        Err(err) => format!("reaper failed: {err}"),
    };
    tracing::error!("{reason}");
    ServerError::Internal(reason)
}
