//! Client session: one connection, a reader unit and a writer unit.
//!
//! # Lifecycle
//!
//! [`Session::start`] spawns both units. Each runs until it independently
//! finishes:
//!
//! - Reader: asks for a name, then reads lines until EOF, a read error, an
//!   interrupt, `/quit` or `/shutdown`. Every cause leaves through the same
//!   exit path.
//! - Writer: drains the outbound queue until termination is requested or
//!   the reader is done, then writes what is left and half-closes the
//!   connection. A write error or timeout also ends it.
//!
//! On exit each unit runs the handshake in [`crate::state`]. The second
//! finisher hands the session to the reaper. The first finisher unblocks its
//! partner: the reader wakes the writer's queue wait, the writer interrupts
//! the reader's pending read.
//!
//! Only the writer unit writes to the connection. Prompts and replies from
//! the reader go through the session's own outbox, behind any broadcasts
//! already queued.

use std::{
    any::Any,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use bytes::Bytes;
use chrono::Local;
use futures::{FutureExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};
use tokio_util::{
    codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead},
    sync::CancellationToken,
};

use crate::{
    error::{RegistryError, SessionError},
    outbox::Outbox,
    protocol::{self, Command},
    server::SharedState,
    state::{Handoff, SessionState, StateFlags, Unit},
};

/// Server-assigned session identifier, unique for the server's lifetime.
pub type SessionId = u64;

/// Logged for sessions that never completed registration.
const UNNAMED: &str = "(unknown)";

/// Why the reader unit left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderExit {
    Eof,
    Interrupted,
    Quit,
    Shutdown,
}

/// Outcome of one cancellable line read.
enum Line {
    Text(String),
    Eof,
    Interrupted,
}

#[derive(Default)]
struct Units {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    started: bool,
}

/// Server-side state for one client connection.
///
/// Shared by the registry, the reclamation queue and its own two units.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    name: OnceLock<String>,
    state: SessionState,
    outbox: Outbox,
    /// Cancels the reader's pending line read
    interrupt: CancellationToken,
    units: Mutex<Units>,
    shared: Arc<SharedState>,
}

impl Session {
    pub(crate) fn new(id: SessionId, peer: Option<SocketAddr>, shared: Arc<SharedState>) -> Self {
        Self {
            id,
            peer,
            name: OnceLock::new(),
            state: SessionState::new(),
            outbox: Outbox::new(),
            interrupt: CancellationToken::new(),
            units: Mutex::new(Units::default()),
            shared,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Registered name. `None` until registration succeeds.
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub(crate) fn display_name(&self) -> &str {
        self.name().unwrap_or(UNNAMED)
    }

    /// Set the name. Only the registry calls this, under its lock.
    ///
    /// # Panics
    ///
    /// If the name was already set.
    pub(crate) fn set_name(&self, name: &str) {
        let fresh = self.name.set(name.to_string()).is_ok();
        assert!(fresh, "invariant: session {} named twice", self.id);
    }

    /// Current state flags.
    pub fn state(&self) -> StateFlags {
        self.state.load()
    }

    /// Number of messages waiting for the writer unit.
    pub fn pending_messages(&self) -> usize {
        self.outbox.len()
    }

    fn lock_units(&self) -> MutexGuard<'_, Units> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the reader and writer units over the connection halves.
    ///
    /// # Panics
    ///
    /// If the session was already started or already has a name.
    pub fn start<R, W>(self: &Arc<Self>, input: R, output: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // Held across both spawns so the reaper, which takes the handles
        // under this lock, never sees a half-started session.
        let mut units = self.lock_units();
        assert!(!units.started, "invariant: session {} started twice", self.id);
        assert!(self.name().is_none(), "invariant: session {} named before start", self.id);
        units.started = true;
        units.reader = Some(tokio::spawn(Arc::clone(self).reader_unit(input)));
        units.writer = Some(tokio::spawn(Arc::clone(self).writer_unit(output)));
    }

    /// Take both unit handles for joining. `None` if already taken or never
    /// started.
    pub(crate) fn take_units(&self) -> Option<(JoinHandle<()>, JoinHandle<()>)> {
        let mut units = self.lock_units();
        units.reader.take().zip(units.writer.take())
    }

    /// Queue a message for this client and wake its writer.
    ///
    /// Safe to call from any task; never waits on this session's I/O.
    /// Returns `false` if the writer has stopped accepting messages.
    pub fn send_message(&self, message: Bytes) -> bool {
        self.outbox.push(message)
    }

    /// Ask both units to stop.
    ///
    /// Wakes the writer so it notices even with an empty queue, and
    /// interrupts the reader's pending read. No-op once the session has
    /// quiesced.
    pub fn request_termination(&self) {
        if self.state.load().is_quiesced() {
            return;
        }
        self.state.set(StateFlags::TERMINATION_REQUESTED);
        self.outbox.wake();
        self.interrupt_reader();
    }

    fn interrupt_reader(&self) {
        self.state.set(StateFlags::READER_INTERRUPT_REQUESTED);
        self.interrupt.cancel();
    }

    async fn reader_unit<R>(self: Arc<Self>, input: R)
    where
        R: AsyncRead + Unpin,
    {
        match AssertUnwindSafe(self.read_loop(input)).catch_unwind().await {
            Ok(Ok(exit)) => {
                tracing::debug!(
                    session = self.id,
                    name = self.display_name(),
                    peer = ?self.peer,
                    ?exit,
                    "reader finished"
                );
            },
            Ok(Err(err)) => self.log_unit_error(Unit::Reader, &err),
            Err(panic) => self.log_unit_panic(Unit::Reader, panic.as_ref()),
        }
        self.on_reader_exit();
    }

    async fn read_loop<R>(self: &Arc<Self>, input: R) -> Result<ReaderExit, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let codec = AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            b"\n".to_vec(),
            self.shared.config.max_line_length,
        );
        let mut lines = FramedRead::new(input, codec);

        let name = loop {
            self.send_message(Bytes::from_static(protocol::NAME_PROMPT.as_bytes()));
            let name = match self.next_line(&mut lines).await? {
                Line::Text(name) => name,
                Line::Eof => return Ok(ReaderExit::Eof),
                Line::Interrupted => return Ok(ReaderExit::Interrupted),
            };

            match self.shared.registry.register(&name, self) {
                Ok(()) => {
                    self.send_message(protocol::welcome(&name));
                    break name;
                },
                Err(RegistryError::NameTaken(_)) => {
                    self.send_message(protocol::name_taken(&name));
                },
                Err(RegistryError::EmptyName) => {
                    self.send_message(protocol::name_empty());
                },
            }
        };
        tracing::info!(session = self.id, name = %name, "client registered");

        loop {
            let line = match self.next_line(&mut lines).await? {
                Line::Text(line) => line,
                Line::Eof => return Ok(ReaderExit::Eof),
                Line::Interrupted => return Ok(ReaderExit::Interrupted),
            };

            match Command::parse(&line) {
                Command::Quit => return Ok(ReaderExit::Quit),
                Command::Shutdown => {
                    tracing::info!(session = self.id, name = %name, "shutdown requested by client");
                    self.shared.shutdown();
                    return Ok(ReaderExit::Shutdown);
                },
                Command::Chat(text) => {
                    let message = protocol::chat_line(Local::now(), &name, text);
                    let receivers = self.shared.registry.broadcast(self.id, &message);
                    tracing::trace!(session = self.id, receivers, "broadcast");
                },
            }
        }
    }

    /// Read one line, or stop early if the reader is interrupted.
    async fn next_line<R>(
        &self,
        lines: &mut FramedRead<R, AnyDelimiterCodec>,
    ) -> Result<Line, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        tokio::select! {
            biased;

            () = self.interrupt.cancelled() => Ok(Line::Interrupted),
            next = lines.next() => match next {
                Some(Ok(raw)) => Ok(Line::Text(protocol::decode_line(&raw))),
                None => Ok(Line::Eof),
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    Err(SessionError::LineTooLong { max: self.shared.config.max_line_length })
                },
                Some(Err(AnyDelimiterCodecError::Io(err))) => Err(err.into()),
            },
        }
    }

    fn on_reader_exit(self: &Arc<Self>) {
        match self.state.finish(Unit::Reader) {
            Handoff::Reclaim => self.shared.enqueue_reclaim(Arc::clone(self)),
            // Writer is parked on the queue; READER_DONE is its stop signal.
            Handoff::NotifyPartner => self.outbox.wake(),
        }
    }

    async fn writer_unit<W>(self: Arc<Self>, output: W)
    where
        W: AsyncWrite + Unpin,
    {
        match AssertUnwindSafe(self.write_loop(output)).catch_unwind().await {
            Ok(Ok(())) => {
                tracing::debug!(session = self.id, name = self.display_name(), peer = ?self.peer, "writer finished");
            },
            Ok(Err(err)) => self.log_unit_error(Unit::Writer, &err),
            Err(panic) => self.log_unit_panic(Unit::Writer, panic.as_ref()),
        }
        self.on_writer_exit();
    }

    async fn write_loop<W>(&self, mut output: W) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let stop = StateFlags::TERMINATION_REQUESTED.union(StateFlags::READER_DONE);
        let stopping = || self.state.load().intersects(stop);

        while let Some(message) = self.outbox.next(&stopping).await {
            self.write(&mut output, &message).await?;
        }

        let limit = self.shared.config.write_timeout;
        tokio::time::timeout(limit, output.shutdown())
            .await
            .map_err(|_| SessionError::WriteTimeout(limit))??;
        Ok(())
    }

    async fn write<W>(&self, output: &mut W, message: &[u8]) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let limit = self.shared.config.write_timeout;
        tokio::time::timeout(limit, output.write_all(message))
            .await
            .map_err(|_| SessionError::WriteTimeout(limit))??;
        Ok(())
    }

    fn on_writer_exit(self: &Arc<Self>) {
        match self.state.finish(Unit::Writer) {
            Handoff::Reclaim => self.shared.enqueue_reclaim(Arc::clone(self)),
            // Nobody will service this client any more; don't leave the
            // reader waiting on it.
            Handoff::NotifyPartner => {
                // Stop queueing messages nobody will write.
                self.outbox.close();
                self.interrupt_reader();
            },
        }
    }

    fn log_unit_error(&self, unit: Unit, err: &SessionError) {
        if err.is_disconnect() {
            tracing::debug!(
                session = self.id,
                name = self.display_name(),
                peer = ?self.peer,
                ?unit,
                "peer disconnected: {err}"
            );
        } else {
            tracing::info!(
                session = self.id,
                name = self.display_name(),
                peer = ?self.peer,
                ?unit,
                "unit stopped: {err}"
            );
        }
    }

    fn log_unit_panic(&self, unit: Unit, payload: &(dyn Any + Send)) {
        tracing::error!(
            session = self.id,
            name = self.display_name(),
            peer = ?self.peer,
            ?unit,
            "unit panicked: {}",
            panic_message(payload)
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("name", &self.name())
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
