//! Linechat server.
//!
//! Multi-client, line-oriented chat over plain TCP. Every line a named client
//! sends is broadcast to every other named client.
//!
//! # Architecture
//!
//! Each connection is a [`Session`] with two tokio tasks: a reader that
//! consumes input lines and a writer that drains the session's outbound
//! queue. The two share one atomic flag-set ([`SessionState`]) and agree,
//! without any other coordination, on which of them hands the finished
//! session to the reaper.
//!
//! # Components
//!
//! - [`Server`]: accept loop, owns the registry and the reaper
//! - [`ServerHandle`]: shutdown and observation from other tasks
//! - [`Registry`]: exclusive names and the live-session set
//! - [`Session`]: one client connection and its two units
//! - [`SessionState`]: the reader/writer completion handshake
//! - [`Outbox`]: per-session unbounded FIFO of outgoing lines
//!
//! # Protocol
//!
//! The server asks for a name until the client supplies one nobody else
//! holds. After that, `/quit` leaves, `/shutdown` stops the server, and any
//! other line is chat.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod outbox;
pub mod protocol;
mod reaper;
mod registry;
mod server;
mod session;
pub mod state;

pub use config::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_WRITE_TIMEOUT, ServerConfig};
pub use error::{RegistryError, ServerError, SessionError};
pub use outbox::Outbox;
pub use registry::{Reclaimed, Registry};
pub use server::{Server, ServerHandle, ServerPhase};
pub use session::{Session, SessionId};
pub use state::{Handoff, SessionState, StateFlags, Unit};
