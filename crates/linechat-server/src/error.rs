//! Error types for the chat server.
//!
//! Three layers, matching how far a failure is allowed to travel:
//! - [`RegistryError`]: recoverable and user-facing. The client is told and
//!   re-prompted.
//! - [`SessionError`]: ends one unit of one session. Logged, then handled by
//!   the normal shutdown handshake. Never crosses into another session.
//! - [`ServerError`]: ends the whole server (bind failure, dead reaper).

use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

/// Errors from name registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Another live session already owns this name.
    #[error("name '{0}' is already taken")]
    NameTaken(String),

    /// Empty names cannot be addressed in chat output.
    #[error("name must not be empty")]
    EmptyName,
}

/// Errors that end a session's reader or writer unit.
///
/// All of these are treated like a graceful quit: the unit stops and the
/// session proceeds through the handshake.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Read or write on the connection failed.
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Client sent a line longer than the configured maximum.
    #[error("line exceeds {max} bytes")]
    LineTooLong {
        /// Configured limit
        max: usize,
    },

    /// Client did not accept a message within the write timeout.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
}

impl SessionError {
    /// Returns true if the peer simply went away.
    ///
    /// Disconnects are routine and logged quieter than protocol faults.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io(err) if matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }
}

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Listening socket could not be bound.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Other transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Broken internal invariant. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}
