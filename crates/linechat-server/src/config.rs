//! Server configuration.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

/// Default upper bound on a single input line, in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Default bound on a single write to a client.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration for [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (port 0 picks an ephemeral port)
    pub bind_address: SocketAddr,
    /// Longest accepted input line, excluding the newline
    pub max_line_length: usize,
    /// How long the writer unit may block on one message before the
    /// connection is treated as broken
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Configuration for tests: loopback, ephemeral port.
    pub fn local() -> Self {
        Self { bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), ..Self::default() }
    }
}
