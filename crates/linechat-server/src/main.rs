//! Linechat server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on port 7000, all interfaces
//! linechat-server 7000
//!
//! # Loopback only, verbose
//! linechat-server 7000 --bind 127.0.0.1 --log-level debug
//! ```
//!
//! Exits 0 after a clean shutdown (`/shutdown` from a client or Ctrl-C),
//! 1 on a missing or invalid port or a server failure.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    process::ExitCode,
    time::Duration,
};

use clap::Parser;
use linechat_server::{DEFAULT_MAX_LINE_LENGTH, Server, ServerConfig, ServerError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Line-oriented TCP chat server
#[derive(Parser, Debug)]
#[command(name = "linechat-server")]
#[command(about = "Multi-client line-oriented chat server")]
#[command(version)]
struct Args {
    /// TCP port to listen on
    port: u16,

    /// Address to bind to
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Longest accepted input line, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    max_line_length: usize,

    /// Seconds a client may stall a single write before it is dropped
    #[arg(long, default_value_t = 10)]
    write_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: SocketAddr::new(self.bind, self.port),
            max_line_length: self.max_line_length,
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

/// Exit status for a command line clap refused: 0 for `--help`/`--version`,
/// 1 for a usage error.
fn usage_exit_status(err: &clap::Error) -> u8 {
    u8::from(err.use_stderr())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let status = usage_exit_status(&err);
            // Logging is not up yet; if stderr is gone there is nowhere left to report to
            let _ = err.print();
            return ExitCode::from(status);
        },
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match serve(args.config()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        },
    }
}

async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    tracing::info!("Linechat server starting");

    let server = Server::bind(config).await?;
    let handle = server.handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received");
                handle.shutdown();
            },
            Err(err) => tracing::warn!("cannot listen for Ctrl-C: {err}"),
        }
    });

    server.run().await
}
