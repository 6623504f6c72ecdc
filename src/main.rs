//! line-relay: a newline-delimited TCP broadcast relay
//!
//! Clients connect over TCP and send lines of text. Every line is
//! rebroadcast to all connected clients, prefixed with the sender's
//! address. Joins and disconnects are announced to everyone, and
//! `/server shutdown` closes every connection and stops the server.
//!
//! Features:
//! - Single-threaded mio reactor (epoll/kqueue)
//! - Per-client FIFO output that never blocks other clients
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_line_length = config.max_line_length,
        "Starting line-relay server"
    );

    runtime::run(config)?;
    Ok(())
}
