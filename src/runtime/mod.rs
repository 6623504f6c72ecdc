//! Single-threaded reactor runtime for the relay.
//!
//! - `Session`: per-connection framing and outbound queue
//! - `Relay`: session registry, broadcast, commands, teardown
//! - `Server`: mio event loop driving the relay
//! - `SessionId`: identifiers and reactor tokens

mod event_loop;
mod relay;
mod session;
mod token;

#[cfg(test)]
mod test_support;

pub use event_loop::Server;

use crate::config::Config;

/// Bind the configured address and run until shutdown completes.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut server = Server::bind(&config)?;
    server.run()
}
