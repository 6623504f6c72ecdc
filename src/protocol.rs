//! Line protocol spoken by relay clients.
//!
//! Every message is a single line of UTF-8 text terminated by `\n`:
//!
//! ```text
//! Client:  hello everyone\n
//! Relay:   203.0.113.7:51234: hello everyone\n     (to every client)
//!
//! Client:  /server shutdown\n
//! Relay:   The server is shutting down\n           (to every client)
//!          You were disconnected from the server.\n
//! ```
//!
//! A line whose first non-whitespace character is `/` is a command and is
//! never rebroadcast. There is no escaping; a message cannot contain `\n`.

use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};

/// Line terminator.
pub const TERMINATOR: u8 = b'\n';

/// Leading character that marks a line as a command.
pub const COMMAND_SIGIL: char = '/';

/// Sent to everyone before the shutdown sweep closes connections.
pub const SHUTDOWN_NOTICE: &str = "The server is shutting down\n";

/// Written directly to each client as its connection is closed by shutdown.
pub const DISCONNECT_NOTICE: &str = "You were disconnected from the server.\n";

/// A framed inbound line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Ordinary text to rebroadcast.
    Chat(String),
    /// Text beginning with the command sigil.
    Command(String),
}

impl Inbound {
    /// Classify a decoded line.
    pub fn classify(line: String) -> Self {
        if line.trim_start().starts_with(COMMAND_SIGIL) {
            Inbound::Command(line)
        } else {
            Inbound::Chat(line)
        }
    }
}

/// Split one complete line off the front of `buffer`.
///
/// The returned frame includes its terminator. Bytes after the terminator
/// stay in `buffer` for the next call; an unterminated tail yields `None`.
pub fn next_line(buffer: &mut BytesMut) -> Option<BytesMut> {
    let end = buffer.iter().position(|&b| b == TERMINATOR)?;
    Some(buffer.split_to(end + 1))
}

/// Decode a frame as text. Invalid UTF-8 sequences are replaced rather
/// than rejected.
pub fn decode(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame).into_owned()
}

/// Commands understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    /// `/server shutdown`
    Shutdown,
    /// `/server <number>`: reserved command codes, accepted but inert.
    Reserved(u16),
}

impl ServerCommand {
    /// Parse a command line. Returns `None` for anything outside the
    /// vocabulary; callers ignore those without telling the sender.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "/server" {
            return None;
        }

        match tokens.next()? {
            "shutdown" => Some(ServerCommand::Shutdown),
            word => word.parse().ok().map(ServerCommand::Reserved),
        }
    }
}

/// Rebroadcast form of a chat line: `"<ip:port>: <line>"`.
///
/// The sender's terminator is carried through unchanged.
pub fn chat(peer: SocketAddr, line: &str) -> String {
    format!("{}: {}", peer, line)
}

/// Announcement sent to everyone when a client connects.
pub fn join_notice(ip: IpAddr) -> Bytes {
    Bytes::from(format!("User at {} is online\n", ip))
}

/// Announcement sent to everyone when a client goes away.
pub fn leave_notice(ip: IpAddr) -> Bytes {
    Bytes::from(format!("{} disconnected.\n", ip))
}
