//! Per-connection state machine.
//!
//! A session owns one client transport. It frames inbound bytes into lines,
//! serializes outbound messages through a FIFO queue with at most one
//! write in flight, and reports what happened through a [`SessionHandler`].
//! It never touches other sessions.
//!
//! ```text
//! Created -> Reading <-> Dispatching
//!               \            \
//!                +------------+--> Closed   (error or explicit close)
//! ```
//!
//! There is no read timeout: a silent peer keeps its session open until it
//! disconnects or the server shuts down.

use crate::protocol::{self, Inbound};
use crate::runtime::token::SessionId;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use tracing::{debug, trace};

/// Bytes pulled from the transport per read call.
const READ_CHUNK: usize = 4096;

/// A non-blocking byte stream a session can own.
pub trait Transport: Read + Write {
    /// Shut down both directions of the stream.
    fn close(&self) -> io::Result<()>;
}

impl Transport for mio::net::TcpStream {
    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Receiver for everything a session reports to its owner.
///
/// The owner passes its handler into every completion call, so a session
/// can never complete a read or write without one.
pub trait SessionHandler {
    /// A chat line, already prefixed with the sender's address.
    fn on_message(&mut self, message: String);
    /// A line starting with the command sigil, verbatim.
    fn on_command(&mut self, command: String);
    /// The session failed and has closed its transport. Fires once.
    fn on_error(&mut self, id: SessionId, cause: SessionError);
}

/// Why a session ended.
#[derive(Debug)]
pub enum SessionError {
    /// The peer closed its end of the connection.
    Disconnected,
    /// The peer sent more than this many bytes without a line terminator.
    LineTooLong(usize),
    /// Any other transport failure.
    Io(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Disconnected => write!(f, "peer closed the connection"),
            SessionError::LineTooLong(limit) => {
                write!(f, "line exceeded {} bytes without a terminator", limit)
            }
            SessionError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, reads not started yet.
    Created,
    /// Waiting for inbound data.
    Reading,
    /// Handing framed lines to the handler.
    Dispatching,
    /// Transport shut down. Terminal.
    Closed,
}

/// A single client connection.
pub struct Session<S> {
    id: SessionId,
    stream: S,
    /// Resolved once at accept time; still valid after the transport closes.
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    state: SessionState,
    inbound: BytesMut,
    outbound: VecDeque<Bytes>,
    /// Bytes of the front outbound entry already written.
    written: usize,
    max_line_length: usize,
}

impl<S: Transport> Session<S> {
    pub fn new(id: SessionId, stream: S, peer: SocketAddr, max_line_length: usize) -> Self {
        Self {
            id,
            stream,
            peer,
            connected_at: Utc::now(),
            state: SessionState::Created,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: VecDeque::new(),
            written: 0,
            max_line_length,
        }
    }

    #[cfg(test)]
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Messages queued but not yet fully written.
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Start accepting inbound data. Calling it again is a no-op.
    pub fn begin_read(&mut self) {
        if self.state == SessionState::Created {
            self.state = SessionState::Reading;
        }
    }

    /// Drain the transport and dispatch every complete line.
    ///
    /// Reads until the transport would block, as required by an
    /// edge-triggered reactor.
    pub fn on_readable<H: SessionHandler>(&mut self, handler: &mut H) {
        if self.state != SessionState::Reading {
            return;
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return self.fail(SessionError::Disconnected, handler),
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    self.dispatch(handler);

                    if self.inbound.len() > self.max_line_length {
                        return self.fail(SessionError::LineTooLong(self.max_line_length), handler);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(SessionError::Io(e), handler),
            }
        }
    }

    /// Continue draining the outbound queue.
    pub fn on_writable<H: SessionHandler>(&mut self, handler: &mut H) {
        if self.is_closed() {
            return;
        }
        self.flush(handler);
    }

    /// Queue a message for delivery.
    ///
    /// If nothing was queued, writing starts immediately; otherwise the
    /// message waits behind the entry currently on the wire.
    pub fn send<H: SessionHandler>(&mut self, message: Bytes, handler: &mut H) {
        if self.is_closed() || message.is_empty() {
            return;
        }

        let idle = self.outbound.is_empty();
        self.outbound.push_back(message);
        if idle {
            self.flush(handler);
        }
    }

    /// Write a terminal message straight to the transport.
    ///
    /// The notice is not queued. Whatever is still queued is flushed first
    /// so the notice starts on a fresh line; if the transport would block,
    /// the rest is dropped since the session is about to close.
    pub fn notify<H: SessionHandler>(&mut self, message: &[u8], handler: &mut H) {
        if self.is_closed() {
            return;
        }

        self.flush(handler);
        if self.is_closed() {
            return;
        }
        if !self.outbound.is_empty() {
            debug!(id = %self.id, queued = self.outbound.len(), "Notice dropped behind blocked queue");
            return;
        }

        let mut offset = 0;
        while offset < message.len() {
            match self.stream.write(&message[offset..]) {
                Ok(0) => {
                    return self.fail(io::Error::from(io::ErrorKind::WriteZero).into(), handler);
                }
                Ok(n) => offset += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!(id = %self.id, written = offset, "Notice truncated");
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(e.into(), handler),
            }
        }
    }

    /// Shut the transport down. Only the first call has any effect.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }

        self.state = SessionState::Closed;
        self.outbound.clear();
        self.written = 0;
        if let Err(e) = self.stream.close() {
            // Peers that reset first leave nothing to shut down.
            trace!(id = %self.id, error = %e, "Transport shutdown failed");
        }
    }

    fn dispatch<H: SessionHandler>(&mut self, handler: &mut H) {
        self.state = SessionState::Dispatching;

        while let Some(frame) = protocol::next_line(&mut self.inbound) {
            trace!(id = %self.id, len = frame.len(), "Dispatching line");
            match Inbound::classify(protocol::decode(&frame)) {
                Inbound::Command(command) => handler.on_command(command),
                Inbound::Chat(line) => handler.on_message(protocol::chat(self.peer, &line)),
            }
        }

        self.state = SessionState::Reading;
    }

    /// Write queued entries in order until the queue is empty or the
    /// transport would block. Only the front entry is ever on the wire.
    fn flush<H: SessionHandler>(&mut self, handler: &mut H) {
        while let Some(front) = self.outbound.front() {
            let len = front.len();
            match self.stream.write(&front[self.written..]) {
                Ok(0) => {
                    return self.fail(io::Error::from(io::ErrorKind::WriteZero).into(), handler);
                }
                Ok(n) => {
                    self.written += n;
                    if self.written == len {
                        self.outbound.pop_front();
                        self.written = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(e.into(), handler),
            }
        }
    }

    /// Single error path: close once, report once.
    fn fail<H: SessionHandler>(&mut self, cause: SessionError, handler: &mut H) {
        if self.is_closed() {
            return;
        }

        debug!(id = %self.id, peer = %self.peer, error = %cause, "Session failed");
        self.close();
        handler.on_error(self.id, cause);
    }
}
