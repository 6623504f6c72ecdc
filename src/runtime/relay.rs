//! Broadcast core: the session registry and everything that acts on it.
//!
//! The relay owns every session, keyed by [`SessionId`]. Anything that needs
//! to act on a session does so through its identifier and a registry
//! lookup. Sessions report into a completion queue rather than calling back
//! into the relay directly; the relay applies those completions once the
//! session borrow has ended, so the registry is never mutated while a
//! session is being driven.
//!
//! Registry sweeps (broadcast, shutdown) walk a snapshot of identifiers
//! taken at the start of the call. Removals only touch the live map.
//!
//! Delivery policy for a client that is going away: a session whose
//! transport has already failed is skipped by every later broadcast, even
//! while its teardown is still queued. A session that fails during a
//! broadcast still counts as handed that message.

use crate::protocol::{self, ServerCommand, DISCONNECT_NOTICE, SHUTDOWN_NOTICE};
use crate::runtime::session::{Session, SessionError, SessionHandler, Transport};
use crate::runtime::token::{IdAllocator, SessionId};
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, error, info, trace};

/// A handler call recorded by a session, applied later by the relay.
#[derive(Debug)]
enum Completion {
    Message(String),
    Command(String),
    Error(SessionId, SessionError),
}

#[derive(Debug, Default)]
struct Completions {
    queue: VecDeque<Completion>,
}

impl SessionHandler for Completions {
    fn on_message(&mut self, message: String) {
        self.queue.push_back(Completion::Message(message));
    }

    fn on_command(&mut self, command: String) {
        self.queue.push_back(Completion::Command(command));
    }

    fn on_error(&mut self, id: SessionId, cause: SessionError) {
        self.queue.push_back(Completion::Error(id, cause));
    }
}

/// Registry of connected sessions plus the broadcast and command logic.
pub struct Relay<S> {
    registry: BTreeMap<SessionId, Session<S>>,
    ids: IdAllocator,
    completions: Completions,
    max_line_length: usize,
    shutting_down: bool,
}

impl<S: Transport> Relay<S> {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            registry: BTreeMap::new(),
            ids: IdAllocator::new(),
            completions: Completions::default(),
            max_line_length,
            shutting_down: false,
        }
    }

    /// Number of registered sessions.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, id: SessionId) -> bool {
        self.registry.contains_key(&id)
    }

    /// Cached address of a registered session.
    #[cfg(test)]
    pub fn peer_of(&self, id: SessionId) -> Option<SocketAddr> {
        self.registry.get(&id).map(Session::peer)
    }

    /// Identifier the next admitted connection will get.
    pub fn next_id(&self) -> SessionId {
        self.ids.peek()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Take ownership of an accepted connection.
    ///
    /// The session is registered and reading before the join notice goes
    /// out, so the new client sees its own announcement. Once shutdown has
    /// started the stream is closed and dropped instead, and no identifier
    /// is taken.
    pub fn admit(&mut self, stream: S, peer: SocketAddr) -> Option<SessionId> {
        if self.shutting_down {
            if let Err(e) = stream.close() {
                trace!(peer = %peer, error = %e, "Transport shutdown failed");
            }
            info!(peer = %peer, "Refused connection during shutdown");
            return None;
        }

        let id = self.ids.alloc();
        let mut session = Session::new(id, stream, peer, self.max_line_length);
        session.begin_read();
        self.registry.insert(id, session);

        self.broadcast(protocol::join_notice(peer.ip()));
        info!(id = %id, peer = %peer, clients = self.registry.len(), "Accepted new connection");

        self.dispatch_pending();
        Some(id)
    }

    /// Hand `message` to every registered session.
    ///
    /// Returns how many sessions it was handed to. Does not wait for
    /// delivery.
    pub fn broadcast(&mut self, message: impl Into<Bytes>) -> usize {
        let message = message.into();
        let snapshot: Vec<SessionId> = self.registry.keys().copied().collect();

        let mut delivered = 0;
        for id in snapshot {
            let Some(session) = self.registry.get_mut(&id) else {
                continue;
            };
            if session.is_closed() {
                continue;
            }
            session.send(message.clone(), &mut self.completions);
            delivered += 1;
        }

        trace!(delivered, len = message.len(), "Broadcast");
        delivered
    }

    /// Interpret a command line. Anything outside the vocabulary is
    /// ignored and the sender is not told.
    pub fn handle_command(&mut self, line: &str) {
        match ServerCommand::parse(line) {
            Some(ServerCommand::Shutdown) => self.shutdown(),
            Some(ServerCommand::Reserved(code)) => {
                debug!(code, "Reserved server command ignored");
            }
            None => {
                debug!(command = line.trim_end(), "Unrecognized command ignored");
            }
        }
    }

    /// Retire a failed session and announce it.
    ///
    /// The listener sentinel is only logged. Retiring an identifier that is
    /// no longer registered is a no-op.
    pub fn handle_error(&mut self, id: SessionId, cause: SessionError) {
        if id.is_listener() {
            error!(error = %cause, "Accept failed");
            return;
        }

        let Some(mut session) = self.registry.remove(&id) else {
            debug!(id = %id, "Session already retired");
            return;
        };
        session.close();

        let peer = session.peer();
        let connected_secs = (Utc::now() - session.connected_at()).num_seconds();
        match cause {
            SessionError::Disconnected => {
                info!(id = %id, peer = %peer, connected_secs, "Client disconnected");
            }
            cause => {
                info!(id = %id, peer = %peer, connected_secs, error = %cause, "Client disconnected with error");
            }
        }
        drop(session);

        self.broadcast(protocol::leave_notice(peer.ip()));
    }

    /// Report a failed accept through the error path.
    pub fn accept_failed(&mut self, error: io::Error) {
        self.completions.on_error(SessionId::LISTENER, error.into());
        self.dispatch_pending();
    }

    /// Warn everyone, then notify and close every session.
    ///
    /// Sessions that are already closed or gone when the sweep reaches them
    /// are skipped; their own teardown finishes the job.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        info!(clients = self.registry.len(), "Server shutdown sequence initiated");
        self.broadcast(SHUTDOWN_NOTICE);

        let snapshot: Vec<SessionId> = self.registry.keys().copied().collect();
        let mut closed = 0;
        for id in snapshot {
            let Some(session) = self.registry.get_mut(&id) else {
                continue;
            };
            if session.is_closed() {
                debug!(id = %id, state = ?session.state(), "Skipping closed session");
                continue;
            }

            session.notify(DISCONNECT_NOTICE.as_bytes(), &mut self.completions);
            session.close();
            self.registry.remove(&id);
            closed += 1;
        }

        info!(closed, "Server shutdown sequence: client disconnections complete");
    }

    /// Drive a session whose transport became readable.
    pub fn on_readable(&mut self, id: SessionId) {
        if let Some(session) = self.registry.get_mut(&id) {
            session.on_readable(&mut self.completions);
        }
        self.dispatch_pending();
    }

    /// Drive a session whose transport became writable.
    pub fn on_writable(&mut self, id: SessionId) {
        if let Some(session) = self.registry.get_mut(&id) {
            session.on_writable(&mut self.completions);
            trace!(id = %id, pending = session.pending(), "Writable");
        }
        self.dispatch_pending();
    }

    /// Apply recorded completions in order until none are left.
    fn dispatch_pending(&mut self) {
        while let Some(completion) = self.completions.queue.pop_front() {
            match completion {
                Completion::Message(message) => {
                    self.broadcast(message);
                }
                Completion::Command(command) => self.handle_command(&command),
                Completion::Error(id, cause) => self.handle_error(id, cause),
            }
        }
    }
}
