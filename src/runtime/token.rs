//! Session identifiers and their reactor tokens.
//!
//! Each accepted connection gets the next value of a monotonically
//! increasing counter. Identifiers are never reused, so a readiness event
//! that arrives after its session was retired cannot reach a newer one.

use mio::Token;
use std::fmt;

/// Identifier of one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(usize);

impl SessionId {
    /// Sentinel for server-level failures (the listener itself).
    /// Never handed out to a session.
    pub const LISTENER: SessionId = SessionId(usize::MAX);

    /// Reactor token for this identifier.
    pub fn token(self) -> Token {
        Token(self.0)
    }

    /// Identifier carried by a reactor token.
    pub fn from_token(token: Token) -> Self {
        SessionId(token.0)
    }

    pub fn is_listener(self) -> bool {
        self == Self::LISTENER
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_listener() {
            f.write_str("listener")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Allocator for session identifiers.
///
/// Advances only when an identifier is actually taken, i.e. on a
/// successful accept.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: usize,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next identifier.
    pub fn alloc(&mut self) -> SessionId {
        let id = SessionId(self.next);
        self.next += 1;
        debug_assert!(!id.is_listener(), "session identifiers exhausted");
        id
    }

    /// The identifier the next `alloc` will return.
    pub fn peek(&self) -> SessionId {
        SessionId(self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mut ids = IdAllocator::new();

        let a = ids.alloc();
        let b = ids.alloc();
        let c = ids.alloc();

        assert!(a < b && b < c);
        assert_eq!(ids.peek(), SessionId(3));
        assert!(!a.is_listener());
    }

    #[test]
    fn test_token_round_trip_and_sentinel() {
        let id = SessionId(42);
        assert_eq!(id.token(), Token(42));
        assert_eq!(SessionId::from_token(Token(42)), id);

        assert_eq!(SessionId::LISTENER.token(), Token(usize::MAX));
        assert!(SessionId::from_token(Token(usize::MAX)).is_listener());
        assert_eq!(SessionId::LISTENER.to_string(), "listener");
        assert_eq!(id.to_string(), "42");
    }
}
