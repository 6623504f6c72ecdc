//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread runs the whole relay. Connections are registered for both
//! readable and writable readiness once, edge-triggered; sessions drain
//! their socket on every event until it would block.
//!
//! After a shutdown command the listener is closed, so later connection
//! attempts are refused. `run` returns once the listener is gone and the
//! last session has been retired.

use crate::config::Config;
use crate::runtime::relay::Relay;
use crate::runtime::token::SessionId;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// The relay server: listener, reactor and registry.
pub struct Server {
    poll: Poll,
    /// `None` once shutdown has stopped accepting.
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    relay: Relay<TcpStream>,
    event_capacity: usize,
}

impl Server {
    /// Bind the listening socket. Failing here is the only fatal error.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr, config.backlog)?);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, SessionId::LISTENER.token(), Interest::READABLE)?;

        info!(addr = %local_addr, "Server listening");

        Ok(Self {
            poll,
            listener: Some(listener),
            local_addr,
            relay: Relay::new(config.max_line_length),
            event_capacity: config.event_capacity.max(1),
        })
    }

    /// Address the listener is bound to.
    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until shutdown has closed the listener and every session.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);

        while self.listener.is_some() || !self.relay.is_empty() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                let id = SessionId::from_token(event.token());
                if id.is_listener() {
                    self.accept_connections();
                    continue;
                }

                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.relay.on_readable(id);
                }
                if event.is_writable() {
                    self.relay.on_writable(id);
                }

                // A listener event later in this batch must not accept.
                if self.relay.is_shutting_down() {
                    self.stop_accepting();
                }
            }
        }

        info!("Server stopped");
        Ok(())
    }

    fn accept_connections(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        if self.relay.is_shutting_down() {
            return;
        }

        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let id = self.relay.next_id();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        id.token(),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    let admitted = self.relay.admit(stream, peer);
                    debug_assert_eq!(admitted, Some(id));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    // Connections still queued in the backlog wait for the
                    // next listener edge.
                    self.relay.accept_failed(e);
                    break;
                }
            }
        }
    }

    fn stop_accepting(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                debug!(error = %e, "Listener deregistration failed");
            }
            debug!(addr = %self.local_addr, "Listener closed");
        }
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
