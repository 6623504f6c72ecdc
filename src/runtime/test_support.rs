//! In-memory transport and recording handler for session and relay tests.

use crate::runtime::session::{SessionError, SessionHandler, Transport};
use crate::runtime::token::SessionId;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;

/// Address of the `n`th fake peer: `10.0.0.n:500n`.
pub fn peer(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 5000 + u16::from(n)))
}

#[derive(Default)]
struct MockState {
    reads: VecDeque<io::Result<Vec<u8>>>,
    written: Vec<u8>,
    /// Bytes accepted before writes start blocking. `None` is unlimited.
    write_budget: Option<usize>,
    write_error: Option<io::ErrorKind>,
    close_calls: usize,
}

/// Scripted stream. Clones share state so a test can keep a handle to a
/// stream it has moved into a session.
#[derive(Clone, Default)]
pub struct MockStream {
    state: Rc<RefCell<MockState>>,
}

impl MockStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `data` available to the next read.
    pub fn push_read(&self, data: &[u8]) {
        self.state.borrow_mut().reads.push_back(Ok(data.to_vec()));
    }

    /// Make the next read report end of stream.
    pub fn push_eof(&self) {
        self.state.borrow_mut().reads.push_back(Ok(Vec::new()));
    }

    pub fn push_read_error(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().reads.push_back(Err(kind.into()));
    }

    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.borrow_mut().write_budget = budget;
    }

    /// Fail every following write with `kind`.
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().write_error = Some(kind);
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    pub fn written_str(&self) -> String {
        String::from_utf8(self.written()).unwrap()
    }

    /// Drain what has been written so far, one string per line.
    pub fn take_lines(&self) -> Vec<String> {
        let written = std::mem::take(&mut self.state.borrow_mut().written);
        String::from_utf8(written)
            .unwrap()
            .split_inclusive('\n')
            .map(str::to_string)
            .collect()
    }

    pub fn close_calls(&self) -> usize {
        self.state.borrow().close_calls
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        match state.reads.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(Err(e)) => Err(e),
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    state.reads.push_front(Ok(data[n..].to_vec()));
                }
                Ok(n)
            }
        }
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.write_error {
            return Err(kind.into());
        }
        if state.close_calls > 0 {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let n = match state.write_budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let n = budget.min(buf.len());
                state.write_budget = Some(budget - n);
                n
            }
            None => buf.len(),
        };
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockStream {
    fn close(&self) -> io::Result<()> {
        self.state.borrow_mut().close_calls += 1;
        Ok(())
    }
}

/// Handler that records every report in order of arrival.
#[derive(Default)]
pub struct Recorder {
    pub messages: Vec<String>,
    pub commands: Vec<String>,
    pub errors: Vec<(SessionId, SessionError)>,
}

impl SessionHandler for Recorder {
    fn on_message(&mut self, message: String) {
        self.messages.push(message);
    }

    fn on_command(&mut self, command: String) {
        self.commands.push(command);
    }

    fn on_error(&mut self, id: SessionId, cause: SessionError) {
        self.errors.push((id, cause));
    }
}
