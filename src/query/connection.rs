//! Fixed-size table of client connections with non-blocking I/O.

use std::future::poll_fn;
use std::io;
use std::net::Shutdown;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use super::buffer::BoundedBuffer;
use super::protocol;
use crate::tracker::SafetyTracker;

/// Consecutive hard read errors after which a connection is dropped.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 3;

/// One accepted client.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    input: BoundedBuffer,
    output: BoundedBuffer,
    ready_for_read: bool,
    ready_for_write: bool,
    /// Peer shut down its sending side.
    read_closed: bool,
    read_errors: u32,
}

impl Connection {
    fn new(stream: UnixStream, buffer_capacity: usize) -> Self {
        Self {
            stream,
            input: BoundedBuffer::with_capacity(buffer_capacity),
            output: BoundedBuffer::with_capacity(buffer_capacity),
            ready_for_read: true,
            ready_for_write: false,
            read_closed: false,
            read_errors: 0,
        }
    }

    #[cfg(test)]
    pub fn input(&self) -> &BoundedBuffer {
        &self.input
    }

    #[cfg(test)]
    pub fn output(&self) -> &BoundedBuffer {
        &self.output
    }

    #[cfg(test)]
    pub fn ready_for_read(&self) -> bool {
        self.ready_for_read
    }

    #[cfg(test)]
    pub fn ready_for_write(&self) -> bool {
        self.ready_for_write
    }

    /// Whether a complete request is waiting in the input buffer.
    pub fn has_message(&self) -> bool {
        self.input.find_line().is_some()
    }

    fn refresh_interest(&mut self) {
        self.ready_for_read = !self.read_closed && !self.input.is_full();
        self.ready_for_write = !self.output.is_empty();
    }

    fn shutdown(self) {
        if let Ok(stream) = self.stream.into_std() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Slots that became ready during one readiness wait.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Slots filled by connections accepted during the wait.
    pub accepted: Vec<usize>,
    pub readable: Vec<usize>,
    pub writable: Vec<usize>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.readable.is_empty() && self.writable.is_empty()
    }
}

/// Result of one [`ConnectionManager::read_available`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Received(usize),
    /// Nothing to read right now (or no room to read into).
    WouldBlock,
    /// Peer closed, or the connection was dropped after repeated errors.
    Closed,
    /// Peer finished sending; the connection closes once its pending
    /// requests are answered and written.
    Draining,
    /// A request outgrew the input buffer; the connection was dropped.
    Overflow,
    /// A read error that will be retried next tick.
    Failed,
}

/// Result of one [`ConnectionManager::write_pending`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Output buffer fully sent.
    Flushed,
    /// Some bytes sent; this many remain queued.
    Partial(usize),
    WouldBlock,
    /// Nothing was queued.
    Idle,
    /// The write failed and the connection was dropped.
    Closed,
}

/// Owns every client connection in a fixed number of slots.
pub struct ConnectionManager {
    slots: Vec<Option<Connection>>,
    buffer_capacity: usize,
    scratch: Vec<u8>,
}

impl ConnectionManager {
    pub fn new(max_clients: usize, buffer_capacity: usize) -> Self {
        Self {
            slots: (0..max_clients).map(|_| None).collect(),
            buffer_capacity,
            scratch: vec![0; buffer_capacity],
        }
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    /// Ids of all occupied slots.
    pub fn ids(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
            .collect()
    }

    /// Place an already-connected stream in the first free slot.
    pub fn insert(&mut self, stream: UnixStream) -> Option<usize> {
        let id = self.slots.iter().position(Option::is_none)?;
        self.slots[id] = Some(Connection::new(stream, self.buffer_capacity));
        Some(id)
    }

    /// Accept one pending connection without blocking.
    ///
    /// Returns `None` when nothing is pending or every slot is taken; in the
    /// latter case the listener is not touched, so the connection stays in
    /// the OS backlog.
    pub fn accept_if_capacity(
        &mut self,
        listener: &UnixListener,
        cx: &mut Context<'_>,
    ) -> Option<usize> {
        if !self.has_capacity() {
            return None;
        }

        match listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, _addr))) => {
                let id = self.insert(stream)?;
                debug!(
                    "new client connection in slot {} ({} active)",
                    id,
                    self.len()
                );
                Some(id)
            }
            Poll::Ready(Err(e)) => {
                warn!("Failed to accept client connection: {}", e);
                None
            }
            Poll::Pending => None,
        }
    }

    /// Wait up to `timeout` for a pending connection or for any connection
    /// to become readable or writable per its interest flags.
    ///
    /// Returns an empty [`Readiness`] on timeout.
    pub async fn poll_readiness(
        &mut self,
        listener: Option<&UnixListener>,
        timeout: Duration,
    ) -> Readiness {
        let wait = poll_fn(|cx| {
            let mut ready = Readiness::default();

            if let Some(listener) = listener {
                while let Some(id) = self.accept_if_capacity(listener, cx) {
                    ready.accepted.push(id);
                }
            }

            for (id, slot) in self.slots.iter().enumerate() {
                let Some(conn) = slot else { continue };
                if conn.ready_for_read && conn.stream.poll_read_ready(cx).is_ready() {
                    ready.readable.push(id);
                }
                if conn.ready_for_write && conn.stream.poll_write_ready(cx).is_ready() {
                    ready.writable.push(id);
                }
            }

            if ready.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(ready)
            }
        });

        tokio::time::timeout(timeout, wait).await.unwrap_or_default()
    }

    /// Perform one non-blocking read into the connection's input buffer.
    pub fn read_available(&mut self, id: usize) -> ReadOutcome {
        let Some(conn) = self.slots.get_mut(id).and_then(Option::as_mut) else {
            return ReadOutcome::Closed;
        };

        let room = conn.input.remaining();
        if room == 0 {
            conn.ready_for_read = false;
            return ReadOutcome::WouldBlock;
        }

        let result = conn.stream.try_read(&mut self.scratch[..room]);
        self.complete_read(id, result)
    }

    /// Apply the result of one read attempt (bytes land in `scratch`).
    fn complete_read(&mut self, id: usize, result: io::Result<usize>) -> ReadOutcome {
        let Some(conn) = self.slots.get_mut(id).and_then(Option::as_mut) else {
            return ReadOutcome::Closed;
        };

        let outcome = match result {
            Ok(0) if conn.output.is_empty() && !conn.has_message() => {
                debug!("client {} closed the connection", id);
                ReadOutcome::Closed
            }
            Ok(0) => {
                debug!(
                    "client {} finished sending, {} bytes still queued",
                    id,
                    conn.output.len()
                );
                conn.read_closed = true;
                conn.ready_for_read = false;
                ReadOutcome::Draining
            }
            Ok(n) => {
                conn.read_errors = 0;
                // Never fails: reads are capped at the spare capacity
                let _ = conn.input.try_extend(&self.scratch[..n]);
                if conn.input.is_full() && !conn.has_message() {
                    warn!(
                        "client {} sent a request longer than {} bytes, dropping connection",
                        id,
                        conn.input.capacity()
                    );
                    ReadOutcome::Overflow
                } else {
                    conn.refresh_interest();
                    ReadOutcome::Received(n)
                }
            }
            Err(e) if is_transient(&e) => ReadOutcome::WouldBlock,
            Err(e) => {
                conn.read_errors += 1;
                warn!(
                    "unable to read client {} request ({} consecutive errors): {}",
                    id, conn.read_errors, e
                );
                if conn.read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::Failed
                }
            }
        };

        if matches!(outcome, ReadOutcome::Closed | ReadOutcome::Overflow) {
            self.close_connection(id);
        }
        outcome
    }

    /// Answer every complete request buffered for this connection.
    pub fn handle_messages(&mut self, id: usize, tracker: &SafetyTracker) -> usize {
        let Some(conn) = self.slots.get_mut(id).and_then(Option::as_mut) else {
            return 0;
        };

        let handled = protocol::handle_messages(id, &mut conn.input, &mut conn.output, tracker);
        conn.refresh_interest();

        if conn.read_closed && conn.output.is_empty() {
            self.close_connection(id);
        }
        handled
    }

    /// Perform one non-blocking write of the connection's queued output.
    pub fn write_pending(&mut self, id: usize) -> WriteOutcome {
        let Some(conn) = self.slots.get_mut(id).and_then(Option::as_mut) else {
            return WriteOutcome::Closed;
        };

        if conn.output.is_empty() {
            conn.ready_for_write = false;
            return WriteOutcome::Idle;
        }

        match conn.stream.try_write(conn.output.as_slice()) {
            Ok(n) if n == conn.output.len() => {
                conn.output.clear();
                conn.ready_for_write = false;
                if conn.read_closed {
                    self.close_connection(id);
                }
                WriteOutcome::Flushed
            }
            Ok(n) => {
                conn.output.consume(n);
                WriteOutcome::Partial(conn.output.len())
            }
            Err(e) if is_transient(&e) => WriteOutcome::WouldBlock,
            Err(e) => {
                warn!("unable to write to client {}: {}", id, e);
                self.close_connection(id);
                WriteOutcome::Closed
            }
        }
    }

    /// Shut down a connection and free its slot. Closing an empty slot is a
    /// no-op.
    pub fn close_connection(&mut self, id: usize) {
        if let Some(conn) = self.slots.get_mut(id).and_then(Option::take) {
            debug!("dropping connection to client {}", id);
            conn.shutdown();
        }
    }

    pub fn close_all(&mut self) {
        for id in 0..self.slots.len() {
            self.close_connection(id);
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
