// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-connection state and buffered nonblocking I/O.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use parser::h1::request::Head;

use crate::buffer::Buffer;

/// Connection lifecycle states.
///
/// `ReadingHeaders → ReadingBody → Processing → Writing` then either back to
/// `ReadingHeaders` for keep-alive reuse, or `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating bytes until the end-of-headers sentinel.
    ReadingHeaders,
    /// Headers parsed; accumulating the framed body.
    ReadingBody,
    /// A complete request is with the user callback.
    Processing,
    /// Flushing the serialized response.
    Writing,
    /// Terminal. No further read or write succeeds.
    Closed,
}

/// One accepted client connection, owned by exactly one worker from
/// hand-off until close.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    id: u64,
    remote: SocketAddr,
    state: ConnState,
    recv: Buffer,
    send: Buffer,
    head: Option<Head>,
    keep_alive: bool,
    eof: bool,
    added_at: Instant,
    last_activity: Instant,
    request_started: Instant,
    deadline: Instant,
    deadline_seq: u64,
    requests_served: u32,
    response_flushed: bool,
    close_after_write: bool,
}

impl Connection {
    /// Wraps a received descriptor. Timers start at the moment of adoption.
    pub fn new(stream: TcpStream, id: u64, remote: SocketAddr) -> Self {
        let now = Instant::now();
        Connection {
            stream,
            id,
            remote,
            state: ConnState::ReadingHeaders,
            recv: Buffer::default(),
            send: Buffer::default(),
            head: None,
            keep_alive: false,
            eof: false,
            added_at: now,
            last_activity: now,
            request_started: now,
            deadline: now,
            deadline_seq: 0,
            requests_served: 0,
            response_flushed: false,
            close_after_write: false,
        }
    }

    /// Connection id assigned by the master at accept time.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote peer address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Descriptor identity of the underlying socket.
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Registration handle for the poller.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Advances the lifecycle state.
    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    /// Drains the socket into the receive buffer, `scratch`-sized reads at
    /// a time, until the read would block.
    ///
    /// Readiness is edge-triggered, so stopping short of `WouldBlock` would
    /// strand buffered bytes. Client EOF latches [`Connection::saw_eof`];
    /// a wakeup that transfers nothing surfaces as `WouldBlock`.
    pub fn fill(&mut self, scratch: &mut [u8]) -> io::Result<usize> {
        if self.state == ConnState::Closed {
            return Err(ErrorKind::NotConnected.into());
        }

        let mut total = 0;
        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(total);
                }
                Ok(n) => {
                    self.recv.extend(&scratch[..n]);
                    self.touch();
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether the client has half-closed its sending side.
    pub fn saw_eof(&self) -> bool {
        self.eof
    }

    /// Flushes pending response bytes, stopping at `WouldBlock`. Returns the
    /// bytes written this tick; the remainder stays queued for the next
    /// writable event.
    pub fn flush(&mut self) -> io::Result<usize> {
        if self.state == ConnState::Closed {
            return Err(ErrorKind::NotConnected.into());
        }

        let mut flushed = 0;
        while !self.send.is_empty() {
            match self.stream.write(self.send.as_slice()) {
                Ok(n) => {
                    self.send.consume(n);
                    flushed += n;
                    self.response_flushed = true;
                    self.touch();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(flushed)
    }

    /// Buffered request bytes.
    pub fn recv_buf(&self) -> &[u8] {
        self.recv.as_slice()
    }

    /// Marks `n` request bytes consumed by the parser.
    pub fn consume_recv(&mut self, n: usize) {
        self.recv.consume(n);
    }

    /// Sink for the response writer.
    pub fn send_buf_mut(&mut self) -> &mut Buffer {
        &mut self.send
    }

    /// Whether response bytes are still queued.
    pub fn has_pending_write(&self) -> bool {
        !self.send.is_empty()
    }

    /// Stashes the parsed head while the body is framed.
    pub fn set_head(&mut self, head: Head) {
        self.head = Some(head);
    }

    /// Takes the stashed head for request assembly.
    pub fn take_head(&mut self) -> Option<Head> {
        self.head.take()
    }

    /// Read-only view of the stashed head.
    pub fn head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    /// Whether this connection may serve another request after the current
    /// response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Records the keep-alive decision for the in-flight exchange.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Marks the connection for closing once the response is flushed.
    pub fn defer_close(&mut self) {
        self.close_after_write = true;
    }

    /// Whether the connection closes after the pending flush.
    pub fn closes_after_write(&self) -> bool {
        self.close_after_write
    }

    /// Updates the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the connection joined the pool.
    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.added_at)
    }

    /// Time since the last read or write.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }

    /// Time since the current request timer was started.
    pub fn request_age(&self, now: Instant) -> Duration {
        now.duration_since(self.request_started)
    }

    /// Whether any response byte has reached the wire on this exchange.
    /// Gates the 408-on-timeout courtesy response.
    pub fn response_flushed(&self) -> bool {
        self.response_flushed
    }

    /// Requests completed on this connection.
    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    /// Counts a completed request/response exchange.
    pub fn mark_request_served(&mut self) {
        self.requests_served += 1;
    }

    /// Recycles parse state for the next keep-alive request and restarts
    /// the request timer. Unconsumed pipelined bytes stay buffered.
    pub fn reset_for_next_request(&mut self) {
        self.state = ConnState::ReadingHeaders;
        self.head = None;
        self.keep_alive = false;
        self.response_flushed = false;
        self.request_started = Instant::now();
    }

    /// Arms the timeout deadline, invalidating any earlier arm. Returns the
    /// sequence number identifying this arm.
    pub fn arm_deadline(&mut self, at: Instant) -> u64 {
        self.deadline = at;
        self.deadline_seq += 1;
        self.deadline_seq
    }

    /// The currently armed deadline and its sequence number.
    pub fn deadline(&self) -> (Instant, u64) {
        (self.deadline, self.deadline_seq)
    }

    /// Terminal transition. The descriptor itself is released exactly once,
    /// when the connection is dropped.
    pub fn mark_closed(&mut self) {
        self.state = ConnState::Closed;
    }
}
