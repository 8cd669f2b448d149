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

//! Worker event loop.
//!
//! A worker owns the connections handed to it by the master and multiplexes
//! them on a single readiness-polled thread: descriptor intake from the
//! control channel, buffered reads, the HTTP parser, the user callback,
//! response writing with partial-write carryover, keep-alive recycling and
//! the timeout sweep.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use parser::h1::request::{BodyFraming, Head, Request};
use parser::h1::response::{Response, WriteOptions};
use parser::h1::{chunked, find_end_of_headers};
use parser::{Method, Version};

use crate::channel::{Channel, Received};
use crate::config::ServerConfig;
use crate::connection::{ConnState, Connection};
use crate::error::Result;
use crate::ipc::{Handoff, IpcMessage, IpcPayload, WorkerId};
use crate::pool::{AddOutcome, ConnectionPool};
use crate::signal;

/// The user callback: one request record in, one response record out.
/// Invoked on the worker's own thread; a slow handler stalls only the
/// worker that runs it.
pub type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

const CHANNEL_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// A worker process (or thread, in single-process mode) driving its share
/// of the server's connections.
pub struct Worker {
    id: WorkerId,
    channel: Channel,
    poll: Poll,
    pool: ConnectionPool,
    handler: Handler,
    config: ServerConfig,
    scratch: Vec<u8>,
    draining: Option<Instant>,
    started: Instant,
    requests_served: u64,
    last_sweep: Instant,
    last_metrics: Instant,
    pending_notices: VecDeque<IpcMessage>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("connections", &self.pool.len())
            .field("draining", &self.draining.is_some())
            .finish()
    }
}

impl Worker {
    /// Builds a worker around its end of the control channel.
    pub fn new(
        id: WorkerId,
        channel: Channel,
        handler: Handler,
        config: ServerConfig,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&channel.as_raw_fd()),
            CHANNEL_TOKEN,
            Interest::READABLE,
        )?;

        let now = Instant::now();
        Ok(Worker {
            id,
            channel,
            poll,
            pool: ConnectionPool::new(config.max_connections),
            handler,
            scratch: vec![0u8; config.buffer_size],
            config,
            draining: None,
            started: now,
            requests_served: 0,
            last_sweep: now,
            last_metrics: now,
            pending_notices: VecDeque::new(),
        })
    }

    /// Main worker loop. Returns once a drain completes, at which point the
    /// worker process exits 0.
    pub fn run(&mut self) -> Result<()> {
        self.send_or_queue(IpcMessage::new(IpcPayload::WorkerReady {
            worker_id: self.id,
        }));
        info!(worker = self.id, "worker ready");

        let mut events = Events::with_capacity(1024);
        loop {
            if signal::shutdown_requested() {
                self.begin_drain();
            }

            if let Some(deadline) = self.draining {
                if self.pool.is_empty() || Instant::now() >= deadline {
                    self.close_all();
                    info!(worker = self.id, "worker drained");
                    return Ok(());
                }
            }

            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    CHANNEL_TOKEN => self.drain_channel(),
                    Token(slot) => {
                        if event.is_readable() {
                            self.readable(slot);
                        }
                        if event.is_writable() {
                            self.flush_connection(slot);
                        }
                    }
                }
            }

            self.flush_pending_notices();
            self.sweep_if_due();
            self.publish_metrics_if_due();
        }
    }

    /// Reads every buffered channel frame: descriptor intakes and control
    /// messages.
    fn drain_channel(&mut self) {
        loop {
            match self.channel.recv() {
                Ok(Received::Handoff(meta, fd)) => self.intake(meta, fd),
                Ok(Received::Control(message)) => self.control(message),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    // master is gone; finish what we hold and exit
                    warn!(worker = self.id, error = %e, "control channel lost");
                    self.begin_drain();
                    break;
                }
            }
        }
    }

    fn control(&mut self, message: IpcMessage) {
        match message.payload {
            IpcPayload::Shutdown {} => {
                info!(worker = self.id, "shutdown requested by master");
                self.begin_drain();
            }
            IpcPayload::Reload {} => {
                debug!(worker = self.id, "reload coordination is master-side");
            }
            other => debug!(worker = self.id, ?other, "unexpected control message"),
        }
    }

    /// Adopts a received descriptor into the pool and starts its request
    /// timer.
    fn intake(&mut self, meta: Handoff, fd: OwnedFd) {
        if self.draining.is_some() {
            debug!(
                worker = self.id,
                connection = meta.connection_id,
                "refusing hand-off while draining"
            );
            drop(fd);
            self.notify_closed(meta.connection_id);
            return;
        }

        let stream = std::net::TcpStream::from(fd);
        if stream.set_nonblocking(true).is_err() {
            self.notify_closed(meta.connection_id);
            return;
        }
        let stream = mio::net::TcpStream::from_std(stream);

        let remote = meta
            .remote_ip
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, meta.remote_port))
            .or_else(|_| stream.peer_addr());
        let Ok(remote) = remote else {
            self.notify_closed(meta.connection_id);
            return;
        };

        let conn = Connection::new(stream, meta.connection_id, remote);
        let id = meta.connection_id;
        match self.pool.add(conn) {
            AddOutcome::Added(slot) => {
                let registered = match self.pool.get_mut(slot) {
                    Some(conn) => self.poll.registry().register(
                        conn.stream_mut(),
                        Token(slot),
                        Interest::READABLE,
                    ),
                    None => return,
                };
                if registered.is_err() {
                    self.close_connection(slot);
                    return;
                }

                self.arm_request_deadline(slot);
                debug!(
                    worker = self.id,
                    connection = id,
                    remote = %remote,
                    "connection adopted"
                );
            }
            AddOutcome::Refused => self.notify_closed(id),
        }
    }

    /// One bounded read, then the parse state machine.
    fn readable(&mut self, slot: usize) {
        let mut scratch = std::mem::take(&mut self.scratch);
        let outcome = match self.pool.get_mut(slot) {
            Some(conn) if conn.state() != ConnState::Closed => {
                let starting_request =
                    conn.state() == ConnState::ReadingHeaders && conn.recv_buf().is_empty();
                Some((starting_request, conn.fill(&mut scratch)))
            }
            _ => None,
        };
        self.scratch = scratch;

        let Some((starting_request, result)) = outcome else {
            return;
        };

        match result {
            Ok(0) => self.close_connection(slot),
            Ok(_) => {
                if starting_request {
                    self.arm_request_deadline(slot);
                }
                self.advance(slot);

                // EOF with the final bytes of a request: anything still
                // incomplete can never complete
                let abandoned = self.pool.get(slot).is_some_and(|conn| {
                    conn.saw_eof()
                        && matches!(
                            conn.state(),
                            ConnState::ReadingHeaders | ConnState::ReadingBody
                        )
                });
                if abandoned {
                    self.close_connection(slot);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(worker = self.id, error = %e, "read failed");
                self.close_connection(slot);
            }
        }
    }

    /// Drives the per-connection state machine as far as the buffered bytes
    /// allow.
    fn advance(&mut self, slot: usize) {
        loop {
            let Some(conn) = self.pool.get_mut(slot) else {
                return;
            };

            match conn.state() {
                ConnState::ReadingHeaders => {
                    let Some(split) = find_end_of_headers(conn.recv_buf()) else {
                        if conn.recv_buf().len() > self.config.max_request_size {
                            self.reject(slot, 413);
                        }
                        return;
                    };

                    match Head::parse(&conn.recv_buf()[..split]) {
                        Ok(head) => {
                            conn.consume_recv(split + 4);
                            conn.set_keep_alive(head.keep_alive());
                            conn.set_head(head);
                            conn.set_state(ConnState::ReadingBody);
                        }
                        Err(e) => {
                            debug!(worker = self.id, error = %e, "rejecting request");
                            self.reject(slot, 400);
                            return;
                        }
                    }
                }
                ConnState::ReadingBody => {
                    let framing = conn.head().map(Head::framing).unwrap_or(BodyFraming::None);

                    match framing {
                        BodyFraming::None => {
                            self.dispatch(slot, Vec::new());
                        }
                        BodyFraming::ContentLength(length) => {
                            if length > self.config.max_request_size {
                                self.reject(slot, 413);
                                return;
                            }
                            if conn.recv_buf().len() < length {
                                return;
                            }

                            let body = conn.recv_buf()[..length].to_vec();
                            conn.consume_recv(length);
                            self.dispatch(slot, body);
                        }
                        BodyFraming::Chunked => match chunked::decode(conn.recv_buf()) {
                            Ok(Some(decoded)) => {
                                if decoded.body.len() > self.config.max_request_size {
                                    self.reject(slot, 413);
                                    return;
                                }
                                conn.consume_recv(decoded.consumed);

                                let Some(mut head) = conn.take_head() else {
                                    self.close_connection(slot);
                                    return;
                                };
                                if head.absorb_trailers(decoded.trailers).is_err() {
                                    self.reject(slot, 400);
                                    return;
                                }
                                conn.set_head(head);
                                self.dispatch(slot, decoded.body);
                            }
                            Ok(None) => {
                                if conn.recv_buf().len() > self.config.max_request_size {
                                    self.reject(slot, 413);
                                }
                                return;
                            }
                            Err(e) => {
                                debug!(worker = self.id, error = %e, "bad chunked framing");
                                self.reject(slot, 400);
                                return;
                            }
                        },
                    }
                }
                // serial keep-alive: buffered bytes wait until the current
                // response has fully left
                ConnState::Processing | ConnState::Writing | ConnState::Closed => return,
            }
        }
    }

    /// Assembles the request, invokes the user callback and queues the
    /// response.
    fn dispatch(&mut self, slot: usize, body: Vec<u8>) {
        let head = {
            let Some(conn) = self.pool.get_mut(slot) else {
                return;
            };
            let Some(head) = conn.take_head() else {
                self.close_connection(slot);
                return;
            };
            conn.set_state(ConnState::Processing);
            head
        };
        let method = head.method;
        let version = head.version;

        let response = match Request::assemble(head, body) {
            Ok(request) => {
                let handler = Arc::clone(&self.handler);
                match catch_unwind(AssertUnwindSafe(|| handler(&request))) {
                    Ok(response) => response,
                    Err(_) => {
                        error!(worker = self.id, "handler panicked");
                        if let Some(conn) = self.pool.get_mut(slot) {
                            conn.defer_close();
                        }
                        Response::new(500).body("handler error")
                    }
                }
            }
            Err(e) => {
                debug!(worker = self.id, error = %e, "request enrichment failed");
                if let Some(conn) = self.pool.get_mut(slot) {
                    conn.defer_close();
                }
                Response::new(400).body("bad request")
            }
        };

        self.write_response(slot, response, method, version);
    }

    /// Finalizes keep-alive headers, serializes and starts flushing.
    fn write_response(
        &mut self,
        slot: usize,
        mut response: Response,
        method: Method,
        version: Version,
    ) {
        let enable_keep_alive = self.config.enable_keep_alive;
        let keep_alive_max = self.config.keep_alive_max_requests;
        let draining = self.draining.is_some();
        let opts = WriteOptions {
            chunk_size: self.config.buffer_size,
            buffer_size: self.config.buffer_size,
            head_only: method == Method::Head,
        };

        let Some(conn) = self.pool.get_mut(slot) else {
            return;
        };

        let response_close = response
            .headers()
            .get_all("Connection")
            .iter()
            .any(|v| v.to_ascii_lowercase().contains("close"));

        let keep_alive = conn.keep_alive()
            && !response_close
            && enable_keep_alive
            && conn.requests_served() + 1 < keep_alive_max
            && !draining
            && !conn.saw_eof()
            && !conn.closes_after_write();

        if !keep_alive {
            response.headers_mut().set("Connection", "close");
            conn.defer_close();
        } else if version == Version::H1_0 {
            response.headers_mut().set("Connection", "keep-alive");
        }

        conn.set_keep_alive(keep_alive);
        conn.set_state(ConnState::Writing);

        if let Err(e) = response.write_to(conn.send_buf_mut(), version, &opts) {
            // only a body producer can fail mid-serialization
            warn!(worker = self.id, error = %e, "response serialization failed");
            self.close_connection(slot);
            return;
        }

        self.flush_connection(slot);
    }

    /// Pushes queued response bytes out; the remainder carries over to the
    /// next writable tick.
    fn flush_connection(&mut self, slot: usize) {
        let Some(conn) = self.pool.get_mut(slot) else {
            return;
        };
        if conn.state() == ConnState::Closed {
            return;
        }

        if let Err(e) = conn.flush() {
            debug!(worker = self.id, error = %e, "write failed");
            self.close_connection(slot);
            return;
        }

        let Some(conn) = self.pool.get_mut(slot) else {
            return;
        };
        if conn.has_pending_write() {
            let interest = Interest::READABLE | Interest::WRITABLE;
            let registered =
                self.poll
                    .registry()
                    .reregister(conn.stream_mut(), Token(slot), interest);
            if registered.is_err() {
                self.close_connection(slot);
            }
        } else if conn.state() == ConnState::Writing {
            self.finish_exchange(slot);
        } else if conn.closes_after_write() {
            self.close_connection(slot);
        }
    }

    /// The response fully left the socket: recycle for keep-alive or close.
    fn finish_exchange(&mut self, slot: usize) {
        self.requests_served += 1;

        let Some(conn) = self.pool.get_mut(slot) else {
            return;
        };
        conn.mark_request_served();

        if !conn.keep_alive() || conn.closes_after_write() {
            self.close_connection(slot);
            return;
        }

        conn.reset_for_next_request();
        let restored =
            self.poll
                .registry()
                .reregister(conn.stream_mut(), Token(slot), Interest::READABLE);
        if restored.is_err() {
            self.close_connection(slot);
            return;
        }

        self.arm_keep_alive_deadline(slot);
        // the client may have buffered its next request already
        self.advance(slot);
    }

    /// Emits a policy response (400/413) and closes once it is flushed.
    fn reject(&mut self, slot: usize, status: u16) {
        let Some(conn) = self.pool.get_mut(slot) else {
            return;
        };
        conn.defer_close();

        let body = parser::h1::response::reason_phrase(status).to_string();
        let response = Response::new(status).body(body);
        self.write_response(slot, response, Method::Get, Version::H1_1);
    }

    fn close_connection(&mut self, slot: usize) {
        if let Some(mut conn) = self.pool.remove(slot) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            conn.mark_closed();
            let id = conn.id();
            drop(conn);
            self.notify_closed(id);
        }
    }

    fn close_all(&mut self) {
        for slot in self.pool.slots() {
            self.close_connection(slot);
        }
        self.flush_pending_notices();
    }

    /// At least once per second, evict timed-out connections. A connection
    /// that never saw a response byte gets a best-effort 408 first.
    fn sweep_if_due(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;

        for mut conn in self.pool.remove_timed_out(now) {
            let _ = self.poll.registry().deregister(conn.stream_mut());

            if !conn.response_flushed() {
                let mut timeout = Response::new(408).header("Connection", "close");
                let serialized = timeout.write_buffered(
                    conn.send_buf_mut(),
                    Version::H1_1,
                    &WriteOptions::default(),
                );
                if serialized.is_ok() {
                    let _ = conn.flush();
                }
            }

            debug!(
                worker = self.id,
                connection = conn.id(),
                idle_ms = conn.idle_for(now).as_millis() as u64,
                "connection timed out"
            );
            conn.mark_closed();
            let id = conn.id();
            drop(conn);
            self.notify_closed(id);
        }
    }

    fn publish_metrics_if_due(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_metrics) < METRICS_INTERVAL {
            return;
        }
        self.last_metrics = now;

        let metrics = BTreeMap::from([
            ("connections_active".to_string(), self.pool.len() as f64),
            ("requests_served".to_string(), self.requests_served as f64),
            (
                "uptime_secs".to_string(),
                self.started.elapsed().as_secs_f64(),
            ),
        ]);
        self.send_or_queue(IpcMessage::new(IpcPayload::WorkerMetrics { metrics }));
    }

    fn begin_drain(&mut self) {
        if self.draining.is_none() {
            info!(
                worker = self.id,
                grace_secs = self.config.shutdown_grace.as_secs(),
                "draining"
            );
            self.draining = Some(Instant::now() + self.config.shutdown_grace);
        }
    }

    fn notify_closed(&mut self, connection_id: u64) {
        self.send_or_queue(IpcMessage::new(IpcPayload::ConnectionClosed {
            connection_id,
        }));
    }

    /// Sends a control message, queueing behind earlier undelivered ones so
    /// the master observes them in FIFO order.
    fn send_or_queue(&mut self, message: IpcMessage) {
        if !self.pending_notices.is_empty() {
            self.pending_notices.push_back(message);
            return;
        }

        match self.channel.send(&message) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.pending_notices.push_back(message);
            }
            Err(e) => warn!(worker = self.id, error = %e, "control send failed"),
        }
    }

    fn flush_pending_notices(&mut self) {
        while let Some(front) = self.pending_notices.front() {
            match self.channel.send(front) {
                Ok(()) => {
                    self.pending_notices.pop_front();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "control send failed");
                    self.pending_notices.clear();
                    break;
                }
            }
        }
    }

    fn arm_request_deadline(&mut self, slot: usize) {
        let timeout = self
            .config
            .request_timeout
            .min(self.config.connection_timeout);
        self.pool.arm_deadline(slot, Instant::now() + timeout);
    }

    fn arm_keep_alive_deadline(&mut self, slot: usize) {
        let timeout = self
            .config
            .keep_alive_timeout
            .min(self.config.connection_timeout);
        self.pool.arm_deadline(slot, Instant::now() + timeout);
    }
}
