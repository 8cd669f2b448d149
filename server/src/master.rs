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

//! Master accept and dispatch loop, and the worker lifecycle controller.
//!
//! The master owns the listening socket exclusively. Accepted connections
//! are placed by the configured balancer and handed off out-of-band to a
//! worker; per-worker active counts are maintained from the workers'
//! `ConnectionClosed` notices. Crashed workers are reaped and replaced with
//! backoff; TERM/INT drain the pool gracefully and USR1 swaps in a fresh
//! worker batch.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::balancer::{self, Balancer};
use crate::channel::{Channel, Received};
use crate::config::{ServerConfig, WorkerPoolConfig};
use crate::error::{Error, Result};
use crate::ipc::{unix_now, Handoff, IpcMessage, IpcPayload, WorkerId};
use crate::signal;
use crate::worker::{Handler, Worker};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);
/// Bounded re-selection before an accepted connection is refused with 503.
const HANDOFF_ATTEMPTS: usize = 3;
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// A worker alive this long resets the crash-loop backoff.
const CRASH_STREAK_RESET: Duration = Duration::from_secs(60);

const REFUSAL: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// How workers are spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// One forked process per worker, descriptors passed over the channel.
    Prefork,
    /// Single-process degraded mode: workers run as threads over the same
    /// channels. Chosen automatically where descriptor passing or fork is
    /// unavailable, and directly useful for in-process testing.
    Threaded,
}

#[derive(Debug)]
enum WorkerHandle {
    Process(Pid),
    Thread(JoinHandle<()>),
}

/// Master-side record of one worker.
#[derive(Debug)]
pub struct WorkerRecord {
    id: WorkerId,
    handle: WorkerHandle,
    channel: Channel,
    active: usize,
    ready: bool,
    started: Instant,
    restarts: u32,
    retiring: bool,
    metrics: BTreeMap<String, f64>,
}

impl WorkerRecord {
    /// Worker id, stable for the worker's lifetime.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Connections currently assigned to this worker, as the master sees
    /// them.
    pub fn active(&self) -> usize {
        self.active
    }

    /// Whether the worker has reported readiness.
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// How many predecessors this worker has replaced.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Latest statistics published by the worker.
    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }
}

/// The master process: exclusive owner of the listening socket, dispatcher
/// of accepted connections, supervisor of the worker pool.
pub struct Master {
    config: ServerConfig,
    pool_config: WorkerPoolConfig,
    handler: Handler,
    listener: TcpListener,
    local_addr: SocketAddr,
    poll: Poll,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    balancer: Box<dyn Balancer>,
    next_worker_id: WorkerId,
    next_connection_id: u64,
    mode: SpawnMode,
    pending_spawns: Vec<(Instant, u32)>,
    crash_streak: u32,
    accept_backlog: bool,
}

impl fmt::Debug for Master {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Master")
            .field("addr", &self.local_addr)
            .field("mode", &self.mode)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Master {
    /// Validates configuration and binds the listening socket. Fatal errors
    /// here mean the server refuses to run.
    pub fn bind(
        config: ServerConfig,
        pool_config: WorkerPoolConfig,
        handler: Handler,
    ) -> Result<Self> {
        config.validate()?;
        pool_config.validate()?;

        let addr = SocketAddr::new(
            config
                .host
                .parse()
                .map_err(|_| Error::Config(format!("invalid host '{}'", config.host)))?,
            config.port,
        );

        let listener = bind_listener(addr, pool_config.backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mode = if Channel::supports_descriptor_passing() {
            SpawnMode::Prefork
        } else {
            warn!("descriptor passing unavailable; running single-process");
            SpawnMode::Threaded
        };

        let balancer = balancer::for_kind(pool_config.balancer);

        Ok(Master {
            config,
            pool_config,
            handler,
            listener,
            local_addr,
            poll,
            workers: BTreeMap::new(),
            balancer,
            next_worker_id: 1,
            next_connection_id: 1,
            mode,
            pending_spawns: Vec::new(),
            crash_streak: 0,
            accept_backlog: false,
        })
    }

    /// The bound listener address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Overrides the spawn mode before [`Master::run`]. Threaded mode keeps
    /// every worker in-process, which is also what the integration tests
    /// drive.
    pub fn set_spawn_mode(&mut self, mode: SpawnMode) {
        self.mode = mode;
    }

    /// Sum of per-worker active counts, equal to the live connections
    /// system-wide once all `ConnectionClosed` notices are drained.
    pub fn total_active(&self) -> usize {
        self.workers.values().map(|r| r.active).sum()
    }

    /// Iterates over the current worker records.
    pub fn worker_records(&self) -> impl Iterator<Item = &WorkerRecord> + '_ {
        self.workers.values()
    }

    /// Runs the master loop: accept, dispatch, drain worker channels, reap
    /// and restart, until a shutdown signal arrives.
    pub fn run(&mut self) -> Result<()> {
        signal::install_master()?;
        self.spawn_initial()?;
        info!(
            addr = %self.local_addr,
            workers = self.workers.len(),
            mode = ?self.mode,
            "master running"
        );

        let mut events = Events::with_capacity(1024);
        loop {
            if signal::shutdown_requested() {
                return self.shutdown();
            }
            if signal::take_reload() {
                self.reload();
            }
            if signal::take_child_exit() {
                self.reap();
            }
            self.run_pending_spawns();

            // readiness is edge-triggered; a capped cycle resumes here
            if self.accept_backlog {
                self.accept_cycle();
            }

            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_cycle(),
                    Token(id) => self.drain_worker_channel(id as WorkerId),
                }
            }

            self.reap();
        }
    }

    fn spawn_initial(&mut self) -> Result<()> {
        for _ in 0..self.pool_config.effective_worker_count() {
            self.spawn_worker(0)?;
        }
        Ok(())
    }

    /// Starts one worker, forked or threaded. A fork failure on the very
    /// first worker degrades the whole pool to single-process mode instead
    /// of failing startup.
    fn spawn_worker(&mut self, restarts: u32) -> Result<WorkerId> {
        let id = self.next_worker_id;
        self.next_worker_id += 1;

        let (master_end, worker_end) = Channel::pair().map_err(Error::Channel)?;

        let handle = match self.mode {
            SpawnMode::Prefork => {
                // SAFETY: the child re-executes nothing; it sheds inherited
                // descriptors and enters the worker loop immediately
                match unsafe { fork() } {
                    Ok(ForkResult::Child) => {
                        // the worker closes the master's end of its own pair
                        let _ = nix::unistd::close(master_end.as_raw_fd());
                        self.run_forked_child(id, worker_end);
                    }
                    Ok(ForkResult::Parent { child }) => {
                        drop(worker_end);
                        WorkerHandle::Process(child)
                    }
                    Err(errno) => {
                        if self.workers.is_empty() {
                            warn!(error = %errno, "fork unavailable; degrading to single-process");
                            self.mode = SpawnMode::Threaded;
                            self.spawn_thread(id, worker_end)?
                        } else {
                            return Err(Error::Spawn {
                                id,
                                reason: errno.to_string(),
                            });
                        }
                    }
                }
            }
            SpawnMode::Threaded => self.spawn_thread(id, worker_end)?,
        };

        self.poll.registry().register(
            &mut SourceFd(&master_end.as_raw_fd()),
            Token(id as usize),
            Interest::READABLE,
        )?;

        self.workers.insert(
            id,
            WorkerRecord {
                id,
                handle,
                channel: master_end,
                active: 0,
                ready: false,
                started: Instant::now(),
                restarts,
                retiring: false,
                metrics: BTreeMap::new(),
            },
        );

        info!(worker = id, mode = ?self.mode, "worker spawned");
        Ok(id)
    }

    /// Child-side continuation of fork. Never returns.
    fn run_forked_child(&mut self, id: WorkerId, worker_end: Channel) -> ! {
        let _ = nix::unistd::close(self.listener.as_raw_fd());
        for record in self.workers.values() {
            let _ = nix::unistd::close(record.channel.as_raw_fd());
        }

        let code = match signal::install_worker() {
            Ok(()) => {
                match Worker::new(
                    id,
                    worker_end,
                    Arc::clone(&self.handler),
                    self.config.clone(),
                ) {
                    Ok(mut worker) => match worker.run() {
                        Ok(()) => 0,
                        Err(e) => {
                            error!(worker = id, error = %e, "worker loop failed");
                            1
                        }
                    },
                    Err(e) => {
                        error!(worker = id, error = %e, "worker init failed");
                        1
                    }
                }
            }
            Err(e) => {
                error!(worker = id, error = %e, "worker signal install failed");
                1
            }
        };
        std::process::exit(code);
    }

    fn spawn_thread(&self, id: WorkerId, worker_end: Channel) -> Result<WorkerHandle> {
        let handler = Arc::clone(&self.handler);
        let config = self.config.clone();

        let handle = std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || match Worker::new(id, worker_end, handler, config) {
                Ok(mut worker) => {
                    if let Err(e) = worker.run() {
                        error!(worker = id, error = %e, "worker loop failed");
                    }
                }
                Err(e) => error!(worker = id, error = %e, "worker init failed"),
            })
            .map_err(|e| Error::Spawn {
                id,
                reason: e.to_string(),
            })?;

        Ok(WorkerHandle::Thread(handle))
    }

    /// Accepts up to `max_accepts_per_cycle` connections and dispatches
    /// each, bounding per-tick work. Hitting the cap leaves the backlog
    /// flag set so the next tick continues without a fresh edge.
    fn accept_cycle(&mut self) {
        self.accept_backlog = false;
        for _ in 0..self.config.max_accepts_per_cycle {
            match self.listener.accept() {
                Ok((stream, remote)) => self.dispatch(stream, remote),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
        self.accept_backlog = true;
    }

    /// Places one accepted connection: balancer selection, hand-off,
    /// bounded re-selection on back-pressure, 503 on exhaustion.
    fn dispatch(&mut self, stream: TcpStream, remote: SocketAddr) {
        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;

        let selectable: BTreeMap<WorkerId, usize> = self
            .workers
            .values()
            .filter(|r| r.ready && !r.retiring)
            .map(|r| (r.id, r.active))
            .collect();

        if selectable.is_empty() {
            debug!(connection = connection_id, "no selectable worker; closing");
            return;
        }

        let mut tried: Vec<WorkerId> = Vec::with_capacity(HANDOFF_ATTEMPTS);
        for _ in 0..HANDOFF_ATTEMPTS {
            let candidates: BTreeMap<WorkerId, usize> = selectable
                .iter()
                .map(|(&id, &active)| (id, active))
                .filter(|(id, active)| {
                    !tried.contains(id) && *active < self.pool_config.max_queue_size
                })
                .collect();

            let Some(worker_id) = self.balancer.select_worker(&candidates) else {
                break;
            };
            tried.push(worker_id);

            let meta = Handoff {
                worker_id,
                connection_id,
                remote_ip: remote.ip().to_string(),
                remote_port: remote.port(),
                accepted_at: unix_now(),
            };

            let Some(record) = self.workers.get_mut(&worker_id) else {
                continue;
            };
            match record.channel.send_handoff(&meta, stream.as_raw_fd()) {
                Ok(()) => {
                    record.active += 1;
                    self.balancer.on_connection_established(worker_id);
                    debug!(
                        connection = connection_id,
                        worker = worker_id,
                        remote = %remote,
                        "connection dispatched"
                    );
                    return;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    debug!(worker = worker_id, "hand-off would block; re-selecting");
                }
                Err(e) => {
                    warn!(worker = worker_id, error = %e, "hand-off failed; re-selecting");
                }
            }
        }

        warn!(connection = connection_id, "no worker took the connection");
        refuse(stream);
    }

    /// Drains a worker's control channel and folds its messages into the
    /// master state.
    fn drain_worker_channel(&mut self, id: WorkerId) {
        loop {
            let received = match self.workers.get(&id) {
                Some(record) => record.channel.recv(),
                None => return,
            };

            match received {
                Ok(Received::Control(message)) => self.on_worker_message(id, message),
                Ok(Received::Handoff(meta, _fd)) => {
                    warn!(worker = id, ?meta, "unexpected hand-off from worker");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(_) => {
                    // endpoint gone: the worker exited; reap decides whether
                    // a replacement is due
                    self.worker_exited(id);
                    return;
                }
            }
        }
    }

    fn on_worker_message(&mut self, id: WorkerId, message: IpcMessage) {
        match message.payload {
            IpcPayload::WorkerReady { worker_id } => {
                if let Some(record) = self.workers.get_mut(&id) {
                    record.ready = true;
                }
                info!(worker = worker_id, "worker ready");
            }
            IpcPayload::ConnectionClosed { connection_id } => {
                if let Some(record) = self.workers.get_mut(&id) {
                    record.active = record.active.saturating_sub(1);
                }
                self.balancer.on_connection_closed(id);
                debug!(worker = id, connection = connection_id, "connection closed");
            }
            IpcPayload::WorkerMetrics { metrics } => {
                if let Some(record) = self.workers.get_mut(&id) {
                    record.metrics = metrics;
                }
            }
            other => debug!(worker = id, ?other, "unexpected worker message"),
        }
    }

    /// Collects exited children and finished worker threads.
    fn reap(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    debug!(pid = pid.as_raw(), code, "child exited");
                    if let Some(id) = self.worker_by_pid(pid) {
                        self.worker_exited(id);
                    }
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    warn!(pid = pid.as_raw(), signal = %sig, "child killed");
                    if let Some(id) = self.worker_by_pid(pid) {
                        self.worker_exited(id);
                    }
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => break,
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    warn!(error = %errno, "waitpid failed");
                    break;
                }
            }
        }

        let finished: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, r)| matches!(&r.handle, WorkerHandle::Thread(h) if h.is_finished()))
            .map(|(&id, _)| id)
            .collect();
        for id in finished {
            self.worker_exited(id);
        }
    }

    fn worker_by_pid(&self, pid: Pid) -> Option<WorkerId> {
        self.workers
            .iter()
            .find(|(_, r)| matches!(r.handle, WorkerHandle::Process(p) if p == pid))
            .map(|(&id, _)| id)
    }

    /// Resets the dead worker's record: balancer counts are released and a
    /// replacement is scheduled unless the worker was retiring.
    fn worker_exited(&mut self, id: WorkerId) {
        let Some(record) = self.workers.remove(&id) else {
            return;
        };
        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&record.channel.as_raw_fd()));

        for _ in 0..record.active {
            self.balancer.on_connection_closed(id);
        }

        if record.retiring {
            info!(worker = id, "worker retired");
            return;
        }

        warn!(worker = id, restarts = record.restarts, "worker died unexpectedly");
        if !self.pool_config.auto_restart {
            return;
        }

        if record.started.elapsed() >= CRASH_STREAK_RESET {
            self.crash_streak = 0;
        }
        self.crash_streak += 1;

        let delay = self.restart_delay();
        debug!(delay_ms = delay.as_millis() as u64, "restart scheduled");
        self.pending_spawns
            .push((Instant::now() + delay, record.restarts + 1));
    }

    /// Exponential backoff with jitter over the configured restart delay,
    /// capped so a crash-looping pool cannot starve itself forever.
    fn restart_delay(&self) -> Duration {
        let exponent = self.crash_streak.saturating_sub(1).min(5);
        let scaled = self
            .pool_config
            .restart_delay
            .saturating_mul(1u32 << exponent)
            .min(RESTART_BACKOFF_CAP);

        let jitter_ceiling = (scaled.as_millis() as u64 / 4).max(1);
        scaled + Duration::from_millis(rand::rng().random_range(0..jitter_ceiling))
    }

    fn run_pending_spawns(&mut self) {
        let now = Instant::now();
        let due: Vec<u32> = {
            let (ready, later): (Vec<_>, Vec<_>) =
                self.pending_spawns.drain(..).partition(|(at, _)| *at <= now);
            self.pending_spawns = later;
            ready.into_iter().map(|(_, restarts)| restarts).collect()
        };

        for restarts in due {
            if let Err(e) = self.spawn_worker(restarts) {
                error!(error = %e, "respawn failed; rescheduling");
                self.pending_spawns
                    .push((Instant::now() + self.restart_delay(), restarts));
            }
        }
    }

    /// Graceful shutdown: stop accepting, ask every worker to drain, wait
    /// out the grace period, then hard-terminate stragglers.
    fn shutdown(&mut self) -> Result<()> {
        info!("graceful shutdown");
        let _ = self.poll.registry().deregister(&mut self.listener);

        let message = IpcMessage::new(IpcPayload::Shutdown {});
        for record in self.workers.values_mut() {
            record.retiring = true;
            let _ = record.channel.send(&message);
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        let mut events = Events::with_capacity(256);
        while !self.workers.is_empty() && Instant::now() < deadline {
            if self.poll.poll(&mut events, Some(POLL_TIMEOUT)).is_ok() {
                for event in events.iter() {
                    if event.token() != LISTENER_TOKEN {
                        let Token(id) = event.token();
                        self.drain_worker_channel(id as WorkerId);
                    }
                }
            }
            self.reap();
        }

        for (id, record) in std::mem::take(&mut self.workers) {
            match record.handle {
                WorkerHandle::Process(pid) => {
                    warn!(worker = id, "worker missed the drain deadline; killing");
                    let _ = kill(pid, Signal::SIGKILL);
                    let _ = waitpid(pid, None);
                }
                WorkerHandle::Thread(_) => {
                    warn!(worker = id, "worker thread still draining at exit");
                }
            }
        }

        info!("shutdown complete");
        Ok(())
    }

    /// Graceful reload: spawn a fresh batch, wait for its readiness, then
    /// retire the old batch so in-flight requests finish on old workers.
    fn reload(&mut self) {
        info!("graceful reload");
        let old: Vec<WorkerId> = self.workers.keys().copied().collect();

        let mut fresh = Vec::new();
        for _ in 0..self.pool_config.effective_worker_count() {
            match self.spawn_worker(0) {
                Ok(id) => fresh.push(id),
                Err(e) => {
                    error!(error = %e, "reload aborted; retiring the fresh batch");
                    let message = IpcMessage::new(IpcPayload::Shutdown {});
                    for id in &fresh {
                        if let Some(record) = self.workers.get_mut(id) {
                            record.retiring = true;
                            let _ = record.channel.send(&message);
                        }
                    }
                    return;
                }
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        let mut events = Events::with_capacity(256);
        while Instant::now() < deadline && !self.batch_ready(&fresh) {
            if self.poll.poll(&mut events, Some(POLL_TIMEOUT)).is_ok() {
                for event in events.iter() {
                    if event.token() != LISTENER_TOKEN {
                        let Token(id) = event.token();
                        self.drain_worker_channel(id as WorkerId);
                    }
                }
            }
            self.reap();
        }

        let message = IpcMessage::new(IpcPayload::Shutdown {});
        for id in old {
            if let Some(record) = self.workers.get_mut(&id) {
                record.retiring = true;
                let _ = record.channel.send(&message);
            }
        }
        self.balancer.reset();
        info!(workers = fresh.len(), "reload complete");
    }

    fn batch_ready(&self, batch: &[WorkerId]) -> bool {
        batch
            .iter()
            .all(|id| self.workers.get(id).is_some_and(|r| r.ready))
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener> {
    let bind_err = |source: std::io::Error| Error::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(backlog as i32).map_err(bind_err)?;

    Ok(socket.into())
}

/// Best-effort 503 before the descriptor is closed.
fn refuse(mut stream: TcpStream) {
    let _ = stream.write(REFUSAL);
}
