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

//! Bounded per-worker connection pool.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;

use slab::Slab;
use tracing::warn;

use crate::connection::Connection;

/// Outcome of [`ConnectionPool::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored under this slot; the slot doubles as the poll token.
    Added(usize),
    /// Refused: the pool was full or mid-mutation. The connection was
    /// dropped, closing its descriptor.
    Refused,
}

/// Bounded set of live connections with descriptor and remote-address
/// indexes.
///
/// Mutation is guarded against reentrancy: an `add` arriving while a
/// mutation is in progress closes the new connection, a `remove` is a
/// silent no-op. The timeout sweep itself runs two-phase (expired slots
/// collected under the gate, removed after it clears) so a close path can
/// never invalidate the iteration that discovered it.
#[derive(Debug)]
pub struct ConnectionPool {
    max: usize,
    conns: Slab<Connection>,
    by_fd: HashMap<RawFd, usize>,
    by_addr: HashMap<SocketAddr, usize>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    modifying: bool,
}

impl ConnectionPool {
    /// Creates a pool bounded to `max` live connections.
    pub fn new(max: usize) -> Self {
        ConnectionPool {
            max,
            conns: Slab::with_capacity(max.min(1024)),
            by_fd: HashMap::new(),
            by_addr: HashMap::new(),
            deadlines: BinaryHeap::new(),
            modifying: false,
        }
    }

    /// Live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Capacity bound.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Adopts a connection. Refusal drops it, which releases the
    /// descriptor.
    pub fn add(&mut self, conn: Connection) -> AddOutcome {
        if self.modifying {
            warn!(id = conn.id(), "connection refused during pool mutation");
            return AddOutcome::Refused;
        }
        if self.conns.len() >= self.max {
            warn!(id = conn.id(), max = self.max, "connection pool full");
            return AddOutcome::Refused;
        }

        let fd = conn.fd();
        let addr = conn.remote();
        let slot = self.conns.insert(conn);
        self.by_fd.insert(fd, slot);
        // best-effort index: the latest connection from an address wins
        self.by_addr.insert(addr, slot);

        AddOutcome::Added(slot)
    }

    /// Removes and returns the connection at `slot`. Idempotent; a silent
    /// no-op while a mutation is in progress.
    pub fn remove(&mut self, slot: usize) -> Option<Connection> {
        if self.modifying || !self.conns.contains(slot) {
            return None;
        }

        let conn = self.conns.remove(slot);
        self.by_fd.remove(&conn.fd());
        if self.by_addr.get(&conn.remote()) == Some(&slot) {
            self.by_addr.remove(&conn.remote());
        }

        Some(conn)
    }

    /// Borrows the connection at `slot`.
    pub fn get(&self, slot: usize) -> Option<&Connection> {
        self.conns.get(slot)
    }

    /// Mutably borrows the connection at `slot`.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.conns.get_mut(slot)
    }

    /// Looks a connection up by descriptor identity.
    pub fn get_by_fd(&self, fd: RawFd) -> Option<&Connection> {
        self.by_fd.get(&fd).and_then(|&slot| self.conns.get(slot))
    }

    /// Looks a connection up by remote address; last add wins.
    pub fn get_by_addr(&self, addr: SocketAddr) -> Option<&Connection> {
        self.by_addr
            .get(&addr)
            .and_then(|&slot| self.conns.get(slot))
    }

    /// Snapshot of the occupied slots, for iteration that may mutate.
    pub fn slots(&self) -> Vec<usize> {
        self.conns.iter().map(|(slot, _)| slot).collect()
    }

    /// Arms the timeout deadline for `slot`. Earlier arms become stale heap
    /// entries, discarded lazily by the sweep.
    pub fn arm_deadline(&mut self, slot: usize, at: Instant) {
        if let Some(conn) = self.conns.get_mut(slot) {
            let seq = conn.arm_deadline(at);
            self.deadlines.push(Reverse((at, seq, slot)));
        }
    }

    /// The earliest armed deadline still current, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((at, seq, slot))) = self.deadlines.peek() {
            let current = self
                .conns
                .get(slot)
                .is_some_and(|conn| conn.deadline() == (at, seq));
            if current {
                return Some(at);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Removes every connection whose armed deadline has passed, returning
    /// them for the caller to close and report.
    pub fn remove_timed_out(&mut self, now: Instant) -> Vec<Connection> {
        if self.modifying {
            return Vec::new();
        }

        // phase one: collect expired slots under the gate
        self.modifying = true;
        let mut expired = Vec::new();
        while let Some(&Reverse((at, seq, slot))) = self.deadlines.peek() {
            if at > now {
                break;
            }
            self.deadlines.pop();

            let current = self
                .conns
                .get(slot)
                .is_some_and(|conn| conn.deadline() == (at, seq));
            if current {
                expired.push(slot);
            }
        }
        self.modifying = false;

        // phase two: apply removals
        expired
            .into_iter()
            .filter_map(|slot| self.remove(slot))
            .collect()
    }
}
