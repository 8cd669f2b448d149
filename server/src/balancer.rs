//! Worker selection policies.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use rand::seq::IteratorRandom;
use tracing::info;

use crate::config::BalancerKind;
use crate::ipc::WorkerId;

/// Selects the worker for a newly accepted connection.
///
/// `active` maps every currently selectable worker to its active-connection
/// count as the master tracks it. Implementations return `None` on an empty
/// input and must tolerate the worker set changing shape between calls.
pub trait Balancer: Debug + Send {
    /// Picks the next worker, or `None` when no worker is selectable.
    fn select_worker(&mut self, active: &BTreeMap<WorkerId, usize>) -> Option<WorkerId>;

    /// A hand-off to `worker` succeeded.
    fn on_connection_established(&mut self, worker: WorkerId);

    /// A connection owned by `worker` closed.
    fn on_connection_closed(&mut self, worker: WorkerId);

    /// Drops all learned state.
    fn reset(&mut self);
}

/// Constructs the policy configured for the pool. The `weighted` policy is
/// accepted in configuration but was never given semantics, so it resolves
/// to least-connections.
pub fn for_kind(kind: BalancerKind) -> Box<dyn Balancer> {
    match kind {
        BalancerKind::RoundRobin => Box::new(RoundRobin::new()),
        BalancerKind::LeastConnections => Box::new(LeastConnections::new()),
        BalancerKind::Weighted => {
            info!("weighted balancer resolves to least_connections");
            Box::new(LeastConnections::new())
        }
    }
}

/// Stateful rotation over the worker ids in insertion order. Ignores active
/// counts; the cursor resets whenever the worker set changes shape.
#[derive(Debug, Default)]
pub struct RoundRobin {
    order: Vec<WorkerId>,
    cursor: usize,
}

impl RoundRobin {
    /// Creates a fresh rotation.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn select_worker(&mut self, active: &BTreeMap<WorkerId, usize>) -> Option<WorkerId> {
        if active.is_empty() {
            return None;
        }

        // worker ids are monotonic, so key order is insertion order
        let shape: Vec<WorkerId> = active.keys().copied().collect();
        if shape != self.order {
            self.order = shape;
            self.cursor = 0;
        }

        let selected = self.order[self.cursor % self.order.len()];
        self.cursor = (self.cursor + 1) % self.order.len();
        Some(selected)
    }

    fn on_connection_established(&mut self, _worker: WorkerId) {}

    fn on_connection_closed(&mut self, _worker: WorkerId) {}

    fn reset(&mut self) {
        self.order.clear();
        self.cursor = 0;
    }
}

/// Picks the worker with the fewest active connections, breaking ties
/// uniformly at random. Maintains its own mirror of the counts, fed by the
/// establish/close notifications.
#[derive(Debug, Default)]
pub struct LeastConnections {
    counts: HashMap<WorkerId, usize>,
}

impl LeastConnections {
    /// Creates an empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    fn count_for(&self, worker: WorkerId, observed: usize) -> usize {
        // the mirror wins once it has seen the worker; otherwise adopt the
        // master's observation
        self.counts.get(&worker).copied().unwrap_or(observed)
    }
}

impl Balancer for LeastConnections {
    fn select_worker(&mut self, active: &BTreeMap<WorkerId, usize>) -> Option<WorkerId> {
        let minimum = active
            .iter()
            .map(|(&worker, &observed)| self.count_for(worker, observed))
            .min()?;

        active
            .iter()
            .filter(|(&worker, &observed)| self.count_for(worker, observed) == minimum)
            .map(|(&worker, _)| worker)
            .choose(&mut rand::rng())
    }

    fn on_connection_established(&mut self, worker: WorkerId) {
        *self.counts.entry(worker).or_insert(0) += 1;
    }

    fn on_connection_closed(&mut self, worker: WorkerId) {
        if let Some(count) = self.counts.get_mut(&worker) {
            *count = count.saturating_sub(1);
        }
    }

    fn reset(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn active(pairs: &[(WorkerId, usize)]) -> BTreeMap<WorkerId, usize> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn round_robin_covers_each_worker_once_per_rotation() {
        let mut rr = RoundRobin::new();
        let workers = active(&[(1, 0), (2, 0), (3, 0)]);

        let first_cycle: Vec<WorkerId> = (0..3)
            .map(|_| rr.select_worker(&workers).unwrap())
            .collect();

        let mut sorted = first_cycle.clone();
        sorted.sort_unstable();
        assert_eq!(vec![1, 2, 3], sorted, "a rotation visits each worker once");
        assert_eq!(1, first_cycle[0], "rotation starts at insertion order");

        // the next rotation repeats the same order
        let second_cycle: Vec<WorkerId> = (0..3)
            .map(|_| rr.select_worker(&workers).unwrap())
            .collect();
        assert_eq!(first_cycle, second_cycle);
    }

    #[test]
    fn round_robin_resets_cursor_on_shape_change() {
        let mut rr = RoundRobin::new();
        let three = active(&[(1, 0), (2, 0), (3, 0)]);
        rr.select_worker(&three).unwrap();
        rr.select_worker(&three).unwrap();

        let grown = active(&[(1, 0), (2, 0), (3, 0), (4, 0)]);
        assert_eq!(Some(1), rr.select_worker(&grown));
    }

    #[test]
    fn round_robin_ignores_active_counts() {
        let mut rr = RoundRobin::new();
        let skewed = active(&[(1, 500), (2, 0)]);
        assert_eq!(Some(1), rr.select_worker(&skewed));
        assert_eq!(Some(2), rr.select_worker(&skewed));
    }

    #[test]
    fn least_connections_picks_the_smallest_count() {
        let mut lc = LeastConnections::new();
        assert_eq!(Some(2), lc.select_worker(&active(&[(1, 5), (2, 2), (3, 8)])));
    }

    #[test]
    fn least_connections_tracks_establish_and_close() {
        let mut lc = LeastConnections::new();
        let workers = active(&[(1, 0), (2, 0)]);

        lc.on_connection_established(1);
        lc.on_connection_established(1);
        lc.on_connection_established(2);
        assert_eq!(Some(2), lc.select_worker(&workers));

        lc.on_connection_closed(1);
        lc.on_connection_closed(1);
        assert_eq!(Some(1), lc.select_worker(&workers));
    }

    #[test]
    fn least_connections_floors_at_zero() {
        let mut lc = LeastConnections::new();
        lc.on_connection_established(1);
        lc.on_connection_closed(1);
        lc.on_connection_closed(1);
        lc.on_connection_closed(1);

        lc.on_connection_established(2);
        assert_eq!(Some(1), lc.select_worker(&active(&[(1, 0), (2, 1)])));
    }

    #[test]
    fn least_connections_ties_stay_within_the_tied_set() {
        let mut lc = LeastConnections::new();
        let workers = active(&[(1, 3), (2, 1), (3, 1)]);

        for _ in 0..50 {
            let selected = lc.select_worker(&workers).unwrap();
            assert!(selected == 2 || selected == 3);
        }
    }

    #[test]
    fn both_policies_handle_empty_input_and_reset() {
        let empty = BTreeMap::new();

        let mut rr = RoundRobin::new();
        assert_eq!(None, rr.select_worker(&empty));
        rr.select_worker(&active(&[(1, 0)]));
        rr.reset();
        assert_eq!(None, rr.select_worker(&empty));

        let mut lc = LeastConnections::new();
        assert_eq!(None, lc.select_worker(&empty));
        lc.on_connection_established(9);
        lc.reset();
        assert_eq!(None, lc.select_worker(&empty));
    }
}
