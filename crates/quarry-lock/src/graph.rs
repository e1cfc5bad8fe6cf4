//! Waits-for graph for deadlock detection.

use crate::TxnId;
use log::debug;
use parking_lot::Mutex;
use quarry_common::{QuarryError, Result};
use std::collections::{HashMap, HashSet};

/// Directed graph from waiting transactions to the transactions whose
/// locks they wait on.
///
/// The internal mutex is leaf-level: no other lock is ever taken while it
/// is held.
pub struct WaitsForGraph {
    graph: Mutex<HashMap<TxnId, Vec<TxnId>>>,
}

impl WaitsForGraph {
    pub fn new() -> Self {
        Self {
            graph: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `txn` waits on each of `owners`.
    ///
    /// If the new edges close a cycle, every edge of `txn` is removed
    /// again and the call fails with [`QuarryError::DeadlockDetected`],
    /// leaving the graph acyclic.
    pub fn add_waits_for(&self, txn: TxnId, owners: &[TxnId]) -> Result<()> {
        let mut graph = self.graph.lock();
        let edges = graph.entry(txn).or_default();
        for owner in owners {
            if *owner != txn && !edges.contains(owner) {
                edges.push(*owner);
            }
        }
        if Self::on_cycle(&graph, txn) {
            graph.remove(&txn);
            debug!("deadlock detected for transaction {txn}");
            return Err(QuarryError::DeadlockDetected);
        }
        Ok(())
    }

    /// Records that every transaction in `waiters` now also waits on
    /// `owner`, which just acquired the lock they are blocked on.
    pub fn add_waiters(&self, owner: TxnId, waiters: &[TxnId]) {
        let mut graph = self.graph.lock();
        for waiter in waiters {
            if *waiter == owner {
                continue;
            }
            let edges = graph.entry(*waiter).or_default();
            if !edges.contains(&owner) {
                edges.push(owner);
            }
        }
    }

    /// Removes every edge to and from `txn`.
    pub fn remove(&self, txn: TxnId) {
        let mut graph = self.graph.lock();
        graph.remove(&txn);
        for edges in graph.values_mut() {
            edges.retain(|t| *t != txn);
        }
    }

    /// Returns true if `start` sits on a cycle. Depth-first traversal; a
    /// node is on a cycle iff it is re-entered on the current path.
    fn on_cycle(graph: &HashMap<TxnId, Vec<TxnId>>, start: TxnId) -> bool {
        fn visit(
            graph: &HashMap<TxnId, Vec<TxnId>>,
            node: TxnId,
            visited: &mut HashSet<TxnId>,
            path: &mut HashSet<TxnId>,
        ) -> bool {
            visited.insert(node);
            path.insert(node);
            if let Some(edges) = graph.get(&node) {
                for next in edges {
                    if path.contains(next) {
                        return true;
                    }
                    if !visited.contains(next) && visit(graph, *next, visited, path) {
                        return true;
                    }
                }
            }
            path.remove(&node);
            false
        }

        let mut visited = HashSet::new();
        let mut path = HashSet::new();
        visit(graph, start, &mut visited, &mut path)
    }
}

impl Default for WaitsForGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: u64) -> TxnId {
        TxnId(id)
    }

    #[test]
    fn test_no_cycle() {
        let graph = WaitsForGraph::new();

        graph.add_waits_for(txn(1), &[txn(2)]).unwrap();
        graph.add_waits_for(txn(2), &[txn(3)]).unwrap();
        graph.add_waits_for(txn(4), &[txn(3)]).unwrap();
    }

    #[test]
    fn test_cycle_of_two() {
        let graph = WaitsForGraph::new();

        graph.add_waits_for(txn(1), &[txn(2)]).unwrap();
        assert!(matches!(
            graph.add_waits_for(txn(2), &[txn(1)]),
            Err(QuarryError::DeadlockDetected)
        ));
    }

    #[test]
    fn test_cycle_of_three() {
        let graph = WaitsForGraph::new();

        graph.add_waits_for(txn(1), &[txn(2)]).unwrap();
        graph.add_waits_for(txn(2), &[txn(3)]).unwrap();
        assert!(matches!(
            graph.add_waits_for(txn(3), &[txn(1)]),
            Err(QuarryError::DeadlockDetected)
        ));
    }

    #[test]
    fn test_failed_add_is_backed_out() {
        let graph = WaitsForGraph::new();

        graph.add_waits_for(txn(1), &[txn(2)]).unwrap();
        assert!(graph.add_waits_for(txn(2), &[txn(1)]).is_err());

        // The failed transaction's edges were erased, so the same wait
        // from the other side now succeeds once txn 1 stops waiting.
        graph.remove(txn(1));
        graph.add_waits_for(txn(2), &[txn(1)]).unwrap();
    }

    #[test]
    fn test_remove_clears_both_directions() {
        let graph = WaitsForGraph::new();

        graph.add_waits_for(txn(1), &[txn(2)]).unwrap();
        graph.add_waits_for(txn(3), &[txn(1)]).unwrap();
        graph.remove(txn(1));

        // Neither 1 -> 2 nor 3 -> 1 survive, so a full cycle through all
        // three can be rebuilt without tripping on stale edges.
        graph.add_waits_for(txn(1), &[txn(2)]).unwrap();
        graph.add_waits_for(txn(2), &[txn(3)]).unwrap();
        assert!(graph.add_waits_for(txn(3), &[txn(1)]).is_err());
    }

    #[test]
    fn test_add_waiters_creates_edges() {
        let graph = WaitsForGraph::new();

        graph.add_waiters(txn(9), &[txn(1), txn(2)]);

        // Both waiters now point at txn 9: closing the loop from 9 fails.
        assert!(matches!(
            graph.add_waits_for(txn(9), &[txn(1)]),
            Err(QuarryError::DeadlockDetected)
        ));
    }

    #[test]
    fn test_self_edges_are_ignored() {
        let graph = WaitsForGraph::new();

        graph.add_waits_for(txn(1), &[txn(1)]).unwrap();
        graph.add_waiters(txn(1), &[txn(1)]);
    }

    #[test]
    fn test_duplicate_edges_are_deduplicated() {
        let graph = WaitsForGraph::new();

        graph.add_waits_for(txn(1), &[txn(2), txn(2)]).unwrap();
        graph.add_waits_for(txn(1), &[txn(2)]).unwrap();
        graph.remove(txn(2));
        graph.add_waits_for(txn(2), &[txn(1)]).unwrap();
    }
}
