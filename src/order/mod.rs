//! Deterministic block traversal order for the backward solver.
//!
//! The solver converges fastest when a block is processed after its
//! successors, so the base ordering visits exit blocks first, then any
//! block all of whose successors have been placed. Cycles have no such
//! block; a tie-breaking heuristic seeds them from the side nearest the
//! exits. The ordering exists for performance and determinism only;
//! fixpoint correctness never depends on it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::VecDeque;

use crate::graph::CfgIndex;

/// Compute the base ordering: a vector of block indices, exit blocks
/// first.
///
/// When only cycle members remain, the tie-breaker picks, among blocks
/// with at least one placed successor, the one with the most placed
/// successors, then flood-fills forward from the sorted candidates so
/// that SCC-internal predecessors are not re-selected first. A cycle
/// with no placed-successor seed at all indicates an infinite loop in
/// the generated CFG: fatal when `assertions` is set, otherwise broken
/// arbitrarily (lowest unplaced index) so release builds keep going.
pub fn compute_traversal_order(cfg: &CfgIndex, assertions: bool) -> Vec<usize> {
    let num_blocks = cfg.num_blocks();

    let mut ordering = Vec::with_capacity(num_blocks);
    let mut added = vec![false; num_blocks];
    let mut num_successors_added = vec![0usize; num_blocks];

    for idx in 0..num_blocks {
        if cfg.successors[idx].is_empty() {
            ordering.push(idx);
            added[idx] = true;
        }
    }

    let mut check_predecessors_idx = 0;
    while ordering.len() < num_blocks {
        if check_predecessors_idx < ordering.len() {
            // Blocks whose successors have all been placed.
            let idx = ordering[check_predecessors_idx];
            check_predecessors_idx += 1;

            for &pidx in &cfg.predecessors[idx] {
                if added[pidx] {
                    continue;
                }
                num_successors_added[pidx] += 1;
                if num_successors_added[pidx] == cfg.successors[pidx].len() {
                    ordering.push(pidx);
                    added[pidx] = true;
                }
            }
        } else {
            // Hit a cycle. Seed it from the candidate blocks that already
            // have placed successors, most-placed first.
            let mut candidates: Vec<(usize, usize)> = (0..num_blocks)
                .filter(|&i| !added[i] && num_successors_added[i] > 0)
                .map(|i| (i, num_successors_added[i]))
                .collect();
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            let mut visited = vec![false; num_blocks];
            let mut visit_queue = VecDeque::new();
            let mut best = None;

            for &(idx, _) in &candidates {
                if visited[idx] {
                    continue;
                }
                best = Some(idx);
                visited[idx] = true;
                visit_queue.push_back(idx);

                while let Some(at) = visit_queue.pop_front() {
                    for &sidx in &cfg.successors[at] {
                        if !visited[sidx] {
                            visited[sidx] = true;
                            visit_queue.push_back(sidx);
                        }
                    }
                }
            }

            let best = match best {
                Some(b) => b,
                None => {
                    // No block in the remaining region can reach an exit.
                    assert!(
                        !assertions,
                        "CFG contains a cycle with no exit-reachable seed",
                    );
                    debug_assert!(false, "CFG contains a cycle with no exit-reachable seed");
                    (0..num_blocks)
                        .find(|&i| !added[i])
                        .expect("unplaced block must exist while ordering is incomplete")
                }
            };
            ordering.push(best);
            added[best] = true;
        }
    }

    debug_assert_eq!(ordering.len(), num_blocks);
    ordering
}

/// Priority worklist over blocks.
///
/// Wraps a min-heap keyed on the base-ordering position of each block, so
/// re-enqueued blocks pop in the same order on every run. Adding a block
/// already queued is a no-op.
pub struct BlockOrderer {
    /// Heap priority per block; lower pops first.
    priority: Vec<usize>,
    in_queue: Vec<bool>,
    queue: BinaryHeap<Reverse<(usize, usize)>>,
}

impl BlockOrderer {
    /// Build from a base ordering (position → block index).
    pub fn new(order: &[usize]) -> Self {
        let mut priority = vec![0usize; order.len()];
        for (pos, &idx) in order.iter().enumerate() {
            priority[idx] = pos;
        }
        Self {
            priority,
            in_queue: vec![false; order.len()],
            queue: BinaryHeap::new(),
        }
    }

    /// Enqueue a block for (re)processing.
    pub fn add(&mut self, idx: usize) {
        if self.in_queue[idx] {
            return;
        }
        self.in_queue[idx] = true;
        self.queue.push(Reverse((self.priority[idx], idx)));
    }

    /// Pop the lowest-priority block, or `None` when the worklist is
    /// drained.
    pub fn pop(&mut self) -> Option<usize> {
        let Reverse((_, idx)) = self.queue.pop()?;
        debug_assert!(self.in_queue[idx]);
        self.in_queue[idx] = false;
        Some(idx)
    }
}

#[cfg(test)]
mod tests;
