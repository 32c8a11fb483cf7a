//! Dense index over a function's control-flow graph.
//!
//! Built once per function before the solver runs and immutable while it
//! iterates; critical-edge splitting happens only in the final mutator
//! phase, which works against the live function instead.

use smallvec::SmallVec;

use crate::ir::{BlockId, Function};

/// Predecessor/successor index, keyed by block index.
///
/// Block IDs are already dense (`BlockId::index()` is the arena index),
/// so the block↔index bijection is the identity. Edge order mirrors the
/// order successors appear in each terminator, and predecessors are
/// recorded in ascending block order, both stable across runs.
pub struct CfgIndex {
    /// Incoming edges per block, one entry per edge.
    pub predecessors: Vec<SmallVec<[usize; 4]>>,
    /// Outgoing edges per block, one entry per edge.
    pub successors: Vec<SmallVec<[usize; 4]>>,
}

impl CfgIndex {
    /// Build the index for a function.
    pub fn build(func: &Function) -> Self {
        let num_blocks = func.num_blocks();
        let mut predecessors: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); num_blocks];
        let mut successors: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); num_blocks];

        for idx in 0..num_blocks {
            for succ in func.successors_of(BlockId::new(idx as u32)) {
                successors[idx].push(succ.index());
                predecessors[succ.index()].push(idx);
            }
        }

        Self {
            predecessors,
            successors,
        }
    }

    /// Number of blocks indexed.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.successors.len()
    }
}
