//! Backward refcount dataflow solver.
//!
//! For every block, working from its successors' summaries, the solver
//! computes how many live references each tracked value needs at the top
//! of the block, and records the increments, decrements, and
//! exception-path cleanups required to make that true. "Starting" and
//! "ending" name positions in the backward scan: `starting_refs` is what
//! the block inherits (the refstate at its *end*), `ending_refs` what it
//! demands from its predecessors (the refstate at its *top*).
//!
//! The iteration is a worklist fixpoint: a block whose ending refs change
//! re-enqueues its predecessors, in the deterministic order the
//! [`BlockOrderer`] provides. Counts are bounded above by structural uses
//! plus births and the merge rule is monotone, so the fixpoint always
//! exists; an iteration cap guards against bugs all the same.
//!
//! Nothing is mutated here; the output is a [`RefcountPlan`] the CFG
//! mutator materializes afterwards.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::annot::{RefcountAnnotations, RefType};
use crate::graph::CfgIndex;
use crate::ir::{BlockId, Function, InstId, InstKind, ValueId, ValueKind};
use crate::order::{compute_traversal_order, BlockOrderer};
use crate::runtime;

// Ordered ref map

/// Insertion-ordered map from value to reference count.
///
/// Iteration order is the order keys first appeared, which is what makes
/// every downstream artifact (merge order, fixup multisets, yield
/// argument lists) deterministic. Lookups are linear; the maps stay small
/// (a handful of live values per block).
#[derive(Clone, Debug, Default)]
pub struct RefMap {
    entries: Vec<(ValueId, u32)>,
}

impl RefMap {
    /// The count for `v`, zero if absent.
    pub fn get(&self, v: ValueId) -> u32 {
        self.entries
            .iter()
            .find(|&&(k, _)| k == v)
            .map_or(0, |&(_, c)| c)
    }

    /// Set the count for `v`, appending it if new.
    pub fn set(&mut self, v: ValueId, count: u32) {
        match self.entries.iter_mut().find(|(k, _)| *k == v) {
            Some(entry) => entry.1 = count,
            None => self.entries.push((v, count)),
        }
    }

    /// Add `delta` to the count for `v`, appending a zero entry first if
    /// absent.
    pub fn add(&mut self, v: ValueId, delta: u32) {
        match self.entries.iter_mut().find(|(k, _)| *k == v) {
            Some(entry) => entry.1 += delta,
            None => self.entries.push((v, delta)),
        }
    }

    /// Remove `v` entirely.
    pub fn remove(&mut self, v: ValueId) {
        self.entries.retain(|&(k, _)| k != v);
    }

    /// Drop zero-count entries, preserving the order of the rest.
    pub fn retain_positive(&mut self) {
        self.entries.retain(|&(_, c)| c > 0);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(value, count)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ValueId, u32)> + '_ {
        self.entries.iter().copied()
    }

    /// Compare by key set and per-key count, ignoring order.
    pub fn same_counts(&self, other: &RefMap) -> bool {
        self.len() == other.len() && self.iter().all(|(v, c)| other.get(v) == c)
    }
}

// Plan records

/// Where a planned refcount operation lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertionSite {
    /// Immediately before this instruction.
    Before(InstId),
    /// On the edge `from → to`, realized by the mutator (splitting the
    /// edge if it is critical). `from` is `None` only for the synthetic
    /// entry edge.
    Edge { to: BlockId, from: Option<BlockId> },
}

/// A planned increment or decrement.
#[derive(Clone, Debug)]
pub struct RefOp {
    pub value: ValueId,
    pub nullable: bool,
    /// Number of references to adjust by; at least 1.
    pub count: u32,
    pub site: InsertionSite,
}

/// Cleanup required on the unwind path of a may-raise call: the multiset
/// of references held across it, with multiplicity.
#[derive(Clone, Debug)]
pub struct CxxFixup {
    pub inst: InstId,
    pub to_decref: Vec<ValueId>,
}

/// Solver state and recorded plan for one block.
#[derive(Clone, Debug, Default)]
pub struct BlockSummary {
    pub been_run: bool,
    /// Refs inherited from successors: the refstate at the block's end.
    pub starting_refs: RefMap,
    /// Refs demanded of predecessors: the refstate at the block's top.
    pub ending_refs: RefMap,
    pub increfs: Vec<RefOp>,
    pub decrefs: Vec<RefOp>,
    pub fixups: Vec<CxxFixup>,
}

/// A generator-yield call site, bound to the block index it occupied
/// before any mutation.
#[derive(Clone, Copy, Debug)]
pub struct YieldSite {
    pub inst: InstId,
    pub block: usize,
}

/// The converged solver output.
pub struct RefcountPlan {
    pub summaries: Vec<BlockSummary>,
    pub yields: Vec<YieldSite>,
}

struct InvokeSite {
    result: ValueId,
    parent: usize,
    normal: usize,
}

/// Run the backward dataflow to a fixpoint and return the insertion plan.
///
/// `assertions` additionally enables the orderer's cycle sanity check.
pub fn solve(
    func: &Function,
    annots: &RefcountAnnotations,
    cfg: &CfgIndex,
    assertions: bool,
) -> RefcountPlan {
    let num_blocks = cfg.num_blocks();

    let order = compute_traversal_order(cfg, assertions);
    let mut orderer = BlockOrderer::new(&order);
    for idx in 0..num_blocks {
        orderer.add(idx);
    }

    // Yield sites and tracked invokes are collected up front: the yield
    // rewrite needs each call bound to its pre-mutation block, and invoke
    // results are accounted in their normal destination, not their own
    // block.
    let mut invokes = Vec::new();
    let mut yields = Vec::new();
    for idx in 0..num_blocks {
        for &inst in func.insts_of(BlockId::new(idx as u32)) {
            match &func.inst(inst).kind {
                InstKind::Call { callee, .. } => {
                    if let ValueKind::Func { name } = func.value(*callee) {
                        if name == runtime::YIELD {
                            yields.push(YieldSite { inst, block: idx });
                        }
                    }
                }
                InstKind::Invoke { normal, .. } => {
                    if let Some(result) = func.result_value(inst) {
                        if annots.is_tracked(result) {
                            invokes.push(InvokeSite {
                                result,
                                parent: idx,
                                normal: normal.index(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let mut solver = Solver {
        func,
        annots,
        cfg,
        invokes,
        summaries: vec![BlockSummary::default(); num_blocks],
    };

    // The lattice is finite and the merge monotone, so this terminates;
    // the cap is a watchdog against solver bugs, not a tuning knob.
    let iteration_cap = 1000 + 64 * num_blocks * num_blocks;
    let mut iterations = 0usize;

    while let Some(idx) = orderer.pop() {
        iterations += 1;
        assert!(
            iterations <= iteration_cap,
            "refcount solver failed to converge within its iteration cap",
        );

        if solver.process_block(idx) {
            for &pred in &cfg.predecessors[idx] {
                orderer.add(pred);
            }
        }
    }

    tracing::debug!(blocks = num_blocks, iterations, "refcount solver converged");

    RefcountPlan {
        summaries: solver.summaries,
        yields,
    }
}

struct Solver<'a> {
    func: &'a Function,
    annots: &'a RefcountAnnotations,
    cfg: &'a CfgIndex,
    invokes: Vec<InvokeSite>,
    summaries: Vec<BlockSummary>,
}

impl Solver<'_> {
    /// Recompute one block's summary from its successors. Returns whether
    /// the ending refs changed (first runs always count as changed).
    fn process_block(&mut self, idx: usize) -> bool {
        let func = self.func;
        let annots = self.annots;
        let block = BlockId::new(idx as u32);

        tracing::debug!(block = idx, "processing block");

        let firsttime = !self.summaries[idx].been_run;
        self.summaries[idx].been_run = true;
        let orig_ending = std::mem::take(&mut self.summaries[idx].ending_refs);

        let mut starting = RefMap::default();
        let mut increfs: Vec<RefOp> = Vec::new();
        let mut decrefs: Vec<RefOp> = Vec::new();
        let mut fixups: Vec<CxxFixup> = Vec::new();

        // Merge from successors that have run at least once. Missing on a
        // successor means zero; an owned value keeps its birth reference
        // across the boundary regardless, so its floor is one.
        let run_succs: SmallVec<[usize; 4]> = self.cfg.successors[idx]
            .iter()
            .copied()
            .filter(|&s| self.summaries[s].been_run)
            .collect();

        if !run_succs.is_empty() {
            let mut tracked_values: Vec<ValueId> = Vec::new();
            let mut seen = FxHashSet::default();
            for &s in &run_succs {
                for (v, c) in self.summaries[s].ending_refs.iter() {
                    debug_assert!(c > 0);
                    if seen.insert(v) {
                        tracked_values.push(v);
                    }
                }
            }

            for v in tracked_values {
                let reftype = tracked_reftype(annots, v);
                let nullable = annots.is_nullable(v);

                let mut min_refs = u32::MAX;
                for &s in &run_succs {
                    min_refs = min_refs.min(self.summaries[s].ending_refs.get(v));
                }
                if reftype == RefType::Owned {
                    min_refs = min_refs.max(1);
                }

                for &s in &run_succs {
                    let this_refs = self.summaries[s].ending_refs.get(v);
                    let site = InsertionSite::Edge {
                        to: BlockId::new(s as u32),
                        from: Some(block),
                    };
                    if this_refs > min_refs {
                        increfs.push(RefOp {
                            value: v,
                            nullable,
                            count: this_refs - min_refs,
                            site,
                        });
                    } else if this_refs < min_refs {
                        // Only an owned value can be dropped toward a
                        // successor that does not need it.
                        debug_assert_eq!(reftype, RefType::Owned);
                        decrefs.push(RefOp {
                            value: v,
                            nullable,
                            count: min_refs - this_refs,
                            site,
                        });
                    }
                }

                if min_refs > 0 {
                    starting.set(v, min_refs);
                }
            }
        }

        let mut ending = starting.clone();

        // Backward scan over the block's instructions.
        let insts = func.insts_of(block);
        for pos in (0..insts.len()).rev() {
            let inst = insts[pos];
            let kind = &func.inst(inst).kind;
            let is_invoke = matches!(kind, InstKind::Invoke { .. });

            // Value definition. The demand on the defined value above this
            // point becomes an adjustment right after the defining
            // instruction; invoke results are instead settled when their
            // normal destination is processed.
            if !is_invoke {
                if let Some(v) = func.result_value(inst) {
                    if let Some(reftype) = annots.reftype(v) {
                        let def_count = u32::from(reftype == RefType::Owned);
                        let cur = ending.get(v);
                        if cur != def_count {
                            debug_assert!(
                                pos + 1 < insts.len(),
                                "tracked value defined by a non-invoke terminator",
                            );
                            let mut after = pos + 1;
                            while func.inst(insts[after]).kind.is_phi() {
                                after += 1;
                            }
                            let site = InsertionSite::Before(insts[after]);
                            let nullable = annots.is_nullable(v);
                            if cur < def_count {
                                debug_assert_eq!(reftype, RefType::Owned);
                                decrefs.push(RefOp {
                                    value: v,
                                    nullable,
                                    count: def_count - cur,
                                    site,
                                });
                            } else {
                                increfs.push(RefOp {
                                    value: v,
                                    nullable,
                                    count: cur - def_count,
                                    site,
                                });
                            }
                        }
                        ending.remove(v);
                    }
                }
            }

            // Phi references enter through the merge step; consumption on
            // the incoming edge is recorded on the predecessor terminator.
            if kind.is_phi() {
                continue;
            }

            // May-raise, part A: surplus references beyond a value's
            // structural need must materialize as increments after the
            // call, not be owed across it; otherwise the unwind path
            // would have to release something that was never taken.
            if annots.may_raise(inst) {
                let entries: SmallVec<[(ValueId, u32); 8]> = ending.iter().collect();
                for (v, c) in entries {
                    let needed = u32::from(tracked_reftype(annots, v) == RefType::Owned);
                    if c > needed {
                        let next = *insts
                            .get(pos + 1)
                            .expect("may-raise instruction cannot be a terminator");
                        increfs.push(RefOp {
                            value: v,
                            nullable: annots.is_nullable(v),
                            count: c - needed,
                            site: InsertionSite::Before(next),
                        });
                    }
                    ending.set(v, needed);
                }
                ending.retain_positive();
            }

            // Operand accounting: occurrences as an operand (plus explicit
            // uses) versus references consumed, both with multiplicity.
            let mut times_consumed = RefMap::default();
            let mut times_used = RefMap::default();
            for &v in annots.consumed_by(inst) {
                times_consumed.add(v, 1);
                times_used.add(v, 0);
            }
            for &v in annots.used_by(inst) {
                times_used.add(v, 1);
            }
            for op in kind.operands() {
                if annots.is_tracked(op) {
                    times_used.add(op, 1);
                }
            }

            // Last observable use on this backward walk: an owned operand
            // that nothing downstream needs gets its release here.
            for (op, times) in times_used.iter() {
                let consumed = times_consumed.get(op);
                if times > consumed
                    && tracked_reftype(annots, op) == RefType::Owned
                    && ending.get(op) == 0
                {
                    let nullable = annots.is_nullable(op);
                    if let InstKind::Invoke { normal, unwind, .. } = *kind {
                        decrefs.push(RefOp {
                            value: op,
                            nullable,
                            count: 1,
                            site: InsertionSite::Edge {
                                to: normal,
                                from: Some(block),
                            },
                        });
                        decrefs.push(RefOp {
                            value: op,
                            nullable,
                            count: 1,
                            site: InsertionSite::Edge {
                                to: unwind,
                                from: Some(block),
                            },
                        });
                    } else {
                        debug_assert!(
                            pos + 1 < insts.len(),
                            "tracked operand last-used by a terminator",
                        );
                        let next = insts[pos + 1];
                        if matches!(func.inst(next).kind, InstKind::Unreachable) {
                            // The unreachable is only reached by unwinding
                            // out of this instruction; the fixup releases
                            // the reference instead.
                            debug_assert!(annots.may_raise(inst));
                        } else {
                            decrefs.push(RefOp {
                                value: op,
                                nullable,
                                count: 1,
                                site: InsertionSite::Before(next),
                            });
                        }
                    }
                    ending.set(op, 1);
                }
            }

            // May-raise, part B: everything still owed at this point must
            // be released on the unwind path, with multiplicity.
            if annots.may_raise(inst) {
                let mut to_decref = Vec::new();
                for (v, c) in ending.iter() {
                    for _ in 0..c {
                        to_decref.push(v);
                    }
                }
                if !to_decref.is_empty() {
                    fixups.push(CxxFixup { inst, to_decref });
                }
            }

            // Stolen refs last: a consumed reference is still owned by the
            // caller at the point control leaves the site via an
            // exception, so this comes after the fixup capture.
            for (op, _) in times_used.iter() {
                let consumed = times_consumed.get(op);
                if consumed > 0 {
                    ending.add(op, consumed);
                }
            }
        }

        // Invokes define their result at the top of their normal
        // destination; settle the demand on the edge from the invoking
        // block.
        for site in &self.invokes {
            if site.normal != idx {
                continue;
            }
            let v = site.result;
            let reftype = tracked_reftype(annots, v);
            let def_count = u32::from(reftype == RefType::Owned);
            let cur = ending.get(v);
            if cur != def_count {
                let edge = InsertionSite::Edge {
                    to: block,
                    from: Some(BlockId::new(site.parent as u32)),
                };
                let nullable = annots.is_nullable(v);
                if cur < def_count {
                    debug_assert_eq!(reftype, RefType::Owned);
                    decrefs.push(RefOp {
                        value: v,
                        nullable,
                        count: def_count - cur,
                        site: edge,
                    });
                } else {
                    increfs.push(RefOp {
                        value: v,
                        nullable,
                        count: cur - def_count,
                        site: edge,
                    });
                }
            }
            ending.remove(v);
        }

        // The entry block settles the remaining demand itself: anything
        // left must be an argument, global, or constant, all borrowed, and
        // gets its increments at the top of the function.
        if idx == func.entry().index() {
            let entries: Vec<(ValueId, u32)> = ending.iter().collect();
            for (v, c) in entries {
                debug_assert!(c > 0);
                if let ValueKind::Inst { .. } = func.value(v) {
                    panic!(
                        "value {} reaches function entry without a producer",
                        v.raw(),
                    );
                }
                assert!(
                    tracked_reftype(annots, v) == RefType::Borrowed,
                    "owned value {} flows into function entry",
                    v.raw(),
                );
                increfs.push(RefOp {
                    value: v,
                    nullable: annots.is_nullable(v),
                    count: c,
                    site: InsertionSite::Edge {
                        to: block,
                        from: None,
                    },
                });
            }
            ending.clear();
        }

        for (v, c) in ending.iter() {
            tracing::trace!(block = idx, value = v.raw(), refs = c, "ending refs");
        }

        let changed = firsttime || !orig_ending.same_counts(&ending);

        let summary = &mut self.summaries[idx];
        summary.starting_refs = starting;
        summary.ending_refs = ending;
        summary.increfs = increfs;
        summary.decrefs = decrefs;
        summary.fixups = fixups;

        changed
    }
}

fn tracked_reftype(annots: &RefcountAnnotations, v: ValueId) -> RefType {
    annots
        .reftype(v)
        .unwrap_or_else(|| panic!("value {} lost its annotation mid-solve", v.raw()))
}
