//! Refcount insertion for an exception-aware typed SSA CFG.
//!
//! This crate takes a function emitted by the code generator, every
//! value of refcounted pointer type annotated with its reference
//! discipline, nullability, consumed/used operands, and may-raise marks,
//! and rewrites the CFG so reference counts are maintained correctly
//! along every path, including paths that unwind through exception
//! handlers.
//!
//! # Pipeline
//!
//! 1. **[`RefcountAnnotations`]**: the front end's metadata, populated
//!    during code generation, read-only here.
//! 2. **[`CfgIndex`]**: dense predecessor/successor index, built once.
//! 3. **Traversal order** ([`order`]): deterministic exit-first ordering
//!    driving the solver's priority worklist.
//! 4. **Backward solver** ([`solver`]): the fixed-point dataflow that
//!    computes per-block reference demands and records the insertion
//!    plan.
//! 5. **Mutator** ([`emit`]): splits critical edges and materializes
//!    increments, decrements, unwind fixups, and the yield rewrite.
//!
//! [`insert_refcounts`] is the canonical entry point; callers should use
//! it rather than sequencing the phases by hand.
//!
//! # Determinism
//!
//! Identical input must produce byte-identical output; downstream
//! caches key on printed IR. Every iteration that can influence emitted
//! code is keyed on dense ordinals (block index, instruction position,
//! insertion order), never on hash iteration.
//!
//! # Failure model
//!
//! There is no recovery path. An annotation-contract violation, an
//! attempt to split an invoke's unwind edge, or an unhandled terminator
//! during edge splitting panics and aborts compilation of the function.

pub mod annot;
pub mod emit;
pub mod graph;
pub mod ir;
pub mod order;
pub mod runtime;
pub mod solver;

#[cfg(test)]
pub(crate) mod test_helpers;


pub use annot::{RefcountAnnotations, RefType};
pub use emit::apply_plan;
pub use graph::CfgIndex;
pub use ir::{BlockId, Function, Inst, InstId, InstKind, Ty, ValueId, ValueKind};
pub use order::{compute_traversal_order, BlockOrderer};
pub use solver::{
    solve, BlockSummary, CxxFixup, InsertionSite, RefMap, RefOp, RefcountPlan, YieldSite,
};

/// Build-flavor switches for the pass.
///
/// Verbosity is not configured here: block-level tracing rides the
/// `tracing` `debug` level and per-value ending-ref dumps ride `trace`,
/// so the host's subscriber filter decides what is emitted.
#[derive(Clone, Copy, Debug)]
pub struct PassOptions {
    /// Reference tracing is compiled into the runtime: shifts the
    /// refcount field by the two-word trace link.
    pub trace_refs: bool,
    /// Maintain the process-wide refcount total in emitted increments.
    pub ref_debug: bool,
    /// Run the untracked-value audit and the orderer's cycle sanity
    /// check before solving.
    pub assertions: bool,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            trace_refs: false,
            ref_debug: false,
            assertions: cfg!(debug_assertions),
        }
    }
}

/// Insert refcount maintenance into `func`.
///
/// On return every discipline-tracked value holds the right number of
/// references at every point on every path: no leak, no double release,
/// no use across an unwind edge without a matching fixup.
///
/// # Panics
///
/// Panics on annotation-contract violations (see the crate docs); the
/// CFG may be partially mutated when that happens, so callers must treat
/// a panic as fatal for the compilation unit.
pub fn insert_refcounts(func: &mut Function, annots: &RefcountAnnotations, opts: &PassOptions) {
    let start = std::time::Instant::now();
    tracing::debug!(function = %func.name, ir = %func, "before refcount insertion");

    if opts.assertions {
        annots.audit(func);
    }

    let cfg = CfgIndex::build(func);
    let plan = solver::solve(func, annots, &cfg, opts.assertions);
    emit::apply_plan(func, annots, &plan, opts);

    tracing::debug!(
        function = %func.name,
        elapsed_us = start.elapsed().as_micros() as u64,
        "refcount insertion finished",
    );
}
