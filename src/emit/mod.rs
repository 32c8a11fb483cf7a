//! CFG mutator: materializes the solver's plan.
//!
//! Runs in two walks. The first resolves every edge-scheduled operation
//! to a concrete instruction position, splitting critical edges on
//! demand and caching `(to, from) → position` so repeated requests land
//! in the same breaker block. The second walk emits the increment,
//! decrement, and exception-fixup instructions, then a final pass
//! rewrites generator-yield call sites so the runtime traversal helper
//! receives the owned references live across the suspension.
//!
//! Replacing a call with an invoke re-keys its result value; the
//! forwarding map keeps later emissions (fixup lists, yield arguments)
//! pointing at the live value.

use rustc_hash::FxHashMap;

use crate::annot::{RefcountAnnotations, RefType};
use crate::ir::{BlockId, Function, InstId, InstKind, Ty, ValueId};
use crate::runtime;
use crate::solver::{CxxFixup, InsertionSite, RefcountPlan};
use crate::PassOptions;

type InsertionCache = FxHashMap<(BlockId, Option<BlockId>), InstId>;

/// Tracks value re-keying performed during emission (call → invoke
/// rewrites), so plan entries recorded against the old value follow it.
#[derive(Default)]
struct Forwarding {
    map: FxHashMap<ValueId, ValueId>,
}

impl Forwarding {
    fn record(&mut self, old: ValueId, new: ValueId) {
        self.map.insert(old, new);
    }

    fn resolve(&self, v: ValueId) -> ValueId {
        let mut cur = v;
        while let Some(&next) = self.map.get(&cur) {
            cur = next;
        }
        cur
    }
}

/// Materialize a converged plan into the function.
pub fn apply_plan(
    func: &mut Function,
    annots: &RefcountAnnotations,
    plan: &RefcountPlan,
    opts: &PassOptions,
) {
    let mut cache = InsertionCache::default();

    // First walk: pin down every edge insertion point. This is the only
    // step that changes the block graph ahead of emission, so positions
    // found here stay valid below.
    for summary in &plan.summaries {
        for op in summary.increfs.iter().chain(summary.decrefs.iter()) {
            if let InsertionSite::Edge { to, from } = op.site {
                find_insertion_point(func, to, from, &mut cache);
            }
        }
    }

    // Second walk: emit. Same traversal, cache hits all the way.
    let mut fwd = Forwarding::default();
    for summary in &plan.summaries {
        for op in &summary.increfs {
            let before = site_anchor(func, op.site, &mut cache);
            let value = fwd.resolve(op.value);
            emit_increfs(func, value, op.nullable, op.count, before, opts);
        }
        for op in &summary.decrefs {
            let before = site_anchor(func, op.site, &mut cache);
            let value = fwd.resolve(op.value);
            emit_decrefs(func, value, op.nullable, op.count, before);
        }
        for fixup in &summary.fixups {
            emit_cxx_fixup(func, fixup, &mut fwd);
        }
    }

    rewrite_yields(func, annots, plan, &mut fwd);
}

fn site_anchor(func: &mut Function, site: InsertionSite, cache: &mut InsertionCache) -> InstId {
    match site {
        InsertionSite::Before(inst) => inst,
        InsertionSite::Edge { to, from } => find_insertion_point(func, to, from, cache),
    }
}

/// Realize an edge `from → to` as an instruction position.
///
/// If `to` has more than one incoming edge the edge is critical: a fresh
/// breaker block is spliced in, `from`'s terminator retargeted, and phis
/// in `to` remapped. Otherwise code lands at `to`'s first ordinary slot:
/// past phis and allocas, and past the landingpad / extract / begin-catch
/// prologue, which must stay contiguous.
fn find_insertion_point(
    func: &mut Function,
    to: BlockId,
    from: Option<BlockId>,
    cache: &mut InsertionCache,
) -> InstId {
    let key = (to, from);
    if let Some(&pt) = cache.get(&key) {
        return pt;
    }

    let pt = if func.pred_count(to) > 1 {
        let from = from.expect("cannot break a critical edge without its source block");
        let breaker = func.new_block();
        let br = func.append(breaker, InstKind::Br { target: to });
        func.retarget_successor(from, to, breaker);
        func.remap_phi_incoming(to, from, breaker);
        br
    } else {
        let insts = func.insts_of(to);
        let starts_with_pad = insts
            .first()
            .is_some_and(|&i| matches!(func.inst(i).kind, InstKind::LandingPad));
        if starts_with_pad {
            assert!(
                insts.len() > 3,
                "landing pad block is missing its extract/begin-catch prologue",
            );
            insts[3]
        } else {
            insts
                .iter()
                .copied()
                .find(|&i| {
                    let kind = &func.inst(i).kind;
                    !kind.is_phi() && !matches!(kind, InstKind::Alloca)
                })
                .unwrap_or_else(|| panic!("block {} has no insertion slot", to.raw()))
        }
    };

    cache.insert(key, pt);
    pt
}

/// Emit `count` reference increments for `value` before `before`.
///
/// Nullable values get a null test first; the adjustment runs in a
/// dedicated block on the non-null arm.
fn emit_increfs(
    func: &mut Function,
    value: ValueId,
    nullable: bool,
    count: u32,
    before: InstId,
    opts: &PassOptions,
) {
    if func.is_null_const(value) {
        debug_assert!(nullable);
        return;
    }
    debug_assert!(count > 0);

    if nullable {
        let cur = func.parent(before);
        let cont = func.split_block(before);
        let split_br = func.terminator(cur);
        func.erase_inst(split_br);

        let incref_bb = func.new_block();
        let null = func.null_ptr();
        let is_null = func.append_valued(
            cur,
            InstKind::IcmpEq {
                lhs: value,
                rhs: null,
            },
            Ty::Bool,
        );
        func.append(
            cur,
            InstKind::CondBr {
                cond: is_null,
                then_dest: cont,
                else_dest: incref_bb,
            },
        );
        let br = func.append(incref_bb, InstKind::Br { target: cont });
        emit_incref_body(func, value, count, br, opts);
    } else {
        emit_incref_body(func, value, count, before, opts);
    }
}

fn emit_incref_body(
    func: &mut Function,
    value: ValueId,
    count: u32,
    before: InstId,
    opts: &PassOptions,
) {
    let amount = func.const_int(i64::from(count));

    if opts.ref_debug {
        let total = func.global(runtime::REF_TOTAL, Ty::Ptr);
        let cur = func.insert_valued_before(before, InstKind::Load { ptr: total }, Ty::Int);
        let sum = func.insert_valued_before(
            before,
            InstKind::Add {
                lhs: cur,
                rhs: amount,
            },
            Ty::Int,
        );
        func.insert_before(
            before,
            InstKind::Store {
                value: sum,
                ptr: total,
            },
        );
    }

    let slot = func.insert_valued_before(
        before,
        InstKind::FieldAddr {
            base: value,
            word_offset: runtime::refcount_idx(opts.trace_refs),
        },
        Ty::Ptr,
    );
    let rc = func.insert_valued_before(before, InstKind::Load { ptr: slot }, Ty::Int);
    let sum = func.insert_valued_before(
        before,
        InstKind::Add {
            lhs: rc,
            rhs: amount,
        },
        Ty::Int,
    );
    func.insert_before(
        before,
        InstKind::Store {
            value: sum,
            ptr: slot,
        },
    );
}

/// Emit `count` reference decrements for `value` before `before`.
///
/// The plain form is a patchable runtime stub so a later JIT pass can
/// rewrite the site; the stub owns zero-refcount destruction, nothing is
/// inlined here. The nullable form branches on null and runs the plain
/// form on the non-null arm.
fn emit_decrefs(func: &mut Function, value: ValueId, nullable: bool, count: u32, before: InstId) {
    if func.is_null_const(value) {
        debug_assert!(nullable);
        return;
    }
    debug_assert!(count > 0);
    if count > 1 {
        // Structurally fine, but front ends are expected not to produce
        // multi-reference drops at one site.
        tracing::warn!(
            value = value.raw(),
            count,
            "multi-reference decrement at a single site",
        );
    }

    if nullable {
        let cur = func.parent(before);
        let cont = func.split_block(before);
        let split_br = func.terminator(cur);
        func.erase_inst(split_br);

        let decref_bb = func.new_block();
        let null = func.null_ptr();
        let is_null = func.append_valued(
            cur,
            InstKind::IcmpEq {
                lhs: value,
                rhs: null,
            },
            Ty::Bool,
        );
        func.append(
            cur,
            InstKind::CondBr {
                cond: is_null,
                then_dest: cont,
                else_dest: decref_bb,
            },
        );
        let br = func.append(decref_bb, InstKind::Br { target: cont });
        emit_plain_decrefs(func, value, count, br);
    } else {
        emit_plain_decrefs(func, value, count, before);
    }
}

fn emit_plain_decrefs(func: &mut Function, value: ValueId, count: u32, before: InstId) {
    // The patchpoint stub releases exactly one reference.
    for _ in 0..count {
        func.insert_before(
            before,
            InstKind::Patchpoint {
                id: runtime::DECREF_PP_ID,
                size: runtime::DECREF_PP_SIZE,
                value,
            },
        );
    }
}

/// Give a may-raise call an unwind edge that releases everything held
/// across it.
///
/// The containing block is split at the call, the call becomes an invoke
/// whose normal edge continues where the call left off, and the unwind
/// edge lands in a fresh catch-all landing pad that hands the exception
/// pointer and the recorded multiset to the runtime's
/// decref-and-rethrow helper.
fn emit_cxx_fixup(func: &mut Function, fixup: &CxxFixup, fwd: &mut Forwarding) {
    let call = fixup.inst;
    let (callee, args, result_ty) = {
        let inst = func.inst(call);
        let InstKind::Call { callee, args } = &inst.kind else {
            panic!("exception fixup on a non-call instruction");
        };
        (*callee, args.clone(), inst.result.map(|r| func.value_ty(r)))
    };
    let old_result = func.result_value(call);

    let cur = func.parent(call);
    let cont = func.split_block(call);
    let split_br = func.terminator(cur);
    func.erase_inst(split_br);

    let fixup_bb = func.new_block();
    let invoke = InstKind::Invoke {
        callee,
        args,
        normal: cont,
        unwind: fixup_bb,
    };
    let new_result = match result_ty {
        Some(ty) => Some(func.append_valued(cur, invoke, ty)),
        None => {
            func.append(cur, invoke);
            None
        }
    };
    func.erase_inst(call);
    if let (Some(old), Some(new)) = (old_result, new_result) {
        func.replace_all_uses(old, new);
        fwd.record(old, new);
    }

    let pad = func.append_valued(fixup_bb, InstKind::LandingPad, Ty::ExcPair);
    let exc = func.append_valued(
        fixup_bb,
        InstKind::ExtractValue { agg: pad, index: 0 },
        Ty::Ptr,
    );
    let helper = func.func_symbol(runtime::XDECREF_AND_RETHROW);
    let count = func.const_int(fixup.to_decref.len() as i64);
    let mut call_args = vec![exc, count];
    call_args.extend(fixup.to_decref.iter().map(|&v| fwd.resolve(v)));
    func.append(
        fixup_bb,
        InstKind::Call {
            callee: helper,
            args: call_args,
        },
    );
    func.append(fixup_bb, InstKind::Unreachable);
    func.set_personality(runtime::PERSONALITY);
}

/// Rewrite yield call sites to carry the live owned-reference set.
///
/// A suspended generator frame is traversed by the collector through the
/// yield helper, so every owned reference live at the suspension point
/// (except the yielded value, which the helper consumes) is appended to
/// the call: `(generator, value, n, owned...)`. Sites with nothing live
/// are left untouched.
fn rewrite_yields(
    func: &mut Function,
    annots: &RefcountAnnotations,
    plan: &RefcountPlan,
    fwd: &mut Forwarding,
) {
    for site in &plan.yields {
        let call = site.inst;
        let (callee, args, result_ty) = {
            let inst = func.inst(call);
            let InstKind::Call { callee, args } = &inst.kind else {
                panic!("yield site is not a call");
            };
            (*callee, args.clone(), inst.result.map(|r| func.value_ty(r)))
        };
        assert_eq!(args.len(), 3, "yield helper takes (generator, value, n)");
        let yield_value = args[1];

        // The yield sits at the top of its block, so the block's ending
        // refs are exactly what is live across the suspension.
        let summary = &plan.summaries[site.block];
        let mut live: Vec<ValueId> = Vec::new();
        for (v, _) in summary.ending_refs.iter() {
            let current = fwd.resolve(v);
            if annots.reftype(v) == Some(RefType::Owned) && current != yield_value {
                live.push(current);
            }
        }
        if live.is_empty() {
            continue;
        }

        let n = func.const_int(live.len() as i64);
        let mut new_args = vec![args[0], yield_value, n];
        new_args.extend(live);

        let new_call = InstKind::Call {
            callee,
            args: new_args,
        };
        match result_ty {
            Some(ty) => {
                let new_value = func.insert_valued_before(call, new_call, ty);
                if let Some(old) = func.result_value(call) {
                    func.replace_all_uses(old, new_value);
                    fwd.record(old, new_value);
                }
            }
            None => {
                func.insert_before(call, new_call);
            }
        }
        func.erase_inst(call);
    }
}
