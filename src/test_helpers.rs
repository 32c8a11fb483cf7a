//! Shared test utilities for the refcount pass.
//!
//! Factory helpers for building small annotated CFGs plus counters for
//! inspecting emitted refcount operations. Only compiled in test builds.

use crate::annot::{RefcountAnnotations, RefType};
use crate::ir::{BlockId, Function, InstId, InstKind, Ty, ValueId, ValueKind};
use crate::runtime;

/// Append a call to `callee` producing an `RcPtr` result.
pub(crate) fn call(func: &mut Function, block: BlockId, callee: &str, args: &[ValueId]) -> ValueId {
    let callee = func.func_symbol(callee);
    func.append_valued(
        block,
        InstKind::Call {
            callee,
            args: args.to_vec(),
        },
        Ty::RcPtr,
    )
}

/// Append a call with no result.
pub(crate) fn call_void(
    func: &mut Function,
    block: BlockId,
    callee: &str,
    args: &[ValueId],
) -> InstId {
    let callee = func.func_symbol(callee);
    func.append(
        block,
        InstKind::Call {
            callee,
            args: args.to_vec(),
        },
    )
}

/// Mark a value `Owned`, returning it for chaining.
pub(crate) fn owned(
    func: &Function,
    annots: &mut RefcountAnnotations,
    v: ValueId,
) -> ValueId {
    annots.set_discipline(func, v, RefType::Owned);
    v
}

/// Mark a value `Borrowed`, returning it for chaining.
pub(crate) fn borrowed(
    func: &Function,
    annots: &mut RefcountAnnotations,
    v: ValueId,
) -> ValueId {
    annots.set_discipline(func, v, RefType::Borrowed);
    v
}

/// The instruction defining a value.
pub(crate) fn def_inst(func: &Function, v: ValueId) -> InstId {
    match *func.value(v) {
        ValueKind::Inst { inst, .. } => inst,
        _ => panic!("value {} has no defining instruction", v.raw()),
    }
}

/// All attached instructions, in block order.
pub(crate) fn all_insts(func: &Function) -> Vec<InstId> {
    (0..func.num_blocks())
        .flat_map(|b| func.insts_of(BlockId::new(b as u32)).to_vec())
        .collect()
}

/// Number of emitted increments targeting `v` (each emits exactly one
/// refcount-slot address computation).
pub(crate) fn count_increfs(func: &Function, v: ValueId) -> usize {
    all_insts(func)
        .iter()
        .filter(|&&i| matches!(func.inst(i).kind, InstKind::FieldAddr { base, .. } if base == v))
        .count()
}

/// Number of emitted decrement patchpoints targeting `v`.
pub(crate) fn count_decrefs(func: &Function, v: ValueId) -> usize {
    all_insts(func)
        .iter()
        .filter(|&&i| matches!(func.inst(i).kind, InstKind::Patchpoint { value, .. } if value == v))
        .count()
}

/// Total emitted decrement patchpoints.
pub(crate) fn count_patchpoints(func: &Function) -> usize {
    all_insts(func)
        .iter()
        .filter(|&&i| matches!(func.inst(i).kind, InstKind::Patchpoint { .. }))
        .count()
}

/// Argument lists of emitted unwind-fixup helper calls (exception
/// pointer, count, then the released values).
pub(crate) fn fixup_calls(func: &Function) -> Vec<Vec<ValueId>> {
    calls_to(func, runtime::XDECREF_AND_RETHROW)
}

/// Argument lists of yield helper calls.
pub(crate) fn yield_calls(func: &Function) -> Vec<Vec<ValueId>> {
    calls_to(func, runtime::YIELD)
}

fn calls_to(func: &Function, symbol: &str) -> Vec<Vec<ValueId>> {
    let mut found = Vec::new();
    for i in all_insts(func) {
        if let InstKind::Call { callee, args } = &func.inst(i).kind {
            if matches!(func.value(*callee), ValueKind::Func { name } if name == symbol) {
                found.push(args.clone());
            }
        }
    }
    found
}
