//! Per-value refcount annotations supplied by the front end.
//!
//! While generating code, the front end records for each SSA value of
//! refcounted pointer type whether the value owns a reference, whether it
//! may be null, which instructions consume or merely use its reference,
//! and which instructions may raise. The store is populated incrementally
//! and is read-only once the pass runs.
//!
//! Contract violations are fatal: this pass refuses to guess at ownership.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{Function, InstId, InstKind, Ty, ValueId, ValueKind};

/// Reference discipline of a value.
///
/// `Unknown` is a transient used while the front end is still resolving a
/// value; every tracked value must have been resolved to `Owned` or
/// `Borrowed` before the pass runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefType {
    /// The value carries a reference that must be released exactly once.
    Owned,
    /// The holder owns no reference and must not release one.
    Borrowed,
    /// Not yet resolved.
    Unknown,
}

#[derive(Clone, Copy, Debug)]
struct ValueAnnotation {
    reftype: RefType,
    nullable: bool,
}

impl Default for ValueAnnotation {
    fn default() -> Self {
        Self {
            reftype: RefType::Unknown,
            nullable: false,
        }
    }
}

/// The annotation store.
///
/// Maps are keyed by [`ValueId`]/[`InstId`] and are never iterated;
/// every deterministic walk goes through the function's arenas instead.
#[derive(Default)]
pub struct RefcountAnnotations {
    vars: FxHashMap<ValueId, ValueAnnotation>,
    refs_consumed: FxHashMap<InstId, Vec<ValueId>>,
    refs_used: FxHashMap<InstId, Vec<ValueId>>,
    may_raise: FxHashSet<InstId>,
}

impl RefcountAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the reference discipline of a value.
    ///
    /// The discipline is set at most once per value; re-setting to the
    /// same discipline is allowed. Tracked cast results must sit
    /// immediately after the instruction producing the value they cast
    /// (or at the first non-phi slot of an invoke's normal destination);
    /// anything between them could observe the value before this
    /// annotation lands.
    ///
    /// # Panics
    ///
    /// Panics on redefinition to a different discipline, on
    /// `RefType::Unknown`, or on a cast that is not adjacent to its
    /// source.
    pub fn set_discipline(&mut self, func: &Function, v: ValueId, reftype: RefType) {
        assert!(
            reftype != RefType::Unknown,
            "cannot annotate a value as Unknown",
        );
        self.check_cast_adjacency(func, v);

        let var = self.vars.entry(v).or_default();
        assert!(
            var.reftype == reftype || var.reftype == RefType::Unknown,
            "value {} re-annotated as {:?} (was {:?})",
            v.raw(),
            reftype,
            var.reftype,
        );
        var.reftype = reftype;

        if func.is_null_const(v) {
            var.nullable = true;
        }
    }

    /// Record whether a value may be null. Nullability can only be
    /// introduced, never retracted.
    pub fn set_nullable(&mut self, v: ValueId, nullable: bool) {
        let var = self.vars.entry(v).or_default();
        assert!(
            var.nullable == nullable || !var.nullable,
            "value {} re-annotated as non-nullable",
            v.raw(),
        );
        var.nullable = nullable;
    }

    /// Record that `inst` steals one reference to `v`. May be called more
    /// than once per (value, instruction) pair; multiplicity matters.
    /// A null constant carries no reference; recording it is a no-op.
    pub fn record_consumed(&mut self, func: &Function, v: ValueId, inst: InstId) {
        if func.is_null_const(v) {
            return;
        }
        assert!(
            self.reftype(v).is_some_and(|rt| rt != RefType::Unknown),
            "value {} consumed before its discipline was resolved",
            v.raw(),
        );
        self.refs_consumed.entry(inst).or_default().push(v);
    }

    /// Record that `v` must stay live across `inst` without its reference
    /// being transferred.
    pub fn record_used(&mut self, func: &Function, v: ValueId, inst: InstId) {
        if func.is_null_const(v) {
            return;
        }
        assert!(
            self.reftype(v).is_some_and(|rt| rt != RefType::Unknown),
            "value {} used before its discipline was resolved",
            v.raw(),
        );
        self.refs_used.entry(inst).or_default().push(v);
    }

    /// Mark an instruction as possibly transferring control to the
    /// exception path.
    ///
    /// # Panics
    ///
    /// Panics if the instruction was already marked.
    pub fn mark_may_raise(&mut self, inst: InstId) {
        assert!(
            self.may_raise.insert(inst),
            "instruction {} marked may-raise twice",
            inst.raw(),
        );
    }

    // Read side

    /// The discipline of a value, if it is tracked at all.
    pub fn reftype(&self, v: ValueId) -> Option<RefType> {
        self.vars.get(&v).map(|a| a.reftype)
    }

    /// Is this value in the store?
    #[inline]
    pub fn is_tracked(&self, v: ValueId) -> bool {
        self.vars.contains_key(&v)
    }

    /// Nullability of a tracked value.
    ///
    /// # Panics
    ///
    /// Panics if the value is untracked.
    pub fn is_nullable(&self, v: ValueId) -> bool {
        self.vars
            .get(&v)
            .unwrap_or_else(|| panic!("value {} is not tracked", v.raw()))
            .nullable
    }

    /// Values consumed by an instruction, with multiplicity.
    pub fn consumed_by(&self, inst: InstId) -> &[ValueId] {
        self.refs_consumed.get(&inst).map_or(&[], Vec::as_slice)
    }

    /// Values used (but not consumed) by an instruction, with multiplicity.
    pub fn used_by(&self, inst: InstId) -> &[ValueId] {
        self.refs_used.get(&inst).map_or(&[], Vec::as_slice)
    }

    /// May this instruction raise?
    #[inline]
    pub fn may_raise(&self, inst: InstId) -> bool {
        self.may_raise.contains(&inst)
    }

    /// Audit the function against the annotation contract: every value of
    /// refcounted pointer type must be tracked (null constants excepted),
    /// and no tracked value may still be `Unknown`.
    ///
    /// # Panics
    ///
    /// Panics on the first violation, naming the value.
    pub fn audit(&self, func: &Function) {
        for i in 0..func.num_values() {
            let v = ValueId::new(i as u32);
            match func.value(v) {
                ValueKind::NullPtr | ValueKind::ConstInt(_) | ValueKind::Func { .. } => continue,
                ValueKind::Arg { .. } | ValueKind::Global { .. } | ValueKind::Inst { .. } => {
                    if func.value_ty(v) == Ty::RcPtr {
                        assert!(
                            self.is_tracked(v),
                            "refcounted value {} was never annotated",
                            v.raw(),
                        );
                    }
                }
            }
            if let Some(a) = self.vars.get(&v) {
                assert!(
                    a.reftype != RefType::Unknown,
                    "value {} still has Unknown discipline",
                    v.raw(),
                );
            }
        }
    }

    /// Tracked casts must immediately follow the instruction producing
    /// their source so no observer sees the value between the definition
    /// and this annotation.
    fn check_cast_adjacency(&self, func: &Function, v: ValueId) {
        let ValueKind::Inst { inst, .. } = *func.value(v) else {
            return;
        };
        let InstKind::Cast { src } = func.inst(inst).kind else {
            return;
        };
        let ValueKind::Inst { inst: src_inst, .. } = *func.value(src) else {
            panic!(
                "tracked cast {} of a non-instruction value {}",
                v.raw(),
                src.raw(),
            );
        };
        if let InstKind::Invoke { normal, .. } = func.inst(src_inst).kind {
            let first_non_phi = func
                .insts_of(normal)
                .iter()
                .copied()
                .find(|&i| !func.inst(i).kind.is_phi());
            assert!(
                first_non_phi == Some(inst),
                "tracked cast {} must be the first non-phi of its invoke's normal destination",
                v.raw(),
            );
        } else {
            assert!(
                func.next_inst(src_inst) == Some(inst),
                "tracked cast {} must immediately follow the value it casts",
                v.raw(),
            );
        }
    }
}
