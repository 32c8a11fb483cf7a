//! Typed SSA CFG substrate the refcount pass operates on.
//!
//! This is the seam to the host code generator: a function is a list of
//! basic blocks, each holding an ordered run of instructions whose last
//! entry is a terminator. Values are SSA (every argument, global,
//! constant, and instruction result gets a [`ValueId`]) and phi nodes
//! cluster at block heads, exactly as in the LLVM-shaped IR this pass was
//! built to rewrite.
//!
//! The mutation surface is deliberately small and matches what refcount
//! insertion needs: insert-before, block splitting (successor phis are
//! remapped), terminator retargeting, phi incoming-block remapping, and
//! replace-all-uses. Constants and symbols are interned per function so
//! repeated emissions reuse one value and printed output stays stable.

use smallvec::{smallvec, SmallVec};

mod print;

#[cfg(test)]
mod tests;

// ID newtypes

/// Basic block ID within a [`Function`]. Allocated sequentially from 0;
/// block 0 is the entry block. Blocks are never removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BlockId(u32);

impl BlockId {
    /// Create a block ID from a raw index.
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw `u32` value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Get the index as `usize` (for indexing into `Vec`s).
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Instruction ID within a [`Function`]. IDs index an arena and stay valid
/// across block splits; detaching an instruction from its block leaves the
/// arena slot behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct InstId(u32);

impl InstId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// SSA value ID within a [`Function`]. Arguments occupy the first IDs,
/// followed by interned constants/symbols and instruction results in
/// creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ValueId(u32);

impl ValueId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// Types

/// Value type. Only [`Ty::RcPtr`] is load-bearing for the pass: it marks
/// pointers to refcounted heap objects, which the annotation audit insists
/// are tracked. The rest exist so emitted arithmetic and control flow are
/// well-typed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
    /// Pointer to a refcounted heap object.
    RcPtr,
    /// Untracked pointer (refcount field address, exception pointer, ...).
    Ptr,
    /// Pointer-sized integer.
    Int,
    /// Boolean (branch conditions, null tests).
    Bool,
    /// Landing-pad result pair `{ i8*, i64 }`.
    ExcPair,
    /// No meaningful value.
    Unit,
}

// Values

/// What a [`ValueId`] refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// Function argument by position.
    Arg { index: u32, ty: Ty },
    /// Global variable, by symbol.
    Global { name: String, ty: Ty },
    /// Function symbol (call target).
    Func { name: String },
    /// The null pointer constant. Implicitly nullable, carries no reference.
    NullPtr,
    /// Integer constant.
    ConstInt(i64),
    /// Result of an instruction.
    Inst { inst: InstId, ty: Ty },
}

// Instructions

/// A single instruction. `Invoke` is a terminator with a result value,
/// defined at the entry of its normal destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstKind {
    /// SSA merge. Incoming entries pair a predecessor block with the value
    /// flowing in along that edge. Phis cluster at block heads.
    Phi { incoming: Vec<(BlockId, ValueId)> },

    /// Plain call.
    Call { callee: ValueId, args: Vec<ValueId> },

    /// Call with an unwind edge. Terminator; on return control continues
    /// at `normal`, on exception at `unwind`.
    Invoke {
        callee: ValueId,
        args: Vec<ValueId>,
        normal: BlockId,
        unwind: BlockId,
    },

    /// Catch-all landing pad. Must be the first instruction of its block.
    LandingPad,

    /// Extract a field from an aggregate value (landing-pad pair).
    ExtractValue { agg: ValueId, index: u32 },

    /// Stack slot.
    Alloca,

    /// Zero-cost pointer cast; does not change pointer identity.
    Cast { src: ValueId },

    /// Address of the word at `word_offset` inside the object `base`
    /// points to.
    FieldAddr { base: ValueId, word_offset: usize },

    /// Load through a pointer.
    Load { ptr: ValueId },

    /// Store through a pointer.
    Store { value: ValueId, ptr: ValueId },

    /// Integer addition.
    Add { lhs: ValueId, rhs: ValueId },

    /// Pointer/integer equality test.
    IcmpEq { lhs: ValueId, rhs: ValueId },

    /// Patchable runtime stub carrying one live value. Lowered later by
    /// the host's stackmap machinery.
    Patchpoint { id: i64, size: u32, value: ValueId },

    /// Unconditional branch. Terminator.
    Br { target: BlockId },

    /// Conditional branch. Terminator.
    CondBr {
        cond: ValueId,
        then_dest: BlockId,
        else_dest: BlockId,
    },

    /// Return. Terminator.
    Ret { value: Option<ValueId> },

    /// Unreachable. Terminator.
    Unreachable,
}

impl InstKind {
    /// Is this a block terminator?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Invoke { .. }
                | InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Ret { .. }
                | InstKind::Unreachable
        )
    }

    /// Is this a phi node?
    #[inline]
    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    /// Successor blocks, in edge order. Empty for non-terminators.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            InstKind::Br { target } => smallvec![*target],
            InstKind::CondBr {
                then_dest,
                else_dest,
                ..
            } => smallvec![*then_dest, *else_dest],
            InstKind::Invoke { normal, unwind, .. } => smallvec![*normal, *unwind],
            _ => SmallVec::new(),
        }
    }

    /// Every value read by this instruction, one entry per occurrence.
    /// Phi incoming values are included; callers that give phis special
    /// treatment skip them before asking.
    pub fn operands(&self) -> SmallVec<[ValueId; 4]> {
        match self {
            InstKind::Phi { incoming } => incoming.iter().map(|&(_, v)| v).collect(),
            InstKind::Call { callee, args } | InstKind::Invoke { callee, args, .. } => {
                let mut ops = SmallVec::with_capacity(1 + args.len());
                ops.push(*callee);
                ops.extend_from_slice(args);
                ops
            }
            InstKind::ExtractValue { agg, .. } => smallvec![*agg],
            InstKind::Cast { src } => smallvec![*src],
            InstKind::FieldAddr { base, .. } => smallvec![*base],
            InstKind::Load { ptr } => smallvec![*ptr],
            InstKind::Store { value, ptr } => smallvec![*value, *ptr],
            InstKind::Add { lhs, rhs } | InstKind::IcmpEq { lhs, rhs } => smallvec![*lhs, *rhs],
            InstKind::Patchpoint { value, .. } => smallvec![*value],
            InstKind::CondBr { cond, .. } => smallvec![*cond],
            InstKind::Ret { value } => value.iter().copied().collect(),
            InstKind::LandingPad
            | InstKind::Alloca
            | InstKind::Br { .. }
            | InstKind::Unreachable => SmallVec::new(),
        }
    }

    /// Visit every operand slot mutably. Used by replace-all-uses.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            InstKind::Phi { incoming } => {
                for (_, v) in incoming {
                    f(v);
                }
            }
            InstKind::Call { callee, args } | InstKind::Invoke { callee, args, .. } => {
                f(callee);
                for a in args {
                    f(a);
                }
            }
            InstKind::ExtractValue { agg, .. } => f(agg),
            InstKind::Cast { src } => f(src),
            InstKind::FieldAddr { base, .. } => f(base),
            InstKind::Load { ptr } => f(ptr),
            InstKind::Store { value, ptr } => {
                f(value);
                f(ptr);
            }
            InstKind::Add { lhs, rhs } | InstKind::IcmpEq { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Patchpoint { value, .. } => f(value),
            InstKind::CondBr { cond, .. } => f(cond),
            InstKind::Ret { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
            InstKind::LandingPad
            | InstKind::Alloca
            | InstKind::Br { .. }
            | InstKind::Unreachable => {}
        }
    }
}

/// An instruction: its kind, its result value (if it produces one), and
/// the block it currently lives in.
#[derive(Clone, Debug)]
pub struct Inst {
    pub kind: InstKind,
    pub result: Option<ValueId>,
    parent: BlockId,
}

/// A basic block: an ordered run of instructions ending in a terminator.
#[derive(Clone, Debug, Default)]
struct Block {
    insts: Vec<InstId>,
}

// Function

/// A function body: blocks, an instruction arena, and the value table.
///
/// Block 0 is the entry block. The pass mutates the function in place;
/// there is no rollback.
#[derive(Clone, Debug)]
pub struct Function {
    /// Function symbol, for diagnostics and printing.
    pub name: String,
    blocks: Vec<Block>,
    insts: Vec<Inst>,
    values: Vec<ValueKind>,
    personality: Option<String>,
}

impl Function {
    /// Create an empty function with the given argument types. Argument
    /// values occupy `ValueId` 0..`arg_tys.len()`.
    pub fn new(name: &str, arg_tys: &[Ty]) -> Self {
        let values = arg_tys
            .iter()
            .enumerate()
            .map(|(i, &ty)| ValueKind::Arg {
                index: u32::try_from(i).unwrap_or_else(|_| panic!("argument count exceeds u32")),
                ty,
            })
            .collect();
        Self {
            name: name.to_owned(),
            blocks: Vec::new(),
            insts: Vec::new(),
            values,
            personality: None,
        }
    }

    /// The entry block. Block 0 by construction.
    #[inline]
    pub fn entry(&self) -> BlockId {
        debug_assert!(!self.blocks.is_empty(), "function has no blocks");
        BlockId::new(0)
    }

    /// Number of basic blocks (grows as the mutator splits edges).
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of values in the value table.
    #[inline]
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// The argument value at position `index`.
    pub fn arg(&self, index: u32) -> ValueId {
        let v = ValueId::new(index);
        debug_assert!(
            matches!(self.values.get(v.index()), Some(ValueKind::Arg { .. })),
            "value {index} is not an argument",
        );
        v
    }

    /// Append a fresh, empty block.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId::new(
            u32::try_from(self.blocks.len()).unwrap_or_else(|_| panic!("block count exceeds u32")),
        );
        self.blocks.push(Block::default());
        id
    }

    /// The instructions of a block, in order.
    #[inline]
    pub fn insts_of(&self, block: BlockId) -> &[InstId] {
        &self.blocks[block.index()].insts
    }

    #[inline]
    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    #[inline]
    pub fn value(&self, v: ValueId) -> &ValueKind {
        &self.values[v.index()]
    }

    /// The type of a value.
    pub fn value_ty(&self, v: ValueId) -> Ty {
        match &self.values[v.index()] {
            ValueKind::Arg { ty, .. }
            | ValueKind::Global { ty, .. }
            | ValueKind::Inst { ty, .. } => *ty,
            ValueKind::Func { .. } => Ty::Ptr,
            ValueKind::NullPtr => Ty::RcPtr,
            ValueKind::ConstInt(_) => Ty::Int,
        }
    }

    /// Is this value the null pointer constant?
    #[inline]
    pub fn is_null_const(&self, v: ValueId) -> bool {
        matches!(self.values[v.index()], ValueKind::NullPtr)
    }

    /// The block an instruction currently lives in.
    #[inline]
    pub fn parent(&self, id: InstId) -> BlockId {
        self.insts[id.index()].parent
    }

    /// The result value of an instruction, if it produces one.
    #[inline]
    pub fn result_value(&self, id: InstId) -> Option<ValueId> {
        self.insts[id.index()].result
    }

    /// Personality routine, if a landing pad has been emitted.
    #[inline]
    pub fn personality(&self) -> Option<&str> {
        self.personality.as_deref()
    }

    /// Install the personality routine symbol.
    pub fn set_personality(&mut self, symbol: &str) {
        debug_assert!(
            self.personality.is_none() || self.personality.as_deref() == Some(symbol),
            "conflicting personality symbols",
        );
        self.personality = Some(symbol.to_owned());
    }

    // Constant / symbol interning

    /// Intern an integer constant.
    pub fn const_int(&mut self, value: i64) -> ValueId {
        self.intern(ValueKind::ConstInt(value))
    }

    /// Intern the null pointer constant.
    pub fn null_ptr(&mut self) -> ValueId {
        self.intern(ValueKind::NullPtr)
    }

    /// Intern a function symbol.
    pub fn func_symbol(&mut self, name: &str) -> ValueId {
        if let Some(found) = self.values.iter().position(
            |k| matches!(k, ValueKind::Func { name: n } if n == name),
        ) {
            return ValueId::new(found as u32);
        }
        self.push_value(ValueKind::Func {
            name: name.to_owned(),
        })
    }

    /// Intern a global variable symbol.
    pub fn global(&mut self, name: &str, ty: Ty) -> ValueId {
        if let Some(found) = self.values.iter().position(
            |k| matches!(k, ValueKind::Global { name: n, .. } if n == name),
        ) {
            debug_assert!(
                matches!(&self.values[found], ValueKind::Global { ty: t, .. } if *t == ty),
                "global {name} re-interned at a different type",
            );
            return ValueId::new(found as u32);
        }
        self.push_value(ValueKind::Global {
            name: name.to_owned(),
            ty,
        })
    }

    fn intern(&mut self, kind: ValueKind) -> ValueId {
        if let Some(found) = self.values.iter().position(|k| *k == kind) {
            return ValueId::new(found as u32);
        }
        self.push_value(kind)
    }

    fn push_value(&mut self, kind: ValueKind) -> ValueId {
        let id = ValueId::new(
            u32::try_from(self.values.len()).unwrap_or_else(|_| panic!("value count exceeds u32")),
        );
        self.values.push(kind);
        id
    }

    // Instruction creation

    /// Append a result-less instruction to a block.
    pub fn append(&mut self, block: BlockId, kind: InstKind) -> InstId {
        let id = self.alloc_inst(kind, block);
        self.blocks[block.index()].insts.push(id);
        id
    }

    /// Append a value-producing instruction to a block and return its
    /// result value.
    pub fn append_valued(&mut self, block: BlockId, kind: InstKind, ty: Ty) -> ValueId {
        let id = self.alloc_inst(kind, block);
        self.blocks[block.index()].insts.push(id);
        self.attach_result(id, ty)
    }

    /// Insert a result-less instruction immediately before `anchor`.
    pub fn insert_before(&mut self, anchor: InstId, kind: InstKind) -> InstId {
        let block = self.insts[anchor.index()].parent;
        let pos = self.position(anchor);
        let id = self.alloc_inst(kind, block);
        self.blocks[block.index()].insts.insert(pos, id);
        id
    }

    /// Insert a value-producing instruction immediately before `anchor`.
    pub fn insert_valued_before(&mut self, anchor: InstId, kind: InstKind, ty: Ty) -> ValueId {
        let id = self.insert_before(anchor, kind);
        self.attach_result(id, ty)
    }

    fn alloc_inst(&mut self, kind: InstKind, parent: BlockId) -> InstId {
        let id = InstId::new(
            u32::try_from(self.insts.len())
                .unwrap_or_else(|_| panic!("instruction count exceeds u32")),
        );
        self.insts.push(Inst {
            kind,
            result: None,
            parent,
        });
        id
    }

    fn attach_result(&mut self, id: InstId, ty: Ty) -> ValueId {
        let v = self.push_value(ValueKind::Inst { inst: id, ty });
        self.insts[id.index()].result = Some(v);
        v
    }

    // Position queries

    /// Position of an instruction within its block.
    ///
    /// # Panics
    ///
    /// Panics if the instruction has been detached.
    pub fn position(&self, id: InstId) -> usize {
        let block = self.insts[id.index()].parent;
        self.blocks[block.index()]
            .insts
            .iter()
            .position(|&i| i == id)
            .unwrap_or_else(|| panic!("instruction {} is not attached", id.raw()))
    }

    /// The instruction following `id` in its block, if any.
    pub fn next_inst(&self, id: InstId) -> Option<InstId> {
        let block = self.insts[id.index()].parent;
        let pos = self.position(id);
        self.blocks[block.index()].insts.get(pos + 1).copied()
    }

    /// The terminator of a block (its last instruction).
    pub fn terminator(&self, block: BlockId) -> InstId {
        let id = *self.blocks[block.index()]
            .insts
            .last()
            .unwrap_or_else(|| panic!("block {} is empty", block.raw()));
        debug_assert!(
            self.insts[id.index()].kind.is_terminator(),
            "block {} does not end in a terminator",
            block.raw(),
        );
        id
    }

    /// Successor blocks of `block`, in edge order.
    pub fn successors_of(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        match self.blocks[block.index()].insts.last() {
            Some(&last) => self.insts[last.index()].kind.successors(),
            None => SmallVec::new(),
        }
    }

    /// Number of incoming edges to `block`. Counts edges, not distinct
    /// predecessors: a conditional branch with both arms on `block`
    /// contributes two.
    pub fn pred_count(&self, block: BlockId) -> usize {
        let mut count = 0;
        for b in &self.blocks {
            if let Some(&last) = b.insts.last() {
                let kind = &self.insts[last.index()].kind;
                if kind.is_terminator() {
                    count += kind.successors().iter().filter(|&&s| s == block).count();
                }
            }
        }
        count
    }

    // Mutation

    /// Split a block before `at`: everything from `at` onward moves into a
    /// fresh block, the original block gets an unconditional branch to it,
    /// and phis in the moved terminator's successors are remapped to the
    /// new block.
    pub fn split_block(&mut self, at: InstId) -> BlockId {
        let old = self.insts[at.index()].parent;
        let pos = self.position(at);
        let tail = self.blocks[old.index()].insts.split_off(pos);
        let new = self.new_block();
        for &i in &tail {
            self.insts[i.index()].parent = new;
        }
        let moved_term = tail.last().copied();
        self.blocks[new.index()].insts = tail;
        if let Some(term) = moved_term {
            if self.insts[term.index()].kind.is_terminator() {
                for succ in self.insts[term.index()].kind.successors() {
                    self.remap_phi_incoming(succ, old, new);
                }
            }
        }
        self.append(old, InstKind::Br { target: new });
        new
    }

    /// Detach an instruction from its block. The arena slot remains but
    /// the instruction no longer executes; its result must have no
    /// remaining uses.
    pub fn erase_inst(&mut self, id: InstId) {
        let parent = self.insts[id.index()].parent;
        let pos = self.position(id);
        self.blocks[parent.index()].insts.remove(pos);
    }

    /// Replace every use of `old` with `new` across all attached
    /// instructions.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        let attached: Vec<InstId> = self
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter().copied())
            .collect();
        for id in attached {
            self.insts[id.index()].kind.for_each_operand_mut(|v| {
                if *v == old {
                    *v = new;
                }
            });
        }
    }

    /// Retarget every edge `block → old_dest` to `new_dest`.
    ///
    /// A conditional branch retargets each matching arm independently. An
    /// invoke retargets its normal destination only; its unwind edge
    /// cannot be redirected.
    pub fn retarget_successor(&mut self, block: BlockId, old_dest: BlockId, new_dest: BlockId) {
        let term = self.terminator(block);
        match &mut self.insts[term.index()].kind {
            InstKind::Br { target } => {
                if *target == old_dest {
                    *target = new_dest;
                }
            }
            InstKind::CondBr {
                then_dest,
                else_dest,
                ..
            } => {
                if *then_dest == old_dest {
                    *then_dest = new_dest;
                }
                if *else_dest == old_dest {
                    *else_dest = new_dest;
                }
            }
            InstKind::Invoke { normal, unwind, .. } => {
                assert!(
                    *unwind != old_dest,
                    "cannot break the critical unwind edge of an invoke",
                );
                if *normal == old_dest {
                    *normal = new_dest;
                }
            }
            other => panic!("unhandled terminator {other:?} during edge retargeting"),
        }
    }

    /// Add an incoming entry to a phi. Loop phis are built before their
    /// back-edge values exist, so incoming entries arrive one edge at a
    /// time.
    pub fn add_phi_incoming(&mut self, phi: InstId, pred: BlockId, value: ValueId) {
        match &mut self.insts[phi.index()].kind {
            InstKind::Phi { incoming } => incoming.push((pred, value)),
            other => panic!("add_phi_incoming on non-phi {other:?}"),
        }
    }

    /// Rewrite phi incoming entries in `block` that name `old_pred` to
    /// name `new_pred` instead.
    pub fn remap_phi_incoming(&mut self, block: BlockId, old_pred: BlockId, new_pred: BlockId) {
        let phis: SmallVec<[InstId; 4]> = self.blocks[block.index()]
            .insts
            .iter()
            .copied()
            .take_while(|&i| self.insts[i.index()].kind.is_phi())
            .collect();
        for id in phis {
            if let InstKind::Phi { incoming } = &mut self.insts[id.index()].kind {
                for (pred, _) in incoming {
                    if *pred == old_pred {
                        *pred = new_pred;
                    }
                }
            }
        }
    }
}
