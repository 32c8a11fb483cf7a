use super::{Function, InstKind, Ty, ValueKind};
use crate::test_helpers::call;

/// Two-block function: entry computes a value, second block returns it.
fn two_block_func() -> Function {
    let mut f = Function::new("f", &[Ty::RcPtr]);
    let b0 = f.new_block();
    let b1 = f.new_block();
    f.append(b0, InstKind::Br { target: b1 });
    f.append(
        b1,
        InstKind::Ret {
            value: Some(f.arg(0)),
        },
    );
    f
}

#[test]
fn interning_is_idempotent() {
    let mut f = Function::new("f", &[]);
    assert_eq!(f.const_int(7), f.const_int(7));
    assert_ne!(f.const_int(7), f.const_int(8));
    assert_eq!(f.null_ptr(), f.null_ptr());
    assert_eq!(f.func_symbol("g"), f.func_symbol("g"));
    assert_eq!(f.global("t", Ty::Ptr), f.global("t", Ty::Ptr));
}

#[test]
fn append_and_positions() {
    let mut f = Function::new("f", &[Ty::RcPtr]);
    let b0 = f.new_block();
    let arg0 = f.arg(0);
    let v = call(&mut f, b0, "g", &[arg0]);
    let ret = f.append(b0, InstKind::Ret { value: Some(v) });

    let def = match *f.value(v) {
        ValueKind::Inst { inst, .. } => inst,
        _ => unreachable!(),
    };
    assert_eq!(f.position(def), 0);
    assert_eq!(f.next_inst(def), Some(ret));
    assert_eq!(f.next_inst(ret), None);
    assert_eq!(f.terminator(b0), ret);
}

#[test]
fn pred_count_counts_edges() {
    let mut f = Function::new("f", &[Ty::Bool]);
    let b0 = f.new_block();
    let b1 = f.new_block();
    // Both arms target the same block: two incoming edges.
    f.append(
        b0,
        InstKind::CondBr {
            cond: f.arg(0),
            then_dest: b1,
            else_dest: b1,
        },
    );
    f.append(b1, InstKind::Ret { value: None });

    assert_eq!(f.pred_count(b1), 2);
    assert_eq!(f.pred_count(b0), 0);
}

#[test]
fn split_block_moves_tail_and_branches() {
    let mut f = Function::new("f", &[Ty::RcPtr]);
    let b0 = f.new_block();
    let v = call(&mut f, b0, "g", &[]);
    let u = call(&mut f, b0, "h", &[v]);
    let ret = f.append(b0, InstKind::Ret { value: Some(u) });

    let split_at = match *f.value(u) {
        ValueKind::Inst { inst, .. } => inst,
        _ => unreachable!(),
    };
    let cont = f.split_block(split_at);

    // Original block keeps the head and gained a branch to the tail.
    assert_eq!(f.insts_of(b0).len(), 2);
    assert!(matches!(
        f.inst(f.terminator(b0)).kind,
        InstKind::Br { target } if target == cont,
    ));
    // Tail block holds the split instruction and the return.
    assert_eq!(f.insts_of(cont), &[split_at, ret]);
    assert_eq!(f.parent(split_at), cont);
    assert_eq!(f.parent(ret), cont);
}

#[test]
fn split_block_remaps_successor_phis() {
    let mut f = Function::new("f", &[Ty::RcPtr, Ty::Bool]);
    let b0 = f.new_block();
    let b1 = f.new_block();
    let b2 = f.new_block();
    let v = call(&mut f, b0, "g", &[]);
    f.append(
        b0,
        InstKind::CondBr {
            cond: f.arg(1),
            then_dest: b1,
            else_dest: b2,
        },
    );
    f.append(b1, InstKind::Br { target: b2 });
    let phi = f.append_valued(
        b2,
        InstKind::Phi {
            incoming: vec![(b0, v), (b1, f.arg(0))],
        },
        Ty::RcPtr,
    );
    f.append(b2, InstKind::Ret { value: Some(phi) });

    // Split before the terminator of b0; the condbr moves to the new
    // block, so b2's phi must now name it as the incoming block.
    let term = f.terminator(b0);
    let cont = f.split_block(term);

    let first = f.insts_of(b2)[0];
    match &f.inst(first).kind {
        InstKind::Phi { incoming } => {
            assert_eq!(incoming[0].0, cont);
            assert_eq!(incoming[1].0, b1);
        }
        _ => panic!("expected phi"),
    }
}

#[test]
fn replace_all_uses_rewrites_operands() {
    let mut f = Function::new("f", &[Ty::RcPtr, Ty::RcPtr]);
    let b0 = f.new_block();
    let arg0 = f.arg(0);
    let v = call(&mut f, b0, "g", &[arg0, arg0]);
    f.append(b0, InstKind::Ret { value: Some(v) });

    f.replace_all_uses(f.arg(0), f.arg(1));

    let def = match *f.value(v) {
        ValueKind::Inst { inst, .. } => inst,
        _ => unreachable!(),
    };
    match &f.inst(def).kind {
        InstKind::Call { args, .. } => assert_eq!(args, &vec![f.arg(1), f.arg(1)]),
        _ => panic!("expected call"),
    }
}

#[test]
fn retarget_condbr_retargets_each_arm() {
    let mut f = Function::new("f", &[Ty::Bool]);
    let b0 = f.new_block();
    let b1 = f.new_block();
    let b2 = f.new_block();
    f.append(
        b0,
        InstKind::CondBr {
            cond: f.arg(0),
            then_dest: b1,
            else_dest: b1,
        },
    );
    f.append(b1, InstKind::Ret { value: None });
    f.append(b2, InstKind::Ret { value: None });

    f.retarget_successor(b0, b1, b2);
    assert_eq!(f.successors_of(b0).as_slice(), &[b2, b2]);
}

#[test]
#[should_panic(expected = "critical unwind edge")]
fn retarget_invoke_unwind_edge_is_fatal() {
    let mut f = Function::new("f", &[]);
    let b0 = f.new_block();
    let b1 = f.new_block();
    let b2 = f.new_block();
    let callee = f.func_symbol("g");
    f.append(
        b0,
        InstKind::Invoke {
            callee,
            args: vec![],
            normal: b1,
            unwind: b2,
        },
    );
    f.append(b1, InstKind::Ret { value: None });
    f.append(b2, InstKind::Unreachable);

    f.retarget_successor(b0, b2, b1);
}

#[test]
fn erase_detaches_instruction() {
    let mut f = two_block_func();
    let b0 = f.entry();
    let br = f.terminator(b0);
    f.erase_inst(br);
    assert!(f.insts_of(b0).is_empty());
}

#[test]
fn printer_is_stable_across_identical_builds() {
    let a = two_block_func();
    let b = two_block_func();
    assert_eq!(a.to_string(), b.to_string());
    assert!(a.to_string().contains("bb0:"));
}
