use super::{compute_traversal_order, BlockOrderer};
use crate::graph::CfgIndex;
use crate::ir::{Function, InstKind, Ty};

fn index_of(func: &Function) -> CfgIndex {
    CfgIndex::build(func)
}

#[test]
fn straight_line_orders_exit_first() {
    // bb0 → bb1 → bb2
    let mut f = Function::new("f", &[]);
    let b0 = f.new_block();
    let b1 = f.new_block();
    let b2 = f.new_block();
    f.append(b0, InstKind::Br { target: b1 });
    f.append(b1, InstKind::Br { target: b2 });
    f.append(b2, InstKind::Ret { value: None });

    let order = compute_traversal_order(&index_of(&f), true);
    assert_eq!(order, vec![2, 1, 0]);
}

#[test]
fn diamond_orders_arms_before_entry() {
    let mut f = Function::new("f", &[Ty::Bool]);
    let b0 = f.new_block();
    let b1 = f.new_block();
    let b2 = f.new_block();
    let b3 = f.new_block();
    f.append(
        b0,
        InstKind::CondBr {
            cond: f.arg(0),
            then_dest: b1,
            else_dest: b2,
        },
    );
    f.append(b1, InstKind::Br { target: b3 });
    f.append(b2, InstKind::Br { target: b3 });
    f.append(b3, InstKind::Ret { value: None });

    let order = compute_traversal_order(&index_of(&f), true);
    assert_eq!(order, vec![3, 1, 2, 0]);
}

#[test]
fn loop_seeds_from_the_exit_side() {
    // bb0 → bb1 (header) → bb2 (body) → bb1; bb1 → bb3 (exit)
    let mut f = Function::new("f", &[Ty::Bool]);
    let b0 = f.new_block();
    let b1 = f.new_block();
    let b2 = f.new_block();
    let b3 = f.new_block();
    f.append(b0, InstKind::Br { target: b1 });
    f.append(
        b1,
        InstKind::CondBr {
            cond: f.arg(0),
            then_dest: b2,
            else_dest: b3,
        },
    );
    f.append(b2, InstKind::Br { target: b1 });
    f.append(b3, InstKind::Ret { value: None });

    let order = compute_traversal_order(&index_of(&f), true);
    // The exit goes first; the header is the cycle seed (it is the only
    // block with a placed successor); its predecessors follow.
    assert_eq!(order, vec![3, 1, 0, 2]);
}

#[test]
#[should_panic(expected = "no exit-reachable seed")]
fn infinite_loop_is_rejected_under_assertions() {
    // bb0 ⇄ bb1, no exit anywhere.
    let mut f = Function::new("f", &[]);
    let b0 = f.new_block();
    let b1 = f.new_block();
    f.append(b0, InstKind::Br { target: b1 });
    f.append(b1, InstKind::Br { target: b0 });

    compute_traversal_order(&index_of(&f), true);
}

#[test]
fn orderer_pops_in_priority_order() {
    let order = vec![3, 1, 0, 2];
    let mut orderer = BlockOrderer::new(&order);
    orderer.add(0);
    orderer.add(2);
    orderer.add(3);
    orderer.add(1);

    assert_eq!(orderer.pop(), Some(3));
    assert_eq!(orderer.pop(), Some(1));
    assert_eq!(orderer.pop(), Some(0));
    assert_eq!(orderer.pop(), Some(2));
    assert_eq!(orderer.pop(), None);
}

#[test]
fn orderer_deduplicates_pending_blocks() {
    let order = vec![0, 1];
    let mut orderer = BlockOrderer::new(&order);
    orderer.add(1);
    orderer.add(1);
    orderer.add(1);

    assert_eq!(orderer.pop(), Some(1));
    assert_eq!(orderer.pop(), None);

    // Re-adding after a pop queues it again.
    orderer.add(1);
    assert_eq!(orderer.pop(), Some(1));
}
