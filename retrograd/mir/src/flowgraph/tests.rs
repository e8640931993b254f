use crate::cursor::FuncCursor;
use crate::{consts, ControlFlowGraph, Function};

/// entry -> (then, else); both -> exit
fn diamond() -> (Function, [crate::Block; 4]) {
    let mut func = Function::new();
    let entry = func.layout.append_new_block();
    let then_bb = func.layout.append_new_block();
    let else_bb = func.layout.append_new_block();
    let exit = func.layout.append_new_block();

    let mut cursor = FuncCursor::new(&mut func).at_bottom(entry);
    cursor.ins().br(consts::TRUE, then_bb, else_bb);
    cursor.goto_bottom(then_bb);
    cursor.ins().jmp(exit);
    cursor.goto_bottom(else_bb);
    cursor.ins().jmp(exit);
    cursor.goto_bottom(exit);
    cursor.ins().ret(&[]);

    (func, [entry, then_bb, else_bb, exit])
}

#[test]
fn diamond_edges() {
    let (func, [entry, then_bb, else_bb, exit]) = diamond();
    let cfg = ControlFlowGraph::with_function(&func);

    assert_eq!(cfg.succ_iter(entry).collect::<Vec<_>>(), vec![then_bb, else_bb]);
    assert_eq!(cfg.succ_iter(then_bb).collect::<Vec<_>>(), vec![exit]);
    assert_eq!(cfg.succ_iter(exit).count(), 0);

    assert_eq!(cfg.pred_iter(exit).collect::<Vec<_>>(), vec![then_bb, else_bb]);
    assert_eq!(cfg.pred_iter(entry).count(), 0);
    assert_eq!(cfg.num_predecessors(then_bb), 1);
}

#[test]
fn successors_pair() {
    let (func, [entry, then_bb, else_bb, _]) = diamond();
    let cfg = ControlFlowGraph::with_function(&func);
    assert_eq!(cfg.successors(entry).as_pair(), Some((then_bb, else_bb)));
    assert_eq!(cfg.successors(then_bb).as_pair(), None);
    assert_eq!(cfg.successors(entry).len(), 2);

    let mut iter = cfg.succ_iter(entry);
    assert_eq!(iter.next(), Some(then_bb));
    assert_eq!(iter.next(), Some(else_bb));
    assert_eq!(iter.next(), None);
}

#[test]
fn branch_with_equal_targets() {
    let mut func = Function::new();
    let entry = func.layout.append_new_block();
    let exit = func.layout.append_new_block();
    let mut cursor = FuncCursor::new(&mut func).at_bottom(entry);
    cursor.ins().br(consts::TRUE, exit, exit);
    cursor.goto_bottom(exit);
    cursor.ins().ret(&[]);

    let cfg = ControlFlowGraph::with_function(&func);
    assert_eq!(cfg.succ_iter(entry).collect::<Vec<_>>(), vec![exit]);
    assert_eq!(cfg.num_predecessors(exit), 1);
}
