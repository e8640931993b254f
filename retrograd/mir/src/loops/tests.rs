use crate::cursor::FuncCursor;
use crate::{consts, Block, ControlFlowGraph, DominatorTree, Function, LoopForest};

fn analyze(func: &Function) -> (ControlFlowGraph, DominatorTree, LoopForest) {
    let cfg = ControlFlowGraph::with_function(func);
    let mut dt = DominatorTree::default();
    dt.compute(func, &cfg, true, false, true);
    let mut forest = LoopForest::default();
    forest.compute(func, &cfg, &dt);
    (cfg, dt, forest)
}

/// entry -> header; header -> (body, exit); body -> header
fn single_loop() -> (Function, [Block; 4]) {
    let mut func = Function::new();
    let entry = func.layout.append_new_block();
    let header = func.layout.append_new_block();
    let body = func.layout.append_new_block();
    let exit = func.layout.append_new_block();

    let mut cursor = FuncCursor::new(&mut func).at_bottom(entry);
    cursor.ins().jmp(header);
    cursor.goto_bottom(header);
    cursor.ins().br(consts::TRUE, body, exit);
    cursor.goto_bottom(body);
    cursor.ins().jmp(header);
    cursor.goto_bottom(exit);
    cursor.ins().ret(&[]);

    (func, [entry, header, body, exit])
}

#[test]
fn finds_single_loop() {
    let (func, [entry, header, body, exit]) = single_loop();
    let (_, _, forest) = analyze(&func);

    assert_eq!(forest.num_loops(), 1);
    let lp = forest.loop_of(body).unwrap();
    assert_eq!(forest[lp].header, header);
    assert_eq!(forest[lp].latches, vec![body]);
    assert!(forest.contains_block(lp, header));
    assert!(forest.contains_block(lp, body));
    assert!(!forest.contains_block(lp, entry));
    assert!(!forest.contains_block(lp, exit));
    assert_eq!(forest.loop_of(entry), None);
    assert_eq!(forest.parent(lp), None);
    assert_eq!(forest.depth(body), 1);
}

/// Two nested loops sharing neither header nor latch.
fn nested_loops() -> (Function, [Block; 6]) {
    let mut func = Function::new();
    let entry = func.layout.append_new_block();
    let outer = func.layout.append_new_block();
    let inner = func.layout.append_new_block();
    let inner_body = func.layout.append_new_block();
    let outer_latch = func.layout.append_new_block();
    let exit = func.layout.append_new_block();

    let mut cursor = FuncCursor::new(&mut func).at_bottom(entry);
    cursor.ins().jmp(outer);
    cursor.goto_bottom(outer);
    cursor.ins().jmp(inner);
    cursor.goto_bottom(inner);
    cursor.ins().br(consts::TRUE, inner_body, outer_latch);
    cursor.goto_bottom(inner_body);
    cursor.ins().jmp(inner);
    cursor.goto_bottom(outer_latch);
    cursor.ins().br(consts::TRUE, outer, exit);
    cursor.goto_bottom(exit);
    cursor.ins().ret(&[]);

    (func, [entry, outer, inner, inner_body, outer_latch, exit])
}

#[test]
fn finds_nested_loops() {
    let (func, [_, outer, inner, inner_body, outer_latch, _]) = nested_loops();
    let (_, _, forest) = analyze(&func);

    assert_eq!(forest.num_loops(), 2);
    let inner_lp = forest.loop_of(inner_body).unwrap();
    let outer_lp = forest.loop_of(outer_latch).unwrap();
    assert_ne!(inner_lp, outer_lp);
    assert_eq!(forest[inner_lp].header, inner);
    assert_eq!(forest[outer_lp].header, outer);
    assert_eq!(forest.parent(inner_lp), Some(outer_lp));
    assert_eq!(forest.parent(outer_lp), None);

    // the inner loop is entirely contained in the outer one
    assert!(forest.contains_block(outer_lp, inner));
    assert!(forest.contains_block(outer_lp, inner_body));
    assert_eq!(forest.depth(inner_body), 2);
    assert_eq!(forest.depth(outer_latch), 1);

    // block_loop tracks the innermost loop
    assert_eq!(forest.loop_of(inner), Some(inner_lp));
    assert_eq!(forest.loop_of(outer), Some(outer_lp));
}
