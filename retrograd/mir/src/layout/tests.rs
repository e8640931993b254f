use super::*;

fn inst(n: u32) -> Inst {
    Inst::from(n)
}

#[test]
fn block_order() {
    let mut layout = Layout::new();
    let b0 = layout.append_new_block();
    let b1 = layout.append_new_block();
    let b2 = layout.make_block();
    layout.insert_block(b2, b1);
    assert_eq!(layout.blocks().collect::<Vec<_>>(), vec![b0, b2, b1]);
    assert_eq!(layout.entry_block(), Some(b0));
    assert_eq!(layout.last_block(), Some(b1));

    let b3 = layout.make_block();
    layout.insert_block_after(b3, b1);
    assert_eq!(layout.blocks().collect::<Vec<_>>(), vec![b0, b2, b1, b3]);
    assert_eq!(layout.last_block(), Some(b3));
}

#[test]
fn remove_block() {
    let mut layout = Layout::new();
    let b0 = layout.append_new_block();
    let b1 = layout.append_new_block();
    let b2 = layout.append_new_block();
    layout.remove_empty_block(b1);
    assert_eq!(layout.blocks().collect::<Vec<_>>(), vec![b0, b2]);
    assert!(!layout.is_block_inserted(b1));
    layout.remove_empty_block(b0);
    assert_eq!(layout.entry_block(), Some(b2));
    layout.remove_empty_block(b2);
    assert_eq!(layout.entry_block(), None);
}

#[test]
fn inst_order() {
    let mut layout = Layout::new();
    let block = layout.append_new_block();
    layout.append_inst_to_bb(inst(0), block);
    layout.append_inst_to_bb(inst(2), block);
    layout.insert_inst(inst(1), inst(2));
    assert_eq!(layout.block_insts(block).collect::<Vec<_>>(), vec![inst(0), inst(1), inst(2)]);
    assert_eq!(layout.first_inst(block), Some(inst(0)));
    assert_eq!(layout.last_inst(block), Some(inst(2)));
    assert_eq!(layout.next_inst(inst(0)), Some(inst(1)));
    assert_eq!(layout.prev_inst(inst(2)), Some(inst(1)));
    assert_eq!(layout.inst_block(inst(1)), Some(block));
}

#[test]
fn inst_insert_after_and_remove() {
    let mut layout = Layout::new();
    let block = layout.append_new_block();
    layout.append_inst_to_bb(inst(0), block);
    layout.insert_inst_after(inst(1), inst(0));
    layout.insert_inst_after(inst(2), inst(1));
    layout.remove_inst(inst(1));
    assert_eq!(layout.block_insts(block).collect::<Vec<_>>(), vec![inst(0), inst(2)]);
    assert_eq!(layout.inst_block(inst(1)), None);

    // reinsertion after removal is allowed
    layout.insert_inst(inst(1), inst(0));
    assert_eq!(layout.block_insts(block).collect::<Vec<_>>(), vec![inst(1), inst(0), inst(2)]);
}

#[test]
fn inst_iter_is_double_ended() {
    let mut layout = Layout::new();
    let block = layout.append_new_block();
    for i in 0..4 {
        layout.append_inst_to_bb(inst(i), block);
    }
    let rev: Vec<_> = layout.block_insts(block).rev().collect();
    assert_eq!(rev, vec![inst(3), inst(2), inst(1), inst(0)]);

    let mut iter = layout.block_insts(block);
    assert_eq!(iter.next(), Some(inst(0)));
    assert_eq!(iter.next_back(), Some(inst(3)));
    assert_eq!(iter.next(), Some(inst(1)));
    assert_eq!(iter.next_back(), Some(inst(2)));
    assert_eq!(iter.next(), None);
    assert_eq!(iter.next_back(), None);
}
