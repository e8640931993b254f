//! Function layout.
//!
//! The order of basic blocks in a function and the order of instructions in a
//! block is determined by the `Layout` data structure defined in this module.

use stdx::packed_option::PackedOption;
use typed_index_collections::TiVec;

use crate::{Block, Inst};

#[cfg(test)]
mod tests;

/// The `Layout` struct determines the layout of blocks and instructions in a
/// function. It does not contain definitions of instructions or blocks, but
/// depends on `Inst` and `Block` entity references being defined elsewhere.
///
/// This data structure determines:
///
/// - The order of blocks in the function.
/// - Which block contains a given instruction.
/// - The order of instructions within a block.
///
/// While data dependencies are not recorded, instruction ordering does affect
/// control dependencies, so part of the semantics of the program are
/// determined by the layout.
#[derive(Clone, Default)]
pub struct Layout {
    /// Linked list nodes for the layout order of blocks. Forms a doubly
    /// linked list, terminated in both ends by `None`.
    blocks: TiVec<Block, BlockNode>,

    /// Linked list nodes for the layout order of instructions. Forms a
    /// doubly linked list per block, terminated in both ends by `None`.
    insts: TiVec<Inst, InstNode>,

    /// First block in the layout order, or `None` when no blocks have been
    /// laid out.
    first_block: Option<Block>,

    /// Last block in the layout order.
    last_block: Option<Block>,
}

#[derive(Clone, Debug, Default)]
struct BlockNode {
    prev: PackedOption<Block>,
    next: PackedOption<Block>,
    first_inst: PackedOption<Inst>,
    last_inst: PackedOption<Inst>,
    inserted: bool,
}

#[derive(Clone, Debug, Default)]
struct InstNode {
    /// The block containing this instruction, or `None` if the instruction
    /// is not yet inserted.
    block: PackedOption<Block>,
    prev: PackedOption<Inst>,
    next: PackedOption<Inst>,
}

impl Layout {
    /// Create a new empty `Layout`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the layout.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.insts.clear();
        self.first_block = None;
        self.last_block = None;
    }

    /// Returns the number of blocks created (inserted or not).
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Methods for laying out blocks.
///
/// A new block starts out as *not inserted* in the block layout. The layout
/// is a linear order of inserted blocks. Once a block has been inserted in
/// the layout, instructions can be added. A block can only be removed from
/// the layout when it is empty.
impl Layout {
    /// Create a new block without inserting it.
    pub fn make_block(&mut self) -> Block {
        self.blocks.push_and_get_key(BlockNode::default())
    }

    /// Create a new block and insert it at the end of the layout.
    pub fn append_new_block(&mut self) -> Block {
        let block = self.make_block();
        self.append_block(block);
        block
    }

    /// Is `block` currently part of the layout?
    pub fn is_block_inserted(&self, block: Block) -> bool {
        self.blocks[block].inserted
    }

    /// Insert `block` as the last block in the layout.
    pub fn append_block(&mut self, block: Block) {
        debug_assert!(
            !self.is_block_inserted(block),
            "cannot append block that is already in the layout"
        );
        {
            let node = &mut self.blocks[block];
            debug_assert!(node.first_inst.is_none() && node.last_inst.is_none());
            node.prev = self.last_block.into();
            node.next = None.into();
            node.inserted = true;
        }
        if let Some(last) = self.last_block {
            self.blocks[last].next = block.into();
        } else {
            self.first_block = Some(block);
        }
        self.last_block = Some(block);
    }

    /// Insert `block` in the layout before the existing block `before`.
    pub fn insert_block(&mut self, block: Block, before: Block) {
        debug_assert!(
            !self.is_block_inserted(block),
            "cannot insert block that is already in the layout"
        );
        debug_assert!(self.is_block_inserted(before), "insertion point not in the layout");
        let after = self.blocks[before].prev;
        {
            let node = &mut self.blocks[block];
            node.next = before.into();
            node.prev = after;
            node.inserted = true;
        }
        self.blocks[before].prev = block.into();
        match after.expand() {
            None => self.first_block = Some(block),
            Some(a) => self.blocks[a].next = block.into(),
        }
    }

    /// Insert `block` in the layout *after* the existing block `after`.
    pub fn insert_block_after(&mut self, block: Block, after: Block) {
        debug_assert!(
            !self.is_block_inserted(block),
            "cannot insert block that is already in the layout"
        );
        debug_assert!(self.is_block_inserted(after), "insertion point not in the layout");
        let before = self.blocks[after].next;
        {
            let node = &mut self.blocks[block];
            node.next = before;
            node.prev = after.into();
            node.inserted = true;
        }
        self.blocks[after].next = block.into();
        match before.expand() {
            None => self.last_block = Some(block),
            Some(b) => self.blocks[b].prev = block.into(),
        }
    }

    /// Remove all instructions of `block` from the layout, then the block
    /// itself.
    pub fn remove_and_clear_block(&mut self, block: Block) {
        let mut curr = self.first_inst(block);
        while let Some(inst) = curr {
            curr = self.insts[inst].next.expand();
            self.insts[inst] = InstNode::default();
        }
        self.blocks[block].first_inst = None.into();
        self.blocks[block].last_inst = None.into();
        self.remove_empty_block(block);
    }

    /// Remove an empty `block` from the layout.
    pub fn remove_empty_block(&mut self, block: Block) {
        debug_assert!(self.is_block_inserted(block), "block not in the layout");
        debug_assert!(self.first_inst(block).is_none(), "block must be empty");

        let node = &mut self.blocks[block];
        let prev = node.prev.take();
        let next = node.next.take();
        node.inserted = false;

        match prev {
            None => self.first_block = next,
            Some(prev) => self.blocks[prev].next = next.into(),
        }
        match next {
            None => self.last_block = prev,
            Some(next) => self.blocks[next].prev = prev.into(),
        }
    }

    /// First block in the layout order; the function entry.
    pub fn entry_block(&self) -> Option<Block> {
        self.first_block
    }

    pub fn last_block(&self) -> Option<Block> {
        self.last_block
    }

    /// Iterate over blocks in layout order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks { layout: self, next: self.first_block }
    }
}

/// Methods for laying out instructions.
impl Layout {
    /// The block containing `inst`, or `None` if it is not inserted.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.insts.get(inst).and_then(|node| node.block.expand())
    }

    fn ensure_inst(&mut self, inst: Inst) {
        if self.insts.len() <= usize::from(inst) {
            self.insts.resize(usize::from(inst) + 1, InstNode::default());
        }
    }

    /// Append `inst` to the end of `block`.
    pub fn append_inst_to_bb(&mut self, inst: Inst, block: Block) {
        self.ensure_inst(inst);
        debug_assert_eq!(self.inst_block(inst), None, "cannot append instruction twice");
        debug_assert!(self.is_block_inserted(block), "cannot append to block not in layout");

        let last = self.blocks[block].last_inst;
        {
            let node = &mut self.insts[inst];
            node.block = block.into();
            node.prev = last;
            node.next = None.into();
        }
        if let Some(last) = last.expand() {
            self.insts[last].next = inst.into();
        } else {
            self.blocks[block].first_inst = inst.into();
        }
        self.blocks[block].last_inst = inst.into();
    }

    /// Insert `inst` before the existing instruction `before`.
    pub fn insert_inst(&mut self, inst: Inst, before: Inst) {
        self.ensure_inst(inst);
        debug_assert_eq!(self.inst_block(inst), None, "cannot insert instruction twice");
        let block =
            self.inst_block(before).expect("insertion point must be inserted in a block");

        let prev = self.insts[before].prev;
        {
            let node = &mut self.insts[inst];
            node.block = block.into();
            node.prev = prev;
            node.next = before.into();
        }
        self.insts[before].prev = inst.into();
        match prev.expand() {
            None => self.blocks[block].first_inst = inst.into(),
            Some(prev) => self.insts[prev].next = inst.into(),
        }
    }

    /// Insert `inst` after the existing instruction `after`.
    pub fn insert_inst_after(&mut self, inst: Inst, after: Inst) {
        self.ensure_inst(inst);
        debug_assert_eq!(self.inst_block(inst), None, "cannot insert instruction twice");
        let block = self.inst_block(after).expect("insertion point must be inserted in a block");

        let next = self.insts[after].next;
        {
            let node = &mut self.insts[inst];
            node.block = block.into();
            node.prev = after.into();
            node.next = next;
        }
        self.insts[after].next = inst.into();
        match next.expand() {
            None => self.blocks[block].last_inst = inst.into(),
            Some(next) => self.insts[next].prev = inst.into(),
        }
    }

    /// Remove `inst` from the layout.
    pub fn remove_inst(&mut self, inst: Inst) {
        let block = self.inst_block(inst).expect("instruction already removed");
        let node = &mut self.insts[inst];
        let prev = node.prev.take();
        let next = node.next.take();
        node.block = None.into();

        match prev {
            None => self.blocks[block].first_inst = next.into(),
            Some(prev) => self.insts[prev].next = next.into(),
        }
        match next {
            None => self.blocks[block].last_inst = prev.into(),
            Some(next) => self.insts[next].prev = prev.into(),
        }
    }

    pub fn first_inst(&self, block: Block) -> Option<Inst> {
        self.blocks[block].first_inst.expand()
    }

    pub fn last_inst(&self, block: Block) -> Option<Inst> {
        self.blocks[block].last_inst.expand()
    }

    pub fn next_inst(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].next.expand()
    }

    pub fn prev_inst(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].prev.expand()
    }

    /// Iterate over the instructions of `block` in layout order.
    pub fn block_insts(&self, block: Block) -> Insts<'_> {
        Insts { layout: self, head: self.blocks[block].first_inst.expand(), tail: self.blocks[block].last_inst.expand() }
    }
}

impl<'f> IntoIterator for &'f Layout {
    type Item = Block;
    type IntoIter = Blocks<'f>;

    fn into_iter(self) -> Blocks<'f> {
        self.blocks()
    }
}

pub struct Blocks<'f> {
    layout: &'f Layout,
    next: Option<Block>,
}

impl<'f> Iterator for Blocks<'f> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let curr = self.next?;
        self.next = self.layout.blocks[curr].next.expand();
        Some(curr)
    }
}

/// Double-ended iterator over the instructions of one block.
#[derive(Clone)]
pub struct Insts<'f> {
    layout: &'f Layout,
    head: Option<Inst>,
    tail: Option<Inst>,
}

impl<'f> Iterator for Insts<'f> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        let curr = self.head?;
        if self.head == self.tail {
            self.head = None;
            self.tail = None;
        } else {
            self.head = self.layout.insts[curr].next.expand();
        }
        Some(curr)
    }
}

impl<'f> DoubleEndedIterator for Insts<'f> {
    fn next_back(&mut self) -> Option<Inst> {
        let curr = self.tail?;
        if self.head == self.tail {
            self.head = None;
            self.tail = None;
        } else {
            self.tail = self.layout.insts[curr].prev.expand();
        }
        Some(curr)
    }
}
