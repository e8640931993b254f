//! Cursor library.
//!
//! This module defines cursor data types that can be used for inserting
//! instructions.

use crate::builder::InsertBuilder;
use crate::{Block, Function, Inst, SourceLoc};

/// The possible positions of a cursor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CursorPosition {
    /// Cursor is not pointing anywhere. No instructions can be inserted.
    Nowhere,
    /// Cursor is pointing at an existing instruction. New instructions will
    /// be inserted *before* the current instruction.
    At(Inst),
    /// Cursor is before the beginning of a block. No instructions can be
    /// inserted. Calling `next_inst()` will move to the first instruction in
    /// the block.
    Before(Block),
    /// Cursor is pointing after the end of a block. New instructions will be
    /// appended to the block.
    After(Block),
}

/// A cursor into one function, tracking an insertion position.
pub struct FuncCursor<'f> {
    pub func: &'f mut Function,
    pos: CursorPosition,
    srcloc: SourceLoc,
}

impl<'f> FuncCursor<'f> {
    pub fn new(func: &'f mut Function) -> Self {
        Self { func, pos: CursorPosition::Nowhere, srcloc: SourceLoc::default() }
    }

    /// Get the current cursor position.
    pub fn position(&self) -> CursorPosition {
        self.pos
    }

    pub fn set_position(&mut self, pos: CursorPosition) {
        self.pos = pos;
    }

    /// The source location that will be assigned to inserted instructions.
    pub fn srcloc(&self) -> SourceLoc {
        self.srcloc
    }

    pub fn set_srcloc(&mut self, srcloc: SourceLoc) {
        self.srcloc = srcloc;
    }

    /// Rebuild this cursor positioned at `inst`.
    pub fn at_inst(mut self, inst: Inst) -> Self {
        self.goto_inst(inst);
        self
    }

    /// Rebuild this cursor positioned at the bottom of `block`.
    pub fn at_bottom(mut self, block: Block) -> Self {
        self.goto_bottom(block);
        self
    }

    /// Rebuild this cursor positioned at the top of `block`.
    pub fn at_top(mut self, block: Block) -> Self {
        self.goto_top(block);
        self
    }

    /// Move to a specific instruction; new instructions will be inserted
    /// before it.
    pub fn goto_inst(&mut self, inst: Inst) {
        debug_assert!(self.func.layout.inst_block(inst).is_some());
        self.pos = CursorPosition::At(inst);
    }

    /// Move to the top of `block`, right after any leading phis; new
    /// instructions are inserted before the first non-phi instruction.
    pub fn goto_after_phis(&mut self, block: Block) {
        let first_non_phi = self
            .func
            .layout
            .block_insts(block)
            .find(|inst| !self.func.dfg.insts[*inst].is_phi());
        match first_non_phi {
            Some(inst) => self.goto_inst(inst),
            None => self.goto_bottom(block),
        }
    }

    /// Move to the top of `block`; new instructions are inserted before the
    /// first existing instruction.
    pub fn goto_top(&mut self, block: Block) {
        match self.func.layout.first_inst(block) {
            Some(inst) => self.goto_inst(inst),
            None => self.goto_bottom(block),
        }
    }

    /// Move to the bottom of `block`; new instructions are appended.
    pub fn goto_bottom(&mut self, block: Block) {
        debug_assert!(self.func.layout.is_block_inserted(block));
        self.pos = CursorPosition::After(block);
    }

    /// Move just before the terminator of `block`. Panics if the block has no
    /// terminator.
    pub fn goto_before_terminator(&mut self, block: Block) {
        let term = self.func.layout.last_inst(block).expect("block has no terminator");
        debug_assert!(self.func.dfg.insts[term].is_terminator());
        self.goto_inst(term);
    }

    /// The block the cursor currently points into.
    pub fn current_block(&self) -> Option<Block> {
        match self.pos {
            CursorPosition::Nowhere => None,
            CursorPosition::At(inst) => self.func.layout.inst_block(inst),
            CursorPosition::Before(block) | CursorPosition::After(block) => Some(block),
        }
    }

    /// Advance to the next instruction, crossing into the next block at
    /// block boundaries. Returns the instruction moved onto.
    pub fn next_inst(&mut self) -> Option<Inst> {
        match self.pos {
            CursorPosition::Nowhere => None,
            CursorPosition::At(inst) => match self.func.layout.next_inst(inst) {
                Some(next) => {
                    self.pos = CursorPosition::At(next);
                    Some(next)
                }
                None => {
                    let block = self.func.layout.inst_block(inst).unwrap();
                    self.pos = CursorPosition::After(block);
                    None
                }
            },
            CursorPosition::Before(block) => match self.func.layout.first_inst(block) {
                Some(next) => {
                    self.pos = CursorPosition::At(next);
                    Some(next)
                }
                None => {
                    self.pos = CursorPosition::After(block);
                    None
                }
            },
            CursorPosition::After(_) => None,
        }
    }

    /// Insert an already-created instruction at the cursor position.
    pub fn insert_inst(&mut self, inst: Inst) {
        match self.pos {
            CursorPosition::Nowhere | CursorPosition::Before(_) => {
                panic!("cannot insert instruction at {:?}", self.pos)
            }
            CursorPosition::At(before) => self.func.layout.insert_inst(inst, before),
            CursorPosition::After(block) => self.func.layout.append_inst_to_bb(inst, block),
        }
        self.func.srclocs_set(inst, self.srcloc);
    }

    /// Create an instruction builder inserting at the cursor position.
    pub fn ins<'a>(&'a mut self) -> InsertBuilder<'a, 'f> {
        InsertBuilder::new(self)
    }
}
