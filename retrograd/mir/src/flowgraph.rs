//! A control flow graph represented as mappings of basic blocks to their
//! predecessors and successors.
//!
//! Successors are stored as a compact pair because no terminator of this IR
//! produces more than two; predecessors are stored as a sorted vector.

use std::cmp::Ordering;

use stdx::packed_option::PackedOption;
use typed_index_collections::TiVec;

use crate::{Block, Function, InstructionData};

#[cfg(test)]
mod tests;

/// A container for the successors and predecessors of some block.
#[derive(Clone, Default)]
pub struct CFGNode {
    /// Blocks that branch or jump to this block, sorted by block number.
    pub predecessors: Vec<Block>,

    /// Set of blocks that are the targets of branches and jumps in this
    /// block.
    pub successors: Successors,
}

/// At most two successors, kept sorted by block number.
#[derive(Clone, Default, Copy, PartialEq, Eq, Debug)]
pub struct Successors(pub PackedOption<Block>, pub PackedOption<Block>);

impl Successors {
    #[inline]
    pub fn clear(&mut self) {
        self.0 = None.into();
        self.1 = None.into();
    }

    #[inline]
    pub fn insert(&mut self, bb: Block) -> bool {
        let bb = PackedOption::from(bb);
        match self.0.cmp(&bb) {
            Ordering::Equal => false,
            Ordering::Less if self.0.is_some() => {
                debug_assert!(self.1.is_none() || self.1 == bb, "more than two successors");
                let changed = self.1 != bb;
                self.1 = bb;
                changed
            }
            _ => {
                // keep the pair sorted
                debug_assert!(self.1.is_none());
                self.1 = self.0;
                self.0 = bb;
                true
            }
        }
    }

    /// Remove and return the highest-numbered successor.
    #[inline]
    pub fn pop(&mut self) -> Option<Block> {
        if let Some(bb) = self.1.take() {
            Some(bb)
        } else {
            self.0.take()
        }
    }

    #[inline]
    pub fn contains(&self, bb: Block) -> bool {
        self.0 == bb.into() || self.1 == bb.into()
    }

    #[inline]
    pub fn as_pair(&self) -> Option<(Block, Block)> {
        Some((self.0.expand()?, self.1.expand()?))
    }

    #[inline]
    pub fn len(&self) -> usize {
        match (self.0.is_some(), self.1.is_some()) {
            (false, _) => 0,
            (true, false) => 1,
            (true, true) => 2,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    #[inline]
    pub fn iter(self) -> SuccIter {
        SuccIter(self)
    }
}

pub struct SuccIter(Successors);

impl Iterator for SuccIter {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let res = self.0 .0.take();
        self.0 .0 = self.0 .1.take().into();
        res
    }
}

/// The control flow graph maps all blocks in a function to their predecessor
/// and successor blocks.
#[derive(Clone, Default)]
pub struct ControlFlowGraph {
    pub data: TiVec<Block, CFGNode>,
    valid: bool,
}

impl ControlFlowGraph {
    /// Allocate a new blank control flow graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all data structures in this control flow graph.
    pub fn clear(&mut self) {
        self.data.clear();
        self.valid = false;
    }

    /// Allocate and compute the control flow graph for `func`.
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    /// Compute the control flow graph of `func`.
    ///
    /// This will clear and overwrite any information already stored in this
    /// data structure.
    pub fn compute(&mut self, func: &Function) {
        self.clear();
        self.data.resize(func.layout.num_blocks(), CFGNode::default());

        for block in &func.layout {
            self.compute_block(func, block);
        }

        self.valid = true;
    }

    fn compute_block(&mut self, func: &Function, block: Block) {
        if let Some(term) = func.layout.last_inst(block) {
            match func.dfg.insts[term] {
                InstructionData::Jump { destination } => self.add_edge(block, destination),
                InstructionData::Branch { then_dst, else_dst, .. } => {
                    self.add_edge(block, then_dst);
                    self.add_edge(block, else_dst);
                }
                _ => (),
            }
        }
    }

    fn add_edge(&mut self, from: Block, to: Block) {
        self.data[from].successors.insert(to);
        let preds = &mut self.data[to].predecessors;
        if let Err(pos) = preds.binary_search(&from) {
            preds.insert(pos, from);
        }
    }

    /// Get an iterator over the CFG predecessors to `block`.
    pub fn pred_iter(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.data[block].predecessors.iter().copied()
    }

    /// Get an iterator over the CFG successors to `block`.
    pub fn succ_iter(&self, block: Block) -> SuccIter {
        self.successors(block).iter()
    }

    pub fn successors(&self, block: Block) -> Successors {
        self.data[block].successors
    }

    pub fn num_predecessors(&self, block: Block) -> usize {
        self.data[block].predecessors.len()
    }

    /// Check if the CFG is in a valid state.
    ///
    /// Note that this doesn't perform any kind of validity checks. It simply
    /// checks if the `compute()` method has been called since the last
    /// `clear()`. It does not check that the CFG is consistent with the
    /// function.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}
