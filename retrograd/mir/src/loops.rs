//! Natural loop detection.
//!
//! A back edge is a CFG edge whose destination dominates its source; the
//! natural loop of a back edge is its destination (the header) plus every
//! block that can reach the source (a latch) without passing through the
//! header. Loops with the same header are merged. The forest records, per
//! loop, its body, latches and parent loop, and per block its innermost
//! containing loop.

use bitset::HybridBitSet;
use stdx::impl_idx_from;
use stdx::packed_option::{PackedOption, ReservedValue};
use typed_index_collections::TiVec;

use crate::{Block, ControlFlowGraph, DominatorTree, Function};

#[cfg(test)]
mod tests;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Loop(u32);
impl_idx_from!(Loop(u32));

impl ReservedValue for Loop {
    fn reserved_value() -> Self {
        Self(u32::MAX)
    }

    fn is_reserved_value(&self) -> bool {
        self.0 == u32::MAX
    }
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loop{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LoopData {
    pub header: Block,
    /// The innermost loop strictly containing this one.
    pub parent: PackedOption<Loop>,
    /// In-loop predecessors of the header.
    pub latches: Vec<Block>,
    /// All blocks of the loop, header included.
    pub blocks: HybridBitSet<Block>,
}

/// The loop forest of one function.
#[derive(Default)]
pub struct LoopForest {
    loops: TiVec<Loop, LoopData>,
    block_loop: TiVec<Block, PackedOption<Loop>>,
}

impl LoopForest {
    pub fn clear(&mut self) {
        self.loops.clear();
        self.block_loop.clear();
    }

    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph, dt: &DominatorTree) {
        self.clear();
        self.block_loop.resize(func.layout.num_blocks(), None.into());
        let num_blocks = func.layout.num_blocks();

        // Headers in reverse postorder, so outer loops come first and loop
        // numbering is stable under cloning.
        for &header in dt.cfg_postorder().iter().rev() {
            let latches: Vec<Block> =
                cfg.pred_iter(header).filter(|pred| {
                    dt.is_reachable(*pred) && dt.dominates(*pred, header)
                }).collect();
            if latches.is_empty() {
                continue;
            }

            let mut blocks = HybridBitSet::new_empty();
            blocks.insert(header, num_blocks);
            // Walk backwards from the latches; the header bounds the walk.
            let mut stack = latches.clone();
            while let Some(block) = stack.pop() {
                if blocks.insert(block, num_blocks) {
                    stack.extend(cfg.pred_iter(block));
                }
            }

            self.loops.push(LoopData { header, parent: None.into(), latches, blocks });
        }

        // Nesting: outer loops were created first (their headers dominate
        // inner headers, so they come earlier in reverse postorder). When a
        // loop is visited, its header's current assignment is therefore its
        // closest ancestor, and overwriting the body assignments leaves
        // every block with its innermost loop.
        let keys: Vec<Loop> = self.loops.keys().collect();
        for &lp in &keys {
            let header = self.loops[lp].header;
            self.loops[lp].parent = self.block_loop[header];
            for block in self.loops[lp].blocks.clone().iter() {
                self.block_loop[block] = lp.into();
            }
        }
    }

    pub fn num_loops(&self) -> usize {
        self.loops.len()
    }

    pub fn loops(&self) -> impl Iterator<Item = Loop> + ExactSizeIterator {
        self.loops.keys()
    }

    /// The innermost loop containing `block`, if any.
    pub fn loop_of(&self, block: Block) -> Option<Loop> {
        self.block_loop.get(block).and_then(|l| l.expand())
    }

    /// The loop headed by `block`, if any.
    pub fn loop_with_header(&self, block: Block) -> Option<Loop> {
        self.loops.iter_enumerated().find(|(_, data)| data.header == block).map(|(lp, _)| lp)
    }

    pub fn parent(&self, lp: Loop) -> Option<Loop> {
        self.loops[lp].parent.expand()
    }

    /// Iterate from `lp` outward through its ancestors, `lp` included.
    pub fn containing_loops(&self, lp: Loop) -> impl Iterator<Item = Loop> + '_ {
        std::iter::successors(Some(lp), |lp| self.parent(*lp))
    }

    /// The loop nesting depth of `block`; blocks outside any loop have
    /// depth 0.
    pub fn depth(&self, block: Block) -> usize {
        match self.loop_of(block) {
            Some(lp) => self.containing_loops(lp).count(),
            None => 0,
        }
    }

    pub fn contains_block(&self, lp: Loop, block: Block) -> bool {
        self.loops[lp].blocks.contains(block)
    }
}

impl std::ops::Index<Loop> for LoopForest {
    type Output = LoopData;

    fn index(&self, lp: Loop) -> &LoopData {
        &self.loops[lp]
    }
}
