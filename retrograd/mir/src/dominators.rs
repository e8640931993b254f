use std::cmp::Ordering;

use stdx::packed_option::PackedOption;
use typed_index_collections::{TiSlice, TiVec};

use crate::flowgraph::Successors;
use crate::{Block, ControlFlowGraph, Function};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct DomTreeNode {
    /// Number of this node in a (reverse) post-order traversal of the CFG,
    /// starting from 1. This number is monotonic in the reverse postorder.
    /// Unreachable nodes get number 0, all others are positive.
    rpo_number: u32,

    /// The immediate dominator of this block.
    ///
    /// This is `None` for unreachable blocks and the entry block which
    /// doesn't have an immediate dominator.
    idom: PackedOption<Block>,
}

const UNDEF: u32 = 0;
const DONE: u32 = 1;
const SEEN: u32 = 2;

#[derive(Default)]
pub struct DominatorTree {
    nodes: TiVec<Block, DomTreeNode>,
    reverse_nodes: TiVec<Block, DomTreeNode>,
    /// CFG post-order of all reachable blocks.
    postorder: Vec<Block>,
    stack: Vec<(Block, Successors)>,
}

impl DominatorTree {
    /// Reset and compute a CFG post-order, dominator tree and/or
    /// postdominator tree.
    pub fn compute(
        &mut self,
        func: &Function,
        cfg: &ControlFlowGraph,
        dom: bool,
        pdom: bool,
        postorder: bool,
    ) {
        debug_assert!(cfg.is_valid());

        self.clear();
        if pdom {
            self.compute_reverse_postorder(func, cfg);
            self.compute_domtree::<true>(cfg);
            self.postorder.clear();
        }

        if dom || postorder {
            self.compute_postorder(func, cfg);
        }
        if dom {
            self.compute_domtree::<false>(cfg);
        }
    }

    /// Clear the data structures used to represent the dominator tree.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.reverse_nodes.clear();
        self.postorder.clear();
        debug_assert!(self.stack.is_empty());
    }

    /// Get the CFG post-order of blocks that was used to compute the
    /// dominator tree.
    ///
    /// This post-order is not updated automatically when the CFG is
    /// modified. It is computed from scratch and cached by `compute()`.
    pub fn cfg_postorder(&self) -> &[Block] {
        &self.postorder
    }

    /// Is `block` reachable from the entry?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.nodes[block].rpo_number != UNDEF
    }

    pub fn dominates(&self, block: Block, dominator: Block) -> bool {
        Self::dominates_(&self.nodes, block, dominator)
    }

    pub fn post_dominates(&self, block: Block, dominator: Block) -> bool {
        Self::dominates_(&self.reverse_nodes, block, dominator)
    }

    fn dominates_(nodes: &TiSlice<Block, DomTreeNode>, mut block: Block, dominator: Block) -> bool {
        while nodes[block].rpo_number > nodes[dominator].rpo_number {
            if let Some(parent) = nodes[block].idom.expand() {
                block = parent;
            } else {
                return false;
            }
        }
        block == dominator
    }

    /// The immediate dominator of `block`, or `None` for the entry and for
    /// unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.nodes[block].idom.expand()
    }

    /// The immediate postdominator of `block`.
    pub fn ipdom(&self, block: Block) -> Option<Block> {
        self.reverse_nodes[block].idom.expand()
    }

    /// Compare two blocks by their position in the reverse postorder; the
    /// entry block compares smallest.
    pub fn rpo_cmp(&self, a: Block, b: Block) -> Ordering {
        self.nodes[b].rpo_number.cmp(&self.nodes[a].rpo_number)
    }

    /// Reset all internal data structures and compute a post-order of the
    /// reverse control flow graph, rooted at the layout's last block.
    ///
    /// During this algorithm only, use `rpo_number` to hold the following
    /// state:
    ///
    ///   UNDEF: block has not yet been reached in the pre-order.
    ///   SEEN:  block has been pushed on the stack but successors not yet
    ///          pushed.
    ///   DONE:  successors pushed.
    fn compute_reverse_postorder(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.reverse_nodes.clear();
        self.reverse_nodes.resize(func.layout.num_blocks(), DomTreeNode::default());
        match func.layout.last_block() {
            Some(block) => {
                self.stack.push((block, Successors::default()));
                self.reverse_nodes[block].rpo_number = SEEN;
            }
            None => return,
        }

        while let Some((block, _)) = self.stack.pop() {
            match self.reverse_nodes[block].rpo_number {
                SEEN => {
                    // The first pop; scan predecessors, then revisit.
                    self.reverse_nodes[block].rpo_number = DONE;
                    self.stack.push((block, Successors::default()));

                    for block in cfg.pred_iter(block) {
                        if self.reverse_nodes[block].rpo_number == UNDEF {
                            self.reverse_nodes[block].rpo_number = SEEN;
                            self.stack.push((block, Successors::default()));
                        }
                    }
                }
                DONE => {
                    // The second pop; all predecessors have been processed.
                    self.postorder.push(block);
                }
                _ => unreachable!(),
            }
        }
    }

    /// Reset all internal data structures and compute a post-order of the
    /// control flow graph.
    fn compute_postorder(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.nodes.clear();
        self.nodes.resize(func.layout.num_blocks(), DomTreeNode::default());

        match func.layout.entry_block() {
            Some(block) => {
                self.stack.push((block, cfg.successors(block)));
                self.nodes[block].rpo_number = SEEN;
            }
            None => return,
        }

        loop {
            while let Some(block) = self.stack.last_mut().and_then(|(_, succ)| succ.pop()) {
                if self.nodes[block].rpo_number == UNDEF {
                    self.nodes[block].rpo_number = SEEN;
                    self.stack.push((block, cfg.successors(block)))
                }
            }

            if let Some((bb, _)) = self.stack.pop() {
                self.nodes[bb].rpo_number = DONE;
                self.postorder.push(bb)
            } else {
                break;
            }
        }
        debug_assert_eq!(self.postorder.last().copied(), func.layout.entry_block());
    }

    /// Build a dominator tree from a control flow graph using Keith D.
    /// Cooper's "Simple, Fast Dominator Algorithm".
    fn compute_domtree<const REVERSE: bool>(&mut self, cfg: &ControlFlowGraph) {
        // During this algorithm, `rpo_number` has the following values:
        //
        // 0: block is not reachable.
        // 1: block is reachable, but has not yet been visited during the
        //    first pass. This is set by `compute_postorder`.
        // 2+: block is reachable and has an assigned RPO number.

        // We'll be iterating over a reverse post-order of the CFG, skipping
        // the entry block.
        let (entry_block, postorder) = match self.postorder.as_slice().split_last() {
            Some((&eb, rest)) => (eb, rest),
            None => return,
        };

        // Do a first pass where we assign RPO numbers to all reachable
        // nodes.
        let nodes = if REVERSE { &mut self.reverse_nodes } else { &mut self.nodes };
        nodes[entry_block].rpo_number = 2;
        for (rpo_idx, &block) in postorder.iter().rev().enumerate() {
            // Update the current node and give it an RPO number. The entry
            // block got 2, the rest start at 3.
            //
            // Since `compute_idom` will only look at nodes with an assigned
            // RPO number, the function will never see an uninitialized
            // predecessor.
            //
            // Due to the nature of the post-order traversal, every node we
            // visit will have at least one predecessor that has previously
            // been visited during this RPO.
            let node = DomTreeNode {
                rpo_number: rpo_idx as u32 + 3,
                idom: self.compute_idom::<REVERSE>(block, cfg).into(),
            };

            let nodes = if REVERSE { &mut self.reverse_nodes } else { &mut self.nodes };
            nodes[block] = node;
        }

        // Iterate until convergence.
        //
        // If the function is free of irreducible control flow, this will
        // exit after one iteration.
        let mut changed = true;
        while changed {
            changed = false;
            for &block in postorder.iter().rev() {
                let idom = self.compute_idom::<REVERSE>(block, cfg).into();
                let nodes = if REVERSE { &mut self.reverse_nodes } else { &mut self.nodes };
                if nodes[block].idom != idom {
                    nodes[block].idom = idom;
                    changed = true;
                }
            }
        }
    }

    fn compute_idom<const REVERSE: bool>(&self, block: Block, cfg: &ControlFlowGraph) -> Block {
        if REVERSE {
            Self::compute_idom_(&self.reverse_nodes, cfg.succ_iter(block))
        } else {
            Self::compute_idom_(&self.nodes, cfg.pred_iter(block))
        }
    }

    /// Compute the immediate dominator for `block` using the current `idom`
    /// states for the reachable nodes.
    fn compute_idom_(
        nodes: &TiSlice<Block, DomTreeNode>,
        preds: impl Iterator<Item = Block>,
    ) -> Block {
        // Get an iterator with just the reachable, already visited
        // predecessors to `block`. Note that during the first pass,
        // `rpo_number` is 1 for reachable blocks that haven't been visited
        // yet, 0 for unreachable blocks.
        let mut reachable_preds = preds.filter(|bb| nodes[*bb].rpo_number > 1);

        // The RPO must visit at least one predecessor before this node.
        let mut idom =
            reachable_preds.next().expect("block node must have one reachable predecessor");

        for pred in reachable_preds {
            idom = Self::common_dominator(nodes, idom, pred);
        }

        idom
    }

    fn common_dominator(
        nodes: &TiSlice<Block, DomTreeNode>,
        mut bb1: Block,
        mut bb2: Block,
    ) -> Block {
        loop {
            let rpo1 = nodes[bb1].rpo_number;
            let rpo2 = nodes[bb2].rpo_number;
            match rpo1.cmp(&rpo2) {
                Ordering::Less => bb2 = nodes[bb2].idom.expect("unreachable basic block?"),
                Ordering::Greater => bb1 = nodes[bb1].idom.expect("unreachable basic block?"),
                Ordering::Equal => return bb1,
            }
        }
    }
}
