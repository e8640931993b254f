use crate::instructions::{PhiEdges, PhiNode};
use crate::{Block, DataFlowGraph, Inst, Value};

impl DataFlowGraph {
    /// Set the value flowing into `inst` from `block`, adding the edge if it
    /// does not exist yet.
    pub fn insert_phi_edge(&mut self, inst: Inst, block: Block, val: Value) {
        let PhiNode { mut args, mut blocks } = self.insts.declarations[inst].unwrap_phi().clone();
        match blocks.as_slice(&self.insts.pools.block_lists).iter().position(|it| *it == block) {
            Some(pos) => self.set_operand_value(inst, pos as u16, val),
            None => {
                blocks.push(block, &mut self.insts.pools.block_lists);
                let pos = args.push(val, &mut self.insts.pools.value_lists);
                let use_ = self.values.make_use(val, inst, pos as u16);
                self.insts.uses[inst].push(use_, &mut self.insts.pools.use_lists);
                self.insts[inst] = PhiNode { blocks, args }.into();
            }
        }
    }

    /// Redirect the phi edge coming in from `old_pred` to come in from
    /// `new_pred` instead. The incoming value is unchanged.
    pub fn rewrite_phi_pred(&mut self, inst: Inst, old_pred: Block, new_pred: Block) {
        let phi = self.insts.declarations[inst].unwrap_phi().clone();
        if let Some(pos) =
            phi.blocks.as_slice(&self.insts.pools.block_lists).iter().position(|it| *it == old_pred)
        {
            phi.blocks.as_mut_slice(&mut self.insts.pools.block_lists)[pos] = new_pred;
        }
    }

    pub fn phi_edges<'a>(&'a self, phi: &PhiNode) -> PhiEdges<'a> {
        phi.edges(&self.insts.pools)
    }

    pub fn phi_edge_val(&self, phi: &PhiNode, pred: Block) -> Option<Value> {
        phi.edge_val(pred, &self.insts.pools)
    }
}
