//! Loop canonicalization.
//!
//! The reverse sweep re-runs every loop backwards, which requires each loop
//! to expose a canonical shape: a preheader, a single latch, a single live
//! exit, a 0-based unit-step induction variable and a trip count. Loops
//! whose trip count cannot be recovered from the exit condition get the
//! `dynamic` treatment: a counter cell written per iteration and read back
//! by the reverse sweep.

use bitset::HybridBitSet;
use mir::cursor::FuncCursor;
use mir::{
    consts, Block, ControlFlowGraph, DominatorTree, Function, Inst, InstructionData, LoopForest,
    Opcode, PhiNode, Value,
};

use crate::AutodiffError;

#[derive(Clone, Copy, Debug)]
pub(crate) enum TripCount {
    /// Loop-invariant iteration count.
    Static(Value),
    /// Unknown at entry; the cell holds the executed iteration count.
    Dynamic { cell: Value },
}

#[derive(Debug)]
pub(crate) struct LoopCtx {
    pub header: Block,
    pub preheader: Block,
    pub latch: Block,
    /// The in-loop block carrying the exit branch.
    pub exiting: Block,
    /// The out-of-loop block the exit branch targets.
    pub exit: Block,
    /// Canonical induction variable: a header phi starting at 0, stepping
    /// by one in the latch.
    pub iv: Value,
    pub iv_next: Value,
    pub trip_count: TripCount,
    pub parent: Option<usize>,
    pub blocks: HybridBitSet<Block>,
}

impl LoopCtx {
    pub fn is_dynamic(&self) -> bool {
        matches!(self.trip_count, TripCount::Dynamic { .. })
    }

    pub fn contains(&self, block: Block) -> bool {
        self.blocks.contains(block)
    }
}

/// Canonicalize every natural loop of `func`. Dynamic counter cells are
/// allocated in `alloc_block`.
pub(crate) fn canonicalize_loops(
    func: &mut Function,
    alloc_block: Block,
) -> Result<Vec<LoopCtx>, AutodiffError> {
    let mut cfg = ControlFlowGraph::with_function(func);
    let mut dt = DominatorTree::default();
    dt.compute(func, &cfg, true, false, true);
    let mut forest = LoopForest::default();
    forest.compute(func, &cfg, &dt);

    let mut ctxs: Vec<LoopCtx> = Vec::new();
    let mut loop_index: Vec<(mir::Loop, usize)> = Vec::new();

    for lp in forest.loops().collect::<Vec<_>>() {
        let header = forest[lp].header;
        let blocks = forest[lp].blocks.clone();

        let latch = match forest[lp].latches.as_slice() {
            [latch] => *latch,
            _ => return Err(AutodiffError::MultipleLatches { header }),
        };

        let (exiting, exit) = find_live_exit(func, &cfg, &dt, &blocks, header)?;
        let preheader = ensure_preheader(func, &mut cfg, header, latch);

        let (iv, iv_next) = canonical_iv(func, header, preheader, latch, &blocks);
        rewrite_congruent_phis(func, header, preheader, latch, iv);

        let trip_count = trip_count(func, &blocks, header, latch, exiting, iv, iv_next);
        let trip_count = match trip_count {
            Some(bound) => TripCount::Static(bound),
            None => {
                let cell = dynamic_counter(func, alloc_block, preheader, latch, iv_next);
                TripCount::Dynamic { cell }
            }
        };

        let parent = forest.parent(lp).and_then(|parent| {
            loop_index.iter().find(|(other, _)| *other == parent).map(|(_, idx)| *idx)
        });
        if matches!(trip_count, TripCount::Dynamic { .. }) {
            let mut ancestor = parent;
            while let Some(idx) = ancestor {
                if ctxs[idx].is_dynamic() {
                    return Err(AutodiffError::UnboundedLoop { header });
                }
                ancestor = ctxs[idx].parent;
            }
        }

        loop_index.push((lp, ctxs.len()));
        ctxs.push(LoopCtx {
            header,
            preheader,
            latch,
            exiting,
            exit,
            iv,
            iv_next,
            trip_count,
            parent,
            blocks,
        });
    }

    Ok(ctxs)
}

/// Find the unique live exit edge of the loop. Exit targets that only fall
/// into `unreachable` (possibly through a chain of jumps) are dead and do
/// not count.
fn find_live_exit(
    func: &Function,
    cfg: &ControlFlowGraph,
    dt: &DominatorTree,
    blocks: &HybridBitSet<Block>,
    header: Block,
) -> Result<(Block, Block), AutodiffError> {
    let mut live: Option<(Block, Block)> = None;
    for block in blocks.iter() {
        if !dt.is_reachable(block) {
            continue;
        }
        for succ in cfg.succ_iter(block) {
            if blocks.contains(succ) || ends_in_unreachable(func, succ) {
                continue;
            }
            match live {
                None => live = Some((block, succ)),
                Some(found) if found == (block, succ) => (),
                Some(_) => return Err(AutodiffError::MultipleLiveExits { header }),
            }
        }
    }
    live.ok_or(AutodiffError::MultipleLiveExits { header })
}

/// Walk straight-line successors; `true` if control inevitably reaches an
/// `unreachable` terminator.
pub(crate) fn ends_in_unreachable(func: &Function, mut block: Block) -> bool {
    let mut fuel = func.layout.num_blocks();
    loop {
        let Some(term) = func.layout.last_inst(block) else { return false };
        match func.dfg.insts[term] {
            InstructionData::Unreachable => return true,
            InstructionData::Jump { destination } if fuel > 0 => {
                fuel -= 1;
                block = destination;
            }
            _ => return false,
        }
    }
}

/// Make sure the header has a dedicated preheader: a single edge from
/// outside the loop, ending in an unconditional jump.
fn ensure_preheader(
    func: &mut Function,
    cfg: &mut ControlFlowGraph,
    header: Block,
    latch: Block,
) -> Block {
    let outside: Vec<Block> = cfg.pred_iter(header).filter(|pred| *pred != latch).collect();

    if let [single] = outside.as_slice() {
        let term = func.layout.last_inst(*single).unwrap();
        if matches!(func.dfg.insts[term], InstructionData::Jump { .. }) {
            return *single;
        }
    }

    let preheader = func.layout.make_block();
    func.layout.insert_block(preheader, header);

    // Retarget every outside edge onto the new block.
    for pred in &outside {
        let term = func.layout.last_inst(*pred).unwrap();
        let data = match func.dfg.insts[term].clone() {
            InstructionData::Jump { destination } if destination == header => {
                InstructionData::Jump { destination: preheader }
            }
            InstructionData::Branch { cond, then_dst, else_dst } => InstructionData::Branch {
                cond,
                then_dst: if then_dst == header { preheader } else { then_dst },
                else_dst: if else_dst == header { preheader } else { else_dst },
            },
            data => data,
        };
        func.dfg.update_inst(term, data);
    }

    // Migrate the header's phi edges from the outside predecessors.
    let phis: Vec<Inst> = func
        .layout
        .block_insts(header)
        .take_while(|inst| func.dfg.insts[*inst].is_phi())
        .collect();
    for phi in phis {
        if let [single] = outside.as_slice() {
            func.dfg.rewrite_phi_pred(phi, *single, preheader);
        } else {
            let node = func.dfg.insts[phi].unwrap_phi().clone();
            let mut inner: Vec<(Block, Value)> = Vec::new();
            let mut moved: Vec<(Block, Value)> = Vec::new();
            for (pred, val) in func.dfg.phi_edges(&node).collect::<Vec<_>>() {
                if outside.contains(&pred) {
                    moved.push((pred, val));
                } else {
                    inner.push((pred, val));
                }
            }
            let mut cursor = FuncCursor::new(func).at_bottom(preheader);
            let merged = cursor.ins().phi(&moved);
            inner.push((preheader, merged));
            let data = rebuild_phi(func, &inner);
            func.dfg.update_inst(phi, data);
        }
    }

    let mut cursor = FuncCursor::new(func).at_bottom(preheader);
    cursor.ins().jmp(header);

    cfg.compute(func);
    preheader
}

fn rebuild_phi(func: &mut Function, edges: &[(Block, Value)]) -> InstructionData {
    let pools = &mut func.dfg.insts.pools;
    let mut args = mir::ValueList::new();
    let mut blocks = mir::BlockList::new();
    for (block, val) in edges {
        args.push(*val, &mut pools.value_lists);
        blocks.push(*block, &mut pools.block_lists);
    }
    PhiNode { args, blocks }.into()
}

/// Find or insert the canonical induction variable: a header phi that is 0
/// from the preheader and incremented by one in the latch.
fn canonical_iv(
    func: &mut Function,
    header: Block,
    preheader: Block,
    latch: Block,
    blocks: &HybridBitSet<Block>,
) -> (Value, Value) {
    for inst in func.layout.block_insts(header) {
        let InstructionData::PhiNode(phi) = &func.dfg.insts[inst] else { break };
        let res = func.dfg.first_result(inst);
        let Some(init) = func.dfg.phi_edge_val(phi, preheader) else { continue };
        let Some(step) = func.dfg.phi_edge_val(phi, latch) else { continue };
        if init != consts::ZERO {
            continue;
        }
        if let mir::ValueDef::Result(step_inst, _) = func.dfg.value_def(step) {
            if !blocks.contains(func.layout.inst_block(step_inst).unwrap()) {
                continue;
            }
            if let InstructionData::Binary { opcode: Opcode::Iadd, args } =
                func.dfg.insts[step_inst]
            {
                if args == [res, consts::ONE] || args == [consts::ONE, res] {
                    return (res, step);
                }
            }
        }
    }

    // No canonical induction variable; fabricate one.
    let phi_inst = {
        let at = func.layout.first_inst(header).unwrap();
        let mut cursor = FuncCursor::new(func).at_inst(at);
        let iv = cursor.ins().phi(&[(preheader, consts::ZERO)]);
        func.dfg.value_def(iv).unwrap_inst()
    };
    let iv = func.dfg.first_result(phi_inst);
    let iv_next = {
        let mut cursor = FuncCursor::new(func);
        cursor.goto_before_terminator(latch);
        cursor.ins().iadd(iv, consts::ONE)
    };
    func.dfg.insert_phi_edge(phi_inst, latch, iv_next);
    (iv, iv_next)
}

/// Rewrite header phis that are affine in the canonical induction variable
/// (`init` from the preheader, `+= c` in the loop) as `init + iv * c` and
/// erase them.
fn rewrite_congruent_phis(
    func: &mut Function,
    header: Block,
    preheader: Block,
    latch: Block,
    iv: Value,
) {
    let phis: Vec<Inst> = func
        .layout
        .block_insts(header)
        .take_while(|inst| func.dfg.insts[*inst].is_phi())
        .collect();

    for phi in phis {
        let res = func.dfg.first_result(phi);
        if res == iv {
            continue;
        }
        let node = func.dfg.insts[phi].unwrap_phi().clone();
        if func.dfg.phi_edges(&node).count() != 2 {
            continue;
        }
        let Some(init) = func.dfg.phi_edge_val(&node, preheader) else { continue };
        let Some(step) = func.dfg.phi_edge_val(&node, latch) else { continue };
        let mir::ValueDef::Result(step_inst, _) = func.dfg.value_def(step) else { continue };
        let InstructionData::Binary { opcode: Opcode::Iadd, args } = func.dfg.insts[step_inst]
        else {
            continue;
        };
        let stride = match args {
            [lhs, stride] if lhs == res => stride,
            [stride, rhs] if rhs == res => stride,
            _ => continue,
        };
        if !matches!(func.dfg.value_def(stride), mir::ValueDef::Const(_)) {
            continue;
        }
        // Only erase when the increment feeds nothing but the phi.
        let step_uses = func.dfg.uses(step).count();
        if step_uses != 1 {
            continue;
        }

        let affine = {
            let mut cursor = FuncCursor::new(func);
            cursor.goto_after_phis(header);
            let scaled = cursor.ins().imul(iv, stride);
            cursor.ins().iadd(init, scaled)
        };
        func.dfg.replace_uses(res, affine);
        func.dfg.zap_inst(phi);
        func.layout.remove_inst(phi);
        if func.dfg.instr_safe_to_remove(step_inst) {
            func.dfg.zap_inst(step_inst);
            func.layout.remove_inst(step_inst);
        }
    }
}

/// Recover a loop-invariant trip count from the exit condition. The
/// supported shapes are `ilt iv, n` at the header and `ilt iv_next, n` at
/// the latch (and their `ige` negations), with the loop body on the
/// matching side of the branch.
fn trip_count(
    func: &Function,
    blocks: &HybridBitSet<Block>,
    header: Block,
    latch: Block,
    exiting: Block,
    iv: Value,
    iv_next: Value,
) -> Option<Value> {
    let term = func.layout.last_inst(exiting)?;
    let InstructionData::Branch { cond, then_dst, else_dst } = func.dfg.insts[term] else {
        return None;
    };
    let stays_on_true = blocks.contains(then_dst) && !blocks.contains(else_dst);
    let stays_on_false = blocks.contains(else_dst) && !blocks.contains(then_dst);
    if !stays_on_true && !stays_on_false {
        return None;
    }

    let mir::ValueDef::Result(cmp, _) = func.dfg.value_def(cond) else { return None };
    let InstructionData::Binary { opcode, args: [lhs, rhs] } = func.dfg.insts[cmp] else {
        return None;
    };
    // `ilt iv, n` keeps looping while true; `ige iv, n` exits while true.
    let continue_cmp = match (opcode, stays_on_true) {
        (Opcode::Ilt, true) | (Opcode::Ige, false) => true,
        _ => false,
    };
    if !continue_cmp {
        return None;
    }

    let counter_matches =
        (exiting == header && lhs == iv) || (exiting == latch && lhs == iv_next);
    if !counter_matches {
        return None;
    }

    // The bound must be loop-invariant.
    let invariant = match func.dfg.value_def(rhs) {
        mir::ValueDef::Result(inst, _) => {
            !blocks.contains(func.layout.inst_block(inst).unwrap())
        }
        mir::ValueDef::Param(_) | mir::ValueDef::Const(_) => true,
        mir::ValueDef::Invalid => false,
    };
    invariant.then_some(rhs)
}

/// The dynamic trip-count path: a counter cell zeroed in the preheader and
/// bumped to `iv_next` in the latch, so it ends up holding the executed
/// iteration count.
fn dynamic_counter(
    func: &mut Function,
    alloc_block: Block,
    preheader: Block,
    latch: Block,
    iv_next: Value,
) -> Value {
    let mut cursor = FuncCursor::new(func);
    cursor.goto_top(alloc_block);
    let eight = cursor.func.dfg.iconst(8);
    let cell = cursor.ins().alloca(eight);

    cursor.goto_before_terminator(preheader);
    cursor.ins().store(consts::ZERO, cell);

    cursor.goto_before_terminator(latch);
    cursor.ins().store(iv_next, cell);

    cell
}
