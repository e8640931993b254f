//! Gradient synthesis.
//!
//! `create_primal_and_gradient` clones the primal, runs type and activity
//! analysis, canonicalizes loops, mirrors duplicated pointers into shadow
//! values, fabricates the reverse control-flow graph and emits per-opcode
//! pullbacks into it. `create_augmented_primal` produces the forward
//! variant with spliced shadow parameters used at differentiated call
//! sites.

use ahash::AHashMap;
use mir::cursor::FuncCursor;
use mir::{
    consts, Block, ControlFlowGraph, DominatorTree, Function, FunctionSignature, Inst,
    InstructionData, LoopForest, Opcode, Param, Value,
};
use mir_ty::FnTypeInfo;
use smallvec::SmallVec;

use crate::activity::{Activity, ArgActivity};
use crate::loops::{canonicalize_loops, ends_in_unreachable, TripCount};
use crate::utils::{AugCall, CacheSlot, GradientUtils, RevLoop};
use crate::{AutodiffCtx, AutodiffError, ReturnShape, SynthKey};

#[cfg(test)]
mod tests;

/// Synthesize the primal-and-gradient variant of `%name`.
///
/// The result takes the primal arguments (duplicated pointers spliced with
/// their shadows), the incoming adjoint of the primary return value when
/// `differential_return` is set, and the slots of the augmented primal's
/// tape when `tape` is set; it returns the primal results (when
/// `return_primal`) followed by the adjoints of the scalar-active
/// arguments in declaration order. The synthesized function is registered
/// in the context under the returned name.
pub fn create_primal_and_gradient(
    ctx: &mut AutodiffCtx,
    name: &str,
    args: &[ArgActivity],
    return_primal: bool,
    differential_return: bool,
    top_level: bool,
    tape: bool,
) -> Result<String, AutodiffError> {
    let shape = if return_primal { ReturnShape::ArgsWithReturn } else { ReturnShape::Args };
    let key = SynthKey {
        name: name.to_owned(),
        args: args.to_vec(),
        return_primal,
        differential_return,
        shape,
        tape,
    };
    if let Some(existing) = ctx.gradients.get(&key) {
        return Ok(existing.clone());
    }
    if ctx.synthesis_stack.contains(name) {
        return Err(AutodiffError::RecursiveCall { name: name.to_owned() });
    }

    ctx.synthesis_stack.insert(name.to_owned());
    let res = build_gradient(ctx, &key, top_level);
    ctx.synthesis_stack.remove(name);

    let grad_name = res?;
    ctx.gradients.insert(key, grad_name.clone());
    Ok(grad_name)
}

/// Synthesize the augmented primal of `%name`: the forward pass with
/// shadow parameters spliced next to every duplicated pointer and the tape
/// appended to its returns. The tape carries the loads out of duplicated
/// memory (outside loops) whose values the paired gradient cannot soundly
/// re-execute once later stores have clobbered them.
pub fn create_augmented_primal(
    ctx: &mut AutodiffCtx,
    name: &str,
    args: &[ArgActivity],
    differential_return: bool,
) -> Result<String, AutodiffError> {
    let key = SynthKey {
        name: name.to_owned(),
        args: args.to_vec(),
        return_primal: true,
        differential_return,
        shape: ReturnShape::Normal,
        tape: false,
    };
    if let Some(existing) = ctx.augmented.get(&key) {
        return Ok(existing.clone());
    }
    if ctx.synthesis_stack.contains(name) {
        return Err(AutodiffError::RecursiveCall { name: name.to_owned() });
    }

    ctx.synthesis_stack.insert(name.to_owned());
    let res = build_augmented(ctx, &key);
    ctx.synthesis_stack.remove(name);

    let aug_name = res?;
    ctx.augmented.insert(key, aug_name.clone());
    Ok(aug_name)
}

fn analyze_primal(
    ctx: &mut AutodiffCtx,
    name: &str,
    args: &[ArgActivity],
    differential_return: bool,
) -> Result<(Function, Activity, std::rc::Rc<mir_ty::TypeResults>), AutodiffError> {
    let primal = ctx.function(name)?.clone();
    let seeds = args
        .iter()
        .map(|activity| match activity {
            ArgActivity::Active => mir_ty::TypeTree::scalar(mir_ty::ConcreteType::DOUBLE),
            ArgActivity::Dup => mir_ty::TypeTree::scalar(mir_ty::ConcreteType::Pointer),
            ArgActivity::Const => mir_ty::TypeTree::new(),
        })
        .collect();
    let info = FnTypeInfo::new(seeds);
    let types = ctx.types.analyze(&ctx.registry, &primal, info)?;
    let activity =
        Activity::build(&primal, &types, args, differential_return, ctx.config.trace_activity);
    Ok((primal, activity, types))
}

fn unique_name(ctx: &AutodiffCtx, base: String) -> String {
    if !ctx.registry.contains_key(&base) {
        return base;
    }
    let mut n = 1usize;
    loop {
        let candidate = format!("{base}.{n}");
        if !ctx.registry.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn build_gradient(
    ctx: &mut AutodiffCtx,
    key: &SynthKey,
    top_level: bool,
) -> Result<String, AutodiffError> {
    let (primal, activity, types) =
        analyze_primal(ctx, &key.name, &key.args, key.differential_return)?;
    let dump_ir = ctx.config.dump_ir;
    if dump_ir {
        log::info!("gradient of:\n{:?}", primal);
    }

    let grad_name = unique_name(ctx, format!("{}.grad", key.name));
    let mut utils = GradientUtils::new(
        ctx,
        &primal,
        grad_name.clone(),
        activity,
        types,
        key.differential_return,
        key.shape,
        top_level,
    )?;

    utils.loops = canonicalize_loops(&mut utils.func, utils.alloc_block)?;
    utils.rev_loops = vec![None; utils.loops.len()];

    forward_pass(&mut utils, !top_level, true)?;
    if key.tape {
        install_tape_params(&mut utils);
    }

    // Dominance of the primal part, frozen before any reverse block exists.
    let cfg = ControlFlowGraph::with_function(&utils.func);
    utils.domtree.compute(&utils.func, &cfg, true, false, true);

    ReverseBuilder::new(&mut utils, &cfg).run()?;

    // Stores whose pullback took ownership of the memory's derivative are
    // detached only now; the reverse sweep above still emitted their
    // adjoints.
    for inst in std::mem::take(&mut utils.deleted_stores) {
        utils.func.dfg.zap_inst(inst);
        utils.func.layout.remove_inst(inst);
    }

    if dump_ir {
        log::info!("synthesized:\n{:?}", utils.func);
    }
    if let Err(errors) = mir::validation::validate(&utils.func) {
        return Err(AutodiffError::Verifier { first: errors[0].to_string() });
    }

    let func = utils.func;
    ctx.registry.insert(grad_name.clone(), func);
    Ok(grad_name)
}

fn build_augmented(ctx: &mut AutodiffCtx, key: &SynthKey) -> Result<String, AutodiffError> {
    let (primal, activity, types) =
        analyze_primal(ctx, &key.name, &key.args, key.differential_return)?;

    let aug_name = unique_name(ctx, format!("{}.aug", key.name));
    let mut utils = GradientUtils::new(
        ctx,
        &primal,
        aug_name.clone(),
        activity,
        types,
        false,
        ReturnShape::Normal,
        false,
    )?;

    // The forward fixup threads the shadow parameters through pointer
    // arithmetic; internal allocations keep their primal form (the paired
    // gradient fabricates its own shadows when it re-executes them).
    forward_pass(&mut utils, false, false)?;

    // Append the tape to the returns.
    let tape = tape_loads(&utils.func, &utils.activity);
    if !tape.is_empty() {
        let ret_inst = utils.func.layout.last_inst(utils.exit).unwrap();
        let mut rets = utils.primal_rets.clone();
        rets.extend(tape.iter().map(|load| utils.func.dfg.first_result(*load)));
        let mut list = mir::ValueList::new();
        list.extend(rets, &mut utils.func.dfg.insts.pools.value_lists);
        utils.func.dfg.update_inst(ret_inst, InstructionData::Ret { args: list });
    }

    if let Err(errors) = mir::validation::validate(&utils.func) {
        return Err(AutodiffError::Verifier { first: errors[0].to_string() });
    }
    let func = utils.func;
    ctx.registry.insert(aug_name.clone(), func);
    Ok(aug_name)
}

/// Forward fixup over the clone: mirror address computation of duplicated
/// pointers into shadow values, give internal allocations zero-initialized
/// shadows (`shadow_allocs`), retarget differentiated calls at their
/// augmented primals, and mark the primal stores whose reverse pullback
/// takes ownership of the memory's derivative (`delete_stores`).
fn forward_pass(
    utils: &mut GradientUtils<'_>,
    delete_stores: bool,
    shadow_allocs: bool,
) -> Result<(), AutodiffError> {
    let blocks: Vec<Block> = utils.func.layout.blocks().collect();
    let mut deferred_phis: Vec<Inst> = Vec::new();

    for block in blocks {
        let insts: Vec<Inst> = utils.func.layout.block_insts(block).collect();
        for inst in insts {
            let data = utils.func.dfg.insts[inst].clone();
            match data {
                InstructionData::Binary { opcode: Opcode::Padd, args: [ptr, off] } => {
                    let res = utils.func.dfg.first_result(inst);
                    if utils.activity.is_duplicated(res) {
                        let Some(&shadow_ptr) = utils.shadow.get(&ptr) else { continue };
                        let mut cursor = FuncCursor::new(&mut utils.func).at_inst(inst);
                        cursor.next_inst();
                        let shadow_res = cursor.ins().padd(shadow_ptr, off);
                        utils.shadow.insert(res, shadow_res);
                    }
                }
                InstructionData::Unary { opcode: Opcode::Load, arg } => {
                    let res = utils.func.dfg.first_result(inst);
                    if utils.activity.is_duplicated(res) {
                        let Some(&shadow_ptr) = utils.shadow.get(&arg) else { continue };
                        let mut cursor = FuncCursor::new(&mut utils.func).at_inst(inst);
                        cursor.next_inst();
                        let shadow_res = cursor.ins().load(shadow_ptr);
                        utils.shadow.insert(res, shadow_res);
                    }
                }
                InstructionData::Unary { opcode: Opcode::Alloca, arg } => {
                    let res = utils.func.dfg.first_result(inst);
                    if utils.activity.is_duplicated(res) {
                        let mut cursor = FuncCursor::new(&mut utils.func).at_inst(inst);
                        cursor.next_inst();
                        let shadow_res = cursor.ins().alloca(arg);
                        cursor.ins().memset(shadow_res, consts::ZERO, arg);
                        utils.shadow.insert(res, shadow_res);
                    }
                }
                InstructionData::Ternary { opcode: Opcode::Select, args: [c, t, e] } => {
                    let res = utils.func.dfg.first_result(inst);
                    if utils.activity.is_duplicated(res) {
                        let (Some(&ts), Some(&es)) =
                            (utils.shadow.get(&t), utils.shadow.get(&e))
                        else {
                            continue;
                        };
                        let mut cursor = FuncCursor::new(&mut utils.func).at_inst(inst);
                        cursor.next_inst();
                        let shadow_res = cursor.ins().select(c, ts, es);
                        utils.shadow.insert(res, shadow_res);
                    }
                }
                InstructionData::PhiNode(_) => {
                    let res = utils.func.dfg.first_result(inst);
                    if utils.activity.is_duplicated(res) {
                        // Incoming shadows may be defined later (back
                        // edges); create the phi now, fill edges after.
                        let node = utils.func.dfg.insts[inst].unwrap_phi().clone();
                        let edges: Vec<(Block, Value)> = utils
                            .func
                            .dfg
                            .phi_edges(&node)
                            .map(|(pred, _)| (pred, consts::GRAVESTONE))
                            .collect();
                        let mut cursor = FuncCursor::new(&mut utils.func).at_inst(inst);
                        cursor.next_inst();
                        let shadow_res = cursor.ins().phi(&edges);
                        utils.shadow.insert(res, shadow_res);
                        deferred_phis.push(inst);
                    }
                }
                InstructionData::Call { func_ref, args } => {
                    let sig = utils.func.dfg.signatures[func_ref].clone();
                    let args: Vec<Value> =
                        args.as_slice(&utils.func.dfg.insts.pools.value_lists).to_vec();
                    if sig.name == "malloc" {
                        let res = utils.func.dfg.first_result(inst);
                        if utils.activity.is_duplicated(res) && shadow_allocs {
                            let size = args[0];
                            let mut cursor = FuncCursor::new(&mut utils.func).at_inst(inst);
                            cursor.next_inst();
                            let shadow_call = cursor.ins().call(func_ref, &[size]);
                            let shadow_res = cursor.func.dfg.first_result(shadow_call);
                            cursor.ins().memset(shadow_res, consts::ZERO, size);
                            utils.shadow.insert(res, shadow_res);
                            // Both halves are locally owned allocations and
                            // are paired with frees after the reverse sweep.
                            utils.frees.push(shadow_res);
                            utils.frees.push(res);
                        }
                    } else if recognized_external(&sig.name) {
                    } else if utils
                        .func
                        .dfg
                        .inst_results(inst)
                        .iter()
                        .any(|res| utils.activity.is_duplicated(*res))
                    {
                        return Err(AutodiffError::UnhandledInstruction {
                            inst,
                            op: "call returning a duplicated pointer",
                        });
                    } else if !utils.activity.is_constant_inst(inst) {
                        maybe_augment_call(utils, block, inst, &sig, &args)?;
                    }
                }
                InstructionData::Binary { opcode: Opcode::Store, args: [_, ptr] } => {
                    if delete_stores && utils.activity.is_duplicated(ptr) {
                        utils.deleted_stores.push(inst);
                    }
                }
                _ => (),
            }
        }
    }

    for inst in deferred_phis {
        let res = utils.func.dfg.first_result(inst);
        let shadow_res = utils.shadow_of(res);
        let shadow_inst = utils.func.dfg.value_def(shadow_res).unwrap_inst();
        let node = utils.func.dfg.insts[inst].unwrap_phi().clone();
        let edges: Vec<(Block, Value)> = utils.func.dfg.phi_edges(&node).collect();
        for (pred, val) in edges {
            let Some(&shadow_val) = utils.shadow.get(&val) else { continue };
            utils.func.dfg.insert_phi_edge(shadow_inst, pred, shadow_val);
        }
    }

    Ok(())
}

/// Recognized external symbols that are never routed through an augmented
/// primal; allocators are handled by the shadow machinery and the rest are
/// pure sinks or math.
fn recognized_external(name: &str) -> bool {
    matches!(name, "free" | "realloc" | "printf" | "puts" | "fprintf" | "__assert_fail")
        || name.starts_with("__cxa_guard_")
        || mir_ty::math_signature(name).is_some()
}

/// How the caller's activity classifies every argument of a call.
fn classify_call_args(utils: &GradientUtils<'_>, args: &[Value]) -> Vec<ArgActivity> {
    args.iter()
        .map(|arg| {
            if utils.activity.is_duplicated(*arg) {
                ArgActivity::Dup
            } else if !utils.is_constant(*arg) {
                ArgActivity::Active
            } else {
                ArgActivity::Const
            }
        })
        .collect()
}

/// The loads whose values the recomputing gradient cannot rely on: reads
/// out of duplicated memory (outside loops) that later stores may have
/// clobbered by the time the reverse sweep re-executes the forward code.
/// Both the augmented primal and its paired gradient derive the same list,
/// in layout order, so the tape needs no side channel.
fn tape_loads(func: &Function, activity: &Activity) -> Vec<Inst> {
    let cfg = ControlFlowGraph::with_function(func);
    let mut dt = DominatorTree::default();
    dt.compute(func, &cfg, true, false, true);
    let mut forest = LoopForest::default();
    forest.compute(func, &cfg, &dt);

    let mut res = Vec::new();
    for block in &func.layout {
        if forest.loop_of(block).is_some() {
            continue;
        }
        for inst in func.layout.block_insts(block) {
            if let InstructionData::Unary { opcode: Opcode::Load, arg } = func.dfg.insts[inst] {
                let result = func.dfg.first_result(inst);
                if activity.is_duplicated(arg) && !activity.is_duplicated(result) {
                    res.push(inst);
                }
            }
        }
    }
    res
}

/// Append one trailing parameter per tape slot and rewind the memory each
/// tape'd load reads, so the re-executed forward code sees the values of
/// the original primal run.
fn install_tape_params(utils: &mut GradientUtils<'_>) {
    for load in tape_loads(&utils.func, &utils.activity) {
        let param = utils.func.dfg.make_param(Param::from(utils.next_param));
        utils.next_param += 1;
        let InstructionData::Unary { opcode: Opcode::Load, arg: ptr } = utils.func.dfg.insts[load]
        else {
            unreachable!()
        };
        let mut cursor = FuncCursor::new(&mut utils.func).at_inst(load);
        cursor.ins().store(param, ptr);
    }
}

/// Arity of the `ret` of a registered function.
fn returned_arity(func: &Function) -> usize {
    func.layout
        .blocks()
        .find_map(|block| {
            let term = func.layout.last_inst(block)?;
            matches!(func.dfg.insts[term], InstructionData::Ret { .. })
                .then(|| func.dfg.instr_args(term).len())
        })
        .unwrap_or(0)
}

/// The in-place peephole of the call handling: the plain primal call plus
/// a single reverse gradient call is equivalent to the augmented pair only
/// when the call sits in the block that hands off into the reverse sweep
/// and nothing between it and the hand-off observes its memory effects.
fn replace_function_ok(utils: &GradientUtils<'_>, block: Block, call: Inst) -> bool {
    if block != utils.exit {
        return false;
    }
    let mut next = utils.func.layout.next_inst(call);
    while let Some(inst) = next {
        let data = &utils.func.dfg.insts[inst];
        if data.is_terminator() {
            break;
        }
        let observes = match data {
            InstructionData::Call { func_ref, .. } => {
                utils.func.dfg.signatures[*func_ref].has_sideeffects
            }
            data => data.opcode().touches_memory(),
        };
        if observes {
            return false;
        }
        next = utils.func.layout.next_inst(inst);
    }
    true
}

/// A differentiated call with duplicated operands or observable side
/// effects goes through the augmented primal: the call is retargeted at
/// the shadow-spliced forward variant and its tape lands in extra results,
/// unless the in-place peephole certifies that the plain pair suffices.
fn maybe_augment_call(
    utils: &mut GradientUtils<'_>,
    block: Block,
    inst: Inst,
    sig: &FunctionSignature,
    args: &[Value],
) -> Result<(), AutodiffError> {
    let acts = classify_call_args(utils, args);
    let results: Vec<Value> = utils.func.dfg.inst_results(inst).to_vec();
    let result_active = results.first().map_or(false, |res| !utils.is_constant(*res));
    let needs_augmented =
        sig.has_sideeffects || acts.iter().any(|act| *act == ArgActivity::Dup);
    if !needs_augmented {
        return Ok(());
    }

    // The peephole is decided against the callee's own tape demand, so the
    // augmented primal is only fabricated when the call is routed to it.
    let (callee, callee_activity, _) =
        analyze_primal(utils.ctx, &sig.name, &acts, result_active)?;
    let wants_tape = !tape_loads(&callee, &callee_activity).is_empty();
    if !wants_tape && replace_function_ok(utils, block, inst) {
        return Ok(());
    }

    let aug_name = create_augmented_primal(utils.ctx, &sig.name, &acts, result_active)?;
    let tape_len = returned_arity(&utils.ctx.registry[&aug_name]) - sig.returns as usize;

    // Splice the shadows in and retarget the call.
    let mut spliced: Vec<Value> = Vec::with_capacity(args.len() * 2);
    for (arg, act) in args.iter().zip(&acts) {
        spliced.push(*arg);
        if *act == ArgActivity::Dup {
            let Some(&shadow) = utils.shadow.get(arg) else {
                return Err(AutodiffError::UnhandledInstruction {
                    inst,
                    op: "call with an unshadowed duplicated pointer",
                });
            };
            spliced.push(shadow);
        }
    }
    let aug_ref = utils.import(FunctionSignature {
        name: aug_name,
        params: spliced.len() as u16,
        returns: sig.returns + tape_len as u16,
        has_sideeffects: true,
    });
    let mut list = mir::ValueList::new();
    list.extend(spliced, &mut utils.func.dfg.insts.pools.value_lists);
    utils.func.dfg.update_inst(inst, InstructionData::Call { func_ref: aug_ref, args: list });
    utils.func.dfg.make_inst_results_reusing(inst, results.iter().map(|res| Some(*res)));

    let all_results: Vec<Value> = utils.func.dfg.inst_results(inst).to_vec();
    let tape = all_results[sig.returns as usize..].to_vec();
    utils
        .aug_calls
        .insert(inst, AugCall { callee: sig.name.clone(), args: args.to_vec(), tape });
    Ok(())
}

/// How the inverted terminator of one reverse block selects among the
/// primal predecessors.
#[derive(Clone, Debug)]
enum Pivot {
    /// Zero or one predecessor.
    None,
    /// Boolean: `true` routes to (and gates the phi edge of) `on_true`.
    Bool { val: Value, on_true: Block, on_false: Block },
    /// Integer tag: `val == i` selects `preds[i]`.
    Tag { val: Value, preds: Vec<Block> },
}

struct ReverseBuilder<'a, 'b> {
    utils: &'a mut GradientUtils<'b>,
    /// Live primal blocks, in layout order.
    order: Vec<Block>,
    /// Live predecessors per primal block (the allocations block is not a
    /// reverse-routing predecessor).
    preds: AHashMap<Block, Vec<Block>>,
    pivots: AHashMap<Block, Pivot>,
}

impl<'a, 'b> ReverseBuilder<'a, 'b> {
    fn new(utils: &'a mut GradientUtils<'b>, cfg: &ControlFlowGraph) -> ReverseBuilder<'a, 'b> {
        // Unreachable-terminated chains are pruned from the reverse CFG.
        let order: Vec<Block> = utils
            .func
            .layout
            .blocks()
            .filter(|block| {
                *block != utils.alloc_block
                    && utils.domtree.is_reachable(*block)
                    && !ends_in_unreachable(&utils.func, *block)
            })
            .collect();

        let mut preds: AHashMap<Block, Vec<Block>> = AHashMap::new();
        for block in &order {
            let list: Vec<Block> = cfg
                .pred_iter(*block)
                .filter(|pred| {
                    *pred != utils.alloc_block
                        && utils.domtree.is_reachable(*pred)
                        && !ends_in_unreachable(&utils.func, *pred)
                })
                .collect();
            preds.insert(*block, list);
        }

        // Fabricate the reverse twins, appended in reversed layout order so
        // the printed function reads roughly in execution order.
        for block in order.iter().rev() {
            let rev = utils.func.layout.append_new_block();
            utils.rev.insert(*block, rev);
        }

        ReverseBuilder { utils, order, preds, pivots: AHashMap::new() }
    }

    fn run(mut self) -> Result<(), AutodiffError> {
        self.transition();
        // Loop mirrors first (outer loops before inner): cache loads and
        // pivots inside a loop consult the mirror of every enclosing loop.
        for idx in 0..self.utils.loops.len() {
            self.build_loop_mirror(idx)?;
        }
        let order = self.order.clone();
        for block in &order {
            self.build_preamble(*block)?;
        }
        for block in order.iter().rev() {
            self.build_pullbacks(*block)?;
        }
        for block in order.iter().rev() {
            self.build_terminator(*block)?;
        }
        Ok(())
    }

    /// Replace the primal `ret` with the hand-off into the reverse sweep.
    fn transition(&mut self) {
        self.utils.seed_return();
        let exit = self.utils.exit;
        let rev_exit = self.utils.rev[&exit];
        let ret_inst = self.utils.func.layout.last_inst(exit).unwrap();
        self.utils.func.dfg.update_inst(ret_inst, InstructionData::Jump { destination: rev_exit });
    }

    /// Mirror induction variables and routing pivots; emitted before any
    /// pullback so phi contributions and cache loads can reuse them.
    fn build_preamble(&mut self, block: Block) -> Result<(), AutodiffError> {
        let preds = self.preds[&block].clone();

        if let Some(idx) =
            (0..self.utils.loops.len()).find(|idx| self.utils.loops[*idx].header == block)
        {
            // Routing out of the reverse loop: keep looping while
            // iterations remain.
            let rev_lp =
                self.utils.rev_loops[idx].expect("loop mirror built before the header twin");
            let lp = &self.utils.loops[idx];
            let (latch, preheader, header, exiting) =
                (lp.latch, lp.preheader, lp.header, lp.exiting);
            let remaining = if exiting == header { rev_lp.rev_iv } else { rev_lp.rev_index };
            let rev = self.utils.rev[&block];
            let pivot = self.ine(rev, remaining, consts::ZERO);
            self.pivots
                .insert(block, Pivot::Bool { val: pivot, on_true: latch, on_false: preheader });
            return Ok(());
        }

        let pivot = match preds.as_slice() {
            [] | [_] => Pivot::None,
            [p0, p1] => {
                let (p0, p1) = (*p0, *p1);
                match self.convergence_pivot(block, p0, p1)? {
                    Some(pivot) => pivot,
                    None => {
                        // Record the taken edge in the primal: a boolean
                        // tag phi, cached like any other primal value.
                        let tag = self
                            .insert_tag_phi(block, &[(p0, consts::TRUE), (p1, consts::FALSE)]);
                        let rev = self.utils.rev[&block];
                        let val = self.utils.lookup(tag, block, rev)?;
                        Pivot::Bool { val, on_true: p0, on_false: p1 }
                    }
                }
            }
            many => {
                let edges: Vec<(Block, Value)> = many
                    .iter()
                    .enumerate()
                    .map(|(i, pred)| {
                        let tag = self.utils.func.dfg.iconst(i as i32);
                        (*pred, tag)
                    })
                    .collect();
                let tag = self.insert_tag_phi(block, &edges);
                let rev = self.utils.rev[&block];
                let val = self.utils.lookup(tag, block, rev)?;
                Pivot::Tag { val, preds: many.to_vec() }
            }
        };
        self.pivots.insert(block, pivot);
        Ok(())
    }

    /// The mirror induction variable: a phi in the twin of the exiting
    /// block, seeded with the trip count from the twin of the exit target
    /// and decremented around the reverse loop. `rev_index` names the
    /// primal body iteration the current reverse pass corresponds to.
    fn build_loop_mirror(&mut self, idx: usize) -> Result<(), AutodiffError> {
        let lp = &self.utils.loops[idx];
        let (exiting, exit, trip_count) = (lp.exiting, lp.exit, lp.trip_count);
        let rev_exiting = self.utils.rev[&exiting];
        let rev_exit = self.utils.rev[&exit];

        let trip = match trip_count {
            TripCount::Static(bound) => self.utils.lookup(bound, exit, rev_exit)?,
            TripCount::Dynamic { cell } => self.v_load(rev_exit, cell),
        };

        let back_pred = self.rev_in_loop_pred(idx);
        let rev_iv = self.v_phi(rev_exiting, &[(rev_exit, trip)]);
        let rev_index = self.isub(rev_exiting, rev_iv, consts::ONE);
        let phi_inst = self.utils.func.dfg.value_def(rev_iv).unwrap_inst();
        self.utils.func.dfg.insert_phi_edge(phi_inst, back_pred, rev_index);

        self.utils.rev_loops[idx] = Some(RevLoop { rev_iv, rev_index });
        Ok(())
    }

    /// The reverse predecessor closing the mirror loop: the twin of the
    /// exiting block's in-loop successor.
    fn rev_in_loop_pred(&self, idx: usize) -> Block {
        let lp = &self.utils.loops[idx];
        let term = self.utils.func.layout.last_inst(lp.exiting).unwrap();
        match self.utils.func.dfg.insts[term] {
            InstructionData::Branch { then_dst, else_dst, .. } => {
                let stay = if lp.contains(then_dst) { then_dst } else { else_dst };
                self.utils.rev[&stay]
            }
            InstructionData::Jump { destination } => self.utils.rev[&destination],
            _ => unreachable!("exiting block without branch"),
        }
    }

    /// The bounded convergence search: reuse the branch condition of the
    /// immediate dominator when its two successor regions select exactly
    /// the two predecessors.
    fn convergence_pivot(
        &mut self,
        block: Block,
        p0: Block,
        p1: Block,
    ) -> Result<Option<Pivot>, AutodiffError> {
        let Some(dom) = self.utils.domtree.idom(block) else { return Ok(None) };
        let term = self.utils.func.layout.last_inst(dom).unwrap();
        let InstructionData::Branch { cond, then_dst, else_dst } = self.utils.func.dfg.insts[term]
        else {
            return Ok(None);
        };
        let dt = &self.utils.domtree;
        let selects = |on_true: Block, on_false: Block| {
            dt.dominates(on_true, then_dst)
                && dt.dominates(on_false, else_dst)
                && !dt.dominates(on_false, then_dst)
                && !dt.dominates(on_true, else_dst)
        };
        let (on_true, on_false) = if selects(p0, p1) {
            (p0, p1)
        } else if selects(p1, p0) {
            (p1, p0)
        } else {
            return Ok(None);
        };
        let rev = self.utils.rev[&block];
        let val = self.utils.lookup(cond, block, rev)?;
        Ok(Some(Pivot::Bool { val, on_true, on_false }))
    }

    /// Insert a tag phi at the top of a primal block.
    fn insert_tag_phi(&mut self, block: Block, edges: &[(Block, Value)]) -> Value {
        let at = self.utils.func.layout.first_inst(block).unwrap();
        let mut cursor = FuncCursor::new(&mut self.utils.func).at_inst(at);
        cursor.ins().phi(edges)
    }

    /// Emit the adjoint instructions of `block` into its twin, in reverse
    /// of the primal order.
    fn build_pullbacks(&mut self, block: Block) -> Result<(), AutodiffError> {
        let rev = self.utils.rev[&block];
        let insts: Vec<Inst> = self.utils.func.layout.block_insts(block).collect();
        for inst in insts.into_iter().rev() {
            let data = self.utils.func.dfg.insts[inst].clone();
            if data.is_terminator() {
                continue;
            }
            // Constant instructions and everything fabricated after the
            // activity analysis (shadow mirrors, tape stores, tag phis)
            // have no pullback.
            if self.utils.activity.is_constant_inst(inst) {
                continue;
            }
            self.pullback(inst, &data, block, rev)?;
        }
        Ok(())
    }

    fn pullback(
        &mut self,
        inst: Inst,
        data: &InstructionData,
        block: Block,
        rev: Block,
    ) -> Result<(), AutodiffError> {
        match *data {
            InstructionData::Unary { opcode, arg } => {
                let res = self.utils.func.dfg.first_result(inst);
                match opcode {
                    Opcode::Load => self.pullback_load(arg, res, rev),
                    Opcode::Alloca => Ok(()),
                    Opcode::OptBarrier => {
                        let adj = self.utils.take_diffe(res, rev);
                        self.utils.add_to_diffe(arg, adj, rev);
                        Ok(())
                    }
                    _ => self.pullback_scalar(inst, opcode, &[arg], res, block, rev),
                }
            }
            InstructionData::Binary { opcode, args } => match opcode {
                Opcode::Store => self.pullback_store(args[0], args[1], rev),
                Opcode::Padd => Ok(()),
                _ => {
                    let res = self.utils.func.dfg.first_result(inst);
                    self.pullback_scalar(inst, opcode, &args, res, block, rev)
                }
            },
            InstructionData::Ternary { opcode, args } => match opcode {
                Opcode::Select => {
                    let res = self.utils.func.dfg.first_result(inst);
                    self.pullback_scalar(inst, opcode, &args, res, block, rev)
                }
                Opcode::Memcpy => self.pullback_memcpy(inst, args, rev),
                // memset of zero has a zero adjoint
                Opcode::Memset => Ok(()),
                _ => unreachable!(),
            },
            InstructionData::PhiNode(ref phi) => self.pullback_phi(inst, phi, block, rev),
            InstructionData::Call { func_ref, args } => {
                let args: Vec<Value> =
                    args.as_slice(&self.utils.func.dfg.insts.pools.value_lists).to_vec();
                self.pullback_call(inst, func_ref, &args, block, rev)
            }
            InstructionData::Branch { .. }
            | InstructionData::Jump { .. }
            | InstructionData::Ret { .. }
            | InstructionData::Unreachable => Ok(()),
        }
    }

    /// The table of scalar adjoints. Reads the accumulated adjoint of the
    /// result (clearing it), looks primal operands up, and accumulates
    /// into the operand adjoints.
    fn pullback_scalar(
        &mut self,
        inst: Inst,
        opcode: Opcode,
        args: &[Value],
        res: Value,
        block: Block,
        rev: Block,
    ) -> Result<(), AutodiffError> {
        if self.utils.is_constant(res) {
            return Ok(());
        }
        if crate::activity::zero_derivative_op(opcode) {
            return Ok(());
        }
        let adj = self.utils.take_diffe(res, rev);

        match opcode {
            Opcode::Fadd => {
                self.utils.add_to_diffe(args[0], adj, rev);
                self.utils.add_to_diffe(args[1], adj, rev);
            }
            Opcode::Fsub => {
                self.utils.add_to_diffe(args[0], adj, rev);
                let neg = self.fneg(rev, adj);
                self.utils.add_to_diffe(args[1], neg, rev);
            }
            Opcode::Fneg => {
                let neg = self.fneg(rev, adj);
                self.utils.add_to_diffe(args[0], neg, rev);
            }
            Opcode::Fmul => {
                let hat = self.lookup_args(args, block, rev)?;
                let da = self.fmul(rev, adj, hat[1]);
                self.utils.add_to_diffe(args[0], da, rev);
                let db = self.fmul(rev, adj, hat[0]);
                self.utils.add_to_diffe(args[1], db, rev);
            }
            Opcode::Fdiv => {
                let hat = self.lookup_args(args, block, rev)?;
                let da = self.fdiv(rev, adj, hat[1]);
                self.utils.add_to_diffe(args[0], da, rev);
                let r = self.utils.lookup(res, block, rev)?;
                let scaled = self.fmul(rev, adj, r);
                let db = self.fdiv(rev, scaled, hat[1]);
                let db = self.fneg(rev, db);
                self.utils.add_to_diffe(args[1], db, rev);
            }
            Opcode::Sqrt => {
                let r = self.utils.lookup(res, block, rev)?;
                let twice = self.fmul(rev, consts::F_TWO, r);
                let da = self.fdiv(rev, adj, twice);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Fabs => {
                let hat = self.lookup_args(args, block, rev)?;
                let neg = self.flt(rev, hat[0], consts::F_ZERO);
                let nadj = self.fneg(rev, adj);
                let da = self.v_select(rev, neg, nadj, adj);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Exp => {
                let r = self.utils.lookup(res, block, rev)?;
                let da = self.fmul(rev, adj, r);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Ln => {
                let hat = self.lookup_args(args, block, rev)?;
                let da = self.fdiv(rev, adj, hat[0]);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Log => {
                let hat = self.lookup_args(args, block, rev)?;
                let ln10 = self.utils.func.dfg.f64const(std::f64::consts::LN_10);
                let denom = self.fmul(rev, hat[0], ln10);
                let da = self.fdiv(rev, adj, denom);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Sin => {
                let hat = self.lookup_args(args, block, rev)?;
                let cos = self.v_unary(rev, Opcode::Cos, hat[0]);
                let da = self.fmul(rev, adj, cos);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Cos => {
                let hat = self.lookup_args(args, block, rev)?;
                let sin = self.v_unary(rev, Opcode::Sin, hat[0]);
                let msin = self.fneg(rev, sin);
                let da = self.fmul(rev, adj, msin);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Tan => {
                let hat = self.lookup_args(args, block, rev)?;
                let cos = self.v_unary(rev, Opcode::Cos, hat[0]);
                let cos2 = self.fmul(rev, cos, cos);
                let da = self.fdiv(rev, adj, cos2);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Asin | Opcode::Acos => {
                let hat = self.lookup_args(args, block, rev)?;
                let sq = self.fmul(rev, hat[0], hat[0]);
                let one_minus = self.fsub(rev, consts::F_ONE, sq);
                let root = self.v_unary(rev, Opcode::Sqrt, one_minus);
                let mut da = self.fdiv(rev, adj, root);
                if opcode == Opcode::Acos {
                    da = self.fneg(rev, da);
                }
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Atan => {
                let hat = self.lookup_args(args, block, rev)?;
                let sq = self.fmul(rev, hat[0], hat[0]);
                let denom = self.fadd(rev, consts::F_ONE, sq);
                let da = self.fdiv(rev, adj, denom);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Sinh => {
                let hat = self.lookup_args(args, block, rev)?;
                let cosh = self.v_unary(rev, Opcode::Cosh, hat[0]);
                let da = self.fmul(rev, adj, cosh);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Cosh => {
                let hat = self.lookup_args(args, block, rev)?;
                let sinh = self.v_unary(rev, Opcode::Sinh, hat[0]);
                let da = self.fmul(rev, adj, sinh);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Tanh => {
                let r = self.utils.lookup(res, block, rev)?;
                let sq = self.fmul(rev, r, r);
                let one_minus = self.fsub(rev, consts::F_ONE, sq);
                let da = self.fmul(rev, adj, one_minus);
                self.utils.add_to_diffe(args[0], da, rev);
            }
            Opcode::Pow => {
                let hat = self.lookup_args(args, block, rev)?;
                // ∂a = adj·b·a^(b−1); ∂b = adj·r·ln a
                let bm1 = self.fsub(rev, hat[1], consts::F_ONE);
                let powm = self.v_binary(rev, Opcode::Pow, hat[0], bm1);
                let scaled = self.fmul(rev, adj, hat[1]);
                let da = self.fmul(rev, scaled, powm);
                self.utils.add_to_diffe(args[0], da, rev);

                let r = self.utils.lookup(res, block, rev)?;
                let ln = self.v_unary(rev, Opcode::Ln, hat[0]);
                let scaled = self.fmul(rev, adj, r);
                let db = self.fmul(rev, scaled, ln);
                self.utils.add_to_diffe(args[1], db, rev);
            }
            Opcode::Hypot => {
                let hat = self.lookup_args(args, block, rev)?;
                let r = self.utils.lookup(res, block, rev)?;
                let da = self.fdiv(rev, hat[0], r);
                let da = self.fmul(rev, adj, da);
                self.utils.add_to_diffe(args[0], da, rev);
                let db = self.fdiv(rev, hat[1], r);
                let db = self.fmul(rev, adj, db);
                self.utils.add_to_diffe(args[1], db, rev);
            }
            Opcode::Atan2 => {
                let hat = self.lookup_args(args, block, rev)?;
                // r = atan2(a, b): ∂a = adj·b/(a²+b²), ∂b = −adj·a/(a²+b²)
                let a2 = self.fmul(rev, hat[0], hat[0]);
                let b2 = self.fmul(rev, hat[1], hat[1]);
                let denom = self.fadd(rev, a2, b2);
                let da = self.fdiv(rev, hat[1], denom);
                let da = self.fmul(rev, adj, da);
                self.utils.add_to_diffe(args[0], da, rev);
                let db = self.fdiv(rev, hat[0], denom);
                let db = self.fmul(rev, adj, db);
                let db = self.fneg(rev, db);
                self.utils.add_to_diffe(args[1], db, rev);
            }
            Opcode::Fmin | Opcode::Fmax => {
                let hat = self.lookup_args(args, block, rev)?;
                // the taken side receives the adjoint
                let takes_a = if opcode == Opcode::Fmin {
                    self.v_binary(rev, Opcode::Fle, hat[0], hat[1])
                } else {
                    self.v_binary(rev, Opcode::Fge, hat[0], hat[1])
                };
                let da = self.v_select(rev, takes_a, adj, consts::F_ZERO);
                self.utils.add_to_diffe(args[0], da, rev);
                let db = self.v_select(rev, takes_a, consts::F_ZERO, adj);
                self.utils.add_to_diffe(args[1], db, rev);
            }
            Opcode::Frem => {
                let hat = self.lookup_args(args, block, rev)?;
                // r = a − b·trunc(a/b)
                self.utils.add_to_diffe(args[0], adj, rev);
                let q = self.fdiv(rev, hat[0], hat[1]);
                let neg = self.flt(rev, q, consts::F_ZERO);
                let ceil = self.v_unary(rev, Opcode::Ceil, q);
                let floor = self.v_unary(rev, Opcode::Floor, q);
                let trunc = self.v_select(rev, neg, ceil, floor);
                let db = self.fmul(rev, adj, trunc);
                let db = self.fneg(rev, db);
                self.utils.add_to_diffe(args[1], db, rev);
            }
            Opcode::Select => {
                let hat = self.lookup_args(args, block, rev)?;
                let gate = hat[0];
                let da = self.v_select(rev, gate, adj, consts::F_ZERO);
                self.utils.add_to_diffe(args[1], da, rev);
                let db = self.v_select(rev, gate, consts::F_ZERO, adj);
                self.utils.add_to_diffe(args[2], db, rev);
            }
            op => return Err(AutodiffError::UnhandledInstruction { inst, op: op.name() }),
        }
        Ok(())
    }

    /// `r = load p` with an active result: the adjoint flows into the
    /// shadow cell behind `p`.
    fn pullback_load(&mut self, ptr: Value, res: Value, rev: Block) -> Result<(), AutodiffError> {
        if self.utils.is_constant(res)
            || self.utils.activity.is_duplicated(res)
            || !self.utils.activity.is_duplicated(ptr)
        {
            return Ok(());
        }
        let adj = self.utils.take_diffe(res, rev);
        let shadow = self.utils.shadow_of(ptr);
        let old = self.v_load(rev, shadow);
        let new = self.fadd(rev, old, adj);
        self.do_store(rev, new, shadow);
        Ok(())
    }

    /// `store v, p` with an active value: the adjoint is read out of the
    /// shadow cell, which is then cleared (the store owned the slot).
    fn pullback_store(&mut self, val: Value, ptr: Value, rev: Block) -> Result<(), AutodiffError> {
        if !self.utils.activity.is_duplicated(ptr) || self.utils.is_constant(val) {
            return Ok(());
        }
        let shadow = self.utils.shadow_of(ptr);
        let adj = self.v_load(rev, shadow);
        self.do_store(rev, consts::F_ZERO, shadow);
        self.utils.add_to_diffe(val, adj, rev);
        Ok(())
    }

    /// Reverse of `memcpy dst, src, n`: accumulate the destination shadow
    /// into the source shadow slot by slot, then clear the destination
    /// shadow. Requires a statically known length.
    fn pullback_memcpy(
        &mut self,
        inst: Inst,
        [dst, src, len]: [Value; 3],
        rev: Block,
    ) -> Result<(), AutodiffError> {
        if !self.utils.activity.is_duplicated(dst) && !self.utils.activity.is_duplicated(src) {
            return Ok(());
        }
        let Some(&[bytes]) = self.utils.types.known_integral_values(len) else {
            return Err(AutodiffError::UnhandledInstruction {
                inst,
                op: "memcpy (dynamic length)",
            });
        };
        let shadow_dst = self.utils.shadow_of(dst);
        let shadow_src = self.utils.shadow_of(src);
        for off in (0..bytes).step_by(8) {
            let off = self.utils.func.dfg.iconst(off as i32);
            let from = self.v_padd(rev, shadow_dst, off);
            let to = self.v_padd(rev, shadow_src, off);
            let d = self.v_load(rev, from);
            let old = self.v_load(rev, to);
            let sum = self.fadd(rev, old, d);
            self.do_store(rev, sum, to);
        }
        let len_val = self.utils.func.dfg.iconst(bytes as i32);
        let mut cursor = FuncCursor::new(&mut self.utils.func).at_bottom(rev);
        cursor.ins().memset(shadow_dst, consts::ZERO, len_val);
        Ok(())
    }

    /// Distribute the adjoint of a phi to the incoming value of the edge
    /// the primal actually took, then clear it.
    fn pullback_phi(
        &mut self,
        inst: Inst,
        phi: &mir::PhiNode,
        block: Block,
        rev: Block,
    ) -> Result<(), AutodiffError> {
        let res = self.utils.func.dfg.first_result(inst);
        if self.utils.is_constant(res) || self.utils.activity.is_duplicated(res) {
            return Ok(());
        }
        let edges: Vec<(Block, Value)> = self.utils.func.dfg.phi_edges(phi).collect();
        let adj = self.utils.take_diffe(res, rev);
        let pivot = self.pivots[&block].clone();
        for (pred, val) in edges {
            if self.utils.is_constant(val) {
                continue;
            }
            let gated = match &pivot {
                Pivot::None => adj,
                Pivot::Bool { val: cond, on_true, .. } => {
                    if pred == *on_true {
                        self.v_select(rev, *cond, adj, consts::F_ZERO)
                    } else {
                        self.v_select(rev, *cond, consts::F_ZERO, adj)
                    }
                }
                Pivot::Tag { val: tag, preds } => {
                    let idx = preds.iter().position(|it| *it == pred).unwrap();
                    let idx = self.utils.func.dfg.iconst(idx as i32);
                    let matches = self.ieq(rev, *tag, idx);
                    self.v_select(rev, matches, adj, consts::F_ZERO)
                }
            };
            self.utils.add_to_diffe(val, gated, rev);
        }
        Ok(())
    }

    /// Calls on the active path differentiate through the callee: the
    /// reverse site invokes the callee's primal-and-gradient variant with
    /// the primal arguments, the spliced shadows, the result adjoint and
    /// the tape of the augmented primal (when the forward fixup installed
    /// one); the returned adjoints accumulate into the argument adjoints.
    fn pullback_call(
        &mut self,
        inst: Inst,
        func_ref: mir::FuncRef,
        args: &[Value],
        block: Block,
        rev: Block,
    ) -> Result<(), AutodiffError> {
        let sig = self.utils.func.dfg.signatures[func_ref].clone();
        if crate::activity::call_is_pure_sink(&self.utils.func, inst) {
            return Ok(());
        }
        match sig.name.as_str() {
            // Allocator bookkeeping has no data adjoint; the shadow pairing
            // is handled by the forward fixup and the free list.
            "malloc" | "realloc" | "free" => return Ok(()),
            _ => (),
        }
        if let Some(opcode) = math_call_opcode(&sig.name) {
            let res = self.utils.func.dfg.first_result(inst);
            return self.pullback_scalar(inst, opcode, args, res, block, rev);
        }

        // A call retargeted at an augmented primal is differentiated
        // against the original callee; its tape results ride along into
        // the gradient call.
        let aug = self.utils.aug_calls.get(&inst).cloned();
        let with_tape = aug.is_some();
        let (callee, primal_args, tape) = match aug {
            Some(AugCall { callee, args, tape }) => (callee, args, tape),
            None => (sig.name.clone(), args.to_vec(), Vec::new()),
        };

        let acts = classify_call_args(self.utils, &primal_args);
        let results: Vec<Value> = self.utils.func.dfg.inst_results(inst).to_vec();
        let result_active = results.first().map_or(false, |res| !self.utils.is_constant(*res));

        if acts.iter().all(|a| *a == ArgActivity::Const) && !result_active {
            return Ok(());
        }

        let grad_name = create_primal_and_gradient(
            self.utils.ctx,
            &callee,
            &acts,
            false,
            result_active,
            false,
            with_tape,
        )?;

        // Assemble the reverse call: primal args, shadows spliced next to
        // the duplicated pointers, the incoming adjoint, then the tape.
        let mut call_args: Vec<Value> = Vec::with_capacity(primal_args.len() + 2 + tape.len());
        for (arg, act) in primal_args.iter().zip(&acts) {
            let primal_arg = self.utils.lookup(*arg, block, rev)?;
            call_args.push(primal_arg);
            if *act == ArgActivity::Dup {
                call_args.push(self.utils.shadow_of(*arg));
            }
        }
        if result_active {
            let res = results[0];
            let adj = self.utils.take_diffe(res, rev);
            call_args.push(adj);
        }
        call_args.extend(tape.iter().copied());

        let num_active = acts.iter().filter(|a| **a == ArgActivity::Active).count();
        let grad_ref = self.utils.import(FunctionSignature {
            name: grad_name,
            params: call_args.len() as u16,
            returns: num_active as u16,
            has_sideeffects: true,
        });
        let call = {
            let mut cursor = FuncCursor::new(&mut self.utils.func).at_bottom(rev);
            cursor.ins().call(grad_ref, &call_args)
        };
        let rets: Vec<Value> = self.utils.func.dfg.inst_results(call).to_vec();
        let mut ret_iter = rets.into_iter();
        for (arg, act) in primal_args.iter().zip(&acts) {
            if *act == ArgActivity::Active {
                let adj = ret_iter.next().expect("gradient returned too few adjoints");
                self.utils.add_to_diffe(*arg, adj, rev);
            }
        }
        Ok(())
    }

    /// The inverted terminator of one reverse block.
    fn build_terminator(&mut self, block: Block) -> Result<(), AutodiffError> {
        let rev = self.utils.rev[&block];
        self.emit_loop_frees(block, rev);

        let preds = self.preds[&block].clone();
        match preds.as_slice() {
            [] => self.build_return(rev),
            [pred] => {
                let target = self.utils.rev[pred];
                let mut cursor = FuncCursor::new(&mut self.utils.func).at_bottom(rev);
                cursor.ins().jmp(target);
                Ok(())
            }
            [_, _] => {
                let Pivot::Bool { val, on_true, on_false } = self.pivots[&block].clone() else {
                    unreachable!("two-predecessor block without boolean pivot")
                };
                let t = self.utils.rev[&on_true];
                let e = self.utils.rev[&on_false];
                let mut cursor = FuncCursor::new(&mut self.utils.func).at_bottom(rev);
                cursor.ins().br(val, t, e);
                Ok(())
            }
            many => {
                let Pivot::Tag { val, preds } = self.pivots[&block].clone() else {
                    unreachable!("many-predecessor block without tag pivot")
                };
                debug_assert_eq!(many.len(), preds.len());
                // A comparison chain stands in for a switch terminator.
                let mut current = rev;
                for (i, pred) in preds.iter().enumerate() {
                    let target = self.utils.rev[pred];
                    if i + 1 == preds.len() {
                        let mut cursor =
                            FuncCursor::new(&mut self.utils.func).at_bottom(current);
                        cursor.ins().jmp(target);
                    } else {
                        let next = self.utils.func.layout.append_new_block();
                        let tag = self.utils.func.dfg.iconst(i as i32);
                        let matches = self.ieq(current, val, tag);
                        let mut cursor =
                            FuncCursor::new(&mut self.utils.func).at_bottom(current);
                        cursor.ins().br(matches, target, next);
                        current = next;
                    }
                }
                Ok(())
            }
        }
    }

    /// Loop-array tape storage is released in the reverse twin of the
    /// preheader it was allocated in.
    fn emit_loop_frees(&mut self, block: Block, rev: Block) {
        let mut cells: Vec<Value> = Vec::new();
        for (_, slot) in &self.utils.tape {
            if let CacheSlot::Array { cell, lp } = slot {
                let mut outer = *lp;
                while let Some(parent) = self.utils.loops[outer].parent {
                    outer = parent;
                }
                if self.utils.loops[outer].preheader == block {
                    cells.push(*cell);
                }
            }
        }
        if cells.is_empty() {
            return;
        }
        let free = self.utils.import(FunctionSignature {
            name: "free".to_owned(),
            params: 1,
            returns: 0,
            has_sideeffects: true,
        });
        for cell in cells {
            let base = self.v_load(rev, cell);
            let mut cursor = FuncCursor::new(&mut self.utils.func).at_bottom(rev);
            cursor.ins().call(free, &[base]);
        }
    }

    /// The reverse of the entry block ends the function: release the
    /// remaining shadow allocations and gather the returns demanded by the
    /// shape.
    fn build_return(&mut self, rev: Block) -> Result<(), AutodiffError> {
        if !self.utils.frees.is_empty() {
            let free = self.utils.import(FunctionSignature {
                name: "free".to_owned(),
                params: 1,
                returns: 0,
                has_sideeffects: true,
            });
            let frees = self.utils.frees.clone();
            for ptr in frees {
                let mut cursor = FuncCursor::new(&mut self.utils.func).at_bottom(rev);
                cursor.ins().call(free, &[ptr]);
            }
        }

        let mut rets: Vec<Value> = Vec::new();
        if matches!(self.utils.return_shape, ReturnShape::Normal | ReturnShape::ArgsWithReturn) {
            rets.extend(self.utils.primal_rets.iter().copied());
        }
        if matches!(self.utils.return_shape, ReturnShape::Args | ReturnShape::ArgsWithReturn) {
            let params = self.utils.params.clone();
            for (i, (val, _)) in params.iter().enumerate() {
                if self.utils.activity.args.get(i) == Some(&ArgActivity::Active) {
                    let cell = self.utils.diffe_cell(*val);
                    let adj = self.v_load(rev, cell);
                    rets.push(adj);
                }
            }
        }
        let mut cursor = FuncCursor::new(&mut self.utils.func).at_bottom(rev);
        cursor.ins().ret(&rets);
        Ok(())
    }

    /// Look every primal operand up at the reverse position.
    fn lookup_args(
        &mut self,
        args: &[Value],
        block: Block,
        rev: Block,
    ) -> Result<SmallVec<[Value; 3]>, AutodiffError> {
        let mut hat: SmallVec<[Value; 3]> = SmallVec::new();
        for arg in args {
            hat.push(self.utils.lookup(*arg, block, rev)?);
        }
        Ok(hat)
    }

    // One-shot emission helpers appending at the bottom of a block.

    fn v_unary(&mut self, block: Block, op: Opcode, arg: Value) -> Value {
        FuncCursor::new(&mut self.utils.func).at_bottom(block).ins().unary(op, arg)
    }

    fn v_binary(&mut self, block: Block, op: Opcode, lhs: Value, rhs: Value) -> Value {
        FuncCursor::new(&mut self.utils.func).at_bottom(block).ins().binary(op, lhs, rhs)
    }

    fn v_select(&mut self, block: Block, cond: Value, t: Value, e: Value) -> Value {
        FuncCursor::new(&mut self.utils.func).at_bottom(block).ins().select(cond, t, e)
    }

    fn v_load(&mut self, block: Block, ptr: Value) -> Value {
        FuncCursor::new(&mut self.utils.func).at_bottom(block).ins().load(ptr)
    }

    fn v_padd(&mut self, block: Block, ptr: Value, off: Value) -> Value {
        FuncCursor::new(&mut self.utils.func).at_bottom(block).ins().padd(ptr, off)
    }

    fn v_phi(&mut self, block: Block, edges: &[(Block, Value)]) -> Value {
        FuncCursor::new(&mut self.utils.func).at_bottom(block).ins().phi(edges)
    }

    fn do_store(&mut self, block: Block, val: Value, ptr: Value) {
        FuncCursor::new(&mut self.utils.func).at_bottom(block).ins().store(val, ptr);
    }

    fn fadd(&mut self, block: Block, lhs: Value, rhs: Value) -> Value {
        self.v_binary(block, Opcode::Fadd, lhs, rhs)
    }

    fn fsub(&mut self, block: Block, lhs: Value, rhs: Value) -> Value {
        self.v_binary(block, Opcode::Fsub, lhs, rhs)
    }

    fn fmul(&mut self, block: Block, lhs: Value, rhs: Value) -> Value {
        self.v_binary(block, Opcode::Fmul, lhs, rhs)
    }

    fn fdiv(&mut self, block: Block, lhs: Value, rhs: Value) -> Value {
        self.v_binary(block, Opcode::Fdiv, lhs, rhs)
    }

    fn fneg(&mut self, block: Block, arg: Value) -> Value {
        self.v_unary(block, Opcode::Fneg, arg)
    }

    fn flt(&mut self, block: Block, lhs: Value, rhs: Value) -> Value {
        self.v_binary(block, Opcode::Flt, lhs, rhs)
    }

    fn ieq(&mut self, block: Block, lhs: Value, rhs: Value) -> Value {
        self.v_binary(block, Opcode::Ieq, lhs, rhs)
    }

    fn ine(&mut self, block: Block, lhs: Value, rhs: Value) -> Value {
        self.v_binary(block, Opcode::Ine, lhs, rhs)
    }

    fn isub(&mut self, block: Block, lhs: Value, rhs: Value) -> Value {
        self.v_binary(block, Opcode::Isub, lhs, rhs)
    }
}

/// Math-library calls with an opcode equivalent reuse the scalar table.
fn math_call_opcode(name: &str) -> Option<Opcode> {
    let op = match name {
        "sin" => Opcode::Sin,
        "cos" => Opcode::Cos,
        "tan" => Opcode::Tan,
        "asin" => Opcode::Asin,
        "acos" => Opcode::Acos,
        "atan" => Opcode::Atan,
        "sinh" => Opcode::Sinh,
        "cosh" => Opcode::Cosh,
        "tanh" => Opcode::Tanh,
        "exp" => Opcode::Exp,
        "log" => Opcode::Ln,
        "log10" => Opcode::Log,
        "sqrt" => Opcode::Sqrt,
        "fabs" => Opcode::Fabs,
        "pow" => Opcode::Pow,
        "hypot" => Opcode::Hypot,
        "atan2" => Opcode::Atan2,
        "fmin" => Opcode::Fmin,
        "fmax" => Opcode::Fmax,
        "floor" => Opcode::Floor,
        "ceil" => Opcode::Ceil,
        _ => return None,
    };
    Some(op)
}
