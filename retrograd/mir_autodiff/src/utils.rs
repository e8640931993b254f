//! Shared state of one gradient synthesis: the cloned function, the
//! primal↔shadow and value↔accumulator maps, the tape, and the machinery
//! that makes primal intermediates available to the reverse sweep.

use std::rc::Rc;

use ahash::AHashMap;
use mir::cursor::FuncCursor;
use mir::{
    consts, Block, DominatorTree, Function, FunctionSignature, Inst, InstructionData, Opcode,
    Param, Value, ValueDef,
};
use mir_ty::TypeResults;

use crate::activity::{Activity, ArgActivity};
use crate::loops::{LoopCtx, TripCount};
use crate::{AutodiffCtx, AutodiffError, ReturnShape};

/// Where a cached primal value lives.
#[derive(Clone, Debug)]
pub(crate) enum CacheSlot {
    /// One stack cell, written at the definition site.
    Cell(Value),
    /// A per-iteration array: `cell` holds the base address (the base is a
    /// cell because dynamic loops relocate the array as it grows); `lp` is
    /// the innermost containing loop.
    Array { cell: Value, lp: usize },
}

/// A primal call that was retargeted at the augmented primal of its
/// callee.
#[derive(Clone, Debug)]
pub(crate) struct AugCall {
    pub callee: String,
    /// The original argument values, without the spliced shadows.
    pub args: Vec<Value>,
    /// The call results carrying the callee's tape.
    pub tape: Vec<Value>,
}

/// The reverse-side context of one canonicalized loop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RevLoop {
    /// Mirror induction phi in the reverse header: counts remaining
    /// iterations, from the trip count down to zero.
    pub rev_iv: Value,
    /// The primal iteration the current reverse pass corresponds to
    /// (`rev_iv - 1`), defined right after the mirror phi.
    pub rev_index: Value,
}

pub(crate) struct GradientUtils<'a> {
    pub ctx: &'a mut AutodiffCtx,
    /// The function being synthesized.
    pub func: Function,
    pub activity: Activity,
    pub types: Rc<TypeResults>,
    pub loops: Vec<LoopCtx>,

    /// Block holding the adjoint/tape stack cells; the function entry.
    pub alloc_block: Block,
    /// Clone of the primal entry.
    pub primal_entry: Block,
    /// Clone of the primal's single returning block.
    pub exit: Block,
    /// Values returned by the primal `ret` (usable throughout the reverse
    /// sweep: the exit block dominates it).
    pub primal_rets: Vec<Value>,

    /// Per-value adjoint accumulator cells; zero-initialized.
    diffe: AHashMap<Value, Value>,
    /// Shadow of every duplicated pointer value.
    pub shadow: AHashMap<Value, Value>,
    /// Tape slots, in creation order.
    pub tape: Vec<(Value, CacheSlot)>,
    cached: AHashMap<Value, usize>,
    /// Reverse twin of every primal block.
    pub rev: AHashMap<Block, Block>,
    /// Reverse loop state, indexed like `loops`.
    pub rev_loops: Vec<Option<RevLoop>>,
    /// Allocations to release before the adjoint return.
    pub frees: Vec<Value>,
    /// Incoming adjoint of the primary return value.
    pub seed: Option<Value>,
    /// Calls retargeted at augmented primals, keyed by the call.
    pub aug_calls: AHashMap<Inst, AugCall>,
    /// Primal stores whose reverse pullback owns the memory's derivative;
    /// they are detached from the layout once the pullbacks are emitted.
    pub deleted_stores: Vec<Inst>,
    /// Index of the next parameter to append (tape values go here).
    pub next_param: u32,

    /// Dominator tree of the function after cloning and canonicalization
    /// but before any reverse block exists.
    pub domtree: DominatorTree,

    pub return_shape: ReturnShape,
    pub top_level: bool,
    /// Parameters of the synthesized signature, per primal parameter:
    /// `(primal value, shadow value)`.
    pub params: Vec<(Value, Option<Value>)>,
}

impl<'a> GradientUtils<'a> {
    /// Clone the primal into a fresh function with the widened signature:
    /// duplicated pointers are spliced as `(primal, shadow)` pairs and a
    /// trailing parameter receives the incoming adjoint when
    /// `differential_return` is set.
    pub(crate) fn new(
        ctx: &'a mut AutodiffCtx,
        primal: &Function,
        name: String,
        activity: Activity,
        types: Rc<TypeResults>,
        differential_return: bool,
        return_shape: ReturnShape,
        top_level: bool,
    ) -> Result<GradientUtils<'a>, AutodiffError> {
        // The clone keeps every entity number of the primal, so the
        // primal→clone value map is the identity.
        let mut func = primal.clone();
        func.name = name;

        // Re-index the parameters, splicing in shadows.
        let mut old_params: Vec<(Param, Value)> = func
            .dfg
            .values()
            .filter_map(|val| match func.dfg.value_def(val) {
                ValueDef::Param(param) => Some((param, val)),
                _ => None,
            })
            .collect();
        old_params.sort_by_key(|(param, _)| *param);

        let mut params = Vec::with_capacity(old_params.len());
        let mut next = 0u32;
        let mut shadow = AHashMap::new();
        for (param, val) in &old_params {
            func.dfg.values.make_param_at(Param::from(next), *val);
            next += 1;
            let shadow_val = if activity.arg_activity(*param) == ArgActivity::Dup {
                let shadow_val = func.dfg.make_param(Param::from(next));
                next += 1;
                shadow.insert(*val, shadow_val);
                Some(shadow_val)
            } else {
                None
            };
            params.push((*val, shadow_val));
        }
        let seed = if differential_return {
            let seed = func.dfg.make_param(Param::from(next));
            next += 1;
            Some(seed)
        } else {
            None
        };

        // Fresh allocations block ahead of the old entry.
        let primal_entry = func.layout.entry_block().expect("primal has no entry block");
        let alloc_block = func.layout.make_block();
        func.layout.insert_block(alloc_block, primal_entry);
        {
            let mut cursor = FuncCursor::new(&mut func).at_bottom(alloc_block);
            cursor.ins().jmp(primal_entry);
        }

        // The primal must return in exactly one place.
        let mut exit = None;
        for block in &func.layout {
            if let Some(term) = func.layout.last_inst(block) {
                if let InstructionData::Ret { .. } = func.dfg.insts[term] {
                    if exit.replace(block).is_some() {
                        return Err(AutodiffError::UnhandledInstruction {
                            inst: term,
                            op: "ret in more than one block",
                        });
                    }
                }
            }
        }
        let exit = exit.ok_or_else(|| AutodiffError::IllegalIntrinsic {
            reason: format!("%{} never returns", primal.name),
        })?;
        let ret_inst = func.layout.last_inst(exit).unwrap();
        let primal_rets: Vec<Value> = func.dfg.instr_args(ret_inst).to_vec();

        Ok(GradientUtils {
            ctx,
            func,
            activity,
            types,
            loops: Vec::new(),
            alloc_block,
            primal_entry,
            exit,
            primal_rets,
            diffe: AHashMap::new(),
            shadow,
            tape: Vec::new(),
            cached: AHashMap::new(),
            rev: AHashMap::new(),
            rev_loops: Vec::new(),
            frees: Vec::new(),
            seed,
            aug_calls: AHashMap::new(),
            deleted_stores: Vec::new(),
            next_param: next,
            domtree: DominatorTree::default(),
            return_shape,
            top_level,
            params,
        })
    }

    pub(crate) fn is_constant(&self, val: Value) -> bool {
        self.activity.is_constant_value(val)
    }

    /// The adjoint accumulator cell of `val`, created on first demand: a
    /// zero-initialized stack cell in the allocations block.
    pub(crate) fn diffe_cell(&mut self, val: Value) -> Value {
        if let Some(cell) = self.diffe.get(&val) {
            return *cell;
        }
        let mut cursor = FuncCursor::new(&mut self.func);
        cursor.goto_top(self.alloc_block);
        let eight = cursor.func.dfg.iconst(8);
        let cell = cursor.ins().alloca(eight);
        // Position the zero store after the alloca it initializes.
        let alloca_inst = cursor.func.dfg.value_def(cell).unwrap_inst();
        cursor.goto_inst(alloca_inst);
        cursor.next_inst();
        cursor.ins().store(consts::F_ZERO, cell);
        self.diffe.insert(val, cell);
        cell
    }

    /// Read and clear the accumulated adjoint of `val` at the cursor.
    pub(crate) fn take_diffe(&mut self, val: Value, block: Block) -> Value {
        if self.is_constant(val) {
            return consts::F_ZERO;
        }
        let cell = self.diffe_cell(val);
        let mut cursor = FuncCursor::new(&mut self.func).at_bottom(block);
        let adj = cursor.ins().load(cell);
        cursor.ins().store(consts::F_ZERO, cell);
        adj
    }

    /// Accumulate `delta` into the adjoint of `val` at the cursor; no-op
    /// for constants.
    pub(crate) fn add_to_diffe(&mut self, val: Value, delta: Value, block: Block) {
        if self.is_constant(val) || self.activity.is_duplicated(val) {
            return;
        }
        let cell = self.diffe_cell(val);
        let mut cursor = FuncCursor::new(&mut self.func).at_bottom(block);
        let old = cursor.ins().load(cell);
        let new = cursor.ins().fadd(old, delta);
        cursor.ins().store(new, cell);
    }

    /// Store the incoming adjoint of the primary return value.
    pub(crate) fn seed_return(&mut self) {
        let Some(&ret_val) = self.primal_rets.first() else { return };
        if self.is_constant(ret_val) {
            return;
        }
        let seed = self.seed.unwrap_or(consts::F_ONE);
        let cell = self.diffe_cell(ret_val);
        let mut cursor = FuncCursor::new(&mut self.func);
        cursor.goto_before_terminator(self.exit);
        cursor.ins().store(seed, cell);
    }

    /// The shadow pointer mirroring duplicated value `val`; pointer
    /// arithmetic has been mirrored during the forward fixup, so this is a
    /// plain map hit.
    pub(crate) fn shadow_of(&self, val: Value) -> Value {
        self.shadow[&val]
    }

    /// The innermost canonicalized loop containing `block`.
    pub(crate) fn loop_of(&self, block: Block) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, lp) in self.loops.iter().enumerate() {
            if lp.contains(block) {
                best = match best {
                    Some(prev) if self.loops[prev].blocks.iter().count()
                        <= lp.blocks.iter().count() =>
                    {
                        Some(prev)
                    }
                    _ => Some(idx),
                };
            }
        }
        best
    }

    /// The chain of loops containing `block`, innermost first.
    pub(crate) fn containing_loops(&self, block: Block) -> Vec<usize> {
        let mut res = Vec::new();
        let mut cur = self.loop_of(block);
        while let Some(idx) = cur {
            res.push(idx);
            cur = self.loops[idx].parent;
        }
        res
    }

    /// Make the primal value `val` available at the reverse position
    /// `rev_block` (the reverse twin of `at`). Prefers using the SSA value
    /// directly, then recomputation, then the tape.
    pub(crate) fn lookup(
        &mut self,
        val: Value,
        at: Block,
        rev_block: Block,
    ) -> Result<Value, AutodiffError> {
        if self.directly_available(val) {
            return Ok(val);
        }
        if let Some(slot) = self.cached.get(&val) {
            let slot = self.tape[*slot].1.clone();
            return Ok(self.emit_tape_load(&slot, at, rev_block));
        }
        if let Some(recomputed) = self.unwrap(val, at, rev_block, 6)? {
            return Ok(recomputed);
        }
        let slot = self.cache_value(val)?;
        Ok(self.emit_tape_load(&slot, at, rev_block))
    }

    /// Constants, parameters, and values whose definition dominates the
    /// primal exit are in scope throughout the reverse sweep.
    fn directly_available(&self, val: Value) -> bool {
        match self.func.dfg.value_def(val) {
            ValueDef::Const(_) | ValueDef::Param(_) => true,
            ValueDef::Invalid => false,
            ValueDef::Result(inst, _) => {
                let def_block = match self.func.layout.inst_block(inst) {
                    Some(block) => block,
                    None => return false,
                };
                // A definition inside a loop names a different value every
                // iteration; dominating the exit is not enough.
                if self.loop_of(def_block).is_some() {
                    return false;
                }
                self.domtree.dominates(self.exit, def_block)
            }
        }
    }

    /// The recomputation walker: rebuild `val` at the reverse position out
    /// of available operands. Pure arithmetic, casts, selects and address
    /// computation qualify; the canonical induction variable of a loop maps
    /// to the mirror index of the reverse sweep.
    fn unwrap(
        &mut self,
        val: Value,
        at: Block,
        rev_block: Block,
        fuel: u8,
    ) -> Result<Option<Value>, AutodiffError> {
        if fuel == 0 {
            return Ok(None);
        }
        if self.directly_available(val) {
            return Ok(Some(val));
        }
        // The canonical induction variable of a containing loop is the
        // mirror index on the way back.
        for &idx in &self.containing_loops(at) {
            if self.loops[idx].iv == val {
                let rev = self.rev_loops[idx].expect("reverse loop context not yet built");
                return Ok(Some(rev.rev_index));
            }
        }
        if let Some(slot) = self.cached.get(&val) {
            let slot = self.tape[*slot].1.clone();
            return Ok(Some(self.emit_tape_load(&slot, at, rev_block)));
        }

        let ValueDef::Result(inst, _) = self.func.dfg.value_def(val) else { return Ok(None) };
        let data = self.func.dfg.insts[inst].clone();
        let rebuilt = match data {
            InstructionData::Unary { opcode, arg } if unwrap_safe(opcode) => {
                let Some(arg) = self.unwrap(arg, at, rev_block, fuel - 1)? else {
                    return Ok(None);
                };
                let mut cursor = FuncCursor::new(&mut self.func).at_bottom(rev_block);
                cursor.ins().unary(opcode, arg)
            }
            InstructionData::Binary { opcode, args: [lhs, rhs] } if unwrap_safe(opcode) => {
                let Some(lhs) = self.unwrap(lhs, at, rev_block, fuel - 1)? else {
                    return Ok(None);
                };
                let Some(rhs) = self.unwrap(rhs, at, rev_block, fuel - 1)? else {
                    return Ok(None);
                };
                let mut cursor = FuncCursor::new(&mut self.func).at_bottom(rev_block);
                cursor.ins().binary(opcode, lhs, rhs)
            }
            InstructionData::Ternary { opcode: Opcode::Select, args: [c, t, e] } => {
                let (Some(c), Some(t), Some(e)) = (
                    self.unwrap(c, at, rev_block, fuel - 1)?,
                    self.unwrap(t, at, rev_block, fuel - 1)?,
                    self.unwrap(e, at, rev_block, fuel - 1)?,
                ) else {
                    return Ok(None);
                };
                let mut cursor = FuncCursor::new(&mut self.func).at_bottom(rev_block);
                cursor.ins().select(c, t, e)
            }
            // A phi with one live incoming edge is a move.
            InstructionData::PhiNode(ref phi) => {
                let edges: Vec<_> = self.func.dfg.phi_edges(phi).collect();
                match edges.as_slice() {
                    [(_, incoming)] => {
                        let incoming = *incoming;
                        match self.unwrap(incoming, at, rev_block, fuel - 1)? {
                            Some(incoming) => incoming,
                            None => return Ok(None),
                        }
                    }
                    _ => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(rebuilt))
    }

    /// Put `val` on the tape: decide stack cell vs per-loop array, emit the
    /// primal-side store, and record the slot.
    fn cache_value(&mut self, val: Value) -> Result<CacheSlot, AutodiffError> {
        let ValueDef::Result(inst, _) = self.func.dfg.value_def(val) else {
            return Err(AutodiffError::UnhandledInstruction {
                inst: Inst::from(0u32),
                op: "cache of a non-instruction value",
            });
        };
        let def_block = self.func.layout.inst_block(inst).unwrap();
        let loops = self.containing_loops(def_block);

        let slot = if loops.is_empty() {
            // One cell, written right after the definition.
            let cell = self.alloc_cell();
            let mut cursor = FuncCursor::new(&mut self.func);
            cursor.goto_inst(last_phi_or(inst, &cursor.func));
            cursor.next_inst();
            cursor.ins().store(val, cell);
            CacheSlot::Cell(cell)
        } else {
            self.cache_in_loop(val, inst, &loops)?
        };

        self.cached.insert(val, self.tape.len());
        self.tape.push((val, slot.clone()));
        Ok(slot)
    }

    /// Per-loop array storage: sized by the product of the containing trip
    /// counts, indexed by the mixed radix of the induction variables.
    fn cache_in_loop(
        &mut self,
        val: Value,
        inst: Inst,
        loops: &[usize],
    ) -> Result<CacheSlot, AutodiffError> {
        let innermost = loops[0];
        let outermost = *loops.last().unwrap();
        let dynamic = loops.iter().any(|idx| self.loops[*idx].is_dynamic());
        if dynamic && loops.len() > 1 {
            return Err(AutodiffError::UnhandledInstruction {
                inst,
                op: "cache inside a dynamic loop nested in another loop",
            });
        }

        let cell = self.alloc_cell();
        if dynamic {
            // Start with a single slot; the array grows to `iv + 1` slots at
            // the top of every iteration, so the store below always fits.
            let lp = &self.loops[innermost];
            let (preheader, header, iv) = (lp.preheader, lp.header, lp.iv);
            let realloc = self.import(
                FunctionSignature {
                    name: "realloc".to_owned(),
                    params: 2,
                    returns: 1,
                    has_sideeffects: true,
                },
            );
            let malloc = self.import(
                FunctionSignature {
                    name: "malloc".to_owned(),
                    params: 1,
                    returns: 1,
                    has_sideeffects: true,
                },
            );
            let mut cursor = FuncCursor::new(&mut self.func);
            cursor.goto_before_terminator(preheader);
            let eight = cursor.func.dfg.iconst(8);
            let base = cursor.ins().call(malloc, &[eight]);
            let base = cursor.func.dfg.first_result(base);
            cursor.ins().store(base, cell);

            cursor.goto_after_phis(header);
            let old = cursor.ins().load(cell);
            let needed = cursor.ins().iadd(iv, consts::ONE);
            let bytes = cursor.ins().imul(needed, eight);
            let grown = cursor.ins().call(realloc, &[old, bytes]);
            let grown = cursor.func.dfg.first_result(grown);
            cursor.ins().store(grown, cell);
        } else {
            // Static sizes multiply out in the outermost preheader.
            let preheader = self.loops[outermost].preheader;
            let malloc = self.import(
                FunctionSignature {
                    name: "malloc".to_owned(),
                    params: 1,
                    returns: 1,
                    has_sideeffects: true,
                },
            );
            let trips: Vec<Value> = loops
                .iter()
                .map(|idx| match self.loops[*idx].trip_count {
                    TripCount::Static(bound) => bound,
                    TripCount::Dynamic { .. } => unreachable!(),
                })
                .collect();
            let mut cursor = FuncCursor::new(&mut self.func);
            cursor.goto_before_terminator(preheader);
            let eight = cursor.func.dfg.iconst(8);
            let mut size = eight;
            for trip in trips {
                size = cursor.ins().imul(size, trip);
            }
            let base = cursor.ins().call(malloc, &[size]);
            let base = cursor.func.dfg.first_result(base);
            cursor.ins().store(base, cell);
        }

        // Primal-side store, indexed by the forward induction variables.
        let ivs: Vec<Value> = loops.iter().map(|idx| self.loops[*idx].iv).collect();
        let mut cursor = FuncCursor::new(&mut self.func);
        cursor.goto_inst(last_phi_or(inst, &cursor.func));
        cursor.next_inst();
        let base = cursor.ins().load(cell);
        let addr = Self::emit_array_addr(&mut cursor, base, loops, &ivs, &self.loops);
        cursor.ins().store(val, addr);

        Ok(CacheSlot::Array { cell, lp: innermost })
    }

    /// `base + 8 * mixed_radix(indices)` with the outermost loop as the
    /// most significant digit.
    fn emit_array_addr(
        cursor: &mut FuncCursor<'_>,
        base: Value,
        loops: &[usize],
        indices: &[Value],
        ctxs: &[LoopCtx],
    ) -> Value {
        let mut idx: Option<Value> = None;
        for (pos, lp) in loops.iter().enumerate().rev() {
            let digit = indices[pos];
            idx = Some(match idx {
                None => digit,
                Some(acc) => {
                    let radix = match ctxs[*lp].trip_count {
                        TripCount::Static(bound) => bound,
                        // dynamic arrays are single-loop; unreachable here
                        TripCount::Dynamic { .. } => unreachable!(),
                    };
                    let scaled = cursor.ins().imul(acc, radix);
                    cursor.ins().iadd(scaled, digit)
                }
            });
        }
        let idx = idx.unwrap();
        let eight = cursor.func.dfg.iconst(8);
        let bytes = cursor.ins().imul(idx, eight);
        cursor.ins().padd(base, bytes)
    }

    /// Load a tape slot at the reverse position.
    fn emit_tape_load(&mut self, slot: &CacheSlot, at: Block, rev_block: Block) -> Value {
        match slot {
            CacheSlot::Cell(cell) => {
                let mut cursor = FuncCursor::new(&mut self.func).at_bottom(rev_block);
                cursor.ins().load(*cell)
            }
            CacheSlot::Array { cell, lp } => {
                let loops = {
                    let mut chain = vec![*lp];
                    let mut cur = self.loops[*lp].parent;
                    while let Some(idx) = cur {
                        chain.push(idx);
                        cur = self.loops[idx].parent;
                    }
                    chain
                };
                let indices: Vec<Value> = loops
                    .iter()
                    .map(|idx| self.rev_loops[*idx].expect("reverse loop missing").rev_index)
                    .collect();
                let _ = at;
                let mut cursor = FuncCursor::new(&mut self.func).at_bottom(rev_block);
                let base = cursor.ins().load(*cell);
                let addr = Self::emit_array_addr(&mut cursor, base, &loops, &indices, &self.loops);
                cursor.ins().load(addr)
            }
        }
    }

    fn alloc_cell(&mut self) -> Value {
        let mut cursor = FuncCursor::new(&mut self.func);
        cursor.goto_top(self.alloc_block);
        let eight = cursor.func.dfg.iconst(8);
        cursor.ins().alloca(eight)
    }

    /// Import (or find) an external signature in the synthesized function.
    pub(crate) fn import(&mut self, sig: FunctionSignature) -> mir::FuncRef {
        match self.func.lookup_function(&sig.name) {
            Some(func_ref) => func_ref,
            None => self.func.import_function(sig),
        }
    }
}

/// Stores can only be placed after the phi prefix of a block.
fn last_phi_or(inst: Inst, func: &Function) -> Inst {
    let block = func.layout.inst_block(inst).unwrap();
    if !func.dfg.insts[inst].is_phi() {
        return inst;
    }
    let mut last = inst;
    for it in func.layout.block_insts(block) {
        if func.dfg.insts[it].is_phi() {
            last = it;
        } else {
            break;
        }
    }
    last
}

/// Opcodes the recomputation walker may replay: pure value computation
/// with no memory dependence.
fn unwrap_safe(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        Fneg | Fadd
            | Fsub
            | Fmul
            | Fdiv
            | Frem
            | Sqrt
            | Exp
            | Ln
            | Log
            | Sin
            | Cos
            | Tan
            | Asin
            | Acos
            | Atan
            | Sinh
            | Cosh
            | Tanh
            | Fabs
            | Floor
            | Ceil
            | Pow
            | Hypot
            | Atan2
            | Fmin
            | Fmax
            | Ineg
            | Inot
            | Bnot
            | Iadd
            | Isub
            | Imul
            | Idiv
            | Irem
            | Ishl
            | Ishr
            | Iand
            | Ior
            | Ixor
            | Ilt
            | Igt
            | Ile
            | Ige
            | Ieq
            | Ine
            | Flt
            | Fgt
            | Fle
            | Fge
            | Feq
            | Fne
            | Beq
            | Bne
            | IFcast
            | FIcast
            | BIcast
            | IBcast
            | BFcast
            | FBcast
            | Padd
            | OptBarrier
    )
}
