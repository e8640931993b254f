//! Activity analysis.
//!
//! Decides, for every value and instruction of the primal, whether it
//! carries a derivative. A value is *active* when it both depends on an
//! active input (down direction) and influences an active output (up
//! direction); everything else is constant and needs no pullback. Pointer
//! arguments whose pointee carries floats are *duplicated*: their
//! derivative lives in parallel shadow memory instead of a scalar
//! accumulator.

use bitset::BitSet;
use mir::{Function, Inst, InstructionData, Opcode, Param, Value, ValueDef};
use mir_ty::{ConcreteType, TypeResults};

#[cfg(test)]
mod tests;

/// Per-argument activity requested by the caller of the synthesis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgActivity {
    /// No derivative.
    Const,
    /// Scalar with an adjoint accumulator.
    Active,
    /// Pointer paired with a shadow pointer.
    Dup,
}

/// The classification of every value of one function.
pub struct Activity {
    /// Values with a structurally zero derivative.
    constant_values: BitSet<Value>,
    /// Instructions whose pullback is a no-op.
    constant_insts: BitSet<Inst>,
    /// Values classified as duplicated pointers.
    duplicated: BitSet<Value>,
    pub args: Vec<ArgActivity>,
}

impl Activity {
    /// Values fabricated after the analysis ran (shadow mirrors, tape and
    /// canonicalization code) sit past the analyzed range and are constant
    /// by construction.
    pub fn is_constant_value(&self, val: Value) -> bool {
        usize::from(val) >= self.constant_values.domain_size()
            || self.constant_values.contains(val)
    }

    pub fn is_constant_inst(&self, inst: Inst) -> bool {
        usize::from(inst) >= self.constant_insts.domain_size()
            || self.constant_insts.contains(inst)
    }

    /// Is this a pointer whose derivatives live in shadow memory?
    pub fn is_duplicated(&self, val: Value) -> bool {
        usize::from(val) < self.duplicated.domain_size() && self.duplicated.contains(val)
    }

    /// Active scalar: carries an adjoint accumulator.
    pub fn is_active(&self, val: Value) -> bool {
        !self.is_constant_value(val) && !self.is_duplicated(val)
    }

    pub fn arg_activity(&self, param: Param) -> ArgActivity {
        self.args.get(usize::from(param)).copied().unwrap_or(ArgActivity::Const)
    }

    /// Classify every value of `func`.
    ///
    /// The up-front marks are the argument activities and the demanded
    /// return. A value is active when differential data reaches it (down)
    /// and it reaches a differential output (up); both closures flow
    /// through memory by treating a store and the loads of the same base
    /// pointer as connected. Internal allocations holding active floats
    /// become duplicated, like duplicated arguments.
    pub fn build(
        func: &Function,
        types: &TypeResults,
        args: &[ArgActivity],
        differential_return: bool,
        trace: bool,
    ) -> Activity {
        let num_values = func.dfg.num_values();
        let mut duplicated = BitSet::new_empty(num_values);
        let mut from_input = BitSet::new_empty(num_values);
        let mut to_output = BitSet::new_empty(num_values);

        for val in func.dfg.values() {
            if let ValueDef::Param(param) = func.dfg.value_def(val) {
                if args.get(usize::from(param)) == Some(&ArgActivity::Dup) {
                    duplicated.insert(val);
                }
            }
        }

        // The three sets feed each other (a load from duplicated memory is
        // a differential source, an allocation storing active data becomes
        // duplicated), so iterate to a fixed point; each round only adds
        // bits, so it terminates.
        loop {
            let mut changed = false;
            changed |= propagate_duplicated(func, types, &mut duplicated);
            changed |= close_from_input(func, types, args, &duplicated, &mut from_input);
            changed |=
                close_to_output(func, differential_return, &duplicated, &mut to_output);
            changed |= mark_internal_allocations(
                func,
                types,
                &from_input,
                &to_output,
                &mut duplicated,
            );
            if !changed {
                break;
            }
        }

        // Active = float-classified, reached from both directions, and
        // actually observed by something. Values whose classification is
        // open but that flow into pointer positions are not scalars and
        // never active.
        let mut constant_values = BitSet::new_empty(num_values);
        for val in func.dfg.values() {
            let float_like = match types.query(val).data0() {
                ConcreteType::Float(_) => true,
                ConcreteType::Unknown | ConcreteType::Anything => {
                    !has_non_integral_use(func, val)
                }
                _ => false,
            };
            let active = !duplicated.contains(val)
                && float_like
                && from_input.contains(val)
                && to_output.contains(val)
                && has_any_use(func, val, false);
            if !active && !duplicated.contains(val) {
                constant_values.insert(val);
            }
            if trace {
                log::debug!(
                    "activity: {} {}",
                    val,
                    if duplicated.contains(val) {
                        "dup"
                    } else if active {
                        "active"
                    } else {
                        "const"
                    }
                );
            }
        }

        // An instruction is constant when every result is and it has no
        // active side effect.
        let mut constant_insts = BitSet::new_empty(func.dfg.num_insts());
        for inst in func.dfg.insts.iter() {
            let results_const =
                func.dfg.inst_results(inst).iter().all(|res| constant_values.contains(*res));
            let active_effect = match func.dfg.insts[inst] {
                InstructionData::Binary { opcode: Opcode::Store, args: [val, ptr] } => {
                    duplicated.contains(ptr) && !constant_values.contains(val)
                }
                InstructionData::Ternary { opcode: Opcode::Memcpy, args: [dst, src, _] } => {
                    duplicated.contains(dst) || duplicated.contains(src)
                }
                InstructionData::Call { args, .. } => !call_is_pure_sink(func, inst)
                    && args
                        .as_slice(&func.dfg.insts.pools.value_lists)
                        .iter()
                        .any(|arg| !constant_values.contains(*arg)),
                _ => false,
            };
            if results_const && !active_effect {
                constant_insts.insert(inst);
            }
        }

        Activity { constant_values, constant_insts, duplicated, args: args.to_vec() }
    }
}

/// Opcodes whose result never carries a derivative: integer and boolean
/// arithmetic, comparisons, discretizing casts and control flow.
pub(crate) fn zero_derivative(func: &Function, inst: Inst) -> bool {
    zero_derivative_op(func.dfg.insts[inst].opcode())
}

pub(crate) fn zero_derivative_op(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Ineg
            | Opcode::Inot
            | Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Idiv
            | Opcode::Irem
            | Opcode::Ishl
            | Opcode::Ishr
            | Opcode::Iand
            | Opcode::Ior
            | Opcode::Ixor
            | Opcode::Bnot
            | Opcode::Ilt
            | Opcode::Igt
            | Opcode::Ile
            | Opcode::Ige
            | Opcode::Ieq
            | Opcode::Ine
            | Opcode::Flt
            | Opcode::Fgt
            | Opcode::Fle
            | Opcode::Fge
            | Opcode::Feq
            | Opcode::Fne
            | Opcode::Beq
            | Opcode::Bne
            | Opcode::FIcast
            | Opcode::IFcast
            | Opcode::BIcast
            | Opcode::IBcast
            | Opcode::FBcast
            | Opcode::BFcast
            | Opcode::Floor
            | Opcode::Ceil
            | Opcode::Alloca
            | Opcode::Br
            | Opcode::Jmp
            | Opcode::Unreachable
            | Opcode::Memset
    )
}

/// Does the type analysis say this value is (or can be) a float scalar?
fn is_float_value(types: &TypeResults, val: Value) -> bool {
    matches!(
        types.query(val).data0(),
        ConcreteType::Float(_) | ConcreteType::Unknown | ConcreteType::Anything
    )
}

/// Calls that are known pure sinks or sources; their operands are
/// ignorable uses.
pub(crate) fn call_is_pure_sink(func: &Function, inst: Inst) -> bool {
    match func.dfg.call_signature(inst) {
        Some(sig) => {
            matches!(sig.name.as_str(), "printf" | "puts" | "fprintf" | "__assert_fail" | "free")
                || sig.name.starts_with("__cxa_guard_")
        }
        None => false,
    }
}

/// Down closure: values reachable from the differential inputs (active
/// parameters and loads out of duplicated memory), flowing through SSA
/// uses and through memory via stores to a base whose loads it taints.
fn close_from_input(
    func: &Function,
    types: &TypeResults,
    args: &[ArgActivity],
    duplicated: &BitSet<Value>,
    from_input: &mut BitSet<Value>,
) -> bool {
    let mut changed = false;
    let mut stack: Vec<Value> = Vec::new();
    for val in func.dfg.values() {
        match func.dfg.value_def(val) {
            ValueDef::Param(param)
                if args.get(usize::from(param)) == Some(&ArgActivity::Active) =>
            {
                stack.push(val)
            }
            ValueDef::Result(inst, _) => {
                if let InstructionData::Unary { opcode: Opcode::Load, arg } = func.dfg.insts[inst]
                {
                    if duplicated.contains(arg) && is_float_value(types, val) {
                        stack.push(val);
                    }
                }
            }
            _ => (),
        }
    }

    while let Some(val) = stack.pop() {
        if !from_input.insert(val) {
            continue;
        }
        changed = true;
        for use_ in func.dfg.uses(val) {
            let (inst, idx) = func.dfg.use_to_operand(use_);
            if zero_derivative(func, inst) {
                continue;
            }
            // A tainted value stored to memory taints the loads of the
            // same base pointer.
            if let InstructionData::Binary { opcode: Opcode::Store, args: [_, ptr] } =
                func.dfg.insts[inst]
            {
                if idx == 0 {
                    let base = base_pointer(func, ptr);
                    stack.extend(loads_of_base(func, base));
                }
                continue;
            }
            for res in func.dfg.inst_results(inst) {
                stack.push(*res);
            }
        }
    }
    changed
}

/// Up closure: values that reach a differential output (the return, a
/// store into duplicated memory, an argument of a differentiated call),
/// flowing backwards through operands and from loads to the stores of the
/// same base.
fn close_to_output(
    func: &Function,
    differential_return: bool,
    duplicated: &BitSet<Value>,
    to_output: &mut BitSet<Value>,
) -> bool {
    let mut changed = false;
    let mut stack: Vec<Value> = Vec::new();
    for block in &func.layout {
        for inst in func.layout.block_insts(block) {
            match func.dfg.insts[inst] {
                InstructionData::Ret { args } if differential_return => {
                    stack.extend(args.as_slice(&func.dfg.insts.pools.value_lists).iter().copied());
                }
                InstructionData::Binary { opcode: Opcode::Store, args: [val, ptr] }
                    if duplicated.contains(ptr) =>
                {
                    stack.push(val);
                }
                InstructionData::Call { args, .. } if !call_is_pure_sink(func, inst) => {
                    stack.extend(args.as_slice(&func.dfg.insts.pools.value_lists).iter().copied());
                }
                _ => (),
            }
        }
    }

    while let Some(val) = stack.pop() {
        if !to_output.insert(val) {
            continue;
        }
        changed = true;
        if let ValueDef::Result(inst, _) = func.dfg.value_def(val) {
            if zero_derivative(func, inst) {
                continue;
            }
            // A load feeding an output pulls in the stores of its base.
            if let InstructionData::Unary { opcode: Opcode::Load, arg } = func.dfg.insts[inst] {
                let base = base_pointer(func, arg);
                stack.extend(stores_to_base(func, base));
            }
            stack.extend(func.dfg.instr_args(inst).iter().copied());
        }
    }
    changed
}

/// Internal allocations (alloca, malloc) become duplicated when their
/// pointee holds floats and active data flows through them.
fn mark_internal_allocations(
    func: &Function,
    types: &TypeResults,
    from_input: &BitSet<Value>,
    to_output: &BitSet<Value>,
    duplicated: &mut BitSet<Value>,
) -> bool {
    let mut changed = false;
    for inst in func.dfg.insts.iter() {
        let is_alloc = match &func.dfg.insts[inst] {
            InstructionData::Unary { opcode: Opcode::Alloca, .. } => true,
            InstructionData::Call { func_ref, .. } => {
                func.dfg.signatures[*func_ref].name == "malloc"
            }
            _ => false,
        };
        if !is_alloc || !func.dfg.has_results(inst) {
            continue;
        }
        let res = func.dfg.first_result(inst);
        if duplicated.contains(res) {
            continue;
        }
        let holds_floats = types
            .query(res)
            .iter()
            .any(|(path, ct)| !path.is_empty() && matches!(ct, mir_ty::ConcreteType::Float(_)));
        if !holds_floats {
            continue;
        }
        let active_traffic = stores_to_base(func, res).iter().any(|val| from_input.contains(*val))
            || loads_of_base(func, res).iter().any(|val| to_output.contains(*val));
        if active_traffic {
            duplicated.insert(res);
            changed = true;
        }
    }
    changed
}

/// Strip address arithmetic down to the allocation or argument the pointer
/// descends from.
fn base_pointer(func: &Function, mut ptr: Value) -> Value {
    loop {
        match func.dfg.value_def(ptr) {
            ValueDef::Result(inst, _) => match func.dfg.insts[inst] {
                InstructionData::Binary { opcode: Opcode::Padd, args: [base, _] } => ptr = base,
                _ => return ptr,
            },
            _ => return ptr,
        }
    }
}

/// Results of loads whose address descends from `base`.
fn loads_of_base(func: &Function, base: Value) -> Vec<Value> {
    let mut res = Vec::new();
    for inst in func.dfg.insts.iter() {
        if let InstructionData::Unary { opcode: Opcode::Load, arg } = func.dfg.insts[inst] {
            if base_pointer(func, arg) == base {
                res.extend(func.dfg.inst_results(inst).iter().copied());
            }
        }
    }
    res
}

/// Values stored through addresses descending from `base`.
fn stores_to_base(func: &Function, base: Value) -> Vec<Value> {
    let mut res = Vec::new();
    for inst in func.dfg.insts.iter() {
        if let InstructionData::Binary { opcode: Opcode::Store, args: [val, ptr] } =
            func.dfg.insts[inst]
        {
            if base_pointer(func, ptr) == base {
                res.push(val);
            }
        }
    }
    res
}

/// Addresses derived from duplicated pointers are duplicated as well, and
/// so are pointers loaded out of duplicated memory when they point at
/// floats.
fn propagate_duplicated(
    func: &Function,
    types: &TypeResults,
    duplicated: &mut BitSet<Value>,
) -> bool {
    let mut any = false;
    let mut changed = true;
    while changed {
        changed = false;
        for inst in func.dfg.insts.iter() {
            match func.dfg.insts[inst] {
                InstructionData::Binary { opcode: Opcode::Padd, args: [ptr, _] }
                    if duplicated.contains(ptr) =>
                {
                    changed |= duplicated.insert(func.dfg.first_result(inst));
                }
                InstructionData::Unary { opcode: Opcode::Load, arg }
                    if duplicated.contains(arg) =>
                {
                    let res = func.dfg.first_result(inst);
                    if types.query(res).data0() == ConcreteType::Pointer {
                        changed |= duplicated.insert(res);
                    }
                }
                InstructionData::PhiNode(ref phi) => {
                    let res = func.dfg.first_result(inst);
                    if !duplicated.contains(res)
                        && func.dfg.phi_edges(phi).any(|(_, val)| duplicated.contains(val))
                    {
                        duplicated.insert(res);
                        changed = true;
                    }
                }
                _ => (),
            }
        }
        any |= changed;
    }
    any
}

/// Is there any transitive use of `val` that is not ignorable? Ignorable
/// uses are the pure sink calls and, when `saw_return` is set, the return
/// instruction.
pub(crate) fn has_any_use(func: &Function, val: Value, saw_return: bool) -> bool {
    let mut visited: Vec<Inst> = Vec::new();
    let mut stack = vec![val];
    while let Some(val) = stack.pop() {
        for use_ in func.dfg.uses(val) {
            let (inst, _) = func.dfg.use_to_operand(use_);
            if visited.contains(&inst) {
                continue;
            }
            visited.push(inst);
            match func.dfg.insts[inst] {
                InstructionData::Ret { .. } if saw_return => (),
                InstructionData::Call { .. } if call_is_pure_sink(func, inst) => (),
                InstructionData::Unary { opcode: Opcode::OptBarrier, .. }
                | InstructionData::PhiNode(_) => {
                    stack.extend(func.dfg.inst_results(inst).iter().copied());
                }
                _ => return true,
            }
        }
    }
    false
}

/// Does any transitive use of `val` flow into a pointer position (an
/// address operand, pointer arithmetic, or a pointer-classified store)?
/// Purely integral observers (comparisons, branches, integer arithmetic,
/// discretizing casts) and ignorable calls are skipped.
pub(crate) fn has_non_integral_use(func: &Function, val: Value) -> bool {
    let mut visited: Vec<Inst> = Vec::new();
    let mut stack = vec![val];
    while let Some(val) = stack.pop() {
        for use_ in func.dfg.uses(val) {
            let (inst, idx) = func.dfg.use_to_operand(use_);
            if visited.contains(&inst) {
                continue;
            }
            visited.push(inst);
            match func.dfg.insts[inst].opcode() {
                Opcode::Load | Opcode::Memcpy | Opcode::Memset => return true,
                Opcode::Padd if idx == 0 => return true,
                Opcode::Store if idx == 1 => return true,
                Opcode::Call if !call_is_pure_sink(func, inst) => return true,
                Opcode::Call => (),
                op if op.is_comparison() => (),
                Opcode::Br
                | Opcode::Ineg
                | Opcode::Inot
                | Opcode::Bnot
                | Opcode::FIcast
                | Opcode::IFcast
                | Opcode::BIcast
                | Opcode::IBcast => (),
                Opcode::Iadd | Opcode::Isub | Opcode::Imul | Opcode::Ishl | Opcode::Ishr
                | Opcode::Padd | Opcode::OptBarrier | Opcode::Phi | Opcode::Select => {
                    stack.extend(func.dfg.inst_results(inst).iter().copied());
                }
                _ => (),
            }
        }
    }
    false
}
