//! The per-function fixpoint.
//!
//! A worklist-driven abstract interpreter over the value lattice. Every
//! instruction is visited until nothing changes; each visit refines the
//! result from the operands *and* the operands from the result, and any
//! progress re-enqueues the neighbors. Calls are parked on a deferred queue
//! that is only drained once the non-call instructions have settled, which
//! changes visit order but not the fixed point.

use std::collections::VecDeque;

use mir::{Const, Function, FunctionRegistry, Inst, InstructionData, Opcode, Value, ValueDef};
use typed_index_collections::TiVec;
use workqueue::WorkQueue;

use crate::known_values::KnownValues;
use crate::tree::SLOT;
use crate::{ConcreteType, FnTypeInfo, TypeAnalysis, TypeError, TypeResults, TypeTree};

#[cfg(test)]
mod tests;

pub(crate) struct TypeAnalyzer<'a> {
    func: &'a Function,
    registry: &'a FunctionRegistry,
    interprocedural: &'a mut TypeAnalysis,
    info: &'a FnTypeInfo,
    types: TiVec<Value, TypeTree>,
    ret: Vec<TypeTree>,
    workqueue: WorkQueue<Inst>,
    deferred_calls: VecDeque<Inst>,
}

impl<'a> TypeAnalyzer<'a> {
    pub(crate) fn new(
        func: &'a Function,
        registry: &'a FunctionRegistry,
        interprocedural: &'a mut TypeAnalysis,
        info: &'a FnTypeInfo,
    ) -> TypeAnalyzer<'a> {
        let types = seed(func, info);
        let mut workqueue = WorkQueue::with_none(func.dfg.num_insts());
        for block in &func.layout {
            workqueue.extend(func.layout.block_insts(block));
        }

        TypeAnalyzer {
            func,
            registry,
            interprocedural,
            info,
            types,
            ret: Vec::new(),
            workqueue,
            deferred_calls: VecDeque::new(),
        }
    }

    /// The classification of a function that was not analyzed: parameter
    /// and constant seeds only. Recursive analysis requests resolve to
    /// this.
    pub(crate) fn seed_only(func: &Function, info: &FnTypeInfo) -> TypeResults {
        let types = seed(func, info);
        let params = info.args.clone();
        let known = func.dfg.values().map(|_| None).collect();
        TypeResults { types, params, ret: vec![info.ret.clone()], known }
    }

    pub(crate) fn run(mut self) -> Result<TypeResults, TypeError> {
        self.fixpoint()?;
        if self.unused_value_closure()? {
            self.fixpoint()?;
        }

        // Collect the final state.
        let num_params = self.info.args.len();
        let params = (0..num_params)
            .map(|p| {
                self.func
                    .dfg
                    .values()
                    .find(|val| {
                        matches!(self.func.dfg.value_def(*val),
                            ValueDef::Param(param) if usize::from(param) == p)
                    })
                    .map(|val| self.types[val].clone())
                    .unwrap_or_default()
            })
            .collect();

        let mut known_values = KnownValues::new(self.func, self.info);
        let known: TiVec<Value, Option<Vec<i64>>> =
            self.func.dfg.values().map(|val| known_values.get(val)).collect();

        Ok(TypeResults { types: self.types, params, ret: self.ret, known })
    }

    fn fixpoint(&mut self) -> Result<(), TypeError> {
        loop {
            while let Some(inst) = self.workqueue.pop() {
                if self.func.dfg.insts[inst].opcode().is_call() {
                    if !self.deferred_calls.contains(&inst) {
                        self.deferred_calls.push_back(inst);
                    }
                    continue;
                }
                self.visit(inst)?;
            }
            match self.deferred_calls.pop_front() {
                Some(call) => self.visit(call)?,
                None => return Ok(()),
            }
        }
    }

    fn tree(&self, val: Value) -> &TypeTree {
        &self.types[val]
    }

    /// Join `tree` into the classification of `val`, re-enqueueing its
    /// definition and its users on progress.
    fn update(&mut self, val: Value, tree: &TypeTree) -> Result<(), TypeError> {
        if self.types[val].data0() == ConcreteType::Pointer
            && tree.data0() == ConcreteType::Integer
        {
            return Err(TypeError::IllegalPointerUpdate { val });
        }
        if self.types[val].or_in(tree)? {
            log::trace!("{} <- {:?}", val, self.types[val]);
            if let ValueDef::Result(inst, _) = self.func.dfg.value_def(val) {
                self.workqueue.insert(inst);
            }
            let users: smallvec::SmallVec<[Inst; 8]> =
                self.func.dfg.uses(val).map(|use_| self.func.dfg.use_to_operand(use_).0).collect();
            for user in users {
                self.workqueue.insert(user);
            }
        }
        Ok(())
    }

    fn update_scalar(&mut self, val: Value, ct: ConcreteType) -> Result<(), TypeError> {
        self.update(val, &TypeTree::scalar(ct))
    }

    fn visit(&mut self, inst: Inst) -> Result<(), TypeError> {
        use ConcreteType::*;

        let data = self.func.dfg.insts[inst].clone();
        let results = self.func.dfg.inst_results(inst);
        let res = results.first().copied();

        match data {
            InstructionData::Unary { opcode, arg } => {
                let res = res.unwrap();
                match opcode {
                    Opcode::Fneg
                    | Opcode::Sqrt
                    | Opcode::Exp
                    | Opcode::Ln
                    | Opcode::Log
                    | Opcode::Sin
                    | Opcode::Cos
                    | Opcode::Tan
                    | Opcode::Asin
                    | Opcode::Acos
                    | Opcode::Atan
                    | Opcode::Sinh
                    | Opcode::Cosh
                    | Opcode::Tanh
                    | Opcode::Fabs
                    | Opcode::Floor
                    | Opcode::Ceil => {
                        self.update_scalar(arg, ConcreteType::DOUBLE)?;
                        self.update_scalar(res, ConcreteType::DOUBLE)?;
                    }
                    Opcode::Ineg | Opcode::Inot | Opcode::Bnot => {
                        self.update_scalar(arg, Integer)?;
                        self.update_scalar(res, Integer)?;
                    }
                    Opcode::IFcast => {
                        self.update_scalar(arg, Integer)?;
                        self.update_scalar(res, ConcreteType::DOUBLE)?;
                    }
                    Opcode::FIcast => {
                        self.update_scalar(arg, ConcreteType::DOUBLE)?;
                        self.update_scalar(res, Integer)?;
                    }
                    Opcode::BIcast | Opcode::IBcast => {
                        self.update_scalar(arg, Integer)?;
                        self.update_scalar(res, Integer)?;
                    }
                    Opcode::BFcast => {
                        self.update_scalar(arg, Integer)?;
                        self.update_scalar(res, ConcreteType::DOUBLE)?;
                    }
                    Opcode::FBcast => {
                        self.update_scalar(arg, ConcreteType::DOUBLE)?;
                        self.update_scalar(res, Integer)?;
                    }
                    Opcode::Alloca => {
                        self.update_scalar(arg, Integer)?;
                        self.update_scalar(res, Pointer)?;
                    }
                    Opcode::Load => {
                        let pointee = self.tree(arg).lookup(SLOT);
                        self.update(res, &pointee)?;
                        let mut ptr = TypeTree::scalar(Pointer);
                        ptr.or_in(&self.tree(res).purge_anything().only(0))?;
                        self.update(arg, &ptr)?;
                    }
                    Opcode::OptBarrier => {
                        let arg_tree = self.tree(arg).purge_anything();
                        self.update(res, &arg_tree)?;
                        let res_tree = self.tree(res).purge_anything();
                        self.update(arg, &res_tree)?;
                    }
                    _ => unreachable!("{} is not a unary opcode", opcode),
                }
            }
            InstructionData::Binary { opcode, args: [lhs, rhs] } => match opcode {
                Opcode::Fadd
                | Opcode::Fsub
                | Opcode::Fmul
                | Opcode::Fdiv
                | Opcode::Frem
                | Opcode::Pow
                | Opcode::Hypot
                | Opcode::Atan2
                | Opcode::Fmin
                | Opcode::Fmax => {
                    let res = res.unwrap();
                    self.update_scalar(lhs, ConcreteType::DOUBLE)?;
                    self.update_scalar(rhs, ConcreteType::DOUBLE)?;
                    self.update_scalar(res, ConcreteType::DOUBLE)?;
                }
                Opcode::Iadd | Opcode::Isub => {
                    self.int_pointer_merger(res.unwrap(), lhs, rhs, opcode == Opcode::Isub)?;
                }
                Opcode::Imul => {
                    let res = res.unwrap();
                    self.update_scalar(lhs, Integer)?;
                    self.update_scalar(rhs, Integer)?;
                    self.update_scalar(res, Integer)?;
                }
                Opcode::Idiv | Opcode::Irem | Opcode::Ishl | Opcode::Ishr | Opcode::Iand
                | Opcode::Ior | Opcode::Ixor => {
                    // Demoted to unknown; only the pointer-int merger
                    // survives these.
                    self.int_pointer_merger(res.unwrap(), lhs, rhs, false)?;
                }
                Opcode::Ilt | Opcode::Igt | Opcode::Ile | Opcode::Ige | Opcode::Ieq
                | Opcode::Ine => {
                    let res = res.unwrap();
                    self.update_scalar(lhs, Integer)?;
                    self.update_scalar(rhs, Integer)?;
                    self.update_scalar(res, Integer)?;
                }
                Opcode::Flt | Opcode::Fgt | Opcode::Fle | Opcode::Fge | Opcode::Feq
                | Opcode::Fne => {
                    let res = res.unwrap();
                    self.update_scalar(lhs, ConcreteType::DOUBLE)?;
                    self.update_scalar(rhs, ConcreteType::DOUBLE)?;
                    self.update_scalar(res, Integer)?;
                }
                Opcode::Beq | Opcode::Bne => {
                    let res = res.unwrap();
                    self.update_scalar(lhs, Integer)?;
                    self.update_scalar(rhs, Integer)?;
                    self.update_scalar(res, Integer)?;
                }
                Opcode::Padd => self.visit_padd(res.unwrap(), lhs, rhs)?,
                Opcode::Store => {
                    let (val, ptr) = (lhs, rhs);
                    let mut ptr_tree = TypeTree::scalar(Pointer);
                    ptr_tree.or_in(&self.tree(val).purge_anything().only(0))?;
                    self.update(ptr, &ptr_tree)?;
                    let pointee = self.tree(ptr).lookup(SLOT);
                    self.update(val, &pointee)?;
                }
                _ => unreachable!("{} is not a binary opcode", opcode),
            },
            InstructionData::Ternary { opcode, args: [a, b, c] } => match opcode {
                Opcode::Select => {
                    let res = res.unwrap();
                    self.update_scalar(a, Integer)?;
                    // The result is one of the two data operands: it takes
                    // what both sides agree on, and each side must admit
                    // what is known about the result.
                    let mut meet = self.tree(b).clone();
                    meet.and_in(self.tree(c))?;
                    self.update(res, &meet.purge_anything())?;
                    let res_tree = self.tree(res).purge_anything();
                    self.update(b, &res_tree)?;
                    self.update(c, &res_tree)?;
                }
                Opcode::Memcpy => {
                    let (dst, src, len) = (a, b, c);
                    self.update_scalar(dst, Pointer)?;
                    self.update_scalar(src, Pointer)?;
                    self.update_scalar(len, Integer)?;
                    let mut known = KnownValues::new(self.func, self.info);
                    if let Some([bytes]) = known.get(len).as_deref() {
                        let copied = self.tree(src).shift_indices(0, *bytes, 0);
                        let mut dst_tree = TypeTree::scalar(Pointer);
                        dst_tree.or_in(&copied.purge_anything())?;
                        self.update(dst, &dst_tree)?;
                        let copied_back = self.tree(dst).shift_indices(0, *bytes, 0);
                        let mut src_tree = TypeTree::scalar(Pointer);
                        src_tree.or_in(&copied_back.purge_anything())?;
                        self.update(src, &src_tree)?;
                    }
                }
                Opcode::Memset => {
                    self.update_scalar(a, Pointer)?;
                    self.update_scalar(b, Integer)?;
                    self.update_scalar(c, Integer)?;
                }
                _ => unreachable!("{} is not a ternary opcode", opcode),
            },
            InstructionData::Branch { cond, .. } => {
                self.update_scalar(cond, Integer)?;
            }
            InstructionData::Jump { .. } | InstructionData::Unreachable => (),
            InstructionData::PhiNode(ref phi) => {
                let res = res.unwrap();
                // The phi is one of its incoming values: meet of incoming,
                // and incoming values admit the result.
                let incoming: Vec<Value> =
                    self.func.dfg.phi_edges(phi).map(|(_, val)| val).collect();
                let mut meet = TypeTree::new();
                for val in &incoming {
                    meet.and_in(self.tree(*val))?;
                }
                self.update(res, &meet.purge_anything())?;
                let res_tree = self.tree(res).purge_anything();
                for val in incoming {
                    if val != mir::consts::GRAVESTONE {
                        self.update(val, &res_tree)?;
                    }
                }
            }
            InstructionData::Ret { args } => {
                let args: Vec<Value> =
                    args.as_slice(&self.func.dfg.insts.pools.value_lists).to_vec();
                self.ret.resize(args.len().max(self.ret.len()), TypeTree::new());
                if let Some(first) = args.first() {
                    let demanded = self.info.ret.clone();
                    self.update(*first, &demanded)?;
                }
                for (i, val) in args.iter().enumerate() {
                    let tree = self.tree(*val).clone();
                    self.ret[i].or_in(&tree)?;
                }
            }
            InstructionData::Call { func_ref, args } => {
                let args: Vec<Value> =
                    args.as_slice(&self.func.dfg.insts.pools.value_lists).to_vec();
                let name = self.func.dfg.signatures[func_ref].name.clone();
                self.visit_call(inst, &name, &args)?;
            }
        }
        Ok(())
    }

    /// `iadd`/`isub` and the weak integer opcodes: `ptr ± int = ptr`,
    /// `ptr - ptr = int`, and an integer result forces integer operands.
    fn int_pointer_merger(
        &mut self,
        res: Value,
        lhs: Value,
        rhs: Value,
        is_sub: bool,
    ) -> Result<(), TypeError> {
        use ConcreteType::*;
        let lt = self.tree(lhs).data0();
        let rt = self.tree(rhs).data0();
        let res_t = self.tree(res).data0();

        if is_sub && lt == Pointer && rt == Pointer {
            return self.update_scalar(res, Integer);
        }
        match (lt, rt) {
            (Pointer, _) => {
                self.update_scalar(res, Pointer)?;
                self.update_scalar(rhs, Integer)?;
            }
            (_, Pointer) => {
                self.update_scalar(res, Pointer)?;
                self.update_scalar(lhs, Integer)?;
            }
            (Integer, Integer) => self.update_scalar(res, Integer)?,
            _ => (),
        }
        if res_t == Integer {
            // Only an all-integer computation produces an integer.
            self.update_scalar(lhs, Integer)?;
            self.update_scalar(rhs, Integer)?;
        }
        if res_t == Pointer && lt == Integer {
            self.update_scalar(rhs, Pointer)?;
        }
        if res_t == Pointer && rt == Integer {
            self.update_scalar(lhs, Pointer)?;
        }
        Ok(())
    }

    /// Address-of-subobject: for every statically known byte offset, shift
    /// the base's pointee tree into the result and the result's back into
    /// the base. Unknown offsets only transport the uniform entries.
    fn visit_padd(&mut self, res: Value, ptr: Value, off: Value) -> Result<(), TypeError> {
        use ConcreteType::*;
        self.update_scalar(ptr, Pointer)?;
        self.update_scalar(off, Integer)?;
        self.update_scalar(res, Pointer)?;

        let mut known = KnownValues::new(self.func, self.info);
        match known.get(off) {
            Some(offsets) => {
                for c in offsets {
                    let fwd = self.tree(ptr).shift_indices(c, -1, 0);
                    self.update(res, &fwd)?;
                    let back = self.tree(res).shift_indices(0, -1, c);
                    self.update(ptr, &back)?;
                }
            }
            None => {
                let fwd = self.tree(ptr).keep_minus_one();
                self.update(res, &fwd)?;
                let back = self.tree(res).keep_minus_one();
                self.update(ptr, &back)?;
            }
        }
        Ok(())
    }

    fn visit_call(&mut self, inst: Inst, name: &str, args: &[Value]) -> Result<(), TypeError> {
        use ConcreteType::*;
        let results: Vec<Value> = self.func.dfg.inst_results(inst).to_vec();

        match name {
            "malloc" => {
                self.update_scalar(args[0], Integer)?;
                self.update_scalar(results[0], Pointer)?;
            }
            "free" => self.update_scalar(args[0], Pointer)?,
            "realloc" => {
                self.update_scalar(args[0], Pointer)?;
                self.update_scalar(args[1], Integer)?;
                self.update_scalar(results[0], Pointer)?;
                // The surviving bytes keep their classification.
                let fwd = self.tree(args[0]).keep_minus_one();
                self.update(results[0], &fwd)?;
            }
            _ if crate::math_signature(name).is_some() => {
                self.visit_math_call(name, args, &results)?;
            }
            // Pure sinks: observe their operands without classifying them.
            "printf" | "puts" | "fprintf" | "__assert_fail" => (),
            _ if name.starts_with("__cxa_guard_") => (),
            _ => {
                let Some(callee) = self.registry.get(name) else { return Ok(()) };
                let mut known = KnownValues::new(self.func, self.info);
                let info = FnTypeInfo {
                    args: args.iter().map(|arg| self.tree(*arg).clone()).collect(),
                    known_values: args.iter().map(|arg| known.get(*arg)).collect(),
                    ret: results.first().map(|res| self.tree(*res).clone()).unwrap_or_default(),
                };
                let callee_res = self.interprocedural.analyze(self.registry, callee, info)?;
                for (i, arg) in args.iter().enumerate() {
                    self.update(*arg, &callee_res.param_tree(i.into()).purge_anything())?;
                }
                for (i, res) in results.iter().enumerate() {
                    if let Some(ret) = callee_res.return_trees().get(i) {
                        self.update(*res, &ret.purge_anything())?;
                    }
                }
            }
        }
        Ok(())
    }

    fn visit_math_call(
        &mut self,
        name: &str,
        args: &[Value],
        results: &[Value],
    ) -> Result<(), TypeError> {
        use crate::MathSig::*;
        use ConcreteType::*;
        match crate::math_signature(name).unwrap() {
            F => {
                self.update_scalar(args[0], ConcreteType::DOUBLE)?;
                self.update_scalar(results[0], ConcreteType::DOUBLE)?;
            }
            FF => {
                self.update_scalar(args[0], ConcreteType::DOUBLE)?;
                self.update_scalar(args[1], ConcreteType::DOUBLE)?;
                self.update_scalar(results[0], ConcreteType::DOUBLE)?;
            }
            FFF => {
                for arg in &args[..3] {
                    self.update_scalar(*arg, ConcreteType::DOUBLE)?;
                }
                self.update_scalar(results[0], ConcreteType::DOUBLE)?;
            }
            FI => {
                self.update_scalar(args[0], ConcreteType::DOUBLE)?;
                self.update_scalar(args[1], Integer)?;
                self.update_scalar(results[0], ConcreteType::DOUBLE)?;
            }
            IofF => {
                self.update_scalar(args[0], ConcreteType::DOUBLE)?;
                self.update_scalar(results[0], Integer)?;
            }
            FPtrI => {
                self.update_scalar(args[0], ConcreteType::DOUBLE)?;
                self.update(args[1], &TypeTree::pointer_to(Integer))?;
                self.update_scalar(results[0], ConcreteType::DOUBLE)?;
            }
            FPtrF => {
                self.update_scalar(args[0], ConcreteType::DOUBLE)?;
                self.update(args[1], &TypeTree::pointer_to(ConcreteType::DOUBLE))?;
                self.update_scalar(results[0], ConcreteType::DOUBLE)?;
            }
            FFPtrI => {
                self.update_scalar(args[0], ConcreteType::DOUBLE)?;
                self.update_scalar(args[1], ConcreteType::DOUBLE)?;
                self.update(args[2], &TypeTree::pointer_to(Integer))?;
                self.update_scalar(results[0], ConcreteType::DOUBLE)?;
            }
        }
        Ok(())
    }

    /// After a fixpoint, classify values no rule could reach from how their
    /// bit patterns are (not) observed: a value whose every transitive use
    /// treats it as an integer is an integer, and a value nothing observes
    /// is compatible with anything. Returns whether progress was made.
    fn unused_value_closure(&mut self) -> Result<bool, TypeError> {
        let mut changed = false;
        for val in self.func.dfg.values().collect::<Vec<_>>() {
            if self.types[val].data0().is_known() {
                continue;
            }
            if matches!(self.func.dfg.value_def(val), ValueDef::Invalid) {
                continue;
            }
            match self.observation(val) {
                Observation::Nothing => {
                    changed |=
                        self.types[val].or_in(&TypeTree::scalar(ConcreteType::Anything))?;
                }
                Observation::IntegerOnly => {
                    let grew = self.types[val].or_in(&TypeTree::scalar(ConcreteType::Integer))?;
                    if grew {
                        let users: Vec<Inst> = self
                            .func
                            .dfg
                            .uses(val)
                            .map(|use_| self.func.dfg.use_to_operand(use_).0)
                            .collect();
                        for user in users {
                            self.workqueue.insert(user);
                        }
                    }
                    changed |= grew;
                }
                Observation::Opaque => (),
            }
        }
        Ok(changed)
    }

    fn observation(&self, val: Value) -> Observation {
        let mut visited = Vec::new();
        let mut stack = vec![val];
        let mut any_use = false;

        while let Some(val) = stack.pop() {
            for use_ in self.func.dfg.uses(val) {
                let (inst, idx) = self.func.dfg.use_to_operand(use_);
                if visited.contains(&inst) {
                    continue;
                }
                visited.push(inst);

                let opcode = self.func.dfg.insts[inst].opcode();
                match opcode {
                    // Integer observers.
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
                    | Opcode::Ilt
                    | Opcode::Igt
                    | Opcode::Ile
                    | Opcode::Ige
                    | Opcode::Ieq
                    | Opcode::Ine
                    | Opcode::Beq
                    | Opcode::Bne
                    | Opcode::Bnot
                    | Opcode::IFcast
                    | Opcode::BIcast
                    | Opcode::IBcast
                    | Opcode::BFcast
                    | Opcode::Br => any_use = true,
                    // Pass-through: the bits flow on unobserved.
                    Opcode::OptBarrier | Opcode::Phi => {
                        stack.extend(self.func.dfg.inst_results(inst).iter().copied());
                    }
                    Opcode::Select if idx != 0 => {
                        stack.extend(self.func.dfg.inst_results(inst).iter().copied());
                    }
                    Opcode::Select => any_use = true,
                    _ => return Observation::Opaque,
                }
            }
        }

        if any_use {
            Observation::IntegerOnly
        } else {
            Observation::Nothing
        }
    }
}

enum Observation {
    /// No transitive use observes the bit pattern.
    Nothing,
    /// Every transitive use observes the bit pattern as an integer.
    IntegerOnly,
    /// At least one use escapes the integer closure.
    Opaque,
}

/// Initial classification: parameters from the signature, constants by the
/// constant rules.
fn seed(func: &Function, info: &FnTypeInfo) -> TiVec<Value, TypeTree> {
    func.dfg
        .values()
        .map(|val| match func.dfg.value_def(val) {
            ValueDef::Param(param) => info.arg_tree(param),
            ValueDef::Const(c) => constant_type(c),
            ValueDef::Result(..) | ValueDef::Invalid => TypeTree::new(),
        })
        .collect()
}

/// The constant classification rules.
///
/// Zero bit patterns are compatible with anything; small positive integers
/// are integers. Booleans are the narrowest type of this IR and their zero
/// is a sentinel, not a null, so `false` still classifies as an integer.
pub(crate) fn constant_type(c: Const) -> TypeTree {
    match c {
        Const::Float(val) => {
            if val.is_zero() {
                TypeTree::scalar(ConcreteType::Anything)
            } else {
                TypeTree::scalar(ConcreteType::DOUBLE)
            }
        }
        Const::Int(val) => {
            if (1..=4096).contains(&val) {
                TypeTree::scalar(ConcreteType::Integer)
            } else {
                TypeTree::scalar(ConcreteType::Anything)
            }
        }
        Const::Bool(_) => TypeTree::scalar(ConcreteType::Integer),
    }
}
