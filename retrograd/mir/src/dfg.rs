use std::fmt;

use typed_index_collections::TiVec;

use crate::dfg::values::ValueDataType;
use crate::entities::{Inst, Param, Use, Value};
use crate::write::write_operands;
use crate::{FuncRef, FunctionSignature, Ieee64, InstructionData};

pub use crate::dfg::uses::{InstUseIter, UseCursor, UseIter};
pub use crate::dfg::values::{consts, Const, DfgValues, ValueDef};

#[cfg(test)]
mod tests;

mod insts;
mod phis;
mod uses;
mod values;

pub use crate::dfg::insts::DfgInstructions;

/// A data flow graph defines all instructions and their operand/result
/// values, the uses linking them, and the external signatures callable from
/// this function.
///
/// The layout of blocks in the function and of instructions in each block is
/// recorded by the `Layout` data structure which forms the other half of the
/// function representation.
#[derive(Clone)]
pub struct DataFlowGraph {
    pub insts: DfgInstructions,
    pub values: DfgValues,

    /// Function signature table, referenced by external function references.
    pub signatures: TiVec<FuncRef, FunctionSignature>,
}

impl Default for DataFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFlowGraph {
    /// Create a new empty `DataFlowGraph`.
    pub fn new() -> Self {
        Self {
            signatures: TiVec::new(),
            insts: DfgInstructions::new(),
            values: DfgValues::new(),
        }
    }

    /// Clear everything.
    pub fn clear(&mut self) {
        self.signatures.clear();
        self.values.clear();
        self.insts.clear();
    }
}

/// Routines that interact with instructions.
impl DataFlowGraph {
    /// Get the total number of instructions created in this function, whether
    /// they are currently inserted in the layout or not.
    pub fn num_insts(&self) -> usize {
        self.insts.num()
    }

    /// Returns `true` if the given instruction reference is valid.
    pub fn inst_is_valid(&self, inst: Inst) -> bool {
        self.insts.is_valid(inst)
    }

    /// Returns an object that displays `inst`.
    pub fn display_inst(&self, inst: Inst) -> DisplayInst {
        DisplayInst(self, inst)
    }

    /// Detach all uses of the instruction's operands.
    pub fn zap_inst(&mut self, inst: Inst) {
        self.insts.zap(inst, &mut self.values)
    }

    pub fn call_signature(&self, inst: Inst) -> Option<&FunctionSignature> {
        self.func_ref(inst).map(|func_ref| &self.signatures[func_ref])
    }

    pub fn as_branch(&self, inst: Inst) -> Option<(Value, crate::Block, crate::Block)> {
        if let InstructionData::Branch { cond, then_dst, else_dst } = self.insts[inst] {
            Some((cond, then_dst, else_dst))
        } else {
            None
        }
    }

    pub fn func_ref(&self, inst: Inst) -> Option<FuncRef> {
        if let InstructionData::Call { func_ref, .. } = self.insts[inst] {
            Some(func_ref)
        } else {
            None
        }
    }
}

/// Routines that interact with values.
impl DataFlowGraph {
    /// Allocate a function parameter value.
    pub fn make_param(&mut self, param: Param) -> Value {
        self.values.make_param(param)
    }

    /// Get the total number of values.
    pub fn num_values(&self) -> usize {
        self.values.num()
    }

    /// Get an iterator over all values.
    pub fn values(&self) -> impl Iterator<Item = Value> + ExactSizeIterator {
        self.values.iter()
    }

    /// Check if a value reference is valid.
    pub fn is_value_valid(&self, v: Value) -> bool {
        self.values.is_valid(v)
    }

    /// Get the definition of a value.
    ///
    /// This is either the instruction that defined it, the parameter it
    /// refers to, or the constant it was interned from.
    #[inline]
    pub fn value_def(&self, v: Value) -> ValueDef {
        self.values.def(v)
    }

    /// Determine if `v` is an attached instruction result.
    pub fn value_attached(&self, v: Value) -> bool {
        match self.values.defs[v].ty {
            ValueDataType::Inst { inst, num, .. } => {
                Some(&v) == self.insts.results(inst).get(num as usize)
            }
            _ => false,
        }
    }

    /// A value with no remaining uses.
    pub fn value_dead(&self, val: Value) -> bool {
        self.values.is_dead(val)
    }

    pub fn iconst(&mut self, val: i32) -> Value {
        self.values.iconst(val)
    }

    pub fn f64const(&mut self, val: f64) -> Value {
        self.values.fconst(val.into())
    }

    pub fn fconst(&mut self, val: Ieee64) -> Value {
        self.values.fconst(val)
    }

    pub fn bconst(&mut self, val: bool) -> Value {
        if val {
            consts::TRUE
        } else {
            consts::FALSE
        }
    }

    pub fn make_invalid_value(&mut self) -> Value {
        self.values.make(ValueDataType::Invalid)
    }
}

/// Routines that interact with uses.
impl DataFlowGraph {
    pub fn make_use(&mut self, val: Value, parent: Inst, parent_idx: u16) -> Use {
        self.values.make_use(val, parent, parent_idx)
    }

    pub fn detach_use(&mut self, use_: Use) {
        self.values.detach_use(use_, &self.insts)
    }

    pub fn detach_operand(&mut self, inst: Inst, pos: u16) {
        let use_ = self.operands(inst)[pos as usize];
        self.values.detach_use(use_, &self.insts)
    }

    pub fn attach_use(&mut self, use_: Use, val: Value) {
        self.values.attach_use(use_, val);
    }

    pub fn is_use_detached(&self, use_: Use) -> bool {
        self.values.is_use_detached(use_)
    }

    pub fn uses(&self, value: Value) -> UseIter<'_> {
        self.values.uses(value)
    }

    pub fn use_to_value(&self, use_: Use) -> Value {
        self.values.use_to_value(use_, &self.insts)
    }

    pub fn use_to_operand(&self, use_: Use) -> (Inst, u16) {
        self.values.use_to_operand(use_)
    }
}

impl DataFlowGraph {
    /// Returns whether an instruction is safe to remove (none of its results
    /// are used anywhere).
    pub fn instr_safe_to_remove(&self, inst: Inst) -> bool {
        self.insts.safe_to_remove(inst, &self.values)
    }

    /// Returns whether an instruction is dead: unused and free of side
    /// effects.
    pub fn inst_dead(&self, inst: Inst, keep_branches: bool) -> bool {
        self.insts.safe_to_remove(inst, &self.values) && !self.has_sideeffects(inst, keep_branches)
    }

    pub fn has_sideeffects(&self, inst: Inst, keep_branches: bool) -> bool {
        match self.insts[inst] {
            InstructionData::Branch { .. }
            | InstructionData::Jump { .. }
            | InstructionData::Ret { .. }
            | InstructionData::Unreachable => keep_branches,
            InstructionData::Call { func_ref, .. } => self.signatures[func_ref].has_sideeffects,
            ref data => matches!(
                data.opcode(),
                crate::Opcode::Store | crate::Opcode::Memcpy | crate::Opcode::Memset
            ),
        }
    }

    /// Get all value arguments on `inst` as a slice.
    pub fn instr_args(&self, inst: Inst) -> &[Value] {
        self.insts.args(inst)
    }

    /// Get all value arguments on `inst` as a mutable slice.
    pub fn instr_args_mut(&mut self, inst: Inst) -> &mut [Value] {
        self.insts.args_mut(inst)
    }

    /// Get the first result of an instruction.
    ///
    /// This function panics if the instruction doesn't have any result.
    pub fn first_result(&self, inst: Inst) -> Value {
        self.insts.first_result(inst)
    }

    /// Test if `inst` has any result values currently.
    pub fn has_results(&self, inst: Inst) -> bool {
        self.insts.has_results(inst)
    }

    /// Return all the results of an instruction.
    pub fn inst_results(&self, inst: Inst) -> &[Value] {
        self.insts.results(inst)
    }

    /// Return all the operand slots of an instruction.
    pub fn operands(&self, inst: Inst) -> &[Use] {
        self.insts.operands(inst)
    }
}

/// Object that can display an instruction.
pub struct DisplayInst<'a>(&'a DataFlowGraph, Inst);

impl<'a> fmt::Display for DisplayInst<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dfg = self.0;
        let inst = self.1;

        if let Some((first, rest)) = dfg.inst_results(inst).split_first() {
            write!(f, "{}", first)?;
            for v in rest {
                write!(f, ", {}", v)?;
            }
            write!(f, " = ")?;
        }

        write!(f, "{}", dfg.insts[inst].opcode())?;
        write_operands(f, dfg, inst)
    }
}
