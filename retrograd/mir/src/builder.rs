//! Instruction builders.
//!
//! `InsertBuilder` creates instructions, allocates their result values, and
//! inserts them at a `FuncCursor` position in one call.

use crate::cursor::FuncCursor;
use crate::instructions::PhiNode;
use crate::{Block, FuncRef, Inst, InstructionData, Opcode, Value, ValueList};

#[cfg(test)]
mod tests;

pub struct InsertBuilder<'a, 'f> {
    cursor: &'a mut FuncCursor<'f>,
}

impl<'a, 'f> InsertBuilder<'a, 'f> {
    pub fn new(cursor: &'a mut FuncCursor<'f>) -> Self {
        Self { cursor }
    }

    /// Create `data`, allocate its results and insert it at the cursor.
    pub fn build(self, data: InstructionData) -> Inst {
        let Self { cursor } = self;
        let inst = cursor.func.dfg.make_inst(data);
        cursor.func.dfg.make_inst_results(inst);
        cursor.insert_inst(inst);
        inst
    }

    fn build_result(self, data: InstructionData) -> Value {
        let Self { cursor } = self;
        let inst = cursor.func.dfg.make_inst(data);
        cursor.func.dfg.make_inst_results(inst);
        cursor.insert_inst(inst);
        cursor.func.dfg.first_result(inst)
    }

    pub fn unary(self, opcode: Opcode, arg: Value) -> Value {
        self.build_result(InstructionData::Unary { opcode, arg })
    }

    pub fn binary(self, opcode: Opcode, lhs: Value, rhs: Value) -> Value {
        self.build_result(InstructionData::Binary { opcode, args: [lhs, rhs] })
    }

    pub fn fneg(self, arg: Value) -> Value {
        self.unary(Opcode::Fneg, arg)
    }

    pub fn fadd(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fadd, lhs, rhs)
    }

    pub fn fsub(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fsub, lhs, rhs)
    }

    pub fn fmul(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fmul, lhs, rhs)
    }

    pub fn fdiv(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fdiv, lhs, rhs)
    }

    pub fn iadd(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Iadd, lhs, rhs)
    }

    pub fn isub(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Isub, lhs, rhs)
    }

    pub fn imul(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Imul, lhs, rhs)
    }

    pub fn ilt(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Ilt, lhs, rhs)
    }

    pub fn ieq(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Ieq, lhs, rhs)
    }

    pub fn ine(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Ine, lhs, rhs)
    }

    pub fn flt(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Flt, lhs, rhs)
    }

    pub fn fle(self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fle, lhs, rhs)
    }

    pub fn padd(self, ptr: Value, offset: Value) -> Value {
        self.binary(Opcode::Padd, ptr, offset)
    }

    pub fn alloca(self, size: Value) -> Value {
        self.unary(Opcode::Alloca, size)
    }

    pub fn load(self, ptr: Value) -> Value {
        self.unary(Opcode::Load, ptr)
    }

    pub fn optbarrier(self, arg: Value) -> Value {
        self.unary(Opcode::OptBarrier, arg)
    }

    /// `store` has no results.
    pub fn store(self, val: Value, ptr: Value) -> Inst {
        self.build(InstructionData::Binary { opcode: Opcode::Store, args: [val, ptr] })
    }

    pub fn select(self, cond: Value, then_val: Value, else_val: Value) -> Value {
        self.build_result(InstructionData::Ternary {
            opcode: Opcode::Select,
            args: [cond, then_val, else_val],
        })
    }

    pub fn memcpy(self, dst: Value, src: Value, len: Value) -> Inst {
        self.build(InstructionData::Ternary { opcode: Opcode::Memcpy, args: [dst, src, len] })
    }

    pub fn memset(self, dst: Value, byte: Value, len: Value) -> Inst {
        self.build(InstructionData::Ternary { opcode: Opcode::Memset, args: [dst, byte, len] })
    }

    pub fn jmp(self, destination: Block) -> Inst {
        self.build(InstructionData::Jump { destination })
    }

    pub fn br(self, cond: Value, then_dst: Block, else_dst: Block) -> Inst {
        self.build(InstructionData::Branch { cond, then_dst, else_dst })
    }

    pub fn call(self, func_ref: FuncRef, args: &[Value]) -> Inst {
        let mut list = ValueList::new();
        list.extend(args.iter().copied(), &mut self.cursor.func.dfg.insts.pools.value_lists);
        self.build(InstructionData::Call { func_ref, args: list })
    }

    pub fn ret(self, vals: &[Value]) -> Inst {
        let mut list = ValueList::new();
        list.extend(vals.iter().copied(), &mut self.cursor.func.dfg.insts.pools.value_lists);
        self.build(InstructionData::Ret { args: list })
    }

    pub fn unreachable(self) -> Inst {
        self.build(InstructionData::Unreachable)
    }

    pub fn phi(self, edges: &[(Block, Value)]) -> Value {
        let mut args = ValueList::new();
        let mut blocks = crate::instructions::BlockList::new();
        {
            let pools = &mut self.cursor.func.dfg.insts.pools;
            for (block, val) in edges {
                args.push(*val, &mut pools.value_lists);
                blocks.push(*block, &mut pools.block_lists);
            }
        }
        self.build_result(PhiNode { args, blocks }.into())
    }
}
