//! Reference interpreter for the MIR.
//!
//! Executes a `Function` over an explicit slot memory so that tests can
//! observe actual numbers instead of IR snapshots. Not a performance
//! vehicle; every value is boxed into a [`Data`] bit pattern and memory is a
//! vector of slots.

use ahash::AHashMap;
use mir::{Block, Function, Inst, Opcode, Value, ValueDef};
use typed_index_collections::TiVec;

pub use crate::data::Data;

mod data;

#[cfg(test)]
mod tests;

/// Byte size of one memory slot; every IR value is this wide.
pub const SLOT_BYTES: u32 = 8;

/// Interpreter memory: a flat array of 8-byte slots addressed in bytes.
/// Address 0 is reserved as the null address. `alloca` and `malloc` both
/// bump-allocate; `free` only validates and forgets the allocation header.
#[derive(Default)]
pub struct Memory {
    slots: Vec<Data>,
    /// Allocation sizes in bytes, keyed by base address.
    allocs: AHashMap<u32, u32>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory { slots: vec![Data::UNDEF], allocs: AHashMap::new() }
    }

    /// Allocate `bytes` zero-initialized bytes, rounded up to whole slots.
    pub fn alloc(&mut self, bytes: u32) -> u32 {
        let addr = self.slots.len() as u32 * SLOT_BYTES;
        let slots = (bytes + SLOT_BYTES - 1) / SLOT_BYTES;
        self.slots.extend(std::iter::repeat(Data::UNDEF).take(slots.max(1) as usize));
        self.allocs.insert(addr, bytes);
        addr
    }

    pub fn free(&mut self, addr: u32) {
        assert!(self.allocs.remove(&addr).is_some(), "free of unallocated address {addr:#x}");
    }

    pub fn realloc(&mut self, addr: u32, bytes: u32) -> u32 {
        let old_bytes = self.allocs[&addr];
        let new = self.alloc(bytes);
        for off in (0..old_bytes.min(bytes)).step_by(SLOT_BYTES as usize) {
            let val = self.read(addr + off);
            self.write(new + off, val);
        }
        self.free(addr);
        new
    }

    pub fn read(&self, addr: u32) -> Data {
        assert_eq!(addr % SLOT_BYTES, 0, "misaligned read at {addr:#x}");
        assert_ne!(addr, 0, "read through null address");
        self.slots[(addr / SLOT_BYTES) as usize]
    }

    pub fn write(&mut self, addr: u32, val: Data) {
        assert_eq!(addr % SLOT_BYTES, 0, "misaligned write at {addr:#x}");
        assert_ne!(addr, 0, "write through null address");
        self.slots[(addr / SLOT_BYTES) as usize] = val;
    }
}

/// Callee bodies, looked up by signature name.
pub type Registry = mir::FunctionRegistry;

pub struct Interpreter<'a> {
    registry: &'a Registry,
    pub mem: Memory,
}

struct Frame<'a> {
    func: &'a Function,
    vals: TiVec<Value, Data>,
    prev_bb: Block,
    next_inst: Option<Inst>,
}

impl<'a> Interpreter<'a> {
    pub fn new(registry: &'a Registry) -> Interpreter<'a> {
        Interpreter { registry, mem: Memory::new() }
    }

    /// Run `func` on `args` until its `ret`; returns the returned values.
    pub fn run(&mut self, func: &Function, args: &[Data]) -> Vec<Data> {
        let vals: TiVec<Value, Data> = func
            .dfg
            .values()
            .map(|val| match func.dfg.value_def(val) {
                ValueDef::Result(_, _) | ValueDef::Invalid => Data::UNDEF,
                ValueDef::Param(param) => args[usize::from(param)],
                ValueDef::Const(val) => val.into(),
            })
            .collect();

        let entry =
            func.layout.entry_block().expect("function without entry block cannot be interpreted");

        let mut frame =
            Frame { func, vals, prev_bb: entry, next_inst: func.layout.first_inst(entry) };

        loop {
            let inst = frame.next_inst.expect("fell off the end of a block");
            if let Some(rets) = self.eval(&mut frame, inst) {
                return rets;
            }
        }
    }

    /// Evaluate one instruction; `Some` carries the function's return
    /// values.
    fn eval(&mut self, frame: &mut Frame<'_>, inst: Inst) -> Option<Vec<Data>> {
        let func = frame.func;
        let inst_data = &func.dfg.insts[inst];
        let (opcode, args) = match *inst_data {
            mir::InstructionData::Unary { opcode, ref arg } => (opcode, std::slice::from_ref(arg)),
            mir::InstructionData::Binary { opcode, ref args } => (opcode, args.as_slice()),
            mir::InstructionData::Ternary { opcode, ref args } => (opcode, args.as_slice()),
            mir::InstructionData::Branch { cond, then_dst, else_dst } => {
                let dst = if frame.vals[cond].bool() { then_dst } else { else_dst };
                jmp(frame, inst, dst);
                return None;
            }
            mir::InstructionData::Jump { destination } => {
                jmp(frame, inst, destination);
                return None;
            }
            mir::InstructionData::PhiNode(ref phi) => {
                let val = func
                    .dfg
                    .phi_edge_val(phi, frame.prev_bb)
                    .expect("phi has no edge for the executed predecessor");
                let res = func.dfg.first_result(inst);
                frame.vals[res] = frame.vals[val];
                frame.next_inst = func.layout.next_inst(inst);
                return None;
            }
            mir::InstructionData::Call { func_ref, args } => {
                let sig = &func.dfg.signatures[func_ref];
                let args: Vec<Data> = args
                    .as_slice(&func.dfg.insts.pools.value_lists)
                    .iter()
                    .map(|arg| frame.vals[*arg])
                    .collect();
                let rets = self.call(&sig.name, &args);
                assert_eq!(rets.len(), sig.returns as usize, "%{} returned wrong arity", sig.name);
                for (res, ret) in func.dfg.inst_results(inst).iter().zip(rets) {
                    frame.vals[*res] = ret;
                }
                frame.next_inst = func.layout.next_inst(inst);
                return None;
            }
            mir::InstructionData::Ret { args } => {
                return Some(
                    args.as_slice(&func.dfg.insts.pools.value_lists)
                        .iter()
                        .map(|arg| frame.vals[*arg])
                        .collect(),
                );
            }
            mir::InstructionData::Unreachable => unreachable!("executed an unreachable terminator"),
        };

        // advance first so memory opcodes can early return
        frame.next_inst = func.layout.next_inst(inst);

        let arg = |i: usize| frame.vals[args[i]];

        let val: Data = match opcode {
            Opcode::Fneg => (-arg(0).f64()).into(),
            Opcode::Fadd => (arg(0).f64() + arg(1).f64()).into(),
            Opcode::Fsub => (arg(0).f64() - arg(1).f64()).into(),
            Opcode::Fmul => (arg(0).f64() * arg(1).f64()).into(),
            Opcode::Fdiv => (arg(0).f64() / arg(1).f64()).into(),
            Opcode::Frem => (arg(0).f64() % arg(1).f64()).into(),
            Opcode::Sqrt => arg(0).f64().sqrt().into(),
            Opcode::Exp => arg(0).f64().exp().into(),
            Opcode::Ln => arg(0).f64().ln().into(),
            Opcode::Log => arg(0).f64().log10().into(),
            Opcode::Sin => arg(0).f64().sin().into(),
            Opcode::Cos => arg(0).f64().cos().into(),
            Opcode::Tan => arg(0).f64().tan().into(),
            Opcode::Asin => arg(0).f64().asin().into(),
            Opcode::Acos => arg(0).f64().acos().into(),
            Opcode::Atan => arg(0).f64().atan().into(),
            Opcode::Sinh => arg(0).f64().sinh().into(),
            Opcode::Cosh => arg(0).f64().cosh().into(),
            Opcode::Tanh => arg(0).f64().tanh().into(),
            Opcode::Fabs => arg(0).f64().abs().into(),
            Opcode::Floor => arg(0).f64().floor().into(),
            Opcode::Ceil => arg(0).f64().ceil().into(),
            Opcode::Pow => arg(0).f64().powf(arg(1).f64()).into(),
            Opcode::Hypot => arg(0).f64().hypot(arg(1).f64()).into(),
            Opcode::Atan2 => arg(0).f64().atan2(arg(1).f64()).into(),
            Opcode::Fmin => arg(0).f64().min(arg(1).f64()).into(),
            Opcode::Fmax => arg(0).f64().max(arg(1).f64()).into(),
            Opcode::Ineg => (-arg(0).i32()).into(),
            Opcode::Inot => (!arg(0).i32()).into(),
            Opcode::Iadd => (arg(0).i32().wrapping_add(arg(1).i32())).into(),
            Opcode::Isub => (arg(0).i32().wrapping_sub(arg(1).i32())).into(),
            Opcode::Imul => (arg(0).i32().wrapping_mul(arg(1).i32())).into(),
            Opcode::Idiv => (arg(0).i32() / arg(1).i32()).into(),
            Opcode::Irem => (arg(0).i32() % arg(1).i32()).into(),
            Opcode::Ishl => (arg(0).i32() << arg(1).i32()).into(),
            Opcode::Ishr => (arg(0).i32() >> arg(1).i32()).into(),
            Opcode::Iand => (arg(0).i32() & arg(1).i32()).into(),
            Opcode::Ior => (arg(0).i32() | arg(1).i32()).into(),
            Opcode::Ixor => (arg(0).i32() ^ arg(1).i32()).into(),
            Opcode::Bnot => (!arg(0).bool()).into(),
            Opcode::Ilt => (arg(0).i32() < arg(1).i32()).into(),
            Opcode::Igt => (arg(0).i32() > arg(1).i32()).into(),
            Opcode::Ile => (arg(0).i32() <= arg(1).i32()).into(),
            Opcode::Ige => (arg(0).i32() >= arg(1).i32()).into(),
            Opcode::Ieq => (arg(0).i32() == arg(1).i32()).into(),
            Opcode::Ine => (arg(0).i32() != arg(1).i32()).into(),
            Opcode::Flt => (arg(0).f64() < arg(1).f64()).into(),
            Opcode::Fgt => (arg(0).f64() > arg(1).f64()).into(),
            Opcode::Fle => (arg(0).f64() <= arg(1).f64()).into(),
            Opcode::Fge => (arg(0).f64() >= arg(1).f64()).into(),
            Opcode::Feq => (arg(0).f64() == arg(1).f64()).into(),
            Opcode::Fne => (arg(0).f64() != arg(1).f64()).into(),
            Opcode::Beq => (arg(0).bool() == arg(1).bool()).into(),
            Opcode::Bne => (arg(0).bool() != arg(1).bool()).into(),
            Opcode::IFcast => (arg(0).i32() as f64).into(),
            Opcode::FIcast => (arg(0).f64() as i32).into(),
            Opcode::BIcast => (arg(0).bool() as i32).into(),
            Opcode::IBcast => (arg(0).i32() != 0).into(),
            Opcode::BFcast => (arg(0).bool() as i32 as f64).into(),
            Opcode::FBcast => (arg(0).f64() != 0.0).into(),
            Opcode::Select => {
                if arg(0).bool() {
                    arg(1)
                } else {
                    arg(2)
                }
            }
            Opcode::OptBarrier => arg(0),
            Opcode::Alloca => self.mem.alloc(arg(0).i32() as u32).into(),
            Opcode::Load => self.mem.read(arg(0).ptr()),
            Opcode::Padd => (arg(0).ptr().wrapping_add(arg(1).i32() as u32)).into(),
            Opcode::Store => {
                self.mem.write(arg(1).ptr(), arg(0));
                return None;
            }
            Opcode::Memcpy => {
                let (dst, src, len) = (arg(0).ptr(), arg(1).ptr(), arg(2).i32() as u32);
                for off in (0..len).step_by(SLOT_BYTES as usize) {
                    let val = self.mem.read(src + off);
                    self.mem.write(dst + off, val);
                }
                return None;
            }
            Opcode::Memset => {
                let (dst, byte, len) = (arg(0).ptr(), arg(1).i32(), arg(2).i32() as u32);
                assert_eq!(byte, 0, "only zero memset is supported");
                for off in (0..len).step_by(SLOT_BYTES as usize) {
                    self.mem.write(dst + off, Data::UNDEF);
                }
                return None;
            }
            Opcode::Jmp
            | Opcode::Br
            | Opcode::Phi
            | Opcode::Call
            | Opcode::Ret
            | Opcode::Unreachable => unreachable!(),
        };
        let res = func.dfg.first_result(inst);
        frame.vals[res] = val;
        None
    }

    /// Dispatch a call: allocator symbols are built in, everything else is
    /// looked up in the registry.
    fn call(&mut self, name: &str, args: &[Data]) -> Vec<Data> {
        match name {
            "malloc" => vec![self.mem.alloc(args[0].i32() as u32).into()],
            "free" => {
                self.mem.free(args[0].ptr());
                vec![]
            }
            "realloc" => {
                vec![self.mem.realloc(args[0].ptr(), args[1].i32() as u32).into()]
            }
            _ => {
                let func = self
                    .registry
                    .get(name)
                    .unwrap_or_else(|| panic!("call to unknown function %{}", name));
                self.run(func, args)
            }
        }
    }
}

fn jmp(frame: &mut Frame<'_>, src: Inst, dst: Block) {
    frame.prev_bb = frame.func.layout.inst_block(src).unwrap();
    frame.next_inst = frame.func.layout.first_inst(dst);
}
