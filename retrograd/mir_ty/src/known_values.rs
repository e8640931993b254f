//! Known-integral-value propagation.
//!
//! Walks the use-def graph and accumulates the possible small-integer
//! values of each value, bounded at [`VALUE_LIMIT`] candidates. Address
//! transfer functions consult this to turn symbolic offsets into concrete
//! byte shifts, and the loop canonicalizer uses it for trip counts.

use ahash::AHashMap;
use mir::{Function, InstructionData, Opcode, Value, ValueDef};

use crate::FnTypeInfo;

pub(crate) const VALUE_LIMIT: usize = 100;

pub(crate) struct KnownValues<'a> {
    func: &'a Function,
    info: &'a FnTypeInfo,
    /// `None` entries mean "unbounded"; absent entries mean "not computed".
    cache: AHashMap<Value, Option<Vec<i64>>>,
    visiting: Vec<Value>,
}

impl<'a> KnownValues<'a> {
    pub(crate) fn new(func: &'a Function, info: &'a FnTypeInfo) -> KnownValues<'a> {
        KnownValues { func, info, cache: AHashMap::new(), visiting: Vec::new() }
    }

    pub(crate) fn get(&mut self, val: Value) -> Option<Vec<i64>> {
        if let Some(cached) = self.cache.get(&val) {
            return cached.clone();
        }
        if self.visiting.contains(&val) {
            // A cycle (loop phi) has unboundedly many values.
            return None;
        }
        self.visiting.push(val);
        let res = self.compute(val);
        self.visiting.pop();
        self.cache.insert(val, res.clone());
        res
    }

    fn compute(&mut self, val: Value) -> Option<Vec<i64>> {
        match self.func.dfg.value_def(val) {
            ValueDef::Const(c) => match c {
                mir::Const::Int(c) => Some(vec![c as i64]),
                mir::Const::Bool(b) => Some(vec![b as i64]),
                mir::Const::Float(_) => None,
            },
            ValueDef::Param(param) => self.info.known_arg_values(param).map(|it| it.to_vec()),
            ValueDef::Invalid => None,
            ValueDef::Result(inst, _) => self.compute_inst(inst),
        }
    }

    fn compute_inst(&mut self, inst: mir::Inst) -> Option<Vec<i64>> {
        let inst_data = self.func.dfg.insts[inst].clone();
        match inst_data {
            InstructionData::Binary { opcode, args: [lhs, rhs] } => {
                let combine: fn(i64, i64) -> i64 = match opcode {
                    Opcode::Iadd => |a, b| a.wrapping_add(b),
                    Opcode::Isub => |a, b| a.wrapping_sub(b),
                    Opcode::Imul => |a, b| a.wrapping_mul(b),
                    Opcode::Ishl => |a, b| a.wrapping_shl(b as u32),
                    _ => return None,
                };
                let lhs = self.get(lhs)?;
                let rhs = self.get(rhs)?;
                let mut res = Vec::with_capacity(lhs.len() * rhs.len());
                for &a in &lhs {
                    for &b in &rhs {
                        let v = combine(a, b);
                        if !res.contains(&v) {
                            res.push(v);
                        }
                        if res.len() >= VALUE_LIMIT {
                            return None;
                        }
                    }
                }
                res.sort_unstable();
                Some(res)
            }
            InstructionData::Unary { opcode: Opcode::Ineg, arg } => {
                let mut res: Vec<i64> = self.get(arg)?.iter().map(|it| -it).collect();
                res.sort_unstable();
                Some(res)
            }
            InstructionData::Unary { opcode: Opcode::OptBarrier, arg } => self.get(arg),
            InstructionData::PhiNode(ref phi) => {
                let mut res: Vec<i64> = Vec::new();
                let edges: Vec<_> = self.func.dfg.phi_edges(phi).map(|(_, val)| val).collect();
                for val in edges {
                    let vals = self.get(val)?;
                    for v in vals {
                        if !res.contains(&v) {
                            res.push(v);
                        }
                        if res.len() >= VALUE_LIMIT {
                            return None;
                        }
                    }
                }
                res.sort_unstable();
                Some(res)
            }
            _ => None,
        }
    }
}
