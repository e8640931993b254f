use std::iter;
use std::ops::{Index, IndexMut};

use typed_index_collections::TiVec;

use crate::dfg::values::{DfgValues, ValueDataType};
use crate::instructions::{ListPools, UseList};
use crate::{DataFlowGraph, Inst, InstructionData, Use, Value, ValueList};

#[derive(Clone)]
pub struct DfgInstructions {
    /// Data about all of the instructions in the function, including opcodes
    /// and operands. The instructions in this map are not in program order;
    /// that is tracked by `Layout`, along with the block containing each
    /// instruction.
    pub(crate) declarations: TiVec<Inst, InstructionData>,

    /// List of result values for each instruction.
    pub(crate) results: TiVec<Inst, ValueList>,

    /// List of operand slots for each instruction, parallel to its argument
    /// slice.
    pub(crate) uses: TiVec<Inst, UseList>,

    pub pools: ListPools,
}

impl Default for DfgInstructions {
    fn default() -> Self {
        Self::new()
    }
}

impl DfgInstructions {
    pub fn new() -> Self {
        Self {
            declarations: TiVec::new(),
            results: TiVec::new(),
            uses: TiVec::new(),
            pools: ListPools::new(),
        }
    }

    pub fn clear(&mut self) {
        self.declarations.clear();
        self.results.clear();
        self.uses.clear();
        self.pools.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = Inst> + ExactSizeIterator {
        self.declarations.keys()
    }

    /// Get the total number of instructions created in this function, whether
    /// they are currently inserted in the layout or not.
    pub fn num(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_valid(&self, inst: Inst) -> bool {
        usize::from(inst) < self.declarations.len()
    }

    /// Detach all operand uses of the instruction.
    pub fn zap(&self, inst: Inst, values: &mut DfgValues) {
        for use_ in self.uses[inst].as_slice(&self.pools.use_lists) {
            values.detach_use(*use_, self);
        }
    }

    pub fn safe_to_remove(&self, inst: Inst, values: &DfgValues) -> bool {
        self.results(inst).iter().all(|res| values.is_dead(*res))
    }

    /// Get all value arguments of `inst` as a slice.
    pub fn args(&self, inst: Inst) -> &[Value] {
        self.declarations[inst].arguments(&self.pools.value_lists)
    }

    /// Get all value arguments of `inst` as a mutable slice.
    pub fn args_mut(&mut self, inst: Inst) -> &mut [Value] {
        self.declarations[inst].arguments_mut(&mut self.pools.value_lists)
    }

    /// Detach the list of result values from `inst` and return it.
    pub fn detach_results(&mut self, inst: Inst) -> ValueList {
        self.results[inst].take()
    }

    /// Clear the list of result values from `inst`.
    pub fn clear_results(&mut self, inst: Inst) {
        self.results[inst].clear(&mut self.pools.value_lists)
    }

    /// Get the first result of an instruction.
    ///
    /// Panics if the instruction doesn't have any result.
    pub fn first_result(&self, inst: Inst) -> Value {
        self.results[inst].first(&self.pools.value_lists).expect("instruction has no results")
    }

    /// Test if `inst` has any result values currently.
    pub fn has_results(&self, inst: Inst) -> bool {
        !self.results[inst].is_empty()
    }

    /// Return all the results of an instruction.
    pub fn results(&self, inst: Inst) -> &[Value] {
        self.results[inst].as_slice(&self.pools.value_lists)
    }

    /// Return all the operand slots of an instruction.
    pub fn operands(&self, inst: Inst) -> &[Use] {
        self.uses[inst].as_slice(&self.pools.use_lists)
    }
}

/// Operations that need mutable access to both `values` and `insts` but
/// logically still belong to instructions.
impl DataFlowGraph {
    /// Create a new instruction and the uses of its operands.
    ///
    /// Results are not allocated; call `make_inst_results`.
    pub fn make_inst(&mut self, data: InstructionData) -> Inst {
        self.insts.uses.push(UseList::new());
        self.insts.results.push(ValueList::new());
        let inst = self.insts.declarations.push_and_get_key(data);

        let args = self.insts.declarations[inst].arguments(&self.insts.pools.value_lists);
        // The argument slice borrows the pools, collect before growing the
        // use table.
        let args: smallvec::SmallVec<[Value; 4]> = args.iter().copied().collect();

        let uses: smallvec::SmallVec<[Use; 4]> = args
            .iter()
            .enumerate()
            .map(|(i, arg)| self.values.make_use(*arg, inst, i as u16))
            .collect();
        self.insts.uses[inst].extend(uses, &mut self.insts.pools.use_lists);
        inst
    }

    /// Swap the data of an existing instruction, rebuilding its uses.
    pub fn update_inst(&mut self, inst: Inst, data: InstructionData) {
        self.zap_inst(inst);
        self.insts[inst] = data;
        self.update_inst_uses(inst);
    }

    /// Rebuild the use list of `inst` after its arguments changed shape.
    pub fn update_inst_uses(&mut self, inst: Inst) {
        let args: smallvec::SmallVec<[Value; 4]> = self.instr_args(inst).iter().copied().collect();
        let uses = self.insts.uses[inst];
        let use_len = uses.len(&self.insts.pools.use_lists);

        let attach: smallvec::SmallVec<[(Use, Value); 4]> = uses
            .as_slice(&self.insts.pools.use_lists)
            .iter()
            .zip(args.iter())
            .map(|(use_, val)| (*use_, *val))
            .collect();
        for (use_, val) in attach {
            self.values.attach_use(use_, val);
        }

        if args.len() > use_len {
            // make new uses for the extra operands
            let new_uses: smallvec::SmallVec<[Use; 4]> = args[use_len..]
                .iter()
                .enumerate()
                .map(|(i, arg)| self.values.make_use(*arg, inst, (use_len + i) as u16))
                .collect();
            self.insts.uses[inst].extend(new_uses, &mut self.insts.pools.use_lists)
        } else {
            // drop the excess operand slots
            self.insts.uses[inst].truncate(args.len(), &mut self.insts.pools.use_lists);
        }
    }

    /// Append a new instruction result value to `inst`.
    pub fn append_result(&mut self, inst: Inst) -> Value {
        let res = self.values.defs.next_key();
        let num = self.insts.results[inst].push(res, &mut self.insts.pools.value_lists);
        debug_assert!(num <= u16::MAX as usize, "too many result values");
        self.values.make(ValueDataType::Inst { inst, num: num as u16 })
    }

    /// Attach an existing value to the result value list for `inst`.
    ///
    /// The `res` value must not be attached to anything else.
    pub fn attach_result(&mut self, inst: Inst, res: Value) {
        debug_assert!(!self.value_attached(res));
        let num = self.insts.results[inst].push(res, &mut self.insts.pools.value_lists);
        debug_assert!(num <= u16::MAX as usize, "too many result values");
        self.values.defs[res].ty = ValueDataType::Inst { num: num as u16, inst };
    }

    /// Create result values for `inst`, reusing the provided detached values.
    ///
    /// When `reuse` is exhausted or produces `None`, new values are created.
    pub fn make_inst_results_reusing<I>(&mut self, inst: Inst, reuse: I) -> usize
    where
        I: Iterator<Item = Option<Value>>,
    {
        let mut reuse = reuse.fuse();

        self.insts.results[inst].clear(&mut self.insts.pools.value_lists);

        let num_results = if let Some(sig) = self.call_signature(inst) {
            sig.returns as usize
        } else {
            self.insts.declarations[inst].opcode().constraints().num_fixed_results()
        };

        for _res_idx in 0..num_results {
            if let Some(Some(v)) = reuse.next() {
                self.attach_result(inst, v);
            } else {
                self.append_result(inst);
            }
        }
        num_results
    }

    /// Create result values for an instruction.
    pub fn make_inst_results(&mut self, inst: Inst) -> usize {
        self.make_inst_results_reusing(inst, iter::empty())
    }
}

/// Allow immutable access to instructions via indexing.
impl Index<Inst> for DfgInstructions {
    type Output = InstructionData;

    fn index(&self, inst: Inst) -> &InstructionData {
        &self.declarations[inst]
    }
}

/// Allow mutable access to instructions via indexing.
impl IndexMut<Inst> for DfgInstructions {
    fn index_mut(&mut self, inst: Inst) -> &mut InstructionData {
        &mut self.declarations[inst]
    }
}
