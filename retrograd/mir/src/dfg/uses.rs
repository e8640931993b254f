use std::borrow::Borrow;
use std::mem::take;
use std::slice;

use stdx::packed_option::PackedOption;

use crate::dfg::insts::DfgInstructions;
use crate::dfg::values::DfgValues;
use crate::{DataFlowGraph, Inst, Use, Value};

/// One operand slot of one instruction, linked into the use chain of the
/// value currently occupying the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct UseData {
    pub(crate) parent: Inst,
    pub(crate) parent_idx: u16,
    attached: bool,
    next: PackedOption<Use>,
    prev: PackedOption<Use>,
}

impl Use {
    pub fn prev(self, dfg: &DfgValues) -> Option<Use> {
        dfg.uses[self].prev.expand()
    }

    pub fn next(self, dfg: &DfgValues) -> Option<Use> {
        dfg.uses[self].next.expand()
    }

    pub fn to_value(self, dfg: &DataFlowGraph) -> Value {
        dfg.use_to_value(self)
    }

    pub fn into_cursor(self) -> UseCursor {
        UseCursor { curr: Some(self) }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct UseCursor {
    pub curr: Option<Use>,
}

impl UseCursor {
    /// Returns the current use and advances the cursor forward.
    pub fn advance(&mut self, dfg: &DfgValues) -> Option<Use> {
        let res = self.curr?;
        self.curr = res.next(dfg);
        Some(res)
    }

    pub fn into_iter<D: Borrow<DfgValues>>(self, dfg: &D) -> UseIter<'_> {
        UseIter { cursor: self, dfg: dfg.borrow() }
    }
}

impl From<Option<Use>> for UseCursor {
    fn from(curr: Option<Use>) -> Self {
        UseCursor { curr }
    }
}

impl From<PackedOption<Use>> for UseCursor {
    fn from(curr: PackedOption<Use>) -> Self {
        UseCursor { curr: curr.expand() }
    }
}

/// Iterator over the uses of one value.
#[derive(Clone)]
pub struct UseIter<'a> {
    pub cursor: UseCursor,
    dfg: &'a DfgValues,
}

impl Iterator for UseIter<'_> {
    type Item = Use;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.advance(self.dfg)
    }
}

/// Iterator over the uses of all results of one instruction.
#[derive(Clone)]
pub struct InstUseIter<'a> {
    vals: slice::Iter<'a, Value>,
    cursor: UseCursor,
    dfg: &'a DfgValues,
}

impl Iterator for InstUseIter<'_> {
    type Item = Use;

    fn next(&mut self) -> Option<Self::Item> {
        let mut res = self.cursor.advance(self.dfg);

        if res.is_none() {
            for val in &mut self.vals {
                self.cursor = self.dfg.uses_head_cursor(*val);
                if let Some(new_res) = self.cursor.advance(self.dfg) {
                    res = Some(new_res);
                    break;
                }
            }
        }

        res
    }
}

impl DfgValues {
    pub fn use_to_operand(&self, use_: Use) -> (Inst, u16) {
        (self.uses[use_].parent, self.uses[use_].parent_idx)
    }

    pub fn make_use(&mut self, val: Value, parent: Inst, parent_idx: u16) -> Use {
        let def = &mut self.defs[val];
        let use_ = self.uses.push_and_get_key(UseData {
            parent,
            parent_idx,
            attached: true,
            next: def.uses_head,
            prev: None.into(),
        });

        if let Some(old_head) = def.uses_head.expand() {
            self.uses[old_head].prev = use_.into();
        } else {
            def.uses_tail = use_.into();
        }

        def.uses_head = use_.into();
        use_
    }

    pub fn detach_use(&mut self, use_: Use, insts: &DfgInstructions) {
        let prev = take(&mut self.uses[use_].prev);
        let next = take(&mut self.uses[use_].next);

        if !take(&mut self.uses[use_].attached) {
            return; // already detached
        }

        match (next.expand(), prev.expand()) {
            (None, None) => {
                let val = self.use_to_value(use_, insts);
                self.defs[val].uses_head = None.into();
                self.defs[val].uses_tail = None.into();
            }
            (Some(next_), Some(prev_)) => {
                self.uses[next_].prev = prev;
                self.uses[prev_].next = next;
            }
            (Some(next_), None) => {
                let val = self.use_to_value(use_, insts);
                self.defs[val].uses_head = next_.into();
                self.uses[next_].prev = None.into();
            }
            (None, Some(prev_)) => {
                let val = self.use_to_value(use_, insts);
                self.defs[val].uses_tail = prev_.into();
                self.uses[prev_].next = None.into();
            }
        }
    }

    pub fn attach_use(&mut self, use_: Use, val: Value) {
        debug_assert!(
            self.is_use_detached(use_),
            "use must be detached from its old value before being added back"
        );
        let data = &mut self.uses[use_];
        data.attached = true;
        if let Some(old_head) = self.defs[val].uses_head.expand() {
            data.next = old_head.into();
            self.uses[old_head].prev = use_.into();
        } else {
            data.next = None.into();
            self.defs[val].uses_tail = use_.into();
        }

        self.defs[val].uses_head = use_.into();
    }

    pub fn is_use_detached(&self, use_: Use) -> bool {
        !self.uses[use_].attached
    }

    pub fn uses(&self, value: Value) -> UseIter {
        self.uses_head_cursor(value).into_iter(self)
    }

    pub fn uses_head_cursor(&self, value: Value) -> UseCursor {
        self.defs[value].uses_head.into()
    }

    pub(crate) fn use_to_value(&self, use_: Use, insts: &DfgInstructions) -> Value {
        let data = self.uses[use_];
        insts.args(data.parent)[data.parent_idx as usize]
    }
}

impl DataFlowGraph {
    /// Rewrite every use of `dest` to use `src` instead and splice the use
    /// chains together.
    ///
    /// # Note
    ///
    /// Calling this with `dest == src` will cause incorrect results.
    pub fn replace_uses(&mut self, dest: Value, src: Value) {
        debug_assert_ne!(dest, src);

        // replace values in instructions
        let mut cursor = self.values.uses_head_cursor(dest);
        while let Some(use_) = cursor.advance(&self.values) {
            let data = self.values.uses[use_];
            self.insts.args_mut(data.parent)[data.parent_idx as usize] = src;
        }

        // splice the use lists
        if let Some(new_head) = self.values.defs[dest].uses_head.take() {
            if let Some(old_head) = self.values.defs[src].uses_head.expand() {
                let old_tail = self.values.defs[dest].uses_tail.unwrap();
                self.values.uses[old_tail].next = old_head.into();
                self.values.uses[old_head].prev = old_tail.into();
            } else {
                self.values.defs[src].uses_tail = self.values.defs[dest].uses_tail;
            }
            self.values.defs[dest].uses_tail = None.into();
            self.values.defs[src].uses_head = new_head.into();
        }
    }

    /// Replace the value in one operand slot, keeping the use chains
    /// consistent.
    pub fn use_set_value(&mut self, use_: Use, val: Value) {
        debug_assert!(!self.is_use_detached(use_));
        self.values.detach_use(use_, &self.insts);
        let data = self.values.uses[use_];
        self.insts.args_mut(data.parent)[data.parent_idx as usize] = val;
        self.attach_use(use_, val);
    }

    /// Replace operand `pos` of `inst`, keeping the use chains consistent.
    pub fn set_operand_value(&mut self, inst: Inst, pos: u16, val: Value) {
        let use_ = self.operands(inst)[pos as usize];
        self.use_set_value(use_, val)
    }

    /// Iterate over the uses of all results of `inst`.
    pub fn inst_uses(&self, inst: Inst) -> InstUseIter {
        let mut vals = self.inst_results(inst).iter();
        let cursor =
            vals.next().map(|res| self.values.uses_head_cursor(*res)).unwrap_or_default();
        InstUseIter { cursor, vals, dfg: &self.values }
    }
}
