//! The retrograd MIR.
//!
//! An untyped SSA representation of numeric imperative programs, heavily
//! inspired by the IR in [`cranelift`]. The focus is on the analyses and
//! transformations of the middle end rather than code generation, which
//! keeps the implementation simple:
//!
//! * All opcodes have fixed argument/return types; values are not annotated.
//!   Instructions must be constructed with correct types.
//! * Every value is eight bytes wide; addresses count bytes.
//! * Math library calls are opcodes; only allocator-like external symbols
//!   appear as calls.
//!
//! [`cranelift`]: https://github.com/bytecodealliance/wasmtime/tree/main/cranelift
//! [SSA]: https://en.wikipedia.org/wiki/Static_single_assignment_form

mod dfg;
mod dominators;
mod entities;
mod instructions;
mod layout;
mod loops;

pub mod builder;
pub mod cursor;
pub mod flowgraph;
pub mod validation;
pub mod write;

use core::fmt;

use stdx::impl_display;
use typed_index_collections::TiVec;

pub use stdx::Ieee64;

pub use crate::dfg::{
    consts, Const, DataFlowGraph, DfgInstructions, DfgValues, InstUseIter, UseCursor, UseIter,
    ValueDef,
};
pub use crate::dominators::DominatorTree;
pub use crate::entities::{AnyEntity, Block, FuncRef, Inst, Param, Use, Value};
pub use crate::flowgraph::ControlFlowGraph;
pub use crate::instructions::{
    BlockList, BlockListPool, InstructionData, InstructionFormat, ListPools, Opcode, PhiEdges,
    PhiNode, ValueList, ValueListPool,
};
pub use crate::layout::Layout;
pub use crate::loops::{Loop, LoopData, LoopForest};

/// Function bodies addressable by signature name.
///
/// Cross-function analyses resolve a call's `FuncRef` through the signature
/// name, never through pointer identity, so clones behave deterministically.
pub type FunctionRegistry = ahash::AHashMap<String, Function>;

/// An external function callable from a `Function`, identified by name.
///
/// Only the shape of the signature is recorded; parameters and returns are
/// untyped 8-byte values like everything else in the IR.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FunctionSignature {
    pub name: String,
    pub params: u16,
    pub returns: u16,
    pub has_sideeffects: bool,
}

impl_display! {
    match FunctionSignature{
        FunctionSignature{name, params, returns, has_sideeffects} => "{}fn %{}({}) -> {}", if *has_sideeffects{""}else{"const "}, name, params, returns;
    }
}

/// Functions can be cloned, but it is not a very fast operation. The clone
/// will have all the same entity numbers as the original.
#[derive(Clone, Default)]
pub struct Function {
    pub name: String,

    /// Data flow graph containing the primary definition of all
    /// instructions and values.
    pub dfg: DataFlowGraph,

    /// Layout of blocks and instructions in the function body.
    pub layout: Layout,

    /// Source locations.
    ///
    /// Track the original source location for each instruction. The source
    /// locations are not interpreted, only preserved.
    pub srclocs: SourceLocs,
}

impl Function {
    pub fn new() -> Function {
        Self::default()
    }

    pub fn with_name(name: String) -> Function {
        Function { name, ..Function::default() }
    }

    /// Clear all data structures in this function.
    pub fn clear(&mut self) {
        self.dfg.clear();
        self.layout.clear();
        self.srclocs.clear();
    }

    pub fn to_debug_string(&self) -> String {
        format!("{:?}", self)
    }

    /// Adds a signature which can later be used to declare an external
    /// function import.
    pub fn import_function(&mut self, signature: FunctionSignature) -> FuncRef {
        self.dfg.signatures.push_and_get_key(signature)
    }

    /// Find an imported signature by name.
    pub fn lookup_function(&self, name: &str) -> Option<FuncRef> {
        self.dfg
            .signatures
            .iter_enumerated()
            .find(|(_, sig)| sig.name == name)
            .map(|(func_ref, _)| func_ref)
    }

    /// The source location of `inst`, or the default when none was recorded.
    pub fn srcloc(&self, inst: Inst) -> SourceLoc {
        self.srclocs.get(inst).copied().unwrap_or_default()
    }

    pub fn srclocs_set(&mut self, inst: Inst, loc: SourceLoc) {
        if loc.is_default() && self.srclocs.len() <= usize::from(inst) {
            return;
        }
        while self.srclocs.len() <= usize::from(inst) {
            self.srclocs.push(SourceLoc::default());
        }
        self.srclocs[inst] = loc;
    }

    /// Rewrite the phi edges of `bb` that flow in from `old_pred` to flow in
    /// from `new_pred` instead.
    pub fn update_phi_edges(&mut self, bb: Block, old_pred: Block, new_pred: Block) {
        for inst in self.layout.block_insts(bb) {
            if self.dfg.insts[inst].is_phi() {
                self.dfg.rewrite_phi_pred(inst, old_pred, new_pred);
            } else {
                break;
            }
        }
    }

    /// Strip `optbarrier` instructions, forwarding their argument.
    pub fn remove_opt_barriers(&mut self) {
        for inst in self.dfg.insts.iter().collect::<Vec<_>>() {
            if let InstructionData::Unary { opcode: Opcode::OptBarrier, arg } = self.dfg.insts[inst]
            {
                if self.layout.inst_block(inst).is_some() {
                    let res = self.dfg.first_result(inst);
                    self.dfg.replace_uses(res, arg);
                    self.dfg.zap_inst(inst);
                    self.layout.remove_inst(inst)
                }
            }
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write::write_function(fmt, self)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write::write_function(fmt, self)
    }
}

/// Source locations for instructions.
pub type SourceLocs = TiVec<Inst, SourceLoc>;

/// A source location.
///
/// This is an opaque 32-bit number attached to each IR instruction. The
/// default source location uses the all-ones bit pattern `!0`. It is used
/// for instructions that can't be given a real source location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceLoc(i32);

impl SourceLoc {
    /// Create a new source location with the given bits.
    pub fn new(bits: i32) -> Self {
        Self(bits)
    }

    /// Is this the default source location?
    pub fn is_default(self) -> bool {
        self == Default::default()
    }

    /// Read the bits of this source location.
    pub fn bits(self) -> i32 {
        self.0
    }
}

impl Default for SourceLoc {
    fn default() -> Self {
        Self(!0)
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_default() {
            write!(f, "@-")
        } else {
            write!(f, "@{:04x}", self.0)
        }
    }
}
