use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use crate::entities::{Block, FuncRef, Use, Value};

#[cfg(test)]
mod tests;

/// Some instructions use an external list of argument values because there is
/// not enough space in the 16-byte `InstructionData` struct. These value
/// lists are stored in a memory pool in `dfg.insts.value_lists`.
pub type ValueList = list_pool::ListHandle<Value>;

/// Memory pool for holding value lists. See `ValueList`.
pub type ValueListPool = list_pool::ListPool<Value>;

/// Phi nodes pair every incoming value with its predecessor block. The block
/// halves live in a pool of their own.
pub type BlockList = list_pool::ListHandle<Block>;

/// Memory pool for holding block lists. See `BlockList`.
pub type BlockListPool = list_pool::ListPool<Block>;

/// List of operand slots of one instruction, parallel to its arguments.
pub type UseList = list_pool::ListHandle<Use>;

/// Memory pool for holding use lists. See `UseList`.
pub type UseListPool = list_pool::ListPool<Use>;

/// The shape of an instruction's payload; determines which operands the
/// textual format expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionFormat {
    Unary,
    Binary,
    Ternary,
    Branch,
    Jump,
    Call,
    PhiNode,
    Ret,
    Unreachable,
}

/// Declares [`Opcode`] together with its name, format, and fixed
/// operand/result counts. Keeping all four in one table means a new opcode
/// cannot be added without deciding all of them, and every `match` on
/// `Opcode` elsewhere fails to compile until it handles the addition.
macro_rules! opcodes {
    ($($op:ident = $name:literal ($format:ident, $args:literal -> $rets:literal);)*) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($op),*
        }

        pub(crate) const OPCODE_NAMES: &[&str] = &[$($name),*];
        pub(crate) const OPCODE_FORMAT: &[InstructionFormat] =
            &[$(InstructionFormat::$format),*];
        pub(crate) const OPCODE_CONSTRAINTS: &[OpcodeConstraints] =
            &[$(OpcodeConstraints::new($args, $rets)),*];

        impl FromStr for Opcode {
            type Err = &'static str;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Opcode::$op),)*
                    _ => Err("unknown opcode"),
                }
            }
        }
    };
}

opcodes! {
    // float arithmetic
    Fneg = "fneg" (Unary, 1 -> 1);
    Fadd = "fadd" (Binary, 2 -> 1);
    Fsub = "fsub" (Binary, 2 -> 1);
    Fmul = "fmul" (Binary, 2 -> 1);
    Fdiv = "fdiv" (Binary, 2 -> 1);
    Frem = "frem" (Binary, 2 -> 1);

    // float math
    Sqrt = "sqrt" (Unary, 1 -> 1);
    Exp = "exp" (Unary, 1 -> 1);
    Ln = "ln" (Unary, 1 -> 1);
    Log = "log" (Unary, 1 -> 1);
    Sin = "sin" (Unary, 1 -> 1);
    Cos = "cos" (Unary, 1 -> 1);
    Tan = "tan" (Unary, 1 -> 1);
    Asin = "asin" (Unary, 1 -> 1);
    Acos = "acos" (Unary, 1 -> 1);
    Atan = "atan" (Unary, 1 -> 1);
    Sinh = "sinh" (Unary, 1 -> 1);
    Cosh = "cosh" (Unary, 1 -> 1);
    Tanh = "tanh" (Unary, 1 -> 1);
    Fabs = "fabs" (Unary, 1 -> 1);
    Floor = "floor" (Unary, 1 -> 1);
    Ceil = "ceil" (Unary, 1 -> 1);
    Pow = "pow" (Binary, 2 -> 1);
    Hypot = "hypot" (Binary, 2 -> 1);
    Atan2 = "atan2" (Binary, 2 -> 1);
    Fmin = "fmin" (Binary, 2 -> 1);
    Fmax = "fmax" (Binary, 2 -> 1);

    // integer arithmetic
    Ineg = "ineg" (Unary, 1 -> 1);
    Inot = "inot" (Unary, 1 -> 1);
    Iadd = "iadd" (Binary, 2 -> 1);
    Isub = "isub" (Binary, 2 -> 1);
    Imul = "imul" (Binary, 2 -> 1);
    Idiv = "idiv" (Binary, 2 -> 1);
    Irem = "irem" (Binary, 2 -> 1);
    Ishl = "ishl" (Binary, 2 -> 1);
    Ishr = "ishr" (Binary, 2 -> 1);
    Iand = "iand" (Binary, 2 -> 1);
    Ior = "ior" (Binary, 2 -> 1);
    Ixor = "ixor" (Binary, 2 -> 1);
    Bnot = "bnot" (Unary, 1 -> 1);

    // comparisons
    Ilt = "ilt" (Binary, 2 -> 1);
    Igt = "igt" (Binary, 2 -> 1);
    Ile = "ile" (Binary, 2 -> 1);
    Ige = "ige" (Binary, 2 -> 1);
    Ieq = "ieq" (Binary, 2 -> 1);
    Ine = "ine" (Binary, 2 -> 1);
    Flt = "flt" (Binary, 2 -> 1);
    Fgt = "fgt" (Binary, 2 -> 1);
    Fle = "fle" (Binary, 2 -> 1);
    Fge = "fge" (Binary, 2 -> 1);
    Feq = "feq" (Binary, 2 -> 1);
    Fne = "fne" (Binary, 2 -> 1);
    Beq = "beq" (Binary, 2 -> 1);
    Bne = "bne" (Binary, 2 -> 1);

    // casts
    IFcast = "ifcast" (Unary, 1 -> 1);
    FIcast = "ficast" (Unary, 1 -> 1);
    BIcast = "bicast" (Unary, 1 -> 1);
    IBcast = "ibcast" (Unary, 1 -> 1);
    BFcast = "bfcast" (Unary, 1 -> 1);
    FBcast = "fbcast" (Unary, 1 -> 1);

    // memory
    Alloca = "alloca" (Unary, 1 -> 1);
    Load = "load" (Unary, 1 -> 1);
    Store = "store" (Binary, 2 -> 0);
    Padd = "padd" (Binary, 2 -> 1);
    Memcpy = "memcpy" (Ternary, 3 -> 0);
    Memset = "memset" (Ternary, 3 -> 0);

    Select = "select" (Ternary, 3 -> 1);
    OptBarrier = "optbarrier" (Unary, 1 -> 1);

    // control flow
    Jmp = "jmp" (Jump, 0 -> 0);
    Br = "br" (Branch, 1 -> 0);
    Phi = "phi" (PhiNode, 0 -> 1);
    Call = "call" (Call, 0 -> 0);
    Ret = "ret" (Ret, 0 -> 0);
    Unreachable = "unreachable" (Unreachable, 0 -> 0);
}

#[derive(Clone, Debug)]
pub enum InstructionData {
    Unary { opcode: Opcode, arg: Value },
    Binary { opcode: Opcode, args: [Value; 2] },
    Ternary { opcode: Opcode, args: [Value; 3] },
    Branch { cond: Value, then_dst: Block, else_dst: Block },
    Jump { destination: Block },
    Call { func_ref: FuncRef, args: ValueList },
    PhiNode(PhiNode),
    Ret { args: ValueList },
    Unreachable,
}

impl From<PhiNode> for InstructionData {
    fn from(node: PhiNode) -> Self {
        InstructionData::PhiNode(node)
    }
}

#[test]
fn instruction_data_size() {
    assert_eq!(std::mem::size_of::<InstructionData>(), 16)
}

impl InstructionData {
    pub fn unwrap_phi(&self) -> &PhiNode {
        if let InstructionData::PhiNode(node) = self {
            node
        } else {
            unreachable!()
        }
    }

    pub fn unwrap_phi_mut(&mut self) -> &mut PhiNode {
        if let InstructionData::PhiNode(node) = self {
            node
        } else {
            unreachable!()
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstructionData::PhiNode(_))
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstructionData::Branch { .. }
                | InstructionData::Jump { .. }
                | InstructionData::Ret { .. }
                | InstructionData::Unreachable
        )
    }

    /// Get the value arguments of this instruction.
    pub fn arguments<'a>(&'a self, pool: &'a ValueListPool) -> &'a [Value] {
        match self {
            InstructionData::Unary { arg, .. } | InstructionData::Branch { cond: arg, .. } => {
                core::slice::from_ref(arg)
            }
            InstructionData::Binary { args, .. } => &*args,
            InstructionData::Ternary { args, .. } => &*args,
            InstructionData::Call { args, .. }
            | InstructionData::Ret { args }
            | InstructionData::PhiNode(PhiNode { args, .. }) => args.as_slice(pool),
            InstructionData::Jump { .. } | InstructionData::Unreachable => &[],
        }
    }

    /// Get mutable references to the value arguments of this instruction.
    ///
    /// # Note
    ///
    /// It is up to the caller to ensure that uses are updated as appropriate.
    pub fn arguments_mut<'a>(&'a mut self, pool: &'a mut ValueListPool) -> &'a mut [Value] {
        match self {
            InstructionData::Unary { arg, .. } | InstructionData::Branch { cond: arg, .. } => {
                core::slice::from_mut(arg)
            }
            InstructionData::Binary { args, .. } => &mut *args,
            InstructionData::Ternary { args, .. } => &mut *args,
            InstructionData::Call { args, .. }
            | InstructionData::Ret { args }
            | InstructionData::PhiNode(PhiNode { args, .. }) => args.as_mut_slice(pool),
            InstructionData::Jump { .. } | InstructionData::Unreachable => &mut [],
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            InstructionData::Unary { opcode, .. }
            | InstructionData::Binary { opcode, .. }
            | InstructionData::Ternary { opcode, .. } => *opcode,
            InstructionData::Call { .. } => Opcode::Call,
            InstructionData::Jump { .. } => Opcode::Jmp,
            InstructionData::PhiNode { .. } => Opcode::Phi,
            InstructionData::Branch { .. } => Opcode::Br,
            InstructionData::Ret { .. } => Opcode::Ret,
            InstructionData::Unreachable => Opcode::Unreachable,
        }
    }

    pub fn eq(&self, other: &Self, pools: &ListPools) -> bool {
        match (self, other) {
            (
                Self::Unary { opcode: l_op, arg: l_arg },
                Self::Unary { opcode: r_op, arg: r_arg },
            ) => l_op == r_op && l_arg == r_arg,
            (
                Self::Binary { opcode: l_op, args: l_args },
                Self::Binary { opcode: r_op, args: r_args },
            ) => l_op == r_op && l_args == r_args,
            (
                Self::Ternary { opcode: l_op, args: l_args },
                Self::Ternary { opcode: r_op, args: r_args },
            ) => l_op == r_op && l_args == r_args,
            (
                Self::Branch { cond: l_cond, then_dst: l_then, else_dst: l_else },
                Self::Branch { cond: r_cond, then_dst: r_then, else_dst: r_else },
            ) => l_cond == r_cond && l_then == r_then && l_else == r_else,
            (Self::Jump { destination: l_dst }, Self::Jump { destination: r_dst }) => {
                l_dst == r_dst
            }
            (
                Self::Call { func_ref: l_func, args: l_args },
                Self::Call { func_ref: r_func, args: r_args },
            ) => {
                l_func == r_func
                    && l_args.as_slice(&pools.value_lists) == r_args.as_slice(&pools.value_lists)
            }
            (Self::Ret { args: l_args }, Self::Ret { args: r_args }) => {
                l_args.as_slice(&pools.value_lists) == r_args.as_slice(&pools.value_lists)
            }
            (Self::PhiNode(l), Self::PhiNode(r)) => l.eq(r, pools),
            (Self::Unreachable, Self::Unreachable) => true,
            _ => false,
        }
    }

    pub fn hash<H: std::hash::Hasher>(&self, state: &mut H, pools: &ListPools) {
        core::mem::discriminant(self).hash(state);
        match self {
            InstructionData::Unary { opcode, arg } => {
                opcode.hash(state);
                arg.hash(state);
            }
            InstructionData::Binary { opcode, args } => {
                opcode.hash(state);
                args.hash(state);
            }
            InstructionData::Ternary { opcode, args } => {
                opcode.hash(state);
                args.hash(state);
            }
            InstructionData::Branch { cond, then_dst, else_dst } => {
                cond.hash(state);
                then_dst.hash(state);
                else_dst.hash(state);
            }
            InstructionData::Jump { destination } => destination.hash(state),
            InstructionData::Call { func_ref, args } => {
                func_ref.hash(state);
                args.as_slice(&pools.value_lists).hash(state);
            }
            InstructionData::Ret { args } => args.as_slice(&pools.value_lists).hash(state),
            InstructionData::PhiNode(node) => node.hash(state, pools),
            InstructionData::Unreachable => (),
        }
    }
}

/// The operand pools shared by all instructions of a function.
#[derive(Clone, Default)]
pub struct ListPools {
    pub value_lists: ValueListPool,
    pub block_lists: BlockListPool,
    pub use_lists: UseListPool,
}

impl ListPools {
    pub fn new() -> ListPools {
        ListPools {
            value_lists: ValueListPool::new(),
            block_lists: BlockListPool::new(),
            use_lists: UseListPool::new(),
        }
    }

    pub fn clear(&mut self) {
        self.value_lists.clear();
        self.block_lists.clear();
        self.use_lists.clear();
    }
}

impl Opcode {
    #[inline]
    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Br)
    }

    #[inline]
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Br | Opcode::Ret | Opcode::Unreachable)
    }

    #[inline]
    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call)
    }

    /// Comparisons and boolean-producing opcodes.
    #[inline]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Opcode::Ilt
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
        )
    }

    /// Does this opcode read or write memory?
    #[inline]
    pub fn touches_memory(self) -> bool {
        matches!(
            self,
            Opcode::Load | Opcode::Store | Opcode::Memcpy | Opcode::Memset | Opcode::Alloca
        )
    }

    #[inline]
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::Fmul
                | Opcode::Fadd
                | Opcode::Fmin
                | Opcode::Fmax
                | Opcode::Hypot
                | Opcode::Iand
                | Opcode::Ixor
                | Opcode::Ior
                | Opcode::Iadd
                | Opcode::Imul
                | Opcode::Ieq
                | Opcode::Feq
                | Opcode::Beq
                | Opcode::Ine
                | Opcode::Fne
                | Opcode::Bne
        )
    }

    #[inline]
    pub const fn constraints(self) -> OpcodeConstraints {
        OPCODE_CONSTRAINTS[self as usize]
    }

    #[inline]
    pub const fn format(self) -> InstructionFormat {
        OPCODE_FORMAT[self as usize]
    }

    #[inline]
    pub const fn name(self) -> &'static str {
        OPCODE_NAMES[self as usize]
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value count constraints for a given opcode.
///
/// The `InstructionFormat` determines the payload shape, but not how many
/// fixed operands and results an opcode has; this compact table provides the
/// missing counts.
#[derive(Clone, Copy)]
pub struct OpcodeConstraints {
    /// Bits 0-2: number of fixed result values (excludes call results).
    /// Bits 3-5: number of fixed value arguments (excludes list operands).
    flags: u8,
}

impl OpcodeConstraints {
    const fn new(arg_cnt: u8, ret_cnt: u8) -> OpcodeConstraints {
        OpcodeConstraints { flags: arg_cnt << 3 | ret_cnt }
    }

    /// Get the number of *fixed* result values produced by this opcode. This
    /// does not include results produced by `call` (those come from the
    /// callee signature) or `phi` (always one).
    pub fn num_fixed_results(self) -> usize {
        (self.flags & 0x7) as usize
    }

    /// Get the number of *fixed* input values required by this opcode. List
    /// operands of `call`/`ret`/`phi` are not counted.
    pub fn num_fixed_value_arguments(self) -> usize {
        ((self.flags >> 3) & 0x7) as usize
    }
}

/// A phi instruction: one incoming value per predecessor block.
///
/// `args` and `blocks` are parallel lists; the value at position `i` flows in
/// from the block at position `i`. Lookup by block is a linear scan, phi
/// nodes rarely have more than a handful of edges.
#[derive(Clone, Debug)]
pub struct PhiNode {
    pub args: ValueList,
    pub blocks: BlockList,
}

impl PhiNode {
    #[inline]
    pub fn eq(&self, other: &Self, pools: &ListPools) -> bool {
        self.args.as_slice(&pools.value_lists) == other.args.as_slice(&pools.value_lists)
            && self.blocks.as_slice(&pools.block_lists) == other.blocks.as_slice(&pools.block_lists)
    }

    #[inline]
    pub fn hash<H: std::hash::Hasher>(&self, state: &mut H, pools: &ListPools) {
        for (block, val) in self.edges(pools) {
            block.hash(state);
            val.hash(state)
        }
    }

    /// Position of the operand flowing in from `block`.
    #[inline]
    pub fn edge_operand(&self, block: Block, pools: &ListPools) -> Option<usize> {
        self.blocks.as_slice(&pools.block_lists).iter().position(|it| *it == block)
    }

    /// The value flowing in from `block`.
    #[inline]
    pub fn edge_val(&self, block: Block, pools: &ListPools) -> Option<Value> {
        let pos = self.edge_operand(block, pools)?;
        Some(self.args.as_slice(&pools.value_lists)[pos])
    }

    #[inline]
    pub fn edges<'a>(&self, pools: &'a ListPools) -> PhiEdges<'a> {
        PhiEdges {
            blocks: self.blocks.as_slice(&pools.block_lists).iter(),
            args: self.args.as_slice(&pools.value_lists).iter(),
        }
    }
}

#[derive(Clone)]
pub struct PhiEdges<'a> {
    blocks: std::slice::Iter<'a, Block>,
    args: std::slice::Iter<'a, Value>,
}

impl Iterator for PhiEdges<'_> {
    type Item = (Block, Value);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        Some((*self.blocks.next()?, *self.args.next()?))
    }
}
