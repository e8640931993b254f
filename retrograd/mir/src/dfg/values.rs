use std::borrow::Borrow;

use ahash::AHashMap;
use stdx::packed_option::PackedOption;
use typed_index_collections::TiVec;

use crate::dfg::uses::UseData;
use crate::entities::Param;
use crate::{DataFlowGraph, Ieee64, Inst, Use, Value};

/// Well-known interned values, created ahead of any user values so they have
/// stable numbers in every function.
pub mod consts {
    use super::Value;

    /// Placeholder for detached operands that must remain (in phis).
    pub const GRAVESTONE: Value = Value::with_number_(0);
    pub const FALSE: Value = Value::with_number_(1);
    pub const TRUE: Value = Value::with_number_(2);
    pub const F_ZERO: Value = Value::with_number_(3);
    pub const F_ONE: Value = Value::with_number_(4);
    pub const F_N_ONE: Value = Value::with_number_(5);
    pub const F_TWO: Value = Value::with_number_(6);
    pub const ZERO: Value = Value::with_number_(7);
    pub const ONE: Value = Value::with_number_(8);

    pub(super) const NUM: u32 = 9;
}

impl From<bool> for Value {
    fn from(val: bool) -> Self {
        if val {
            consts::TRUE
        } else {
            consts::FALSE
        }
    }
}

#[derive(Clone)]
pub struct DfgValues {
    /// Primary value table with entries for all values.
    pub(crate) defs: TiVec<Value, ValueData>,

    /// Primary use table with entries for all operand slots.
    pub(crate) uses: TiVec<Use, UseData>,

    /// Interned integer constants.
    int_consts: AHashMap<i32, Value>,

    /// Interned real constants.
    real_consts: AHashMap<Ieee64, Value>,
}

#[derive(Clone, Debug)]
pub(crate) struct ValueData {
    pub(crate) ty: ValueDataType,
    pub(crate) uses_head: PackedOption<Use>,
    pub(crate) uses_tail: PackedOption<Use>,
}

impl From<ValueDataType> for ValueData {
    fn from(ty: ValueDataType) -> Self {
        Self { ty, uses_head: None.into(), uses_tail: None.into() }
    }
}

/// Internal table storage for values.
#[derive(Clone, Debug)]
pub(crate) enum ValueDataType {
    /// Value is defined by an instruction.
    Inst { num: u16, inst: Inst },
    /// A function parameter.
    Param { param: Param },
    Fconst { val: Ieee64 },
    Iconst { val: i32 },
    True,
    False,
    Invalid,
}

/// Where did a value come from?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueDef {
    /// Value is the n'th result of an instruction.
    Result(Inst, usize),
    /// Value is the n'th parameter to the function.
    Param(Param),
    Const(Const),
    Invalid,
}

impl ValueDef {
    /// Unwrap the instruction where the value was defined, or panic.
    #[inline]
    pub fn unwrap_inst(&self) -> Inst {
        self.inst().expect("value is not an instruction result")
    }

    #[inline]
    pub fn unwrap_param(&self) -> Param {
        self.as_param().expect("value is not a parameter")
    }

    /// Get the instruction where the value was defined, if any.
    #[inline]
    pub fn inst(&self) -> Option<Inst> {
        match *self {
            Self::Result(inst, _) => Some(inst),
            _ => None,
        }
    }

    #[inline]
    pub fn as_const(&self) -> Option<Const> {
        match *self {
            Self::Const(const_) => Some(const_),
            _ => None,
        }
    }

    #[inline]
    pub fn as_param(&self) -> Option<Param> {
        match *self {
            Self::Param(param) => Some(param),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Const {
    Float(Ieee64),
    Int(i32),
    Bool(bool),
}

impl Const {
    pub fn unwrap_f64(self) -> f64 {
        if let Const::Float(val) = self {
            val.into()
        } else {
            unreachable!("const is not a float")
        }
    }

    pub fn unwrap_i32(self) -> i32 {
        if let Const::Int(val) = self {
            val
        } else {
            unreachable!("const is not an int")
        }
    }

    /// Is this constant a zero bit pattern (of any type)?
    pub fn is_zero(self) -> bool {
        match self {
            Const::Float(val) => val.is_zero(),
            Const::Int(val) => val == 0,
            Const::Bool(val) => !val,
        }
    }
}

impl DfgValues {
    pub fn new() -> Self {
        let mut res = Self {
            defs: TiVec::new(),
            uses: TiVec::new(),
            int_consts: AHashMap::new(),
            real_consts: AHashMap::new(),
        };

        res.defs.push(ValueDataType::Invalid.into()); // GRAVESTONE
        res.defs.push(ValueDataType::False.into());
        res.defs.push(ValueDataType::True.into());
        for val in [0.0, 1.0, -1.0, 2.0] {
            let data = ValueDataType::Fconst { val: val.into() }.into();
            let val_ = res.defs.push_and_get_key(data);
            res.real_consts.insert(Ieee64::with_float(val), val_);
        }
        for val in [0, 1] {
            let data = ValueDataType::Iconst { val }.into();
            let val_ = res.defs.push_and_get_key(data);
            res.int_consts.insert(val, val_);
        }
        debug_assert_eq!(res.defs.len() as u32, consts::NUM);

        // normalize minus zero to plus zero for interning
        res.real_consts.insert((-0f64).into(), consts::F_ZERO);

        res
    }

    /// Clear everything and re-intern the well-known constants.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Get the total number of values.
    pub fn num(&self) -> usize {
        self.defs.len()
    }

    /// Allocate a value entry.
    #[inline]
    pub(crate) fn make(&mut self, ty: ValueDataType) -> Value {
        self.defs.push_and_get_key(ty.into())
    }

    pub fn make_param(&mut self, param: Param) -> Value {
        self.make(ValueDataType::Param { param })
    }

    /// Redefine `val` as a parameter; used by the textual parser.
    pub fn make_param_at(&mut self, param: Param, val: Value) {
        self.defs[val].ty = ValueDataType::Param { param };
    }

    /// Get an iterator over all values.
    pub fn iter(&self) -> impl Iterator<Item = Value> + ExactSizeIterator {
        self.defs.keys()
    }

    /// Check if a value reference is valid.
    pub fn is_valid(&self, v: Value) -> bool {
        usize::from(v) < self.defs.len()
    }

    /// Get the definition of a value.
    #[inline]
    pub fn def(&self, v: Value) -> ValueDef {
        match self.defs[v].ty {
            ValueDataType::Inst { inst, num } => ValueDef::Result(inst, num as usize),
            ValueDataType::Param { param } => ValueDef::Param(param),
            ValueDataType::Fconst { val } => ValueDef::Const(Const::Float(val)),
            ValueDataType::Iconst { val } => ValueDef::Const(Const::Int(val)),
            ValueDataType::True => ValueDef::Const(Const::Bool(true)),
            ValueDataType::False => ValueDef::Const(Const::Bool(false)),
            ValueDataType::Invalid => ValueDef::Invalid,
        }
    }

    pub fn unwrap_f64(&self, v: Value) -> f64 {
        match self.defs[v].ty {
            ValueDataType::Fconst { val } => val.into(),
            ref ty => unreachable!("called unwrap_f64 on {:?} value", ty),
        }
    }

    pub fn unwrap_i32(&self, v: Value) -> i32 {
        match self.defs[v].ty {
            ValueDataType::Iconst { val } => val,
            ref ty => unreachable!("called unwrap_i32 on {:?} value", ty),
        }
    }

    pub fn is_dead(&self, val: Value) -> bool {
        self.defs[val].uses_head.is_none()
    }

    pub fn iconst(&mut self, val: i32) -> Value {
        *self.int_consts.entry(val).or_insert_with(|| {
            self.defs.push_and_get_key(ValueDataType::Iconst { val }.into())
        })
    }

    pub fn fconst(&mut self, val: Ieee64) -> Value {
        let val = if val.is_zero() { Ieee64::with_float(0.0) } else { val };
        *self.real_consts.entry(val).or_insert_with(|| {
            self.defs.push_and_get_key(ValueDataType::Fconst { val }.into())
        })
    }

    /// Redefine `dst` as an interned integer constant; used by the parser.
    pub fn iconst_at(&mut self, val: i32, dst: Value) {
        self.int_consts.insert(val, dst);
        self.defs[dst].ty = ValueDataType::Iconst { val };
    }

    /// Redefine `dst` as an interned float constant; used by the parser.
    pub fn fconst_at(&mut self, val: Ieee64, dst: Value) {
        self.real_consts.insert(val, dst);
        self.defs[dst].ty = ValueDataType::Fconst { val };
    }
}

impl Borrow<DfgValues> for DataFlowGraph {
    fn borrow(&self) -> &DfgValues {
        &self.values
    }
}

impl Default for DfgValues {
    fn default() -> Self {
        Self::new()
    }
}
