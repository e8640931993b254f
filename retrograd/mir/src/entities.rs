//! IR entity references.
//!
//! Instructions need to reference other entities in the function: basic
//! blocks, values, external functions. These references are not Rust
//! references, both because the ownership rules make them impractical to
//! store inside the IR and because 64-bit pointers double the memory
//! footprint. Each entity is a `u32` newtype indexing a table in the
//! function, with a separate index type per entity so references stay type
//! safe.
//!
//! `u32::MAX` is reserved in every entity so that `PackedOption` can
//! represent an absent reference without growing the encoding.

use std::fmt;

use stdx::impl_idx_from;
use stdx::packed_option::ReservedValue;

macro_rules! entity {
    ($(#[$attr:meta])* $name:ident = $display:literal) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(u32);
        impl_idx_from!($name(u32));

        impl $name {
            /// Create an entity from its number, as used by the textual
            /// format.
            pub fn with_number(n: u32) -> Option<Self> {
                if n < u32::MAX {
                    Some(Self(n))
                } else {
                    None
                }
            }

            /// Private constant constructor; only the well-known interned
            /// values use this.
            pub(crate) const fn with_number_(n: u32) -> Self {
                Self(n)
            }
        }

        impl ReservedValue for $name {
            fn reserved_value() -> Self {
                Self(u32::MAX)
            }

            fn is_reserved_value(&self) -> bool {
                self.0 == u32::MAX
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!($display, "{}"), self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }
    };
}

entity! {
    /// An opaque reference to a [basic block](https://en.wikipedia.org/wiki/Basic_block).
    ///
    /// While the order is stable, it is arbitrary and does not necessarily
    /// resemble the layout order.
    Block = "block"
}

entity! {
    /// An opaque reference to an SSA value.
    Value = "v"
}

entity! {
    /// An opaque reference to an instruction.
    Inst = "inst"
}

entity! {
    /// An opaque reference to an external function declared in the function
    /// preamble.
    FuncRef = "fn"
}

entity! {
    /// An opaque reference to a function parameter.
    Param = "p"
}

entity! {
    /// An opaque reference to one operand slot of one instruction.
    Use = "use"
}

/// Any of the entities defined in this module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnyEntity {
    /// The whole function.
    Function,
    Block(Block),
    Inst(Inst),
    Value(Value),
    FuncRef(FuncRef),
}

impl fmt::Display for AnyEntity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Function => write!(f, "function"),
            Self::Block(r) => r.fmt(f),
            Self::Inst(r) => r.fmt(f),
            Self::Value(r) => r.fmt(f),
            Self::FuncRef(r) => r.fmt(f),
        }
    }
}

impl fmt::Debug for AnyEntity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self as &dyn fmt::Display).fmt(f)
    }
}

impl From<Block> for AnyEntity {
    fn from(r: Block) -> Self {
        Self::Block(r)
    }
}

impl From<Inst> for AnyEntity {
    fn from(r: Inst) -> Self {
        Self::Inst(r)
    }
}

impl From<Value> for AnyEntity {
    fn from(r: Value) -> Self {
        Self::Value(r)
    }
}

impl From<FuncRef> for AnyEntity {
    fn from(r: FuncRef) -> Self {
        Self::FuncRef(r)
    }
}
