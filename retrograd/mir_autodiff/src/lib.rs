//! Reverse-mode derivative synthesis.
//!
//! Given a function `f(x0, .., xn) -> r` of the MIR, this crate builds a new
//! function of the same MIR computing the adjoint of `f`: the gradient of
//! `r` with respect to the active arguments, given an incoming adjoint of
//! the result. The primal body is cloned, every value is classified as
//! active, duplicated (a pointer whose shadow memory carries derivatives) or
//! constant, a reverse control-flow graph mirroring the primal's loops and
//! branches is fabricated, primal intermediates needed on the way back are
//! cached, and per-opcode pullbacks accumulate into zero-initialized
//! adjoint cells.
//!
//! Type analysis ([`mir_ty`]) is the oracle deciding which values carry
//! derivatives at all.

use ahash::{AHashMap, AHashSet};
use mir::{Function, FunctionRegistry};
use thiserror::Error;

mod activity;
mod builder;
mod driver;
mod loops;
mod utils;

#[cfg(test)]
mod tests;

pub use activity::{Activity, ArgActivity};
pub use builder::{create_augmented_primal, create_primal_and_gradient};
pub use driver::rewrite_autodiff_calls;

/// How the synthesized function returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// Same returns as the primal (augmented primal).
    Normal,
    /// `(primal returns .., adjoints of the scalar-active parameters in
    /// declaration order)`.
    ArgsWithReturn,
    /// Adjoints only.
    Args,
}

#[derive(Error, Debug)]
pub enum AutodiffError {
    #[error(transparent)]
    Type(#[from] mir_ty::TypeError),

    #[error("%{name} has no body; a call to it sits on the active path")]
    UnknownCallee { name: String },

    #[error("%{name} is recursive; differentiation of recursive call graphs is not supported")]
    RecursiveCall { name: String },

    #[error("a loop headed by {header} has more than one live exit")]
    MultipleLiveExits { header: mir::Block },

    #[error("a loop headed by {header} has more than one latch")]
    MultipleLatches { header: mir::Block },

    #[error("a dynamic loop headed by {header} is nested inside another dynamic loop")]
    UnboundedLoop { header: mir::Block },

    #[error("no pullback rule covers {inst}: `{op}`")]
    UnhandledInstruction { inst: mir::Inst, op: &'static str },

    #[error("malformed autodiff intrinsic: {reason}")]
    IllegalIntrinsic { reason: String },

    #[error("the synthesized function failed verification: {first}")]
    Verifier { first: String },
}

/// Tracing configuration; everything defaults to off. Output goes through
/// the `log` crate and never changes behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Log every activity decision.
    pub trace_activity: bool,
    /// Dump the function before and after synthesis.
    pub dump_ir: bool,
}

/// Fingerprint of one synthesis request; never a raw pointer, so cloned
/// callees resolve to the same entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SynthKey {
    pub name: String,
    pub args: Vec<ArgActivity>,
    pub return_primal: bool,
    pub differential_return: bool,
    pub shape: ReturnShape,
    /// Whether the variant consumes the tape of its augmented primal.
    pub tape: bool,
}

/// Process-wide synthesis context.
///
/// Owns the registry of function bodies, the type-analysis cache, and the
/// augmented-primal / primal-and-gradient caches. Synthesized functions are
/// inserted into the registry under their generated names. Entering a key
/// that is already on the synthesis stack is a [`AutodiffError::RecursiveCall`].
pub struct AutodiffCtx {
    pub registry: FunctionRegistry,
    pub types: mir_ty::TypeAnalysis,
    pub config: Config,
    pub(crate) gradients: AHashMap<SynthKey, String>,
    pub(crate) augmented: AHashMap<SynthKey, String>,
    pub(crate) synthesis_stack: AHashSet<String>,
}

impl AutodiffCtx {
    pub fn new(registry: FunctionRegistry) -> AutodiffCtx {
        AutodiffCtx {
            registry,
            types: mir_ty::TypeAnalysis::new(),
            config: Config::default(),
            gradients: AHashMap::new(),
            augmented: AHashMap::new(),
            synthesis_stack: AHashSet::new(),
        }
    }

    pub fn with_config(registry: FunctionRegistry, config: Config) -> AutodiffCtx {
        AutodiffCtx { config, ..AutodiffCtx::new(registry) }
    }

    pub(crate) fn function(&self, name: &str) -> Result<&Function, AutodiffError> {
        self.registry.get(name).ok_or_else(|| AutodiffError::UnknownCallee { name: name.into() })
    }
}
