//! Byte-offset type analysis over the MIR.
//!
//! The MIR is untyped: whether a value carries a float, an integer or an
//! address is a property of how it is used, not of its declaration. The
//! differentiator needs exactly that property, since only floats carry
//! derivatives (pointers carry them indirectly through shadow memory), so
//! this crate infers, for every SSA value and every byte offset reachable
//! through it, a [`ConcreteType`] classification, to a fixed point.
//!
//! Results are memoized process-wide in a [`TypeAnalysis`] context, keyed by
//! a structural fingerprint of the callee signature so that clones of a
//! function behave deterministically.

use std::rc::Rc;

use ahash::AHashSet;
use mir::{Function, FunctionRegistry, Param, Value};
use thiserror::Error;
use typed_index_collections::TiVec;
use typed_indexmap::TiMap;

mod analyzer;
mod known_values;
mod tree;

pub use tree::{ConcreteType, FloatWidth, Offsets, TypeTree, SLOT, UNIFORM};

use crate::analyzer::TypeAnalyzer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("type conflict: {lhs} is incompatible with {rhs}")]
    TypeConflict { lhs: ConcreteType, rhs: ConcreteType },

    #[error("illegal update: {val} is a pointer but was reclassified as an integer")]
    IllegalPointerUpdate { val: Value },

    #[error("no concrete type was inferred for {val}")]
    NotFound { val: Value },
}

/// The argument signature a function is analyzed under: one [`TypeTree`]
/// per parameter, the statically known small-integer values of each
/// parameter, and the demanded classification of the primary return value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FnTypeInfo {
    pub args: Vec<TypeTree>,
    /// Known small-integer candidates per parameter, `None` when unbounded.
    pub known_values: Vec<Option<Vec<i64>>>,
    /// Classification of the first return value.
    pub ret: TypeTree,
}

impl FnTypeInfo {
    pub fn new(args: Vec<TypeTree>) -> FnTypeInfo {
        let known_values = vec![None; args.len()];
        FnTypeInfo { args, known_values, ret: TypeTree::new() }
    }

    pub fn arg_tree(&self, param: Param) -> TypeTree {
        self.args.get(usize::from(param)).cloned().unwrap_or_default()
    }

    pub fn known_arg_values(&self, param: Param) -> Option<&[i64]> {
        self.known_values.get(usize::from(param)).and_then(|it| it.as_deref())
    }
}

/// The per-value classification of one analyzed function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeResults {
    pub(crate) types: TiVec<Value, TypeTree>,
    pub(crate) params: Vec<TypeTree>,
    pub(crate) ret: Vec<TypeTree>,
    pub(crate) known: TiVec<Value, Option<Vec<i64>>>,
}

impl TypeResults {
    /// The full tree of `val`.
    pub fn query(&self, val: Value) -> TypeTree {
        self.types.get(val).cloned().unwrap_or_default()
    }

    /// The trees the parameters settled at.
    pub fn param_tree(&self, param: Param) -> TypeTree {
        self.params.get(usize::from(param)).cloned().unwrap_or_default()
    }

    /// The trees of the returned values.
    pub fn return_trees(&self) -> &[TypeTree] {
        &self.ret
    }

    /// The scalar classification of `val` itself.
    pub fn int_type(&self, val: Value, err_if_not_found: bool) -> Result<ConcreteType, TypeError> {
        let ct = self.query(val).data0();
        if err_if_not_found && !ct.is_known() {
            return Err(TypeError::NotFound { val });
        }
        Ok(ct)
    }

    /// The unique classification of the pointee bytes `[0, size)` behind
    /// `val`. With `pointer_int_same`, `Integer` entries unify with
    /// `Pointer` (address bits observed as integers).
    pub fn first_pointer(
        &self,
        size: i64,
        val: Value,
        err_if_not_found: bool,
        pointer_int_same: bool,
    ) -> Result<ConcreteType, TypeError> {
        let tree = self.query(val);
        let mut res = ConcreteType::Unknown;
        for (path, mut ct) in tree.iter() {
            let inside = match path.first() {
                Some(&tree::UNIFORM) => true,
                Some(&off) => off < size,
                None => false,
            };
            if !inside {
                continue;
            }
            if pointer_int_same && ct == ConcreteType::Integer {
                ct = ConcreteType::Pointer;
            }
            res = res.and_in(ct)?;
        }
        if err_if_not_found && !res.is_known() {
            return Err(TypeError::NotFound { val });
        }
        Ok(res)
    }

    /// Statically known small-integer candidates of `val`.
    pub fn known_integral_values(&self, val: Value) -> Option<&[i64]> {
        self.known.get(val).and_then(|it| it.as_deref())
    }
}

/// Argument/return shape of a recognized math-library symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MathSig {
    /// `f(double) -> double`
    F,
    /// `f(double, double) -> double`
    FF,
    /// `f(double, double, double) -> double`
    FFF,
    /// `f(double, int) -> double`
    FI,
    /// `f(double) -> int`
    IofF,
    /// `f(double, int*) -> double`
    FPtrI,
    /// `f(double, double*) -> double`
    FPtrF,
    /// `f(double, double, int*) -> double`
    FFPtrI,
}

/// The fixed math-library table: symbols typed by signature rather than by
/// analysis. `f` and `l` suffix variants resolve to the same shapes; the
/// lattice only tracks one float width per entry anyway.
pub fn math_signature(name: &str) -> Option<MathSig> {
    use MathSig::*;
    let base = name.strip_suffix('f').or_else(|| name.strip_suffix('l')).filter(|base| {
        // `ceil` must not be mistaken for a suffixed `cei`.
        MATH_TABLE.iter().any(|(n, _)| *n == *base)
    });
    let name = base.unwrap_or(name);
    MATH_TABLE.iter().find(|(n, _)| *n == name).map(|(_, sig)| *sig)
}

const MATH_TABLE: &[(&str, MathSig)] = &[
    ("sin", MathSig::F),
    ("cos", MathSig::F),
    ("tan", MathSig::F),
    ("acos", MathSig::F),
    ("asin", MathSig::F),
    ("atan", MathSig::F),
    ("atan2", MathSig::FF),
    ("cosh", MathSig::F),
    ("sinh", MathSig::F),
    ("tanh", MathSig::F),
    ("acosh", MathSig::F),
    ("asinh", MathSig::F),
    ("atanh", MathSig::F),
    ("exp", MathSig::F),
    ("log", MathSig::F),
    ("log10", MathSig::F),
    ("exp2", MathSig::F),
    ("expm1", MathSig::F),
    ("ilogb", MathSig::IofF),
    ("log1p", MathSig::F),
    ("log2", MathSig::F),
    ("logb", MathSig::F),
    ("scalbn", MathSig::FI),
    ("scalbln", MathSig::FI),
    ("pow", MathSig::FF),
    ("sqrt", MathSig::F),
    ("cbrt", MathSig::F),
    ("hypot", MathSig::FF),
    ("erf", MathSig::F),
    ("erfc", MathSig::F),
    ("tgamma", MathSig::F),
    ("lgamma", MathSig::F),
    ("ceil", MathSig::F),
    ("floor", MathSig::F),
    ("fmod", MathSig::FF),
    ("trunc", MathSig::F),
    ("round", MathSig::F),
    ("lround", MathSig::IofF),
    ("llround", MathSig::IofF),
    ("rint", MathSig::F),
    ("lrint", MathSig::IofF),
    ("llrint", MathSig::IofF),
    ("remainder", MathSig::FF),
    ("remquo", MathSig::FFPtrI),
    ("copysign", MathSig::FF),
    ("nextafter", MathSig::FF),
    ("nexttoward", MathSig::FF),
    ("fdim", MathSig::FF),
    ("fmax", MathSig::FF),
    ("fmin", MathSig::FF),
    ("fabs", MathSig::F),
    ("fma", MathSig::FFF),
    ("frexp", MathSig::FPtrI),
    ("ldexp", MathSig::FI),
    ("modf", MathSig::FPtrF),
];

/// Identifies one cache entry; only used for tracing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct AnalysisId(u32);
stdx::impl_idx_from!(AnalysisId(u32));

/// Structural fingerprint of an analysis request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FnTypeKey {
    pub name: String,
    pub info: FnTypeInfo,
}

/// Process-wide analysis context: memoizes [`TypeResults`] per
/// `(function name, signature)` fingerprint.
///
/// Single-threaded by design; a host driving transformations in parallel
/// must wrap it in an exclusive lock.
#[derive(Default)]
pub struct TypeAnalysis {
    cache: TiMap<AnalysisId, FnTypeKey, Rc<TypeResults>>,
    in_progress: AHashSet<FnTypeKey>,
}

impl TypeAnalysis {
    pub fn new() -> TypeAnalysis {
        TypeAnalysis::default()
    }

    /// Analyze `func` under `info`, reusing a cached result when the same
    /// fingerprint was analyzed before. The function is never modified.
    pub fn analyze(
        &mut self,
        registry: &FunctionRegistry,
        func: &Function,
        info: FnTypeInfo,
    ) -> Result<Rc<TypeResults>, TypeError> {
        let key = FnTypeKey { name: func.name.clone(), info };
        if let Some(cached) = self.cache.get(&key) {
            log::trace!("type analysis cache hit for %{}", key.name);
            return Ok(cached.clone());
        }
        if self.in_progress.contains(&key) {
            // A recursive request resolves to the seed classification; the
            // outer analysis continues to refine from there.
            return Ok(Rc::new(TypeAnalyzer::seed_only(func, &key.info)));
        }

        self.in_progress.insert(key.clone());
        let res = TypeAnalyzer::new(func, registry, self, &key.info).run();
        self.in_progress.remove(&key);

        let res = Rc::new(res?);
        self.cache.insert(key, res.clone());
        Ok(res)
    }
}
