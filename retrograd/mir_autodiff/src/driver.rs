//! The IR-level driver.
//!
//! A call to a signature named `autodiff.<target>` marks a request to
//! differentiate `%target`: plain arguments are active scalars, a
//! pointer-classified parameter consumes two consecutive call arguments
//! (primal and shadow), and the trailing argument is the incoming adjoint
//! of the result. The call is replaced in place by a call to the
//! synthesized gradient.
//!
//! The source system tags overrides as metadata strings on the intrinsic
//! arguments; this IR has no string operands, so overrides arrive as an
//! explicit per-parameter list instead.

use mir::{Function, FunctionSignature, InstructionData, Param};
use mir_ty::{ConcreteType, FnTypeInfo, TypeTree};

use crate::{create_primal_and_gradient, ArgActivity, AutodiffCtx, AutodiffError};

pub const AUTODIFF_PREFIX: &str = "autodiff.";

/// Rewrite every `autodiff.<target>` call in `func`. Returns whether any
/// call was rewritten.
pub fn rewrite_autodiff_calls(
    ctx: &mut AutodiffCtx,
    func: &mut Function,
    overrides: &[Option<ArgActivity>],
) -> Result<bool, AutodiffError> {
    let mut changed = false;

    let targets: Vec<(mir::FuncRef, String)> = func
        .dfg
        .signatures
        .iter_enumerated()
        .filter_map(|(func_ref, sig)| {
            sig.name.strip_prefix(AUTODIFF_PREFIX).map(|rest| (func_ref, rest.to_owned()))
        })
        .collect();

    for (func_ref, target) in targets {
        if target.is_empty() {
            return Err(AutodiffError::IllegalIntrinsic {
                reason: "autodiff intrinsic names no target".to_owned(),
            });
        }

        let acts = classify_target(ctx, &target, overrides)?;
        let num_dup = acts.iter().filter(|a| **a == ArgActivity::Dup).count();
        let num_active = acts.iter().filter(|a| **a == ArgActivity::Active).count();
        let expected_args = acts.len() + num_dup + 1;

        // Every call through this signature must pass primal+shadow pairs
        // plus the seed.
        let sig = &func.dfg.signatures[func_ref];
        if sig.params as usize != expected_args {
            return Err(AutodiffError::IllegalIntrinsic {
                reason: format!(
                    "autodiff.{target} takes {} arguments ({} parameters, {} shadows, 1 seed), \
                     declared with {}",
                    expected_args,
                    acts.len(),
                    num_dup,
                    sig.params
                ),
            });
        }

        let grad_name = create_primal_and_gradient(ctx, &target, &acts, false, true, true, false)?;

        // Point the signature at the synthesized gradient; the argument
        // list of the intrinsic already matches its parameter order.
        func.dfg.signatures[func_ref] = FunctionSignature {
            name: grad_name,
            params: expected_args as u16,
            returns: num_active as u16,
            has_sideeffects: true,
        };
        changed = true;
    }

    // Every rewritten call keeps its operands; double check the arity of
    // the call sites while we are here.
    if changed {
        for block in func.layout.blocks().collect::<Vec<_>>() {
            for inst in func.layout.block_insts(block).collect::<Vec<_>>() {
                if let InstructionData::Call { func_ref, args } = func.dfg.insts[inst].clone() {
                    let sig = &func.dfg.signatures[func_ref];
                    let arity = args.as_slice(&func.dfg.insts.pools.value_lists).len();
                    if sig.name.ends_with(".grad") && arity != sig.params as usize {
                        return Err(AutodiffError::IllegalIntrinsic {
                            reason: format!(
                                "call to %{} passes {arity} arguments, expected {}",
                                sig.name, sig.params
                            ),
                        });
                    }
                }
            }
        }
    }

    Ok(changed)
}

/// Default classification of the target's parameters: what the type
/// analysis of the target says, with per-parameter overrides on top.
fn classify_target(
    ctx: &mut AutodiffCtx,
    target: &str,
    overrides: &[Option<ArgActivity>],
) -> Result<Vec<ArgActivity>, AutodiffError> {
    let target_fn = ctx.function(target)?.clone();
    let num_params = target_fn
        .dfg
        .values()
        .filter(|val| matches!(target_fn.dfg.value_def(*val), mir::ValueDef::Param(_)))
        .count();

    let info = FnTypeInfo::new(vec![TypeTree::new(); num_params]);
    let types = ctx.types.analyze(&ctx.registry, &target_fn, info)?;

    let acts = (0..num_params)
        .map(|i| {
            if let Some(Some(forced)) = overrides.get(i) {
                return *forced;
            }
            match types.param_tree(Param::from(i)).data0() {
                ConcreteType::Pointer => ArgActivity::Dup,
                ConcreteType::Integer => ArgActivity::Const,
                // scalars default to active
                _ => ArgActivity::Active,
            }
        })
        .collect();
    Ok(acts)
}
