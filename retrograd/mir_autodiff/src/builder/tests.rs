use float_cmp::assert_approx_eq;
use mir::FunctionRegistry;
use mir_interpret::{Data, Interpreter};
use mir_reader::parse_function;

use super::*;
use crate::ArgActivity::Active;

fn ctx_of(src: &str) -> AutodiffCtx {
    let func = parse_function(src).unwrap();
    let mut registry = FunctionRegistry::default();
    registry.insert(func.name.clone(), func);
    AutodiffCtx::new(registry)
}

fn count_calls(func: &Function, callee: &str) -> usize {
    func.layout
        .blocks()
        .flat_map(|block| func.layout.block_insts(block))
        .filter(|inst| func.dfg.call_signature(*inst).map_or(false, |sig| sig.name == callee))
        .count()
}

/// The synthesized gradient of `x*x`, start to finish: signature shape,
/// structure of the reverse part, and the numbers it produces.
#[test]
fn gradient_shape_of_square() {
    let mut ctx = ctx_of(
        r#"
        function %square(v10) {
        block0:
            v11 = fmul v10, v10
            ret v11
        }"#,
    );
    let name =
        create_primal_and_gradient(&mut ctx, "square", &[Active], true, true, true, false).unwrap();
    let func = &ctx.registry[name.as_str()];

    // (x, seed) in, (primal, dx) out
    let num_params = func
        .dfg
        .values()
        .filter(|val| matches!(func.dfg.value_def(*val), mir::ValueDef::Param(_)))
        .count();
    assert_eq!(num_params, 2);

    let printed = func.to_debug_string();
    // one adjoint cell, zero-initialized in the allocations block
    assert!(printed.contains("alloca"), "{printed}");
    // the pullback of fmul multiplies the seed with the primal operand
    assert!(printed.contains("fmul"), "{printed}");
    // the reverse entry returns both the primal result and the adjoint
    let last_line = printed.lines().rev().find(|l| !l.trim().is_empty() && *l != "}").unwrap();
    assert!(last_line.trim_start().starts_with("ret "), "{printed}");

    let mut interp = Interpreter::new(&ctx.registry);
    let res = interp.run(func, &Data::from_f64_slice(&[4.0, 1.0]));
    assert_approx_eq!(f64, res[0].f64(), 16.0);
    assert_approx_eq!(f64, res[1].f64(), 8.0);
}

/// The tape of a loop gradient is written once per iteration and read back
/// in last-in-first-out order by the reverse sweep.
#[test]
fn loop_tape_round_trip() {
    let mut ctx = ctx_of(
        r#"
        function %f(v10, v11) {
            v12 = iconst 4
        block0:
            jmp block1

        block1:
            v13 = phi [v7, block0], [v14, block2]
            v15 = ilt v13, v12
            br v15, block2, block3

        block2:
            v16 = load v10
            v17 = fmul v16, v11
            store v17, v10
            v14 = iadd v13, v8
            jmp block1

        block3:
            v18 = load v10
            ret v18
        }"#,
    );
    let name = create_primal_and_gradient(
        &mut ctx,
        "f",
        &[crate::ArgActivity::Dup, Active],
        true,
        true,
        true,
        false,
    )
    .unwrap();
    let func = &ctx.registry[name.as_str()];
    let printed = func.to_debug_string();

    // The loop-cached load lives in a malloc'd array indexed by the
    // induction variable, and the array is released on the way back:
    // exactly one malloc paired with exactly one free.
    assert_eq!(count_calls(func, "malloc"), 1, "{printed}");
    assert_eq!(count_calls(func, "free"), 1, "{printed}");

    // index scaling on both sides: a store in the loop body and a load in
    // its twin
    assert!(printed.contains("imul"), "{printed}");
}

/// The reverse control flow of a diamond reuses the primal branch
/// condition as its pivot instead of fabricating a tag phi.
#[test]
fn diamond_reuses_branch_condition() {
    let mut ctx = ctx_of(
        r#"
        function %f(v10) {
        block0:
            v11 = flt v10, v3
            br v11, block1, block2

        block1:
            v12 = fneg v10
            jmp block3

        block2:
            jmp block3

        block3:
            v13 = phi [v12, block1], [v10, block2]
            ret v13
        }"#,
    );
    let name = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap();
    let func = &ctx.registry[name.as_str()];

    // No bool tag phi was inserted into the primal join: the only phi of
    // the whole function is the primal's own.
    let num_phis = func
        .dfg
        .insts
        .iter()
        .filter(|inst| {
            func.layout.inst_block(*inst).is_some() && func.dfg.insts[*inst].is_phi()
        })
        .count();
    assert_eq!(num_phis, 1);
}
