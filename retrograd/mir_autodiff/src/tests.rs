use float_cmp::assert_approx_eq;
use mir::FunctionRegistry;
use mir_interpret::{Data, Interpreter};
use mir_reader::parse_functions;

use super::*;
use crate::activity::ArgActivity::{Active, Dup};

fn ctx_with(src: &str) -> AutodiffCtx {
    let funcs = parse_functions(src).unwrap();
    let mut registry = FunctionRegistry::default();
    for func in funcs {
        registry.insert(func.name.clone(), func);
    }
    AutodiffCtx::new(registry)
}

fn run(ctx: &AutodiffCtx, name: &str, args: &[f64]) -> Vec<f64> {
    let func = &ctx.registry[name];
    let mut interp = Interpreter::new(&ctx.registry);
    interp.run(func, &Data::from_f64_slice(args)).iter().map(|data| data.f64()).collect()
}

fn count_calls(func: &mir::Function, callee: &str) -> usize {
    func.layout
        .blocks()
        .flat_map(|block| func.layout.block_insts(block))
        .filter(|inst| func.dfg.call_signature(*inst).map_or(false, |sig| sig.name == callee))
        .count()
}

#[test]
fn square() {
    let mut ctx = ctx_with(
        r#"
        function %square(v10) {
        block0:
            v11 = fmul v10, v10
            ret v11
        }"#,
    );
    let grad = create_primal_and_gradient(&mut ctx, "square", &[Active], true, true, true, false).unwrap();
    assert_eq!(grad, "square.grad");

    let res = run(&ctx, &grad, &[3.0, 1.0]);
    assert_approx_eq!(f64, res[0], 9.0);
    assert_approx_eq!(f64, res[1], 6.0);

    // the incoming adjoint scales the gradient
    let res = run(&ctx, &grad, &[3.0, 2.0]);
    assert_approx_eq!(f64, res[1], 12.0);
}

#[test]
fn sin_plus_square() {
    let mut ctx = ctx_with(
        r#"
        function %f(v10, v11) {
        block0:
            v12 = sin v10
            v13 = fmul v11, v11
            v14 = fadd v12, v13
            ret v14
        }"#,
    );
    let grad =
        create_primal_and_gradient(&mut ctx, "f", &[Active, Active], true, true, true, false).unwrap();

    let res = run(&ctx, &grad, &[0.0, 2.0, 1.0]);
    assert_approx_eq!(f64, res[0], 4.0);
    assert_approx_eq!(f64, res[1], 1.0); // cos 0
    assert_approx_eq!(f64, res[2], 4.0); // 2y
}

#[test]
fn unary_chain() {
    // d/dx exp(sin x) at x=0.5
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
        block0:
            v11 = sin v10
            v12 = exp v11
            ret v12
        }"#,
    );
    let grad = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap();
    let x = 0.5f64;
    let res = run(&ctx, &grad, &[x, 1.0]);
    assert_approx_eq!(f64, res[0], x.sin().exp());
    assert_approx_eq!(f64, res[1], x.sin().exp() * x.cos(), epsilon = 1e-12);
}

#[test]
fn division_and_sqrt() {
    // f = sqrt(a) / b
    let mut ctx = ctx_with(
        r#"
        function %f(v10, v11) {
        block0:
            v12 = sqrt v10
            v13 = fdiv v12, v11
            ret v13
        }"#,
    );
    let grad =
        create_primal_and_gradient(&mut ctx, "f", &[Active, Active], true, true, true, false).unwrap();
    let (a, b) = (4.0f64, 2.0f64);
    let res = run(&ctx, &grad, &[a, b, 1.0]);
    assert_approx_eq!(f64, res[0], 1.0);
    assert_approx_eq!(f64, res[1], 1.0 / (2.0 * a.sqrt() * b), epsilon = 1e-12);
    assert_approx_eq!(f64, res[2], -a.sqrt() / (b * b), epsilon = 1e-12);
}

#[test]
fn duplicated_pointer() {
    // f(p) = p[0] * p[0]; the derivative lands in the shadow.
    let mut ctx = ctx_with(
        r#"
        function %sq_ptr(v10) {
        block0:
            v11 = load v10
            v12 = fmul v11, v11
            ret v12
        }

        function %harness(v10) {
            fn0 = fn %sq_ptr.grad(3) -> 1
            v11 = iconst 8
        block0:
            v12 = alloca v11
            store v10, v12
            v13 = alloca v11
            v14 = fconst 0.0
            store v14, v13
            v15 = call fn0 (v12, v13, v4)
            v16 = load v13
            ret v15, v16
        }"#,
    );
    let grad = create_primal_and_gradient(&mut ctx, "sq_ptr", &[Dup], true, true, true, false).unwrap();
    assert_eq!(grad, "sq_ptr.grad");

    let res = run(&ctx, "harness", &[3.0]);
    assert_approx_eq!(f64, res[0], 9.0);
    // p_shadow[0] == 2 * p[0]
    assert_approx_eq!(f64, res[1], 6.0);
}

#[test]
fn loop_sum() {
    // f(x) = sum x*i for i in 0..10; df/dx = 45
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
            v11 = iconst 10
        block0:
            jmp block1

        block1:
            v12 = phi [v7, block0], [v16, block2]
            v13 = phi [v3, block0], [v17, block2]
            v14 = ilt v12, v11
            br v14, block2, block3

        block2:
            v15 = ifcast v12
            v18 = fmul v15, v10
            v17 = fadd v13, v18
            v16 = iadd v12, v8
            jmp block1

        block3:
            ret v13
        }"#,
    );
    let grad = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap();
    let res = run(&ctx, &grad, &[2.0, 1.0]);
    assert_approx_eq!(f64, res[0], 90.0);
    assert_approx_eq!(f64, res[1], 45.0);
}

#[test]
fn nested_call() {
    // h(x) = f(x) + f(x) with f(x) = x*x: dh/dx = 4x
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
        block0:
            v11 = fmul v10, v10
            ret v11
        }

        function %h(v10) {
            fn0 = const fn %f(1) -> 1
        block0:
            v11 = call fn0 (v10)
            v12 = call fn0 (v10)
            v13 = fadd v11, v12
            ret v13
        }"#,
    );
    let grad = create_primal_and_gradient(&mut ctx, "h", &[Active], true, true, true, false).unwrap();
    let res = run(&ctx, &grad, &[3.0, 1.0]);
    assert_approx_eq!(f64, res[0], 18.0);
    assert_approx_eq!(f64, res[1], 12.0);

    // the inner gradient was synthesized and cached under its own name
    assert!(ctx.registry.contains_key("f.grad"));
}

#[test]
fn branch_on_sign() {
    // f(x) = x < 0 ? -x : x
    let mut ctx = ctx_with(
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
    let grad = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap();

    let res = run(&ctx, &grad, &[-2.0, 1.0]);
    assert_approx_eq!(f64, res[0], 2.0);
    assert_approx_eq!(f64, res[1], -1.0);

    let res = run(&ctx, &grad, &[2.0, 1.0]);
    assert_approx_eq!(f64, res[0], 2.0);
    assert_approx_eq!(f64, res[1], 1.0);
}

#[test]
fn select_gradient() {
    // f(x, y) = max-like select(x > y, x*x, y*3)
    let mut ctx = ctx_with(
        r#"
        function %f(v10, v11) {
            v14 = fconst 0x1.8000000000000p1
        block0:
            v12 = fgt v10, v11
            v15 = fmul v10, v10
            v16 = fmul v11, v14
            v17 = select v12, v15, v16
            ret v17
        }"#,
    );
    let grad =
        create_primal_and_gradient(&mut ctx, "f", &[Active, Active], true, true, true, false).unwrap();

    let res = run(&ctx, &grad, &[4.0, 1.0, 1.0]);
    assert_approx_eq!(f64, res[0], 16.0);
    assert_approx_eq!(f64, res[1], 8.0);
    assert_approx_eq!(f64, res[2], 0.0);

    let res = run(&ctx, &grad, &[1.0, 4.0, 1.0]);
    assert_approx_eq!(f64, res[0], 12.0);
    assert_approx_eq!(f64, res[1], 0.0);
    assert_approx_eq!(f64, res[2], 3.0);
}

#[test]
fn dynamic_loop() {
    // while (acc < 10) acc += x; for x=3 that is 4 iterations
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
            v11 = fconst 0x1.4000000000000p3
        block0:
            jmp block1

        block1:
            v12 = phi [v3, block0], [v13, block2]
            v14 = flt v12, v11
            br v14, block2, block3

        block2:
            v13 = fadd v12, v10
            jmp block1

        block3:
            ret v12
        }"#,
    );
    let grad = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap();
    let res = run(&ctx, &grad, &[3.0, 1.0]);
    assert_approx_eq!(f64, res[0], 12.0);
    assert_approx_eq!(f64, res[1], 4.0);
}

#[test]
fn loop_with_memory_tape() {
    // p[0] starts at v, then p[0] *= x four times; the loads of each
    // iteration live on the tape as a per-loop array.
    let mut ctx = ctx_with(
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
        }

        function %harness(v10, v11) {
            fn0 = fn %f.grad(4) -> 2
            v12 = iconst 8
        block0:
            v13 = alloca v12
            store v10, v13
            v14 = alloca v12
            store v3, v14
            v15, v16 = call fn0 (v13, v14, v11, v4)
            v17 = load v14
            ret v15, v16, v17
        }"#,
    );
    let grad =
        create_primal_and_gradient(&mut ctx, "f", &[Dup, Active], true, true, true, false).unwrap();
    assert_eq!(grad, "f.grad");

    let (v0, x) = (2.0f64, 3.0f64);
    let res = run(&ctx, "harness", &[v0, x]);
    // primal: v0 * x^4
    assert_approx_eq!(f64, res[0], v0 * x.powi(4));
    // d/dx = 4 v0 x^3
    assert_approx_eq!(f64, res[1], 4.0 * v0 * x.powi(3));
    // shadow: d/dp0 = x^4
    assert_approx_eq!(f64, res[2], x.powi(4));
}

#[test]
fn three_way_join() {
    let mut ctx = ctx_with(
        r#"
        function %f(v10, v11) {
            v12 = iconst 2
            v13 = fconst 0x1.0000000000000p1
            v14 = fconst 0x1.8000000000000p1
            v15 = fconst 0x1.4000000000000p2
        block0:
            v16 = ilt v11, v8
            br v16, block1, block4

        block4:
            v17 = ilt v11, v12
            br v17, block2, block3

        block1:
            v18 = fmul v10, v13
            jmp block5

        block2:
            v19 = fmul v10, v14
            jmp block5

        block3:
            v20 = fmul v10, v15
            jmp block5

        block5:
            v21 = phi [v18, block1], [v19, block2], [v20, block3]
            ret v21
        }"#,
    );
    let grad = create_primal_and_gradient(
        &mut ctx,
        "f",
        &[Active, ArgActivity::Const],
        true,
        true,
        true,
        false,
    )
    .unwrap();

    for (sel, slope) in [(0.0, 2.0), (1.0, 3.0), (2.0, 5.0)] {
        let res = run(&ctx, &grad, &[7.0, sel, 1.0]);
        assert_approx_eq!(f64, res[0], 7.0 * slope);
        assert_approx_eq!(f64, res[1], slope, epsilon = 1e-12);
    }
}

#[test]
fn heap_allocation_shadow() {
    // f(x): p = malloc(8); p[0] = x*x; return p[0] * x
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
            fn0 = fn %malloc(1) -> 1
            v11 = iconst 8
        block0:
            v12 = call fn0 (v11)
            v13 = fmul v10, v10
            store v13, v12
            v14 = load v12
            v15 = fmul v14, v10
            ret v15
        }"#,
    );
    let grad = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap();
    let res = run(&ctx, &grad, &[3.0, 1.0]);
    assert_approx_eq!(f64, res[0], 27.0);
    assert_approx_eq!(f64, res[1], 27.0); // 3 x^2

    // every allocation of the gradient is released exactly once
    let func = &ctx.registry[grad.as_str()];
    let (mut mallocs, mut frees) = (0usize, 0usize);
    for block in func.layout.blocks() {
        for inst in func.layout.block_insts(block) {
            if let Some(sig) = func.dfg.call_signature(inst) {
                match sig.name.as_str() {
                    "malloc" => mallocs += 1,
                    "free" => frees += 1,
                    _ => (),
                }
            }
        }
    }
    assert_eq!(mallocs, frees, "{mallocs} allocations vs {frees} frees");
}

#[test]
fn reverse_cfg_mirrors_primal_edges() {
    let mut ctx = ctx_with(
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
    let grad = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap();
    let func = &ctx.registry[grad.as_str()];
    let cfg = mir::ControlFlowGraph::with_function(func);

    // For every primal edge P -> S there is a reverse edge S' -> P'. The
    // primal part of the gradient occupies the low block numbers and the
    // twins were fabricated in reverse layout order behind it, so the edge
    // count doubles (plus the entry jump and the hand-off edge).
    let num_edges: usize =
        func.layout.blocks().map(|block| cfg.succ_iter(block).count()).sum();
    // 4 primal edges + alloc->entry + exit->exit' + 4 mirrored edges
    assert_eq!(num_edges, 10);
}

#[test]
fn recursion_is_fatal() {
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
            fn0 = const fn %f(1) -> 1
        block0:
            v11 = call fn0 (v10)
            v12 = fmul v11, v10
            ret v12
        }"#,
    );
    let err = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap_err();
    assert!(matches!(err, AutodiffError::RecursiveCall { .. }), "{err}");
}

#[test]
fn unknown_callee_is_fatal() {
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
            fn0 = fn %mystery(1) -> 1
        block0:
            v11 = call fn0 (v10)
            ret v11
        }"#,
    );
    let err = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap_err();
    assert!(matches!(err, AutodiffError::UnknownCallee { .. }), "{err}");
}

#[test]
fn multiple_live_exits_are_fatal() {
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
            v11 = iconst 10
        block0:
            jmp block1

        block1:
            v12 = phi [v7, block0], [v13, block3]
            v14 = ilt v12, v11
            br v14, block2, block4

        block2:
            v15 = ilt v12, v8
            br v15, block3, block5

        block3:
            v13 = iadd v12, v8
            jmp block1

        block4:
            ret v10

        block5:
            ret v10
        }"#,
    );
    let err = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false).unwrap_err();
    assert!(matches!(err, AutodiffError::MultipleLiveExits { .. }), "{err}");
}

#[test]
fn augmented_primal_matches_primal() {
    let mut ctx = ctx_with(
        r#"
        function %store_sq(v10, v11) {
        block0:
            v12 = fmul v11, v11
            store v12, v10
            ret
        }

        function %harness(v10) {
            fn0 = fn %store_sq.aug(3)
            v11 = iconst 8
        block0:
            v12 = alloca v11
            v13 = alloca v11
            store v3, v13
            call fn0 (v12, v13, v10)
            v14 = load v12
            ret v14
        }"#,
    );
    let aug = create_augmented_primal(&mut ctx, "store_sq", &[Dup, Active], false).unwrap();
    assert_eq!(aug, "store_sq.aug");

    let res = run(&ctx, "harness", &[5.0]);
    assert_approx_eq!(f64, res[0], 25.0);
}

#[test]
fn driver_rewrites_intrinsic_calls() {
    let mut ctx = ctx_with(
        r#"
        function %square(v10) {
        block0:
            v11 = fmul v10, v10
            ret v11
        }

        function %main(v10) {
            fn0 = fn %autodiff.square(2) -> 1
        block0:
            v11 = call fn0 (v10, v4)
            ret v11
        }"#,
    );
    let mut main = ctx.registry.get("main").unwrap().clone();
    let changed = rewrite_autodiff_calls(&mut ctx, &mut main, &[]).unwrap();
    assert!(changed);
    ctx.registry.insert("main".to_owned(), main);

    let res = run(&ctx, "main", &[5.0]);
    assert_approx_eq!(f64, res[0], 10.0);
}

#[test]
fn driver_rejects_wrong_arity() {
    let mut ctx = ctx_with(
        r#"
        function %square(v10) {
        block0:
            v11 = fmul v10, v10
            ret v11
        }

        function %main(v10) {
            fn0 = fn %autodiff.square(1) -> 1
        block0:
            v11 = call fn0 (v10)
            ret v11
        }"#,
    );
    let mut main = ctx.registry.get("main").unwrap().clone();
    let err = rewrite_autodiff_calls(&mut ctx, &mut main, &[]).unwrap_err();
    assert!(matches!(err, AutodiffError::IllegalIntrinsic { .. }), "{err}");
}

#[test]
fn nested_call_with_duplicated_pointer() {
    // The callee reads p[0], scales it and stores it back; the caller then
    // observes the updated memory, so the primal call must go through the
    // augmented primal and the inner gradient must see the pre-store value
    // through the tape.
    let mut ctx = ctx_with(
        r#"
        function %inner(v10, v11) {
        block0:
            v12 = load v10
            v13 = fmul v12, v11
            store v13, v10
            ret v13
        }

        function %outer(v10, v11) {
            fn0 = fn %inner(2) -> 1
        block0:
            v12 = call fn0 (v10, v11)
            v13 = load v10
            v14 = fmul v12, v13
            ret v14
        }

        function %harness(v10, v11) {
            fn0 = fn %outer.grad(4) -> 2
            v12 = iconst 8
        block0:
            v13 = alloca v12
            store v10, v13
            v14 = alloca v12
            store v3, v14
            v15, v16 = call fn0 (v13, v14, v11, v4)
            v17 = load v14
            ret v15, v16, v17
        }"#,
    );
    let grad =
        create_primal_and_gradient(&mut ctx, "outer", &[Dup, Active], true, true, true, false)
            .unwrap();
    assert_eq!(grad, "outer.grad");

    // the primal site was retargeted at the augmented primal
    assert!(ctx.registry.contains_key("inner.aug"));
    let func = &ctx.registry[grad.as_str()];
    assert_eq!(count_calls(func, "inner.aug"), 1);
    assert_eq!(count_calls(func, "inner"), 0);

    // r = (a*x) * (a*x): dr/dx = 2a^2 x, dr/dp0 = 2a x^2
    let (a, x) = (2.0f64, 3.0f64);
    let res = run(&ctx, "harness", &[a, x]);
    assert_approx_eq!(f64, res[0], a * a * x * x);
    assert_approx_eq!(f64, res[1], 2.0 * a * a * x, epsilon = 1e-12);
    assert_approx_eq!(f64, res[2], 2.0 * a * x * x, epsilon = 1e-12);
}

#[test]
fn nested_call_with_internal_allocation() {
    // A side-effecting callee that stashes x*x in heap memory: the call is
    // differentiated through the augmented pair, and the recomputed
    // allocation inside the inner gradient is released together with its
    // shadow.
    let mut ctx = ctx_with(
        r#"
        function %stash(v10) {
            fn0 = fn %malloc(1) -> 1
            v11 = iconst 8
        block0:
            v12 = call fn0 (v11)
            v13 = fmul v10, v10
            store v13, v12
            v14 = load v12
            v15 = fmul v14, v10
            ret v15
        }

        function %outer(v10) {
            fn0 = fn %stash(1) -> 1
        block0:
            v11 = call fn0 (v10)
            ret v11
        }"#,
    );
    let grad =
        create_primal_and_gradient(&mut ctx, "outer", &[Active], true, true, true, false).unwrap();

    assert!(ctx.registry.contains_key("stash.aug"));
    let inner_grad = &ctx.registry["stash.grad"];
    // the recomputed primal allocation and its shadow, both released
    assert_eq!(count_calls(inner_grad, "malloc"), 2);
    assert_eq!(count_calls(inner_grad, "free"), 2);

    // f = x^3: df/dx = 3x^2
    let res = run(&ctx, &grad, &[3.0, 1.0]);
    assert_approx_eq!(f64, res[0], 27.0);
    assert_approx_eq!(f64, res[1], 27.0);
}

#[test]
fn replace_function_fast_path() {
    // The callee only writes through its duplicated pointer and carries no
    // tape; with nothing after the call observing its effects, the plain
    // primal call plus one reverse gradient call stands in for the
    // augmented pair.
    let mut ctx = ctx_with(
        r#"
        function %writer(v10, v11) {
        block0:
            v12 = fmul v11, v11
            store v12, v10
            ret
        }

        function %outer(v10, v11) {
            fn0 = fn %writer(2)
        block0:
            call fn0 (v10, v11)
            v12 = fmul v11, v11
            ret v12
        }

        function %harness(v10, v11) {
            fn0 = fn %outer.grad(4) -> 2
            v12 = iconst 8
        block0:
            v13 = alloca v12
            store v3, v13
            v14 = alloca v12
            store v10, v14
            v15, v16 = call fn0 (v13, v14, v11, v4)
            v17 = load v14
            v18 = load v13
            ret v15, v16, v17, v18
        }"#,
    );
    let grad =
        create_primal_and_gradient(&mut ctx, "outer", &[Dup, Active], true, true, true, false)
            .unwrap();

    // the peephole kept the plain call: no augmented primal was fabricated
    assert!(!ctx.registry.contains_key("writer.aug"));
    let func = &ctx.registry[grad.as_str()];
    assert_eq!(count_calls(func, "writer"), 1);

    // r = x*x with p[0] = x*x as a side effect; an incoming shadow seed s
    // flows through the store pullback: dx = 2x + s*2x, and the shadow
    // cell is cleared by the pullback that owned it.
    let (s, x) = (0.5f64, 3.0f64);
    let res = run(&ctx, "harness", &[s, x]);
    assert_approx_eq!(f64, res[0], x * x);
    assert_approx_eq!(f64, res[1], 2.0 * x + s * 2.0 * x, epsilon = 1e-12);
    assert_approx_eq!(f64, res[2], 0.0); // shadow consumed and zeroed
    assert_approx_eq!(f64, res[3], x * x); // memory keeps the primal store
}

#[test]
fn unbounded_loop_is_fatal() {
    // dynamic loop nested inside a dynamic loop
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
            v11 = fconst 0x1.4000000000000p3
        block0:
            jmp block1

        block1:
            v12 = phi [v3, block0], [v13, block4]
            v14 = flt v12, v11
            br v14, block2, block5

        block2:
            jmp block3

        block3:
            v15 = phi [v3, block2], [v16, block3]
            v16 = fadd v15, v10
            v17 = flt v16, v11
            br v17, block3, block4

        block4:
            v13 = fadd v12, v16
            jmp block1

        block5:
            ret v12
        }"#,
    );
    let err = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false)
        .unwrap_err();
    assert!(matches!(err, AutodiffError::UnboundedLoop { .. }), "{err}");
}

#[test]
fn multiple_latches_are_fatal() {
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
        block0:
            jmp block1

        block1:
            v11 = phi [v10, block0], [v12, block2], [v13, block3]
            v14 = flt v11, v3
            br v14, block2, block4

        block2:
            v12 = fadd v11, v4
            v15 = flt v12, v3
            br v15, block1, block3

        block3:
            v13 = fadd v12, v4
            jmp block1

        block4:
            ret v11
        }"#,
    );
    let err = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false)
        .unwrap_err();
    assert!(matches!(err, AutodiffError::MultipleLatches { .. }), "{err}");
}

#[test]
fn multiple_returns_are_unhandled() {
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
        block0:
            v11 = flt v10, v3
            br v11, block1, block2

        block1:
            ret v10

        block2:
            v12 = fneg v10
            ret v12
        }"#,
    );
    let err = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false)
        .unwrap_err();
    assert!(matches!(err, AutodiffError::UnhandledInstruction { .. }), "{err}");
}

#[test]
fn verifier_rejects_malformed_phis() {
    // block2 never reaches block1, yet the phi claims an edge from it; the
    // inconsistency survives into the synthesized function and the
    // post-synthesis verification refuses it.
    let mut ctx = ctx_with(
        r#"
        function %f(v10) {
        block0:
            jmp block1

        block1:
            v11 = phi [v10, block0], [v10, block2]
            ret v11

        block2:
            unreachable
        }"#,
    );
    let err = create_primal_and_gradient(&mut ctx, "f", &[Active], true, true, true, false)
        .unwrap_err();
    assert!(matches!(err, AutodiffError::Verifier { .. }), "{err}");
}
