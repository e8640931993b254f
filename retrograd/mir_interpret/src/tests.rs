use float_cmp::assert_approx_eq;
use mir_reader::parse_function;

use super::*;

fn run(src: &str, args: &[f64]) -> Vec<Data> {
    let func = parse_function(src).unwrap();
    let registry = Registry::default();
    let mut interp = Interpreter::new(&registry);
    interp.run(&func, &Data::from_f64_slice(args))
}

#[test]
fn arithmetic_and_branches() {
    let src = r#"
        function %abs_scaled(v10, v11) {
            v3 = fconst 0.0
        block0:
            v12 = flt v10, v3
            br v12, block1, block2

        block1:
            v13 = fneg v10
            jmp block3

        block2:
            jmp block3

        block3:
            v14 = phi [v13, block1], [v10, block2]
            v15 = fmul v14, v11
            ret v15
        }"#;
    assert_approx_eq!(f64, run(src, &[-3.0, 2.0])[0].f64(), 6.0);
    assert_approx_eq!(f64, run(src, &[3.0, 2.0])[0].f64(), 6.0);
}

#[test]
fn loop_accumulation() {
    // sum of x*i for i in 0..10
    let src = r#"
        function %sum(v10) {
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
        }"#;
    assert_approx_eq!(f64, run(src, &[2.0])[0].f64(), 90.0);
}

#[test]
fn memory_roundtrip() {
    let src = r#"
        function %store_load(v10) {
            v11 = iconst 16
            v12 = iconst 8
        block0:
            v13 = alloca v11
            store v10, v13
            v14 = padd v13, v12
            store v10, v14
            v15 = load v13
            v16 = load v14
            v17 = fadd v15, v16
            ret v17
        }"#;
    assert_approx_eq!(f64, run(src, &[4.5])[0].f64(), 9.0);
}

#[test]
fn malloc_memcpy_free() {
    let src = r#"
        function %copy(v10) {
            fn0 = fn %malloc(1) -> 1
            fn1 = fn %free(1) -> 0
            v11 = iconst 8
        block0:
            v12 = call fn0 (v11)
            v13 = call fn0 (v11)
            store v10, v12
            memcpy v13, v12, v11
            v14 = load v13
            call fn1 (v12)
            call fn1 (v13)
            ret v14
        }"#;
    assert_approx_eq!(f64, run(src, &[7.25])[0].f64(), 7.25);
}

#[test]
fn calls_between_functions() {
    let callee = parse_function(
        r#"
        function %sq(v10) {
        block0:
            v11 = fmul v10, v10
            ret v11
        }"#,
    )
    .unwrap();
    let caller = parse_function(
        r#"
        function %twice_sq(v10) {
            fn0 = const fn %sq(1) -> 1
        block0:
            v11 = call fn0 (v10)
            v12 = call fn0 (v10)
            v13 = fadd v11, v12
            ret v13
        }"#,
    )
    .unwrap();

    let mut registry = Registry::default();
    registry.insert("sq".to_owned(), callee);
    let mut interp = Interpreter::new(&registry);
    let res = interp.run(&caller, &[Data::from(3.0)]);
    assert_approx_eq!(f64, res[0].f64(), 18.0);
}

#[test]
fn select_and_casts() {
    let src = r#"
        function %sel(v10, v11) {
        block0:
            v12 = fgt v10, v11
            v13 = select v12, v10, v11
            v14 = ficast v13
            v15 = ifcast v14
            ret v15
        }"#;
    assert_approx_eq!(f64, run(src, &[1.5, 7.0])[0].f64(), 7.0);
}
