use mir::FunctionRegistry;
use mir_reader::parse_function;

use super::*;
use crate::{FnTypeInfo, TypeAnalysis};

fn analyze(src: &str, info: FnTypeInfo) -> std::rc::Rc<crate::TypeResults> {
    let func = parse_function(src).unwrap();
    let registry = FunctionRegistry::default();
    TypeAnalysis::new().analyze(&registry, &func, info).unwrap()
}

fn v(n: u32) -> Value {
    Value::from(n)
}

#[test]
fn constants_classify_by_value() {
    let src = r#"
        function %consts() {
            v10 = iconst 42
            v11 = iconst 0
            v12 = iconst 9999
            v13 = fconst 0x1.8000000000000p1
            v14 = fconst 0.0
        block0:
            v20 = optbarrier v10
            v21 = optbarrier v11
            v22 = optbarrier v12
            v23 = optbarrier v13
            v24 = optbarrier v14
            v25 = optbarrier v1
            ret
        }"#;
    let res = analyze(src, FnTypeInfo::default());
    assert_eq!(res.query(v(10)).data0(), ConcreteType::Integer);
    assert_eq!(res.query(v(11)).data0(), ConcreteType::Anything);
    assert_eq!(res.query(v(12)).data0(), ConcreteType::Anything);
    assert_eq!(res.query(v(13)).data0(), ConcreteType::DOUBLE);
    assert_eq!(res.query(v(14)).data0(), ConcreteType::Anything);
    // bool false: the one-byte zero is a sentinel, not a null
    assert_eq!(res.query(mir::consts::FALSE).data0(), ConcreteType::Integer);
}

#[test]
fn float_ops_propagate_both_ways() {
    let src = r#"
        function %f(v10, v11) {
        block0:
            v12 = fmul v10, v11
            v13 = sqrt v12
            ret v13
        }"#;
    let res = analyze(src, FnTypeInfo::new(vec![TypeTree::new(), TypeTree::new()]));
    // nothing was seeded: the opcodes alone classify params and result
    assert_eq!(res.query(v(10)).data0(), ConcreteType::DOUBLE);
    assert_eq!(res.query(v(11)).data0(), ConcreteType::DOUBLE);
    assert_eq!(res.query(v(13)).data0(), ConcreteType::DOUBLE);
    assert_eq!(res.return_trees()[0].data0(), ConcreteType::DOUBLE);
}

#[test]
fn memory_types_flow_through_pointers() {
    let src = r#"
        function %mem(v10, v11) {
            v12 = iconst 8
        block0:
            store v11, v10
            v13 = padd v10, v12
            v14 = load v13
            v15 = fadd v14, v14
            v16 = load v10
            ret v16
        }"#;
    let info = FnTypeInfo::new(vec![TypeTree::new(), TypeTree::scalar(ConcreteType::DOUBLE)]);
    let res = analyze(src, info);

    // v10 is a pointer; slot 0 holds the stored double, slot 8 holds
    // whatever v14 is (a double, via the fadd).
    let p = res.query(v(10));
    assert_eq!(p.data0(), ConcreteType::Pointer);
    assert_eq!(p.at_offset(0), ConcreteType::DOUBLE);
    assert_eq!(p.at_offset(8), ConcreteType::DOUBLE);
    assert_eq!(res.query(v(14)).data0(), ConcreteType::DOUBLE);
    // the load of slot 0 recovers the stored classification
    assert_eq!(res.query(v(16)).data0(), ConcreteType::DOUBLE);
    assert_eq!(
        res.first_pointer(16, v(10), true, false).unwrap(),
        ConcreteType::DOUBLE
    );
}

#[test]
fn alloca_and_integer_offsets() {
    let src = r#"
        function %stack(v10) {
            v11 = iconst 16
            v12 = iconst 8
        block0:
            v13 = alloca v11
            store v10, v13
            v14 = padd v13, v12
            v15 = iconst 3
            store v15, v14
            v16 = load v14
            ret v16
        }"#;
    let info = FnTypeInfo::new(vec![TypeTree::scalar(ConcreteType::DOUBLE)]);
    let res = analyze(src, info);
    let cell = res.query(v(13));
    assert_eq!(cell.data0(), ConcreteType::Pointer);
    assert_eq!(cell.at_offset(0), ConcreteType::DOUBLE);
    assert_eq!(cell.at_offset(8), ConcreteType::Integer);
    assert_eq!(res.query(v(16)).data0(), ConcreteType::Integer);
    assert_eq!(res.known_integral_values(v(12)), Some(&[8i64][..]));
}

#[test]
fn phi_meets_incoming() {
    let src = r#"
        function %sel(v10, v11, v12) {
        block0:
            br v12, block1, block2

        block1:
            jmp block3

        block2:
            jmp block3

        block3:
            v13 = phi [v10, block1], [v11, block2]
            v14 = fadd v13, v13
            ret v14
        }"#;
    let info = FnTypeInfo::new(vec![
        TypeTree::scalar(ConcreteType::DOUBLE),
        TypeTree::new(),
        TypeTree::new(),
    ]);
    let res = analyze(src, info);
    assert_eq!(res.query(v(13)).data0(), ConcreteType::DOUBLE);
    // the branch condition is observed as an integer
    assert_eq!(res.query(v(12)).data0(), ConcreteType::Integer);
    // the fadd forces the other incoming value
    assert_eq!(res.query(v(11)).data0(), ConcreteType::DOUBLE);
}

#[test]
fn conflicting_memory_is_fatal() {
    let src = r#"
        function %bad(v10) {
        block0:
            v11 = load v10
            v12 = fadd v11, v11
            v13 = load v10
            v14 = iadd v13, v13
            v15 = ieq v14, v14
            v16 = select v15, v14, v14
            ret v16
        }"#;
    // slot 0 of v10 is demanded as both double and integer
    let func = parse_function(src).unwrap();
    let registry = FunctionRegistry::default();
    let info = FnTypeInfo::new(vec![TypeTree::pointer_to(ConcreteType::DOUBLE)]);
    let res = TypeAnalysis::new().analyze(&registry, &func, info);
    assert!(matches!(res, Err(TypeError::IllegalPointerUpdate { .. } | TypeError::TypeConflict { .. })),
        "expected a fatal conflict, got {res:?}");
}

#[test]
fn interprocedural_flows_through_calls() {
    let callee_src = r#"
        function %sink(v10) {
        block0:
            v11 = load v10
            v12 = fmul v11, v11
            ret v12
        }"#;
    let caller_src = r#"
        function %driver(v10) {
            fn0 = const fn %sink(1) -> 1
        block0:
            v11 = call fn0 (v10)
            ret v11
        }"#;

    let callee = parse_function(callee_src).unwrap();
    let caller = parse_function(caller_src).unwrap();
    let mut registry = FunctionRegistry::default();
    registry.insert("sink".to_owned(), callee);

    let mut analysis = TypeAnalysis::new();
    let res = analysis.analyze(&registry, &caller, FnTypeInfo::new(vec![TypeTree::new()])).unwrap();

    // the callee's load/fmul classify the caller's argument and result
    let arg = res.query(v(10));
    assert_eq!(arg.data0(), ConcreteType::Pointer);
    assert_eq!(arg.at_offset(0), ConcreteType::DOUBLE);
    assert_eq!(res.query(v(11)).data0(), ConcreteType::DOUBLE);
}

#[test]
fn analysis_is_idempotent_and_cached() {
    let src = r#"
        function %f(v10) {
        block0:
            v11 = exp v10
            ret v11
        }"#;
    let func = parse_function(src).unwrap();
    let registry = FunctionRegistry::default();
    let mut analysis = TypeAnalysis::new();

    let printed = func.to_debug_string();
    let info = FnTypeInfo::new(vec![TypeTree::new()]);
    let first = analysis.analyze(&registry, &func, info.clone()).unwrap();
    let second = analysis.analyze(&registry, &func, info).unwrap();

    // same fingerprint: the cached result is returned and equal
    assert!(std::rc::Rc::ptr_eq(&first, &second));
    assert_eq!(*first, *second);
    // the function itself is untouched
    assert_eq!(printed, func.to_debug_string());
}

#[test]
fn unused_values_close_over_their_observers() {
    let src = r#"
        function %closure(v10, v11) {
        block0:
            v12 = iadd v10, v8
            v13 = optbarrier v11
            ret v12
        }"#;
    let res = analyze(src, FnTypeInfo::new(vec![TypeTree::new(), TypeTree::new()]));
    // v10 is only ever observed by integer arithmetic
    assert_eq!(res.query(v(10)).data0(), ConcreteType::Integer);
    // v11 flows into an optbarrier nobody reads: no observation at all
    assert_eq!(res.query(v(11)).data0(), ConcreteType::Anything);
}

#[test]
fn math_table_is_recognized() {
    use crate::{math_signature, MathSig};
    assert_eq!(math_signature("sin"), Some(MathSig::F));
    assert_eq!(math_signature("sinf"), Some(MathSig::F));
    assert_eq!(math_signature("sinl"), Some(MathSig::F));
    assert_eq!(math_signature("pow"), Some(MathSig::FF));
    assert_eq!(math_signature("frexp"), Some(MathSig::FPtrI));
    assert_eq!(math_signature("modf"), Some(MathSig::FPtrF));
    assert_eq!(math_signature("ilogb"), Some(MathSig::IofF));
    assert_eq!(math_signature("fma"), Some(MathSig::FFF));
    assert_eq!(math_signature("ceil"), Some(MathSig::F));
    assert_eq!(math_signature("printf"), None);
    assert_eq!(math_signature("malloc"), None);
}
