use mir::FunctionRegistry;
use mir_reader::parse_function;
use mir_ty::{FnTypeInfo, TypeAnalysis, TypeTree};

use super::*;

fn analyze(src: &str, args: &[ArgActivity], differential_return: bool) -> (mir::Function, Activity) {
    let func = parse_function(src).unwrap();
    let registry = FunctionRegistry::default();
    let seeds = args
        .iter()
        .map(|activity| match activity {
            ArgActivity::Active => TypeTree::scalar(mir_ty::ConcreteType::DOUBLE),
            ArgActivity::Dup => TypeTree::scalar(mir_ty::ConcreteType::Pointer),
            ArgActivity::Const => TypeTree::new(),
        })
        .collect();
    let types =
        TypeAnalysis::new().analyze(&registry, &func, FnTypeInfo::new(seeds)).unwrap();
    let activity = Activity::build(&func, &types, args, differential_return, false);
    (func, activity)
}

fn v(n: u32) -> Value {
    Value::from(n)
}

#[test]
fn scalar_chain_is_active() {
    let (_, activity) = analyze(
        r#"
        function %f(v10) {
        block0:
            v11 = fmul v10, v10
            v12 = exp v11
            ret v12
        }"#,
        &[ArgActivity::Active],
        true,
    );
    assert!(activity.is_active(v(10)));
    assert!(activity.is_active(v(11)));
    assert!(activity.is_active(v(12)));
}

#[test]
fn integer_traffic_is_constant() {
    let (func, activity) = analyze(
        r#"
        function %f(v10, v11) {
        block0:
            v12 = iadd v11, v8
            v13 = ifcast v12
            v14 = fmul v10, v13
            ret v14
        }"#,
        &[ArgActivity::Active, ArgActivity::Const],
        true,
    );
    // the integer side never carries a derivative
    assert!(activity.is_constant_value(v(11)));
    assert!(activity.is_constant_value(v(12)));
    assert!(activity.is_constant_value(v(13)));
    // but the float product does
    assert!(activity.is_active(v(14)));
    let iadd = func.dfg.value_def(v(12)).unwrap_inst();
    assert!(activity.is_constant_inst(iadd));
}

#[test]
fn values_cut_off_from_the_return_are_constant() {
    let (_, activity) = analyze(
        r#"
        function %f(v10) {
        block0:
            v11 = fmul v10, v10
            v12 = fadd v10, v4
            ret v12
        }"#,
        &[ArgActivity::Active],
        true,
    );
    // v11 depends on the input but nothing differential observes it
    assert!(activity.is_constant_value(v(11)));
    assert!(activity.is_active(v(12)));
}

#[test]
fn duplicated_pointers_propagate_through_address_arithmetic() {
    let (_, activity) = analyze(
        r#"
        function %f(v10) {
            v11 = iconst 8
        block0:
            v12 = padd v10, v11
            v13 = load v12
            v14 = fmul v13, v13
            ret v14
        }"#,
        &[ArgActivity::Dup],
        true,
    );
    assert!(activity.is_duplicated(v(10)));
    assert!(activity.is_duplicated(v(12)));
    // the loaded scalar is active, not duplicated
    assert!(activity.is_active(v(13)));
    assert!(activity.is_active(v(14)));
}

#[test]
fn activity_flows_through_internal_memory() {
    let (_, activity) = analyze(
        r#"
        function %f(v10) {
            v11 = iconst 8
        block0:
            v12 = alloca v11
            v13 = fmul v10, v10
            store v13, v12
            v14 = load v12
            v15 = fadd v14, v10
            ret v15
        }"#,
        &[ArgActivity::Active],
        true,
    );
    // the alloca becomes a duplicated internal allocation
    assert!(activity.is_duplicated(v(12)));
    assert!(activity.is_active(v(13)));
    assert!(activity.is_active(v(14)));
}

#[test]
fn use_closures() {
    let func = parse_function(
        r#"
        function %f(v10, v11) {
            fn0 = fn %printf(1) -> 0
        block0:
            v12 = fadd v10, v10
            call fn0 (v12)
            v13 = padd v11, v7
            v14 = load v13
            ret v14
        }"#,
    )
    .unwrap();

    // v12 only feeds a pure sink
    assert!(!has_any_use(&func, v(12), true));
    // v10 is consumed by real arithmetic
    assert!(has_any_use(&func, v(10), true));
    // v11 flows into address arithmetic
    assert!(has_non_integral_use(&func, v(11)));
    // v14 is only returned
    assert!(has_any_use(&func, v(14), false));
    assert!(!has_any_use(&func, v(14), true));
    assert!(!has_non_integral_use(&func, v(14)));
}
