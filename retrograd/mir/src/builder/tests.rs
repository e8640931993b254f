use expect_test::expect;

use crate::cursor::FuncCursor;
use crate::{consts, Function, FunctionSignature};

#[test]
fn build_small_function() {
    let mut func = Function::with_name("smoke".to_owned());
    let sq = func.import_function(FunctionSignature {
        name: "sq".to_owned(),
        params: 1,
        returns: 1,
        has_sideeffects: false,
    });

    let entry = func.layout.append_new_block();
    let exit = func.layout.append_new_block();
    let p0 = func.dfg.make_param(0u32.into());

    let mut cursor = FuncCursor::new(&mut func).at_bottom(entry);
    let two = cursor.func.dfg.f64const(2.0);
    assert_eq!(two, consts::F_TWO);
    let prod = cursor.ins().fmul(p0, two);
    let call = cursor.ins().call(sq, &[prod]);
    let res = cursor.func.dfg.first_result(call);
    cursor.ins().br(consts::TRUE, exit, exit);
    cursor.goto_bottom(exit);
    cursor.ins().ret(&[res]);

    expect![[r#"
        function %smoke(v9) {
            fn0 = const fn %sq(1) -> 1
            // v2 = bconst true
            v6 = fconst 0x1.0000000000000p1

        block0:
            v10 = fmul v9, v6
            v11 = call fn0 (v10)
            br v2, block1, block1

        block1:
            ret v11
        }
    "#]]
    .assert_eq(&func.to_debug_string());
}
