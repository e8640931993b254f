use expect_test::expect;

use crate::cursor::FuncCursor;
use crate::Function;

#[test]
fn print_phi_and_memory() {
    let mut func = Function::with_name("mem".to_owned());
    let entry = func.layout.append_new_block();
    let body = func.layout.append_new_block();
    let exit = func.layout.append_new_block();
    let p0 = func.dfg.make_param(0u32.into());

    let mut cursor = FuncCursor::new(&mut func).at_bottom(entry);
    let eight = cursor.func.dfg.iconst(8);
    let cell = cursor.ins().alloca(eight);
    let init = cursor.func.dfg.f64const(0.0);
    cursor.ins().store(init, cell);
    cursor.ins().jmp(body);

    cursor.goto_bottom(body);
    let loaded = cursor.ins().load(cell);
    let next = cursor.ins().fadd(loaded, p0);
    cursor.ins().store(next, cell);
    let done = cursor.func.dfg.bconst(false);
    cursor.ins().br(done, body, exit);

    cursor.goto_bottom(exit);
    let phi = cursor.ins().phi(&[(body, next)]);
    cursor.ins().ret(&[phi]);

    expect![[r#"
        function %mem(v9) {
            // v1 = bconst false
            v3 = fconst 0.0
            v10 = iconst 8

        block0:
            v11 = alloca v10
            store v3, v11
            jmp block1

        block1:
            v12 = load v11
            v13 = fadd v12, v9
            store v13, v11
            br v1, block1, block2

        block2:
            v14 = phi [v13, block1]
            ret v14
        }
    "#]]
    .assert_eq(&func.to_debug_string());
}
