use expect_test::expect;

use super::*;

#[test]
fn number_of_blocks() {
    let ParseError { location, message, is_warning } = Parser::new(
        "function %a() {
                block100000:",
    )
    .parse_function()
    .unwrap_err();

    assert_eq!(message, "too many blocks");
    assert_eq!(location.line_number, 2);
    assert!(!is_warning);
}

#[test]
fn i32_as_hex() {
    fn parse_as_imm32(text: &str) -> ParseResult<i32> {
        Parser::new(text).match_imm("unable to parse i32")
    }

    assert_eq!(parse_as_imm32("0x80000000").unwrap(), -2147483648);
    assert_eq!(parse_as_imm32("0xffffffff").unwrap(), -1);
    assert_eq!(parse_as_imm32("0").unwrap(), 0);
    assert_eq!(parse_as_imm32("0x7fffffff").unwrap(), 2147483647);
    assert_eq!(parse_as_imm32("-0x00000001").unwrap(), parse_as_imm32("0xffffffff").unwrap());
    assert_eq!(parse_as_imm32("-0x7fffffff").unwrap(), parse_as_imm32("0x80000001").unwrap());
    assert!(parse_as_imm32("0xffffffffa").is_err());
}

#[test]
fn roundtrip() {
    let expected = expect![[r#"
        function %bar(v10, v11, v12) {
            v13 = iconst 42
            v14 = iconst 23
        block0:
            v15 = iadd v13, v10
            v16 = iadd v14, v11
            v17 = ilt v10, v12
            br v17, block1, block2

        block1:
            v18 = isub v15, v12
            jmp block3

        block2:
            jmp block3

        block3:
            v19 = phi [v18, block1], [v16, block2]
            ret v19
        }
    "#]];

    let fun = parse_function(expected.data).unwrap();
    let printed = fun.to_debug_string();
    expected.assert_eq(&printed)
}

#[test]
fn roundtrip_memory_and_calls() {
    let expected = expect![[r#"
        function %baz(v10, v11) {
            fn0 = fn %malloc(1) -> 1
            fn1 = const fn %sq(1) -> 1
            v13 = iconst 8
        block0:
            v14 = call fn0 (v13)
            store v10, v14
            v15 = load v14
            v16 = call fn1 (v15)
            v17 = select v11, v16, v15
            ret v17
        }
    "#]];

    let fun = parse_function(expected.data).unwrap();
    assert_eq!(fun.name, "baz");
    assert_eq!(fun.dfg.signatures.len(), 2);
    assert!(fun.dfg.signatures[FuncRef::from(0u32)].has_sideeffects);
    assert!(!fun.dfg.signatures[FuncRef::from(1u32)].has_sideeffects);
    expected.assert_eq(&fun.to_debug_string())
}

#[test]
fn ret_without_values() {
    let fun = parse_function(
        "function %nop() {
        block0:
            ret
        }",
    )
    .unwrap();
    let block = fun.layout.entry_block().unwrap();
    let term = fun.layout.last_inst(block).unwrap();
    assert_eq!(fun.dfg.insts[term].opcode(), Opcode::Ret);
    assert_eq!(fun.dfg.instr_args(term), &[]);
}

#[test]
fn rejects_unknown_opcode() {
    let err = parse_function(
        "function %f(v10) {
        block0:
            v11 = fmuladd v10, v10
            ret v11
        }",
    )
    .unwrap_err();
    assert!(err.message.contains("unknown opcode"), "{}", err.message);
}
