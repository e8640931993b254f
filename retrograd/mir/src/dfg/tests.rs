use crate::cursor::FuncCursor;
use crate::{consts, Function, InstructionData, Opcode, ValueDef};

#[test]
fn constants_are_interned() {
    let mut func = Function::new();
    let a = func.dfg.f64const(2.0);
    let b = func.dfg.f64const(2.0);
    assert_eq!(a, b);
    assert_eq!(func.dfg.f64const(0.0), consts::F_ZERO);
    assert_eq!(func.dfg.f64const(-0.0), consts::F_ZERO);
    assert_eq!(func.dfg.iconst(0), consts::ZERO);
    assert_eq!(func.dfg.iconst(1), consts::ONE);
    assert_eq!(func.dfg.bconst(true), consts::TRUE);

    match func.dfg.value_def(a) {
        ValueDef::Const(c) => assert_eq!(c.unwrap_f64(), 2.0),
        def => panic!("unexpected def {:?}", def),
    }
}

#[test]
fn uses_track_operands() {
    let mut func = Function::new();
    let block = func.layout.append_new_block();
    let p0 = func.dfg.make_param(0u32.into());
    let p1 = func.dfg.make_param(1u32.into());

    let mut cursor = FuncCursor::new(&mut func).at_bottom(block);
    let sum = cursor.ins().fadd(p0, p1);
    let prod = cursor.ins().fmul(sum, p0);

    // p0 is used by both instructions
    let p0_uses: Vec<_> =
        func.dfg.uses(p0).map(|use_| func.dfg.use_to_operand(use_)).collect();
    assert_eq!(p0_uses.len(), 2);

    let sum_inst = func.dfg.value_def(sum).unwrap_inst();
    let prod_inst = func.dfg.value_def(prod).unwrap_inst();
    assert_eq!(func.dfg.instr_args(sum_inst), &[p0, p1]);
    assert_eq!(func.dfg.instr_args(prod_inst), &[sum, p0]);
    assert!(!func.dfg.value_dead(sum));
    assert!(func.dfg.value_dead(prod));
}

#[test]
fn replace_uses_rewrites_operands() {
    let mut func = Function::new();
    let block = func.layout.append_new_block();
    let p0 = func.dfg.make_param(0u32.into());
    let p1 = func.dfg.make_param(1u32.into());

    let mut cursor = FuncCursor::new(&mut func).at_bottom(block);
    let a = cursor.ins().fadd(p0, p0);
    let b = cursor.ins().fmul(a, p0);

    func.dfg.replace_uses(p0, p1);

    let a_inst = func.dfg.value_def(a).unwrap_inst();
    let b_inst = func.dfg.value_def(b).unwrap_inst();
    assert_eq!(func.dfg.instr_args(a_inst), &[p1, p1]);
    assert_eq!(func.dfg.instr_args(b_inst), &[a, p1]);
    assert!(func.dfg.value_dead(p0));
    assert_eq!(func.dfg.uses(p1).count(), 3);
}

#[test]
fn update_inst_rebuilds_uses() {
    let mut func = Function::new();
    let block = func.layout.append_new_block();
    let p0 = func.dfg.make_param(0u32.into());
    let p1 = func.dfg.make_param(1u32.into());

    let mut cursor = FuncCursor::new(&mut func).at_bottom(block);
    let a = cursor.ins().fadd(p0, p0);
    let inst = func.dfg.value_def(a).unwrap_inst();

    func.dfg.update_inst(inst, InstructionData::Unary { opcode: Opcode::Fneg, arg: p1 });
    assert_eq!(func.dfg.instr_args(inst), &[p1]);
    assert!(func.dfg.value_dead(p0));
    assert_eq!(func.dfg.uses(p1).count(), 1);
    assert_eq!(func.dfg.insts[inst].opcode(), Opcode::Fneg);
    // the result value survives the rewrite
    assert_eq!(func.dfg.first_result(inst), a);
}

#[test]
fn phi_edge_insertion() {
    let mut func = Function::new();
    let b0 = func.layout.append_new_block();
    let b1 = func.layout.append_new_block();
    let b2 = func.layout.append_new_block();
    let p0 = func.dfg.make_param(0u32.into());

    let mut cursor = FuncCursor::new(&mut func).at_bottom(b2);
    let phi = cursor.ins().phi(&[(b0, p0)]);
    let inst = func.dfg.value_def(phi).unwrap_inst();

    let v2 = func.dfg.f64const(2.0);
    func.dfg.insert_phi_edge(inst, b1, v2);
    let data = func.dfg.insts[inst].unwrap_phi().clone();
    assert_eq!(func.dfg.phi_edge_val(&data, b0), Some(p0));
    assert_eq!(func.dfg.phi_edge_val(&data, b1), Some(v2));

    // overwriting an existing edge replaces the value
    func.dfg.insert_phi_edge(inst, b0, v2);
    let data = func.dfg.insts[inst].unwrap_phi().clone();
    assert_eq!(func.dfg.phi_edge_val(&data, b0), Some(v2));
    assert_eq!(func.dfg.uses(p0).count(), 0);
}
