use super::*;

#[test]
fn opcode_names_roundtrip() {
    for (i, name) in OPCODE_NAMES.iter().enumerate() {
        let op: Opcode = name.parse().unwrap();
        assert_eq!(op as usize, i);
        assert_eq!(op.name(), *name);
    }
    assert!("fmuladd".parse::<Opcode>().is_err());
}

#[test]
fn formats_agree_with_constraints() {
    for (i, format) in OPCODE_FORMAT.iter().enumerate() {
        let constraints = OPCODE_CONSTRAINTS[i];
        match format {
            InstructionFormat::Unary => {
                assert_eq!(constraints.num_fixed_value_arguments(), 1)
            }
            InstructionFormat::Binary => {
                assert_eq!(constraints.num_fixed_value_arguments(), 2)
            }
            InstructionFormat::Ternary => {
                assert_eq!(constraints.num_fixed_value_arguments(), 3)
            }
            InstructionFormat::Branch => {
                assert_eq!(constraints.num_fixed_value_arguments(), 1)
            }
            InstructionFormat::Jump
            | InstructionFormat::Call
            | InstructionFormat::PhiNode
            | InstructionFormat::Ret
            | InstructionFormat::Unreachable => {
                assert_eq!(constraints.num_fixed_value_arguments(), 0)
            }
        }
    }
}

#[test]
fn terminators() {
    for op in [Opcode::Jmp, Opcode::Br, Opcode::Ret, Opcode::Unreachable] {
        assert!(op.is_terminator());
    }
    assert!(!Opcode::Call.is_terminator());
    assert!(!Opcode::Store.is_terminator());
}

#[test]
fn phi_edges() {
    let mut pools = ListPools::new();
    let mut args = ValueList::new();
    let mut blocks = BlockList::new();
    let v1 = Value::with_number(1).unwrap();
    let v2 = Value::with_number(2).unwrap();
    let bb1 = Block::with_number(1).unwrap();
    let bb2 = Block::with_number(2).unwrap();
    args.push(v1, &mut pools.value_lists);
    args.push(v2, &mut pools.value_lists);
    blocks.push(bb1, &mut pools.block_lists);
    blocks.push(bb2, &mut pools.block_lists);
    let phi = PhiNode { args, blocks };

    assert_eq!(phi.edge_val(bb1, &pools), Some(v1));
    assert_eq!(phi.edge_val(bb2, &pools), Some(v2));
    assert_eq!(phi.edge_val(Block::with_number(3).unwrap(), &pools), None);
    assert_eq!(phi.edges(&pools).collect::<Vec<_>>(), vec![(bb1, v1), (bb2, v2)]);
}
