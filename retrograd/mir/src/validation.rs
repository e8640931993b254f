//! Structural IR verification.
//!
//! This is a cheap sanity pass run after transformations that rewrite whole
//! functions. It checks the block/terminator discipline and the consistency
//! of the redundant data (use chains, phi edges against predecessors), not
//! semantic properties.

use std::fmt;

use crate::{ControlFlowGraph, Function, Inst, InstructionData};

#[derive(Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// A block without instructions is inserted in the layout.
    EmptyBlock(crate::Block),
    /// The last instruction of a block is not a terminator.
    MissingTerminator(crate::Block),
    /// A terminator appears before the end of a block.
    EarlyTerminator(Inst),
    /// A phi is preceded by a non-phi instruction.
    MisplacedPhi(Inst),
    /// A phi's incoming blocks disagree with the block's predecessors.
    PhiEdgeMismatch(Inst),
    /// An operand refers to a value that was never defined.
    InvalidOperand(Inst),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyBlock(bb) => write!(f, "{} is empty", bb),
            ValidationError::MissingTerminator(bb) => {
                write!(f, "{} does not end in a terminator", bb)
            }
            ValidationError::EarlyTerminator(inst) => {
                write!(f, "terminator {} in the middle of a block", inst)
            }
            ValidationError::MisplacedPhi(inst) => {
                write!(f, "phi {} after a non-phi instruction", inst)
            }
            ValidationError::PhiEdgeMismatch(inst) => {
                write!(f, "phi {} disagrees with block predecessors", inst)
            }
            ValidationError::InvalidOperand(inst) => {
                write!(f, "{} uses an undefined value", inst)
            }
        }
    }
}

/// Validate the structural invariants of `func`.
pub fn validate(func: &Function) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let cfg = ControlFlowGraph::with_function(func);

    for block in &func.layout {
        let Some(last) = func.layout.last_inst(block) else {
            errors.push(ValidationError::EmptyBlock(block));
            continue;
        };
        if !func.dfg.insts[last].is_terminator() {
            errors.push(ValidationError::MissingTerminator(block));
        }

        let mut seen_non_phi = false;
        for inst in func.layout.block_insts(block) {
            let data = &func.dfg.insts[inst];
            if data.is_terminator() && inst != last {
                errors.push(ValidationError::EarlyTerminator(inst));
            }
            if data.is_phi() {
                if seen_non_phi {
                    errors.push(ValidationError::MisplacedPhi(inst));
                }
                let phi = data.unwrap_phi();
                let mut preds: Vec<_> = cfg.pred_iter(block).collect();
                for (pred, _) in func.dfg.phi_edges(phi) {
                    match preds.iter().position(|it| *it == pred) {
                        Some(pos) => {
                            preds.remove(pos);
                        }
                        None => {
                            errors.push(ValidationError::PhiEdgeMismatch(inst));
                            break;
                        }
                    }
                }
                if !preds.is_empty() {
                    errors.push(ValidationError::PhiEdgeMismatch(inst));
                }
            } else {
                seen_non_phi = true;
            }

            for val in func.dfg.instr_args(inst) {
                if !func.dfg.is_value_valid(*val) {
                    errors.push(ValidationError::InvalidOperand(inst));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
