//! Converting MIR to text.
//!
//! The `write` module provides the `write_function` function which converts
//! an IR `Function` to an equivalent textual form. This textual form can be
//! read back by the `mir_reader` crate.

use core::fmt::{self, Write};

use crate::dfg::Const;
use crate::{Block, DataFlowGraph, Function, Inst, InstructionData, Value, ValueDef};

#[cfg(test)]
mod tests;

/// Write `func` to `w` as equivalent text.
pub fn write_function(w: &mut dyn Write, func: &Function) -> fmt::Result {
    write!(w, "function %{}(", func.name)?;

    let mut params: Vec<(usize, Value)> = func
        .dfg
        .values()
        .filter_map(|val| {
            if let ValueDef::Param(def) = func.dfg.value_def(val) {
                Some((def.into(), val))
            } else {
                None
            }
        })
        .collect();
    params.sort_by_key(|(pos, _)| *pos);
    let mut seen = false;
    for (_, val) in params {
        if seen {
            write!(w, ", ")?;
        } else {
            seen = true
        }
        write!(w, "{}", val)?;
    }
    writeln!(w, ") {{")?;
    let mut any = write_preamble(w, func)?;
    for block in &func.layout {
        if any {
            writeln!(w)?;
        }
        write_block(w, func, block)?;
        any = true;
    }
    writeln!(w, "}}")
}

/// Write out the preamble: signatures and used constants.
fn write_preamble(w: &mut dyn Write, func: &Function) -> Result<bool, fmt::Error> {
    let mut any = false;

    // Signatures come first since instructions refer to them.
    for (sig, sig_data) in func.dfg.signatures.iter_enumerated() {
        any = true;
        writeln!(w, "    {} = {}", sig, sig_data)?;
    }

    for val in func.dfg.values() {
        match func.dfg.value_def(val) {
            ValueDef::Const(Const::Float(def)) if func.dfg.uses(val).next().is_some() => {
                any = true;
                writeln!(w, "    {} = fconst {}", val, def)?
            }
            ValueDef::Const(Const::Int(def)) if func.dfg.uses(val).next().is_some() => {
                any = true;
                writeln!(w, "    {} = iconst {}", val, def)?
            }
            ValueDef::Const(Const::Bool(def)) if func.dfg.uses(val).next().is_some() => {
                any = true;
                writeln!(w, "    // {} = bconst {}", val, def)?
            }
            _ => (),
        }
    }

    Ok(any)
}

fn write_block(w: &mut dyn Write, func: &Function, block: Block) -> fmt::Result {
    // Indent all instructions if any srclocs are present.
    let indent = if func.srclocs.iter().all(|loc| loc.is_default()) { 4 } else { 36 };

    writeln!(w, "{1:0$}{2}:", indent - 4, "", block)?;
    for inst in func.layout.block_insts(block) {
        write_instruction(w, func, inst, indent)?;
    }

    Ok(())
}

fn write_instruction(w: &mut dyn Write, func: &Function, inst: Inst, indent: usize) -> fmt::Result {
    // Source location prefix.
    let mut s = String::with_capacity(16);
    let srcloc = func.srcloc(inst);
    if !srcloc.is_default() {
        write!(s, "{} ", srcloc)?;
    }

    write!(w, "{1:0$}", indent, s)?;

    // Write out the result values, if any.
    let mut has_results = false;
    for r in func.dfg.inst_results(inst) {
        if !has_results {
            has_results = true;
            write!(w, "{}", r)?;
        } else {
            write!(w, ", {}", r)?;
        }
    }
    if has_results {
        write!(w, " = ")?;
    }

    write!(w, "{}", func.dfg.insts[inst].opcode())?;
    write_operands(w, &func.dfg, inst)?;
    writeln!(w)
}

/// Write the operands of `inst` to `w` with a prepended space.
pub fn write_operands(w: &mut dyn Write, dfg: &DataFlowGraph, inst: Inst) -> fmt::Result {
    let pools = &dfg.insts.pools;
    match dfg.insts[inst].clone() {
        InstructionData::Unary { arg, .. } => write!(w, " {}", arg),
        InstructionData::Binary { args, .. } => write!(w, " {}, {}", args[0], args[1]),
        InstructionData::Ternary { args, .. } => {
            write!(w, " {}, {}, {}", args[0], args[1], args[2])
        }
        InstructionData::Jump { destination } => write!(w, " {}", destination),
        InstructionData::Branch { cond, then_dst, else_dst } => {
            write!(w, " {}, {}, {}", cond, then_dst, else_dst)
        }
        InstructionData::Call { func_ref, ref args } => {
            write!(w, " {} ({})", func_ref, DisplayValues(args.as_slice(&pools.value_lists)))
        }
        InstructionData::Ret { ref args } => {
            let args = args.as_slice(&pools.value_lists);
            if args.is_empty() {
                Ok(())
            } else {
                write!(w, " {}", DisplayValues(args))
            }
        }
        InstructionData::PhiNode(ref phi) => {
            let mut first = true;
            for (block, val) in phi.edges(pools) {
                if first {
                    first = false;
                } else {
                    write!(w, ",")?;
                }
                write!(w, " [{}, {}]", val, block)?;
            }
            Ok(())
        }
        InstructionData::Unreachable => Ok(()),
    }
}

/// Displayable slice of values.
struct DisplayValues<'a>(&'a [Value]);

impl<'a> fmt::Display for DisplayValues<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, val) in self.0.iter().enumerate() {
            if i == 0 {
                write!(f, "{}", val)?;
            } else {
                write!(f, ", {}", val)?;
            }
        }
        Ok(())
    }
}
