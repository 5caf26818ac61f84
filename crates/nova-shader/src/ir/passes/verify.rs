use crate::error::{Result, ShaderError};
use crate::ir::{BlockId, Opcode, Program, Type, Value};

fn fail(block: BlockId, message: impl std::fmt::Display) -> ShaderError {
    ShaderError::logic(format!("IR verification failed in block ${}: {message}", block.0))
}

/// Checks the structural invariants backends rely on: every live instruction sits in its own
/// block, operands are typed as their opcode declares and refer to live instructions, phis have
/// one operand per predecessor, and no guest state access survived SSA construction.
pub fn verify(program: &Program) -> Result<()> {
    let mut live = vec![false; program.insts.len()];
    for block in &program.blocks {
        for &id in &block.insts {
            live[id.index()] = true;
        }
    }

    for (index, block) in program.blocks.iter().enumerate() {
        let block_id = BlockId(index as u32);
        let mut seen_non_phi = false;
        for &id in &block.insts {
            let inst = program.inst(id);
            if inst.block != block_id {
                return Err(fail(block_id, format!("%{} belongs to block ${}", id.0, inst.block.0)));
            }
            match inst.opcode {
                Opcode::Phi => {
                    if seen_non_phi {
                        let message = format!("phi %{} after a non-phi instruction", id.0);
                        return Err(fail(block_id, message));
                    }
                    if inst.num_args() != block.imm_predecessors.len() {
                        return Err(fail(
                            block_id,
                            format!(
                                "phi %{} has {} operands for {} predecessors",
                                id.0,
                                inst.num_args(),
                                block.imm_predecessors.len()
                            ),
                        ));
                    }
                    if inst.phi_blocks.iter().any(|pred| !block.imm_predecessors.contains(pred)) {
                        let message = format!("phi %{} names a non-predecessor", id.0);
                        return Err(fail(block_id, message));
                    }
                }
                Opcode::Identity
                | Opcode::Void
                | Opcode::GetRegister
                | Opcode::SetRegister
                | Opcode::GetPred
                | Opcode::SetPred
                | Opcode::GetGotoVariable
                | Opcode::SetGotoVariable => {
                    return Err(fail(block_id, format!("%{} is a leftover {}", id.0, inst.opcode)));
                }
                _ => seen_non_phi = true,
            }

            let declared = inst.opcode.arg_types();
            if inst.opcode != Opcode::Phi && declared.len() != inst.num_args() {
                return Err(fail(
                    block_id,
                    format!(
                        "{} %{} takes {} operands, has {}",
                        inst.opcode,
                        id.0,
                        declared.len(),
                        inst.num_args()
                    ),
                ));
            }
            for (arg_index, &arg) in inst.args.iter().enumerate() {
                if let Value::Inst(used) = arg {
                    if !live[used.index()] {
                        return Err(fail(block_id, format!("%{} reads dead %{}", id.0, used.0)));
                    }
                }
                let expected = match inst.opcode {
                    Opcode::Phi => inst.phi_type,
                    _ => declared[arg_index],
                };
                let actual = program.value_type(arg);
                if !Type::are_compatible(actual, expected) {
                    return Err(fail(
                        block_id,
                        format!(
                            "{} %{} operand {arg_index} is {actual}, expected {expected}",
                            inst.opcode, id.0
                        ),
                    ));
                }
            }
        }
    }

    for node in &program.syntax_list {
        if let Some(cond) = node.cond() {
            if program.value_type(cond) != Type::U1 {
                return Err(ShaderError::logic("syntax list condition is not a boolean"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstFlags, IrEmitter};
    use crate::stage::Stage;

    #[test]
    fn rejects_phi_arity_mismatch() {
        let mut program = Program::new(Stage::Fragment);
        let entry = program.new_block();
        let other = program.new_block();
        let merge = program.new_block();
        program.add_branch(entry, merge);
        program.add_branch(other, merge);
        let phi = program.prepend_phi(merge, Type::U32);
        program.add_phi_operand(phi, entry, Value::U32(1));
        assert!(matches!(verify(&program), Err(ShaderError::Logic(_))));

        program.add_phi_operand(phi, other, Value::U32(2));
        assert_eq!(verify(&program), Ok(()));
    }

    #[test]
    fn rejects_mistyped_operands() {
        let mut program = Program::new(Stage::Fragment);
        let block = program.new_block();
        program.append_inst(block, Opcode::FPNeg32, &[Value::U32(1)], InstFlags::None);
        assert!(verify(&program).is_err());

        let mut program = Program::new(Stage::Fragment);
        let block = program.new_block();
        let mut ir = IrEmitter::new(&mut program, block);
        let value = ir.fp_neg(Value::F32(1.0));
        ir.set_frag_depth(value);
        assert_eq!(verify(&program), Ok(()));
    }
}
