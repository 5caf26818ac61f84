use crate::ir::{InstId, Opcode, Program, Value};

/// Folds instructions whose operands are immediates, plus a few algebraic identities
/// (`x || false`, `!!x`, a bit cast of a bit cast). Folded instructions become identities.
pub fn constant_propagation(program: &mut Program) {
    for block in 0..program.blocks.len() {
        let insts = program.blocks[block].insts.clone();
        for id in insts {
            if let Some(value) = fold(program, id) {
                program.replace_uses_with(id, value);
            }
        }
    }
}

fn defining(program: &Program, value: Value) -> Option<(Opcode, Value)> {
    let id = program.resolve(value).inst()?;
    let inst = program.inst(id);
    Some((inst.opcode, inst.arg(0)))
}

fn fold(program: &Program, id: InstId) -> Option<Value> {
    let inst = program.inst(id);
    let arg = |index: usize| program.resolve(inst.arg(index));
    let u1 = |index: usize| arg(index).as_u1();
    let u32_pair = || Some((arg(0).as_u32()?, arg(1).as_u32()?));

    Some(match inst.opcode {
        Opcode::LogicalNot => match arg(0) {
            Value::U1(value) => Value::U1(!value),
            other => match defining(program, other)? {
                (Opcode::LogicalNot, inner) => program.resolve(inner),
                _ => return None,
            },
        },
        Opcode::LogicalOr => match (u1(0), u1(1)) {
            (Some(true), _) | (_, Some(true)) => Value::U1(true),
            (Some(false), _) => arg(1),
            (_, Some(false)) => arg(0),
            _ => return None,
        },
        Opcode::LogicalAnd => match (u1(0), u1(1)) {
            (Some(false), _) | (_, Some(false)) => Value::U1(false),
            (Some(true), _) => arg(1),
            (_, Some(true)) => arg(0),
            _ => return None,
        },
        Opcode::LogicalXor => Value::U1(u1(0)? != u1(1)?),
        Opcode::SelectU1 | Opcode::SelectU32 | Opcode::SelectF32 => {
            if u1(0)? {
                arg(1)
            } else {
                arg(2)
            }
        }
        Opcode::BitCastF32U32 => match arg(0) {
            Value::U32(bits) => Value::F32(f32::from_bits(bits)),
            other => match defining(program, other)? {
                (Opcode::BitCastU32F32, inner) => program.resolve(inner),
                _ => return None,
            },
        },
        Opcode::BitCastU32F32 => match arg(0) {
            Value::F32(value) => Value::U32(value.to_bits()),
            other => match defining(program, other)? {
                (Opcode::BitCastF32U32, inner) => program.resolve(inner),
                _ => return None,
            },
        },
        Opcode::IAdd32 => {
            let (a, b) = u32_pair()?;
            Value::U32(a.wrapping_add(b))
        }
        Opcode::INeg32 => Value::U32(arg(0).as_u32()?.wrapping_neg()),
        Opcode::BitwiseAnd32 => {
            let (a, b) = u32_pair()?;
            Value::U32(a & b)
        }
        Opcode::BitwiseOr32 => {
            let (a, b) = u32_pair()?;
            Value::U32(a | b)
        }
        Opcode::BitwiseXor32 => {
            let (a, b) = u32_pair()?;
            Value::U32(a ^ b)
        }
        Opcode::BitwiseNot32 => Value::U32(!arg(0).as_u32()?),
        Opcode::ShiftLeftLogical32 => {
            let (a, b) = u32_pair()?;
            Value::U32(a.checked_shl(b)?)
        }
        Opcode::ShiftRightLogical32 => {
            let (a, b) = u32_pair()?;
            Value::U32(a.checked_shr(b)?)
        }
        Opcode::ShiftRightArithmetic32 => {
            let (a, b) = u32_pair()?;
            Value::U32((a as i32).checked_shr(b)? as u32)
        }
        Opcode::IEqual => {
            let (a, b) = u32_pair()?;
            Value::U1(a == b)
        }
        Opcode::INotEqual => {
            let (a, b) = u32_pair()?;
            Value::U1(a != b)
        }
        Opcode::ULessThan => {
            let (a, b) = u32_pair()?;
            Value::U1(a < b)
        }
        Opcode::UGreaterThanEqual => {
            let (a, b) = u32_pair()?;
            Value::U1(a >= b)
        }
        Opcode::SLessThan => {
            let (a, b) = u32_pair()?;
            Value::U1((a as i32) < (b as i32))
        }
        Opcode::SGreaterThanEqual => {
            let (a, b) = u32_pair()?;
            Value::U1((a as i32) >= (b as i32))
        }
        Opcode::FPNeg32 => Value::F32(-arg(0).as_f32()?),
        Opcode::FPAbs32 => Value::F32(arg(0).as_f32()?.abs()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrEmitter, Reg};
    use crate::ir::passes::identity_removal;
    use crate::stage::Stage;

    #[test]
    fn folds_immediates_and_bitcast_pairs() {
        let mut program = Program::new(Stage::Compute);
        let block = program.new_block();
        program.block_order = vec![block];
        let mut ir = IrEmitter::new(&mut program, block);
        let sum = ir.iadd(Value::U32(40), Value::U32(2));
        let raw = ir.get_reg(Reg(1));
        let as_float = ir.bit_cast_f32(raw);
        let back = ir.bit_cast_u32(as_float);
        let either = ir.logical_or(Value::U1(false), Value::U1(false));
        let picked = ir.select(either, sum, back);
        ir.set_reg(Reg(2), picked);

        constant_propagation(&mut program);
        identity_removal(&mut program);

        let set = *program.block(block).insts.last().unwrap();
        assert_eq!(program.inst(set).arg(1), raw);
        assert_eq!(program.resolve(sum), Value::U32(42));
    }
}
