use crate::ir::{Opcode, Program, Value};

/// Removes instructions without side effects whose results are never read, until nothing changes.
pub fn dead_code_elimination(program: &mut Program) {
    loop {
        let mut uses = vec![0u32; program.insts.len()];
        for block in &program.blocks {
            for &id in &block.insts {
                for arg in &program.inst(id).args {
                    if let Value::Inst(used) = arg {
                        uses[used.index()] += 1;
                    }
                }
            }
        }
        for node in &program.syntax_list {
            if let Some(Value::Inst(used)) = node.cond() {
                uses[used.index()] += 1;
            }
        }

        let mut removed = 0usize;
        let insts = &mut program.insts;
        for block in &mut program.blocks {
            block.insts.retain(|&id| {
                let inst = &mut insts[id.index()];
                if uses[id.index()] != 0 || inst.has_side_effects() {
                    return true;
                }
                inst.opcode = Opcode::Void;
                inst.args.clear();
                inst.phi_blocks.clear();
                removed += 1;
                false
            });
        }
        if removed == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attribute, IrEmitter};
    use crate::stage::Stage;

    #[test]
    fn removes_unused_chains_but_keeps_stores() {
        let mut program = Program::new(Stage::VertexB);
        let block = program.new_block();
        let mut ir = IrEmitter::new(&mut program, block);
        let unused = ir.fp_add(Value::F32(1.0), Value::F32(2.0), Default::default());
        ir.fp_neg(unused);
        let kept = ir.get_attribute(Attribute::generic(0, 0));
        ir.set_attribute(Attribute::POSITION_X, kept);

        dead_code_elimination(&mut program);

        let opcodes: Vec<Opcode> = program
            .block(block)
            .insts
            .iter()
            .map(|&id| program.inst(id).opcode)
            .collect();
        assert_eq!(opcodes, vec![Opcode::GetAttribute, Opcode::SetAttribute]);
    }
}
