//! SSA construction over guest registers, predicates and goto variables.
//!
//! Follows Braun et al., "Simple and Efficient Construction of Static Single Assignment Form":
//! blocks are filled in reverse post order and a block is sealed once every predecessor has been
//! filled. Reads in unsealed blocks create incomplete phis that get their operands on sealing.
//! Trivial phis are left for identity removal to collapse.

use std::collections::HashMap;

use crate::ir::{BlockId, InstFlags, InstId, Opcode, Pred, Program, Reg, Type, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Variable {
    Reg(Reg),
    Pred(Pred),
    Goto(u32),
}

impl Variable {
    fn ty(self) -> Type {
        match self {
            Variable::Reg(_) => Type::U32,
            Variable::Pred(_) | Variable::Goto(_) => Type::U1,
        }
    }
}

struct SsaBuilder<'p> {
    program: &'p mut Program,
    current_def: HashMap<(Variable, BlockId), Value>,
    sealed: Vec<bool>,
    filled: Vec<bool>,
    incomplete_phis: HashMap<BlockId, Vec<(Variable, InstId)>>,
}

impl SsaBuilder<'_> {
    fn write_variable(&mut self, variable: Variable, block: BlockId, value: Value) {
        self.current_def.insert((variable, block), value);
    }

    fn read_variable(&mut self, variable: Variable, block: BlockId) -> Value {
        match self.current_def.get(&(variable, block)) {
            Some(&value) => value,
            None => self.read_variable_recursive(variable, block),
        }
    }

    fn read_variable_recursive(&mut self, variable: Variable, block: BlockId) -> Value {
        let preds = self.program.block(block).imm_predecessors.clone();
        let value = if !self.sealed[block.index()] {
            let phi = self.program.prepend_phi(block, variable.ty());
            self.incomplete_phis.entry(block).or_default().push((variable, phi));
            Value::Inst(phi)
        } else if preds.len() == 1 {
            self.read_variable(variable, preds[0])
        } else if preds.is_empty() {
            self.undef(block, variable.ty())
        } else {
            // Written before the operands are read so loops terminate on it.
            let phi = self.program.prepend_phi(block, variable.ty());
            self.write_variable(variable, block, Value::Inst(phi));
            self.add_phi_operands(variable, phi, block);
            Value::Inst(phi)
        };
        self.write_variable(variable, block, value);
        value
    }

    fn undef(&mut self, block: BlockId, ty: Type) -> Value {
        match Opcode::undef_for(ty) {
            Some(opcode) => {
                let index = self.program.phi_end(block);
                Value::Inst(self.program.insert_inst(block, index, opcode, &[], InstFlags::None))
            }
            None => Value::Void,
        }
    }

    fn add_phi_operands(&mut self, variable: Variable, phi: InstId, block: BlockId) {
        let preds = self.program.block(block).imm_predecessors.clone();
        for pred in preds {
            let value = self.read_variable(variable, pred);
            self.program.add_phi_operand(phi, pred, value);
        }
    }

    fn seal_block(&mut self, block: BlockId) {
        if self.sealed[block.index()] {
            return;
        }
        if let Some(phis) = self.incomplete_phis.remove(&block) {
            for (variable, phi) in phis {
                self.add_phi_operands(variable, phi, block);
            }
        }
        self.sealed[block.index()] = true;
    }

    fn preds_filled(&self, block: BlockId) -> bool {
        self.program
            .block(block)
            .imm_predecessors
            .iter()
            .all(|pred| self.filled[pred.index()])
    }

    fn fill_block(&mut self, block: BlockId) {
        let insts = self.program.block(block).insts.clone();
        for id in insts {
            let inst = self.program.inst(id);
            let (variable, store) = match (inst.opcode, inst.arg(0)) {
                (Opcode::GetRegister, Value::Reg(reg)) => (Variable::Reg(reg), None),
                (Opcode::SetRegister, Value::Reg(reg)) => (Variable::Reg(reg), Some(inst.arg(1))),
                (Opcode::GetPred, Value::Pred(pred)) => (Variable::Pred(pred), None),
                (Opcode::SetPred, Value::Pred(pred)) => (Variable::Pred(pred), Some(inst.arg(1))),
                (Opcode::GetGotoVariable, Value::U32(id)) => (Variable::Goto(id), None),
                (Opcode::SetGotoVariable, Value::U32(id)) => {
                    (Variable::Goto(id), Some(inst.arg(1)))
                }
                _ => continue,
            };
            match store {
                Some(value) => {
                    self.write_variable(variable, block, value);
                    self.program.invalidate(id);
                }
                None => {
                    let value = self.read_variable(variable, block);
                    self.program.replace_uses_with(id, value);
                }
            }
        }
        self.filled[block.index()] = true;
    }
}

/// Replaces guest register, predicate and goto variable accesses with SSA values and phis.
///
/// Expects `program.post_order_blocks` to be current.
pub fn ssa_rewrite(program: &mut Program) {
    let num_blocks = program.blocks.len();
    let mut order: Vec<BlockId> = program.post_order_blocks.iter().rev().copied().collect();
    let mut reachable = vec![false; num_blocks];
    for block in &order {
        reachable[block.index()] = true;
    }
    // Unreachable blocks still hold accesses that must be rewritten.
    order.extend((0..num_blocks as u32).map(BlockId).filter(|block| !reachable[block.index()]));

    let mut builder = SsaBuilder {
        program,
        current_def: HashMap::new(),
        sealed: vec![false; num_blocks],
        filled: vec![false; num_blocks],
        incomplete_phis: HashMap::new(),
    };
    for block in order {
        if builder.preds_filled(block) {
            builder.seal_block(block);
        }
        builder.fill_block(block);
        let successors = builder.program.block(block).imm_successors.clone();
        for successor in successors {
            if !builder.sealed[successor.index()] && builder.preds_filled(successor) {
                builder.seal_block(successor);
            }
        }
    }
    for block in 0..num_blocks as u32 {
        builder.seal_block(BlockId(block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrEmitter;
    use crate::ir::passes::{identity_removal, post_order};
    use crate::stage::Stage;

    /// entry writes R0 on both arms of a diamond; the merge reads it.
    fn diamond(same_value: bool) -> (Program, BlockId) {
        let mut program = Program::new(Stage::Fragment);
        let entry = program.new_block();
        let then_block = program.new_block();
        let else_block = program.new_block();
        let merge = program.new_block();
        program.add_branch(entry, then_block);
        program.add_branch(entry, else_block);
        program.add_branch(then_block, merge);
        program.add_branch(else_block, merge);
        program.block_order = vec![entry, then_block, else_block, merge];

        IrEmitter::new(&mut program, then_block).set_reg(Reg(0), Value::U32(1));
        let other = if same_value { 1 } else { 2 };
        IrEmitter::new(&mut program, else_block).set_reg(Reg(0), Value::U32(other));
        IrEmitter::new(&mut program, merge).get_reg(Reg(0));
        (program, merge)
    }

    #[test]
    fn diamond_read_gets_exactly_one_phi() {
        let (mut program, merge) = diamond(false);
        program.post_order_blocks = post_order(&program);
        ssa_rewrite(&mut program);
        identity_removal(&mut program);

        let phis: Vec<InstId> = program.phis(merge).collect();
        assert_eq!(phis.len(), 1);
        let phi = program.inst(phis[0]);
        assert_eq!(phi.num_args(), 2);
        assert_eq!(phi.phi_type, Type::U32);
        let mut operands: Vec<u32> = phi.args.iter().filter_map(Value::as_u32).collect();
        operands.sort_unstable();
        assert_eq!(operands, vec![1, 2]);
    }

    #[test]
    fn trivial_phi_collapses() {
        let (mut program, merge) = diamond(true);
        program.post_order_blocks = post_order(&program);
        ssa_rewrite(&mut program);
        identity_removal(&mut program);
        assert_eq!(program.phis(merge).count(), 0);
    }

    #[test]
    fn loop_carried_register_gets_back_edge_operand() {
        let mut program = Program::new(Stage::Compute);
        let entry = program.new_block();
        let header = program.new_block();
        let exit = program.new_block();
        program.add_branch(entry, header);
        program.add_branch(header, header);
        program.add_branch(header, exit);
        program.block_order = vec![entry, header, exit];

        IrEmitter::new(&mut program, entry).set_reg(Reg(3), Value::U32(0));
        let mut ir = IrEmitter::new(&mut program, header);
        let counter = ir.get_reg(Reg(3));
        let next = ir.iadd(counter, Value::U32(1));
        ir.set_reg(Reg(3), next);

        program.post_order_blocks = post_order(&program);
        ssa_rewrite(&mut program);
        identity_removal(&mut program);

        let phis: Vec<InstId> = program.phis(header).collect();
        assert_eq!(phis.len(), 1);
        let phi = program.inst(phis[0]);
        assert_eq!(phi.phi_blocks.len(), 2);
        assert!(phi.args.contains(&Value::U32(0)));
        assert!(phi.args.contains(&next));
        assert!(program.blocks.iter().flat_map(|block| &block.insts).all(|&id| {
            !matches!(program.inst(id).opcode, Opcode::GetRegister | Opcode::SetRegister)
        }));
    }
}
