use crate::ir::{BlockId, InstFlags, InstId, Opcode, Program, Value};

/// Collapses trivial phis, rewrites every operand past identity chains and drops the identities.
pub fn identity_removal(program: &mut Program) {
    remove_trivial_phis(program);

    for block in 0..program.blocks.len() {
        let insts = program.blocks[block].insts.clone();
        for id in insts {
            let args = program.inst(id).args.clone();
            let resolved: Vec<Value> = args.into_iter().map(|arg| program.resolve(arg)).collect();
            program.inst_mut(id).args = resolved;
        }
    }
    for index in 0..program.syntax_list.len() {
        if let Some(cond) = program.syntax_list[index].cond() {
            let resolved = program.resolve(cond);
            if let Some(slot) = program.syntax_list[index].cond_mut() {
                *slot = resolved;
            }
        }
    }

    let insts = &program.insts;
    for block in &mut program.blocks {
        block
            .insts
            .retain(|&id| !matches!(insts[id.index()].opcode, Opcode::Identity | Opcode::Void));
    }
}

/// A phi is trivial when every operand is either the phi itself or one other value.
fn remove_trivial_phis(program: &mut Program) {
    loop {
        let mut changed = false;
        for block in 0..program.blocks.len() as u32 {
            let block = BlockId(block);
            let phis: Vec<InstId> = program
                .block(block)
                .insts
                .iter()
                .copied()
                .filter(|&id| program.inst(id).opcode == Opcode::Phi)
                .collect();
            for phi in phis {
                if let Some(same) = trivial_value(program, phi) {
                    let value = match same {
                        Some(value) => value,
                        None => {
                            // Only ever reads itself: the variable is undefined here.
                            let ty = program.inst(phi).phi_type;
                            match Opcode::undef_for(ty) {
                                Some(opcode) => {
                                    let index = program.phi_end(block);
                                    Value::Inst(program.insert_inst(
                                        block,
                                        index,
                                        opcode,
                                        &[],
                                        InstFlags::None,
                                    ))
                                }
                                None => Value::Void,
                            }
                        }
                    };
                    program.replace_uses_with(phi, value);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

/// `Some(Some(v))` if the phi only merges `v`, `Some(None)` if it only references itself.
fn trivial_value(program: &Program, phi: InstId) -> Option<Option<Value>> {
    let mut same: Option<Value> = None;
    for &arg in &program.inst(phi).args {
        let arg = program.resolve(arg);
        if arg == Value::Inst(phi) {
            continue;
        }
        match same {
            Some(existing) if !existing.same_as(&arg) => return None,
            _ => same = Some(arg),
        }
    }
    Some(same)
}
