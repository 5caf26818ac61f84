use std::fmt::Write;

use crate::info::Info;
use crate::stage::Stage;

use super::modifiers::{FpControl, InstFlags, TextureInstInfo};
use super::opcodes::Opcode;
use super::types::Type;
use super::value::{BlockId, InstId, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub opcode: Opcode,
    pub args: Vec<Value>,
    pub flags: InstFlags,
    pub block: BlockId,
    /// Incoming block of each phi argument, parallel to `args`.
    pub phi_blocks: Vec<BlockId>,
    /// Result type of a phi; the opcode table types it as opaque.
    pub phi_type: Type,
}

impl Inst {
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).copied().unwrap_or(Value::Void)
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn result_type(&self) -> Type {
        match self.opcode {
            Opcode::Phi => self.phi_type,
            opcode => opcode.result_type(),
        }
    }

    pub fn fp_control(&self) -> FpControl {
        match self.flags {
            InstFlags::Fp(control) => control,
            _ => FpControl::default(),
        }
    }

    pub fn texture_info(&self) -> Option<TextureInstInfo> {
        match self.flags {
            InstFlags::Texture(info) => Some(info),
            _ => None,
        }
    }

    pub fn has_side_effects(&self) -> bool {
        self.opcode.has_side_effects()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    /// Live instructions in execution order. Phis always come first.
    pub insts: Vec<InstId>,
    pub imm_predecessors: Vec<BlockId>,
    pub imm_successors: Vec<BlockId>,
}

/// Structured control flow over IR blocks.
///
/// A `Block` node emits that block's instructions. `If` opens a scope closed by the matching
/// `EndIf`; `Loop` opens a scope closed by the matching `Repeat`, which re-enters the loop header
/// while `cond` holds. `Break` leaves the innermost loop when `cond` holds and otherwise
/// continues in `skip`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbstractSyntaxNode {
    Block(BlockId),
    If {
        cond: Value,
        body: BlockId,
        merge: BlockId,
    },
    EndIf {
        merge: BlockId,
    },
    Loop {
        body: BlockId,
        continue_block: BlockId,
        merge: BlockId,
    },
    Repeat {
        cond: Value,
        loop_header: BlockId,
        merge: BlockId,
    },
    Break {
        cond: Value,
        merge: BlockId,
        skip: BlockId,
    },
    Return,
    Unreachable,
}

impl AbstractSyntaxNode {
    pub fn cond(&self) -> Option<Value> {
        match self {
            AbstractSyntaxNode::If { cond, .. }
            | AbstractSyntaxNode::Repeat { cond, .. }
            | AbstractSyntaxNode::Break { cond, .. } => Some(*cond),
            _ => None,
        }
    }

    pub fn cond_mut(&mut self) -> Option<&mut Value> {
        match self {
            AbstractSyntaxNode::If { cond, .. }
            | AbstractSyntaxNode::Repeat { cond, .. }
            | AbstractSyntaxNode::Break { cond, .. } => Some(cond),
            _ => None,
        }
    }
}

/// A translated shader: instruction and block arenas plus the structured syntax list over them.
#[derive(Debug, Clone)]
pub struct Program {
    pub stage: Stage,
    pub insts: Vec<Inst>,
    pub blocks: Vec<Block>,
    pub syntax_list: Vec<AbstractSyntaxNode>,
    /// Blocks in syntax-list order.
    pub block_order: Vec<BlockId>,
    pub post_order_blocks: Vec<BlockId>,
    pub info: Info,
    pub workgroup_size: [u32; 3],
    pub shared_memory_size: u32,
}

impl Program {
    pub fn new(stage: Stage) -> Self {
        Self::with_storage(stage, Vec::new(), Vec::new())
    }

    pub(crate) fn with_storage(stage: Stage, insts: Vec<Inst>, blocks: Vec<Block>) -> Self {
        Self {
            stage,
            insts,
            blocks,
            syntax_list: Vec::new(),
            block_order: Vec::new(),
            post_order_blocks: Vec::new(),
            info: Info::default(),
            workgroup_size: [1, 1, 1],
            shared_memory_size: 0,
        }
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::default());
        id
    }

    pub fn add_branch(&mut self, from: BlockId, to: BlockId) {
        if !self.blocks[from.index()].imm_successors.contains(&to) {
            self.blocks[from.index()].imm_successors.push(to);
        }
        if !self.blocks[to.index()].imm_predecessors.contains(&from) {
            self.blocks[to.index()].imm_predecessors.push(from);
        }
    }

    fn create_inst(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        args: Vec<Value>,
        flags: InstFlags,
    ) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(Inst {
            opcode,
            args,
            flags,
            block,
            phi_blocks: Vec::new(),
            phi_type: Type::VOID,
        });
        id
    }

    pub fn append_inst(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        args: &[Value],
        flags: InstFlags,
    ) -> InstId {
        let id = self.create_inst(block, opcode, args.to_vec(), flags);
        self.blocks[block.index()].insts.push(id);
        id
    }

    pub fn insert_inst(
        &mut self,
        block: BlockId,
        index: usize,
        opcode: Opcode,
        args: &[Value],
        flags: InstFlags,
    ) -> InstId {
        let id = self.create_inst(block, opcode, args.to_vec(), flags);
        self.blocks[block.index()].insts.insert(index, id);
        id
    }

    /// Position of the first instruction of `block` past its phis.
    pub fn phi_end(&self, block: BlockId) -> usize {
        self.block(block)
            .insts
            .iter()
            .take_while(|&&id| matches!(self.inst(id).opcode, Opcode::Phi | Opcode::Identity))
            .count()
    }

    /// Inserts an operandless phi of type `ty` at the top of `block`.
    pub fn prepend_phi(&mut self, block: BlockId, ty: Type) -> InstId {
        let id = self.create_inst(block, Opcode::Phi, Vec::new(), InstFlags::None);
        self.insts[id.index()].phi_type = ty;
        self.blocks[block.index()].insts.insert(0, id);
        id
    }

    pub fn add_phi_operand(&mut self, phi: InstId, predecessor: BlockId, value: Value) {
        let inst = &mut self.insts[phi.index()];
        inst.args.push(value);
        inst.phi_blocks.push(predecessor);
    }

    pub fn value_type(&self, value: Value) -> Type {
        match value {
            Value::Inst(id) => self.inst(id).result_type(),
            other => other.immediate_type().unwrap_or(Type::VOID),
        }
    }

    /// Follows identity chains to the value that actually defines `value`.
    pub fn resolve(&self, mut value: Value) -> Value {
        while let Value::Inst(id) = value {
            let inst = self.inst(id);
            if inst.opcode != Opcode::Identity {
                break;
            }
            value = inst.arg(0);
        }
        value
    }

    /// Turns `inst` into an identity of `value`; readers resolve through it until identity
    /// removal rewrites them.
    pub fn replace_uses_with(&mut self, id: InstId, value: Value) {
        let inst = &mut self.insts[id.index()];
        inst.opcode = Opcode::Identity;
        inst.args = vec![value];
        inst.phi_blocks.clear();
        inst.flags = InstFlags::None;
    }

    /// Removes `id` from its block; the arena slot becomes a dead `Void`.
    pub fn invalidate(&mut self, id: InstId) {
        let block = self.insts[id.index()].block;
        self.blocks[block.index()].insts.retain(|&other| other != id);
        let inst = &mut self.insts[id.index()];
        inst.opcode = Opcode::Void;
        inst.args.clear();
        inst.phi_blocks.clear();
    }

    pub fn phis(&self, block: BlockId) -> impl Iterator<Item = InstId> + '_ {
        self.block(block)
            .insts
            .iter()
            .copied()
            .take_while(move |&id| self.inst(id).opcode == Opcode::Phi)
    }

    pub fn num_live_insts(&self) -> usize {
        self.blocks.iter().map(|block| block.insts.len()).sum()
    }

    /// Human-readable listing, one block at a time in syntax order.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for &block_id in &self.block_order {
            let block = self.block(block_id);
            let _ = write!(out, "Block ${}", block_id.0);
            if !block.imm_predecessors.is_empty() {
                let preds: Vec<String> = block
                    .imm_predecessors
                    .iter()
                    .map(|pred| format!("${}", pred.0))
                    .collect();
                let _ = write!(out, " <- {}", preds.join(", "));
            }
            out.push('\n');
            for &id in &block.insts {
                let inst = self.inst(id);
                let _ = write!(out, "    ");
                if inst.result_type() != Type::VOID {
                    let _ = write!(out, "%{} = ", id.0);
                }
                let _ = write!(out, "{}", inst.opcode);
                for (index, arg) in inst.args.iter().enumerate() {
                    let _ = write!(out, "{}{}", if index == 0 { " " } else { ", " }, arg);
                    if let Some(pred) = inst.phi_blocks.get(index) {
                        let _ = write!(out, " <- ${}", pred.0);
                    }
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Arena storage recycled between translations on the same worker.
#[derive(Debug, Default)]
pub struct IrPools {
    insts: Vec<Inst>,
    blocks: Vec<Block>,
}

impl IrPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take(&mut self) -> (Vec<Inst>, Vec<Block>) {
        let mut insts = std::mem::take(&mut self.insts);
        let mut blocks = std::mem::take(&mut self.blocks);
        insts.clear();
        blocks.clear();
        (insts, blocks)
    }

    /// Returns a finished program's arenas to the pool.
    pub fn release(&mut self, program: Program) {
        let Program { mut insts, mut blocks, .. } = program;
        insts.clear();
        blocks.clear();
        if insts.capacity() > self.insts.capacity() {
            self.insts = insts;
        }
        if blocks.capacity() > self.blocks.capacity() {
            self.blocks = blocks;
        }
    }

    pub fn inst_capacity(&self) -> usize {
        self.insts.capacity()
    }

    pub fn block_capacity(&self) -> usize {
        self.blocks.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_follows_identity_chains() {
        let mut program = Program::new(Stage::Fragment);
        let block = program.new_block();
        let a = program.append_inst(block, Opcode::UndefU32, &[], InstFlags::None);
        let b = program.append_inst(block, Opcode::Identity, &[Value::Inst(a)], InstFlags::None);
        let c = program.append_inst(block, Opcode::Identity, &[Value::Inst(b)], InstFlags::None);
        assert_eq!(program.resolve(Value::Inst(c)), Value::Inst(a));
        program.replace_uses_with(a, Value::U32(7));
        assert_eq!(program.resolve(Value::Inst(c)), Value::U32(7));
    }

    #[test]
    fn pools_keep_the_larger_arena() {
        let mut pools = IrPools::new();
        let (insts, blocks) = pools.take();
        let mut program = Program::with_storage(Stage::Compute, insts, blocks);
        let block = program.new_block();
        for _ in 0..64 {
            program.append_inst(block, Opcode::UndefU1, &[], InstFlags::None);
        }
        pools.release(program);
        assert!(pools.inst_capacity() >= 64);
        let (insts, _) = pools.take();
        assert!(insts.is_empty());
        assert!(insts.capacity() >= 64);
    }
}
