//! Control flow graph recovery.
//!
//! Each function keeps a work list of labels (an address plus the `SSY`/`PBK` token stack live
//! at it). Analyzing a label scans forward until a branch-class instruction or an already known
//! block. A label that lands inside an analyzed block ends that block early and the remainder
//! becomes the label's block.

use std::collections::BTreeMap;

use tracing::debug;

use crate::environment::Environment;
use crate::error::{Result, ShaderError};
use crate::ir::Pred;

use super::instruction::{decode, Instruction, Opcode};
use super::location::Location;

/// Scanning past this many bytes means the program never terminates.
pub(crate) const MAX_PROGRAM_SIZE: u32 = 0x10_0000;

/// Guard of a conditional branch: a predicate, possibly negated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition {
    pub pred: Pred,
    pub negated: bool,
}

impl Condition {
    pub const TRUE: Condition = Condition {
        pred: Pred::PT,
        negated: false,
    };
    pub const FALSE: Condition = Condition {
        pred: Pred::PT,
        negated: true,
    };

    pub fn new(pred: Pred, negated: bool) -> Self {
        Self { pred, negated }
    }

    pub fn is_true(self) -> bool {
        self == Self::TRUE
    }

    pub fn is_false(self) -> bool {
        self == Self::FALSE
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.negated {
            f.write_str("!")?;
        }
        write!(f, "{}", self.pred)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Ssy,
    Pbk,
}

/// Reconvergence targets pushed by `SSY`/`PBK` and consumed by `SYNC`/`BRK`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stack {
    entries: Vec<(Token, Location)>,
}

impl Stack {
    pub fn push(&mut self, token: Token, target: Location) {
        self.entries.push((token, target));
    }

    pub fn peek(&self, token: Token) -> Option<Location> {
        self.entries
            .iter()
            .rev()
            .find(|(entry, _)| *entry == token)
            .map(|&(_, target)| target)
    }

    /// Target of the innermost `token` plus the stack with that entry and everything above it
    /// removed.
    pub fn pop(&self, token: Token) -> Result<(Location, Stack)> {
        let index = self
            .entries
            .iter()
            .rposition(|(entry, _)| *entry == token)
            .ok_or_else(|| ShaderError::logic(format!("token {token:?} not found on the stack")))?;
        let target = self.entries[index].1;
        let entries = self.entries[..index].to_vec();
        Ok((target, Stack { entries }))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowBlockId(pub u32);

pub type FunctionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndClass {
    Branch,
    Call,
    Exit,
    Return,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowBlock {
    pub begin: Location,
    /// One past the last instruction that belongs to the block.
    pub end: Location,
    /// Empty block that only tests the guard of the conditional instruction at `begin`.
    pub is_virtual: bool,
    pub end_class: EndClass,
    pub cond: Condition,
    /// Token stack at the end of the block.
    pub stack: Stack,
    pub branch_true: Option<FlowBlockId>,
    pub branch_false: Option<FlowBlockId>,
    pub function_call: FunctionId,
    pub return_block: Option<FlowBlockId>,
}

impl FlowBlock {
    fn empty(begin: Location, stack: Stack) -> Self {
        Self {
            begin,
            end: begin,
            is_virtual: false,
            end_class: EndClass::Branch,
            cond: Condition::TRUE,
            stack,
            branch_true: None,
            branch_false: None,
            function_call: 0,
            return_block: None,
        }
    }

    pub fn contains(&self, pc: Location) -> bool {
        self.begin <= pc && pc < self.end
    }

    fn key(&self) -> BlockKey {
        (self.begin.offset(), !self.is_virtual)
    }
}

/// Orders blocks by address, a virtual block right before the real block at the same address.
type BlockKey = (u32, bool);

#[derive(Debug, Clone)]
struct Label {
    address: Location,
    block: FlowBlockId,
    stack: Stack,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub entrypoint: Location,
    blocks: BTreeMap<BlockKey, FlowBlockId>,
    labels: Vec<Label>,
}

impl Function {
    /// Blocks ordered by address.
    pub fn blocks(&self) -> impl Iterator<Item = FlowBlockId> + '_ {
        self.blocks.values().copied()
    }

    /// The block control enters the function through.
    pub fn entry_block(&self) -> Option<FlowBlockId> {
        let offset = self.entrypoint.offset();
        self.blocks
            .range((offset, false)..=(offset, true))
            .next()
            .map(|(_, &id)| id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnalysisState {
    Branch,
    Continue,
}

/// Recovered control flow graph. Function 0 is the program entry.
#[derive(Debug, Clone)]
pub struct Cfg {
    functions: Vec<Function>,
    blocks: Vec<FlowBlock>,
}

impl Cfg {
    pub fn new(env: &mut dyn Environment, start: Location) -> Result<Self> {
        let mut builder = CfgBuilder {
            env,
            cfg: Cfg {
                functions: Vec::new(),
                blocks: Vec::new(),
            },
        };
        builder.add_function(start);
        let mut function_id = 0;
        while function_id < builder.cfg.functions.len() {
            while let Some(label) = builder.cfg.functions[function_id].labels.pop() {
                builder.analyze_label(function_id, label)?;
            }
            function_id += 1;
        }
        let cfg = builder.cfg;
        debug!(
            functions = cfg.functions.len(),
            blocks = cfg.blocks.len(),
            "recovered control flow graph"
        );
        Ok(cfg)
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        Self {
            functions: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn block(&self, id: FlowBlockId) -> &FlowBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Graphviz rendering, handy when a shader fails to structurize.
    pub fn dot(&self) -> String {
        use std::fmt::Write;

        let mut out = String::from("digraph shader {\n");
        for (function_id, function) in self.functions.iter().enumerate() {
            let _ = writeln!(out, "  subgraph cluster_{function_id} {{");
            let _ = writeln!(out, "    label = \"function {}\";", function.entrypoint);
            for id in function.blocks() {
                let block = self.block(id);
                let _ = writeln!(
                    out,
                    "    b{} [label=\"{}..{}{}\"];",
                    id.0,
                    block.begin,
                    block.end,
                    if block.is_virtual { " (virtual)" } else { "" }
                );
                match block.end_class {
                    EndClass::Branch => {
                        if let Some(target) = block.branch_true {
                            let _ = writeln!(
                                out,
                                "    b{} -> b{} [label=\"{}\"];",
                                id.0, target.0, block.cond
                            );
                        }
                        if let Some(target) = block.branch_false {
                            let _ =
                                writeln!(out, "    b{} -> b{} [label=\"else\"];", id.0, target.0);
                        }
                    }
                    EndClass::Call => {
                        if let Some(target) = block.return_block {
                            let _ = writeln!(
                                out,
                                "    b{} -> b{} [label=\"call {}\"];",
                                id.0, target.0, block.function_call
                            );
                        }
                    }
                    EndClass::Kill => {
                        if let Some(target) = block.branch_true {
                            let _ =
                                writeln!(out, "    b{} -> b{} [label=\"kill\"];", id.0, target.0);
                        }
                    }
                    EndClass::Exit | EndClass::Return => {}
                }
            }
            out.push_str("  }\n");
        }
        out.push_str("}\n");
        out
    }
}

struct CfgBuilder<'e> {
    env: &'e mut dyn Environment,
    cfg: Cfg,
}

impl CfgBuilder<'_> {
    fn block(&mut self, id: FlowBlockId) -> &mut FlowBlock {
        &mut self.cfg.blocks[id.0 as usize]
    }

    fn new_block(&mut self, block: FlowBlock) -> FlowBlockId {
        let id = FlowBlockId(self.cfg.blocks.len() as u32);
        self.cfg.blocks.push(block);
        id
    }

    fn add_function(&mut self, entrypoint: Location) -> FunctionId {
        let block = self.new_block(FlowBlock::empty(entrypoint, Stack::default()));
        let mut blocks = BTreeMap::new();
        blocks.insert((entrypoint.offset(), true), block);
        self.cfg.functions.push(Function {
            entrypoint,
            blocks,
            labels: vec![Label {
                address: entrypoint,
                block,
                stack: Stack::default(),
            }],
        });
        self.cfg.functions.len() - 1
    }

    fn analyze_label(&mut self, function_id: FunctionId, label: Label) -> Result<()> {
        if self.inspect_visited_blocks(function_id, &label)? {
            return Ok(());
        }
        let next = self.cfg.functions[function_id]
            .blocks
            .range((label.address.offset() + 1, false)..)
            .next()
            .map(|(_, &id)| id);
        let next_begin = next.map(|id| self.cfg.blocks[id.0 as usize].begin);

        let block = label.block;
        {
            let block = self.block(block);
            block.begin = label.address;
            block.stack = label.stack;
        }
        let mut pc = label.address;
        let mut is_branch = false;
        while next_begin.map_or(true, |begin| pc < begin) {
            if pc.offset() >= MAX_PROGRAM_SIZE {
                return Err(ShaderError::logic(format!(
                    "control flow runs past the end of program memory from {}",
                    label.address
                )));
            }
            if self.analyze_inst(block, function_id, pc)? == AnalysisState::Branch {
                is_branch = true;
                break;
            }
            pc = pc.next();
        }
        if !is_branch {
            let block = self.block(block);
            block.end = pc;
            block.cond = Condition::TRUE;
            block.branch_true = next;
            block.branch_false = None;
        }
        Ok(())
    }

    /// Splits the analyzed block containing the label, if any.
    fn inspect_visited_blocks(&mut self, function_id: FunctionId, label: &Label) -> Result<bool> {
        let pc = label.address;
        let visited = self.cfg.functions[function_id]
            .blocks
            .values()
            .copied()
            .find(|&id| self.cfg.blocks[id.0 as usize].contains(pc));
        let Some(visited) = visited else {
            return Ok(false);
        };
        if self.cfg.blocks[visited.0 as usize].begin == pc {
            return Err(ShaderError::logic(format!("dangling block at {pc}")));
        }
        self.split(visited, label.block, pc);
        Ok(true)
    }

    /// Ends `old` at `pc`; `new` takes over `[pc, old.end)` and everything `old` ended with.
    fn split(&mut self, old: FlowBlockId, new: FlowBlockId, pc: Location) {
        let old_block = self.cfg.blocks[old.0 as usize].clone();
        *self.block(new) = FlowBlock {
            begin: pc,
            is_virtual: false,
            ..old_block.clone()
        };
        *self.block(old) = FlowBlock {
            end: pc,
            end_class: EndClass::Branch,
            cond: Condition::TRUE,
            branch_true: Some(new),
            branch_false: None,
            return_block: None,
            ..old_block
        };
    }

    fn analyze_inst(
        &mut self,
        block: FlowBlockId,
        function_id: FunctionId,
        pc: Location,
    ) -> Result<AnalysisState> {
        let raw = self.env.read_instruction(pc.offset());
        let inst = Instruction(raw);
        let opcode = decode(pc.offset(), raw)?;
        match opcode {
            Opcode::Bra | Opcode::Ret => {
                if !self.analyze_branch(block, function_id, pc, inst) {
                    return Ok(AnalysisState::Continue);
                }
                if opcode == Opcode::Bra {
                    let target = branch_target(pc, inst)?;
                    let stack = self.block(block).stack.clone();
                    let target_block = self.add_label(block, stack, target, function_id);
                    self.block(block).branch_true = Some(target_block);
                } else {
                    self.block(block).end_class = EndClass::Return;
                }
                self.block(block).end = pc;
                Ok(AnalysisState::Branch)
            }
            Opcode::Brk | Opcode::Sync => {
                if !self.analyze_branch(block, function_id, pc, inst) {
                    return Ok(AnalysisState::Continue);
                }
                let token = if opcode == Opcode::Brk { Token::Pbk } else { Token::Ssy };
                let (target, stack) = self.block(block).stack.pop(token)?;
                let target_block = self.add_label(block, stack, target, function_id);
                let block = self.block(block);
                block.branch_true = Some(target_block);
                block.end = pc;
                Ok(AnalysisState::Branch)
            }
            Opcode::Kil => {
                let (pred, negated) = inst.pred();
                let cond = Condition::new(pred, negated);
                self.analyze_cond_inst(block, function_id, pc, EndClass::Kill, cond);
                Ok(AnalysisState::Branch)
            }
            Opcode::Pbk | Opcode::Ssy => {
                let token = if opcode == Opcode::Pbk { Token::Pbk } else { Token::Ssy };
                let target = branch_target(pc, inst)?;
                self.block(block).stack.push(token, target);
                Ok(AnalysisState::Continue)
            }
            Opcode::Exit => Ok(self.analyze_exit(block, function_id, pc, inst)),
            Opcode::Cal => {
                let target = branch_target(pc, inst)?;
                let existing = self
                    .cfg
                    .functions
                    .iter()
                    .position(|function| function.entrypoint == target);
                let call_id = match existing {
                    Some(id) => id,
                    None => self.add_function(target),
                };
                let stack = self.block(block).stack.clone();
                let return_block = self.add_label(block, stack, pc.next(), function_id);
                let block = self.block(block);
                block.end_class = EndClass::Call;
                block.function_call = call_id;
                block.return_block = Some(return_block);
                block.end = pc;
                Ok(AnalysisState::Branch)
            }
            _ => {
                let (pred, negated) = inst.pred();
                if pred == Pred::PT {
                    return Ok(AnalysisState::Continue);
                }
                let cond = Condition::new(pred, negated);
                self.analyze_cond_inst(block, function_id, pc, EndClass::Branch, cond);
                Ok(AnalysisState::Branch)
            }
        }
    }

    /// Records the guard of a branch-class instruction. Returns false if it is never taken.
    fn analyze_branch(
        &mut self,
        block: FlowBlockId,
        function_id: FunctionId,
        pc: Location,
        inst: Instruction,
    ) -> bool {
        if inst.is_never_executed() {
            return false;
        }
        if inst.is_unconditional() {
            self.block(block).cond = Condition::TRUE;
        } else {
            let (pred, negated) = inst.pred();
            let stack = self.block(block).stack.clone();
            let fallthrough = self.add_label(block, stack, pc.next(), function_id);
            let block = self.block(block);
            block.cond = Condition::new(pred, negated);
            block.branch_false = Some(fallthrough);
        }
        true
    }

    fn analyze_exit(
        &mut self,
        block: FlowBlockId,
        function_id: FunctionId,
        pc: Location,
        inst: Instruction,
    ) -> AnalysisState {
        if inst.is_never_executed() {
            return AnalysisState::Continue;
        }
        if !inst.is_unconditional() {
            let (pred, negated) = inst.pred();
            let cond = Condition::new(pred, negated);
            self.analyze_cond_inst(block, function_id, pc, EndClass::Exit, cond);
            return AnalysisState::Branch;
        }
        let block = self.block(block);
        block.end = pc.next();
        block.end_class = EndClass::Exit;
        AnalysisState::Branch
    }

    /// Isolates a guarded instruction into its own block, entered through a virtual block that
    /// tests the guard and otherwise skips to the next instruction.
    fn analyze_cond_inst(
        &mut self,
        block: FlowBlockId,
        function_id: FunctionId,
        pc: Location,
        end_class: EndClass,
        cond: Condition,
    ) {
        if self.cfg.blocks[block.0 as usize].begin != pc {
            // Start a fresh block at the guarded instruction and come back to it later.
            let stack = self.block(block).stack.clone();
            let target = self.add_label(block, stack, pc, function_id);
            let block = self.block(block);
            block.end = pc;
            block.cond = Condition::TRUE;
            block.branch_true = Some(target);
            block.branch_false = None;
            return;
        }
        let original = self.cfg.blocks[block.0 as usize].clone();
        let stack = original.stack.clone();
        let conditional = self.new_block(FlowBlock {
            end: pc.next(),
            end_class,
            ..original.clone()
        });
        *self.block(block) = FlowBlock {
            begin: pc,
            end: pc,
            is_virtual: true,
            end_class: EndClass::Branch,
            cond,
            stack: stack.clone(),
            branch_true: Some(conditional),
            branch_false: None,
            function_call: 0,
            return_block: None,
        };
        let blocks = &mut self.cfg.functions[function_id].blocks;
        blocks.remove(&original.key());
        blocks.insert((pc.offset(), false), block);
        blocks.insert((pc.offset(), true), conditional);

        let endif = self.add_label(conditional, stack, pc.next(), function_id);
        self.block(block).branch_false = Some(endif);
        // Kills demote and keep executing, so they rejoin like branches do.
        if matches!(end_class, EndClass::Branch | EndClass::Kill) {
            let conditional = self.block(conditional);
            conditional.cond = Condition::TRUE;
            conditional.branch_true = Some(endif);
            conditional.branch_false = None;
        }
    }

    /// Returns the block starting at `pc`, creating it (and queueing its analysis) if needed.
    fn add_label(
        &mut self,
        from: FlowBlockId,
        stack: Stack,
        pc: Location,
        function_id: FunctionId,
    ) -> FlowBlockId {
        let from_block = &self.cfg.blocks[from.0 as usize];
        if from_block.begin == pc && !from_block.is_virtual {
            return from;
        }
        let function = &self.cfg.functions[function_id];
        if let Some((_, &id)) = function
            .blocks
            .range((pc.offset(), false)..=(pc.offset(), true))
            .next()
        {
            return id;
        }
        let block = self.new_block(FlowBlock::empty(pc, stack.clone()));
        let function = &mut self.cfg.functions[function_id];
        function.blocks.insert((pc.offset(), true), block);
        function.labels.push(Label {
            address: pc,
            block,
            stack,
        });
        block
    }
}

fn branch_target(pc: Location, inst: Instruction) -> Result<Location> {
    let next = i64::from(pc.offset()) + i64::from(Location::INSTRUCTION_SIZE);
    u32::try_from(next + i64::from(inst.branch_offset()))
        .ok()
        .filter(|&target| {
            target.is_multiple_of(Location::INSTRUCTION_SIZE) && target < MAX_PROGRAM_SIZE
        })
        .map(Location::new)
        .ok_or(ShaderError::InvalidEncoding {
            address: pc.offset(),
            raw: inst.0,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_pop_drops_inner_entries() {
        let mut stack = Stack::default();
        stack.push(Token::Ssy, Location::new(0x48));
        stack.push(Token::Pbk, Location::new(0x88));
        stack.push(Token::Ssy, Location::new(0x68));
        let (target, rest) = stack.pop(Token::Pbk).unwrap();
        assert_eq!(target.offset(), 0x88);
        assert_eq!(rest.peek(Token::Ssy).map(Location::offset), Some(0x48));
        assert_eq!(rest.peek(Token::Pbk), None);
        assert!(matches!(rest.pop(Token::Pbk), Err(ShaderError::Logic(_))));
    }

    #[test]
    fn branch_targets_stay_inside_the_program() {
        let bra = |offset: i32| {
            Instruction(0xE240_0000_0007_000F | ((offset as u32 as u64 & 0xFF_FFFF) << 20))
        };
        let pc = Location::new(8);
        assert_eq!(branch_target(pc, bra(16)).unwrap().offset(), 40);
        assert_eq!(branch_target(pc, bra(-8)).unwrap().offset(), 8);
        assert!(branch_target(pc, bra(-24)).is_err());
        assert!(branch_target(pc, bra(4)).is_err());
        assert!(branch_target(pc, bra(MAX_PROGRAM_SIZE as i32)).is_err());
    }
}
