//! Code generation from optimized IR.
//!
//! Three targets share one IR walk: NV_gpu_program5 assembly ([`emit_glasm`]), GLSL
//! ([`emit_glsl`]) and SPIR-V ([`emit_spirv`]). Lowering choices that depend on host quirks live in
//! [`policy`] so every target makes them the same way.

mod bindings;
mod glasm;
mod glsl;
pub mod policy;
mod spirv;

pub use bindings::Bindings;
pub use glasm::emit_glasm;
pub use glsl::emit_glsl;
pub use spirv::emit_spirv;

use crate::error::{Result, ShaderError};
use crate::ir::{AbstractSyntaxNode, BlockId, InstId, Opcode, Program, Value};
use crate::stage::Stage;

/// Stages the backends can emit.
pub(crate) fn check_stage(stage: Stage) -> Result<()> {
    match stage {
        Stage::VertexB | Stage::Fragment | Stage::Compute => Ok(()),
        other => Err(ShaderError::not_implemented(format!("{other} stage emission"))),
    }
}

/// A write of `value` into the variable backing `phi`.
pub(crate) type PhiMove = (InstId, Value);

/// Phi writes performed when control moves from `from` to `to`, in phi order.
pub(crate) fn phi_moves(program: &Program, from: BlockId, to: BlockId) -> Vec<PhiMove> {
    program
        .phis(to)
        .filter_map(|phi| {
            let inst = program.inst(phi);
            let index = inst.phi_blocks.iter().position(|&pred| pred == from)?;
            Some((phi, inst.arg(index)))
        })
        .collect()
}

/// A parallel copy needs staging when one of its sources is a phi it overwrites.
pub(crate) fn moves_need_temporaries(program: &Program, moves: &[PhiMove]) -> bool {
    moves.len() > 1
        && moves.iter().any(|(_, source)| {
            source.inst().is_some_and(|id| {
                program.inst(id).opcode == Opcode::Phi && moves.iter().any(|(phi, _)| *phi == id)
            })
        })
}

/// Structured text targets (GLSL, GLASM) implement this; [`walk_structured`] drives them.
pub(crate) trait StructuredEmitter {
    /// Emits the non-phi instructions of `block`.
    fn block(&mut self, block: BlockId) -> Result<()>;

    fn phi_moves(&mut self, moves: &[PhiMove], through_temporaries: bool) -> Result<()>;

    fn open_if(&mut self, cond: Value) -> Result<()>;

    fn close_if(&mut self) -> Result<()>;

    fn open_loop(&mut self) -> Result<()>;

    /// Leaves the innermost loop unless `cond` holds. The back-edge moves follow.
    fn exit_loop_unless(&mut self, cond: Value) -> Result<()>;

    fn close_loop(&mut self) -> Result<()>;

    /// Leaves the innermost loop when `cond` holds, performing `moves` first.
    fn break_if(&mut self, cond: Value, moves: &[PhiMove]) -> Result<()>;

    fn ret(&mut self) -> Result<()>;

    fn unreachable(&mut self) -> Result<()>;
}

/// Edges whose phi writes are placed by the construct that owns them rather than at the end of
/// the source block: loop back edges (after the exit test) and breaks (inside the break).
#[derive(Debug, Default)]
struct DeferredEdges {
    edges: Vec<(BlockId, BlockId)>,
}

impl DeferredEdges {
    fn new(program: &Program) -> Self {
        let mut edges = Vec::new();
        let mut last_block = None;
        for node in &program.syntax_list {
            match *node {
                AbstractSyntaxNode::Block(block) => last_block = Some(block),
                AbstractSyntaxNode::Repeat { loop_header, .. } => {
                    if let Some(block) = last_block {
                        edges.push((block, loop_header));
                    }
                }
                AbstractSyntaxNode::Break { merge, .. } => {
                    if let Some(block) = last_block {
                        edges.push((block, merge));
                    }
                }
                _ => {}
            }
        }
        Self { edges }
    }

    fn contains(&self, from: BlockId, to: BlockId) -> bool {
        self.edges.contains(&(from, to))
    }
}

pub(crate) fn walk_structured(
    program: &Program,
    emitter: &mut impl StructuredEmitter,
) -> Result<()> {
    let deferred = DeferredEdges::new(program);
    let mut last_block = None;
    for node in &program.syntax_list {
        match *node {
            AbstractSyntaxNode::Block(block) => {
                emitter.block(block)?;
                for &succ in &program.block(block).imm_successors {
                    if deferred.contains(block, succ) {
                        continue;
                    }
                    let moves = phi_moves(program, block, succ);
                    if !moves.is_empty() {
                        emitter.phi_moves(&moves, false)?;
                    }
                }
                last_block = Some(block);
            }
            AbstractSyntaxNode::If { cond, .. } => emitter.open_if(cond)?,
            AbstractSyntaxNode::EndIf { .. } => emitter.close_if()?,
            AbstractSyntaxNode::Loop { .. } => emitter.open_loop()?,
            AbstractSyntaxNode::Repeat { cond, loop_header, .. } => {
                emitter.exit_loop_unless(cond)?;
                let from = last_block
                    .ok_or_else(|| ShaderError::logic("repeat without a continue block"))?;
                let moves = phi_moves(program, from, loop_header);
                if !moves.is_empty() {
                    emitter.phi_moves(&moves, moves_need_temporaries(program, &moves))?;
                }
                emitter.close_loop()?;
            }
            AbstractSyntaxNode::Break { cond, merge, .. } => {
                let from = last_block.ok_or_else(|| ShaderError::logic("break without a block"))?;
                emitter.break_if(cond, &phi_moves(program, from, merge))?;
            }
            AbstractSyntaxNode::Return => emitter.ret()?,
            AbstractSyntaxNode::Unreachable => emitter.unreachable()?,
        }
    }
    Ok(())
}
