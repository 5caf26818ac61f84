use tracing::debug;

use crate::environment::Environment;
use crate::error::{Result, ShaderError};
use crate::ir::{passes, IrPools, Program};
use crate::stage::Stage;

use super::control_flow::Cfg;
use super::location::Location;
use super::structured_control_flow::build_syntax_list;

/// Recovers the control flow of the program `env` describes and translates it.
pub fn translate_program(pools: &mut IrPools, env: &mut dyn Environment) -> Result<Program> {
    let start = Location::new(env.start_address());
    let cfg = Cfg::new(env, start)?;
    translate_program_with_cfg(pools, env, &cfg)
}

/// Translates a program whose control flow graph is already known.
pub fn translate_program_with_cfg(
    pools: &mut IrPools,
    env: &mut dyn Environment,
    cfg: &Cfg,
) -> Result<Program> {
    let stage = env.stage();
    if stage == Stage::VertexA {
        return Err(ShaderError::not_implemented("standalone VertexA program"));
    }
    let (insts, blocks) = pools.take();
    let mut program = Program::with_storage(stage, insts, blocks);
    build_syntax_list(&mut program, env, cfg)?;
    passes::optimize(&mut program)?;
    if stage == Stage::Compute {
        program.workgroup_size = env.workgroup_size();
        program.shared_memory_size = env.shared_memory_size();
    }
    debug!(
        stage = %stage,
        blocks = program.block_order.len(),
        insts = program.num_live_insts(),
        "translated program"
    );
    Ok(program)
}
