//! Optimization and analysis passes, run in the order [`optimize`] lists them.

mod collect_info;
mod constant_propagation;
mod dead_code_elimination;
mod identity_removal;
mod post_order;
mod ssa;
mod verify;

pub use collect_info::collect_shader_info;
pub use constant_propagation::constant_propagation;
pub use dead_code_elimination::dead_code_elimination;
pub use identity_removal::identity_removal;
pub use post_order::post_order;
pub use ssa::ssa_rewrite;
pub use verify::verify;

use crate::error::Result;

use super::Program;

/// Standard pipeline from a freshly lowered program to one ready for emission.
pub fn optimize(program: &mut Program) -> Result<()> {
    program.post_order_blocks = post_order(program);
    ssa_rewrite(program);
    identity_removal(program);
    constant_propagation(program);
    identity_removal(program);
    dead_code_elimination(program);
    verify(program)?;
    collect_shader_info(program);
    Ok(())
}
