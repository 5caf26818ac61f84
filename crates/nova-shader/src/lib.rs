//! Maxwell shader recompiler.
//!
//! Guest programs are read through an [`Environment`], their control flow is recovered
//! ([`maxwell::Cfg`]) and structured, and the result is lowered into a typed SSA [`Program`]. The
//! optimized program is then emitted as GLASM, GLSL or SPIR-V under the host's [`Profile`] and the
//! pipeline's [`RuntimeInfo`].
//!
//! ```no_run
//! # fn demo(env: &mut dyn nova_shader::Environment) -> nova_shader::Result<()> {
//! use nova_shader::{emit_spirv, translate_program, Bindings, IrPools, Profile, RuntimeInfo};
//!
//! let mut pools = IrPools::new();
//! let program = translate_program(&mut pools, env)?;
//! let runtime_info = RuntimeInfo::default();
//! let words = emit_spirv(&Profile::default(), &runtime_info, &program, &mut Bindings::new())?;
//! pools.release(program);
//! # let _ = words;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod environment;
mod error;
pub mod info;
pub mod ir;
pub mod maxwell;
pub mod profile;
mod stage;

pub use backend::{emit_glasm, emit_glsl, emit_spirv, Bindings};
pub use environment::{Environment, ProgramHeader, TextureInfo, TextureType};
pub use error::{Result, ShaderError};
pub use info::Info;
pub use ir::{IrPools, Program};
pub use maxwell::{translate_program, translate_program_with_cfg};
pub use profile::{InputTopology, Profile, RuntimeInfo, TessPrimitive, TessSpacing, ALL_GENERICS};
pub use stage::Stage;
