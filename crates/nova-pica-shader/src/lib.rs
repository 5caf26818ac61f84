//! GLSL decompiler for PICA200 vertex shader programs.
//!
//! [`ControlFlowAnalyzer`] discovers the subroutines of a program and how each one exits;
//! [`decompile_program`] turns the analysis into GLSL functions the host shader calls through
//! `exec_shader()`.

pub mod analyzer;
pub mod bytecode;
mod decompiler;
mod error;
mod writer;

pub use analyzer::{ControlFlowAnalyzer, ExitMethod, Subroutine, SubroutineSet, PROGRAM_END};
pub use decompiler::{decompile_program, try_decompile_program, RegGetter};
pub use error::{AnalyzeError, DecompileError};
