//! Frontend for the Maxwell instruction set: decoding, control flow recovery, structurization
//! and translation into IR.

pub mod control_flow;
pub mod instruction;
pub mod location;
mod program;
mod structured_control_flow;
mod translate;

pub use control_flow::Cfg;
pub use instruction::{decode, Instruction, Opcode};
pub use location::Location;
pub use program::{translate_program, translate_program_with_cfg};
