//! Typed SSA intermediate representation shared by every frontend and backend.

mod emitter;
mod modifiers;
mod opcodes;
pub mod passes;
mod program;
mod types;
mod value;

pub use emitter::{IntCompare, IrEmitter};
pub use modifiers::{FmzMode, FpControl, FpRounding, InstFlags, TextureInstInfo};
pub use opcodes::{FpCompare, Opcode};
pub use program::{AbstractSyntaxNode, Block, Inst, IrPools, Program};
pub use types::Type;
pub use value::{Attribute, BlockId, InstId, Pred, Reg, Value};
