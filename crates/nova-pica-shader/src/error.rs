use thiserror::Error;

use crate::bytecode::OpCode;

/// Control-flow analysis failures. Any of these rejects the whole program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzeError {
    #[error("recursive function detected at {begin}..{end}")]
    RecursiveFunction { begin: u32, end: u32 },

    #[error("program does not always end")]
    NoEnd,

    #[error("offset {offset} is outside program memory")]
    OutOfRange { offset: u32 },
}

/// Decompilation failure, positioned at the offending instruction when one is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompileError {
    pub offset: Option<u32>,
    pub opcode: Option<OpCode>,
    pub message: String,
}

impl DecompileError {
    pub(crate) fn unhandled(offset: u32, opcode: OpCode, raw: u32) -> Self {
        Self {
            offset: Some(offset),
            opcode: Some(opcode),
            message: format!("unhandled instruction 0x{raw:08x}"),
        }
    }

    pub(crate) fn backward_target(offset: u32, opcode: OpCode, target: u32) -> Self {
        Self {
            offset: Some(offset),
            opcode: Some(opcode),
            message: format!("target {target} does not follow the instruction"),
        }
    }
}

impl std::fmt::Display for DecompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.offset, self.opcode) {
            (Some(offset), Some(opcode)) => write!(
                f,
                "PICA decompile error at {offset}, opcode {opcode}: {}",
                self.message
            ),
            _ => write!(f, "PICA decompile error: {}", self.message),
        }
    }
}

impl std::error::Error for DecompileError {}

impl From<AnalyzeError> for DecompileError {
    fn from(err: AnalyzeError) -> Self {
        Self {
            offset: None,
            opcode: None,
            message: err.to_string(),
        }
    }
}
