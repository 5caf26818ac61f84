use thiserror::Error;

/// Failure raised anywhere between CFG recovery and backend emission.
///
/// None of these are fatal to the embedder: a failed translation means "no shader for this
/// pipeline", and the pipeline cache records that outcome as a null entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShaderError {
    #[error("not implemented: {what}")]
    NotImplemented { what: String },

    #[error("invalid instruction encoding at 0x{address:x}: 0x{raw:016x}")]
    InvalidEncoding { address: u32, raw: u64 },

    #[error("logic error: {0}")]
    Logic(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ShaderError {
    pub(crate) fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented { what: what.into() }
    }

    pub(crate) fn logic(message: impl Into<String>) -> Self {
        Self::Logic(message.into())
    }
}

pub type Result<T, E = ShaderError> = std::result::Result<T, E>;
