use std::io;

use nova_shader::ShaderError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid pipeline cache magic")]
    InvalidMagic,

    #[error("unsupported pipeline cache version {0}")]
    UnsupportedVersion(u32),

    #[error("corrupt pipeline cache: {0}")]
    Corrupt(&'static str),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("shader translation failed: {0}")]
    Shader(#[from] ShaderError),

    #[error("pipeline build failed: {0}")]
    Build(String),
}
