use std::path::PathBuf;

use serde::Deserialize;

/// Code generation target of the host renderer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum ShaderBackend {
    #[serde(alias = "glasm")]
    Glasm,
    #[default]
    #[serde(alias = "glsl")]
    Glsl,
    #[serde(alias = "spirv", alias = "SPIRV")]
    SpirV,
}

impl ShaderBackend {
    /// File stem of the disk cache for this backend.
    pub fn cache_name(self) -> &'static str {
        match self {
            ShaderBackend::Glasm => "glasm",
            ShaderBackend::Glsl => "glsl",
            ShaderBackend::SpirV => "spirv",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineCacheConfig {
    /// Build pipelines on the worker pool instead of the calling thread.
    pub use_asynchronous_shaders: bool,
    pub shader_backend: ShaderBackend,
    /// Root of the per-title disk caches. `None` disables persistence.
    pub disk_cache_dir: Option<PathBuf>,
    /// Worker thread count. `None` sizes the pool from the host's parallelism.
    pub worker_count: Option<usize>,
}

impl PipelineCacheConfig {
    pub fn worker_count(&self) -> usize {
        self.worker_count
            .unwrap_or_else(crate::workers::default_worker_count)
            .max(1)
    }
}
