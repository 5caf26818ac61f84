//! Pipeline cache for translated guest shaders.
//!
//! [`PipelineCache`] turns per-draw register snapshots ([`GraphicsState`], [`ComputeState`]) into
//! byte-comparable keys, translates the guest programs behind a new key with `nova_shader`, and
//! hands the emitted modules to a host [`PipelineBackend`]. Builds can run on a worker pool, and
//! every successful build is appended to a per-title [`DiskCache`] that
//! [`PipelineCache::load_disk_resources`] replays on the next run.

mod config;
mod disk_cache;
mod environment;
mod error;
mod graphics_state;
mod io;
mod pipeline_cache;
mod pipeline_key;
mod runtime_info;
mod stats;
mod sync;
mod workers;

pub use config::{PipelineCacheConfig, ShaderBackend};
pub use disk_cache::{DiskCache, DiskRecord, CACHE_MAGIC, CACHE_VERSION};
pub use environment::{FileEnvironment, GenericEnvironment, GpuMemory, MAX_PROGRAM_SIZE};
pub use error::{CacheError, Result};
pub use graphics_state::{
    shader_type, ComputeState, ConstBufferBinding, GraphicsState, PrimitiveTopology, StageProgram,
    TessellationDomain, TessellationSpacing, TessellationState, NUM_COMPUTE_CONST_BUFFERS,
    NUM_CONST_BUFFERS, NUM_SHADER_TYPES,
};
pub use io::{ReadLeExt, WriteLeExt};
pub use pipeline_cache::{
    translate_compute, translate_graphics, CachedPipeline, LoadStage, PipelineBackend,
    PipelineCache, ShaderCode, ShaderModule,
};
pub use pipeline_key::{ComputePipelineKey, GraphicsPipelineKey};
pub use runtime_info::{input_topology, make_runtime_info};
pub use stats::{PipelineCacheStats, PipelineCacheStatsSnapshot};
pub use workers::{default_worker_count, ShaderWorkers, WorkerContext};
