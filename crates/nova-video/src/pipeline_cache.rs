//! Memoized graphics and compute pipelines keyed by guest GPU state.
//!
//! Every lookup recomputes its key from the register snapshot. A key equal to the previous
//! draw's key returns the previous pipeline without probing the map. A new key is inserted as a
//! pending entry before its build starts, so concurrent callers asking for the same key share
//! one build and one entry. Entries are never evicted, and a failed build stays in the map as a
//! null entry so the same key is not retried.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use nova_shader::{
    emit_glasm, emit_glsl, emit_spirv, translate_program, Bindings, Environment, Info, IrPools,
    Profile, RuntimeInfo, ShaderError, Stage,
};
use tracing::{debug, error, info, warn};

use crate::config::{PipelineCacheConfig, ShaderBackend};
use crate::disk_cache::{DiskCache, DiskRecord};
use crate::environment::{FileEnvironment, GenericEnvironment, GpuMemory};
use crate::error::{CacheError, Result};
use crate::graphics_state::{ComputeState, GraphicsState};
use crate::pipeline_key::{ComputePipelineKey, GraphicsPipelineKey};
use crate::runtime_info::make_runtime_info;
use crate::stats::{PipelineCacheStats, PipelineCacheStatsSnapshot};
use crate::sync::{lock, wait};
use crate::workers::{ShaderWorkers, WorkerContext};

/// Draws with at most this many indices or vertices are assumed to be one-off full screen passes.
const SMALL_DRAW_COUNT: u32 = 6;
const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Emitted code for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderCode {
    Glasm(String),
    Glsl(String),
    SpirV(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderModule {
    pub stage: Stage,
    pub code: ShaderCode,
    /// Resources the module declares, for building host bindings.
    pub info: Info,
}

/// Host graphics API object creation.
pub trait PipelineBackend: Send + Sync + 'static {
    type Pipeline: Send + Sync + 'static;

    /// Links `modules` (pipeline order) into a graphics pipeline.
    fn create_graphics_pipeline(
        &self,
        key: &GraphicsPipelineKey,
        modules: Vec<ShaderModule>,
    ) -> Result<Self::Pipeline>;

    fn create_compute_pipeline(
        &self,
        key: &ComputePipelineKey,
        module: ShaderModule,
    ) -> Result<Self::Pipeline>;
}

/// Progress phases reported by [`PipelineCache::load_disk_resources`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Prepare,
    Build,
    Complete,
}

/// A cache entry: pending until its build finishes, then built or null.
pub struct CachedPipeline<P> {
    key_hash: u64,
    outcome: OnceLock<Option<P>>,
    lock: Mutex<()>,
    done: Condvar,
}

impl<P> CachedPipeline<P> {
    fn pending(key_hash: u64) -> Self {
        Self {
            key_hash,
            outcome: OnceLock::new(),
            lock: Mutex::new(()),
            done: Condvar::new(),
        }
    }

    fn built(key_hash: u64, pipeline: P) -> Self {
        let entry = Self::pending(key_hash);
        let _ = entry.outcome.set(Some(pipeline));
        entry
    }

    fn finish(&self, pipeline: Option<P>) {
        let _ = self.outcome.set(pipeline);
        let _guard = lock(&self.lock);
        self.done.notify_all();
    }

    pub fn key_hash(&self) -> u64 {
        self.key_hash
    }

    /// The build has finished, successfully or not.
    pub fn is_built(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome.get(), Some(None))
    }

    /// The pipeline, if its build has finished successfully.
    pub fn get(&self) -> Option<&P> {
        self.outcome.get().and_then(Option::as_ref)
    }

    /// Blocks until the build finishes. `None` when it failed.
    pub fn wait(&self) -> Option<&P> {
        let mut guard = lock(&self.lock);
        while self.outcome.get().is_none() {
            guard = wait(&self.done, guard);
        }
        drop(guard);
        self.get()
    }
}

impl<P> std::fmt::Debug for CachedPipeline<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPipeline")
            .field("key_hash", &format_args!("{:016x}", self.key_hash))
            .field("built", &self.is_built())
            .field("failed", &self.is_failed())
            .finish()
    }
}

type Shared<P> = Arc<CachedPipeline<P>>;

pub struct PipelineCache<B: PipelineBackend> {
    config: PipelineCacheConfig,
    profile: Profile,
    backend: Arc<B>,
    memory: Arc<dyn GpuMemory>,
    stats: Arc<PipelineCacheStats>,

    graphics_cache: Mutex<HashMap<GraphicsPipelineKey, Shared<B::Pipeline>>>,
    compute_cache: Mutex<HashMap<ComputePipelineKey, Shared<B::Pipeline>>>,
    current_graphics: Mutex<Option<(GraphicsPipelineKey, Shared<B::Pipeline>)>>,
    /// Unique hash per program address, computed the first time a program is seen.
    shader_hashes: Mutex<HashMap<u64, u64>>,

    main_pools: Mutex<IrPools>,
    workers: Option<Arc<ShaderWorkers>>,
    disk_cache: Mutex<Option<Arc<DiskCache>>>,
}

impl<B: PipelineBackend> PipelineCache<B> {
    pub fn new(
        config: PipelineCacheConfig,
        profile: Profile,
        backend: B,
        memory: Arc<dyn GpuMemory>,
    ) -> Result<Self> {
        let workers = if config.use_asynchronous_shaders {
            Some(Arc::new(ShaderWorkers::new(config.worker_count(), "ShaderBuilder")?))
        } else {
            None
        };
        Ok(Self {
            config,
            profile,
            backend: Arc::new(backend),
            memory,
            stats: Arc::new(PipelineCacheStats::new()),
            graphics_cache: Mutex::new(HashMap::new()),
            compute_cache: Mutex::new(HashMap::new()),
            current_graphics: Mutex::new(None),
            shader_hashes: Mutex::new(HashMap::new()),
            main_pools: Mutex::new(IrPools::new()),
            workers,
            disk_cache: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PipelineCacheConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineCacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn num_graphics_pipelines(&self) -> usize {
        lock(&self.graphics_cache).len()
    }

    pub fn num_compute_pipelines(&self) -> usize {
        lock(&self.compute_cache).len()
    }

    /// Persists future builds to `cache` without loading it.
    pub fn set_disk_cache(&self, cache: DiskCache) {
        *lock(&self.disk_cache) = Some(Arc::new(cache));
    }

    /// Forgets memoized program hashes whose header lies in `[address, address + size)`, so the
    /// next draw rehashes guest memory that has been rewritten.
    pub fn invalidate_region(&self, address: u64, size: u64) {
        let end = address.saturating_add(size);
        lock(&self.shader_hashes).retain(|&program, _| program < address || program >= end);
    }

    /// Pipeline for the draw described by `state`.
    ///
    /// `None` means the draw should be skipped: the key's build failed, or it is still building
    /// asynchronously and the draw looks cheap enough to drop. A returned pipeline may still be
    /// building; [`CachedPipeline::wait`] blocks until it is ready.
    pub fn current_graphics_pipeline(&self, state: &GraphicsState) -> Option<Shared<B::Pipeline>> {
        let Some(hashes) = self.refresh_stages(state) else {
            lock(&self.current_graphics).take();
            return None;
        };
        let key = GraphicsPipelineKey::new(hashes, state);
        let current = lock(&self.current_graphics)
            .as_ref()
            .filter(|(current_key, _)| *current_key == key)
            .map(|(_, pipeline)| Arc::clone(pipeline));
        if let Some(pipeline) = current {
            self.stats.inc_fast_path_hits();
            return self.built_pipeline(pipeline, state);
        }
        self.current_graphics_pipeline_slow_path(key, state)
    }

    fn current_graphics_pipeline_slow_path(
        &self,
        key: GraphicsPipelineKey,
        state: &GraphicsState,
    ) -> Option<Shared<B::Pipeline>> {
        let (pipeline, is_new) = match lock(&self.graphics_cache).entry(key) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let pipeline = Arc::new(CachedPipeline::pending(key.key_hash()));
                entry.insert(Arc::clone(&pipeline));
                (pipeline, true)
            }
        };
        if is_new {
            self.stats.inc_misses();
            self.build_graphics_pipeline(key, state, &pipeline);
        } else {
            self.stats.inc_map_hits();
        }
        *lock(&self.current_graphics) = Some((key, Arc::clone(&pipeline)));
        self.built_pipeline(pipeline, state)
    }

    fn built_pipeline(
        &self,
        pipeline: Shared<B::Pipeline>,
        state: &GraphicsState,
    ) -> Option<Shared<B::Pipeline>> {
        if pipeline.is_failed() {
            return None;
        }
        if pipeline.is_built() || !self.config.use_asynchronous_shaders {
            return Some(pipeline);
        }
        // Depth writes and larger draws are unlikely to be throwaway passes; wait for those.
        let count = state.index_count.max(state.vertex_count);
        if state.depth_write_enabled || count > SMALL_DRAW_COUNT {
            return Some(pipeline);
        }
        None
    }

    /// Unique hash per program slot, or `None` when no stage is enabled.
    fn refresh_stages(&self, state: &GraphicsState) -> Option<[u64; Stage::NUM_GRAPHICS]> {
        let mut hashes = [0u64; Stage::NUM_GRAPHICS];
        let mut known = lock(&self.shader_hashes);
        for stage in Stage::GRAPHICS {
            if !state.program(stage).enabled {
                continue;
            }
            let address = state.program_address(stage);
            let hash = *known.entry(address).or_insert_with(|| {
                // Zero marks a disabled slot in the key.
                GenericEnvironment::graphics(&*self.memory, state, stage)
                    .unique_hash()
                    .max(1)
            });
            hashes[stage.index()] = hash;
        }
        hashes.iter().any(|&hash| hash != 0).then_some(hashes)
    }

    fn build_graphics_pipeline(
        &self,
        key: GraphicsPipelineKey,
        state: &GraphicsState,
        pipeline: &Shared<B::Pipeline>,
    ) {
        debug!(key_hash = format_args!("{:016x}", key.key_hash()), "building graphics pipeline");
        let mut envs: Vec<GenericEnvironment<'_>> = key
            .stages()
            .map(|stage| GenericEnvironment::graphics(&*self.memory, state, stage))
            .collect();
        let modules = {
            let mut pools = lock(&self.main_pools);
            let shader_backend = self.config.shader_backend;
            translate_graphics(&mut pools, &self.profile, shader_backend, &key, &mut envs)
        };
        let modules = match modules {
            Ok(modules) => modules,
            Err(err) => {
                finish_build(&self.stats, pipeline, Err(err));
                return;
            }
        };
        // Environments borrow guest memory, so the record is serialized now and written once
        // the backend accepts the pipeline.
        let persist = lock(&self.disk_cache).clone().and_then(|disk| {
            let env_refs: Vec<&GenericEnvironment<'_>> = envs.iter().collect();
            match DiskCache::graphics_record(&key, &env_refs) {
                Ok(record) => Some((disk, record)),
                Err(err) => {
                    warn!(%err, "failed to serialize graphics pipeline");
                    None
                }
            }
        });

        let backend = Arc::clone(&self.backend);
        let stats = Arc::clone(&self.stats);
        let entry = Arc::clone(pipeline);
        let build = move || {
            let outcome = backend.create_graphics_pipeline(&key, modules);
            if let (Ok(_), Some((disk, record))) = (&outcome, persist) {
                if let Err(err) = disk.append(&record) {
                    warn!(%err, "failed to persist graphics pipeline");
                }
            }
            finish_build(&stats, &entry, outcome);
        };
        match &self.workers {
            Some(workers) => workers.queue_work(move |_| build()),
            None => build(),
        }
    }

    /// Pipeline for the dispatch described by `state`; `None` when its build failed. Compute
    /// pipelines are always built on the calling thread.
    pub fn current_compute_pipeline(&self, state: &ComputeState) -> Option<Shared<B::Pipeline>> {
        let mut env = GenericEnvironment::compute(&*self.memory, state);
        let key = ComputePipelineKey {
            unique_hash: env.unique_hash(),
            shared_memory_size: state.shared_memory_size,
            workgroup_size: state.workgroup_size,
        };
        let (pipeline, is_new) = match lock(&self.compute_cache).entry(key) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let pipeline = Arc::new(CachedPipeline::pending(key.key_hash()));
                entry.insert(Arc::clone(&pipeline));
                (pipeline, true)
            }
        };
        if !is_new {
            self.stats.inc_map_hits();
            return (!pipeline.is_failed()).then_some(pipeline);
        }
        self.stats.inc_misses();
        debug!(key_hash = format_args!("{:016x}", key.key_hash()), "building compute pipeline");
        let module = {
            let mut pools = lock(&self.main_pools);
            translate_compute(&mut pools, &self.profile, self.config.shader_backend, &mut env)
        };
        let outcome = module.and_then(|module| self.backend.create_compute_pipeline(&key, module));
        if outcome.is_ok() {
            if let Some(disk) = lock(&self.disk_cache).clone() {
                if let Err(err) = disk.append_compute(&key, &env) {
                    warn!(%err, "failed to persist compute pipeline");
                }
            }
        }
        finish_build(&self.stats, &pipeline, outcome);
        (!pipeline.is_failed()).then_some(pipeline)
    }

    /// Loads and builds every pipeline recorded for `title_id`, then keeps persisting new builds
    /// to the same file.
    ///
    /// `callback` receives `(stage, built, total)` progress. Raising `stop` ends loading between
    /// entries; pipelines already queued finish in the background. Does nothing without a disk
    /// cache directory or for title 0.
    pub fn load_disk_resources(
        &self,
        title_id: u64,
        stop: &AtomicBool,
        mut callback: impl FnMut(LoadStage, usize, usize),
    ) {
        if title_id == 0 {
            return;
        }
        let Some(dir) = &self.config.disk_cache_dir else {
            return;
        };
        let path = DiskCache::path_for(dir, title_id, self.config.shader_backend);
        let disk = Arc::new(DiskCache::new(path));
        *lock(&self.disk_cache) = Some(Arc::clone(&disk));

        let workers = match &self.workers {
            Some(workers) => Arc::clone(workers),
            None => match ShaderWorkers::new(self.config.worker_count(), "ShaderLoader") {
                Ok(workers) => Arc::new(workers),
                Err(err) => {
                    error!(%err, "failed to start pipeline cache loaders");
                    return;
                }
            },
        };
        callback(LoadStage::Prepare, 0, 0);

        let (sender, receiver) = mpsc::channel();
        let total = disk.load(stop, |record| {
            let sender = sender.clone();
            let backend = Arc::clone(&self.backend);
            let profile = self.profile.clone();
            let shader_backend = self.config.shader_backend;
            workers.queue_work(move |context: &mut WorkerContext| {
                let pools = &mut context.pools;
                let loaded = build_record(pools, &profile, shader_backend, &*backend, record);
                let _ = sender.send(loaded);
            });
        });
        drop(sender);
        info!(total, "pipelines queued from disk");

        callback(LoadStage::Build, 0, total);
        let mut built = 0;
        while built < total && !stop.load(Ordering::Relaxed) {
            let loaded = match receiver.recv_timeout(LOAD_POLL_INTERVAL) {
                Ok(loaded) => loaded,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.insert_loaded(loaded);
            built += 1;
            callback(LoadStage::Build, built, total);
        }
        workers.wait_for_requests(stop);
        callback(LoadStage::Complete, built, total);
    }

    fn insert_loaded(&self, loaded: Loaded<B::Pipeline>) {
        match loaded {
            Loaded::Graphics(key, Ok(pipeline)) => {
                lock(&self.graphics_cache)
                    .entry(key)
                    .or_insert_with(|| Arc::new(CachedPipeline::built(key.key_hash(), pipeline)));
                self.stats.inc_disk_entries_loaded();
            }
            Loaded::Compute(key, Ok(pipeline)) => {
                lock(&self.compute_cache)
                    .entry(key)
                    .or_insert_with(|| Arc::new(CachedPipeline::built(key.key_hash(), pipeline)));
                self.stats.inc_disk_entries_loaded();
            }
            Loaded::Graphics(key, Err(err)) => {
                error!(
                    key_hash = format_args!("{:016x}", key.key_hash()),
                    %err,
                    "failed to build cached graphics pipeline"
                );
                self.stats.inc_build_failures();
            }
            Loaded::Compute(key, Err(err)) => {
                error!(
                    key_hash = format_args!("{:016x}", key.key_hash()),
                    %err,
                    "failed to build cached compute pipeline"
                );
                self.stats.inc_build_failures();
            }
        }
    }
}

enum Loaded<P> {
    Graphics(GraphicsPipelineKey, Result<P>),
    Compute(ComputePipelineKey, Result<P>),
}

fn build_record<B: PipelineBackend>(
    pools: &mut IrPools,
    profile: &Profile,
    shader_backend: ShaderBackend,
    backend: &B,
    record: DiskRecord,
) -> Loaded<B::Pipeline> {
    match record {
        DiskRecord::Graphics { key, mut envs } => {
            let envs: &mut [FileEnvironment] = &mut envs;
            let outcome = translate_graphics(pools, profile, shader_backend, &key, envs)
                .and_then(|modules| backend.create_graphics_pipeline(&key, modules));
            Loaded::Graphics(key, outcome)
        }
        DiskRecord::Compute { key, mut env } => {
            let outcome = translate_compute(pools, profile, shader_backend, &mut env)
                .and_then(|module| backend.create_compute_pipeline(&key, module));
            Loaded::Compute(key, outcome)
        }
    }
}

fn finish_build<P>(stats: &PipelineCacheStats, pipeline: &CachedPipeline<P>, outcome: Result<P>) {
    match outcome {
        Ok(built) => {
            stats.inc_builds();
            pipeline.finish(Some(built));
        }
        Err(err) => {
            error!(
                key_hash = format_args!("{:016x}", pipeline.key_hash),
                %err,
                "pipeline build failed; recording null entry"
            );
            stats.inc_build_failures();
            pipeline.finish(None);
        }
    }
}

fn emit(
    shader_backend: ShaderBackend,
    profile: &Profile,
    runtime_info: &RuntimeInfo,
    program: &nova_shader::Program,
    bindings: &mut Bindings,
) -> std::result::Result<ShaderCode, ShaderError> {
    Ok(match shader_backend {
        ShaderBackend::Glasm => {
            ShaderCode::Glasm(emit_glasm(profile, runtime_info, program, bindings)?)
        }
        ShaderBackend::Glsl => {
            ShaderCode::Glsl(emit_glsl(profile, runtime_info, program, bindings)?)
        }
        ShaderBackend::SpirV => {
            ShaderCode::SpirV(emit_spirv(profile, runtime_info, program, bindings)?)
        }
    })
}

fn translate_stage(pools: &mut IrPools, env: &mut dyn Environment) -> Result<nova_shader::Program> {
    let stage = env.stage();
    translate_program(pools, env).map_err(|err| {
        error!(%stage, %err, "shader translation failed");
        CacheError::Shader(err)
    })
}

/// Translates and emits every stage of `key`. `envs` holds one environment per used stage, in
/// pipeline order; resource bindings are numbered across all of them.
pub fn translate_graphics<E: Environment>(
    pools: &mut IrPools,
    profile: &Profile,
    shader_backend: ShaderBackend,
    key: &GraphicsPipelineKey,
    envs: &mut [E],
) -> Result<Vec<ShaderModule>> {
    let stages: Vec<Stage> = key.stages().collect();
    if stages.len() != envs.len() {
        return Err(CacheError::Build(format!(
            "{} environments for {} stages",
            envs.len(),
            stages.len()
        )));
    }
    let mut programs = Vec::with_capacity(envs.len());
    for (stage, env) in stages.into_iter().zip(envs.iter_mut()) {
        if env.stage() != stage {
            return Err(CacheError::Build(format!(
                "{} environment in the {stage} slot",
                env.stage()
            )));
        }
        programs.push(translate_stage(pools, env)?);
    }

    let mut bindings = Bindings::new();
    let mut modules = Vec::with_capacity(programs.len());
    let mut previous = None;
    for program in &programs {
        let runtime_info = make_runtime_info(key, program, previous);
        let code = emit(shader_backend, profile, &runtime_info, program, &mut bindings)?;
        modules.push(ShaderModule {
            stage: program.stage,
            code,
            info: program.info.clone(),
        });
        previous = Some(program);
    }
    for program in programs {
        pools.release(program);
    }
    Ok(modules)
}

pub fn translate_compute(
    pools: &mut IrPools,
    profile: &Profile,
    shader_backend: ShaderBackend,
    env: &mut dyn Environment,
) -> Result<ShaderModule> {
    let program = translate_stage(pools, env)?;
    let runtime_info = RuntimeInfo::default();
    let code = emit(shader_backend, profile, &runtime_info, &program, &mut Bindings::new())?;
    let module = ShaderModule {
        stage: program.stage,
        code,
        info: program.info.clone(),
    };
    pools.release(program);
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn waiters_wake_when_the_build_finishes() {
        let entry = Arc::new(CachedPipeline::<u32>::pending(1));
        let waiter = {
            let entry = Arc::clone(&entry);
            thread::spawn(move || entry.wait().copied())
        };
        entry.finish(Some(7));
        assert_eq!(waiter.join().unwrap(), Some(7));
        assert!(entry.is_built());
        assert!(!entry.is_failed());
    }

    #[test]
    fn failed_builds_are_null_entries() {
        let entry = CachedPipeline::<u32>::pending(1);
        assert!(!entry.is_built());
        assert_eq!(entry.get(), None);
        finish_build(&PipelineCacheStats::new(), &entry, Err(CacheError::Build("no".into())));
        assert!(entry.is_failed());
        assert_eq!(entry.wait(), None);
    }
}
