mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use nova_shader::{Profile, Stage};
use nova_video::{
    GpuMemory, GraphicsPipelineKey, PipelineCache, PipelineCacheConfig, PrimitiveTopology,
    ShaderBackend, StageProgram,
};
use pretty_assertions::assert_eq;

fn cache_with(
    config: PipelineCacheConfig,
    backend: CountingBackend,
    memory: FakeMemory,
) -> PipelineCache<CountingBackend> {
    PipelineCache::new(config, Profile::default(), backend, Arc::new(memory)).unwrap()
}

fn sync_cache(backend: CountingBackend) -> PipelineCache<CountingBackend> {
    cache_with(PipelineCacheConfig::default(), backend, graphics_memory(&fragment_program(1.0)))
}

#[test]
fn identical_snapshots_give_identical_keys() {
    let hashes = [0, 0xAAAA, 0, 0, 0, 0xBBBB];
    let state = graphics_state();
    let a = GraphicsPipelineKey::new(hashes, &state);
    let b = GraphicsPipelineKey::new(hashes, &state.clone());
    assert_eq!(a.as_bytes(), b.as_bytes());
    assert_eq!(a.key_hash(), b.key_hash());

    let lines = nova_video::GraphicsState {
        topology: PrimitiveTopology::Lines,
        ..graphics_state()
    };
    let c = GraphicsPipelineKey::new(hashes, &lines);
    assert_ne!(a.as_bytes(), c.as_bytes());

    let early_z = nova_video::GraphicsState {
        early_z: true,
        ..graphics_state()
    };
    assert_ne!(a, GraphicsPipelineKey::new(hashes, &early_z));
}

#[test]
fn repeated_draws_take_the_fast_path() {
    let backend = CountingBackend::default();
    let cache = sync_cache(backend.clone());
    let state = graphics_state();

    let first = cache.current_graphics_pipeline(&state).expect("pipeline");
    let pipeline = first.wait().expect("built");
    assert_eq!(pipeline.stages, vec![Stage::VertexB, Stage::Fragment]);

    let second = cache.current_graphics_pipeline(&state).expect("pipeline");
    assert!(Arc::ptr_eq(&first, &second));

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.fast_path_hits, 1);
    assert_eq!(stats.map_hits, 0);
    assert_eq!(backend.graphics_builds.load(Ordering::SeqCst), 1);
}

#[test]
fn switching_back_hits_the_map() {
    let cache = sync_cache(CountingBackend::default());
    let triangles = graphics_state();
    let points = nova_video::GraphicsState {
        topology: PrimitiveTopology::Points,
        ..graphics_state()
    };

    let a = cache.current_graphics_pipeline(&triangles).unwrap();
    let b = cache.current_graphics_pipeline(&points).unwrap();
    let again = cache.current_graphics_pipeline(&triangles).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(cache.num_graphics_pipelines(), 2);
    assert_eq!(cache.stats().map_hits, 1);
}

#[test]
fn concurrent_callers_share_one_build() {
    const CALLERS: usize = 8;
    let backend = CountingBackend::default();
    let cache = Arc::new(sync_cache(backend.clone()));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let state = graphics_state();
                let pipeline = cache.current_graphics_pipeline(&state).expect("pipeline");
                assert!(pipeline.wait().is_some());
                pipeline
            })
        })
        .collect();
    let pipelines: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

    assert_eq!(backend.graphics_builds.load(Ordering::SeqCst), 1);
    for pipeline in &pipelines[1..] {
        assert!(Arc::ptr_eq(&pipelines[0], pipeline));
    }
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn concurrent_async_callers_share_one_worker_build() {
    const CALLERS: usize = 16;
    let gate = Arc::new(Gate::default());
    let backend = CountingBackend {
        gate: Some(Arc::clone(&gate)),
        ..CountingBackend::default()
    };
    let config = PipelineCacheConfig {
        use_asynchronous_shaders: true,
        worker_count: Some(4),
        ..PipelineCacheConfig::default()
    };
    let cache = Arc::new(cache_with(
        config,
        backend.clone(),
        graphics_memory(&fragment_program(1.0)),
    ));
    // Large enough that callers get the pending entry instead of skipping the draw.
    let state = nova_video::GraphicsState {
        vertex_count: 300,
        ..graphics_state()
    };
    let barrier = Arc::new(Barrier::new(CALLERS + 1));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let state = state.clone();
            thread::spawn(move || {
                barrier.wait();
                let pipeline = cache.current_graphics_pipeline(&state).expect("pipeline");
                let key_hash = pipeline.wait().expect("built").key_hash;
                (pipeline, key_hash)
            })
        })
        .collect();
    barrier.wait();
    gate.open();
    let results: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

    assert_eq!(backend.graphics_builds.load(Ordering::SeqCst), 1);
    let (first, key_hash) = &results[0];
    assert!(first.is_built());
    for (pipeline, hash) in &results[1..] {
        assert!(Arc::ptr_eq(first, pipeline));
        assert_eq!(hash, key_hash);
    }
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.builds, 1);
    assert_eq!(cache.num_graphics_pipelines(), 1);
}

#[test]
fn failed_builds_are_not_retried() {
    let backend = CountingBackend::default();
    let cache = sync_cache(backend.clone());
    let mut state = graphics_state();
    // A standalone first vertex program cannot be translated.
    state.programs[Stage::VertexA.index()] = StageProgram {
        enabled: true,
        offset: VERTEX_HEADER as u32,
    };

    assert!(cache.current_graphics_pipeline(&state).is_none());
    assert!(cache.current_graphics_pipeline(&state).is_none());
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.build_failures, 1);
    assert_eq!(stats.builds, 0);
    assert_eq!(cache.num_graphics_pipelines(), 1);
    assert_eq!(backend.graphics_builds.load(Ordering::SeqCst), 0);
}

#[test]
fn no_enabled_stage_means_no_pipeline() {
    let cache = sync_cache(CountingBackend::default());
    let state = nova_video::GraphicsState::default();
    assert!(cache.current_graphics_pipeline(&state).is_none());
    assert_eq!(cache.num_graphics_pipelines(), 0);
}

#[test]
fn async_builds_skip_cheap_draws_and_block_on_heavy_ones() {
    let gate = Arc::new(Gate::default());
    let backend = CountingBackend {
        gate: Some(Arc::clone(&gate)),
        ..CountingBackend::default()
    };
    let config = PipelineCacheConfig {
        use_asynchronous_shaders: true,
        worker_count: Some(2),
        ..PipelineCacheConfig::default()
    };
    let cache = cache_with(config, backend.clone(), graphics_memory(&fragment_program(1.0)));

    let cheap = graphics_state();
    assert!(cache.current_graphics_pipeline(&cheap).is_none());

    let depth = nova_video::GraphicsState {
        depth_write_enabled: true,
        ..graphics_state()
    };
    let pending = cache.current_graphics_pipeline(&depth).expect("depth draws wait");
    assert!(!pending.is_built());

    let large = nova_video::GraphicsState {
        vertex_count: 300,
        ..graphics_state()
    };
    let same = cache.current_graphics_pipeline(&large).expect("large draws wait");
    assert!(Arc::ptr_eq(&pending, &same));

    gate.open();
    assert!(pending.wait().is_some());
    assert!(cache.current_graphics_pipeline(&cheap).is_some());
    assert_eq!(backend.graphics_builds.load(Ordering::SeqCst), 1);
}

#[test]
fn every_backend_emits_a_pipeline() {
    for shader_backend in [ShaderBackend::Glasm, ShaderBackend::Glsl, ShaderBackend::SpirV] {
        let backend = CountingBackend::default();
        let config = PipelineCacheConfig {
            shader_backend,
            ..PipelineCacheConfig::default()
        };
        let cache = cache_with(config, backend.clone(), graphics_memory(&fragment_program(0.5)));
        let pipeline = cache.current_graphics_pipeline(&graphics_state()).expect("pipeline");
        assert!(pipeline.wait().is_some(), "{shader_backend:?}");
    }
}

#[test]
fn rewritten_programs_are_rehashed_after_invalidation() {
    let memory = Arc::new(SharedMemory::new(graphics_memory(&fragment_program(1.0))));
    let cache = PipelineCache::new(
        PipelineCacheConfig::default(),
        Profile::default(),
        CountingBackend::default(),
        Arc::clone(&memory) as Arc<dyn GpuMemory>,
    )
    .unwrap();
    let state = graphics_state();
    let first = cache.current_graphics_pipeline(&state).unwrap();

    memory.write(|memory| memory.write_code(FRAGMENT_HEADER + 0x50, &fragment_program(0.25)));
    // Hashes are memoized per program address until the region is invalidated.
    let stale = cache.current_graphics_pipeline(&state).unwrap();
    assert!(Arc::ptr_eq(&first, &stale));

    cache.invalidate_region(FRAGMENT_HEADER, 0x100);
    let fresh = cache.current_graphics_pipeline(&state).unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert_eq!(cache.num_graphics_pipelines(), 2);
}

#[test]
fn compute_pipelines_are_memoized() {
    let mut memory = FakeMemory::new(0x4000);
    memory.write_code(COMPUTE_START, &[mov32i(0, 1), exit()]);
    let backend = CountingBackend::default();
    let cache = cache_with(PipelineCacheConfig::default(), backend.clone(), memory);

    let state = compute_state();
    let first = cache.current_compute_pipeline(&state).expect("pipeline");
    assert_eq!(first.get().unwrap().stages, vec![Stage::Compute]);
    let second = cache.current_compute_pipeline(&state).expect("pipeline");
    assert!(Arc::ptr_eq(&first, &second));

    let wider = nova_video::ComputeState {
        workgroup_size: [128, 1, 1],
        ..compute_state()
    };
    cache.current_compute_pipeline(&wider).expect("pipeline");
    assert_eq!(cache.num_compute_pipelines(), 2);
    assert_eq!(backend.compute_builds.load(Ordering::SeqCst), 2);
}

#[test]
fn config_parses_from_camel_case_json() {
    let config: PipelineCacheConfig = serde_json::from_str(
        r#"{
            "useAsynchronousShaders": true,
            "shaderBackend": "SpirV",
            "diskCacheDir": "/var/cache/nova",
            "workerCount": 3
        }"#,
    )
    .unwrap();
    assert!(config.use_asynchronous_shaders);
    assert_eq!(config.shader_backend, ShaderBackend::SpirV);
    assert_eq!(config.disk_cache_dir.as_deref(), Some(std::path::Path::new("/var/cache/nova")));
    assert_eq!(config.worker_count(), 3);

    let defaults: PipelineCacheConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(defaults, PipelineCacheConfig::default());
    assert_eq!(defaults.shader_backend, ShaderBackend::Glsl);
}
