mod common;

use std::fs;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::*;
use nova_shader::environment::TextureType;
use nova_shader::{translate_program, Environment, IrPools, Profile, Stage};
use nova_video::{
    DiskCache, DiskRecord, FileEnvironment, GenericEnvironment, GraphicsPipelineKey, LoadStage,
    PipelineCache, PipelineCacheConfig, ShaderBackend, CACHE_VERSION,
};
use pretty_assertions::assert_eq;

const TITLE_ID: u64 = 0x0100_0000_0000_1000;

/// Fragment program sampling a bindless cube texture. The handle is read while translating.
fn sampling_fragment() -> Vec<u64> {
    vec![
        mov_cbuf(4, 1, 0x10),
        mov32i_f(5, 0.5),
        mov32i_f(6, 0.25),
        tex(0, 4, 0x20, 0xF),
        exit(),
    ]
}

fn sampling_memory() -> FakeMemory {
    let mut memory = graphics_memory(&sampling_fragment());
    // c2[0x20] = texture handle 3
    memory.write_u32(CBUF_ADDRESS + 0x200 + 0x20, 3);
    // TIC entry 3: cube map at 0x12_3400_0000
    let entry = TIC_ADDRESS + 3 * 32;
    memory.write_u32(entry, 0x08);
    memory.write_u32(entry + 4, 0x3400_0000);
    memory.write_u32(entry + 8, 0x12);
    memory.write_u32(entry + 16, 3 << 23);
    memory
}

fn persisting_config(dir: &std::path::Path) -> PipelineCacheConfig {
    PipelineCacheConfig {
        disk_cache_dir: Some(dir.to_path_buf()),
        worker_count: Some(2),
        ..PipelineCacheConfig::default()
    }
}

fn write_one_record(cache: &DiskCache) {
    let memory = graphics_memory(&fragment_program(1.0));
    let state = graphics_state();
    let mut vertex = GenericEnvironment::graphics(&memory, &state, Stage::VertexB);
    let mut fragment = GenericEnvironment::graphics(&memory, &state, Stage::Fragment);
    let hashes = [0, vertex.unique_hash(), 0, 0, 0, fragment.unique_hash()];
    let key = GraphicsPipelineKey::new(hashes, &state);
    let mut pools = IrPools::new();
    translate_program(&mut pools, &mut vertex).unwrap();
    translate_program(&mut pools, &mut fragment).unwrap();
    cache.append_graphics(&key, &[&vertex, &fragment]).unwrap();
}

#[test]
fn replay_answers_the_recorded_queries() {
    let memory = sampling_memory();
    let state = graphics_state();
    let mut live = GenericEnvironment::graphics(&memory, &state, Stage::Fragment);
    let live_program = translate_program(&mut IrPools::new(), &mut live).unwrap();
    assert_eq!(live_program.info.texture_descriptors.len(), 1);
    assert_eq!(live_program.info.texture_descriptors[0].texture_type, TextureType::ColorCube);

    let mut bytes = Vec::new();
    live.serialize(&mut bytes).unwrap();
    let mut replay = FileEnvironment::deserialize(&mut Cursor::new(bytes)).unwrap();

    assert_eq!(replay.stage(), live.stage());
    assert_eq!(replay.start_address(), live.start_address());
    assert_eq!(replay.sph(), live.sph());
    assert_eq!(replay.texture_bound_buffer(), live.texture_bound_buffer());
    for address in (live.start_address()..live.start_address() + 0x40).step_by(8) {
        assert_eq!(replay.read_instruction(address), live.read_instruction(address));
    }
    assert_eq!(replay.read_cbuf_word(2, 0x20), live.read_cbuf_word(2, 0x20));
    assert_eq!(replay.texture_info(3), live.texture_info(3));

    let replay_program = translate_program(&mut IrPools::new(), &mut replay).unwrap();
    assert_eq!(replay_program.dump(), live_program.dump());
    assert_eq!(replay_program.info, live_program.info);
}

#[test]
fn records_round_trip_through_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DiskCache::new(dir.path().join("glsl.bin"));
    write_one_record(&cache);
    write_one_record(&cache);

    let mut records = Vec::new();
    let loaded = cache.load(&AtomicBool::new(false), |record| records.push(record));
    assert_eq!(loaded, 2);
    assert_eq!(records[0], records[1]);
    let DiskRecord::Graphics { key, envs } = &records[0] else {
        panic!("expected a graphics record");
    };
    assert_eq!(key.stages().collect::<Vec<_>>(), vec![Stage::VertexB, Stage::Fragment]);
    assert_eq!(envs.len(), 2);

    let bytes = fs::read(cache.path()).unwrap();
    assert_eq!(&bytes[..8], b"NOVACACH");
    assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), CACHE_VERSION);
}

#[test]
fn newer_version_discards_the_whole_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("glsl.bin");
    write_one_record(&DiskCache::with_version(&path, 7));
    assert!(path.exists());

    let newer = DiskCache::with_version(&path, 8);
    let loaded = newer.load(&AtomicBool::new(false), |_| panic!("stale records must not load"));
    assert_eq!(loaded, 0);
    assert!(!path.exists());

    // The next append starts a fresh file under the new version.
    write_one_record(&newer);
    assert_eq!(newer.load(&AtomicBool::new(false), |_| {}), 1);
}

#[test]
fn truncated_record_stops_loading_and_removes_the_file() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("glsl.bin");
    let cache = DiskCache::new(&path);
    write_one_record(&cache);
    write_one_record(&cache);
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

    let reader = DiskCache::new(&path);
    let loaded = reader.load(&AtomicBool::new(false), |_| {});
    assert_eq!(loaded, 1);
    assert!(!path.exists());
}

#[test]
fn raised_stop_loads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DiskCache::new(dir.path().join("glsl.bin"));
    write_one_record(&cache);
    assert_eq!(cache.load(&AtomicBool::new(true), |_| {}), 0);
}

#[test]
fn next_run_loads_what_this_run_built() {
    let dir = tempfile::tempdir().unwrap();
    let state = graphics_state();
    let stop = AtomicBool::new(false);

    let first_backend = CountingBackend::default();
    {
        let cache = PipelineCache::new(
            persisting_config(dir.path()),
            Profile::default(),
            first_backend.clone(),
            Arc::new(graphics_memory(&fragment_program(1.0))),
        )
        .unwrap();
        cache.load_disk_resources(TITLE_ID, &stop, |_, _, _| {});
        cache.current_graphics_pipeline(&state).unwrap().wait().unwrap();
    }
    assert_eq!(first_backend.graphics_builds.load(Ordering::SeqCst), 1);
    let path = DiskCache::path_for(dir.path(), TITLE_ID, ShaderBackend::Glsl);
    assert!(path.exists());

    let second_backend = CountingBackend::default();
    let cache = PipelineCache::new(
        persisting_config(dir.path()),
        Profile::default(),
        second_backend.clone(),
        Arc::new(graphics_memory(&fragment_program(1.0))),
    )
    .unwrap();
    let mut progress = Vec::new();
    cache.load_disk_resources(TITLE_ID, &stop, |stage, built, total| {
        progress.push((stage, built, total))
    });
    assert_eq!(
        progress,
        vec![
            (LoadStage::Prepare, 0, 0),
            (LoadStage::Build, 0, 1),
            (LoadStage::Build, 1, 1),
            (LoadStage::Complete, 1, 1),
        ]
    );
    assert_eq!(cache.stats().disk_entries_loaded, 1);
    assert_eq!(second_backend.graphics_builds.load(Ordering::SeqCst), 1);

    // The draw finds the loaded pipeline instead of building again.
    let pipeline = cache.current_graphics_pipeline(&state).unwrap();
    assert!(pipeline.is_built());
    assert_eq!(cache.stats().map_hits, 1);
    assert_eq!(second_backend.graphics_builds.load(Ordering::SeqCst), 1);
}

#[test]
fn rejected_pipelines_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let backend = CountingBackend {
        fail: true,
        ..CountingBackend::default()
    };
    let mut memory = graphics_memory(&fragment_program(1.0));
    memory.write_code(COMPUTE_START, &[mov32i(0, 1), exit()]);
    let cache = PipelineCache::new(
        persisting_config(dir.path()),
        Profile::default(),
        backend.clone(),
        Arc::new(memory),
    )
    .unwrap();
    let stop = AtomicBool::new(false);
    cache.load_disk_resources(TITLE_ID, &stop, |_, _, _| {});

    assert!(cache.current_graphics_pipeline(&graphics_state()).is_none());
    assert!(cache.current_compute_pipeline(&compute_state()).is_none());
    assert_eq!(cache.stats().build_failures, 2);
    assert_eq!(backend.graphics_builds.load(Ordering::SeqCst), 0);

    let path = DiskCache::path_for(dir.path(), TITLE_ID, ShaderBackend::Glsl);
    assert_eq!(DiskCache::new(path).load(&stop, |_| {}), 0);
}

#[test]
fn title_zero_has_no_disk_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = PipelineCache::new(
        persisting_config(dir.path()),
        Profile::default(),
        CountingBackend::default(),
        Arc::new(graphics_memory(&fragment_program(1.0))),
    )
    .unwrap();
    let mut calls = 0;
    cache.load_disk_resources(0, &AtomicBool::new(false), |_, _, _| calls += 1);
    assert_eq!(calls, 0);
    cache.current_graphics_pipeline(&graphics_state()).unwrap();
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}
