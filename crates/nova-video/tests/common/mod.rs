#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use nova_shader::Stage;
use nova_video::{
    CacheError, ComputePipelineKey, ComputeState, ConstBufferBinding, GpuMemory,
    GraphicsPipelineKey, GraphicsState, PipelineBackend, ShaderModule, StageProgram,
};

/// Flat guest memory starting at GPU address 0.
pub struct FakeMemory {
    pub bytes: Vec<u8>,
}

impl FakeMemory {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        let at = address as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        let at = address as usize;
        self.bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes `insts` from `address`, leaving every 32-byte aligned slot as a zero scheduling
    /// word, and ends the program with the self-branch terminator.
    pub fn write_code(&mut self, mut address: u64, insts: &[u64]) {
        for &inst in insts.iter().chain(std::iter::once(&SELF_BRANCH)) {
            if address.is_multiple_of(32) {
                address += 8;
            }
            self.write_u64(address, inst);
            address += 8;
        }
    }

    /// Writes a program header with `omap` as the render target output mask, then the code.
    pub fn write_graphics_program(&mut self, header: u64, omap: u32, insts: &[u64]) {
        self.write_u32(header + 18 * 4, omap);
        self.write_code(header + 0x50, insts);
    }
}

impl GpuMemory for FakeMemory {
    fn read_block(&self, address: u64, out: &mut [u8]) {
        out.fill(0);
        let start = (address as usize).min(self.bytes.len());
        let end = start.saturating_add(out.len()).min(self.bytes.len());
        out[..end - start].copy_from_slice(&self.bytes[start..end]);
    }
}

/// Guest memory the test can rewrite while a cache reads it.
pub struct SharedMemory(RwLock<FakeMemory>);

impl SharedMemory {
    pub fn new(memory: FakeMemory) -> Self {
        Self(RwLock::new(memory))
    }

    pub fn write(&self, f: impl FnOnce(&mut FakeMemory)) {
        f(&mut self.0.write().unwrap());
    }
}

impl GpuMemory for SharedMemory {
    fn read_block(&self, address: u64, out: &mut [u8]) {
        self.0.read().unwrap().read_block(address, out);
    }
}

pub const SELF_BRANCH: u64 = 0xE240_0FFF_FF87_000F;

pub const VERTEX_HEADER: u64 = 0x0;
pub const FRAGMENT_HEADER: u64 = 0x400;
pub const COMPUTE_START: u64 = 0x800;
pub const CBUF_ADDRESS: u64 = 0x1000;
pub const TIC_ADDRESS: u64 = 0x2000;

const PT: u64 = 7;
const RZ: u64 = 0xFF;
const ALWAYS: u64 = PT << 16;

/// `MOV32I Rd, imm`
pub fn mov32i(dest: u64, imm: u32) -> u64 {
    (0x010 << 52) | ((imm as u64) << 20) | ALWAYS | dest
}

pub fn mov32i_f(dest: u64, value: f32) -> u64 {
    mov32i(dest, value.to_bits())
}

/// `MOV Rd, c[index][offset]`
pub fn mov_cbuf(dest: u64, index: u64, offset: u32) -> u64 {
    (0x4C98 << 48) | (index << 34) | (((offset / 4) as u64) << 20) | ALWAYS | dest
}

/// `AST a[attribute], Rs` for `count` consecutive components.
pub fn ast(src: u64, attribute: u16, count: u64) -> u64 {
    (0xEFF0 << 48) | ((count - 1) << 47) | ((attribute as u64) << 20) | (RZ << 8) | ALWAYS | src
}

/// `TEX Rd, Ra, handle at c[bound][handle_offset]`, writing the components in `mask`.
pub fn tex(dest: u64, coords: u64, handle_offset: u32, mask: u64) -> u64 {
    let handle = (handle_offset / 4) as u64;
    (0xC000 << 48) | (handle << 36) | (mask << 31) | ALWAYS | (coords << 8) | dest
}

pub fn exit() -> u64 {
    0xE300_0000_0007_000F
}

/// Vertex program writing a constant position.
pub fn vertex_program() -> Vec<u64> {
    vec![
        mov32i_f(0, 0.0),
        mov32i_f(1, 0.0),
        mov32i_f(2, 0.0),
        mov32i_f(3, 1.0),
        ast(0, 0x70, 4),
        exit(),
    ]
}

/// Fragment program writing `value` to the red channel of render target 0.
pub fn fragment_program(value: f32) -> Vec<u64> {
    vec![mov32i_f(0, value), exit()]
}

/// Memory holding a vertex and a fragment program.
pub fn graphics_memory(fragment: &[u64]) -> FakeMemory {
    let mut memory = FakeMemory::new(0x4000);
    memory.write_graphics_program(VERTEX_HEADER, 0, &vertex_program());
    memory.write_graphics_program(FRAGMENT_HEADER, 0x1, fragment);
    memory
}

/// A draw with the vertex and fragment slots enabled.
pub fn graphics_state() -> GraphicsState {
    let mut state = GraphicsState {
        tic_address: TIC_ADDRESS,
        texture_bound_buffer: 2,
        index_count: 3,
        ..GraphicsState::default()
    };
    state.programs[Stage::VertexB.index()] = StageProgram {
        enabled: true,
        offset: VERTEX_HEADER as u32,
    };
    state.programs[Stage::Fragment.index()] = StageProgram {
        enabled: true,
        offset: FRAGMENT_HEADER as u32,
    };
    for slots in &mut state.const_buffers {
        for (index, slot) in slots.iter_mut().enumerate().take(4) {
            *slot = ConstBufferBinding {
                enabled: true,
                address: CBUF_ADDRESS + index as u64 * 0x100,
                size: 0x100,
            };
        }
    }
    state
}

pub fn compute_state() -> ComputeState {
    ComputeState {
        start_address: COMPUTE_START as u32,
        workgroup_size: [64, 1, 1],
        ..ComputeState::default()
    }
}

#[derive(Debug)]
pub struct TestPipeline {
    pub stages: Vec<Stage>,
    pub key_hash: u64,
}

/// Blocks builds until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    fn pass(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
    }
}

/// Backend that counts the pipelines it creates.
#[derive(Clone, Default)]
pub struct CountingBackend {
    pub graphics_builds: Arc<AtomicUsize>,
    pub compute_builds: Arc<AtomicUsize>,
    pub gate: Option<Arc<Gate>>,
    /// Reject every pipeline instead of creating it.
    pub fail: bool,
}

impl PipelineBackend for CountingBackend {
    type Pipeline = TestPipeline;

    fn create_graphics_pipeline(
        &self,
        key: &GraphicsPipelineKey,
        modules: Vec<ShaderModule>,
    ) -> nova_video::Result<TestPipeline> {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if self.fail {
            return Err(CacheError::Build("backend rejected the pipeline".into()));
        }
        self.graphics_builds.fetch_add(1, Ordering::SeqCst);
        Ok(TestPipeline {
            stages: modules.iter().map(|module| module.stage).collect(),
            key_hash: key.key_hash(),
        })
    }

    fn create_compute_pipeline(
        &self,
        key: &ComputePipelineKey,
        module: ShaderModule,
    ) -> nova_video::Result<TestPipeline> {
        if self.fail {
            return Err(CacheError::Build("backend rejected the pipeline".into()));
        }
        self.compute_builds.fetch_add(1, Ordering::SeqCst);
        Ok(TestPipeline {
            stages: vec![module.stage],
            key_hash: key.key_hash(),
        })
    }
}
