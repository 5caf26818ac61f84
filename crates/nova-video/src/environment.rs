//! Live and replayed shader environments.
//!
//! [`GenericEnvironment`] answers translation queries from guest GPU memory and records every
//! answer it gives. [`GenericEnvironment::serialize`] writes the program and those answers, and
//! [`FileEnvironment`] replays them later so a disk-cached pipeline translates to the same
//! program without the guest state that produced it.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

use nova_shader::environment::{
    ProgramHeader, TextureInfo, TextureType, PROGRAM_HEADER_SIZE, PROGRAM_HEADER_WORDS,
};
use nova_shader::{Environment, Stage};
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{CacheError, Result};
use crate::graphics_state::{shader_type, ComputeState, ConstBufferBinding, GraphicsState};
use crate::io::{ReadLeExt, WriteLeExt};

/// Self-branches the guest compiler places after the last instruction, with and without the
/// scheduling hint bit.
const SELF_BRANCH_A: u64 = 0xE240_0FFF_FF87_000F;
const SELF_BRANCH_B: u64 = 0xE240_0FFF_FF07_000F;

/// Longest program the scan reads before giving up on finding a terminator.
pub const MAX_PROGRAM_SIZE: usize = 0x10_0000;
const MAX_PROGRAM_WORDS: usize = MAX_PROGRAM_SIZE / 8;
const SCAN_CHUNK_WORDS: usize = 0x200;
/// Upper bound on recorded queries accepted from a serialized environment.
const MAX_RECORDED_QUERIES: usize = 1 << 20;

const TIC_ENTRY_SIZE: u64 = 32;
const TIC_INDEX_MASK: u32 = 0xF_FFFF;

/// Read-only view of guest GPU virtual memory.
pub trait GpuMemory: Send + Sync {
    /// Fills `out` from `address`. Unmapped bytes read as zero.
    fn read_block(&self, address: u64, out: &mut [u8]);

    fn read_u32(&self, address: u64) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_block(address, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn read_u64(&self, address: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_block(address, &mut bytes);
        u64::from_le_bytes(bytes)
    }
}

/// Reads instruction words from `address` up to and including the first self-branch.
fn read_code(memory: &dyn GpuMemory, address: u64) -> Vec<u64> {
    let mut code = Vec::new();
    let mut chunk = vec![0u8; SCAN_CHUNK_WORDS * 8];
    while code.len() < MAX_PROGRAM_WORDS {
        memory.read_block(address.wrapping_add(code.len() as u64 * 8), &mut chunk);
        for word in chunk.chunks_exact(8) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(word);
            let word = u64::from_le_bytes(bytes);
            code.push(word);
            if word == SELF_BRANCH_A || word == SELF_BRANCH_B {
                return code;
            }
        }
    }
    warn!(address, "shader terminator not found within the scan limit");
    code.truncate(MAX_PROGRAM_WORDS);
    code
}

fn read_header(memory: &dyn GpuMemory, address: u64) -> ProgramHeader {
    let mut bytes = [0u8; PROGRAM_HEADER_SIZE as usize];
    memory.read_block(address, &mut bytes);
    let mut words = [0u32; PROGRAM_HEADER_WORDS];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    ProgramHeader::new(words)
}

/// Decodes the parts of a texture image control entry translation cares about.
fn decode_tic(words: [u32; 8]) -> TextureInfo {
    let texture_type = match (words[4] >> 23) & 0xF {
        0 | 4 | 6 => TextureType::Color1D,
        2 => TextureType::Color3D,
        3 | 8 => TextureType::ColorCube,
        _ => TextureType::Color2D,
    };
    TextureInfo {
        address: u64::from(words[1]) | (u64::from(words[2] & 0xFFFF) << 32),
        texture_type,
        format: words[0] & 0x7F,
    }
}

/// Environment over live guest memory.
pub struct GenericEnvironment<'a> {
    memory: &'a dyn GpuMemory,
    stage: Stage,
    /// Offset of the first instruction from the program base.
    start_address: u32,
    code: Vec<u64>,
    sph: ProgramHeader,
    const_buffers: Vec<ConstBufferBinding>,
    tic_address: u64,
    texture_bound_buffer: u32,
    workgroup_size: [u32; 3],
    shared_memory_size: u32,
    unique_hash: u64,

    cbuf_values: BTreeMap<(u32, u32), u32>,
    texture_infos: BTreeMap<u32, TextureInfo>,
}

impl<'a> GenericEnvironment<'a> {
    /// Reads the header and code of graphics program slot `stage`.
    pub fn graphics(memory: &'a dyn GpuMemory, state: &GraphicsState, stage: Stage) -> Self {
        let header_address = state.program_address(stage);
        let sph = read_header(memory, header_address);
        let code = read_code(memory, header_address.wrapping_add(u64::from(PROGRAM_HEADER_SIZE)));
        let mut hashed = bytemuck::cast_slice::<u32, u8>(&sph.words).to_vec();
        hashed.extend_from_slice(bytemuck::cast_slice(&code));
        let bindings = state
            .const_buffers
            .get(shader_type(stage))
            .map(|slots| slots.to_vec())
            .unwrap_or_default();
        Self {
            memory,
            stage,
            start_address: state.program(stage).offset + PROGRAM_HEADER_SIZE,
            unique_hash: xxh3_64(&hashed),
            code,
            sph,
            const_buffers: bindings,
            tic_address: state.tic_address,
            texture_bound_buffer: state.texture_bound_buffer,
            workgroup_size: [1, 1, 1],
            shared_memory_size: 0,
            cbuf_values: BTreeMap::new(),
            texture_infos: BTreeMap::new(),
        }
    }

    pub fn compute(memory: &'a dyn GpuMemory, state: &ComputeState) -> Self {
        let code = read_code(memory, state.program_address());
        Self {
            memory,
            stage: Stage::Compute,
            start_address: state.start_address,
            unique_hash: xxh3_64(bytemuck::cast_slice(&code)),
            code,
            sph: ProgramHeader::default(),
            const_buffers: state.const_buffers.to_vec(),
            tic_address: state.tic_address,
            texture_bound_buffer: state.texture_bound_buffer,
            workgroup_size: state.workgroup_size,
            shared_memory_size: state.shared_memory_size,
            cbuf_values: BTreeMap::new(),
            texture_infos: BTreeMap::new(),
        }
    }

    /// Content hash of the program (header included for graphics stages).
    pub fn unique_hash(&self) -> u64 {
        self.unique_hash
    }

    pub fn code_size_bytes(&self) -> usize {
        self.code.len() * 8
    }

    /// Writes the program and every query answered so far.
    pub fn serialize<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        out.write_u32_le(self.stage.index() as u32)?;
        out.write_u32_le(self.start_address)?;
        out.write_u32_le(self.texture_bound_buffer)?;

        out.write_len_u64(self.code.len())?;
        for &word in &self.code {
            out.write_u64_le(word)?;
        }

        out.write_len_u64(self.cbuf_values.len())?;
        for (&(index, offset), &value) in &self.cbuf_values {
            out.write_u32_le(index)?;
            out.write_u32_le(offset)?;
            out.write_u32_le(value)?;
        }

        out.write_len_u64(self.texture_infos.len())?;
        for (&handle, info) in &self.texture_infos {
            out.write_u32_le(handle)?;
            out.write_u32_le(info.texture_type.to_raw())?;
            out.write_u32_le(info.format)?;
            out.write_u64_le(info.address)?;
        }

        if self.stage == Stage::Compute {
            for &size in &self.workgroup_size {
                out.write_u32_le(size)?;
            }
            out.write_u32_le(self.shared_memory_size)?;
        } else {
            for &word in &self.sph.words {
                out.write_u32_le(word)?;
            }
        }
        Ok(())
    }

    fn read_tic(&self, handle: u32) -> TextureInfo {
        let entry = u64::from(handle & TIC_INDEX_MASK) * TIC_ENTRY_SIZE;
        let address = self.tic_address.wrapping_add(entry);
        let mut bytes = [0u8; TIC_ENTRY_SIZE as usize];
        self.memory.read_block(address, &mut bytes);
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        decode_tic(words)
    }
}

impl Environment for GenericEnvironment<'_> {
    fn read_instruction(&mut self, address: u32) -> u64 {
        address
            .checked_sub(self.start_address)
            .and_then(|offset| self.code.get(offset as usize / 8))
            .copied()
            .unwrap_or(0)
    }

    fn read_cbuf_word(&mut self, index: u32, offset: u32) -> u32 {
        if let Some(&value) = self.cbuf_values.get(&(index, offset)) {
            return value;
        }
        let value = match self.const_buffers.get(index as usize) {
            Some(binding) if binding.enabled && offset.saturating_add(4) <= binding.size => {
                self.memory.read_u32(binding.address.wrapping_add(u64::from(offset)))
            }
            _ => 0,
        };
        self.cbuf_values.insert((index, offset), value);
        value
    }

    fn texture_info(&mut self, handle: u32) -> TextureInfo {
        if let Some(&info) = self.texture_infos.get(&handle) {
            return info;
        }
        let info = self.read_tic(handle);
        self.texture_infos.insert(handle, info);
        info
    }

    fn texture_bound_buffer(&self) -> u32 {
        self.texture_bound_buffer
    }

    fn start_address(&self) -> u32 {
        self.start_address
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    fn sph(&self) -> &ProgramHeader {
        &self.sph
    }

    fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    fn shared_memory_size(&self) -> u32 {
        self.shared_memory_size
    }
}

/// Environment replayed from a serialized [`GenericEnvironment`].
#[derive(Debug, Clone, PartialEq)]
pub struct FileEnvironment {
    stage: Stage,
    start_address: u32,
    texture_bound_buffer: u32,
    code: Vec<u64>,
    cbuf_values: HashMap<(u32, u32), u32>,
    texture_infos: HashMap<u32, TextureInfo>,
    sph: ProgramHeader,
    workgroup_size: [u32; 3],
    shared_memory_size: u32,
}

impl FileEnvironment {
    pub fn deserialize<R: Read + ?Sized>(input: &mut R) -> Result<Self> {
        let stage = Stage::from_index(input.read_u32_le()? as usize)
            .ok_or(CacheError::Corrupt("unknown shader stage"))?;
        let start_address = input.read_u32_le()?;
        let texture_bound_buffer = input.read_u32_le()?;

        let code_len = input.read_len_u64(MAX_PROGRAM_WORDS)?;
        let mut code = Vec::new();
        code.try_reserve_exact(code_len)
            .map_err(|_| CacheError::OutOfMemory { len: code_len * 8 })?;
        for _ in 0..code_len {
            code.push(input.read_u64_le()?);
        }

        let num_cbuf_values = input.read_len_u64(MAX_RECORDED_QUERIES)?;
        let mut cbuf_values = HashMap::new();
        for _ in 0..num_cbuf_values {
            let index = input.read_u32_le()?;
            let offset = input.read_u32_le()?;
            cbuf_values.insert((index, offset), input.read_u32_le()?);
        }

        let num_textures = input.read_len_u64(MAX_RECORDED_QUERIES)?;
        let mut texture_infos = HashMap::new();
        for _ in 0..num_textures {
            let handle = input.read_u32_le()?;
            let texture_type = TextureType::from_raw(input.read_u32_le()?)
                .ok_or(CacheError::Corrupt("unknown texture type"))?;
            let format = input.read_u32_le()?;
            let address = input.read_u64_le()?;
            texture_infos.insert(
                handle,
                TextureInfo {
                    address,
                    texture_type,
                    format,
                },
            );
        }

        let mut sph = ProgramHeader::default();
        let mut workgroup_size = [1, 1, 1];
        let mut shared_memory_size = 0;
        if stage == Stage::Compute {
            for size in &mut workgroup_size {
                *size = input.read_u32_le()?;
            }
            shared_memory_size = input.read_u32_le()?;
        } else {
            for word in &mut sph.words {
                *word = input.read_u32_le()?;
            }
        }

        Ok(Self {
            stage,
            start_address,
            texture_bound_buffer,
            code,
            cbuf_values,
            texture_infos,
            sph,
            workgroup_size,
            shared_memory_size,
        })
    }
}

impl Environment for FileEnvironment {
    fn read_instruction(&mut self, address: u32) -> u64 {
        address
            .checked_sub(self.start_address)
            .and_then(|offset| self.code.get(offset as usize / 8))
            .copied()
            .unwrap_or(0)
    }

    fn read_cbuf_word(&mut self, index: u32, offset: u32) -> u32 {
        match self.cbuf_values.get(&(index, offset)) {
            Some(&value) => value,
            None => {
                warn!(index, offset, "constant buffer read was not recorded");
                0
            }
        }
    }

    fn texture_info(&mut self, handle: u32) -> TextureInfo {
        match self.texture_infos.get(&handle) {
            Some(&info) => info,
            None => {
                warn!(handle, "texture query was not recorded");
                TextureInfo {
                    address: 0,
                    texture_type: TextureType::Color2D,
                    format: 0,
                }
            }
        }
    }

    fn texture_bound_buffer(&self) -> u32 {
        self.texture_bound_buffer
    }

    fn start_address(&self) -> u32 {
        self.start_address
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    fn sph(&self) -> &ProgramHeader {
        &self.sph
    }

    fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    fn shared_memory_size(&self) -> u32 {
        self.shared_memory_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    struct Words(Vec<u64>);

    impl GpuMemory for Words {
        fn read_block(&self, address: u64, out: &mut [u8]) {
            for (i, byte) in out.iter_mut().enumerate() {
                let at = address as usize + i;
                *byte = self
                    .0
                    .get(at / 8)
                    .map_or(0, |word| word.to_le_bytes()[at % 8]);
            }
        }
    }

    fn compute_state() -> ComputeState {
        ComputeState {
            workgroup_size: [8, 4, 1],
            shared_memory_size: 0x100,
            ..ComputeState::default()
        }
    }

    #[test]
    fn scan_stops_at_the_self_branch() {
        let memory = Words(vec![0, 1, 2, SELF_BRANCH_B, 4, 5]);
        let env = GenericEnvironment::compute(&memory, &compute_state());
        assert_eq!(env.code_size_bytes(), 32);
    }

    #[test]
    fn hash_follows_code_content() {
        let a = Words(vec![0, 1, SELF_BRANCH_A]);
        let b = Words(vec![0, 2, SELF_BRANCH_A]);
        let state = compute_state();
        let hash_a = GenericEnvironment::compute(&a, &state).unique_hash();
        assert_eq!(hash_a, GenericEnvironment::compute(&a, &state).unique_hash());
        assert_ne!(hash_a, GenericEnvironment::compute(&b, &state).unique_hash());
    }

    #[test]
    fn disabled_constant_buffers_read_zero() {
        let memory = Words(vec![SELF_BRANCH_A, 0xDEAD_BEEF]);
        let mut state = compute_state();
        state.const_buffers[1] = ConstBufferBinding {
            enabled: false,
            address: 8,
            size: 8,
        };
        state.const_buffers[2] = ConstBufferBinding {
            enabled: true,
            address: 8,
            size: 8,
        };
        let mut env = GenericEnvironment::compute(&memory, &state);
        assert_eq!(env.read_cbuf_word(1, 0), 0);
        assert_eq!(env.read_cbuf_word(2, 0), 0xDEAD_BEEF);
        assert_eq!(env.read_cbuf_word(2, 8), 0);
    }

    #[test]
    fn tic_entries_decode_type_and_address() {
        let mut words = [0u32; 8];
        words[0] = 0x08;
        words[1] = 0x2000_0000;
        words[2] = 0x12;
        words[4] = 3 << 23;
        let info = decode_tic(words);
        assert_eq!(info.texture_type, TextureType::ColorCube);
        assert_eq!(info.address, 0x12_2000_0000);
        assert_eq!(info.format, 0x08);
    }

    #[test]
    fn compute_replay_keeps_dispatch_shape() {
        let memory = Words(vec![0, SELF_BRANCH_A]);
        let env = GenericEnvironment::compute(&memory, &compute_state());
        let mut bytes = Vec::new();
        env.serialize(&mut bytes).unwrap();
        let replay = FileEnvironment::deserialize(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(replay.stage(), Stage::Compute);
        assert_eq!(replay.workgroup_size(), [8, 4, 1]);
        assert_eq!(replay.shared_memory_size(), 0x100);
    }

    #[test]
    fn truncated_environment_is_an_error() {
        let memory = Words(vec![0, SELF_BRANCH_A]);
        let env = GenericEnvironment::compute(&memory, &compute_state());
        let mut bytes = Vec::new();
        env.serialize(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(FileEnvironment::deserialize(&mut Cursor::new(bytes)).is_err());
    }

    proptest! {
        #[test]
        fn deserialize_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = FileEnvironment::deserialize(&mut Cursor::new(bytes));
        }
    }
}
