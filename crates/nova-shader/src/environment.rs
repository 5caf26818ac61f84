use crate::stage::Stage;

/// Size in bytes of the program header that precedes graphics shader code.
pub const PROGRAM_HEADER_SIZE: u32 = 0x50;
pub const PROGRAM_HEADER_WORDS: usize = (PROGRAM_HEADER_SIZE / 4) as usize;

/// Number of colour render targets a fragment program can write.
pub const NUM_RENDER_TARGETS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureType {
    Color1D,
    Color2D,
    Color3D,
    ColorCube,
}

impl TextureType {
    pub fn coordinate_count(self) -> usize {
        match self {
            TextureType::Color1D => 1,
            TextureType::Color2D => 2,
            TextureType::Color3D | TextureType::ColorCube => 3,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            TextureType::Color1D => 0,
            TextureType::Color2D => 1,
            TextureType::Color3D => 2,
            TextureType::ColorCube => 3,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => TextureType::Color1D,
            1 => TextureType::Color2D,
            2 => TextureType::Color3D,
            3 => TextureType::ColorCube,
            _ => return None,
        })
    }
}

/// What the environment knows about the texture behind a bindless handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureInfo {
    pub address: u64,
    pub texture_type: TextureType,
    pub format: u32,
}

/// The 0x50-byte shader program header (SPH).
///
/// Only the fragment output map is interpreted: word 18 holds four enable bits per render
/// target, word 19 bit 0 enables the sample mask output and bit 1 the depth output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramHeader {
    pub words: [u32; PROGRAM_HEADER_WORDS],
}

impl ProgramHeader {
    const OMAP_TARGET_WORD: usize = 18;
    const OMAP_FLAGS_WORD: usize = 19;

    pub fn new(words: [u32; PROGRAM_HEADER_WORDS]) -> Self {
        Self { words }
    }

    pub fn enabled_output_components(&self, render_target: u32) -> [bool; 4] {
        let bits = self.words[Self::OMAP_TARGET_WORD] >> (render_target * 4);
        std::array::from_fn(|component| bits & (1 << component) != 0)
    }

    pub fn has_output_components(&self, render_target: u32) -> bool {
        (self.words[Self::OMAP_TARGET_WORD] >> (render_target * 4)) & 0xF != 0
    }

    pub fn omap_sample_mask(&self) -> bool {
        self.words[Self::OMAP_FLAGS_WORD] & 1 != 0
    }

    pub fn omap_depth(&self) -> bool {
        self.words[Self::OMAP_FLAGS_WORD] & 2 != 0
    }
}

/// Extracts a `bit_width`-bit value at byte `offset` from the aligned 32-bit word that holds it.
pub fn extract_cbuf_value(word: u32, offset: u32, bit_width: u32, signed: bool) -> u32 {
    if bit_width >= 32 {
        return word;
    }
    let shift = (offset & 3) * 8;
    let value = (word >> shift) & ((1u32 << bit_width) - 1);
    if signed {
        let unused = 32 - bit_width;
        (((value << unused) as i32) >> unused) as u32
    } else {
        value
    }
}

/// Source of everything translation reads from the guest.
///
/// Implemented once over live GPU memory and once over a recorded replay; translation never
/// branches on which one it has. Methods take `&mut self` so a live environment can record
/// every answer it gives.
pub trait Environment {
    /// Reads the 64-bit instruction word at `address`, relative to the program base.
    fn read_instruction(&mut self, address: u32) -> u64;

    /// Reads the aligned 32-bit word containing byte `offset` of constant buffer `index`.
    fn read_cbuf_word(&mut self, index: u32, offset: u32) -> u32;

    /// Resolves a bindless texture handle read from the texture bound buffer.
    fn texture_info(&mut self, handle: u32) -> TextureInfo;

    /// Constant buffer that holds texture handles.
    fn texture_bound_buffer(&self) -> u32;

    /// Address of the first instruction (past the program header for graphics stages).
    fn start_address(&self) -> u32;

    fn stage(&self) -> Stage;

    fn sph(&self) -> &ProgramHeader;

    fn workgroup_size(&self) -> [u32; 3];

    fn shared_memory_size(&self) -> u32;

    /// Reads a `bit_width`-bit value (8, 16 or 32) from constant buffer `index`.
    fn read_constant_buffer(
        &mut self,
        index: u32,
        offset: u32,
        bit_width: u32,
        signed: bool,
    ) -> u32 {
        let word = self.read_cbuf_word(index, offset & !3);
        extract_cbuf_value(word, offset, bit_width, signed)
    }
}
