//! Per-draw and per-dispatch snapshots of the guest GPU registers the pipeline cache reads.
//!
//! The embedder fills these from its register file before every draw or dispatch. Nothing here
//! is retained by the cache past the call it was passed to.

use nova_shader::Stage;

/// Constant buffer slots per graphics shader type.
pub const NUM_CONST_BUFFERS: usize = 18;
/// Constant buffer slots of the compute engine.
pub const NUM_COMPUTE_CONST_BUFFERS: usize = 8;
/// Graphics shader types with their own constant buffer bindings. Both vertex programs share
/// the first.
pub const NUM_SHADER_TYPES: usize = 5;

/// Constant buffer binding slot group used by `stage`.
pub fn shader_type(stage: Stage) -> usize {
    match stage {
        Stage::VertexA | Stage::VertexB | Stage::Compute => 0,
        Stage::TessellationControl => 1,
        Stage::TessellationEval => 2,
        Stage::Geometry => 3,
        Stage::Fragment => 4,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstBufferBinding {
    pub enabled: bool,
    /// GPU virtual address of the buffer.
    pub address: u64,
    pub size: u32,
}

/// One programmable stage slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageProgram {
    pub enabled: bool,
    /// Byte offset of the program header from the program base.
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PrimitiveTopology {
    Points = 0,
    Lines = 1,
    LineLoop = 2,
    LineStrip = 3,
    #[default]
    Triangles = 4,
    TriangleStrip = 5,
    TriangleFan = 6,
    Quads = 7,
    QuadStrip = 8,
    Polygon = 9,
    LinesAdjacency = 10,
    LineStripAdjacency = 11,
    TrianglesAdjacency = 12,
    TriangleStripAdjacency = 13,
    Patches = 14,
}

impl PrimitiveTopology {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use PrimitiveTopology::*;
        Some(match raw {
            0 => Points,
            1 => Lines,
            2 => LineLoop,
            3 => LineStrip,
            4 => Triangles,
            5 => TriangleStrip,
            6 => TriangleFan,
            7 => Quads,
            8 => QuadStrip,
            9 => Polygon,
            10 => LinesAdjacency,
            11 => LineStripAdjacency,
            12 => TrianglesAdjacency,
            13 => TriangleStripAdjacency,
            14 => Patches,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TessellationDomain {
    Isolines = 0,
    #[default]
    Triangles = 1,
    Quads = 2,
}

impl TessellationDomain {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Isolines,
            1 => Self::Triangles,
            2 => Self::Quads,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TessellationSpacing {
    #[default]
    Integer = 0,
    FractionalOdd = 1,
    FractionalEven = 2,
}

impl TessellationSpacing {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Integer,
            1 => Self::FractionalOdd,
            2 => Self::FractionalEven,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TessellationState {
    pub domain: TessellationDomain,
    pub spacing: TessellationSpacing,
    /// Output primitives are clockwise triangles.
    pub clockwise: bool,
}

/// Register snapshot for one draw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphicsState {
    pub program_base: u64,
    /// Program slots in [`Stage::GRAPHICS`] order.
    pub programs: [StageProgram; Stage::NUM_GRAPHICS],
    pub const_buffers: [[ConstBufferBinding; NUM_CONST_BUFFERS]; NUM_SHADER_TYPES],
    /// Base of the texture image control table.
    pub tic_address: u64,
    /// Constant buffer holding bindless texture handles.
    pub texture_bound_buffer: u32,

    pub topology: PrimitiveTopology,
    pub tessellation: TessellationState,
    pub early_z: bool,
    pub xfb_enabled: bool,
    /// Two-bit engine state tag.
    pub app_stage: u8,

    pub depth_write_enabled: bool,
    pub index_count: u32,
    pub vertex_count: u32,
}

impl GraphicsState {
    pub fn program(&self, stage: Stage) -> StageProgram {
        self.programs.get(stage.index()).copied().unwrap_or_default()
    }

    /// GPU address of the program header of `stage`, wrapping on overflow.
    pub fn program_address(&self, stage: Stage) -> u64 {
        self.program_base.wrapping_add(u64::from(self.program(stage).offset))
    }
}

/// Register snapshot for one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeState {
    pub program_base: u64,
    /// Byte offset of the first instruction from the program base.
    pub start_address: u32,
    pub workgroup_size: [u32; 3],
    pub shared_memory_size: u32,
    pub const_buffers: [ConstBufferBinding; NUM_COMPUTE_CONST_BUFFERS],
    pub tic_address: u64,
    pub texture_bound_buffer: u32,
}

impl ComputeState {
    /// GPU address of the first instruction.
    pub fn program_address(&self) -> u64 {
        self.program_base.wrapping_add(u64::from(self.start_address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_programs_share_bindings() {
        assert_eq!(shader_type(Stage::VertexA), shader_type(Stage::VertexB));
        assert_eq!(shader_type(Stage::Fragment), NUM_SHADER_TYPES - 1);
    }

    #[test]
    fn topology_raw_values_round_trip() {
        for raw in 0..15 {
            let topology = PrimitiveTopology::from_raw(raw).unwrap();
            assert_eq!(topology as u32, raw);
        }
        assert_eq!(PrimitiveTopology::from_raw(15), None);
    }

    #[test]
    fn program_address_adds_the_slot_offset() {
        let mut state = GraphicsState {
            program_base: 0x1_0000_0000,
            ..GraphicsState::default()
        };
        state.programs[Stage::Fragment.index()] = StageProgram {
            enabled: true,
            offset: 0x400,
        };
        assert_eq!(state.program_address(Stage::Fragment), 0x1_0000_0400);
    }

    #[test]
    fn program_address_wraps_at_the_top_of_the_address_space() {
        let mut state = GraphicsState {
            program_base: u64::MAX - 4,
            ..GraphicsState::default()
        };
        state.programs[Stage::VertexB.index()] = StageProgram {
            enabled: true,
            offset: 0x10,
        };
        assert_eq!(state.program_address(Stage::VertexB), 0xB);

        let compute = ComputeState {
            program_base: u64::MAX,
            start_address: 1,
            ..ComputeState::default()
        };
        assert_eq!(compute.program_address(), 0);
    }
}
