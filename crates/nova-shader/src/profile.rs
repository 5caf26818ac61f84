//! Host capability descriptors threaded through code generation.
//!
//! [`Profile`] describes the host driver and is shared by every pipeline; [`RuntimeInfo`] carries
//! the per-pipeline facts that only become known once the rest of the pipeline is known (the
//! topology it will be drawn with, what the previous stage writes). Both are plain values: they
//! are built once per build and read by reference during emission.

/// Host driver capabilities and known bugs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// SPIR-V version word written into the module header.
    pub supported_spirv: u32,
    pub support_demote_to_helper_invocation: bool,
    /// The host has no native unordered float compares; synthesize them with `isnan`.
    pub ignore_nan_fp_comparisons: bool,
    /// The host's `FClamp` miscompiles; lower saturation to `FMin(FMax(..))`.
    pub has_broken_spirv_clamp: bool,
    /// The host GLSL compiler mishandles the `precise` qualifier.
    pub has_gl_precise_bug: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            supported_spirv: 0x0001_0000,
            support_demote_to_helper_invocation: false,
            ignore_nan_fp_comparisons: false,
            has_broken_spirv_clamp: false,
            has_gl_precise_bug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InputTopology {
    Points,
    Lines,
    LinesAdjacency,
    #[default]
    Triangles,
    TrianglesAdjacency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TessPrimitive {
    Isolines,
    #[default]
    Triangles,
    Quads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TessSpacing {
    #[default]
    Equal,
    FractionalOdd,
    FractionalEven,
}

/// Every generic attribute, used when there is no previous stage to consult.
pub const ALL_GENERICS: u32 = u32::MAX;

/// Pipeline facts for one stage of one pipeline build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Generic attributes written by the previous stage (bit `n` = generic `n`). Inputs that are
    /// not written read as `(0, 0, 0, 1)`.
    pub previous_stage_stores: u32,
    pub input_topology: InputTopology,
    pub tess_primitive: TessPrimitive,
    pub tess_spacing: TessSpacing,
    pub tess_clockwise: bool,
    pub force_early_z: bool,
}

impl Default for RuntimeInfo {
    fn default() -> Self {
        Self {
            previous_stage_stores: ALL_GENERICS,
            input_topology: InputTopology::default(),
            tess_primitive: TessPrimitive::default(),
            tess_spacing: TessSpacing::default(),
            tess_clockwise: false,
            force_early_z: false,
        }
    }
}

impl RuntimeInfo {
    pub fn previous_stage_stores_generic(&self, index: u32) -> bool {
        index < 32 && self.previous_stage_stores & (1 << index) != 0
    }
}
