use crate::environment::TextureType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FpRounding {
    #[default]
    DontCare,
    /// Round to nearest even.
    Rn,
    /// Round towards negative infinity.
    Rm,
    /// Round towards positive infinity.
    Rp,
    /// Round towards zero.
    Rz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FmzMode {
    #[default]
    DontCare,
    /// Flush denormals to zero.
    Ftz,
    /// Flush denormals and treat `0 * x` as zero.
    Fmz,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FpControl {
    /// The result must not be fused with neighbouring operations.
    pub no_contraction: bool,
    pub rounding: FpRounding,
    pub fmz: FmzMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureInstInfo {
    pub descriptor_index: u32,
    pub texture_type: TextureType,
}

/// Per-instruction metadata that is not an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InstFlags {
    #[default]
    None,
    Fp(FpControl),
    Texture(TextureInstInfo),
}
