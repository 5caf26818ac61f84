//! Lowering decisions shared by every backend. Emitters ask these functions how to spell an
//! operation instead of reading profile flags themselves.

use crate::ir::{FpCompare, Inst, Opcode};
use crate::profile::Profile;

/// Comparison forms a target language can express without help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareCaps {
    /// Unordered comparisons (true when either operand is NaN) have a direct spelling.
    pub unordered: bool,
    /// The target's not-equal is ordered (false when either operand is NaN).
    pub ordered_not_equal: bool,
}

impl CompareCaps {
    pub const SPIRV: CompareCaps = CompareCaps {
        unordered: true,
        ordered_not_equal: true,
    };
    /// `!=` in GLSL and `SNE` in NV assembly are true for NaN operands.
    pub const TEXT: CompareCaps = CompareCaps {
        unordered: true,
        ordered_not_equal: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareLowering {
    /// Use the target's own comparison for this orderedness.
    Native,
    /// `ordered(a, b) || isnan(a) || isnan(b)`.
    OrNan,
    /// `ordered(a, b) && !isnan(a) && !isnan(b)`.
    AndNotNan,
}

pub fn lower_fp_compare(
    profile: &Profile,
    compare: FpCompare,
    ordered: bool,
    caps: CompareCaps,
) -> CompareLowering {
    if !ordered {
        if profile.ignore_nan_fp_comparisons || !caps.unordered {
            return CompareLowering::OrNan;
        }
        return CompareLowering::Native;
    }
    let nan_blind = profile.ignore_nan_fp_comparisons || !caps.ordered_not_equal;
    if compare == FpCompare::NotEqual && nan_blind {
        return CompareLowering::AndNotNan;
    }
    CompareLowering::Native
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClampLowering {
    Native,
    /// `min(max(x, 0), 1)`.
    MinMax,
}

pub fn lower_clamp(profile: &Profile) -> ClampLowering {
    if profile.has_broken_spirv_clamp {
        ClampLowering::MinMax
    } else {
        ClampLowering::Native
    }
}

/// Whether the result of `inst` must be computed exactly as written, without fusing.
pub fn is_precise(inst: &Inst) -> bool {
    matches!(inst.opcode, Opcode::FPAdd32 | Opcode::FPMul32 | Opcode::FPFma32)
        && inst.fp_control().no_contraction
}
