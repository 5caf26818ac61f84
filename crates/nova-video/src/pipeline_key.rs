//! Byte-comparable pipeline cache keys.
//!
//! Two keys that compare equal describe behaviorally identical pipelines. Keys are plain old
//! data so the disk cache stores them byte for byte.

use bytemuck::{Pod, Zeroable};
use nova_shader::Stage;
use xxhash_rust::xxh3::xxh3_64;

use crate::graphics_state::{
    GraphicsState, PrimitiveTopology, TessellationDomain, TessellationSpacing,
};

const XFB_ENABLED_SHIFT: u32 = 0;
const EARLY_Z_SHIFT: u32 = 1;
const GS_INPUT_TOPOLOGY_SHIFT: u32 = 2;
const GS_INPUT_TOPOLOGY_MASK: u32 = 0xF;
const TESS_PRIMITIVE_SHIFT: u32 = 6;
const TESS_SPACING_SHIFT: u32 = 8;
const TESS_FIELD_MASK: u32 = 0x3;
const TESS_CLOCKWISE_SHIFT: u32 = 10;
const APP_STAGE_SHIFT: u32 = 11;
const APP_STAGE_MASK: u32 = 0x3;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct GraphicsPipelineKey {
    /// Content hash per program slot in [`Stage::GRAPHICS`] order; zero when the slot is off.
    pub unique_hashes: [u64; Stage::NUM_GRAPHICS],
    /// Packed fixed-function state.
    pub raw: u32,
    pub padding: u32,
}

impl GraphicsPipelineKey {
    /// Builds the key for a draw from its stage hashes and register snapshot.
    pub fn new(unique_hashes: [u64; Stage::NUM_GRAPHICS], state: &GraphicsState) -> Self {
        let mut raw = 0;
        raw |= u32::from(state.xfb_enabled) << XFB_ENABLED_SHIFT;
        raw |= u32::from(state.early_z) << EARLY_Z_SHIFT;
        raw |= (state.topology as u32 & GS_INPUT_TOPOLOGY_MASK) << GS_INPUT_TOPOLOGY_SHIFT;
        raw |= (state.tessellation.domain as u32 & TESS_FIELD_MASK) << TESS_PRIMITIVE_SHIFT;
        raw |= (state.tessellation.spacing as u32 & TESS_FIELD_MASK) << TESS_SPACING_SHIFT;
        raw |= u32::from(state.tessellation.clockwise) << TESS_CLOCKWISE_SHIFT;
        raw |= (u32::from(state.app_stage) & APP_STAGE_MASK) << APP_STAGE_SHIFT;
        Self {
            unique_hashes,
            raw,
            padding: 0,
        }
    }

    pub fn xfb_enabled(&self) -> bool {
        (self.raw >> XFB_ENABLED_SHIFT) & 1 != 0
    }

    pub fn early_z(&self) -> bool {
        (self.raw >> EARLY_Z_SHIFT) & 1 != 0
    }

    pub fn gs_input_topology(&self) -> PrimitiveTopology {
        PrimitiveTopology::from_raw((self.raw >> GS_INPUT_TOPOLOGY_SHIFT) & GS_INPUT_TOPOLOGY_MASK)
            .unwrap_or_default()
    }

    pub fn tessellation_domain(&self) -> TessellationDomain {
        TessellationDomain::from_raw((self.raw >> TESS_PRIMITIVE_SHIFT) & TESS_FIELD_MASK)
            .unwrap_or_default()
    }

    pub fn tessellation_spacing(&self) -> TessellationSpacing {
        TessellationSpacing::from_raw((self.raw >> TESS_SPACING_SHIFT) & TESS_FIELD_MASK)
            .unwrap_or_default()
    }

    pub fn tessellation_clockwise(&self) -> bool {
        (self.raw >> TESS_CLOCKWISE_SHIFT) & 1 != 0
    }

    pub fn app_stage(&self) -> u8 {
        ((self.raw >> APP_STAGE_SHIFT) & APP_STAGE_MASK) as u8
    }

    pub fn uses_stage(&self, stage: Stage) -> bool {
        self.unique_hashes
            .get(stage.index())
            .is_some_and(|&hash| hash != 0)
    }

    /// Stages with a program, in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        Stage::GRAPHICS
            .into_iter()
            .filter(|&stage| self.uses_stage(stage))
    }

    pub fn key_hash(&self) -> u64 {
        xxh3_64(self.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct ComputePipelineKey {
    pub unique_hash: u64,
    pub shared_memory_size: u32,
    pub workgroup_size: [u32; 3],
}

impl ComputePipelineKey {
    pub fn key_hash(&self) -> u64 {
        xxh3_64(self.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics_state::TessellationState;

    fn hashes() -> [u64; Stage::NUM_GRAPHICS] {
        [0, 0x1111, 0, 0, 0, 0x2222]
    }

    #[test]
    fn packed_fields_read_back() {
        let state = GraphicsState {
            topology: PrimitiveTopology::TrianglesAdjacency,
            tessellation: TessellationState {
                domain: TessellationDomain::Quads,
                spacing: TessellationSpacing::FractionalEven,
                clockwise: true,
            },
            early_z: true,
            xfb_enabled: true,
            app_stage: 3,
            ..GraphicsState::default()
        };
        let key = GraphicsPipelineKey::new(hashes(), &state);
        assert!(key.xfb_enabled());
        assert!(key.early_z());
        assert_eq!(key.gs_input_topology(), PrimitiveTopology::TrianglesAdjacency);
        assert_eq!(key.tessellation_domain(), TessellationDomain::Quads);
        assert_eq!(key.tessellation_spacing(), TessellationSpacing::FractionalEven);
        assert!(key.tessellation_clockwise());
        assert_eq!(key.app_stage(), 3);
    }

    #[test]
    fn stages_follow_nonzero_hashes() {
        let key = GraphicsPipelineKey::new(hashes(), &GraphicsState::default());
        let stages: Vec<_> = key.stages().collect();
        assert_eq!(stages, vec![Stage::VertexB, Stage::Fragment]);
    }

    #[test]
    fn key_sizes_have_no_hidden_padding() {
        assert_eq!(std::mem::size_of::<GraphicsPipelineKey>(), 56);
        assert_eq!(std::mem::size_of::<ComputePipelineKey>(), 24);
    }

    #[test]
    fn short_byte_slices_are_rejected() {
        let key = GraphicsPipelineKey::new(hashes(), &GraphicsState::default());
        assert_eq!(GraphicsPipelineKey::from_bytes(key.as_bytes()), Some(key));
        assert_eq!(GraphicsPipelineKey::from_bytes(&key.as_bytes()[1..]), None);
    }
}
