//! Resource usage of a translated program, consumed by the backends to declare interfaces and by
//! the pipeline cache to build bindings.

use crate::environment::{TextureType, NUM_RENDER_TARGETS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstantBufferDescriptor {
    pub index: u32,
}

/// A bindless texture whose handle lives at `cbuf_offset` of constant buffer `cbuf_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub texture_type: TextureType,
    pub cbuf_index: u32,
    pub cbuf_offset: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Info {
    /// Bit `n` set when constant buffer `n` is read.
    pub constant_buffer_mask: u32,
    pub constant_buffer_descriptors: Vec<ConstantBufferDescriptor>,
    pub texture_descriptors: Vec<TextureDescriptor>,

    /// Bit `n` set when generic attribute `n` is read.
    pub loads_generics: u32,
    /// Bit `n` set when generic attribute `n` is written.
    pub stores_generics: u32,
    pub loads_position: bool,
    pub stores_position: bool,
    pub loads_vertex_id: bool,
    pub loads_instance_id: bool,

    pub stores_frag_color: [bool; NUM_RENDER_TARGETS as usize],
    pub stores_frag_depth: bool,
    pub stores_sample_mask: bool,

    pub uses_demote_to_helper_invocation: bool,
    pub uses_fp_compare: bool,
}

impl Info {
    /// Index of the descriptor for `descriptor`, adding it on first use.
    pub fn register_texture(&mut self, descriptor: TextureDescriptor) -> u32 {
        let existing = self.texture_descriptors.iter().position(|known| *known == descriptor);
        if let Some(index) = existing {
            return index as u32;
        }
        self.texture_descriptors.push(descriptor);
        (self.texture_descriptors.len() - 1) as u32
    }

    pub fn loads_generic(&self, index: u32) -> bool {
        self.loads_generics & (1 << index) != 0
    }

    pub fn stores_generic(&self, index: u32) -> bool {
        self.stores_generics & (1 << index) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textures_are_deduplicated_by_handle_location() {
        let mut info = Info::default();
        let a = TextureDescriptor {
            texture_type: TextureType::Color2D,
            cbuf_index: 2,
            cbuf_offset: 0x20,
        };
        let b = TextureDescriptor { cbuf_offset: 0x24, ..a };
        assert_eq!(info.register_texture(a), 0);
        assert_eq!(info.register_texture(b), 1);
        assert_eq!(info.register_texture(a), 0);
        assert_eq!(info.texture_descriptors.len(), 2);
    }
}
