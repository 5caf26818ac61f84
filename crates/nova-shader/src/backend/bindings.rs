/// Next free binding slot per resource class.
///
/// A pipeline threads one `Bindings` through the emission of all of its stages so resources of
/// different stages never share a slot. SPIR-V uses the unified counter (one descriptor set);
/// GLSL and GLASM number uniform buffers and textures separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bindings {
    pub unified: u32,
    pub uniform_buffer: u32,
    pub texture: u32,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_unified(&mut self) -> u32 {
        let binding = self.unified;
        self.unified += 1;
        binding
    }

    pub(crate) fn next_uniform_buffer(&mut self) -> u32 {
        let binding = self.uniform_buffer;
        self.uniform_buffer += 1;
        binding
    }

    pub(crate) fn next_texture(&mut self) -> u32 {
        let binding = self.texture;
        self.texture += 1;
        binding
    }
}
