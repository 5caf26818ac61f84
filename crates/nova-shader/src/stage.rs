/// Programmable pipeline stage. The order matches the hardware's program slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    VertexA,
    VertexB,
    TessellationControl,
    TessellationEval,
    Geometry,
    Fragment,
    Compute,
}

impl Stage {
    pub const NUM_GRAPHICS: usize = 6;

    pub const GRAPHICS: [Stage; Self::NUM_GRAPHICS] = [
        Stage::VertexA,
        Stage::VertexB,
        Stage::TessellationControl,
        Stage::TessellationEval,
        Stage::Geometry,
        Stage::Fragment,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Some(match index {
            0 => Stage::VertexA,
            1 => Stage::VertexB,
            2 => Stage::TessellationControl,
            3 => Stage::TessellationEval,
            4 => Stage::Geometry,
            5 => Stage::Fragment,
            6 => Stage::Compute,
            _ => return None,
        })
    }

    pub fn is_graphics(self) -> bool {
        self != Stage::Compute
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::VertexA => "vertex_a",
            Stage::VertexB => "vertex_b",
            Stage::TessellationControl => "tess_control",
            Stage::TessellationEval => "tess_eval",
            Stage::Geometry => "geometry",
            Stage::Fragment => "fragment",
            Stage::Compute => "compute",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips() {
        for index in 0..7 {
            let stage = Stage::from_index(index).unwrap();
            assert_eq!(stage.index(), index);
        }
        assert_eq!(Stage::from_index(7), None);
    }
}
