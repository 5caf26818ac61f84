use nova_shader::{
    InputTopology, Program, RuntimeInfo, Stage, TessPrimitive, TessSpacing, ALL_GENERICS,
};

use crate::graphics_state::{PrimitiveTopology, TessellationDomain, TessellationSpacing};
use crate::pipeline_key::GraphicsPipelineKey;

pub fn input_topology(topology: PrimitiveTopology) -> InputTopology {
    match topology {
        PrimitiveTopology::Points => InputTopology::Points,
        PrimitiveTopology::Lines | PrimitiveTopology::LineLoop | PrimitiveTopology::LineStrip => {
            InputTopology::Lines
        }
        PrimitiveTopology::LinesAdjacency | PrimitiveTopology::LineStripAdjacency => {
            InputTopology::LinesAdjacency
        }
        PrimitiveTopology::TrianglesAdjacency | PrimitiveTopology::TriangleStripAdjacency => {
            InputTopology::TrianglesAdjacency
        }
        PrimitiveTopology::Triangles
        | PrimitiveTopology::TriangleStrip
        | PrimitiveTopology::TriangleFan
        | PrimitiveTopology::Quads
        | PrimitiveTopology::QuadStrip
        | PrimitiveTopology::Polygon
        | PrimitiveTopology::Patches => InputTopology::Triangles,
    }
}

fn tess_primitive(domain: TessellationDomain) -> TessPrimitive {
    match domain {
        TessellationDomain::Isolines => TessPrimitive::Isolines,
        TessellationDomain::Triangles => TessPrimitive::Triangles,
        TessellationDomain::Quads => TessPrimitive::Quads,
    }
}

fn tess_spacing(spacing: TessellationSpacing) -> TessSpacing {
    match spacing {
        TessellationSpacing::Integer => TessSpacing::Equal,
        TessellationSpacing::FractionalOdd => TessSpacing::FractionalOdd,
        TessellationSpacing::FractionalEven => TessSpacing::FractionalEven,
    }
}

/// Pipeline facts for emitting `program` as part of the pipeline described by `key`.
///
/// `previous` is the program of the closest earlier enabled stage. Without one every generic
/// input is treated as written.
pub fn make_runtime_info(
    key: &GraphicsPipelineKey,
    program: &Program,
    previous: Option<&Program>,
) -> RuntimeInfo {
    let mut info = RuntimeInfo {
        previous_stage_stores: previous.map_or(ALL_GENERICS, |prev| prev.info.stores_generics),
        input_topology: input_topology(key.gs_input_topology()),
        ..RuntimeInfo::default()
    };
    match program.stage {
        Stage::TessellationEval => {
            // Host rasterization is vertically flipped relative to the guest.
            info.tess_clockwise = !key.tessellation_clockwise();
            info.tess_primitive = tess_primitive(key.tessellation_domain());
            info.tess_spacing = tess_spacing(key.tessellation_spacing());
        }
        Stage::Fragment => info.force_early_z = key.early_z(),
        _ => {}
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics_state::{GraphicsState, TessellationState};

    fn key(state: &GraphicsState) -> GraphicsPipelineKey {
        GraphicsPipelineKey::new([0, 1, 0, 2, 0, 3], state)
    }

    #[test]
    fn first_stage_sees_every_generic() {
        let program = Program::new(Stage::VertexB);
        let info = make_runtime_info(&key(&GraphicsState::default()), &program, None);
        assert_eq!(info.previous_stage_stores, ALL_GENERICS);
        assert_eq!(info.input_topology, InputTopology::Triangles);
        assert!(!info.force_early_z);
    }

    #[test]
    fn later_stages_see_previous_stores() {
        let mut vertex = Program::new(Stage::VertexB);
        vertex.info.stores_generics = 0b101;
        let fragment = Program::new(Stage::Fragment);
        let state = GraphicsState {
            early_z: true,
            topology: PrimitiveTopology::LineStrip,
            ..GraphicsState::default()
        };
        let info = make_runtime_info(&key(&state), &fragment, Some(&vertex));
        assert_eq!(info.previous_stage_stores, 0b101);
        assert!(info.force_early_z);
        assert_eq!(info.input_topology, InputTopology::Lines);
    }

    #[test]
    fn tessellation_winding_is_flipped() {
        let state = GraphicsState {
            tessellation: TessellationState {
                domain: TessellationDomain::Quads,
                spacing: TessellationSpacing::FractionalOdd,
                clockwise: true,
            },
            early_z: true,
            ..GraphicsState::default()
        };
        let program = Program::new(Stage::TessellationEval);
        let info = make_runtime_info(&key(&state), &program, None);
        assert!(!info.tess_clockwise);
        assert_eq!(info.tess_primitive, TessPrimitive::Quads);
        assert_eq!(info.tess_spacing, TessSpacing::FractionalOdd);
        assert!(!info.force_early_z);
    }
}
