use crate::info::{ConstantBufferDescriptor, Info};
use crate::ir::{Attribute, Opcode, Program, Value};

/// Records which resources and interface variables the program touches.
///
/// Texture descriptors are registered during translation and are left as they are.
pub fn collect_shader_info(program: &mut Program) {
    let texture_descriptors = std::mem::take(&mut program.info.texture_descriptors);
    let mut info = Info {
        texture_descriptors,
        ..Default::default()
    };

    for block in &program.blocks {
        for &id in &block.insts {
            let inst = program.inst(id);
            match inst.opcode {
                Opcode::GetCbufU8
                | Opcode::GetCbufS8
                | Opcode::GetCbufU16
                | Opcode::GetCbufS16
                | Opcode::GetCbufU32
                | Opcode::GetCbufF32 => {
                    if let Value::U32(index) = inst.arg(0) {
                        info.constant_buffer_mask |= 1 << index;
                    }
                }
                Opcode::GetAttribute => {
                    if let Value::Attribute(attribute) = inst.arg(0) {
                        if attribute.is_position() {
                            info.loads_position = true;
                        } else if let Some(index) = attribute.generic_index() {
                            info.loads_generics |= 1 << index;
                        } else if attribute == Attribute::VERTEX_ID {
                            info.loads_vertex_id = true;
                        } else if attribute == Attribute::INSTANCE_ID {
                            info.loads_instance_id = true;
                        }
                    }
                }
                Opcode::SetAttribute => {
                    if let Value::Attribute(attribute) = inst.arg(0) {
                        if attribute.is_position() {
                            info.stores_position = true;
                        } else if let Some(index) = attribute.generic_index() {
                            info.stores_generics |= 1 << index;
                        }
                    }
                }
                Opcode::SetFragColor => {
                    if let Some(slot) = inst
                        .arg(0)
                        .as_u32()
                        .and_then(|rt| info.stores_frag_color.get_mut(rt as usize))
                    {
                        *slot = true;
                    }
                }
                Opcode::SetFragDepth => info.stores_frag_depth = true,
                Opcode::SetSampleMask => info.stores_sample_mask = true,
                Opcode::DemoteToHelperInvocation => info.uses_demote_to_helper_invocation = true,
                opcode if opcode.fp_compare().is_some() => info.uses_fp_compare = true,
                _ => {}
            }
        }
    }

    info.constant_buffer_descriptors = (0..32)
        .filter(|index| info.constant_buffer_mask & (1 << index) != 0)
        .map(|index| ConstantBufferDescriptor { index })
        .collect();
    program.info = info;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrEmitter;
    use crate::stage::Stage;

    #[test]
    fn records_interface_usage() {
        let mut program = Program::new(Stage::VertexB);
        let block = program.new_block();
        let mut ir = IrEmitter::new(&mut program, block);
        let x = ir.get_attribute(Attribute::generic(3, 1));
        let scale = ir.get_cbuf_f32(5, Value::U32(0x10));
        let scaled = ir.fp_mul(x, scale, Default::default());
        ir.set_attribute(Attribute::POSITION_Y, scaled);
        ir.set_attribute(Attribute::generic(7, 0), x);

        collect_shader_info(&mut program);

        let info = &program.info;
        assert_eq!(info.loads_generics, 1 << 3);
        assert_eq!(info.stores_generics, 1 << 7);
        assert!(info.stores_position);
        assert!(!info.loads_position);
        assert_eq!(info.constant_buffer_descriptors, vec![ConstantBufferDescriptor { index: 5 }]);
    }
}
