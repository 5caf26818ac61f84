//! SPIR-V emission. The word stream is assembled here; the `spirv` crate supplies the enums.

use std::collections::HashMap;

use spirv::{
    AddressingModel, BuiltIn, Capability, Decoration, Dim, ExecutionMode, ExecutionModel,
    FunctionControl, GLOp, ImageOperands, LoopControl, MemoryModel, Op, SelectionControl,
    StorageClass,
};

use crate::environment::{TextureType, NUM_RENDER_TARGETS};
use crate::error::{Result, ShaderError};
use crate::ir::{
    AbstractSyntaxNode, Attribute, FpCompare, Inst, InstId, Opcode, Program, Type, Value,
};
use crate::profile::{Profile, RuntimeInfo};
use crate::stage::Stage;

use super::bindings::Bindings;
use super::check_stage;
use super::policy::{
    is_precise, lower_clamp, lower_fp_compare, ClampLowering, CompareCaps, CompareLowering,
};

/// Number of `uvec4` elements in a constant buffer binding (64 KiB).
const CBUF_ELEMENTS: u32 = 4096;

/// Emits a SPIR-V module for `program`.
pub fn emit_spirv(
    profile: &Profile,
    runtime_info: &RuntimeInfo,
    program: &Program,
    bindings: &mut Bindings,
) -> Result<Vec<u32>> {
    check_stage(program.stage)?;
    let mut ctx = SpirvContext::new(profile, runtime_info, program);
    ctx.declare_interface(bindings)?;
    ctx.emit_function()?;
    Ok(ctx.assemble())
}

fn encode(out: &mut Vec<u32>, op: Op, operands: &[u32]) {
    out.push(((operands.len() as u32 + 1) << 16) | op as u32);
    out.extend_from_slice(operands);
}

/// Nul-terminated, zero padded literal string.
fn string_words(text: &str) -> Vec<u32> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    while !bytes.len().is_multiple_of(4) {
        bytes.push(0);
    }
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TypeKey {
    Void,
    Bool,
    U32,
    S32,
    F32,
    Vector(u32, u32),
    Array(u32, u32),
    Struct(Vec<u32>),
    Pointer(u32, u32),
    VoidFunction,
    Image(u32),
    SampledImage(u32),
}

fn dim(texture_type: TextureType) -> Dim {
    match texture_type {
        TextureType::Color1D => Dim::Dim1D,
        TextureType::Color2D => Dim::Dim2D,
        TextureType::Color3D => Dim::Dim3D,
        TextureType::ColorCube => Dim::DimCube,
    }
}

#[derive(Debug, Default)]
struct InterfaceVars {
    cbufs: HashMap<u32, u32>,
    textures: Vec<u32>,
    input_generics: [Option<u32>; Attribute::NUM_GENERICS as usize],
    output_generics: [Option<u32>; Attribute::NUM_GENERICS as usize],
    position: Option<u32>,
    frag_coord: Option<u32>,
    vertex_index: Option<u32>,
    instance_index: Option<u32>,
    frag_colors: [Option<u32>; NUM_RENDER_TARGETS as usize],
    frag_depth: Option<u32>,
    sample_mask: Option<u32>,
}

struct SpirvContext<'a> {
    profile: &'a Profile,
    runtime_info: &'a RuntimeInfo,
    program: &'a Program,
    next_id: u32,

    capabilities: Vec<Capability>,
    extensions: Vec<u32>,
    ext_imports: Vec<u32>,
    execution_modes: Vec<u32>,
    annotations: Vec<u32>,
    globals: Vec<u32>,
    code: Vec<u32>,

    glsl_std: u32,
    function: u32,
    types: HashMap<TypeKey, u32>,
    constants: HashMap<(u32, u32), u32>,
    cbuf_struct: Option<u32>,
    interface: Vec<u32>,
    vars: InterfaceVars,

    values: HashMap<InstId, u32>,
    block_labels: Vec<u32>,
    /// Label that closes each block; differs from the opening label when a kill split it.
    end_labels: Vec<u32>,
    kill_labels: HashMap<InstId, (u32, u32)>,
}

impl<'a> SpirvContext<'a> {
    fn new(profile: &'a Profile, runtime_info: &'a RuntimeInfo, program: &'a Program) -> Self {
        let mut ctx = Self {
            profile,
            runtime_info,
            program,
            next_id: 1,
            capabilities: vec![Capability::Shader],
            extensions: Vec::new(),
            ext_imports: Vec::new(),
            execution_modes: Vec::new(),
            annotations: Vec::new(),
            globals: Vec::new(),
            code: Vec::new(),
            glsl_std: 0,
            function: 0,
            types: HashMap::new(),
            constants: HashMap::new(),
            cbuf_struct: None,
            interface: Vec::new(),
            vars: InterfaceVars::default(),
            values: HashMap::new(),
            block_labels: Vec::new(),
            end_labels: Vec::new(),
            kill_labels: HashMap::new(),
        };
        ctx.glsl_std = ctx.alloc_id();
        let mut import = vec![ctx.glsl_std];
        import.extend(string_words("GLSL.std.450"));
        encode(&mut ctx.ext_imports, Op::ExtInstImport, &import);
        ctx.function = ctx.alloc_id();

        ctx.block_labels = (0..program.blocks.len()).map(|_| ctx.alloc_id()).collect();
        ctx.end_labels = ctx.block_labels.clone();
        if !profile.support_demote_to_helper_invocation {
            for &block in &program.block_order {
                for &id in &program.block(block).insts {
                    if program.inst(id).opcode == Opcode::DemoteToHelperInvocation {
                        let kill = ctx.alloc_id();
                        let resume = ctx.alloc_id();
                        ctx.kill_labels.insert(id, (kill, resume));
                        ctx.end_labels[block.index()] = resume;
                    }
                }
            }
        }
        ctx
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn add_capability(&mut self, capability: Capability) {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
    }

    fn decorate(&mut self, target: u32, decoration: Decoration, extra: &[u32]) {
        let mut operands = vec![target, decoration as u32];
        operands.extend_from_slice(extra);
        encode(&mut self.annotations, Op::Decorate, &operands);
    }

    fn type_id(&mut self, key: TypeKey) -> u32 {
        if let Some(&id) = self.types.get(&key) {
            return id;
        }
        let id = self.alloc_id();
        let (op, operands) = match &key {
            TypeKey::Void => (Op::TypeVoid, vec![id]),
            TypeKey::Bool => (Op::TypeBool, vec![id]),
            TypeKey::U32 => (Op::TypeInt, vec![id, 32, 0]),
            TypeKey::S32 => (Op::TypeInt, vec![id, 32, 1]),
            TypeKey::F32 => (Op::TypeFloat, vec![id, 32]),
            TypeKey::Vector(component, count) => (Op::TypeVector, vec![id, *component, *count]),
            TypeKey::Array(element, length) => (Op::TypeArray, vec![id, *element, *length]),
            TypeKey::Struct(members) => {
                let mut operands = vec![id];
                operands.extend_from_slice(members);
                (Op::TypeStruct, operands)
            }
            TypeKey::Pointer(class, pointee) => (Op::TypePointer, vec![id, *class, *pointee]),
            TypeKey::VoidFunction => {
                let void = self.type_id(TypeKey::Void);
                (Op::TypeFunction, vec![id, void])
            }
            TypeKey::Image(dim) => {
                let float = self.type_id(TypeKey::F32);
                // Depth 0, arrayed 0, multisampled 0, sampled 1, format Unknown.
                (Op::TypeImage, vec![id, float, *dim, 0, 0, 0, 1, 0])
            }
            TypeKey::SampledImage(image) => (Op::TypeSampledImage, vec![id, *image]),
        };
        encode(&mut self.globals, op, &operands);
        self.types.insert(key, id);
        id
    }

    fn bool_type(&mut self) -> u32 {
        self.type_id(TypeKey::Bool)
    }

    fn u32_type(&mut self) -> u32 {
        self.type_id(TypeKey::U32)
    }

    fn s32_type(&mut self) -> u32 {
        self.type_id(TypeKey::S32)
    }

    fn f32_type(&mut self) -> u32 {
        self.type_id(TypeKey::F32)
    }

    fn vector_type(&mut self, component: u32, count: u32) -> u32 {
        self.type_id(TypeKey::Vector(component, count))
    }

    fn vec4_type(&mut self) -> u32 {
        let float = self.f32_type();
        self.vector_type(float, 4)
    }

    fn pointer_type(&mut self, class: StorageClass, pointee: u32) -> u32 {
        self.type_id(TypeKey::Pointer(class as u32, pointee))
    }

    fn ir_type(&mut self, ty: Type) -> Result<u32> {
        Ok(match ty {
            Type::U1 => self.bool_type(),
            Type::U32 => self.u32_type(),
            Type::F32 => self.f32_type(),
            Type::F32X4 => self.vec4_type(),
            other => return Err(ShaderError::logic(format!("SPIR-V has no type for {other}"))),
        })
    }

    fn constant(&mut self, ty: u32, bits: u32) -> u32 {
        if let Some(&id) = self.constants.get(&(ty, bits)) {
            return id;
        }
        let id = self.alloc_id();
        encode(&mut self.globals, Op::Constant, &[ty, id, bits]);
        self.constants.insert((ty, bits), id);
        id
    }

    fn const_u32(&mut self, value: u32) -> u32 {
        let ty = self.u32_type();
        self.constant(ty, value)
    }

    fn const_f32(&mut self, value: f32) -> u32 {
        let ty = self.f32_type();
        self.constant(ty, value.to_bits())
    }

    fn const_bool(&mut self, value: bool) -> u32 {
        let ty = self.bool_type();
        if let Some(&id) = self.constants.get(&(ty, value as u32)) {
            return id;
        }
        let id = self.alloc_id();
        let op = if value { Op::ConstantTrue } else { Op::ConstantFalse };
        encode(&mut self.globals, op, &[ty, id]);
        self.constants.insert((ty, value as u32), id);
        id
    }

    fn variable(&mut self, class: StorageClass, pointee: u32) -> u32 {
        let pointer = self.pointer_type(class, pointee);
        let id = self.alloc_id();
        encode(&mut self.globals, Op::Variable, &[pointer, id, class as u32]);
        if matches!(class, StorageClass::Input | StorageClass::Output) {
            self.interface.push(id);
        }
        id
    }

    fn builtin(&mut self, class: StorageClass, pointee: u32, builtin: BuiltIn) -> u32 {
        let id = self.variable(class, pointee);
        self.decorate(id, Decoration::BuiltIn, &[builtin as u32]);
        id
    }

    fn located(&mut self, class: StorageClass, pointee: u32, location: u32) -> u32 {
        let id = self.variable(class, pointee);
        self.decorate(id, Decoration::Location, &[location]);
        id
    }

    fn cbuf_struct_type(&mut self) -> u32 {
        if let Some(id) = self.cbuf_struct {
            return id;
        }
        let uint = self.u32_type();
        let uvec4 = self.vector_type(uint, 4);
        let length = self.const_u32(CBUF_ELEMENTS);
        let array = self.type_id(TypeKey::Array(uvec4, length));
        self.decorate(array, Decoration::ArrayStride, &[16]);
        let block = self.type_id(TypeKey::Struct(vec![array]));
        self.decorate(block, Decoration::Block, &[]);
        encode(
            &mut self.annotations,
            Op::MemberDecorate,
            &[block, 0, Decoration::Offset as u32, 0],
        );
        self.cbuf_struct = Some(block);
        block
    }

    fn declare_interface(&mut self, bindings: &mut Bindings) -> Result<()> {
        let program = self.program;
        let info = &program.info;
        let stage = program.stage;

        for descriptor in &info.constant_buffer_descriptors {
            let block = self.cbuf_struct_type();
            let var = self.variable(StorageClass::Uniform, block);
            let binding = bindings.next_unified();
            self.decorate(var, Decoration::DescriptorSet, &[0]);
            self.decorate(var, Decoration::Binding, &[binding]);
            self.vars.cbufs.insert(descriptor.index, var);
        }
        for descriptor in &info.texture_descriptors {
            if descriptor.texture_type == TextureType::Color1D {
                self.add_capability(Capability::Sampled1D);
            }
            let image = self.type_id(TypeKey::Image(dim(descriptor.texture_type) as u32));
            let sampled = self.type_id(TypeKey::SampledImage(image));
            let var = self.variable(StorageClass::UniformConstant, sampled);
            let binding = bindings.next_unified();
            self.decorate(var, Decoration::DescriptorSet, &[0]);
            self.decorate(var, Decoration::Binding, &[binding]);
            self.vars.textures.push(var);
        }

        let vec4 = self.vec4_type();
        for generic in 0..Attribute::NUM_GENERICS {
            let written = stage != Stage::Fragment
                || self.runtime_info.previous_stage_stores_generic(generic);
            if info.loads_generic(generic) && written && stage != Stage::Compute {
                let var = self.located(StorageClass::Input, vec4, generic);
                self.vars.input_generics[generic as usize] = Some(var);
            }
        }
        match stage {
            Stage::VertexB => {
                if info.stores_position || info.loads_position {
                    let var = self.builtin(StorageClass::Output, vec4, BuiltIn::Position);
                    self.vars.position = Some(var);
                }
                for generic in 0..Attribute::NUM_GENERICS {
                    if info.stores_generic(generic) {
                        self.vars.output_generics[generic as usize] =
                            Some(self.located(StorageClass::Output, vec4, generic));
                    }
                }
                let int = self.s32_type();
                if info.loads_vertex_id {
                    let var = self.builtin(StorageClass::Input, int, BuiltIn::VertexIndex);
                    self.vars.vertex_index = Some(var);
                }
                if info.loads_instance_id {
                    let var = self.builtin(StorageClass::Input, int, BuiltIn::InstanceIndex);
                    self.vars.instance_index = Some(var);
                }
            }
            Stage::Fragment => {
                if info.loads_position {
                    let var = self.builtin(StorageClass::Input, vec4, BuiltIn::FragCoord);
                    self.vars.frag_coord = Some(var);
                }
                for (render_target, &stored) in info.stores_frag_color.iter().enumerate() {
                    if stored {
                        self.vars.frag_colors[render_target] =
                            Some(self.located(StorageClass::Output, vec4, render_target as u32));
                    }
                }
                if info.stores_frag_depth {
                    let float = self.f32_type();
                    let var = self.builtin(StorageClass::Output, float, BuiltIn::FragDepth);
                    self.vars.frag_depth = Some(var);
                }
                if info.stores_sample_mask {
                    let int = self.s32_type();
                    let one = self.const_u32(1);
                    let array = self.type_id(TypeKey::Array(int, one));
                    let var = self.builtin(StorageClass::Output, array, BuiltIn::SampleMask);
                    self.vars.sample_mask = Some(var);
                }
            }
            _ => {}
        }

        let demote = self.profile.support_demote_to_helper_invocation;
        if info.uses_demote_to_helper_invocation && demote {
            self.add_capability(Capability::DemoteToHelperInvocation);
            encode(
                &mut self.extensions,
                Op::Extension,
                &string_words("SPV_EXT_demote_to_helper_invocation"),
            );
        }

        let function = self.function;
        match stage {
            Stage::Fragment => {
                encode(
                    &mut self.execution_modes,
                    Op::ExecutionMode,
                    &[function, ExecutionMode::OriginUpperLeft as u32],
                );
                if self.runtime_info.force_early_z {
                    encode(
                        &mut self.execution_modes,
                        Op::ExecutionMode,
                        &[function, ExecutionMode::EarlyFragmentTests as u32],
                    );
                }
                if info.stores_frag_depth {
                    encode(
                        &mut self.execution_modes,
                        Op::ExecutionMode,
                        &[function, ExecutionMode::DepthReplacing as u32],
                    );
                }
            }
            Stage::Compute => {
                let [x, y, z] = program.workgroup_size;
                encode(
                    &mut self.execution_modes,
                    Op::ExecutionMode,
                    &[function, ExecutionMode::LocalSize as u32, x, y, z],
                );
            }
            _ => {}
        }
        Ok(())
    }

    fn value(&mut self, value: Value) -> Result<u32> {
        Ok(match value {
            Value::Inst(id) => self.inst_id(id),
            Value::U1(value) => self.const_bool(value),
            Value::U32(value) => self.const_u32(value),
            Value::F32(value) => self.const_f32(value),
            other => {
                return Err(ShaderError::logic(format!("SPIR-V cannot express operand {other}")))
            }
        })
    }

    fn inst_id(&mut self, id: InstId) -> u32 {
        if let Some(&existing) = self.values.get(&id) {
            return existing;
        }
        let new = self.alloc_id();
        self.values.insert(id, new);
        new
    }

    fn op(&mut self, op: Op, result_type: u32, operands: &[u32]) -> u32 {
        let id = self.alloc_id();
        self.op_into(op, result_type, id, operands);
        id
    }

    fn op_into(&mut self, op: Op, result_type: u32, id: u32, operands: &[u32]) {
        let mut words = Vec::with_capacity(operands.len() + 2);
        words.push(result_type);
        words.push(id);
        words.extend_from_slice(operands);
        encode(&mut self.code, op, &words);
    }

    fn ext_into(&mut self, result_type: u32, id: u32, instruction: GLOp, operands: &[u32]) {
        let mut words = vec![self.glsl_std, instruction as u32];
        words.extend_from_slice(operands);
        self.op_into(Op::ExtInst, result_type, id, &words);
    }

    fn ext(&mut self, result_type: u32, instruction: GLOp, operands: &[u32]) -> u32 {
        let id = self.alloc_id();
        self.ext_into(result_type, id, instruction, operands);
        id
    }

    fn load_component(&mut self, class: StorageClass, var: u32, component: u32) -> u32 {
        let float = self.f32_type();
        let pointer = self.pointer_type(class, float);
        let index = self.const_u32(component);
        let element = self.op(Op::AccessChain, pointer, &[var, index]);
        self.op(Op::Load, float, &[element])
    }

    fn store_component(&mut self, var: u32, component: u32, value: u32) {
        let float = self.f32_type();
        let pointer = self.pointer_type(StorageClass::Output, float);
        let index = self.const_u32(component);
        let element = self.op(Op::AccessChain, pointer, &[var, index]);
        encode(&mut self.code, Op::Store, &[element, value]);
    }

    fn emit_function(&mut self) -> Result<()> {
        let void = self.type_id(TypeKey::Void);
        let function_type = self.type_id(TypeKey::VoidFunction);
        let function = self.function;
        encode(
            &mut self.code,
            Op::Function,
            &[void, function, FunctionControl::NONE.bits(), function_type],
        );

        let program = self.program;
        let mut open = false;
        for node in &program.syntax_list {
            match *node {
                AbstractSyntaxNode::Block(block) => {
                    let label = self.block_labels[block.index()];
                    if open {
                        encode(&mut self.code, Op::Branch, &[label]);
                    }
                    encode(&mut self.code, Op::Label, &[label]);
                    open = true;
                    for &id in &program.block(block).insts {
                        self.inst(id)?;
                    }
                }
                AbstractSyntaxNode::If { cond, body, merge } => {
                    let cond = self.value(cond)?;
                    let merge = self.block_labels[merge.index()];
                    let body = self.block_labels[body.index()];
                    let control = SelectionControl::NONE.bits();
                    encode(&mut self.code, Op::SelectionMerge, &[merge, control]);
                    encode(&mut self.code, Op::BranchConditional, &[cond, body, merge]);
                    open = false;
                }
                AbstractSyntaxNode::EndIf { merge } => {
                    if open {
                        encode(&mut self.code, Op::Branch, &[self.block_labels[merge.index()]]);
                        open = false;
                    }
                }
                AbstractSyntaxNode::Loop {
                    body,
                    continue_block,
                    merge,
                } => {
                    let merge = self.block_labels[merge.index()];
                    let continue_target = self.block_labels[continue_block.index()];
                    encode(
                        &mut self.code,
                        Op::LoopMerge,
                        &[merge, continue_target, LoopControl::NONE.bits()],
                    );
                    encode(&mut self.code, Op::Branch, &[self.block_labels[body.index()]]);
                    open = false;
                }
                AbstractSyntaxNode::Repeat {
                    cond,
                    loop_header,
                    merge,
                } => {
                    let cond = self.value(cond)?;
                    let header = self.block_labels[loop_header.index()];
                    let merge = self.block_labels[merge.index()];
                    encode(&mut self.code, Op::BranchConditional, &[cond, header, merge]);
                    open = false;
                }
                AbstractSyntaxNode::Break { cond, merge, skip } => {
                    let cond = self.value(cond)?;
                    let merge = self.block_labels[merge.index()];
                    let skip = self.block_labels[skip.index()];
                    encode(&mut self.code, Op::BranchConditional, &[cond, merge, skip]);
                    open = false;
                }
                AbstractSyntaxNode::Return => {
                    encode(&mut self.code, Op::Return, &[]);
                    open = false;
                }
                AbstractSyntaxNode::Unreachable => {
                    encode(&mut self.code, Op::Unreachable, &[]);
                    open = false;
                }
            }
        }
        if open {
            encode(&mut self.code, Op::Return, &[]);
        }
        encode(&mut self.code, Op::FunctionEnd, &[]);
        Ok(())
    }

    fn cbuf_word(&mut self, inst: &Inst) -> Result<u32> {
        let index = inst
            .arg(0)
            .as_u32()
            .ok_or_else(|| ShaderError::logic("constant buffer index is not an immediate"))?;
        let var = *self
            .vars
            .cbufs
            .get(&index)
            .ok_or_else(|| {
                ShaderError::logic(format!("constant buffer {index} was not declared"))
            })?;
        let uint = self.u32_type();
        let uvec4 = self.vector_type(uint, 4);
        let pointer = self.pointer_type(StorageClass::Uniform, uvec4);
        let zero = self.const_u32(0);
        match inst.arg(1) {
            Value::U32(offset) => {
                let element = self.const_u32(offset >> 4);
                let access = self.op(Op::AccessChain, pointer, &[var, zero, element]);
                let vector = self.op(Op::Load, uvec4, &[access]);
                Ok(self.op(Op::CompositeExtract, uint, &[vector, (offset >> 2) & 3]))
            }
            offset => {
                let offset = self.value(offset)?;
                let four = self.const_u32(4);
                let two = self.const_u32(2);
                let three = self.const_u32(3);
                let element = self.op(Op::ShiftRightLogical, uint, &[offset, four]);
                let access = self.op(Op::AccessChain, pointer, &[var, zero, element]);
                let vector = self.op(Op::Load, uvec4, &[access]);
                let word_index = self.op(Op::ShiftRightLogical, uint, &[offset, two]);
                let component = self.op(Op::BitwiseAnd, uint, &[word_index, three]);
                Ok(self.op(Op::VectorExtractDynamic, uint, &[vector, component]))
            }
        }
    }

    fn cbuf_extract(&mut self, id: u32, inst: &Inst, bits: u32, signed: bool) -> Result<()> {
        let word = self.cbuf_word(inst)?;
        let uint = self.u32_type();
        let shift = match inst.arg(1) {
            Value::U32(offset) => self.const_u32((offset & 3) * 8),
            offset => {
                let offset = self.value(offset)?;
                let three = self.const_u32(3);
                let byte = self.op(Op::BitwiseAnd, uint, &[offset, three]);
                self.op(Op::ShiftLeftLogical, uint, &[byte, three])
            }
        };
        let count = self.const_u32(bits);
        let op = if signed {
            Op::BitFieldSExtract
        } else {
            Op::BitFieldUExtract
        };
        self.op_into(op, uint, id, &[word, shift, count]);
        Ok(())
    }

    fn get_attribute(&mut self, id: u32, attribute: Attribute) -> Result<()> {
        let float = self.f32_type();
        let component = attribute.component();
        if attribute.is_position() {
            let (class, var) = match (self.vars.frag_coord, self.vars.position) {
                (Some(var), _) => (StorageClass::Input, var),
                (None, Some(var)) => (StorageClass::Output, var),
                _ => {
                    let stage = self.program.stage;
                    return Err(ShaderError::not_implemented(format!("position read in {stage}")));
                }
            };
            let value = self.load_component(class, var, component);
            self.op_into(Op::CopyObject, float, id, &[value]);
            return Ok(());
        }
        if let Some(generic) = attribute.generic_index() {
            let value = match self.vars.input_generics[generic as usize] {
                Some(var) => self.load_component(StorageClass::Input, var, component),
                None => self.const_f32(if component == 3 { 1.0 } else { 0.0 }),
            };
            self.op_into(Op::CopyObject, float, id, &[value]);
            return Ok(());
        }
        let var = match attribute {
            Attribute::VERTEX_ID => self.vars.vertex_index,
            Attribute::INSTANCE_ID => self.vars.instance_index,
            _ => None,
        }
        .ok_or_else(|| ShaderError::not_implemented(format!("attribute {attribute}")))?;
        let int = self.s32_type();
        let value = self.op(Op::Load, int, &[var]);
        self.op_into(Op::Bitcast, float, id, &[value]);
        Ok(())
    }

    fn set_attribute(&mut self, attribute: Attribute, value: Value) -> Result<()> {
        let value = self.value(value)?;
        let var = if attribute.is_position() {
            self.vars.position
        } else {
            attribute
                .generic_index()
                .and_then(|generic| self.vars.output_generics[generic as usize])
        }
        .ok_or_else(|| ShaderError::not_implemented(format!("store to {attribute}")))?;
        self.store_component(var, attribute.component(), value);
        Ok(())
    }

    fn fp_compare(
        &mut self,
        id: u32,
        inst: &Inst,
        compare: FpCompare,
        ordered: bool,
    ) -> Result<()> {
        let a = self.value(inst.arg(0))?;
        let b = self.value(inst.arg(1))?;
        let boolean = self.bool_type();
        let ordered_op = match compare {
            FpCompare::Equal => Op::FOrdEqual,
            FpCompare::NotEqual => Op::FOrdNotEqual,
            FpCompare::LessThan => Op::FOrdLessThan,
            FpCompare::GreaterThan => Op::FOrdGreaterThan,
            FpCompare::LessThanEqual => Op::FOrdLessThanEqual,
            FpCompare::GreaterThanEqual => Op::FOrdGreaterThanEqual,
        };
        match lower_fp_compare(self.profile, compare, ordered, CompareCaps::SPIRV) {
            CompareLowering::Native => {
                let op = if ordered {
                    ordered_op
                } else {
                    match compare {
                        FpCompare::Equal => Op::FUnordEqual,
                        FpCompare::NotEqual => Op::FUnordNotEqual,
                        FpCompare::LessThan => Op::FUnordLessThan,
                        FpCompare::GreaterThan => Op::FUnordGreaterThan,
                        FpCompare::LessThanEqual => Op::FUnordLessThanEqual,
                        FpCompare::GreaterThanEqual => Op::FUnordGreaterThanEqual,
                    }
                };
                self.op_into(op, boolean, id, &[a, b]);
            }
            CompareLowering::OrNan => {
                let compared = self.op(ordered_op, boolean, &[a, b]);
                let a_nan = self.op(Op::IsNan, boolean, &[a]);
                let b_nan = self.op(Op::IsNan, boolean, &[b]);
                let either = self.op(Op::LogicalOr, boolean, &[compared, a_nan]);
                self.op_into(Op::LogicalOr, boolean, id, &[either, b_nan]);
            }
            CompareLowering::AndNotNan => {
                let compared = self.op(ordered_op, boolean, &[a, b]);
                let a_nan = self.op(Op::IsNan, boolean, &[a]);
                let b_nan = self.op(Op::IsNan, boolean, &[b]);
                let a_number = self.op(Op::LogicalNot, boolean, &[a_nan]);
                let b_number = self.op(Op::LogicalNot, boolean, &[b_nan]);
                let both = self.op(Op::LogicalAnd, boolean, &[compared, a_number]);
                self.op_into(Op::LogicalAnd, boolean, id, &[both, b_number]);
            }
        }
        Ok(())
    }

    fn image_sample(&mut self, id: u32, inst: &Inst) -> Result<()> {
        let info = inst
            .texture_info()
            .ok_or_else(|| ShaderError::logic("texture sample without texture info"))?;
        let var = *self
            .vars
            .textures
            .get(info.descriptor_index as usize)
            .ok_or_else(|| ShaderError::logic("texture descriptor was not declared"))?;
        let image = self.type_id(TypeKey::Image(dim(info.texture_type) as u32));
        let sampled_type = self.type_id(TypeKey::SampledImage(image));
        let sampled = self.op(Op::Load, sampled_type, &[var]);

        let float = self.f32_type();
        let coords: Vec<u32> = (1..=info.texture_type.coordinate_count())
            .map(|index| self.value(inst.arg(index)))
            .collect::<Result<_>>()?;
        let coord = match coords.len() {
            1 => coords[0],
            count => {
                let vector = self.vector_type(float, count as u32);
                self.op(Op::CompositeConstruct, vector, &coords)
            }
        };
        let vec4 = self.vec4_type();
        if self.program.stage == Stage::Fragment {
            self.op_into(Op::ImageSampleImplicitLod, vec4, id, &[sampled, coord]);
        } else {
            let lod = self.const_f32(0.0);
            self.op_into(
                Op::ImageSampleExplicitLod,
                vec4,
                id,
                &[sampled, coord, ImageOperands::LOD.bits(), lod],
            );
        }
        Ok(())
    }

    fn demote(&mut self, inst_id: InstId) {
        if self.profile.support_demote_to_helper_invocation {
            encode(&mut self.code, Op::DemoteToHelperInvocation, &[]);
            return;
        }
        let Some(&(kill, resume)) = self.kill_labels.get(&inst_id) else {
            return;
        };
        // OpKill terminates its block, so it sits behind a selection that always takes it.
        let always = self.const_bool(true);
        encode(&mut self.code, Op::SelectionMerge, &[resume, SelectionControl::NONE.bits()]);
        encode(&mut self.code, Op::BranchConditional, &[always, kill, resume]);
        encode(&mut self.code, Op::Label, &[kill]);
        encode(&mut self.code, Op::Kill, &[]);
        encode(&mut self.code, Op::Label, &[resume]);
    }

    fn inst(&mut self, inst_id: InstId) -> Result<()> {
        let program = self.program;
        let inst = program.inst(inst_id);
        let result_type = match inst.result_type() {
            Type::VOID => 0,
            ty => self.ir_type(ty)?,
        };
        let id = if result_type != 0 { self.inst_id(inst_id) } else { 0 };

        macro_rules! args {
            ($($index:expr),+) => {
                [$(self.value(inst.arg($index))?),+]
            };
        }

        match inst.opcode {
            Opcode::Phi => {
                let mut operands = Vec::with_capacity(inst.num_args() * 2);
                for (index, &pred) in inst.phi_blocks.iter().enumerate() {
                    operands.push(self.value(inst.arg(index))?);
                    operands.push(self.end_labels[pred.index()]);
                }
                self.op_into(Op::Phi, result_type, id, &operands);
            }
            Opcode::ConditionRef => {
                let [cond] = args!(0);
                self.op_into(Op::CopyObject, result_type, id, &[cond]);
            }
            Opcode::UndefU1 | Opcode::UndefU32 | Opcode::UndefF32 => {
                self.op_into(Op::Undef, result_type, id, &[])
            }
            Opcode::DemoteToHelperInvocation => self.demote(inst_id),

            Opcode::GetCbufU8 => self.cbuf_extract(id, inst, 8, false)?,
            Opcode::GetCbufS8 => self.cbuf_extract(id, inst, 8, true)?,
            Opcode::GetCbufU16 => self.cbuf_extract(id, inst, 16, false)?,
            Opcode::GetCbufS16 => self.cbuf_extract(id, inst, 16, true)?,
            Opcode::GetCbufU32 => {
                let word = self.cbuf_word(inst)?;
                self.op_into(Op::CopyObject, result_type, id, &[word]);
            }
            Opcode::GetCbufF32 => {
                let word = self.cbuf_word(inst)?;
                self.op_into(Op::Bitcast, result_type, id, &[word]);
            }

            Opcode::GetAttribute => match inst.arg(0) {
                Value::Attribute(attribute) => self.get_attribute(id, attribute)?,
                _ => return Err(ShaderError::logic("attribute load without an attribute")),
            },
            Opcode::SetAttribute => match inst.arg(0) {
                Value::Attribute(attribute) => self.set_attribute(attribute, inst.arg(1))?,
                _ => return Err(ShaderError::logic("attribute store without an attribute")),
            },
            Opcode::SetFragColor => {
                let render_target = inst.arg(0).as_u32().unwrap_or(0);
                let component = inst.arg(1).as_u32().unwrap_or(0) & 3;
                let var = self
                    .vars
                    .frag_colors
                    .get(render_target as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| {
                        let message = format!("render target {render_target} was not declared");
                        ShaderError::logic(message)
                    })?;
                let [value] = args!(2);
                self.store_component(var, component, value);
            }
            Opcode::SetSampleMask => {
                let var = self
                    .vars
                    .sample_mask
                    .ok_or_else(|| ShaderError::logic("sample mask output was not declared"))?;
                let [value] = args!(0);
                let int = self.s32_type();
                let pointer = self.pointer_type(StorageClass::Output, int);
                let zero = self.const_u32(0);
                let element = self.op(Op::AccessChain, pointer, &[var, zero]);
                let mask = self.op(Op::Bitcast, int, &[value]);
                encode(&mut self.code, Op::Store, &[element, mask]);
            }
            Opcode::SetFragDepth => {
                let var = self
                    .vars
                    .frag_depth
                    .ok_or_else(|| ShaderError::logic("depth output was not declared"))?;
                let [value] = args!(0);
                encode(&mut self.code, Op::Store, &[var, value]);
            }

            Opcode::SelectU1 | Opcode::SelectU32 | Opcode::SelectF32 => {
                let operands = args!(0, 1, 2);
                self.op_into(Op::Select, result_type, id, &operands);
            }
            Opcode::BitCastU32F32 | Opcode::BitCastF32U32 => {
                let operands = args!(0);
                self.op_into(Op::Bitcast, result_type, id, &operands);
            }

            Opcode::FPAdd32 | Opcode::FPMul32 => {
                let operands = args!(0, 1);
                let op = if inst.opcode == Opcode::FPAdd32 { Op::FAdd } else { Op::FMul };
                self.op_into(op, result_type, id, &operands);
                if is_precise(inst) {
                    self.decorate(id, Decoration::NoContraction, &[]);
                }
            }
            Opcode::FPFma32 => {
                let operands = args!(0, 1, 2);
                self.ext_into(result_type, id, GLOp::Fma, &operands);
                if is_precise(inst) {
                    self.decorate(id, Decoration::NoContraction, &[]);
                }
            }
            Opcode::FPAbs32 => {
                let operands = args!(0);
                self.ext_into(result_type, id, GLOp::FAbs, &operands);
            }
            Opcode::FPMax32 => {
                let operands = args!(0, 1);
                self.ext_into(result_type, id, GLOp::FMax, &operands);
            }
            Opcode::FPMin32 => {
                let operands = args!(0, 1);
                self.ext_into(result_type, id, GLOp::FMin, &operands);
            }
            Opcode::FPNeg32 => {
                let operands = args!(0);
                self.op_into(Op::FNegate, result_type, id, &operands);
            }
            Opcode::FPRecip32 => {
                let one = self.const_f32(1.0);
                let [value] = args!(0);
                self.op_into(Op::FDiv, result_type, id, &[one, value]);
            }
            Opcode::FPRecipSqrt32 => {
                let operands = args!(0);
                self.ext_into(result_type, id, GLOp::InverseSqrt, &operands);
            }
            Opcode::FPSqrt => {
                let operands = args!(0);
                self.ext_into(result_type, id, GLOp::Sqrt, &operands);
            }
            Opcode::FPSin => {
                let operands = args!(0);
                self.ext_into(result_type, id, GLOp::Sin, &operands);
            }
            Opcode::FPCos => {
                let operands = args!(0);
                self.ext_into(result_type, id, GLOp::Cos, &operands);
            }
            Opcode::FPExp2 => {
                let operands = args!(0);
                self.ext_into(result_type, id, GLOp::Exp2, &operands);
            }
            Opcode::FPLog2 => {
                let operands = args!(0);
                self.ext_into(result_type, id, GLOp::Log2, &operands);
            }
            Opcode::FPSaturate32 => {
                let [value] = args!(0);
                let zero = self.const_f32(0.0);
                let one = self.const_f32(1.0);
                match lower_clamp(self.profile) {
                    ClampLowering::Native => {
                        self.ext_into(result_type, id, GLOp::FClamp, &[value, zero, one])
                    }
                    ClampLowering::MinMax => {
                        let floor = self.ext(result_type, GLOp::FMax, &[value, zero]);
                        self.ext_into(result_type, id, GLOp::FMin, &[floor, one]);
                    }
                }
            }
            Opcode::FPIsNan32 => {
                let operands = args!(0);
                self.op_into(Op::IsNan, result_type, id, &operands);
            }
            opcode if opcode.fp_compare().is_some() => {
                let (compare, ordered) = opcode
                    .fp_compare()
                    .ok_or_else(|| ShaderError::logic("float compare without a relation"))?;
                self.fp_compare(id, inst, compare, ordered)?;
            }

            Opcode::INeg32 | Opcode::BitwiseNot32 | Opcode::LogicalNot => {
                let operands = args!(0);
                let op = match inst.opcode {
                    Opcode::INeg32 => Op::SNegate,
                    Opcode::BitwiseNot32 => Op::Not,
                    _ => Op::LogicalNot,
                };
                self.op_into(op, result_type, id, &operands);
            }
            Opcode::IAdd32
            | Opcode::ShiftLeftLogical32
            | Opcode::ShiftRightLogical32
            | Opcode::ShiftRightArithmetic32
            | Opcode::BitwiseAnd32
            | Opcode::BitwiseOr32
            | Opcode::BitwiseXor32
            | Opcode::IEqual
            | Opcode::INotEqual
            | Opcode::SLessThan
            | Opcode::ULessThan
            | Opcode::SLessThanEqual
            | Opcode::ULessThanEqual
            | Opcode::SGreaterThan
            | Opcode::UGreaterThan
            | Opcode::SGreaterThanEqual
            | Opcode::UGreaterThanEqual
            | Opcode::LogicalOr
            | Opcode::LogicalAnd
            | Opcode::LogicalXor => {
                let operands = args!(0, 1);
                let op = match inst.opcode {
                    Opcode::IAdd32 => Op::IAdd,
                    Opcode::ShiftLeftLogical32 => Op::ShiftLeftLogical,
                    Opcode::ShiftRightLogical32 => Op::ShiftRightLogical,
                    Opcode::ShiftRightArithmetic32 => Op::ShiftRightArithmetic,
                    Opcode::BitwiseAnd32 => Op::BitwiseAnd,
                    Opcode::BitwiseOr32 => Op::BitwiseOr,
                    Opcode::BitwiseXor32 => Op::BitwiseXor,
                    Opcode::IEqual => Op::IEqual,
                    Opcode::INotEqual => Op::INotEqual,
                    Opcode::SLessThan => Op::SLessThan,
                    Opcode::ULessThan => Op::ULessThan,
                    Opcode::SLessThanEqual => Op::SLessThanEqual,
                    Opcode::ULessThanEqual => Op::ULessThanEqual,
                    Opcode::SGreaterThan => Op::SGreaterThan,
                    Opcode::UGreaterThan => Op::UGreaterThan,
                    Opcode::SGreaterThanEqual => Op::SGreaterThanEqual,
                    Opcode::UGreaterThanEqual => Op::UGreaterThanEqual,
                    Opcode::LogicalOr => Op::LogicalOr,
                    Opcode::LogicalAnd => Op::LogicalAnd,
                    _ => Op::LogicalNotEqual,
                };
                self.op_into(op, result_type, id, &operands);
            }

            Opcode::ConvertF32S32
            | Opcode::ConvertF32U32
            | Opcode::ConvertS32F32
            | Opcode::ConvertU32F32 => {
                let operands = args!(0);
                let op = match inst.opcode {
                    Opcode::ConvertF32S32 => Op::ConvertSToF,
                    Opcode::ConvertF32U32 => Op::ConvertUToF,
                    Opcode::ConvertS32F32 => Op::ConvertFToS,
                    _ => Op::ConvertFToU,
                };
                self.op_into(op, result_type, id, &operands);
            }

            Opcode::ImageSample => self.image_sample(id, inst)?,
            Opcode::CompositeExtractF32x4 => {
                let [vector] = args!(0);
                match inst.arg(1) {
                    Value::U32(index) => {
                        self.op_into(Op::CompositeExtract, result_type, id, &[vector, index])
                    }
                    other => {
                        let index = self.value(other)?;
                        self.op_into(Op::VectorExtractDynamic, result_type, id, &[vector, index]);
                    }
                }
            }

            opcode => {
                return Err(ShaderError::logic(format!("{opcode} reached the SPIR-V backend")))
            }
        }
        Ok(())
    }

    fn assemble(self) -> Vec<u32> {
        let execution_model = match self.program.stage {
            Stage::Fragment => ExecutionModel::Fragment,
            Stage::Compute => ExecutionModel::GLCompute,
            _ => ExecutionModel::Vertex,
        };
        let mut words = vec![spirv::MAGIC_NUMBER, self.profile.supported_spirv, 0, self.next_id, 0];
        for capability in &self.capabilities {
            encode(&mut words, Op::Capability, &[*capability as u32]);
        }
        words.extend_from_slice(&self.extensions);
        words.extend_from_slice(&self.ext_imports);
        encode(
            &mut words,
            Op::MemoryModel,
            &[AddressingModel::Logical as u32, MemoryModel::GLSL450 as u32],
        );
        let mut entry_point = vec![execution_model as u32, self.function];
        entry_point.extend(string_words("main"));
        entry_point.extend_from_slice(&self.interface);
        encode(&mut words, Op::EntryPoint, &entry_point);
        words.extend_from_slice(&self.execution_modes);
        words.extend_from_slice(&self.annotations);
        words.extend_from_slice(&self.globals);
        words.extend_from_slice(&self.code);
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_nul_terminated_and_padded() {
        assert_eq!(string_words("main"), vec![u32::from_le_bytes(*b"main"), 0]);
        assert_eq!(string_words("abc"), vec![u32::from_le_bytes(*b"abc\0")]);
    }

    #[test]
    fn instruction_word_carries_length_and_opcode() {
        let mut words = Vec::new();
        encode(&mut words, Op::TypeInt, &[7, 32, 0]);
        assert_eq!(words, vec![(4 << 16) | Op::TypeInt as u32, 7, 32, 0]);
    }

    #[test]
    fn header_reports_the_id_bound() {
        let mut program = Program::new(Stage::Compute);
        let block = program.new_block();
        program.block_order = vec![block];
        program.syntax_list = vec![AbstractSyntaxNode::Block(block), AbstractSyntaxNode::Return];
        let runtime_info = RuntimeInfo::default();
        let words =
            emit_spirv(&Profile::default(), &runtime_info, &program, &mut Bindings::new()).unwrap();
        assert_eq!(words[0], spirv::MAGIC_NUMBER);
        assert_eq!(words[1], Profile::default().supported_spirv);
        let bound = words[3];
        let mut index = 5;
        while index < words.len() {
            let count = (words[index] >> 16) as usize;
            assert!(count > 0);
            index += count;
        }
        assert_eq!(index, words.len());
        assert!(bound > 1);
    }
}
