use std::fmt::Write;

use crate::environment::TextureType;
use crate::error::{Result, ShaderError};
use crate::ir::{Attribute, BlockId, FpCompare, Inst, InstId, Opcode, Program, Type, Value};
use crate::profile::{Profile, RuntimeInfo};
use crate::stage::Stage;

use super::bindings::Bindings;
use super::policy::{
    is_precise, lower_clamp, lower_fp_compare, ClampLowering, CompareCaps, CompareLowering,
};
use super::{check_stage, walk_structured, PhiMove, StructuredEmitter};

const SWIZZLE: [char; 4] = ['x', 'y', 'z', 'w'];

/// Emits a `#version 450` GLSL translation unit for `program`.
pub fn emit_glsl(
    profile: &Profile,
    runtime_info: &RuntimeInfo,
    program: &Program,
    bindings: &mut Bindings,
) -> Result<String> {
    check_stage(program.stage)?;
    let mut ctx = GlslContext {
        profile,
        runtime_info,
        program,
        body: String::new(),
        indent: 1,
    };
    walk_structured(program, &mut ctx)?;

    let mut out = String::new();
    ctx.write_header(&mut out, bindings);
    out.push_str("void main() {\n");
    ctx.write_declarations(&mut out)?;
    out.push_str(&ctx.body);
    out.push_str("}\n");
    Ok(out)
}

fn glsl_type(ty: Type) -> Option<&'static str> {
    Some(match ty {
        Type::U1 => "bool",
        Type::U32 => "uint",
        Type::F32 => "float",
        Type::F32X4 => "vec4",
        _ => return None,
    })
}

fn float_literal(value: f32) -> String {
    if value.is_finite() {
        format!("{value:?}")
    } else {
        format!("uintBitsToFloat(0x{:08x}u)", value.to_bits())
    }
}

fn sampler_type(texture_type: TextureType) -> &'static str {
    match texture_type {
        TextureType::Color1D => "sampler1D",
        TextureType::Color2D => "sampler2D",
        TextureType::Color3D => "sampler3D",
        TextureType::ColorCube => "samplerCube",
    }
}

fn compare_operator(compare: FpCompare) -> &'static str {
    match compare {
        FpCompare::Equal => "==",
        FpCompare::NotEqual => "!=",
        FpCompare::LessThan => "<",
        FpCompare::GreaterThan => ">",
        FpCompare::LessThanEqual => "<=",
        FpCompare::GreaterThanEqual => ">=",
    }
}

struct GlslContext<'a> {
    profile: &'a Profile,
    runtime_info: &'a RuntimeInfo,
    program: &'a Program,
    body: String,
    indent: usize,
}

impl GlslContext<'_> {
    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.indent {
            self.body.push_str("    ");
        }
        self.body.push_str(text.as_ref());
        self.body.push('\n');
    }

    fn value(&self, value: Value) -> Result<String> {
        Ok(match value {
            Value::Inst(id) => format!("v{}", id.0),
            Value::U1(value) => value.to_string(),
            Value::U32(value) => format!("{value}u"),
            Value::F32(value) => float_literal(value),
            other => return Err(ShaderError::logic(format!("GLSL cannot express operand {other}"))),
        })
    }

    fn args<const N: usize>(&self, inst: &Inst) -> Result<[String; N]> {
        let mut args: [String; N] = std::array::from_fn(|_| String::new());
        for (index, slot) in args.iter_mut().enumerate() {
            *slot = self.value(inst.arg(index))?;
        }
        Ok(args)
    }

    fn write_header(&self, out: &mut String, bindings: &mut Bindings) {
        let program = self.program;
        let info = &program.info;
        out.push_str("#version 450\n");
        let demote = self.profile.support_demote_to_helper_invocation;
        if info.uses_demote_to_helper_invocation && demote {
            out.push_str("#extension GL_EXT_demote_to_helper_invocation : require\n");
        }
        match program.stage {
            Stage::Compute => {
                let [x, y, z] = program.workgroup_size;
                let _ = writeln!(
                    out,
                    "layout(local_size_x = {x}, local_size_y = {y}, local_size_z = {z}) in;"
                );
            }
            Stage::Fragment if self.runtime_info.force_early_z => {
                out.push_str("layout(early_fragment_tests) in;\n");
            }
            _ => {}
        }
        for descriptor in &info.constant_buffer_descriptors {
            let binding = bindings.next_uniform_buffer();
            let index = descriptor.index;
            let _ = writeln!(
                out,
                "layout(std140, binding = {binding}) uniform cbuf_block{index} \
                 {{ uvec4 cbuf{index}[4096]; }};"
            );
        }
        for (index, descriptor) in info.texture_descriptors.iter().enumerate() {
            let binding = bindings.next_texture();
            let sampler = sampler_type(descriptor.texture_type);
            let _ = writeln!(out, "layout(binding = {binding}) uniform {sampler} tex{index};");
        }
        for generic in 0..Attribute::NUM_GENERICS {
            if info.loads_generic(generic) && self.input_is_written(generic) {
                let _ = writeln!(out, "layout(location = {generic}) in vec4 in_attr{generic};");
            }
        }
        if program.stage == Stage::VertexB {
            for generic in 0..Attribute::NUM_GENERICS {
                if info.stores_generic(generic) {
                    let _ =
                        writeln!(out, "layout(location = {generic}) out vec4 out_attr{generic};");
                }
            }
        }
        if program.stage == Stage::Fragment {
            let stored = info.stores_frag_color.iter().enumerate().filter(|(_, stored)| **stored);
            for (render_target, _) in stored {
                let _ = writeln!(
                    out,
                    "layout(location = {render_target}) out vec4 frag_color{render_target};"
                );
            }
        }
    }

    fn write_declarations(&self, out: &mut String) -> Result<()> {
        for &block in &self.program.block_order {
            for &id in &self.program.block(block).insts {
                let inst = self.program.inst(id);
                let ty = inst.result_type();
                if ty == Type::VOID {
                    continue;
                }
                let name = glsl_type(ty)
                    .ok_or_else(|| ShaderError::logic(format!("GLSL has no type for {ty}")))?;
                let precise = if is_precise(inst) && !self.profile.has_gl_precise_bug {
                    "precise "
                } else {
                    ""
                };
                let _ = writeln!(out, "    {precise}{name} v{};", id.0);
            }
        }
        Ok(())
    }

    /// Fragment inputs the previous stage never writes are not declared and read as constants.
    fn input_is_written(&self, generic: u32) -> bool {
        self.program.stage != Stage::Fragment
            || self.runtime_info.previous_stage_stores_generic(generic)
    }

    fn attribute(&self, attribute: Attribute) -> Result<String> {
        let component = SWIZZLE[attribute.component() as usize];
        if attribute.is_position() {
            return match self.program.stage {
                Stage::Fragment => Ok(format!("gl_FragCoord.{component}")),
                Stage::VertexB => Ok(format!("gl_Position.{component}")),
                stage => Err(ShaderError::not_implemented(format!("position read in {stage}"))),
            };
        }
        if let Some(generic) = attribute.generic_index() {
            if !self.input_is_written(generic) {
                return Ok(if attribute.component() == 3 { "1.0" } else { "0.0" }.to_owned());
            }
            return Ok(format!("in_attr{generic}.{component}"));
        }
        match attribute {
            Attribute::VERTEX_ID => Ok("intBitsToFloat(gl_VertexID)".to_owned()),
            Attribute::INSTANCE_ID => Ok("intBitsToFloat(gl_InstanceID)".to_owned()),
            other => Err(ShaderError::not_implemented(format!("attribute {other}"))),
        }
    }

    fn cbuf_word(&self, index: u32, offset: Value) -> Result<String> {
        Ok(match offset {
            Value::U32(offset) => format!("cbuf{index}[{}][{}]", offset >> 4, (offset >> 2) & 3),
            other => {
                let offset = self.value(other)?;
                format!("cbuf{index}[{offset} >> 4u][({offset} >> 2u) & 3u]")
            }
        })
    }

    fn cbuf_extract(&self, inst: &Inst, bits: u32, signed: bool) -> Result<String> {
        let index = inst.arg(0).as_u32().unwrap_or(0);
        let word = self.cbuf_word(index, inst.arg(1))?;
        let shift = match inst.arg(1) {
            Value::U32(offset) => format!("{}", (offset & 3) * 8),
            other => format!("int(({} & 3u) * 8u)", self.value(other)?),
        };
        Ok(if signed {
            format!("uint(bitfieldExtract(int({word}), {shift}, {bits}))")
        } else {
            format!("bitfieldExtract({word}, {shift}, {bits})")
        })
    }

    fn fp_compare(&self, inst: &Inst, compare: FpCompare, ordered: bool) -> Result<String> {
        let [a, b] = self.args::<2>(inst)?;
        let op = compare_operator(compare);
        Ok(match lower_fp_compare(self.profile, compare, ordered, CompareCaps::TEXT) {
            CompareLowering::Native if ordered => format!("{a} {op} {b}"),
            CompareLowering::Native => {
                // Unordered relations are the negation of the complementary ordered one.
                let complement = match compare {
                    FpCompare::LessThan => ">=",
                    FpCompare::GreaterThan => "<=",
                    FpCompare::LessThanEqual => ">",
                    FpCompare::GreaterThanEqual => "<",
                    FpCompare::NotEqual => return Ok(format!("{a} != {b}")),
                    FpCompare::Equal => {
                        return Ok(format!("{a} == {b} || isnan({a}) || isnan({b})"))
                    }
                };
                format!("!({a} {complement} {b})")
            }
            CompareLowering::OrNan => format!("{a} {op} {b} || isnan({a}) || isnan({b})"),
            CompareLowering::AndNotNan => format!("{a} {op} {b} && !isnan({a}) && !isnan({b})"),
        })
    }

    fn image_sample(&self, inst: &Inst) -> Result<String> {
        let info = inst
            .texture_info()
            .ok_or_else(|| ShaderError::logic("texture sample without texture info"))?;
        let [_, x, y, z] = self.args::<4>(inst)?;
        let coords = match info.texture_type {
            TextureType::Color1D => x,
            TextureType::Color2D => format!("vec2({x}, {y})"),
            TextureType::Color3D | TextureType::ColorCube => format!("vec3({x}, {y}, {z})"),
        };
        let sampler = info.descriptor_index;
        Ok(if self.program.stage == Stage::Fragment {
            format!("texture(tex{sampler}, {coords})")
        } else {
            format!("textureLod(tex{sampler}, {coords}, 0.0)")
        })
    }

    fn inst(&mut self, id: InstId) -> Result<()> {
        let inst = self.program.inst(id);
        let name = format!("v{}", id.0);
        let expr = match inst.opcode {
            Opcode::Phi => return Ok(()),
            Opcode::ConditionRef => self.value(inst.arg(0))?,
            Opcode::UndefU1 => "false".to_owned(),
            Opcode::UndefU32 => "0u".to_owned(),
            Opcode::UndefF32 => "0.0".to_owned(),
            Opcode::DemoteToHelperInvocation => {
                if self.profile.support_demote_to_helper_invocation {
                    self.line("demote;");
                } else {
                    self.line("discard;");
                }
                return Ok(());
            }

            Opcode::GetCbufU8 => self.cbuf_extract(inst, 8, false)?,
            Opcode::GetCbufS8 => self.cbuf_extract(inst, 8, true)?,
            Opcode::GetCbufU16 => self.cbuf_extract(inst, 16, false)?,
            Opcode::GetCbufS16 => self.cbuf_extract(inst, 16, true)?,
            Opcode::GetCbufU32 => self.cbuf_word(inst.arg(0).as_u32().unwrap_or(0), inst.arg(1))?,
            Opcode::GetCbufF32 => format!(
                "uintBitsToFloat({})",
                self.cbuf_word(inst.arg(0).as_u32().unwrap_or(0), inst.arg(1))?
            ),

            Opcode::GetAttribute => match inst.arg(0) {
                Value::Attribute(attribute) => self.attribute(attribute)?,
                _ => return Err(ShaderError::logic("attribute load without an attribute")),
            },
            Opcode::SetAttribute => {
                let Value::Attribute(attribute) = inst.arg(0) else {
                    return Err(ShaderError::logic("attribute store without an attribute"));
                };
                let value = self.value(inst.arg(1))?;
                let component = SWIZZLE[attribute.component() as usize];
                if attribute.is_position() {
                    self.line(format!("gl_Position.{component} = {value};"));
                } else if let Some(generic) = attribute.generic_index() {
                    self.line(format!("out_attr{generic}.{component} = {value};"));
                } else {
                    return Err(ShaderError::not_implemented(format!("store to {attribute}")));
                }
                return Ok(());
            }
            Opcode::SetFragColor => {
                let render_target = inst.arg(0).as_u32().unwrap_or(0);
                let component = SWIZZLE[(inst.arg(1).as_u32().unwrap_or(0) & 3) as usize];
                let value = self.value(inst.arg(2))?;
                self.line(format!("frag_color{render_target}.{component} = {value};"));
                return Ok(());
            }
            Opcode::SetSampleMask => {
                let value = self.value(inst.arg(0))?;
                self.line(format!("gl_SampleMask[0] = int({value});"));
                return Ok(());
            }
            Opcode::SetFragDepth => {
                let value = self.value(inst.arg(0))?;
                self.line(format!("gl_FragDepth = {value};"));
                return Ok(());
            }

            Opcode::SelectU1 | Opcode::SelectU32 | Opcode::SelectF32 => {
                let [cond, a, b] = self.args::<3>(inst)?;
                format!("{cond} ? {a} : {b}")
            }
            Opcode::BitCastU32F32 => format!("floatBitsToUint({})", self.value(inst.arg(0))?),
            Opcode::BitCastF32U32 => format!("uintBitsToFloat({})", self.value(inst.arg(0))?),

            Opcode::FPAbs32 => format!("abs({})", self.value(inst.arg(0))?),
            Opcode::FPAdd32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} + {b}")
            }
            Opcode::FPMul32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} * {b}")
            }
            Opcode::FPFma32 => {
                let [a, b, c] = self.args::<3>(inst)?;
                format!("fma({a}, {b}, {c})")
            }
            Opcode::FPMax32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("max({a}, {b})")
            }
            Opcode::FPMin32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("min({a}, {b})")
            }
            Opcode::FPNeg32 => format!("-({})", self.value(inst.arg(0))?),
            Opcode::FPRecip32 => format!("1.0 / ({})", self.value(inst.arg(0))?),
            Opcode::FPRecipSqrt32 => format!("inversesqrt({})", self.value(inst.arg(0))?),
            Opcode::FPSqrt => format!("sqrt({})", self.value(inst.arg(0))?),
            Opcode::FPSin => format!("sin({})", self.value(inst.arg(0))?),
            Opcode::FPCos => format!("cos({})", self.value(inst.arg(0))?),
            Opcode::FPExp2 => format!("exp2({})", self.value(inst.arg(0))?),
            Opcode::FPLog2 => format!("log2({})", self.value(inst.arg(0))?),
            Opcode::FPSaturate32 => {
                let value = self.value(inst.arg(0))?;
                match lower_clamp(self.profile) {
                    ClampLowering::Native => format!("clamp({value}, 0.0, 1.0)"),
                    ClampLowering::MinMax => format!("min(max({value}, 0.0), 1.0)"),
                }
            }
            Opcode::FPIsNan32 => format!("isnan({})", self.value(inst.arg(0))?),
            opcode if opcode.fp_compare().is_some() => {
                let (compare, ordered) = opcode
                    .fp_compare()
                    .ok_or_else(|| ShaderError::logic("float compare without a relation"))?;
                self.fp_compare(inst, compare, ordered)?
            }

            Opcode::IAdd32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} + {b}")
            }
            Opcode::INeg32 => format!("uint(-int({}))", self.value(inst.arg(0))?),
            Opcode::ShiftLeftLogical32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} << {b}")
            }
            Opcode::ShiftRightLogical32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} >> {b}")
            }
            Opcode::ShiftRightArithmetic32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("uint(int({a}) >> {b})")
            }
            Opcode::BitwiseAnd32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} & {b}")
            }
            Opcode::BitwiseOr32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} | {b}")
            }
            Opcode::BitwiseXor32 => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} ^ {b}")
            }
            Opcode::BitwiseNot32 => format!("~{}", self.value(inst.arg(0))?),
            Opcode::IEqual
            | Opcode::INotEqual
            | Opcode::SLessThan
            | Opcode::ULessThan
            | Opcode::SLessThanEqual
            | Opcode::ULessThanEqual
            | Opcode::SGreaterThan
            | Opcode::UGreaterThan
            | Opcode::SGreaterThanEqual
            | Opcode::UGreaterThanEqual => {
                let [a, b] = self.args::<2>(inst)?;
                let (op, signed) = match inst.opcode {
                    Opcode::IEqual => ("==", false),
                    Opcode::INotEqual => ("!=", false),
                    Opcode::SLessThan => ("<", true),
                    Opcode::ULessThan => ("<", false),
                    Opcode::SLessThanEqual => ("<=", true),
                    Opcode::ULessThanEqual => ("<=", false),
                    Opcode::SGreaterThan => (">", true),
                    Opcode::UGreaterThan => (">", false),
                    Opcode::SGreaterThanEqual => (">=", true),
                    _ => (">=", false),
                };
                if signed {
                    format!("int({a}) {op} int({b})")
                } else {
                    format!("{a} {op} {b}")
                }
            }

            Opcode::LogicalOr => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} || {b}")
            }
            Opcode::LogicalAnd => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} && {b}")
            }
            Opcode::LogicalXor => {
                let [a, b] = self.args::<2>(inst)?;
                format!("{a} ^^ {b}")
            }
            Opcode::LogicalNot => format!("!{}", self.value(inst.arg(0))?),

            Opcode::ConvertF32S32 => format!("float(int({}))", self.value(inst.arg(0))?),
            Opcode::ConvertF32U32 => format!("float({})", self.value(inst.arg(0))?),
            Opcode::ConvertS32F32 => format!("uint(int({}))", self.value(inst.arg(0))?),
            Opcode::ConvertU32F32 => format!("uint({})", self.value(inst.arg(0))?),

            Opcode::ImageSample => self.image_sample(inst)?,
            Opcode::CompositeExtractF32x4 => {
                let vector = self.value(inst.arg(0))?;
                match inst.arg(1) {
                    Value::U32(index) if index < 4 => {
                        format!("{vector}.{}", SWIZZLE[index as usize])
                    }
                    other => format!("{vector}[int({})]", self.value(other)?),
                }
            }

            opcode => {
                return Err(ShaderError::logic(format!("{opcode} reached the GLSL backend")));
            }
        };
        self.line(format!("{name} = {expr};"));
        Ok(())
    }
}

impl StructuredEmitter for GlslContext<'_> {
    fn block(&mut self, block: BlockId) -> Result<()> {
        for &id in &self.program.block(block).insts {
            self.inst(id)?;
        }
        Ok(())
    }

    fn phi_moves(&mut self, moves: &[PhiMove], through_temporaries: bool) -> Result<()> {
        if !through_temporaries {
            for &(phi, value) in moves {
                let value = self.value(value)?;
                self.line(format!("v{} = {value};", phi.0));
            }
            return Ok(());
        }
        self.line("{");
        self.indent += 1;
        for (index, &(phi, value)) in moves.iter().enumerate() {
            let ty = glsl_type(self.program.inst(phi).result_type())
                .ok_or_else(|| ShaderError::logic("phi without a GLSL type"))?;
            let value = self.value(value)?;
            self.line(format!("{ty} tmp{index} = {value};"));
        }
        for (index, &(phi, _)) in moves.iter().enumerate() {
            self.line(format!("v{} = tmp{index};", phi.0));
        }
        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    fn open_if(&mut self, cond: Value) -> Result<()> {
        let cond = self.value(cond)?;
        self.line(format!("if ({cond}) {{"));
        self.indent += 1;
        Ok(())
    }

    fn close_if(&mut self) -> Result<()> {
        self.indent = self.indent.saturating_sub(1);
        self.line("}");
        Ok(())
    }

    fn open_loop(&mut self) -> Result<()> {
        self.line("for (;;) {");
        self.indent += 1;
        Ok(())
    }

    fn exit_loop_unless(&mut self, cond: Value) -> Result<()> {
        let cond = self.value(cond)?;
        self.line(format!("if (!{cond}) {{"));
        self.indent += 1;
        self.line("break;");
        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    fn close_loop(&mut self) -> Result<()> {
        self.indent = self.indent.saturating_sub(1);
        self.line("}");
        Ok(())
    }

    fn break_if(&mut self, cond: Value, moves: &[PhiMove]) -> Result<()> {
        let cond = self.value(cond)?;
        self.line(format!("if ({cond}) {{"));
        self.indent += 1;
        self.phi_moves(moves, false)?;
        self.line("break;");
        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    fn ret(&mut self) -> Result<()> {
        self.line("return;");
        Ok(())
    }

    fn unreachable(&mut self) -> Result<()> {
        Ok(())
    }
}
