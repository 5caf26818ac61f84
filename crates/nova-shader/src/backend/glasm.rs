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

/// Emits NV_gpu_program5 assembly for `program`.
///
/// Every value lives in its own `R<id>` temporary. Booleans are integers, `-1` for true and `0`
/// for false, so they can drive `CMP` and the condition code directly.
pub fn emit_glasm(
    profile: &Profile,
    runtime_info: &RuntimeInfo,
    program: &Program,
    bindings: &mut Bindings,
) -> Result<String> {
    check_stage(program.stage)?;
    let texture_base = bindings.texture;
    let mut ctx = GlasmContext {
        profile,
        runtime_info,
        program,
        texture_base,
        body: String::new(),
        num_temporaries: 0,
    };
    walk_structured(program, &mut ctx)?;

    let info = &program.info;
    let mut out = String::new();
    out.push_str(match program.stage {
        Stage::Fragment => "!!NVfp5.0\n",
        Stage::Compute => "!!NVcp5.0\n",
        _ => "!!NVvp5.0\n",
    });
    out.push_str("OPTION NV_internal;\n");
    if program.stage == Stage::Fragment && runtime_info.force_early_z {
        out.push_str("OPTION NV_early_fragment_tests;\n");
    }
    if program.stage == Stage::Compute {
        let [x, y, z] = program.workgroup_size;
        let _ = writeln!(out, "GROUP_SIZE {x} {y} {z};");
    }
    for descriptor in &info.constant_buffer_descriptors {
        let binding = bindings.next_uniform_buffer();
        let _ = writeln!(out, "CBUFFER c{}[]={{program.buffer[{binding}]}};", descriptor.index);
    }
    for _ in &info.texture_descriptors {
        bindings.next_texture();
    }

    let mut temps: Vec<String> = Vec::new();
    for &block in &program.block_order {
        for &id in &program.block(block).insts {
            if program.inst(id).result_type() != Type::VOID {
                temps.push(format!("R{}", id.0));
            }
        }
    }
    temps.extend((0..ctx.num_temporaries).map(|index| format!("T{index}")));
    if ctx.shadows_position() {
        temps.push("POS".to_owned());
    }
    temps.push("RC".to_owned());
    let _ = writeln!(out, "TEMP {};", temps.join(","));

    out.push_str(&ctx.body);
    out.push_str("END\n");
    Ok(out)
}

fn float_literal(value: f32) -> String {
    if value.is_finite() {
        format!("{value:?}")
    } else {
        format!("0x{:08X}", value.to_bits())
    }
}

fn compare_mnemonic(compare: FpCompare) -> &'static str {
    match compare {
        FpCompare::Equal => "SEQ",
        FpCompare::NotEqual => "SNE",
        FpCompare::LessThan => "SLT",
        FpCompare::GreaterThan => "SGT",
        FpCompare::LessThanEqual => "SLE",
        FpCompare::GreaterThanEqual => "SGE",
    }
}

fn texture_target(texture_type: TextureType) -> &'static str {
    match texture_type {
        TextureType::Color1D => "1D",
        TextureType::Color2D => "2D",
        TextureType::Color3D => "3D",
        TextureType::ColorCube => "CUBE",
    }
}

struct GlasmContext<'a> {
    profile: &'a Profile,
    runtime_info: &'a RuntimeInfo,
    program: &'a Program,
    texture_base: u32,
    body: String,
    num_temporaries: usize,
}

impl GlasmContext<'_> {
    fn add(&mut self, text: impl AsRef<str>) {
        self.body.push_str(text.as_ref());
        self.body.push('\n');
    }

    /// Vertex programs cannot read `result.position`, so stores are mirrored into `POS`.
    fn shadows_position(&self) -> bool {
        self.program.stage == Stage::VertexB && self.program.info.loads_position
    }

    fn operand(&self, value: Value) -> Result<String> {
        Ok(match value {
            Value::Inst(id) => match self.program.inst(id).result_type() {
                Type::F32X4 => format!("R{}", id.0),
                _ => format!("R{}.x", id.0),
            },
            Value::U1(true) => "-1".to_owned(),
            Value::U1(false) => "0".to_owned(),
            Value::U32(value) => value.to_string(),
            Value::F32(value) => float_literal(value),
            other => {
                return Err(ShaderError::logic(format!("GLASM cannot express operand {other}")))
            }
        })
    }

    fn negated(&self, value: Value) -> Result<String> {
        Ok(match value {
            Value::F32(value) => float_literal(-value),
            Value::U32(value) => (value.wrapping_neg() as i32).to_string(),
            other => format!("-{}", self.operand(other)?),
        })
    }

    fn args<const N: usize>(&self, inst: &Inst) -> Result<[String; N]> {
        let mut args: [String; N] = std::array::from_fn(|_| String::new());
        for (index, slot) in args.iter_mut().enumerate() {
            *slot = self.operand(inst.arg(index))?;
        }
        Ok(args)
    }

    fn attribute(&self, attribute: Attribute) -> Result<String> {
        let component = SWIZZLE[attribute.component() as usize];
        let stage = self.program.stage;
        if attribute.is_position() {
            return match stage {
                Stage::Fragment => Ok(format!("fragment.position.{component}")),
                Stage::VertexB => Ok(format!("POS.{component}")),
                _ => Err(ShaderError::not_implemented(format!("position read in {stage}"))),
            };
        }
        if let Some(generic) = attribute.generic_index() {
            return Ok(match stage {
                Stage::Fragment if !self.runtime_info.previous_stage_stores_generic(generic) => {
                    if attribute.component() == 3 { "1.0" } else { "0.0" }.to_owned()
                }
                Stage::Fragment => format!("fragment.attrib[{generic}].{component}"),
                _ => format!("vertex.attrib[{generic}].{component}"),
            });
        }
        match attribute {
            Attribute::VERTEX_ID => Ok("vertex.id".to_owned()),
            Attribute::INSTANCE_ID => Ok("vertex.instance".to_owned()),
            other => Err(ShaderError::not_implemented(format!("attribute {other}"))),
        }
    }

    fn fp_compare(
        &mut self,
        ret: &str,
        inst: &Inst,
        compare: FpCompare,
        ordered: bool,
    ) -> Result<()> {
        let [a, b] = self.args::<2>(inst)?;
        let op = compare_mnemonic(compare);
        match lower_fp_compare(self.profile, compare, ordered, CompareCaps::TEXT) {
            CompareLowering::Native if ordered => {
                self.add(format!("{op}.F RC.x,{a},{b};SNE.S {ret},RC.x,0;"));
            }
            CompareLowering::Native => {
                let complement = match compare {
                    FpCompare::LessThan => "SGE",
                    FpCompare::GreaterThan => "SLE",
                    FpCompare::LessThanEqual => "SGT",
                    FpCompare::GreaterThanEqual => "SLT",
                    FpCompare::NotEqual => {
                        self.add(format!("SNE.F RC.x,{a},{b};SNE.S {ret},RC.x,0;"));
                        return Ok(());
                    }
                    FpCompare::Equal => {
                        self.add(format!(
                            "SEQ.F RC.x,{a},{b};SNE.F RC.y,{a},{a};SNE.F RC.z,{b},{b};\
                             OR.U RC.x,RC.x,RC.y;OR.U RC.x,RC.x,RC.z;SNE.S {ret},RC.x,0;"
                        ));
                        return Ok(());
                    }
                };
                self.add(format!("{complement}.F RC.x,{a},{b};SEQ.S {ret},RC.x,0;"));
            }
            CompareLowering::OrNan => {
                self.add(format!(
                    "{op}.F RC.x,{a},{b};SNE.F RC.y,{a},{a};SNE.F RC.z,{b},{b};\
                     OR.U RC.x,RC.x,RC.y;OR.U RC.x,RC.x,RC.z;SNE.S {ret},RC.x,0;"
                ));
            }
            CompareLowering::AndNotNan => {
                self.add(format!(
                    "{op}.F RC.x,{a},{b};SEQ.F RC.y,{a},{a};SEQ.F RC.z,{b},{b};\
                     AND.U RC.x,RC.x,RC.y;AND.U RC.x,RC.x,RC.z;SNE.S {ret},RC.x,0;"
                ));
            }
        }
        Ok(())
    }

    fn binary(&mut self, mnemonic: &str, ret: &str, inst: &Inst) -> Result<()> {
        let [a, b] = self.args::<2>(inst)?;
        self.add(format!("{mnemonic} {ret},{a},{b};"));
        Ok(())
    }

    fn unary(&mut self, mnemonic: &str, ret: &str, inst: &Inst) -> Result<()> {
        let a = self.operand(inst.arg(0))?;
        self.add(format!("{mnemonic} {ret},{a};"));
        Ok(())
    }

    fn precise_suffix(inst: &Inst) -> &'static str {
        if is_precise(inst) {
            ".PREC"
        } else {
            ""
        }
    }

    fn cbuf_load(&mut self, size: &str, ret: &str, inst: &Inst) -> Result<()> {
        let index = inst
            .arg(0)
            .as_u32()
            .ok_or_else(|| ShaderError::logic("constant buffer index is not an immediate"))?;
        let offset = self.operand(inst.arg(1))?;
        self.add(format!("LDC.{size} {ret},c{index}[{offset}];"));
        Ok(())
    }

    fn image_sample(&mut self, id: InstId, inst: &Inst) -> Result<()> {
        let info = inst
            .texture_info()
            .ok_or_else(|| ShaderError::logic("texture sample without texture info"))?;
        let [_, x, y, z] = self.args::<4>(inst)?;
        let ret = format!("R{}", id.0);
        let count = info.texture_type.coordinate_count();
        for (component, coord) in [x, y, z].iter().enumerate().take(count) {
            self.add(format!("MOV.F {ret}.{},{coord};", SWIZZLE[component]));
        }
        let binding = self.texture_base + info.descriptor_index;
        let target = texture_target(info.texture_type);
        if self.program.stage == Stage::Fragment {
            self.add(format!("TEX.F {ret},{ret},texture[{binding}],{target};"));
        } else {
            self.add(format!("MOV.F {ret}.w,0.0;TXL.F {ret},{ret},texture[{binding}],{target};"));
        }
        Ok(())
    }

    fn inst(&mut self, id: InstId) -> Result<()> {
        let program = self.program;
        let inst = program.inst(id);
        let ret = format!("R{}.x", id.0);
        let ret = ret.as_str();
        match inst.opcode {
            Opcode::Phi => {}
            Opcode::ConditionRef => self.unary("MOV.S", ret, inst)?,
            Opcode::UndefU1 | Opcode::UndefU32 | Opcode::UndefF32 => {
                self.add(format!("MOV.S {ret},0;"))
            }
            Opcode::DemoteToHelperInvocation => self.add("KIL TR.x;"),

            Opcode::GetCbufU8 => self.cbuf_load("U8", ret, inst)?,
            Opcode::GetCbufS8 => self.cbuf_load("S8", ret, inst)?,
            Opcode::GetCbufU16 => self.cbuf_load("U16", ret, inst)?,
            Opcode::GetCbufS16 => self.cbuf_load("S16", ret, inst)?,
            Opcode::GetCbufU32 => self.cbuf_load("U32", ret, inst)?,
            Opcode::GetCbufF32 => self.cbuf_load("F32", ret, inst)?,

            Opcode::GetAttribute => {
                let Value::Attribute(attribute) = inst.arg(0) else {
                    return Err(ShaderError::logic("attribute load without an attribute"));
                };
                let source = self.attribute(attribute)?;
                let integer =
                    attribute == Attribute::VERTEX_ID || attribute == Attribute::INSTANCE_ID;
                let suffix = if integer { "S" } else { "F" };
                self.add(format!("MOV.{suffix} {ret},{source};"));
            }
            Opcode::SetAttribute => {
                let Value::Attribute(attribute) = inst.arg(0) else {
                    return Err(ShaderError::logic("attribute store without an attribute"));
                };
                let value = self.operand(inst.arg(1))?;
                let component = SWIZZLE[attribute.component() as usize];
                if attribute.is_position() {
                    self.add(format!("MOV.F result.position.{component},{value};"));
                    if self.shadows_position() {
                        self.add(format!("MOV.F POS.{component},{value};"));
                    }
                } else if let Some(generic) = attribute.generic_index() {
                    self.add(format!("MOV.F result.attrib[{generic}].{component},{value};"));
                } else {
                    return Err(ShaderError::not_implemented(format!("store to {attribute}")));
                }
            }
            Opcode::SetFragColor => {
                let render_target = inst.arg(0).as_u32().unwrap_or(0);
                let component = SWIZZLE[(inst.arg(1).as_u32().unwrap_or(0) & 3) as usize];
                let value = self.operand(inst.arg(2))?;
                self.add(format!("MOV.F result.color[{render_target}].{component},{value};"));
            }
            Opcode::SetSampleMask => {
                let value = self.operand(inst.arg(0))?;
                self.add(format!("MOV.S result.samplemask.x,{value};"));
            }
            Opcode::SetFragDepth => {
                let value = self.operand(inst.arg(0))?;
                self.add(format!("MOV.F result.depth.z,{value};"));
            }

            Opcode::SelectU1 | Opcode::SelectU32 | Opcode::SelectF32 => {
                let [cond, a, b] = self.args::<3>(inst)?;
                self.add(format!("CMP.S {ret},{cond},{a},{b};"));
            }
            Opcode::BitCastU32F32 | Opcode::BitCastF32U32 => self.unary("MOV.U", ret, inst)?,

            Opcode::FPAbs32 => {
                let a = self.operand(inst.arg(0))?;
                self.add(format!("MOV.F {ret},|{a}|;"));
            }
            Opcode::FPAdd32 => {
                self.binary(&format!("ADD.F{}", Self::precise_suffix(inst)), ret, inst)?
            }
            Opcode::FPMul32 => {
                self.binary(&format!("MUL.F{}", Self::precise_suffix(inst)), ret, inst)?
            }
            Opcode::FPFma32 => {
                let [a, b, c] = self.args::<3>(inst)?;
                self.add(format!("MAD.F{} {ret},{a},{b},{c};", Self::precise_suffix(inst)));
            }
            Opcode::FPMax32 => self.binary("MAX.F", ret, inst)?,
            Opcode::FPMin32 => self.binary("MIN.F", ret, inst)?,
            Opcode::FPNeg32 => {
                let a = self.negated(inst.arg(0))?;
                self.add(format!("MOV.F {ret},{a};"));
            }
            Opcode::FPRecip32 => self.unary("RCP.F", ret, inst)?,
            Opcode::FPRecipSqrt32 => self.unary("RSQ.F", ret, inst)?,
            Opcode::FPSqrt => {
                let a = self.operand(inst.arg(0))?;
                self.add(format!("RSQ.F RC.x,{a};RCP.F {ret},RC.x;"));
            }
            Opcode::FPSin => self.unary("SIN.F", ret, inst)?,
            Opcode::FPCos => self.unary("COS.F", ret, inst)?,
            Opcode::FPExp2 => self.unary("EX2.F", ret, inst)?,
            Opcode::FPLog2 => self.unary("LG2.F", ret, inst)?,
            Opcode::FPSaturate32 => {
                let a = self.operand(inst.arg(0))?;
                match lower_clamp(self.profile) {
                    ClampLowering::Native => self.add(format!("MOV.F.SAT {ret},{a};")),
                    ClampLowering::MinMax => {
                        self.add(format!("MAX.F RC.x,{a},0.0;MIN.F {ret},RC.x,1.0;"))
                    }
                }
            }
            Opcode::FPIsNan32 => {
                let a = self.operand(inst.arg(0))?;
                self.add(format!("SNE.F RC.x,{a},{a};SNE.S {ret},RC.x,0;"));
            }
            opcode if opcode.fp_compare().is_some() => {
                let (compare, ordered) = opcode
                    .fp_compare()
                    .ok_or_else(|| ShaderError::logic("float compare without a relation"))?;
                self.fp_compare(ret, inst, compare, ordered)?;
            }

            Opcode::IAdd32 => self.binary("ADD.S", ret, inst)?,
            Opcode::INeg32 => {
                let a = self.negated(inst.arg(0))?;
                self.add(format!("MOV.S {ret},{a};"));
            }
            Opcode::ShiftLeftLogical32 => self.binary("SHL.U", ret, inst)?,
            Opcode::ShiftRightLogical32 => self.binary("SHR.U", ret, inst)?,
            Opcode::ShiftRightArithmetic32 => self.binary("SHR.S", ret, inst)?,
            Opcode::BitwiseAnd32 => self.binary("AND.U", ret, inst)?,
            Opcode::BitwiseOr32 => self.binary("OR.U", ret, inst)?,
            Opcode::BitwiseXor32 => self.binary("XOR.U", ret, inst)?,
            Opcode::BitwiseNot32 => self.unary("NOT.U", ret, inst)?,
            Opcode::IEqual => self.binary("SEQ.S", ret, inst)?,
            Opcode::INotEqual => self.binary("SNE.S", ret, inst)?,
            Opcode::SLessThan => self.binary("SLT.S", ret, inst)?,
            Opcode::ULessThan => self.binary("SLT.U", ret, inst)?,
            Opcode::SLessThanEqual => self.binary("SLE.S", ret, inst)?,
            Opcode::ULessThanEqual => self.binary("SLE.U", ret, inst)?,
            Opcode::SGreaterThan => self.binary("SGT.S", ret, inst)?,
            Opcode::UGreaterThan => self.binary("SGT.U", ret, inst)?,
            Opcode::SGreaterThanEqual => self.binary("SGE.S", ret, inst)?,
            Opcode::UGreaterThanEqual => self.binary("SGE.U", ret, inst)?,

            Opcode::LogicalOr => self.binary("OR.S", ret, inst)?,
            Opcode::LogicalAnd => self.binary("AND.S", ret, inst)?,
            Opcode::LogicalXor => self.binary("XOR.S", ret, inst)?,
            Opcode::LogicalNot => {
                let a = self.operand(inst.arg(0))?;
                self.add(format!("SEQ.S {ret},{a},0;"));
            }

            Opcode::ConvertF32S32 => self.unary("I2F.S", ret, inst)?,
            Opcode::ConvertF32U32 => self.unary("I2F.U", ret, inst)?,
            Opcode::ConvertS32F32 => self.unary("TRUNC.S", ret, inst)?,
            Opcode::ConvertU32F32 => self.unary("TRUNC.U", ret, inst)?,

            Opcode::ImageSample => self.image_sample(id, inst)?,
            Opcode::CompositeExtractF32x4 => {
                let Value::Inst(vector) = inst.arg(0) else {
                    return Err(ShaderError::logic("composite extract from an immediate"));
                };
                let component = inst
                    .arg(1)
                    .as_u32()
                    .filter(|&index| index < 4)
                    .ok_or_else(|| ShaderError::not_implemented("dynamic vector component"))?;
                self.add(format!("MOV.F {ret},R{}.{};", vector.0, SWIZZLE[component as usize]));
            }

            opcode => return Err(ShaderError::logic(format!("{opcode} reached the GLASM backend"))),
        }
        Ok(())
    }

    fn destination(&self, phi: InstId) -> String {
        match self.program.inst(phi).result_type() {
            Type::F32X4 => format!("R{}", phi.0),
            _ => format!("R{}.x", phi.0),
        }
    }
}

impl StructuredEmitter for GlasmContext<'_> {
    fn block(&mut self, block: BlockId) -> Result<()> {
        for &id in &self.program.block(block).insts {
            self.inst(id)?;
        }
        Ok(())
    }

    fn phi_moves(&mut self, moves: &[PhiMove], through_temporaries: bool) -> Result<()> {
        if !through_temporaries {
            for &(phi, value) in moves {
                let value = self.operand(value)?;
                let dest = self.destination(phi);
                self.add(format!("MOV.U {dest},{value};"));
            }
            return Ok(());
        }
        self.num_temporaries = self.num_temporaries.max(moves.len());
        for (index, &(_, value)) in moves.iter().enumerate() {
            let value = self.operand(value)?;
            self.add(format!("MOV.U T{index},{value};"));
        }
        for (index, &(phi, _)) in moves.iter().enumerate() {
            let dest = self.destination(phi);
            self.add(format!("MOV.U {dest},T{index};"));
        }
        Ok(())
    }

    fn open_if(&mut self, cond: Value) -> Result<()> {
        let cond = self.operand(cond)?;
        self.add(format!("MOV.S.CC RC.x,{cond};"));
        self.add("IF NE.x;");
        Ok(())
    }

    fn close_if(&mut self) -> Result<()> {
        self.add("ENDIF;");
        Ok(())
    }

    fn open_loop(&mut self) -> Result<()> {
        self.add("REP.S;");
        Ok(())
    }

    fn exit_loop_unless(&mut self, cond: Value) -> Result<()> {
        let cond = self.operand(cond)?;
        self.add(format!("MOV.S.CC RC.x,{cond};"));
        self.add("BRK (EQ.x);");
        Ok(())
    }

    fn close_loop(&mut self) -> Result<()> {
        self.add("ENDREP;");
        Ok(())
    }

    fn break_if(&mut self, cond: Value, moves: &[PhiMove]) -> Result<()> {
        let cond = self.operand(cond)?;
        self.add(format!("MOV.S.CC RC.x,{cond};"));
        if moves.is_empty() {
            self.add("BRK (NE.x);");
            return Ok(());
        }
        self.add("IF NE.x;");
        self.phi_moves(moves, false)?;
        self.add("BRK;");
        self.add("ENDIF;");
        Ok(())
    }

    fn ret(&mut self) -> Result<()> {
        self.add("RET;");
        Ok(())
    }

    fn unreachable(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AbstractSyntaxNode, FpControl, IrEmitter};

    #[test]
    fn program_header_follows_stage() {
        let mut program = Program::new(Stage::Compute);
        let block = program.new_block();
        program.block_order = vec![block];
        program.syntax_list = vec![AbstractSyntaxNode::Block(block), AbstractSyntaxNode::Return];
        program.workgroup_size = [8, 4, 1];
        let runtime_info = RuntimeInfo::default();
        let text =
            emit_glasm(&Profile::default(), &runtime_info, &program, &mut Bindings::new()).unwrap();
        assert!(text.starts_with("!!NVcp5.0\n"), "{text}");
        assert!(text.contains("GROUP_SIZE 8 4 1;"), "{text}");
        assert!(text.ends_with("RET;\nEND\n"), "{text}");
    }

    #[test]
    fn immediates_are_negated_in_place() {
        let mut program = Program::new(Stage::Fragment);
        let block = program.new_block();
        let mut ir = IrEmitter::new(&mut program, block);
        let negated = ir.fp_neg(Value::F32(-2.5));
        let sum = ir.fp_add(negated, Value::F32(1.0), FpControl::default());
        ir.set_frag_depth(sum);
        program.block_order = vec![block];
        program.syntax_list = vec![AbstractSyntaxNode::Block(block), AbstractSyntaxNode::Return];
        let runtime_info = RuntimeInfo::default();
        let text =
            emit_glasm(&Profile::default(), &runtime_info, &program, &mut Bindings::new()).unwrap();
        assert!(text.contains("MOV.F R0.x,2.5;"), "{text}");
        assert!(text.contains("MOV.F result.depth.z,R1.x;"), "{text}");
    }
}
