use super::modifiers::{FpControl, InstFlags, TextureInstInfo};
use super::opcodes::{FpCompare, Opcode};
use super::program::Program;
use super::types::Type;
use super::value::{Attribute, BlockId, Pred, Reg, Value};

/// Integer relation tested by [`IrEmitter::icompare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntCompare {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
}

/// Appends instructions to the end of one block.
pub struct IrEmitter<'a> {
    pub program: &'a mut Program,
    pub block: BlockId,
}

impl<'a> IrEmitter<'a> {
    pub fn new(program: &'a mut Program, block: BlockId) -> Self {
        Self { program, block }
    }

    fn inst(&mut self, opcode: Opcode, args: &[Value]) -> Value {
        self.inst_flags(opcode, args, InstFlags::None)
    }

    fn inst_flags(&mut self, opcode: Opcode, args: &[Value], flags: InstFlags) -> Value {
        debug_assert!(
            args.iter()
                .zip(opcode.arg_types())
                .all(|(arg, &ty)| Type::are_compatible(self.program.value_type(*arg), ty)
                    || self.program.value_type(*arg).intersects(ty)),
            "argument type mismatch for {opcode}"
        );
        Value::Inst(self.program.append_inst(self.block, opcode, args, flags))
    }

    pub fn undef(&mut self, ty: Type) -> Value {
        match Opcode::undef_for(ty) {
            Some(opcode) => self.inst(opcode, &[]),
            None => Value::Void,
        }
    }

    pub fn get_reg(&mut self, reg: Reg) -> Value {
        if reg == Reg::RZ {
            return Value::U32(0);
        }
        self.inst(Opcode::GetRegister, &[Value::Reg(reg)])
    }

    pub fn set_reg(&mut self, reg: Reg, value: Value) {
        if reg == Reg::RZ {
            return;
        }
        self.inst(Opcode::SetRegister, &[Value::Reg(reg), value]);
    }

    pub fn get_pred(&mut self, pred: Pred, negated: bool) -> Value {
        if pred == Pred::PT {
            return Value::U1(!negated);
        }
        let value = self.inst(Opcode::GetPred, &[Value::Pred(pred)]);
        if negated {
            self.logical_not(value)
        } else {
            value
        }
    }

    pub fn set_pred(&mut self, pred: Pred, value: Value) {
        if pred == Pred::PT {
            return;
        }
        self.inst(Opcode::SetPred, &[Value::Pred(pred), value]);
    }

    pub fn get_goto_variable(&mut self, id: u32) -> Value {
        self.inst(Opcode::GetGotoVariable, &[Value::U32(id)])
    }

    pub fn set_goto_variable(&mut self, id: u32, value: Value) {
        self.inst(Opcode::SetGotoVariable, &[Value::U32(id), value]);
    }

    pub fn condition_ref(&mut self, cond: Value) -> Value {
        self.inst(Opcode::ConditionRef, &[cond])
    }

    /// Loads `bit_width` bits (8, 16 or 32) at byte `offset` of constant buffer `index`.
    pub fn get_cbuf(&mut self, index: u32, offset: Value, bit_width: u32, signed: bool) -> Value {
        let opcode = match (bit_width, signed) {
            (8, false) => Opcode::GetCbufU8,
            (8, true) => Opcode::GetCbufS8,
            (16, false) => Opcode::GetCbufU16,
            (16, true) => Opcode::GetCbufS16,
            _ => Opcode::GetCbufU32,
        };
        self.inst(opcode, &[Value::U32(index), offset])
    }

    pub fn get_cbuf_f32(&mut self, index: u32, offset: Value) -> Value {
        self.inst(Opcode::GetCbufF32, &[Value::U32(index), offset])
    }

    pub fn get_attribute(&mut self, attribute: Attribute) -> Value {
        self.inst(Opcode::GetAttribute, &[Value::Attribute(attribute)])
    }

    pub fn set_attribute(&mut self, attribute: Attribute, value: Value) {
        self.inst(Opcode::SetAttribute, &[Value::Attribute(attribute), value]);
    }

    pub fn set_frag_color(&mut self, render_target: u32, component: u32, value: Value) {
        self.inst(
            Opcode::SetFragColor,
            &[Value::U32(render_target), Value::U32(component), value],
        );
    }

    pub fn set_sample_mask(&mut self, value: Value) {
        self.inst(Opcode::SetSampleMask, &[value]);
    }

    pub fn set_frag_depth(&mut self, value: Value) {
        self.inst(Opcode::SetFragDepth, &[value]);
    }

    pub fn demote_to_helper_invocation(&mut self) {
        self.inst(Opcode::DemoteToHelperInvocation, &[]);
    }

    pub fn select(&mut self, cond: Value, true_value: Value, false_value: Value) -> Value {
        let opcode = match self.program.value_type(true_value) {
            Type::U1 => Opcode::SelectU1,
            Type::F32 => Opcode::SelectF32,
            _ => Opcode::SelectU32,
        };
        self.inst(opcode, &[cond, true_value, false_value])
    }

    pub fn bit_cast_u32(&mut self, value: Value) -> Value {
        self.inst(Opcode::BitCastU32F32, &[value])
    }

    pub fn bit_cast_f32(&mut self, value: Value) -> Value {
        self.inst(Opcode::BitCastF32U32, &[value])
    }

    pub fn fp_add(&mut self, a: Value, b: Value, control: FpControl) -> Value {
        self.inst_flags(Opcode::FPAdd32, &[a, b], InstFlags::Fp(control))
    }

    pub fn fp_mul(&mut self, a: Value, b: Value, control: FpControl) -> Value {
        self.inst_flags(Opcode::FPMul32, &[a, b], InstFlags::Fp(control))
    }

    pub fn fp_fma(&mut self, a: Value, b: Value, c: Value, control: FpControl) -> Value {
        self.inst_flags(Opcode::FPFma32, &[a, b, c], InstFlags::Fp(control))
    }

    pub fn fp_max(&mut self, a: Value, b: Value, control: FpControl) -> Value {
        self.inst_flags(Opcode::FPMax32, &[a, b], InstFlags::Fp(control))
    }

    pub fn fp_min(&mut self, a: Value, b: Value, control: FpControl) -> Value {
        self.inst_flags(Opcode::FPMin32, &[a, b], InstFlags::Fp(control))
    }

    pub fn fp_neg(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPNeg32, &[value])
    }

    pub fn fp_abs(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPAbs32, &[value])
    }

    /// Applies the usual source modifiers: absolute value first, then negation.
    pub fn fp_abs_neg(&mut self, value: Value, abs: bool, neg: bool) -> Value {
        let value = if abs { self.fp_abs(value) } else { value };
        if neg {
            self.fp_neg(value)
        } else {
            value
        }
    }

    pub fn fp_saturate(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPSaturate32, &[value])
    }

    pub fn fp_recip(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPRecip32, &[value])
    }

    pub fn fp_recip_sqrt(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPRecipSqrt32, &[value])
    }

    pub fn fp_sqrt(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPSqrt, &[value])
    }

    pub fn fp_sin(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPSin, &[value])
    }

    pub fn fp_cos(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPCos, &[value])
    }

    pub fn fp_exp2(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPExp2, &[value])
    }

    pub fn fp_log2(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPLog2, &[value])
    }

    pub fn fp_is_nan(&mut self, value: Value) -> Value {
        self.inst(Opcode::FPIsNan32, &[value])
    }

    pub fn fp_compare(&mut self, compare: FpCompare, ordered: bool, a: Value, b: Value) -> Value {
        self.inst(compare.opcode(ordered), &[a, b])
    }

    pub fn iadd(&mut self, a: Value, b: Value) -> Value {
        self.inst(Opcode::IAdd32, &[a, b])
    }

    pub fn ineg(&mut self, value: Value) -> Value {
        self.inst(Opcode::INeg32, &[value])
    }

    pub fn shift_left_logical(&mut self, base: Value, shift: Value) -> Value {
        self.inst(Opcode::ShiftLeftLogical32, &[base, shift])
    }

    pub fn shift_right_logical(&mut self, base: Value, shift: Value) -> Value {
        self.inst(Opcode::ShiftRightLogical32, &[base, shift])
    }

    pub fn shift_right_arithmetic(&mut self, base: Value, shift: Value) -> Value {
        self.inst(Opcode::ShiftRightArithmetic32, &[base, shift])
    }

    pub fn bitwise_and(&mut self, a: Value, b: Value) -> Value {
        self.inst(Opcode::BitwiseAnd32, &[a, b])
    }

    pub fn bitwise_or(&mut self, a: Value, b: Value) -> Value {
        self.inst(Opcode::BitwiseOr32, &[a, b])
    }

    pub fn bitwise_xor(&mut self, a: Value, b: Value) -> Value {
        self.inst(Opcode::BitwiseXor32, &[a, b])
    }

    pub fn bitwise_not(&mut self, value: Value) -> Value {
        self.inst(Opcode::BitwiseNot32, &[value])
    }

    pub fn icompare(&mut self, compare: IntCompare, signed: bool, a: Value, b: Value) -> Value {
        let opcode = match (compare, signed) {
            (IntCompare::Equal, _) => Opcode::IEqual,
            (IntCompare::NotEqual, _) => Opcode::INotEqual,
            (IntCompare::LessThan, true) => Opcode::SLessThan,
            (IntCompare::LessThan, false) => Opcode::ULessThan,
            (IntCompare::LessThanEqual, true) => Opcode::SLessThanEqual,
            (IntCompare::LessThanEqual, false) => Opcode::ULessThanEqual,
            (IntCompare::GreaterThan, true) => Opcode::SGreaterThan,
            (IntCompare::GreaterThan, false) => Opcode::UGreaterThan,
            (IntCompare::GreaterThanEqual, true) => Opcode::SGreaterThanEqual,
            (IntCompare::GreaterThanEqual, false) => Opcode::UGreaterThanEqual,
        };
        self.inst(opcode, &[a, b])
    }

    pub fn logical_or(&mut self, a: Value, b: Value) -> Value {
        self.inst(Opcode::LogicalOr, &[a, b])
    }

    pub fn logical_and(&mut self, a: Value, b: Value) -> Value {
        self.inst(Opcode::LogicalAnd, &[a, b])
    }

    pub fn logical_xor(&mut self, a: Value, b: Value) -> Value {
        self.inst(Opcode::LogicalXor, &[a, b])
    }

    pub fn logical_not(&mut self, value: Value) -> Value {
        self.inst(Opcode::LogicalNot, &[value])
    }

    pub fn convert_int_to_f32(&mut self, value: Value, signed: bool) -> Value {
        let opcode = if signed {
            Opcode::ConvertF32S32
        } else {
            Opcode::ConvertF32U32
        };
        self.inst(opcode, &[value])
    }

    pub fn convert_f32_to_int(&mut self, value: Value, signed: bool) -> Value {
        let opcode = if signed {
            Opcode::ConvertS32F32
        } else {
            Opcode::ConvertU32F32
        };
        self.inst(opcode, &[value])
    }

    pub fn image_sample(&mut self, info: TextureInstInfo, coords: [Value; 3]) -> Value {
        self.inst_flags(
            Opcode::ImageSample,
            &[Value::U32(info.descriptor_index), coords[0], coords[1], coords[2]],
            InstFlags::Texture(info),
        )
    }

    pub fn composite_extract(&mut self, vector: Value, index: u32) -> Value {
        self.inst(Opcode::CompositeExtractF32x4, &[vector, Value::U32(index)])
    }
}
