//! Per-instruction translation into IR.
//!
//! Control flow instructions emit nothing here; their effect is already encoded in the block
//! structure. Every other recognised opcode reads its operands through the guest register and
//! predicate accessors, which SSA construction later replaces with values.

use crate::environment::{Environment, NUM_RENDER_TARGETS};
use crate::error::{Result, ShaderError};
use crate::info::TextureDescriptor;
use crate::ir::{
    Attribute, BlockId, FpCompare, FpControl, IntCompare, IrEmitter, Pred, Program, Reg,
    TextureInstInfo, Value,
};
use crate::stage::Stage;

use super::instruction::{decode, Instruction, Opcode};
use super::location::Location;

/// Translates the instructions in `[begin, end)` into `block`.
pub(crate) fn translate(
    env: &mut dyn Environment,
    program: &mut Program,
    block: BlockId,
    begin: Location,
    end: Location,
) -> Result<()> {
    let mut pc = begin;
    while pc < end {
        let raw = env.read_instruction(pc.offset());
        let inst = Instruction(raw);
        let opcode = decode(pc.offset(), raw)?;
        if !inst.is_never_executed() {
            let mut visitor = TranslatorVisitor {
                env: &mut *env,
                ir: IrEmitter::new(&mut *program, block),
                pc,
                inst,
            };
            visitor.visit(opcode)?;
        }
        pc = pc.next();
    }
    Ok(())
}

/// Where the second operand of an ALU instruction comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SrcB {
    Reg,
    Cbuf,
    Imm,
}

struct TranslatorVisitor<'a, 'e> {
    env: &'e mut dyn Environment,
    ir: IrEmitter<'a>,
    pc: Location,
    inst: Instruction,
}

impl TranslatorVisitor<'_, '_> {
    fn visit(&mut self, opcode: Opcode) -> Result<()> {
        match opcode {
            Opcode::Bra
            | Opcode::Brk
            | Opcode::Cal
            | Opcode::Kil
            | Opcode::Nop
            | Opcode::Pbk
            | Opcode::Ret
            | Opcode::Ssy
            | Opcode::Sync => Ok(()),
            Opcode::Exit => self.exit(),

            Opcode::FaddReg => self.fadd(SrcB::Reg),
            Opcode::FaddCbuf => self.fadd(SrcB::Cbuf),
            Opcode::FaddImm => self.fadd(SrcB::Imm),
            Opcode::Fadd32i => self.fadd32i(),
            Opcode::FmulReg => self.fmul(SrcB::Reg),
            Opcode::FmulCbuf => self.fmul(SrcB::Cbuf),
            Opcode::FmulImm => self.fmul(SrcB::Imm),
            Opcode::FfmaReg => self.ffma(SrcB::Reg),
            Opcode::FfmaCbuf => self.ffma(SrcB::Cbuf),
            Opcode::FfmaImm => self.ffma(SrcB::Imm),
            Opcode::FmnmxReg => self.fmnmx(SrcB::Reg),
            Opcode::FmnmxCbuf => self.fmnmx(SrcB::Cbuf),
            Opcode::FmnmxImm => self.fmnmx(SrcB::Imm),
            Opcode::Mufu => self.mufu(),
            Opcode::FsetpReg => self.fsetp(SrcB::Reg),
            Opcode::FsetpCbuf => self.fsetp(SrcB::Cbuf),
            Opcode::FsetpImm => self.fsetp(SrcB::Imm),

            Opcode::IaddReg => self.iadd(SrcB::Reg),
            Opcode::IaddCbuf => self.iadd(SrcB::Cbuf),
            Opcode::IaddImm => self.iadd(SrcB::Imm),
            Opcode::IsetpReg => self.isetp(SrcB::Reg),
            Opcode::IsetpCbuf => self.isetp(SrcB::Cbuf),
            Opcode::IsetpImm => self.isetp(SrcB::Imm),
            Opcode::ShlReg => self.shl(SrcB::Reg),
            Opcode::ShlImm => self.shl(SrcB::Imm),
            Opcode::ShrReg => self.shr(SrcB::Reg),
            Opcode::ShrImm => self.shr(SrcB::Imm),
            Opcode::Lop32i => self.lop32i(),

            Opcode::MovReg => {
                let value = self.x(self.inst.src_b_reg());
                self.set_x(self.inst.dest_reg(), value);
                Ok(())
            }
            Opcode::MovCbuf | Opcode::MovImm => {
                let form = if opcode == Opcode::MovCbuf { SrcB::Cbuf } else { SrcB::Imm };
                let value = self.src_b_u32(form);
                self.set_x(self.inst.dest_reg(), value);
                Ok(())
            }
            Opcode::Mov32i => {
                let value = Value::U32(self.inst.imm32());
                self.set_x(self.inst.dest_reg(), value);
                Ok(())
            }
            Opcode::SelReg => {
                let pred = self.pred_operand();
                let a = self.x(self.inst.src_a_reg());
                let b = self.x(self.inst.src_b_reg());
                let value = self.ir.select(pred, a, b);
                self.set_x(self.inst.dest_reg(), value);
                Ok(())
            }
            Opcode::I2fReg => {
                let value = self.x(self.inst.src_b_reg());
                let result = self.ir.convert_int_to_f32(value, self.inst.bit(13));
                self.set_f(self.inst.dest_reg(), result);
                Ok(())
            }
            Opcode::F2iReg => {
                let value = self.f(self.inst.src_b_reg());
                let result = self.ir.convert_f32_to_int(value, self.inst.bit(12));
                self.set_x(self.inst.dest_reg(), result);
                Ok(())
            }

            Opcode::Ldc => self.ldc(),
            Opcode::Ald => self.ald(),
            Opcode::Ast => self.ast(),
            Opcode::Ipa => self.ipa(),
            Opcode::Tex => self.tex(),
        }
    }

    fn not_implemented(&self, what: &str) -> ShaderError {
        ShaderError::not_implemented(format!("{what} at {}", self.pc))
    }

    fn invalid_encoding(&self) -> ShaderError {
        ShaderError::InvalidEncoding {
            address: self.pc.offset(),
            raw: self.inst.0,
        }
    }

    fn reg_offset(&self, reg: Reg, n: u32) -> Result<Reg> {
        reg.offset(n).ok_or_else(|| self.invalid_encoding())
    }

    fn x(&mut self, reg: Reg) -> Value {
        self.ir.get_reg(reg)
    }

    fn f(&mut self, reg: Reg) -> Value {
        let value = self.ir.get_reg(reg);
        self.ir.bit_cast_f32(value)
    }

    fn set_x(&mut self, reg: Reg, value: Value) {
        self.ir.set_reg(reg, value);
    }

    fn set_f(&mut self, reg: Reg, value: Value) {
        let value = self.ir.bit_cast_u32(value);
        self.ir.set_reg(reg, value);
    }

    fn src_b_u32(&mut self, form: SrcB) -> Value {
        match form {
            SrcB::Reg => self.x(self.inst.src_b_reg()),
            SrcB::Cbuf => {
                let offset = Value::U32(self.inst.cbuf_offset());
                self.ir.get_cbuf(self.inst.cbuf_index(), offset, 32, false)
            }
            SrcB::Imm => Value::U32(self.inst.imm20_u32()),
        }
    }

    fn src_b_f32(&mut self, form: SrcB) -> Value {
        match form {
            SrcB::Reg => self.f(self.inst.src_b_reg()),
            SrcB::Cbuf => {
                let offset = Value::U32(self.inst.cbuf_offset());
                self.ir.get_cbuf_f32(self.inst.cbuf_index(), offset)
            }
            SrcB::Imm => Value::F32(self.inst.imm20_f32()),
        }
    }

    /// Predicate operand at 39..42 with its negation bit at 42.
    fn pred_operand(&mut self) -> Value {
        let pred = Pred(self.inst.bits(39, 3) as u8);
        self.ir.get_pred(pred, self.inst.bit(42))
    }

    fn guest_fp_control() -> FpControl {
        FpControl {
            no_contraction: true,
            ..FpControl::default()
        }
    }

    fn saturate_if(&mut self, value: Value, sat: bool) -> Value {
        if sat {
            self.ir.fp_saturate(value)
        } else {
            value
        }
    }

    fn fadd(&mut self, form: SrcB) -> Result<()> {
        let a = self.f(self.inst.src_a_reg());
        let a = self.ir.fp_abs_neg(a, self.inst.bit(46), self.inst.bit(48));
        let b = self.src_b_f32(form);
        let b = self.ir.fp_abs_neg(b, self.inst.bit(49), self.inst.bit(45));
        let sum = self.ir.fp_add(a, b, Self::guest_fp_control());
        let result = self.saturate_if(sum, self.inst.bit(50));
        self.set_f(self.inst.dest_reg(), result);
        Ok(())
    }

    fn fadd32i(&mut self) -> Result<()> {
        let a = self.f(self.inst.src_a_reg());
        let a = self.ir.fp_abs_neg(a, self.inst.bit(54), self.inst.bit(56));
        let b = Value::F32(f32::from_bits(self.inst.imm32()));
        let b = self.ir.fp_abs_neg(b, self.inst.bit(57), self.inst.bit(53));
        let sum = self.ir.fp_add(a, b, Self::guest_fp_control());
        self.set_f(self.inst.dest_reg(), sum);
        Ok(())
    }

    fn fmul(&mut self, form: SrcB) -> Result<()> {
        let a = self.f(self.inst.src_a_reg());
        let b = self.src_b_f32(form);
        let b = self.ir.fp_abs_neg(b, false, self.inst.bit(48));
        let product = self.ir.fp_mul(a, b, Self::guest_fp_control());
        let result = self.saturate_if(product, self.inst.bit(50));
        self.set_f(self.inst.dest_reg(), result);
        Ok(())
    }

    fn ffma(&mut self, form: SrcB) -> Result<()> {
        let a = self.f(self.inst.src_a_reg());
        let b = self.src_b_f32(form);
        let b = self.ir.fp_abs_neg(b, false, self.inst.bit(48));
        let c = self.f(self.inst.src_c_reg());
        let c = self.ir.fp_abs_neg(c, false, self.inst.bit(49));
        let fma = self.ir.fp_fma(a, b, c, Self::guest_fp_control());
        let result = self.saturate_if(fma, self.inst.bit(50));
        self.set_f(self.inst.dest_reg(), result);
        Ok(())
    }

    fn fmnmx(&mut self, form: SrcB) -> Result<()> {
        let a = self.f(self.inst.src_a_reg());
        let a = self.ir.fp_abs_neg(a, self.inst.bit(46), self.inst.bit(48));
        let b = self.src_b_f32(form);
        let b = self.ir.fp_abs_neg(b, self.inst.bit(49), self.inst.bit(45));
        let pred = self.pred_operand();
        let min = self.ir.fp_min(a, b, FpControl::default());
        let max = self.ir.fp_max(a, b, FpControl::default());
        let result = self.ir.select(pred, min, max);
        self.set_f(self.inst.dest_reg(), result);
        Ok(())
    }

    fn mufu(&mut self) -> Result<()> {
        let value = self.f(self.inst.src_a_reg());
        let value = self.ir.fp_abs_neg(value, self.inst.bit(46), self.inst.bit(48));
        let result = match self.inst.bits(20, 4) {
            0 => self.ir.fp_cos(value),
            1 => self.ir.fp_sin(value),
            2 => self.ir.fp_exp2(value),
            3 => self.ir.fp_log2(value),
            4 => self.ir.fp_recip(value),
            5 => self.ir.fp_recip_sqrt(value),
            8 => self.ir.fp_sqrt(value),
            op => return Err(self.not_implemented(&format!("MUFU operation {op}"))),
        };
        let result = self.saturate_if(result, self.inst.bit(50));
        self.set_f(self.inst.dest_reg(), result);
        Ok(())
    }

    fn fp_compare(&mut self, code: u64, a: Value, b: Value) -> Value {
        let ordered = |compare| (compare, true);
        let unordered = |compare| (compare, false);
        let (compare, is_ordered) = match code {
            0 => return Value::U1(false),
            1 => ordered(FpCompare::LessThan),
            2 => ordered(FpCompare::Equal),
            3 => ordered(FpCompare::LessThanEqual),
            4 => ordered(FpCompare::GreaterThan),
            5 => ordered(FpCompare::NotEqual),
            6 => ordered(FpCompare::GreaterThanEqual),
            7 => {
                let a_nan = self.ir.fp_is_nan(a);
                let b_nan = self.ir.fp_is_nan(b);
                let a_num = self.ir.logical_not(a_nan);
                let b_num = self.ir.logical_not(b_nan);
                return self.ir.logical_and(a_num, b_num);
            }
            8 => {
                let a_nan = self.ir.fp_is_nan(a);
                let b_nan = self.ir.fp_is_nan(b);
                return self.ir.logical_or(a_nan, b_nan);
            }
            9 => unordered(FpCompare::LessThan),
            10 => unordered(FpCompare::Equal),
            11 => unordered(FpCompare::LessThanEqual),
            12 => unordered(FpCompare::GreaterThan),
            13 => unordered(FpCompare::NotEqual),
            14 => unordered(FpCompare::GreaterThanEqual),
            _ => return Value::U1(true),
        };
        self.ir.fp_compare(compare, is_ordered, a, b)
    }

    fn int_compare(&mut self, code: u64, signed: bool, a: Value, b: Value) -> Value {
        let compare = match code {
            0 => return Value::U1(false),
            1 => IntCompare::LessThan,
            2 => IntCompare::Equal,
            3 => IntCompare::LessThanEqual,
            4 => IntCompare::GreaterThan,
            5 => IntCompare::NotEqual,
            6 => IntCompare::GreaterThanEqual,
            _ => return Value::U1(true),
        };
        self.ir.icompare(compare, signed, a, b)
    }

    fn boolean_op(&mut self, a: Value, b: Value) -> Result<Value> {
        Ok(match self.inst.bits(45, 2) {
            0 => self.ir.logical_and(a, b),
            1 => self.ir.logical_or(a, b),
            2 => self.ir.logical_xor(a, b),
            _ => return Err(self.invalid_encoding()),
        })
    }

    /// Writes `cmp BOP pred` to the first destination and `!cmp BOP pred` to the second.
    fn set_compare_preds(&mut self, cmp: Value) -> Result<()> {
        let bop_pred = self.pred_operand();
        let first = self.boolean_op(cmp, bop_pred)?;
        let not_cmp = self.ir.logical_not(cmp);
        let second = self.boolean_op(not_cmp, bop_pred)?;
        self.ir.set_pred(Pred(self.inst.bits(3, 3) as u8), first);
        self.ir.set_pred(Pred(self.inst.bits(0, 3) as u8), second);
        Ok(())
    }

    fn fsetp(&mut self, form: SrcB) -> Result<()> {
        let a = self.f(self.inst.src_a_reg());
        let a = self.ir.fp_abs_neg(a, self.inst.bit(7), self.inst.bit(43));
        let b = self.src_b_f32(form);
        let b = self.ir.fp_abs_neg(b, self.inst.bit(44), self.inst.bit(6));
        let cmp = self.fp_compare(self.inst.bits(48, 4), a, b);
        self.set_compare_preds(cmp)
    }

    fn isetp(&mut self, form: SrcB) -> Result<()> {
        let a = self.x(self.inst.src_a_reg());
        let b = self.src_b_u32(form);
        let cmp = self.int_compare(self.inst.bits(49, 3), self.inst.bit(48), a, b);
        self.set_compare_preds(cmp)
    }

    fn iadd(&mut self, form: SrcB) -> Result<()> {
        let neg_a = self.inst.bit(49);
        let neg_b = self.inst.bit(48);
        if neg_a && neg_b {
            return Err(self.not_implemented("IADD.PO"));
        }
        if self.inst.bit(50) {
            return Err(self.not_implemented("IADD.SAT"));
        }
        let a = self.x(self.inst.src_a_reg());
        let a = if neg_a { self.ir.ineg(a) } else { a };
        let b = self.src_b_u32(form);
        let b = if neg_b { self.ir.ineg(b) } else { b };
        let sum = self.ir.iadd(a, b);
        self.set_x(self.inst.dest_reg(), sum);
        Ok(())
    }

    /// Shifts by 32 or more produce `oversized` instead of the host's undefined result.
    fn clamped_shift(
        &mut self,
        base: Value,
        shift: Value,
        oversized: impl FnOnce(&mut IrEmitter<'_>) -> Value,
        op: impl Fn(&mut IrEmitter<'_>, Value, Value) -> Value,
    ) -> Value {
        match shift.as_u32() {
            Some(amount) if amount < 32 => op(&mut self.ir, base, shift),
            Some(_) => oversized(&mut self.ir),
            None => {
                let shifted = op(&mut self.ir, base, shift);
                let fallback = oversized(&mut self.ir);
                let too_far =
                    self.ir.icompare(IntCompare::GreaterThanEqual, false, shift, Value::U32(32));
                self.ir.select(too_far, fallback, shifted)
            }
        }
    }

    fn shl(&mut self, form: SrcB) -> Result<()> {
        let base = self.x(self.inst.src_a_reg());
        let shift = self.src_b_u32(form);
        let result = self.clamped_shift(base, shift, |_| Value::U32(0), |ir, base, shift| {
            ir.shift_left_logical(base, shift)
        });
        self.set_x(self.inst.dest_reg(), result);
        Ok(())
    }

    fn shr(&mut self, form: SrcB) -> Result<()> {
        let base = self.x(self.inst.src_a_reg());
        let shift = self.src_b_u32(form);
        let result = if self.inst.bit(48) {
            self.clamped_shift(
                base,
                shift,
                |ir| ir.shift_right_arithmetic(base, Value::U32(31)),
                |ir, base, shift| ir.shift_right_arithmetic(base, shift),
            )
        } else {
            self.clamped_shift(base, shift, |_| Value::U32(0), |ir, base, shift| {
                ir.shift_right_logical(base, shift)
            })
        };
        self.set_x(self.inst.dest_reg(), result);
        Ok(())
    }

    fn lop32i(&mut self) -> Result<()> {
        let a = self.x(self.inst.src_a_reg());
        let a = if self.inst.bit(55) { self.ir.bitwise_not(a) } else { a };
        let imm = self.inst.imm32();
        let b = Value::U32(if self.inst.bit(56) { !imm } else { imm });
        let result = match self.inst.bits(53, 2) {
            0 => self.ir.bitwise_and(a, b),
            1 => self.ir.bitwise_or(a, b),
            2 => self.ir.bitwise_xor(a, b),
            _ => b,
        };
        self.set_x(self.inst.dest_reg(), result);
        Ok(())
    }

    fn ldc(&mut self) -> Result<()> {
        if self.inst.bits(44, 2) != 0 {
            return Err(self.not_implemented("LDC addressing mode"));
        }
        let index = self.inst.bits(36, 5) as u32;
        let imm = self.inst.bits(20, 16) as u16 as i16 as i32 as u32;
        let src = self.inst.src_a_reg();
        let offset_at = |this: &mut Self, extra: u32| -> Value {
            if src == Reg::RZ {
                Value::U32(imm.wrapping_add(extra))
            } else {
                let base = this.x(src);
                this.ir.iadd(base, Value::U32(imm.wrapping_add(extra)))
            }
        };
        let dest = self.inst.dest_reg();
        let (bit_width, signed) = match self.inst.bits(48, 3) {
            0 => (8, false),
            1 => (8, true),
            2 => (16, false),
            3 => (16, true),
            4 => (32, false),
            5 => {
                if dest != Reg::RZ && !dest.0.is_multiple_of(2) {
                    return Err(self.not_implemented("unaligned LDC.64 destination"));
                }
                let high = self.reg_offset(dest, 1)?;
                let offset = offset_at(self, 0);
                let low_value = self.ir.get_cbuf(index, offset, 32, false);
                let offset = offset_at(self, 4);
                let high_value = self.ir.get_cbuf(index, offset, 32, false);
                self.set_x(dest, low_value);
                self.set_x(high, high_value);
                return Ok(());
            }
            size => return Err(self.not_implemented(&format!("LDC size {size}"))),
        };
        let offset = offset_at(self, 0);
        let value = self.ir.get_cbuf(index, offset, bit_width, signed);
        self.set_x(dest, value);
        Ok(())
    }

    /// Attribute range of an `ALD`/`AST`: base attribute and component count.
    fn attribute_range(&self) -> Result<(Attribute, u32)> {
        if self.inst.src_a_reg() != Reg::RZ {
            return Err(self.not_implemented("indexed attribute access"));
        }
        let offset = self.inst.bits(20, 10) as u16;
        if !offset.is_multiple_of(4) {
            return Err(self.invalid_encoding());
        }
        let count = self.inst.bits(47, 2) as u32 + 1;
        let base = Attribute(offset);
        for i in 0..count {
            let attribute = base.offset(i);
            if !attribute.is_supported() {
                return Err(self.not_implemented(&format!("attribute {attribute}")));
            }
        }
        Ok((base, count))
    }

    fn ald(&mut self) -> Result<()> {
        let (base, count) = self.attribute_range()?;
        for i in 0..count {
            let value = self.ir.get_attribute(base.offset(i));
            let dest = self.reg_offset(self.inst.dest_reg(), i)?;
            self.set_f(dest, value);
        }
        Ok(())
    }

    fn ast(&mut self) -> Result<()> {
        let (base, count) = self.attribute_range()?;
        for i in 0..count {
            let src = self.reg_offset(self.inst.dest_reg(), i)?;
            let value = self.f(src);
            self.ir.set_attribute(base.offset(i), value);
        }
        Ok(())
    }

    fn ipa(&mut self) -> Result<()> {
        let attribute = Attribute(self.inst.bits(28, 10) as u16);
        if !attribute.is_supported() {
            return Err(self.not_implemented(&format!("interpolated attribute {attribute}")));
        }
        let mut value = self.ir.get_attribute(attribute);
        match self.inst.bits(54, 2) {
            0 | 2 => {}
            1 => {
                let multiplier = self.f(self.inst.src_b_reg());
                value = self.ir.fp_mul(value, multiplier, FpControl::default());
            }
            _ => return Err(self.not_implemented("IPA.SC")),
        }
        let value = self.saturate_if(value, self.inst.bit(51));
        self.set_f(self.inst.dest_reg(), value);
        Ok(())
    }

    fn tex(&mut self) -> Result<()> {
        let cbuf_index = self.env.texture_bound_buffer();
        let cbuf_offset = self.inst.bits(36, 13) as u32 * 4;
        let handle = self.env.read_constant_buffer(cbuf_index, cbuf_offset, 32, false);
        let texture_type = self.env.texture_info(handle).texture_type;
        let descriptor_index = self.ir.program.info.register_texture(TextureDescriptor {
            texture_type,
            cbuf_index,
            cbuf_offset,
        });

        let mut coords = [Value::F32(0.0); 3];
        for (i, coord) in coords.iter_mut().enumerate().take(texture_type.coordinate_count()) {
            let reg = self.reg_offset(self.inst.src_a_reg(), i as u32)?;
            *coord = self.f(reg);
        }
        let sample = self.ir.image_sample(
            TextureInstInfo {
                descriptor_index,
                texture_type,
            },
            coords,
        );
        let mask = self.inst.bits(31, 4);
        let mut dest = 0;
        for component in 0..4 {
            if mask & (1 << component) == 0 {
                continue;
            }
            let value = self.ir.composite_extract(sample, component);
            let reg = self.reg_offset(self.inst.dest_reg(), dest)?;
            self.set_f(reg, value);
            dest += 1;
        }
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        if self.env.stage() != Stage::Fragment {
            return Ok(());
        }
        let sph = *self.env.sph();
        let mut src = Reg(0);
        for render_target in 0..NUM_RENDER_TARGETS {
            if !sph.has_output_components(render_target) {
                continue;
            }
            let mask = sph.enabled_output_components(render_target);
            for (component, enabled) in mask.into_iter().enumerate() {
                if enabled {
                    let value = self.f(src);
                    self.ir.set_frag_color(render_target, component as u32, value);
                }
                src = self.reg_offset(src, 1)?;
            }
        }
        if sph.omap_sample_mask() {
            let value = self.x(src);
            self.ir.set_sample_mask(value);
        }
        if sph.omap_depth() {
            let depth_reg = self.reg_offset(src, 1)?;
            let value = self.f(depth_reg);
            self.ir.set_frag_depth(value);
        }
        Ok(())
    }
}
