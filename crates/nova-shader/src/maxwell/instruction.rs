//! Instruction word field views and opcode recognition.

use crate::error::{Result, ShaderError};
use crate::ir::{Pred, Reg};

/// A 64-bit instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(pub u64);

impl Instruction {
    pub fn bits(self, offset: u32, count: u32) -> u64 {
        (self.0 >> offset) & ((1u64 << count) - 1)
    }

    pub fn bit(self, offset: u32) -> bool {
        self.bits(offset, 1) != 0
    }

    pub fn dest_reg(self) -> Reg {
        Reg(self.bits(0, 8) as u8)
    }

    pub fn src_a_reg(self) -> Reg {
        Reg(self.bits(8, 8) as u8)
    }

    pub fn src_b_reg(self) -> Reg {
        Reg(self.bits(20, 8) as u8)
    }

    pub fn src_c_reg(self) -> Reg {
        Reg(self.bits(39, 8) as u8)
    }

    /// Guard predicate and its negation bit.
    pub fn pred(self) -> (Pred, bool) {
        (Pred(self.bits(16, 3) as u8), self.bit(19))
    }

    /// Guard that never passes: negated `PT`.
    pub fn is_never_executed(self) -> bool {
        self.pred() == (Pred::PT, true)
    }

    pub fn is_unconditional(self) -> bool {
        self.pred() == (Pred::PT, false)
    }

    pub fn cbuf_index(self) -> u32 {
        self.bits(34, 5) as u32
    }

    /// Constant buffer byte offset (the field counts words).
    pub fn cbuf_offset(self) -> u32 {
        self.bits(20, 14) as u32 * 4
    }

    /// 20-bit integer immediate, sign bit in bit 56.
    pub fn imm20_u32(self) -> u32 {
        let value = self.bits(20, 19) as u32;
        if self.bit(56) {
            value | 0xFFF8_0000
        } else {
            value
        }
    }

    /// 20-bit float immediate: the top 20 bits of an `f32`, sign bit in bit 56.
    pub fn imm20_f32(self) -> f32 {
        let value = (self.bits(20, 19) as u32) << 12;
        let sign = (self.bit(56) as u32) << 31;
        f32::from_bits(value | sign)
    }

    pub fn imm32(self) -> u32 {
        self.bits(20, 32) as u32
    }

    /// Signed byte displacement of a branch, relative to the next instruction.
    pub fn branch_offset(self) -> i32 {
        ((self.bits(20, 24) as u32) << 8) as i32 >> 8
    }
}

macro_rules! maxwell_opcodes {
    ($($variant:ident => $name:literal, $mask:literal, $value:literal;)*) => {
        /// Recognised guest opcodes. Operand forms are distinct opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }
        }

        /// `(opcode, mask, value)` over bits 63..48, most specific pattern first.
        const DECODE_TABLE: &[(Opcode, u16, u16)] = &[
            $((Opcode::$variant, $mask, $value),)*
        ];
    };
}

maxwell_opcodes! {
    Sync => "SYNC", 0xFFF8, 0xF0F8;
    Nop => "NOP", 0xFFF8, 0x50B0;
    FaddReg => "FADD_reg", 0xFFF8, 0x5C58;
    FaddCbuf => "FADD_cbuf", 0xFFF8, 0x4C58;
    FmnmxReg => "FMNMX_reg", 0xFFF8, 0x5C60;
    FmnmxCbuf => "FMNMX_cbuf", 0xFFF8, 0x4C60;
    FmulReg => "FMUL_reg", 0xFFF8, 0x5C68;
    FmulCbuf => "FMUL_cbuf", 0xFFF8, 0x4C68;
    IaddReg => "IADD_reg", 0xFFF8, 0x5C10;
    IaddCbuf => "IADD_cbuf", 0xFFF8, 0x4C10;
    ShlReg => "SHL_reg", 0xFFF8, 0x5C48;
    ShrReg => "SHR_reg", 0xFFF8, 0x5C28;
    MovReg => "MOV_reg", 0xFFF8, 0x5C98;
    MovCbuf => "MOV_cbuf", 0xFFF8, 0x4C98;
    SelReg => "SEL_reg", 0xFFF8, 0x5CA0;
    I2fReg => "I2F_reg", 0xFFF8, 0x5CB8;
    F2iReg => "F2I_reg", 0xFFF8, 0x5CB0;
    Mufu => "MUFU", 0xFFF8, 0x5080;
    Ldc => "LDC", 0xFFF8, 0xEF90;
    Ald => "ALD", 0xFFF8, 0xEFD8;
    Ast => "AST", 0xFFF8, 0xEFF0;
    Bra => "BRA", 0xFFF0, 0xE240;
    Brk => "BRK", 0xFFF0, 0xE340;
    Cal => "CAL", 0xFFF0, 0xE260;
    Exit => "EXIT", 0xFFF0, 0xE300;
    Kil => "KIL", 0xFFF0, 0xE330;
    Pbk => "PBK", 0xFFF0, 0xE2A0;
    Ret => "RET", 0xFFF0, 0xE320;
    Ssy => "SSY", 0xFFF0, 0xE290;
    FsetpReg => "FSETP_reg", 0xFFF0, 0x5BB0;
    FsetpCbuf => "FSETP_cbuf", 0xFFF0, 0x4BB0;
    IsetpReg => "ISETP_reg", 0xFFF0, 0x5B60;
    IsetpCbuf => "ISETP_cbuf", 0xFFF0, 0x4B60;
    Mov32i => "MOV32I", 0xFFF0, 0x0100;
    FaddImm => "FADD_imm", 0xFEF8, 0x3858;
    FmnmxImm => "FMNMX_imm", 0xFEF8, 0x3860;
    FmulImm => "FMUL_imm", 0xFEF8, 0x3868;
    IaddImm => "IADD_imm", 0xFEF8, 0x3810;
    ShlImm => "SHL_imm", 0xFEF8, 0x3848;
    ShrImm => "SHR_imm", 0xFEF8, 0x3828;
    MovImm => "MOV_imm", 0xFEF8, 0x3898;
    FsetpImm => "FSETP_imm", 0xFEF0, 0x36B0;
    IsetpImm => "ISETP_imm", 0xFEF0, 0x3660;
    FfmaReg => "FFMA_reg", 0xFF80, 0x5980;
    FfmaCbuf => "FFMA_cbuf", 0xFF80, 0x4980;
    Ipa => "IPA", 0xFF00, 0xE000;
    FfmaImm => "FFMA_imm", 0xFE80, 0x3280;
    Fadd32i => "FADD32I", 0xFC00, 0x0800;
    Lop32i => "LOP32I", 0xFC00, 0x0400;
    Tex => "TEX", 0xF800, 0xC000;
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Recognises the opcode of the instruction at `address`.
pub fn decode(address: u32, raw: u64) -> Result<Opcode> {
    let top = (raw >> 48) as u16;
    DECODE_TABLE
        .iter()
        .find(|&&(_, mask, value)| top & mask == value)
        .map(|&(opcode, _, _)| opcode)
        .ok_or_else(|| {
            ShaderError::not_implemented(format!("opcode 0x{raw:016x} at 0x{address:04x}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decode_table_is_ordered_and_disjoint() {
        for window in DECODE_TABLE.windows(2) {
            assert!(
                window[0].1.count_ones() >= window[1].1.count_ones(),
                "{} listed before a more specific pattern",
                window[0].0
            );
        }
        for (i, &(a, mask_a, value_a)) in DECODE_TABLE.iter().enumerate() {
            assert_eq!(value_a & !mask_a, 0, "{a} value has bits outside its mask");
            for &(b, mask_b, value_b) in &DECODE_TABLE[i + 1..] {
                let common = mask_a & mask_b;
                assert_ne!(value_a & common, value_b & common, "{a} overlaps {b}");
            }
        }
    }

    #[test]
    fn decodes_known_words() {
        assert_eq!(decode(8, 0xE240_0FFF_FF87_000F).unwrap(), Opcode::Bra);
        assert_eq!(decode(8, 0xE300_0000_0007_000F).unwrap(), Opcode::Exit);
        assert_eq!(decode(8, 0x3958_0000_0000_0000).unwrap(), Opcode::FaddImm);
        assert!(matches!(
            decode(8, 0xFFFF_0000_0000_0000),
            Err(ShaderError::NotImplemented { .. })
        ));
    }

    #[test]
    fn immediates_sign_extend() {
        let inst = Instruction((1u64 << 56) | (0x7FFFFu64 << 20));
        assert_eq!(inst.imm20_u32() as i32, -1);
        let one = Instruction(0x3F800u64 << 20);
        assert_eq!(one.imm20_f32(), 1.0);
        let branch = Instruction(0xFFFFF8u64 << 20);
        assert_eq!(branch.branch_offset(), -8);
    }

    proptest! {
        #[test]
        fn decode_never_panics(raw in any::<u64>(), address in any::<u32>()) {
            let _ = decode(address, raw);
        }
    }
}
