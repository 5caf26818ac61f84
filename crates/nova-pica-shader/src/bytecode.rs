//! Bit-field views over PICA200 shader words.
//!
//! Instructions are 32-bit words. The top six bits select the opcode; the remaining bits are
//! interpreted through one of three layouts (`common` arithmetic, `mad`, `flow_control`)
//! depending on the opcode class. Operand swizzles, negation and the destination write mask
//! live in a separate table indexed by `operand_desc_id`.

use std::fmt;

/// Number of words in a PICA program memory.
pub const MAX_PROGRAM_CODE_LENGTH: usize = 4096;

/// Number of entries in the operand descriptor (swizzle) table.
pub const MAX_SWIZZLE_DATA_LENGTH: usize = 4096;

#[inline]
const fn bits(word: u32, offset: u32, width: u32) -> u32 {
    (word >> offset) & ((1u32 << width) - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCode {
    Add,
    Dp3,
    Dp4,
    Dph,
    Dst,
    Ex2,
    Lg2,
    Litp,
    Mul,
    Sge,
    Slt,
    Flr,
    Max,
    Min,
    Rcp,
    Rsq,
    Mova,
    Mov,
    Dphi,
    Dsti,
    Sgei,
    Slti,
    Break,
    Nop,
    End,
    BreakC,
    Call,
    CallC,
    CallU,
    Ifu,
    Ifc,
    Loop,
    Emit,
    SetEmit,
    Jmpc,
    Jmpu,
    Cmp,
    Madi,
    Mad,
    Unknown(u8),
}

/// Operand layout used by an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Arithmetic,
    MultiplyAdd,
    FlowControl,
}

impl OpCode {
    /// Decodes the 6-bit opcode field. `CMP`, `MADI` and `MAD` occupy several encodings because
    /// their operands spill into the low opcode bits.
    pub fn from_raw(op: u32) -> Self {
        match op & 0x3F {
            0x00 => Self::Add,
            0x01 => Self::Dp3,
            0x02 => Self::Dp4,
            0x03 => Self::Dph,
            0x04 => Self::Dst,
            0x05 => Self::Ex2,
            0x06 => Self::Lg2,
            0x07 => Self::Litp,
            0x08 => Self::Mul,
            0x09 => Self::Sge,
            0x0A => Self::Slt,
            0x0B => Self::Flr,
            0x0C => Self::Max,
            0x0D => Self::Min,
            0x0E => Self::Rcp,
            0x0F => Self::Rsq,
            0x12 => Self::Mova,
            0x13 => Self::Mov,
            0x18 => Self::Dphi,
            0x19 => Self::Dsti,
            0x1A => Self::Sgei,
            0x1B => Self::Slti,
            0x20 => Self::Break,
            0x21 => Self::Nop,
            0x22 => Self::End,
            0x23 => Self::BreakC,
            0x24 => Self::Call,
            0x25 => Self::CallC,
            0x26 => Self::CallU,
            0x27 => Self::Ifu,
            0x28 => Self::Ifc,
            0x29 => Self::Loop,
            0x2A => Self::Emit,
            0x2B => Self::SetEmit,
            0x2C => Self::Jmpc,
            0x2D => Self::Jmpu,
            0x2E | 0x2F => Self::Cmp,
            0x30..=0x37 => Self::Madi,
            0x38..=0x3F => Self::Mad,
            other => Self::Unknown(other as u8),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Dp3 => "DP3",
            Self::Dp4 => "DP4",
            Self::Dph => "DPH",
            Self::Dst => "DST",
            Self::Ex2 => "EX2",
            Self::Lg2 => "LG2",
            Self::Litp => "LITP",
            Self::Mul => "MUL",
            Self::Sge => "SGE",
            Self::Slt => "SLT",
            Self::Flr => "FLR",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Rcp => "RCP",
            Self::Rsq => "RSQ",
            Self::Mova => "MOVA",
            Self::Mov => "MOV",
            Self::Dphi => "DPHI",
            Self::Dsti => "DSTI",
            Self::Sgei => "SGEI",
            Self::Slti => "SLTI",
            Self::Break => "BREAK",
            Self::Nop => "NOP",
            Self::End => "END",
            Self::BreakC => "BREAKC",
            Self::Call => "CALL",
            Self::CallC => "CALLC",
            Self::CallU => "CALLU",
            Self::Ifu => "IFU",
            Self::Ifc => "IFC",
            Self::Loop => "LOOP",
            Self::Emit => "EMIT",
            Self::SetEmit => "SETEMIT",
            Self::Jmpc => "JMPC",
            Self::Jmpu => "JMPU",
            Self::Cmp => "CMP",
            Self::Madi => "MADI",
            Self::Mad => "MAD",
            Self::Unknown(_) => "UNK",
        }
    }

    pub fn kind(self) -> OpKind {
        match self {
            Self::Add
            | Self::Dp3
            | Self::Dp4
            | Self::Dph
            | Self::Dst
            | Self::Ex2
            | Self::Lg2
            | Self::Litp
            | Self::Mul
            | Self::Sge
            | Self::Slt
            | Self::Flr
            | Self::Max
            | Self::Min
            | Self::Rcp
            | Self::Rsq
            | Self::Mova
            | Self::Mov
            | Self::Dphi
            | Self::Dsti
            | Self::Sgei
            | Self::Slti
            | Self::Cmp => OpKind::Arithmetic,
            Self::Madi | Self::Mad => OpKind::MultiplyAdd,
            _ => OpKind::FlowControl,
        }
    }

    /// Whether the wide (7-bit) source slot is `src2` instead of `src1`.
    pub fn is_src_inverted(self) -> bool {
        matches!(
            self,
            Self::Dphi | Self::Dsti | Self::Sgei | Self::Slti | Self::Madi
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "UNK(0x{raw:02x})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    Input,
    Temporary,
    FloatUniform,
    Output,
    Unknown,
}

/// Source operand: `v0-v15` at `0x00`, `r0-r15` at `0x10`, `c0-c95` from `0x20`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRegister(pub u8);

impl SourceRegister {
    pub fn register_type(self) -> RegisterType {
        match self.0 {
            0x00..=0x0F => RegisterType::Input,
            0x10..=0x1F => RegisterType::Temporary,
            _ => RegisterType::FloatUniform,
        }
    }

    pub fn index(self) -> u32 {
        match self.register_type() {
            RegisterType::Input => u32::from(self.0),
            RegisterType::Temporary => u32::from(self.0) - 0x10,
            _ => u32::from(self.0) - 0x20,
        }
    }
}

/// Destination operand: `o0-o15` at `0x00`, `r0-r15` at `0x10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestRegister(pub u8);

impl DestRegister {
    pub fn register_type(self) -> RegisterType {
        match self.0 {
            0x00..=0x0F => RegisterType::Output,
            0x10..=0x1F => RegisterType::Temporary,
            _ => RegisterType::Unknown,
        }
    }

    pub fn index(self) -> u32 {
        match self.register_type() {
            RegisterType::Output => u32::from(self.0),
            _ => u32::from(self.0).wrapping_sub(0x10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    Unknown(u32),
}

impl CompareOp {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Equal,
            1 => Self::NotEqual,
            2 => Self::LessThan,
            3 => Self::LessEqual,
            4 => Self::GreaterThan,
            5 => Self::GreaterEqual,
            other => Self::Unknown(other),
        }
    }
}

/// Condition combiner for `JMPC`/`CALLC`/`IFC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOp {
    Or,
    And,
    JustX,
    JustY,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    pub fn opcode(self) -> OpCode {
        OpCode::from_raw(bits(self.0, 26, 6))
    }

    pub fn common(self) -> Common {
        Common(self.0)
    }

    pub fn mad(self) -> Mad {
        Mad(self.0)
    }

    pub fn flow_control(self) -> FlowControl {
        FlowControl(self.0)
    }

    /// Index into the swizzle table for this instruction's operand layout.
    pub fn operand_desc_id(self) -> usize {
        match self.opcode().kind() {
            OpKind::MultiplyAdd => self.mad().operand_desc_id() as usize,
            _ => self.common().operand_desc_id() as usize,
        }
    }
}

/// Arithmetic layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Common(u32);

impl Common {
    pub fn operand_desc_id(self) -> u32 {
        bits(self.0, 0, 7)
    }

    pub fn src1(self, inverted: bool) -> SourceRegister {
        if inverted {
            SourceRegister(bits(self.0, 14, 5) as u8)
        } else {
            SourceRegister(bits(self.0, 12, 7) as u8)
        }
    }

    pub fn src2(self, inverted: bool) -> SourceRegister {
        if inverted {
            SourceRegister(bits(self.0, 7, 7) as u8)
        } else {
            SourceRegister(bits(self.0, 7, 5) as u8)
        }
    }

    /// Address register used for relative addressing of the wide source slot (0 = none).
    pub fn address_register_index(self) -> u32 {
        bits(self.0, 19, 2)
    }

    pub fn dest(self) -> DestRegister {
        DestRegister(bits(self.0, 21, 5) as u8)
    }

    pub fn compare_x(self) -> CompareOp {
        CompareOp::from_raw(bits(self.0, 24, 3))
    }

    pub fn compare_y(self) -> CompareOp {
        CompareOp::from_raw(bits(self.0, 21, 3))
    }
}

/// Multiply-add layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mad(u32);

impl Mad {
    pub fn operand_desc_id(self) -> u32 {
        bits(self.0, 0, 5)
    }

    pub fn src1(self, _inverted: bool) -> SourceRegister {
        SourceRegister(bits(self.0, 17, 5) as u8)
    }

    pub fn src2(self, inverted: bool) -> SourceRegister {
        if inverted {
            SourceRegister(bits(self.0, 12, 5) as u8)
        } else {
            SourceRegister(bits(self.0, 10, 7) as u8)
        }
    }

    pub fn src3(self, inverted: bool) -> SourceRegister {
        if inverted {
            SourceRegister(bits(self.0, 5, 7) as u8)
        } else {
            SourceRegister(bits(self.0, 5, 5) as u8)
        }
    }

    pub fn address_register_index(self) -> u32 {
        bits(self.0, 22, 2)
    }

    pub fn dest(self) -> DestRegister {
        DestRegister(bits(self.0, 24, 5) as u8)
    }
}

/// Flow-control layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl(u32);

impl FlowControl {
    pub fn num_instructions(self) -> u32 {
        bits(self.0, 0, 8)
    }

    pub fn dest_offset(self) -> u32 {
        bits(self.0, 10, 12)
    }

    pub fn op(self) -> FlowOp {
        match bits(self.0, 22, 2) {
            0 => FlowOp::Or,
            1 => FlowOp::And,
            2 => FlowOp::JustX,
            _ => FlowOp::JustY,
        }
    }

    pub fn bool_uniform_id(self) -> u32 {
        bits(self.0, 22, 4)
    }

    pub fn int_uniform_id(self) -> u32 {
        bits(self.0, 22, 2)
    }

    pub fn refy(self) -> bool {
        bits(self.0, 24, 1) != 0
    }

    pub fn refx(self) -> bool {
        bits(self.0, 25, 1) != 0
    }
}

/// Operand descriptor: write mask, per-source negation and component selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwizzlePattern(pub u32);

impl SwizzlePattern {
    pub fn dest_mask(self) -> u32 {
        bits(self.0, 0, 4)
    }

    /// Component `i` (0 = x) is written. The mask stores x in its most significant bit.
    pub fn dest_component_enabled(self, i: usize) -> bool {
        self.dest_mask() & (0x8 >> i) != 0
    }

    pub fn negate_src1(self) -> bool {
        bits(self.0, 4, 1) != 0
    }

    pub fn negate_src2(self) -> bool {
        bits(self.0, 13, 1) != 0
    }

    pub fn negate_src3(self) -> bool {
        bits(self.0, 22, 1) != 0
    }

    fn selector_string(selector: u32) -> String {
        (0..4)
            .map(|comp| {
                let sel = (selector >> ((3 - comp) * 2)) & 3;
                ['x', 'y', 'z', 'w'][sel as usize]
            })
            .collect()
    }

    pub fn selector_src1(self) -> String {
        Self::selector_string(bits(self.0, 5, 8))
    }

    pub fn selector_src2(self) -> String {
        Self::selector_string(bits(self.0, 14, 8))
    }

    pub fn selector_src3(self) -> String {
        Self::selector_string(bits(self.0, 23, 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_encoding_opcodes_collapse() {
        assert_eq!(OpCode::from_raw(0x2F), OpCode::Cmp);
        assert_eq!(OpCode::from_raw(0x33), OpCode::Madi);
        assert_eq!(OpCode::from_raw(0x3E), OpCode::Mad);
        assert_eq!(OpCode::from_raw(0x14), OpCode::Unknown(0x14));
    }

    #[test]
    fn identity_swizzle_reads_xyzw() {
        // mask xyzw, src1/src2/src3 selectors x y z w (0b00_01_10_11)
        let pattern = SwizzlePattern(0xF | (0x1B << 5) | (0x1B << 14) | (0x1B << 23));
        assert_eq!(pattern.selector_src1(), "xyzw");
        assert_eq!(pattern.selector_src2(), "xyzw");
        assert_eq!(pattern.selector_src3(), "xyzw");
        assert!((0..4).all(|i| pattern.dest_component_enabled(i)));
    }

    #[test]
    fn dest_mask_is_msb_first() {
        let only_x = SwizzlePattern(0x8);
        assert!(only_x.dest_component_enabled(0));
        assert!(!only_x.dest_component_enabled(3));
    }

    #[test]
    fn register_ranges() {
        assert_eq!(SourceRegister(0x05).register_type(), RegisterType::Input);
        assert_eq!(SourceRegister(0x13).index(), 3);
        assert_eq!(SourceRegister(0x25).register_type(), RegisterType::FloatUniform);
        assert_eq!(SourceRegister(0x25).index(), 5);
        assert_eq!(DestRegister(0x02).register_type(), RegisterType::Output);
        assert_eq!(DestRegister(0x11).index(), 1);
    }
}
