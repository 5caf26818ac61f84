//! IR opcode table. Every opcode's name, result type and argument types live in the single
//! `opcodes!` invocation below; nothing else in the crate hardcodes a signature.

use super::types::Type;

macro_rules! opcodes {
    ($($name:ident => $ret:ident($($arg:ident),*);)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }

            pub fn result_type(self) -> Type {
                match self {
                    $(Opcode::$name => Type::$ret,)*
                }
            }

            /// Declared argument types. Empty for `Phi`, whose arity follows its block.
            pub fn arg_types(self) -> &'static [Type] {
                match self {
                    $(Opcode::$name => &[$(Type::$arg),*],)*
                }
            }
        }
    };
}

opcodes! {
    // Special operations.
    Phi => OPAQUE();
    Identity => OPAQUE(OPAQUE);
    Void => VOID();
    ConditionRef => U1(U1);
    DemoteToHelperInvocation => VOID();
    UndefU1 => U1();
    UndefU32 => U32();
    UndefF32 => F32();

    // Guest context, removed by SSA construction.
    GetRegister => U32(REG);
    SetRegister => VOID(REG, U32);
    GetPred => U1(PRED);
    SetPred => VOID(PRED, U1);
    GetGotoVariable => U1(U32);
    SetGotoVariable => VOID(U32, U1);

    // Constant buffers: (binding index, byte offset).
    GetCbufU8 => U32(U32, U32);
    GetCbufS8 => U32(U32, U32);
    GetCbufU16 => U32(U32, U32);
    GetCbufS16 => U32(U32, U32);
    GetCbufU32 => U32(U32, U32);
    GetCbufF32 => F32(U32, U32);

    // Stage interface.
    GetAttribute => F32(ATTRIBUTE);
    SetAttribute => VOID(ATTRIBUTE, F32);
    SetFragColor => VOID(U32, U32, F32);
    SetSampleMask => VOID(U32);
    SetFragDepth => VOID(F32);

    // Selection and bit casts.
    SelectU1 => U1(U1, U1, U1);
    SelectU32 => U32(U1, U32, U32);
    SelectF32 => F32(U1, F32, F32);
    BitCastU32F32 => U32(F32);
    BitCastF32U32 => F32(U32);

    // Floating point.
    FPAbs32 => F32(F32);
    FPAdd32 => F32(F32, F32);
    FPFma32 => F32(F32, F32, F32);
    FPMax32 => F32(F32, F32);
    FPMin32 => F32(F32, F32);
    FPMul32 => F32(F32, F32);
    FPNeg32 => F32(F32);
    FPRecip32 => F32(F32);
    FPRecipSqrt32 => F32(F32);
    FPSqrt => F32(F32);
    FPSin => F32(F32);
    FPCos => F32(F32);
    FPExp2 => F32(F32);
    FPLog2 => F32(F32);
    FPSaturate32 => F32(F32);
    FPOrdEqual32 => U1(F32, F32);
    FPUnordEqual32 => U1(F32, F32);
    FPOrdNotEqual32 => U1(F32, F32);
    FPUnordNotEqual32 => U1(F32, F32);
    FPOrdLessThan32 => U1(F32, F32);
    FPUnordLessThan32 => U1(F32, F32);
    FPOrdGreaterThan32 => U1(F32, F32);
    FPUnordGreaterThan32 => U1(F32, F32);
    FPOrdLessThanEqual32 => U1(F32, F32);
    FPUnordLessThanEqual32 => U1(F32, F32);
    FPOrdGreaterThanEqual32 => U1(F32, F32);
    FPUnordGreaterThanEqual32 => U1(F32, F32);
    FPIsNan32 => U1(F32);

    // Integer.
    IAdd32 => U32(U32, U32);
    INeg32 => U32(U32);
    ShiftLeftLogical32 => U32(U32, U32);
    ShiftRightLogical32 => U32(U32, U32);
    ShiftRightArithmetic32 => U32(U32, U32);
    BitwiseAnd32 => U32(U32, U32);
    BitwiseOr32 => U32(U32, U32);
    BitwiseXor32 => U32(U32, U32);
    BitwiseNot32 => U32(U32);
    IEqual => U1(U32, U32);
    INotEqual => U1(U32, U32);
    SLessThan => U1(U32, U32);
    ULessThan => U1(U32, U32);
    SLessThanEqual => U1(U32, U32);
    ULessThanEqual => U1(U32, U32);
    SGreaterThan => U1(U32, U32);
    UGreaterThan => U1(U32, U32);
    SGreaterThanEqual => U1(U32, U32);
    UGreaterThanEqual => U1(U32, U32);

    // Logical.
    LogicalOr => U1(U1, U1);
    LogicalAnd => U1(U1, U1);
    LogicalXor => U1(U1, U1);
    LogicalNot => U1(U1);

    // Conversions, named result-from-source.
    ConvertF32S32 => F32(U32);
    ConvertF32U32 => F32(U32);
    ConvertS32F32 => U32(F32);
    ConvertU32F32 => U32(F32);

    // Textures: (descriptor index, x, y, z). Unused coordinates are zero.
    ImageSample => F32X4(U32, F32, F32, F32);
    CompositeExtractF32x4 => F32(F32X4, U32);
}

impl Opcode {
    /// Instructions that must survive dead code elimination.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Opcode::ConditionRef
                | Opcode::DemoteToHelperInvocation
                | Opcode::SetRegister
                | Opcode::SetPred
                | Opcode::SetGotoVariable
                | Opcode::SetAttribute
                | Opcode::SetFragColor
                | Opcode::SetSampleMask
                | Opcode::SetFragDepth
        )
    }

    pub fn is_undef(self) -> bool {
        matches!(self, Opcode::UndefU1 | Opcode::UndefU32 | Opcode::UndefF32)
    }

    pub fn undef_for(ty: Type) -> Option<Opcode> {
        match ty {
            Type::U1 => Some(Opcode::UndefU1),
            Type::U32 => Some(Opcode::UndefU32),
            Type::F32 => Some(Opcode::UndefF32),
            _ => None,
        }
    }

    /// Float comparison this opcode performs, if any.
    pub fn fp_compare(self) -> Option<(FpCompare, bool)> {
        use FpCompare::*;
        Some(match self {
            Opcode::FPOrdEqual32 => (Equal, true),
            Opcode::FPUnordEqual32 => (Equal, false),
            Opcode::FPOrdNotEqual32 => (NotEqual, true),
            Opcode::FPUnordNotEqual32 => (NotEqual, false),
            Opcode::FPOrdLessThan32 => (LessThan, true),
            Opcode::FPUnordLessThan32 => (LessThan, false),
            Opcode::FPOrdGreaterThan32 => (GreaterThan, true),
            Opcode::FPUnordGreaterThan32 => (GreaterThan, false),
            Opcode::FPOrdLessThanEqual32 => (LessThanEqual, true),
            Opcode::FPUnordLessThanEqual32 => (LessThanEqual, false),
            Opcode::FPOrdGreaterThanEqual32 => (GreaterThanEqual, true),
            Opcode::FPUnordGreaterThanEqual32 => (GreaterThanEqual, false),
            _ => return None,
        })
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Relation tested by a float comparison; orderedness is carried separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpCompare {
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessThanEqual,
    GreaterThanEqual,
}

impl FpCompare {
    pub fn opcode(self, ordered: bool) -> Opcode {
        use FpCompare::*;
        match (self, ordered) {
            (Equal, true) => Opcode::FPOrdEqual32,
            (Equal, false) => Opcode::FPUnordEqual32,
            (NotEqual, true) => Opcode::FPOrdNotEqual32,
            (NotEqual, false) => Opcode::FPUnordNotEqual32,
            (LessThan, true) => Opcode::FPOrdLessThan32,
            (LessThan, false) => Opcode::FPUnordLessThan32,
            (GreaterThan, true) => Opcode::FPOrdGreaterThan32,
            (GreaterThan, false) => Opcode::FPUnordGreaterThan32,
            (LessThanEqual, true) => Opcode::FPOrdLessThanEqual32,
            (LessThanEqual, false) => Opcode::FPUnordLessThanEqual32,
            (GreaterThanEqual, true) => Opcode::FPOrdGreaterThanEqual32,
            (GreaterThanEqual, false) => Opcode::FPUnordGreaterThanEqual32,
        }
    }
}
