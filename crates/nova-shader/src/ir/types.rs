use bitflags::bitflags;

bitflags! {
    /// IR value type. Opcode signatures may accept a union of types; `OPAQUE` matches anything.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Type: u32 {
        const OPAQUE = 1 << 0;
        const REG = 1 << 1;
        const PRED = 1 << 2;
        const ATTRIBUTE = 1 << 3;
        const LABEL = 1 << 4;
        const U1 = 1 << 5;
        const U32 = 1 << 6;
        const F32 = 1 << 7;
        const F32X4 = 1 << 8;
    }
}

impl Type {
    pub const VOID: Type = Type::empty();

    pub fn name(self) -> &'static str {
        match self {
            Type::VOID => "Void",
            Type::OPAQUE => "Opaque",
            Type::REG => "Reg",
            Type::PRED => "Pred",
            Type::ATTRIBUTE => "Attribute",
            Type::LABEL => "Label",
            Type::U1 => "U1",
            Type::U32 => "U32",
            Type::F32 => "F32",
            Type::F32X4 => "F32x4",
            _ => "<union>",
        }
    }

    pub fn are_compatible(lhs: Type, rhs: Type) -> bool {
        lhs == rhs || lhs == Type::OPAQUE || rhs == Type::OPAQUE
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
