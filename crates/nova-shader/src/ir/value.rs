use super::types::Type;

/// General purpose register. `RZ` reads as zero and discards writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u8);

impl Reg {
    pub const RZ: Reg = Reg(255);
    pub const NUM_USER_REGS: usize = 255;

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Register `n` slots after this one. Offsetting past the last user register is an encoding
    /// error the caller reports.
    pub fn offset(self, n: u32) -> Option<Reg> {
        if self == Reg::RZ {
            return Some(Reg::RZ);
        }
        let index = self.0 as u32 + n;
        (index < Reg::NUM_USER_REGS as u32).then_some(Reg(index as u8))
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Reg::RZ {
            f.write_str("RZ")
        } else {
            write!(f, "R{}", self.0)
        }
    }
}

/// Predicate register. `PT` reads as true and discards writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pred(pub u8);

impl Pred {
    pub const PT: Pred = Pred(7);
    pub const NUM_USER_PREDS: usize = 7;

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Pred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Pred::PT {
            f.write_str("PT")
        } else {
            write!(f, "P{}", self.0)
        }
    }
}

/// Attribute address as it appears in `ALD`/`AST`/`IPA`: a byte offset into attribute space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Attribute(pub u16);

impl Attribute {
    pub const POSITION_X: Attribute = Attribute(0x70);
    pub const POSITION_Y: Attribute = Attribute(0x74);
    pub const POSITION_Z: Attribute = Attribute(0x78);
    pub const POSITION_W: Attribute = Attribute(0x7C);
    pub const GENERIC_0_X: Attribute = Attribute(0x80);
    pub const INSTANCE_ID: Attribute = Attribute(0x2F8);
    pub const VERTEX_ID: Attribute = Attribute(0x2FC);

    pub const NUM_GENERICS: u32 = 32;

    pub fn generic(index: u32, component: u32) -> Attribute {
        Attribute((0x80 + index * 0x10 + component * 4) as u16)
    }

    pub fn is_position(self) -> bool {
        (0x70..0x80).contains(&self.0)
    }

    pub fn is_generic(self) -> bool {
        (0x80..0x80 + 0x10 * Self::NUM_GENERICS as u16).contains(&self.0)
    }

    /// Generic vector index, for generic attributes.
    pub fn generic_index(self) -> Option<u32> {
        self.is_generic().then(|| (self.0 as u32 - 0x80) / 0x10)
    }

    /// Component (0 = x .. 3 = w) within the owning vector.
    pub fn component(self) -> u32 {
        (self.0 as u32 / 4) % 4
    }

    /// Attribute `n` words after this one.
    pub fn offset(self, n: u32) -> Attribute {
        Attribute(self.0 + (n * 4) as u16)
    }

    pub fn is_supported(self) -> bool {
        self.is_position()
            || self.is_generic()
            || self == Attribute::INSTANCE_ID
            || self == Attribute::VERTEX_ID
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const XYZW: [char; 4] = ['X', 'Y', 'Z', 'W'];
        if self.is_position() {
            write!(f, "Position{}", XYZW[self.component() as usize])
        } else if let Some(index) = self.generic_index() {
            write!(f, "Generic{}{}", index, XYZW[self.component() as usize])
        } else if *self == Attribute::INSTANCE_ID {
            f.write_str("InstanceId")
        } else if *self == Attribute::VERTEX_ID {
            f.write_str("VertexId")
        } else {
            write!(f, "Attribute(0x{:x})", self.0)
        }
    }
}

/// Handle into a program's instruction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle into a program's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Operand of an IR instruction: an immediate, a guest operand or another instruction's result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Void,
    Inst(InstId),
    Reg(Reg),
    Pred(Pred),
    Attribute(Attribute),
    Label(BlockId),
    U1(bool),
    U32(u32),
    F32(f32),
}

impl Value {
    pub fn is_immediate(&self) -> bool {
        !matches!(self, Value::Inst(_) | Value::Void)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn inst(&self) -> Option<InstId> {
        match self {
            Value::Inst(id) => Some(*id),
            _ => None,
        }
    }

    /// Type of an immediate. Instruction results need the owning program to resolve.
    pub fn immediate_type(&self) -> Option<Type> {
        Some(match self {
            Value::Void => Type::VOID,
            Value::Inst(_) => return None,
            Value::Reg(_) => Type::REG,
            Value::Pred(_) => Type::PRED,
            Value::Attribute(_) => Type::ATTRIBUTE,
            Value::Label(_) => Type::LABEL,
            Value::U1(_) => Type::U1,
            Value::U32(_) => Type::U32,
            Value::F32(_) => Type::F32,
        })
    }

    pub fn as_u1(&self) -> Option<bool> {
        match self {
            Value::U1(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(value) => Some(*value),
            _ => None,
        }
    }

    /// Bitwise identity, so `F32(NaN)` equals itself.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Void => f.write_str("<void>"),
            Value::Inst(id) => write!(f, "%{}", id.0),
            Value::Reg(reg) => write!(f, "{reg}"),
            Value::Pred(pred) => write!(f, "{pred}"),
            Value::Attribute(attr) => write!(f, "{attr}"),
            Value::Label(block) => write!(f, "{{Block ${}}}", block.0),
            Value::U1(value) => write!(f, "{value}"),
            Value::U32(value) => write!(f, "#{value}"),
            Value::F32(value) => write!(f, "#{value:?}"),
        }
    }
}
