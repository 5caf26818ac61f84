#![allow(dead_code)]

use std::collections::HashMap;

use nova_shader::environment::{ProgramHeader, TextureInfo, TextureType, PROGRAM_HEADER_WORDS};
use nova_shader::{Environment, Stage};

/// Environment over an in-memory program. Every fourth word is a scheduling word.
pub struct TestEnv {
    pub stage: Stage,
    pub code: Vec<u64>,
    pub cbufs: HashMap<(u32, u32), u32>,
    pub textures: HashMap<u32, TextureType>,
    pub sph: ProgramHeader,
    pub workgroup_size: [u32; 3],
}

impl TestEnv {
    /// Lays `insts` out from offset 8, inserting scheduling words.
    pub fn new(stage: Stage, insts: &[u64]) -> Self {
        let mut code = Vec::new();
        for &inst in insts {
            if code.len().is_multiple_of(4) {
                code.push(0);
            }
            code.push(inst);
        }
        Self {
            stage,
            code,
            cbufs: HashMap::new(),
            textures: HashMap::new(),
            sph: ProgramHeader::default(),
            workgroup_size: [1, 1, 1],
        }
    }

    /// Fragment program writing the components in `mask` of render target 0.
    pub fn fragment(insts: &[u64], mask: u32) -> Self {
        let mut env = Self::new(Stage::Fragment, insts);
        let mut words = [0u32; PROGRAM_HEADER_WORDS];
        words[18] = mask;
        env.sph = ProgramHeader::new(words);
        env
    }
}

impl Environment for TestEnv {
    fn read_instruction(&mut self, address: u32) -> u64 {
        self.code.get(address as usize / 8).copied().unwrap_or(0)
    }

    fn read_cbuf_word(&mut self, index: u32, offset: u32) -> u32 {
        self.cbufs.get(&(index, offset)).copied().unwrap_or(0)
    }

    fn texture_info(&mut self, handle: u32) -> TextureInfo {
        TextureInfo {
            address: handle as u64,
            texture_type: self.textures.get(&handle).copied().unwrap_or(TextureType::Color2D),
            format: 0,
        }
    }

    fn texture_bound_buffer(&self) -> u32 {
        2
    }

    fn start_address(&self) -> u32 {
        0
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    fn sph(&self) -> &ProgramHeader {
        &self.sph
    }

    fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    fn shared_memory_size(&self) -> u32 {
        0
    }
}

pub const PT: u64 = 7;
pub const RZ: u64 = 0xFF;

/// Unconditional guard.
const ALWAYS: u64 = PT << 16;

/// `MOV32I Rd, imm`
pub fn mov32i(dest: u64, imm: u32) -> u64 {
    (0x010 << 52) | ((imm as u64) << 20) | ALWAYS | dest
}

pub fn mov32i_f(dest: u64, value: f32) -> u64 {
    mov32i(dest, value.to_bits())
}

/// `MOV Rd, c[index][offset]`
pub fn mov_cbuf(dest: u64, index: u64, offset: u32) -> u64 {
    (0x4C98 << 48) | (index << 34) | (((offset / 4) as u64) << 20) | ALWAYS | dest
}

/// `FADD Rd, Ra, imm` with `imm` truncated to its top 20 bits.
pub fn fadd_imm(dest: u64, a: u64, imm: f32) -> u64 {
    (0x3858 << 48) | (((imm.to_bits() >> 12) as u64 & 0x7FFFF) << 20) | (a << 8) | ALWAYS | dest
}

/// `FADD.SAT Rd, Ra, imm`
pub fn fadd_imm_sat(dest: u64, a: u64, imm: f32) -> u64 {
    fadd_imm(dest, a, imm) | (1 << 50)
}

/// `IADD Rd, Ra, imm`
pub fn iadd_imm(dest: u64, a: u64, imm: u32) -> u64 {
    (0x3810 << 48) | (((imm & 0x7FFFF) as u64) << 20) | (a << 8) | ALWAYS | dest
}

/// `FSETP.<code>.AND Pd, PT, Ra, imm, PT`. Codes: 1 LT, 2 EQ, 4 GT, 9 LTU, 13 NEU.
pub fn fsetp_imm(pred: u64, code: u64, a: u64, imm: f32) -> u64 {
    (0x36B0 << 48)
        | (code << 48)
        | (PT << 39)
        | (((imm.to_bits() >> 12) as u64 & 0x7FFFF) << 20)
        | (a << 8)
        | ALWAYS
        | (pred << 3)
        | PT
}

/// `ISETP.LT.U32.AND Pd, PT, Ra, imm, PT`
pub fn isetp_lt_imm(pred: u64, a: u64, imm: u32) -> u64 {
    let imm = (imm & 0x7FFFF) as u64;
    (0x3660 << 48) | (1 << 49) | (PT << 39) | (imm << 20) | (a << 8) | ALWAYS | (pred << 3) | PT
}

/// `IPA Rd, a[attribute]`
pub fn ipa(dest: u64, attribute: u16) -> u64 {
    (0xE000 << 48) | ((attribute as u64) << 28) | (RZ << 20) | (RZ << 8) | ALWAYS | dest
}

/// `AST a[attribute], Rs` for `count` consecutive components.
pub fn ast(src: u64, attribute: u16, count: u64) -> u64 {
    (0xEFF0 << 48) | ((count - 1) << 47) | ((attribute as u64) << 20) | (RZ << 8) | ALWAYS | src
}

/// `@[!]Pp BRA target`, where `pc` is the branch's own offset.
pub fn bra(pred: u64, negated: bool, pc: u32, target: u32) -> u64 {
    let offset = (target as i64 - (pc as i64 + 8)) as u64 & 0xFF_FFFF;
    (0xE240 << 48) | (offset << 20) | ((negated as u64) << 19) | (pred << 16) | 0xF
}

/// `@[!]Pp KIL`
pub fn kil(pred: u64, negated: bool) -> u64 {
    (0xE330 << 48) | ((negated as u64) << 19) | (pred << 16) | 0xF
}

pub fn exit() -> u64 {
    0xE300_0000_0007_000F
}

/// Splits a SPIR-V module into `(opcode, operands)` pairs, skipping the header.
pub fn spirv_instructions(words: &[u32]) -> Vec<(u32, Vec<u32>)> {
    let mut out = Vec::new();
    let mut index = 5;
    while index < words.len() {
        let count = (words[index] >> 16) as usize;
        assert!(count > 0, "zero-length instruction at word {index}");
        out.push((words[index] & 0xFFFF, words[index + 1..index + count].to_vec()));
        index += count;
    }
    out
}

pub fn count_op(words: &[u32], op: spirv::Op) -> usize {
    spirv_instructions(words)
        .iter()
        .filter(|(opcode, _)| *opcode == op as u32)
        .count()
}

/// Number of `OpExtInst` calls to the GLSL.std.450 instruction `op`.
pub fn count_ext(words: &[u32], op: spirv::GLOp) -> usize {
    spirv_instructions(words)
        .iter()
        .filter(|(opcode, operands)| {
            *opcode == spirv::Op::ExtInst as u32 && operands.get(3) == Some(&(op as u32))
        })
        .count()
}

pub fn has_decoration(words: &[u32], decoration: spirv::Decoration) -> bool {
    spirv_instructions(words)
        .iter()
        .any(|(opcode, operands)| {
            *opcode == spirv::Op::Decorate as u32 && operands.get(1) == Some(&(decoration as u32))
        })
}
