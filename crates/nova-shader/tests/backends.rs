mod common;

use common::{count_ext, count_op, has_decoration, spirv_instructions};
use nova_shader::ir::{passes, AbstractSyntaxNode, Attribute, FpCompare, FpControl, IrEmitter};
use nova_shader::{
    emit_glasm, emit_glsl, emit_spirv, Bindings, Profile, Program, RuntimeInfo, Stage,
};
use spirv::{Capability, Decoration, GLOp, Op};

const PRECISE: FpControl = FpControl {
    no_contraction: true,
    rounding: nova_shader::ir::FpRounding::DontCare,
    fmz: nova_shader::ir::FmzMode::DontCare,
};

/// Fragment program: `out0.x = (a <u b) ? saturate(a + b) : a`, with a precise add.
fn compare_and_saturate(compare: FpCompare, ordered: bool) -> Program {
    let mut program = Program::new(Stage::Fragment);
    let block = program.new_block();
    {
        let mut ir = IrEmitter::new(&mut program, block);
        let a = ir.get_attribute(Attribute::generic(0, 0));
        let b = ir.get_attribute(Attribute::generic(0, 1));
        let cmp = ir.fp_compare(compare, ordered, a, b);
        let sum = ir.fp_add(a, b, PRECISE);
        let saturated = ir.fp_saturate(sum);
        let result = ir.select(cmp, saturated, a);
        ir.set_frag_color(0, 0, result);
    }
    program.block_order = vec![block];
    program.syntax_list = vec![AbstractSyntaxNode::Block(block), AbstractSyntaxNode::Return];
    passes::optimize(&mut program).unwrap();
    program
}

fn spirv(profile: &Profile, program: &Program) -> Vec<u32> {
    emit_spirv(profile, &RuntimeInfo::default(), program, &mut Bindings::new()).unwrap()
}

fn glsl(profile: &Profile, program: &Program) -> String {
    emit_glsl(profile, &RuntimeInfo::default(), program, &mut Bindings::new()).unwrap()
}

fn glasm(profile: &Profile, program: &Program) -> String {
    emit_glasm(profile, &RuntimeInfo::default(), program, &mut Bindings::new()).unwrap()
}

#[test]
fn spirv_uses_native_unordered_compares_by_default() {
    let program = compare_and_saturate(FpCompare::LessThan, false);
    let words = spirv(&Profile::default(), &program);
    assert_eq!(count_op(&words, Op::FUnordLessThan), 1);
    assert_eq!(count_op(&words, Op::IsNan), 0);
    assert_eq!(count_ext(&words, GLOp::FClamp), 1);
    assert!(has_decoration(&words, Decoration::NoContraction));
}

#[test]
fn spirv_ignore_nan_synthesizes_unordered_compares() {
    let profile = Profile {
        ignore_nan_fp_comparisons: true,
        ..Profile::default()
    };
    let words = spirv(&profile, &compare_and_saturate(FpCompare::LessThan, false));
    assert_eq!(count_op(&words, Op::FUnordLessThan), 0);
    assert_eq!(count_op(&words, Op::FOrdLessThan), 1);
    assert_eq!(count_op(&words, Op::IsNan), 2);
    assert_eq!(count_op(&words, Op::LogicalOr), 2);
}

#[test]
fn spirv_ignore_nan_guards_ordered_not_equal() {
    let profile = Profile {
        ignore_nan_fp_comparisons: true,
        ..Profile::default()
    };
    let words = spirv(&profile, &compare_and_saturate(FpCompare::NotEqual, true));
    assert_eq!(count_op(&words, Op::FOrdNotEqual), 1);
    assert_eq!(count_op(&words, Op::IsNan), 2);
    assert_eq!(count_op(&words, Op::LogicalAnd), 2);

    let native = spirv(&Profile::default(), &compare_and_saturate(FpCompare::NotEqual, true));
    assert_eq!(count_op(&native, Op::IsNan), 0);
}

#[test]
fn spirv_broken_clamp_lowers_to_min_max() {
    let profile = Profile {
        has_broken_spirv_clamp: true,
        ..Profile::default()
    };
    let words = spirv(&profile, &compare_and_saturate(FpCompare::LessThan, true));
    assert_eq!(count_ext(&words, GLOp::FClamp), 0);
    assert_eq!(count_ext(&words, GLOp::FMax), 1);
    assert_eq!(count_ext(&words, GLOp::FMin), 1);
}

#[test]
fn spirv_module_layout() {
    let words = spirv(&Profile::default(), &compare_and_saturate(FpCompare::LessThan, true));
    assert_eq!(words[0], spirv::MAGIC_NUMBER);
    let instructions = spirv_instructions(&words);
    assert_eq!(instructions[0], (Op::Capability as u32, vec![Capability::Shader as u32]));
    let entry = instructions
        .iter()
        .find(|(op, _)| *op == Op::EntryPoint as u32)
        .expect("entry point");
    assert_eq!(entry.1[0], spirv::ExecutionModel::Fragment as u32);
    assert_eq!(count_op(&words, Op::ExecutionMode), 1);
    assert_eq!(count_op(&words, Op::Function), 1);
    assert_eq!(count_op(&words, Op::FunctionEnd), 1);
    // Every id is below the bound.
    let bound = words[3];
    for (op, operands) in &instructions {
        if *op == Op::TypeInt as u32 || *op == Op::TypeFloat as u32 {
            assert!(operands[0] < bound);
        }
    }
}

#[test]
fn glsl_follows_the_same_policy() {
    let program = compare_and_saturate(FpCompare::LessThan, false);
    let native = glsl(&Profile::default(), &program);
    assert!(native.contains("clamp("), "{native}");
    assert!(native.contains("precise float"), "{native}");
    assert!(!native.contains("isnan("), "{native}");

    let quirky = Profile {
        ignore_nan_fp_comparisons: true,
        has_broken_spirv_clamp: true,
        has_gl_precise_bug: true,
        ..Profile::default()
    };
    let text = glsl(&quirky, &program);
    assert!(text.contains("isnan("), "{text}");
    assert!(text.contains("min(max("), "{text}");
    assert!(!text.contains("precise "), "{text}");
}

#[test]
fn glasm_follows_the_same_policy() {
    let program = compare_and_saturate(FpCompare::LessThan, false);
    let native = glasm(&Profile::default(), &program);
    assert!(native.starts_with("!!NVfp5.0\n"), "{native}");
    assert!(native.contains("ADD.F.PREC"), "{native}");
    assert!(native.contains("MOV.F.SAT"), "{native}");
    assert!(native.contains("SGE.F"), "{native}");
    assert!(native.trim_end().ends_with("END"), "{native}");

    let quirky = Profile {
        ignore_nan_fp_comparisons: true,
        has_broken_spirv_clamp: true,
        ..Profile::default()
    };
    let text = glasm(&quirky, &program);
    assert!(text.contains("SLT.F RC.x"), "{text}");
    assert!(text.contains("OR.U"), "{text}");
    assert!(text.contains("MAX.F RC.x"), "{text}");
    assert!(!text.contains("MOV.F.SAT"), "{text}");
}

#[test]
fn bindings_carry_across_stages() {
    let mut program = Program::new(Stage::Fragment);
    let block = program.new_block();
    {
        let mut ir = IrEmitter::new(&mut program, block);
        let value = ir.get_cbuf_f32(3, nova_shader::ir::Value::U32(0x20));
        ir.set_frag_color(0, 0, value);
    }
    program.block_order = vec![block];
    program.syntax_list = vec![AbstractSyntaxNode::Block(block), AbstractSyntaxNode::Return];
    passes::optimize(&mut program).unwrap();

    let mut bindings = Bindings::new();
    let profile = Profile::default();
    let runtime_info = RuntimeInfo::default();
    let first = emit_glsl(&profile, &runtime_info, &program, &mut bindings).unwrap();
    let second = emit_glsl(&profile, &runtime_info, &program, &mut bindings).unwrap();
    assert!(first.contains("layout(std140, binding = 0) uniform cbuf_block3"), "{first}");
    assert!(second.contains("layout(std140, binding = 1) uniform cbuf_block3"), "{second}");
    assert!(first.contains("cbuf3[2][0]"), "{first}");

    let mut bindings = Bindings::new();
    emit_spirv(&Profile::default(), &RuntimeInfo::default(), &program, &mut bindings).unwrap();
    assert_eq!(bindings.unified, 1);
}

#[test]
fn emission_is_deterministic() {
    let program = compare_and_saturate(FpCompare::GreaterThan, false);
    let profile = Profile::default();
    assert_eq!(spirv(&profile, &program), spirv(&profile, &program));
    assert_eq!(glsl(&profile, &program), glsl(&profile, &program));
    assert_eq!(glasm(&profile, &program), glasm(&profile, &program));
}
