use nova_pica_shader::{
    decompile_program, try_decompile_program, AnalyzeError, ControlFlowAnalyzer, ExitMethod,
    PROGRAM_END,
};
use pretty_assertions::assert_eq;

const OP_ADD: u32 = 0x00;
const OP_MUL: u32 = 0x08;
const OP_RCP: u32 = 0x0E;
const OP_MOV: u32 = 0x13;
const OP_END: u32 = 0x22;
const OP_CALL: u32 = 0x24;
const OP_IFU: u32 = 0x27;
const OP_JMPU: u32 = 0x2D;
const OP_CMP: u32 = 0x2E;

/// Operand descriptor 0: write xyzw, all sources read xyzw.
const IDENTITY_SWIZZLE: u32 = 0xF | (0x1B << 5) | (0x1B << 14) | (0x1B << 23);

fn arith(op: u32, dest: u32, src1: u32, src2: u32) -> u32 {
    (op << 26) | (dest << 21) | (src1 << 12) | (src2 << 7)
}

fn arith_relative(op: u32, dest: u32, src1: u32, address_register: u32) -> u32 {
    arith(op, dest, src1, 0) | (address_register << 19)
}

fn cmp(x: u32, y: u32, src1: u32, src2: u32) -> u32 {
    (OP_CMP << 26) | (x << 24) | (y << 21) | (src1 << 12) | (src2 << 7)
}

fn flow(op: u32, dest_offset: u32, num_instructions: u32) -> u32 {
    (op << 26) | (dest_offset << 10) | num_instructions
}

fn end() -> u32 {
    OP_END << 26
}

fn input(index: u32) -> String {
    format!("vs_in_reg{index}")
}

fn output(index: u32) -> String {
    format!("vs_out_attr{index}")
}

fn decompile(code: &[u32], sanitize_mul: bool) -> String {
    decompile_program(code, &[IDENTITY_SWIZZLE], 0, &input, &output, sanitize_mul)
}

fn preamble() -> String {
    let mut text = String::from(
        "vec4 get_offset_register(int base_index, int offset) {\n    \
         int fixed_offset = offset >= -128 && offset <= 127 ? offset : 0;\n    \
         uint index = uint((base_index + fixed_offset) & 0x7F);\n    \
         return index < 96u ? uniforms.f[index] : vec4(1.0);\n}\n\n\
         bvec2 conditional_code = bvec2(false);\n\
         ivec3 address_registers = ivec3(0);\n",
    );
    for i in 0..16 {
        text.push_str(&format!("vec4 reg_tmp{i} = vec4(0.0, 0.0, 0.0, 1.0);\n"));
    }
    text.push('\n');
    text
}

#[test]
fn straight_line_program() {
    // 0: MOV o0, v0
    // 1: END
    let code = [arith(OP_MOV, 0x00, 0x00, 0), end()];

    let expected = format!(
        "{}bool sub_0_4096();\n\n\
         bool exec_shader() {{\n    sub_0_4096();\n    return true;\n}}\n\n\
         bool sub_0_4096() {{\n    \
         // 0: MOV\n    \
         vs_out_attr0.xyzw = vs_in_reg0.xyzw;\n    \
         // 1: END\n    \
         return true;\n}}\n\n",
        preamble()
    );
    assert_eq!(decompile(&code, false), expected);
}

#[test]
fn sanitize_mul_routes_products_through_helper() {
    // 0: MUL r0, v0, v1
    // 1: END
    let code = [arith(OP_MUL, 0x10, 0x00, 0x01), end()];

    let plain = decompile(&code, false);
    assert!(plain.contains("reg_tmp0.xyzw = vs_in_reg0.xyzw * vs_in_reg1.xyzw;"));
    assert!(!plain.contains("sanitize_mul"));

    let sanitized = decompile(&code, true);
    assert!(sanitized.starts_with("vec4 sanitize_mul(vec4 lhs, vec4 rhs) {\n"));
    assert!(sanitized.contains("reg_tmp0.xyzw = sanitize_mul(vs_in_reg0.xyzw, vs_in_reg1.xyzw);"));
}

#[test]
fn cmp_with_equal_lane_ops_is_one_vector_compare() {
    // 0: CMP v0, EQ, EQ, v1
    // 1: END
    let code = [cmp(0, 0, 0x00, 0x01), end()];
    let text = decompile(&code, false);
    assert!(text.contains(
        "conditional_code = equal(vec2(vs_in_reg0.xyzw), vec2(vs_in_reg1.xyzw));"
    ));
    assert!(!text.contains("conditional_code.x ="));
}

#[test]
fn cmp_with_different_lane_ops_is_two_scalar_compares() {
    // 0: CMP v0, LT, GE, v1
    // 1: END
    let code = [cmp(2, 5, 0x00, 0x01), end()];
    let text = decompile(&code, false);
    assert!(text.contains("conditional_code.x = vs_in_reg0.xyzw.x < vs_in_reg1.xyzw.x;"));
    assert!(text.contains("conditional_code.y = vs_in_reg0.xyzw.y >= vs_in_reg1.xyzw.y;"));
}

#[test]
fn rcp_is_guarded_only_without_sanitize() {
    // 0: RCP r0, v0
    // 1: END
    let code = [arith(OP_RCP, 0x10, 0x00, 0), end()];

    let plain = decompile(&code, false);
    assert!(plain.contains(
        "    if (vs_in_reg0.xyzw.x != 0.0)\n    reg_tmp0.xyzw = vec4((1.0 / vs_in_reg0.xyzw.x));\n"
    ));

    let sanitized = decompile(&code, true);
    assert!(!sanitized.contains("!= 0.0)"));
    assert!(sanitized.contains("reg_tmp0.xyzw = vec4((1.0 / vs_in_reg0.xyzw.x));"));
}

#[test]
fn relative_uniform_reads_use_offset_helper() {
    // 0: MOV r1, c5[a0.x]
    // 1: ADD r2, c3, v0
    // 2: END
    let code = [
        arith_relative(OP_MOV, 0x11, 0x25, 1),
        arith(OP_ADD, 0x12, 0x23, 0x00),
        end(),
    ];
    let text = decompile(&code, false);
    assert!(text.contains("reg_tmp1.xyzw = get_offset_register(5, address_registers.x).xyzw;"));
    assert!(text.contains("reg_tmp2.xyzw = uniforms.f[3].xyzw + vs_in_reg0.xyzw;"));
}

#[test]
fn uniform_jump_becomes_label_dispatch() {
    // 0: JMPU b0, 2
    // 1: MOV o0, v0
    // 2: END
    let code = [flow(OP_JMPU, 2, 0), arith(OP_MOV, 0x00, 0x00, 0), end()];
    let text = decompile(&code, false);

    let body = "bool sub_0_4096() {\n    \
                uint jmp_to = 0u;\n    \
                while (true) {\n        \
                switch (jmp_to) {\n        \
                case 0u: {\n            \
                // 0: JMPU\n            \
                if (uniforms.b[0]) {\n                \
                { jmp_to = 2u; break; }\n            \
                }\n            \
                // 1: MOV\n            \
                vs_out_attr0.xyzw = vs_in_reg0.xyzw;\n        \
                }\n        \
                case 2u: {\n            \
                // 2: END\n            \
                return true;\n        \
                }\n        \
                default: return false;\n        \
                }\n    \
                }\n    \
                return false;\n\
                }\n\n";
    assert!(text.ends_with(body), "{text}");
}

#[test]
fn call_and_if_subroutines_are_emitted() {
    // 0: IFU b1, 2 (else empty)
    // 1: MOV o0, v0
    // 2: CALL 4, 1
    // 3: END
    // 4: MOV o1, v1
    let code = [
        flow(OP_IFU, 2, 0) | (1 << 22),
        arith(OP_MOV, 0x00, 0x00, 0),
        flow(OP_CALL, 4, 1),
        end(),
        arith(OP_MOV, 0x01, 0x01, 0),
    ];

    let subroutines = ControlFlowAnalyzer::analyze(&code, 0).unwrap();
    let keys: Vec<_> = subroutines.keys().copied().collect();
    assert_eq!(keys, vec![(0, PROGRAM_END), (1, 2), (4, 5)]);
    assert_eq!(subroutines[&(1, 2)].exit_method, ExitMethod::AlwaysReturn);

    let text = decompile(&code, false);
    assert!(text.contains("    if (uniforms.b[1]) {\n        sub_1_2();\n    }\n"));
    assert!(text.contains("    {\n        sub_4_5();\n    }\n"));
    let body = "bool sub_4_5() {\n    // 4: MOV\n    vs_out_attr1.xyzw = vs_in_reg1.xyzw;\n";
    assert!(text.contains(&format!("{body}    return false;\n}}\n")));
}

#[test]
fn direct_recursion_is_rejected() {
    // 0: CALL 0, 2
    // 1: END
    let code = [flow(OP_CALL, 0, 2), end()];
    assert_eq!(
        ControlFlowAnalyzer::analyze(&code, 0).unwrap_err(),
        AnalyzeError::RecursiveFunction { begin: 0, end: 2 }
    );
    assert_eq!(decompile(&code, false), "");
}

#[test]
fn mutual_recursion_is_rejected() {
    // 0: CALL 2, 1
    // 1: END
    // 2: CALL 0, 1
    let code = [flow(OP_CALL, 2, 1), end(), flow(OP_CALL, 0, 1)];
    assert!(matches!(
        ControlFlowAnalyzer::analyze(&code, 0),
        Err(AnalyzeError::RecursiveFunction { .. })
    ));
    let err = try_decompile_program(&code, &[IDENTITY_SWIZZLE], 0, &input, &output, false)
        .unwrap_err();
    assert!(err.to_string().contains("recursive"));
}

#[test]
fn program_without_end_is_rejected() {
    // 0: MOV o0, v0 (rest of memory is zero)
    let code = [arith(OP_MOV, 0x00, 0x00, 0)];
    assert_eq!(
        ControlFlowAnalyzer::analyze(&code, 0).unwrap_err(),
        AnalyzeError::NoEnd
    );
    assert_eq!(decompile(&code, true), "");
}

#[test]
fn unhandled_opcode_reports_position() {
    // 0: DST r0, v0, v1
    // 1: END
    let code = [arith(0x04, 0x10, 0x00, 0x01), end()];
    let err = try_decompile_program(&code, &[IDENTITY_SWIZZLE], 0, &input, &output, false)
        .unwrap_err();
    assert_eq!(err.offset, Some(0));
    assert_eq!(decompile(&code, false), "");
}

#[test]
fn if_targeting_its_own_offset_is_rejected() {
    // 0: IFU b0, 0 (else empty)
    // 1: END
    let code = [flow(OP_IFU, 0, 0), end()];
    assert!(ControlFlowAnalyzer::analyze(&code, 0).is_ok());

    let err = try_decompile_program(&code, &[IDENTITY_SWIZZLE], 0, &input, &output, false)
        .unwrap_err();
    assert_eq!(err.offset, Some(0));
    assert!(err.to_string().contains("IFU"), "{err}");
    assert_eq!(decompile(&code, false), "");
}

#[test]
fn long_jump_chain_decompiles() {
    // 0..4000: JMPU b0, <next>
    // 4000: END
    let mut code: Vec<u32> = (0..4000).map(|offset| flow(OP_JMPU, offset + 1, 0)).collect();
    code.push(end());
    let text = decompile(&code, false);
    assert!(text.contains("case 4000u: {"), "{text}");
}

#[test]
fn output_is_deterministic() {
    let code = [
        flow(OP_JMPU, 3, 1),
        arith(OP_MUL, 0x10, 0x00, 0x01),
        arith(OP_MOV, 0x00, 0x10, 0),
        end(),
    ];
    assert_eq!(decompile(&code, true), decompile(&code, true));
}

#[test]
fn mov_add_end_scenario() {
    // 0: MOV r0, c0
    // 1: ADD r0, r0, r0
    // 2: END
    let code = [
        arith(OP_MOV, 0x10, 0x20, 0),
        arith(OP_ADD, 0x10, 0x10, 0x10),
        end(),
    ];

    let subroutines = ControlFlowAnalyzer::analyze(&code, 0).unwrap();
    assert_eq!(subroutines.len(), 1);
    let main = &subroutines[&(0, PROGRAM_END)];
    assert_eq!(main.exit_method, ExitMethod::AlwaysEnd);
    assert!(main.labels.is_empty());

    let text = decompile(&code, false);
    assert_eq!(text.matches("bool sub_0_4096() {").count(), 1);
    assert!(text.ends_with(
        "bool sub_0_4096() {\n    \
         // 0: MOV\n    \
         reg_tmp0.xyzw = uniforms.f[0].xyzw;\n    \
         // 1: ADD\n    \
         reg_tmp0.xyzw = reg_tmp0.xyzw + reg_tmp0.xyzw;\n    \
         // 2: END\n    \
         return true;\n}\n\n"
    ));
}

#[test]
fn repeated_analysis_is_identical() {
    // 0: JMPU !b0, 3
    // 1: CALL 5, 1
    // 2: MOV o0, v0
    // 3: END
    // 4: NOP
    // 5: MOV o1, v1
    let code = [
        flow(OP_JMPU, 3, 1),
        flow(OP_CALL, 5, 1),
        arith(OP_MOV, 0x00, 0x00, 0),
        end(),
        flow(0x21, 0, 0),
        arith(OP_MOV, 0x01, 0x01, 0),
    ];
    let first = ControlFlowAnalyzer::analyze(&code, 0).unwrap();
    let second = ControlFlowAnalyzer::analyze(&code, 0).unwrap();
    assert_eq!(first, second);
    assert_eq!(first[&(0, PROGRAM_END)].labels.iter().copied().collect::<Vec<_>>(), vec![3]);
}
