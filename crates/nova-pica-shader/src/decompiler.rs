//! PICA200 program to GLSL source.
//!
//! Every analyzed subroutine becomes a `bool sub_<begin>_<end>()` function that returns `true`
//! once the program reached `END`. Subroutines containing jump labels are compiled as a
//! `while (true) { switch (jmp_to) { ... } }` dispatch loop with one case per label.
//!
//! The generated code expects the embedder to provide `uniforms.f[]`, `uniforms.i[]` and
//! `uniforms.b[]`, and to map input/output registers through the getter closures.

use tracing::{debug, error, warn};

use crate::analyzer::{ControlFlowAnalyzer, ExitMethod, Subroutine, SubroutineSet, PROGRAM_END};
use crate::bytecode::{
    CompareOp, DestRegister, FlowControl, FlowOp, Instruction, OpCode, OpKind, RegisterType,
    SourceRegister, SwizzlePattern,
};
use crate::error::DecompileError;
use crate::writer::ShaderWriter;

/// Maps an input or output register index to the GLSL expression that backs it.
pub type RegGetter<'a> = &'a dyn Fn(u32) -> String;

/// Decompiles a program into GLSL.
///
/// Never fails: an unsupported program yields an empty string and an error log, and the
/// caller falls back to another shader path.
pub fn decompile_program(
    code: &[u32],
    swizzle_data: &[u32],
    main_offset: u32,
    input_getter: RegGetter<'_>,
    output_getter: RegGetter<'_>,
    sanitize_mul: bool,
) -> String {
    match try_decompile_program(
        code,
        swizzle_data,
        main_offset,
        input_getter,
        output_getter,
        sanitize_mul,
    ) {
        Ok(source) => source,
        Err(err) => {
            error!(%err, main_offset, "PICA shader decompilation failed");
            String::new()
        }
    }
}

/// Like [`decompile_program`] but reports the failure.
pub fn try_decompile_program(
    code: &[u32],
    swizzle_data: &[u32],
    main_offset: u32,
    input_getter: RegGetter<'_>,
    output_getter: RegGetter<'_>,
    sanitize_mul: bool,
) -> Result<String, DecompileError> {
    let subroutines = ControlFlowAnalyzer::analyze(code, main_offset)?;
    let mut generator = GlslGenerator {
        subroutines: &subroutines,
        code,
        swizzle_data,
        main_offset,
        input_getter,
        output_getter,
        sanitize_mul,
        shader: ShaderWriter::default(),
    };
    generator.generate()?;
    debug!(
        subroutines = subroutines.len(),
        sanitize_mul, "decompiled PICA shader"
    );
    Ok(generator.shader.into_source())
}

struct GlslGenerator<'a> {
    subroutines: &'a SubroutineSet,
    code: &'a [u32],
    swizzle_data: &'a [u32],
    main_offset: u32,
    input_getter: RegGetter<'a>,
    output_getter: RegGetter<'a>,
    sanitize_mul: bool,
    shader: ShaderWriter,
}

fn negate(flag: bool) -> &'static str {
    if flag {
        "-"
    } else {
        ""
    }
}

fn compare_ops(op: CompareOp) -> Option<(&'static str, &'static str)> {
    match op {
        CompareOp::Equal => Some(("==", "equal")),
        CompareOp::NotEqual => Some(("!=", "notEqual")),
        CompareOp::LessThan => Some(("<", "lessThan")),
        CompareOp::LessEqual => Some(("<=", "lessThanEqual")),
        CompareOp::GreaterThan => Some((">", "greaterThan")),
        CompareOp::GreaterEqual => Some((">=", "greaterThanEqual")),
        CompareOp::Unknown(_) => None,
    }
}

impl<'a> GlslGenerator<'a> {
    fn subroutine(&self, begin: u32, end: u32) -> Result<&'a Subroutine, DecompileError> {
        self.subroutines
            .get(&(begin, end))
            .ok_or_else(|| DecompileError {
                offset: Some(begin),
                opcode: None,
                message: format!("subroutine {begin}..{end} was not analyzed"),
            })
    }

    fn evaluate_condition(flow: FlowControl) -> String {
        let result_x = if flow.refx() {
            "conditional_code.x"
        } else {
            "!conditional_code.x"
        };
        let result_y = if flow.refy() {
            "conditional_code.y"
        } else {
            "!conditional_code.y"
        };

        match flow.op() {
            FlowOp::JustX => result_x.to_owned(),
            FlowOp::JustY => result_y.to_owned(),
            op @ (FlowOp::Or | FlowOp::And) => {
                let and_or = if op == FlowOp::Or { "any" } else { "all" };
                let bvec = match (flow.refx(), flow.refy()) {
                    (true, true) => "conditional_code".to_owned(),
                    (false, false) => "not(conditional_code)".to_owned(),
                    _ => format!("bvec2({result_x}, {result_y})"),
                };
                format!("{and_or}({bvec})")
            }
        }
    }

    fn source_register(&self, reg: SourceRegister, address_register_index: u32) -> String {
        let index = reg.index();
        match reg.register_type() {
            RegisterType::Input => (self.input_getter)(index),
            RegisterType::Temporary => format!("reg_tmp{index}"),
            _ if address_register_index != 0 => {
                let component = ["x", "y", "z"][(address_register_index - 1) as usize];
                format!("get_offset_register({index}, address_registers.{component})")
            }
            _ => format!("uniforms.f[{index}]"),
        }
    }

    fn dest_register(&self, reg: DestRegister) -> String {
        let index = reg.index();
        match reg.register_type() {
            RegisterType::Output => (self.output_getter)(index),
            RegisterType::Temporary => format!("reg_tmp{index}"),
            _ => String::new(),
        }
    }

    fn uniform_bool(index: u32) -> String {
        format!("uniforms.b[{index}]")
    }

    fn call_subroutine(&mut self, subroutine: &Subroutine) {
        let name = subroutine.name();
        match subroutine.exit_method {
            ExitMethod::AlwaysEnd => {
                self.shader.add_line(format!("{name}();"));
                self.shader.add_line("return true;");
            }
            ExitMethod::Conditional => {
                self.shader
                    .add_line(format!("if ({name}()) {{ return true; }}"));
            }
            _ => self.shader.add_line(format!("{name}();")),
        }
    }

    /// Writes `reg.mask = value;`, adapting the value to the number of written components.
    fn set_dest(
        &mut self,
        swizzle: SwizzlePattern,
        reg: &str,
        value: &str,
        dest_num_components: usize,
        value_num_components: usize,
    ) {
        let mask: String = (0..dest_num_components)
            .filter(|&i| swizzle.dest_component_enabled(i))
            .map(|i| ['x', 'y', 'z', 'w'][i])
            .collect();
        if reg.is_empty() || mask.is_empty() {
            return;
        }
        debug_assert!(
            value_num_components >= dest_num_components || value_num_components == 1
        );

        let dest = if dest_num_components != 1 {
            format!("{reg}.{mask}")
        } else {
            reg.to_owned()
        };
        let src = if value_num_components == 1 {
            if mask.len() != 1 {
                format!("vec{}({value})", mask.len())
            } else {
                value.to_owned()
            }
        } else if value_num_components != mask.len() {
            format!("({value}).{mask}")
        } else {
            value.to_owned()
        };
        self.shader.add_line(format!("{dest} = {src};"));
    }

    /// Compiles the instruction at `offset` and returns the next offset to compile. Returns
    /// `PROGRAM_END` once every path through the instruction has reached `END`.
    fn compile_instr(&mut self, offset: u32) -> Result<u32, DecompileError> {
        let instr = Instruction(self.code.get(offset as usize).copied().unwrap_or(0));
        let opcode = instr.opcode();
        let swizzle = SwizzlePattern(
            self.swizzle_data
                .get(instr.operand_desc_id())
                .copied()
                .unwrap_or(0),
        );

        self.shader.add_line(format!("// {offset}: {}", opcode.name()));

        let mut offset = offset;
        match opcode.kind() {
            OpKind::Arithmetic => self.compile_arithmetic(offset, instr, swizzle)?,
            OpKind::MultiplyAdd => self.compile_mad(offset, instr, swizzle)?,
            OpKind::FlowControl => offset = self.compile_flow_control(offset, instr)?,
        }
        Ok(offset + 1)
    }

    fn compile_arithmetic(
        &mut self,
        offset: u32,
        instr: Instruction,
        swizzle: SwizzlePattern,
    ) -> Result<(), DecompileError> {
        let opcode = instr.opcode();
        let common = instr.common();
        let inverted = opcode.is_src_inverted();
        let address = common.address_register_index();

        let src1 = format!(
            "{}{}.{}",
            negate(swizzle.negate_src1()),
            self.source_register(common.src1(inverted), if inverted { 0 } else { address }),
            swizzle.selector_src1()
        );
        let src2 = format!(
            "{}{}.{}",
            negate(swizzle.negate_src2()),
            self.source_register(common.src2(inverted), if inverted { address } else { 0 }),
            swizzle.selector_src2()
        );
        let dest = self.dest_register(common.dest());
        let sanitize = self.sanitize_mul;

        match opcode {
            OpCode::Add => self.set_dest(swizzle, &dest, &format!("{src1} + {src2}"), 4, 4),
            OpCode::Mul => {
                let value = if sanitize {
                    format!("sanitize_mul({src1}, {src2})")
                } else {
                    format!("{src1} * {src2}")
                };
                self.set_dest(swizzle, &dest, &value, 4, 4);
            }
            OpCode::Flr => self.set_dest(swizzle, &dest, &format!("floor({src1})"), 4, 4),
            OpCode::Max => {
                let value = if sanitize {
                    format!("mix({src2}, {src1}, greaterThan({src1}, {src2}))")
                } else {
                    format!("max({src1}, {src2})")
                };
                self.set_dest(swizzle, &dest, &value, 4, 4);
            }
            OpCode::Min => {
                let value = if sanitize {
                    format!("mix({src2}, {src1}, lessThan({src1}, {src2}))")
                } else {
                    format!("min({src1}, {src2})")
                };
                self.set_dest(swizzle, &dest, &value, 4, 4);
            }
            OpCode::Dp3 | OpCode::Dp4 | OpCode::Dph | OpCode::Dphi => {
                let dot = match (opcode, sanitize) {
                    (OpCode::Dp3, true) => {
                        format!("dot(vec3(sanitize_mul({src1}, {src2})), vec3(1.0))")
                    }
                    (OpCode::Dp3, false) => format!("dot(vec3({src1}), vec3({src2}))"),
                    (_, true) => {
                        let lhs = if matches!(opcode, OpCode::Dph | OpCode::Dphi) {
                            format!("vec4({src1}.xyz, 1.0)")
                        } else {
                            src1
                        };
                        format!("dot(sanitize_mul({lhs}, {src2}), vec4(1.0))")
                    }
                    (_, false) => format!("dot({src1}, {src2})"),
                };
                self.set_dest(swizzle, &dest, &dot, 4, 1);
            }
            OpCode::Rcp => {
                if !sanitize {
                    // Without NaN masking a zero input would poison the register.
                    self.shader.add_line(format!("if ({src1}.x != 0.0)"));
                }
                self.set_dest(swizzle, &dest, &format!("(1.0 / {src1}.x)"), 4, 1);
            }
            OpCode::Rsq => {
                if !sanitize {
                    self.shader.add_line(format!("if ({src1}.x > 0.0)"));
                }
                self.set_dest(swizzle, &dest, &format!("inversesqrt({src1}.x)"), 4, 1);
            }
            OpCode::Mova => {
                self.set_dest(swizzle, "address_registers", &format!("ivec2({src1})"), 2, 2)
            }
            OpCode::Mov => self.set_dest(swizzle, &dest, &src1, 4, 4),
            OpCode::Sge | OpCode::Sgei => self.set_dest(
                swizzle,
                &dest,
                &format!("vec4(greaterThanEqual({src1}, {src2}))"),
                4,
                4,
            ),
            OpCode::Slt | OpCode::Slti => self.set_dest(
                swizzle,
                &dest,
                &format!("vec4(lessThan({src1}, {src2}))"),
                4,
                4,
            ),
            OpCode::Cmp => {
                let op_x = common.compare_x();
                let op_y = common.compare_y();
                match (compare_ops(op_x), compare_ops(op_y)) {
                    (Some((scalar_x, _)), Some((scalar_y, _))) if op_x != op_y => {
                        self.shader.add_line(format!(
                            "conditional_code.x = {src1}.x {scalar_x} {src2}.x;"
                        ));
                        self.shader.add_line(format!(
                            "conditional_code.y = {src1}.y {scalar_y} {src2}.y;"
                        ));
                    }
                    (Some((_, vector)), Some(_)) => {
                        self.shader.add_line(format!(
                            "conditional_code = {vector}(vec2({src1}), vec2({src2}));"
                        ));
                    }
                    _ => warn!(offset, ?op_x, ?op_y, "unknown PICA compare mode"),
                }
            }
            OpCode::Ex2 => self.set_dest(swizzle, &dest, &format!("exp2({src1}.x)"), 4, 1),
            OpCode::Lg2 => self.set_dest(swizzle, &dest, &format!("log2({src1}.x)"), 4, 1),
            other => return Err(DecompileError::unhandled(offset, other, instr.0)),
        }
        Ok(())
    }

    fn compile_mad(
        &mut self,
        offset: u32,
        instr: Instruction,
        swizzle: SwizzlePattern,
    ) -> Result<(), DecompileError> {
        let opcode = instr.opcode();
        if !matches!(opcode, OpCode::Mad | OpCode::Madi) {
            return Err(DecompileError::unhandled(offset, opcode, instr.0));
        }
        let mad = instr.mad();
        let inverted = opcode == OpCode::Madi;
        let address = mad.address_register_index();

        let src1 = format!(
            "{}{}.{}",
            negate(swizzle.negate_src1()),
            self.source_register(mad.src1(inverted), 0),
            swizzle.selector_src1()
        );
        let src2 = format!(
            "{}{}.{}",
            negate(swizzle.negate_src2()),
            self.source_register(mad.src2(inverted), if inverted { 0 } else { address }),
            swizzle.selector_src2()
        );
        let src3 = format!(
            "{}{}.{}",
            negate(swizzle.negate_src3()),
            self.source_register(mad.src3(inverted), if inverted { address } else { 0 }),
            swizzle.selector_src3()
        );
        let dest = self.dest_register(mad.dest());

        let value = if self.sanitize_mul {
            format!("sanitize_mul({src1}, {src2}) + {src3}")
        } else {
            format!("{src1} * {src2} + {src3}")
        };
        self.set_dest(swizzle, &dest, &value, 4, 4);
        Ok(())
    }

    /// Returns the offset of the last instruction consumed (the caller adds one).
    fn compile_flow_control(
        &mut self,
        offset: u32,
        instr: Instruction,
    ) -> Result<u32, DecompileError> {
        let opcode = instr.opcode();
        let flow = instr.flow_control();
        match opcode {
            OpCode::End => {
                self.shader.add_line("return true;");
                Ok(PROGRAM_END - 1)
            }
            OpCode::Jmpc | OpCode::Jmpu => {
                let condition = if opcode == OpCode::Jmpc {
                    Self::evaluate_condition(flow)
                } else {
                    let invert = flow.num_instructions() & 1 != 0;
                    format!(
                        "{}{}",
                        if invert { "!" } else { "" },
                        Self::uniform_bool(flow.bool_uniform_id())
                    )
                };
                self.shader.open(format!("if ({condition}) {{"));
                self.shader
                    .add_line(format!("{{ jmp_to = {}u; break; }}", flow.dest_offset()));
                self.shader.close("}");
                Ok(offset)
            }
            OpCode::Call | OpCode::CallC | OpCode::CallU => {
                let condition = match opcode {
                    OpCode::CallC => Some(Self::evaluate_condition(flow)),
                    OpCode::CallU => Some(Self::uniform_bool(flow.bool_uniform_id())),
                    _ => None,
                };
                match condition {
                    Some(condition) => self.shader.open(format!("if ({condition}) {{")),
                    None => self.shader.open("{"),
                }

                let callee = self.subroutine(
                    flow.dest_offset(),
                    flow.dest_offset() + flow.num_instructions(),
                )?;
                self.call_subroutine(callee);
                self.shader.close("}");

                if opcode == OpCode::Call && callee.exit_method == ExitMethod::AlwaysEnd {
                    Ok(PROGRAM_END - 1)
                } else {
                    Ok(offset)
                }
            }
            OpCode::Nop => Ok(offset),
            OpCode::Ifc | OpCode::Ifu => {
                let condition = if opcode == OpCode::Ifc {
                    Self::evaluate_condition(flow)
                } else {
                    Self::uniform_bool(flow.bool_uniform_id())
                };
                let if_offset = offset + 1;
                let else_offset = flow.dest_offset();
                let endif_offset = flow.dest_offset() + flow.num_instructions();
                if else_offset <= offset {
                    return Err(DecompileError::backward_target(offset, opcode, else_offset));
                }

                self.shader.open(format!("if ({condition}) {{"));
                let if_sub = self.subroutine(if_offset, else_offset)?;
                self.call_subroutine(if_sub);
                let mut next = else_offset - 1;

                if flow.num_instructions() != 0 {
                    self.shader.close("} else {");
                    self.shader.scope += 1;
                    let else_sub = self.subroutine(else_offset, endif_offset)?;
                    self.call_subroutine(else_sub);
                    next = endif_offset - 1;

                    if if_sub.exit_method == ExitMethod::AlwaysEnd
                        && else_sub.exit_method == ExitMethod::AlwaysEnd
                    {
                        next = PROGRAM_END - 1;
                    }
                }

                self.shader.close("}");
                Ok(next)
            }
            OpCode::Loop => {
                if flow.dest_offset() < offset {
                    return Err(DecompileError::backward_target(
                        offset,
                        opcode,
                        flow.dest_offset(),
                    ));
                }
                let int_uniform = format!("uniforms.i[{}]", flow.int_uniform_id());
                self.shader
                    .add_line(format!("address_registers.z = int({int_uniform}.y);"));

                let loop_var = format!("loop{offset}");
                self.shader.open(format!(
                    "for (uint {loop_var} = 0u; {loop_var} <= {int_uniform}.x; \
                     address_registers.z += int({int_uniform}.z), ++{loop_var}) {{"
                ));
                let body = self.subroutine(offset + 1, flow.dest_offset() + 1)?;
                self.call_subroutine(body);
                self.shader.close("}");

                if body.exit_method == ExitMethod::AlwaysEnd {
                    Ok(PROGRAM_END - 1)
                } else {
                    Ok(flow.dest_offset())
                }
            }
            OpCode::Emit | OpCode::SetEmit => {
                warn!(offset, "geometry shader operation in vertex shader");
                Ok(offset)
            }
            other => Err(DecompileError::unhandled(offset, other, instr.0)),
        }
    }

    /// Compiles `[begin, end)` and returns where compilation stopped. A range that starts
    /// after its end runs until `PROGRAM_END`.
    fn compile_range(&mut self, begin: u32, end: u32) -> Result<u32, DecompileError> {
        let stop = if begin > end { PROGRAM_END } else { end };
        let mut program_counter = begin;
        while program_counter < stop {
            program_counter = self.compile_instr(program_counter)?;
        }
        Ok(program_counter)
    }

    fn generate(&mut self) -> Result<(), DecompileError> {
        if self.sanitize_mul {
            self.shader.open("vec4 sanitize_mul(vec4 lhs, vec4 rhs) {");
            self.shader.add_line("vec4 product = lhs * rhs;");
            self.shader.add_line(
                "return mix(product, mix(mix(vec4(0.0), product, isnan(rhs)), product, \
                 isnan(lhs)), isnan(product));",
            );
            self.shader.close("}");
            self.shader.add_new_line();
        }

        self.shader
            .open("vec4 get_offset_register(int base_index, int offset) {");
        self.shader
            .add_line("int fixed_offset = offset >= -128 && offset <= 127 ? offset : 0;");
        self.shader
            .add_line("uint index = uint((base_index + fixed_offset) & 0x7F);");
        self.shader
            .add_line("return index < 96u ? uniforms.f[index] : vec4(1.0);");
        self.shader.close("}");
        self.shader.add_new_line();

        self.shader.add_line("bvec2 conditional_code = bvec2(false);");
        self.shader.add_line("ivec3 address_registers = ivec3(0);");
        for i in 0..16 {
            self.shader
                .add_line(format!("vec4 reg_tmp{i} = vec4(0.0, 0.0, 0.0, 1.0);"));
        }
        self.shader.add_new_line();

        let subroutines = self.subroutines;
        for subroutine in subroutines.values() {
            self.shader.add_line(format!("bool {}();", subroutine.name()));
        }
        self.shader.add_new_line();

        self.shader.open("bool exec_shader() {");
        let main = self.subroutine(self.main_offset, PROGRAM_END)?;
        self.call_subroutine(main);
        self.shader.close("}");
        self.shader.add_new_line();

        for subroutine in subroutines.values() {
            self.shader.open(format!("bool {}() {{", subroutine.name()));
            if subroutine.labels.is_empty() {
                if self.compile_range(subroutine.begin, subroutine.end)? != PROGRAM_END {
                    self.shader.add_line("return false;");
                }
            } else {
                self.compile_dispatch(subroutine)?;
            }
            self.shader.close("}");
            self.shader.add_new_line();
            debug_assert_eq!(self.shader.scope, 0);
        }
        Ok(())
    }

    /// Label dispatch: every label (plus the entry) becomes a `case`; jumps set `jmp_to` and
    /// break out of the `switch`.
    fn compile_dispatch(&mut self, subroutine: &Subroutine) -> Result<(), DecompileError> {
        let mut labels = subroutine.labels.clone();
        labels.insert(subroutine.begin);

        self.shader
            .add_line(format!("uint jmp_to = {}u;", subroutine.begin));
        self.shader.open("while (true) {");
        self.shader.add_line("switch (jmp_to) {");

        let mut cursor = labels.iter().next().copied();
        while let Some(label) = cursor {
            self.shader.open(format!("case {label}u: {{"));
            let next_label = labels
                .range(label + 1..)
                .next()
                .copied()
                .unwrap_or(subroutine.end);

            let compile_end = self.compile_range(label, next_label)?;
            if compile_end > next_label && compile_end != PROGRAM_END {
                // A label inside an IF/LOOP body: resume after the construct.
                self.shader
                    .add_line(format!("{{ jmp_to = {compile_end}u; break; }}"));
                labels.insert(compile_end);
            }
            self.shader.close("}");
            cursor = labels.range(label + 1..).next().copied();
        }

        self.shader.add_line("default: return false;");
        self.shader.add_line("}");
        self.shader.close("}");
        self.shader.add_line("return false;");
        Ok(())
    }
}
