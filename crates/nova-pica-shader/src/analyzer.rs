//! Subroutine discovery and exit-method analysis.
//!
//! A subroutine is a `[begin, end)` range entered by `CALL`, `IF` or `LOOP` (plus the main
//! program, which runs until `PROGRAM_END`). Every range is scanned once; results are memoized
//! by `(begin, end)`. While a range is being scanned its memo entry holds
//! [`ExitMethod::Undetermined`], so re-entering it is observed as a cycle instead of recursing
//! forever.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::bytecode::{Instruction, OpCode, MAX_PROGRAM_CODE_LENGTH};
use crate::error::AnalyzeError;

/// One past the last addressable instruction. Also used as the `end` of the main subroutine.
pub const PROGRAM_END: u32 = MAX_PROGRAM_CODE_LENGTH as u32;

/// How the code paths of a range leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitMethod {
    /// Scan still in progress. Only observable through a cycle.
    Undetermined,
    /// Every path reaches the end of the range.
    AlwaysReturn,
    /// Some paths reach the end of the range, others hit `END`.
    Conditional,
    /// Every path hits `END`.
    AlwaysEnd,
}

impl ExitMethod {
    /// Merges the exit methods of two alternative branches.
    pub fn parallel(self, other: Self) -> Self {
        if self == Self::Undetermined {
            return other;
        }
        if other == Self::Undetermined {
            return self;
        }
        if self == other {
            return self;
        }
        Self::Conditional
    }

    /// Merges a range with the range that runs after it. `self` is never `AlwaysEnd` here:
    /// callers short-circuit that case before scanning the continuation.
    pub fn series(self, next: Self) -> Self {
        debug_assert_ne!(self, Self::AlwaysEnd);
        match self {
            Self::Undetermined => Self::Undetermined,
            Self::AlwaysReturn => next,
            _ if matches!(next, Self::Undetermined | Self::AlwaysEnd) => Self::AlwaysEnd,
            _ => Self::Conditional,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subroutine {
    pub begin: u32,
    pub end: u32,
    pub exit_method: ExitMethod,
    /// Jump targets (`JMPC`/`JMPU`) reached while scanning this range.
    pub labels: BTreeSet<u32>,
}

impl Subroutine {
    pub fn name(&self) -> String {
        format!("sub_{}_{}", self.begin, self.end)
    }
}

/// Analyzed subroutines ordered by `(begin, end)`.
pub type SubroutineSet = BTreeMap<(u32, u32), Subroutine>;

pub struct ControlFlowAnalyzer<'a> {
    code: &'a [u32],
    subroutines: SubroutineSet,
    exit_methods: HashMap<(u32, u32), ExitMethod>,
    /// Label sets of subroutines still being scanned, indexed by [`Frame::labels`].
    label_sets: Vec<BTreeSet<u32>>,
}

/// A range scan waiting on the result of a nested range.
#[derive(Debug, Clone, Copy)]
struct Frame {
    begin: u32,
    end: u32,
    labels: usize,
    /// Completing this frame records a [`Subroutine`].
    subroutine: bool,
    step: Step,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    /// Scanning linearly from `offset`.
    Scan { offset: u32 },
    /// Waiting on the fall-through of a jump; the target is scanned next.
    JumpFallthrough { target: u32 },
    /// Waiting on the jump target.
    JumpTarget { fallthrough: ExitMethod },
    /// Waiting on a callee or loop body; `then` continues afterwards.
    Callee {
        then: u32,
        conditional: bool,
    },
    /// Waiting on the then-branch of an `IF`.
    IfThen { else_begin: u32, else_len: u32 },
    /// Waiting on the else-branch of an `IF`.
    IfElse { then: ExitMethod, after: u32 },
    /// Waiting on the code after a construct that exits as `method`.
    Continue { method: ExitMethod },
}

/// `labels` is `None` for a subroutine with its own label set.
struct Request {
    begin: u32,
    end: u32,
    labels: Option<usize>,
}

enum Action {
    Request(Request),
    Done(ExitMethod),
}

impl<'a> ControlFlowAnalyzer<'a> {
    pub fn new(code: &'a [u32]) -> Self {
        Self {
            code,
            subroutines: SubroutineSet::new(),
            exit_methods: HashMap::new(),
            label_sets: Vec::new(),
        }
    }

    /// Finds every subroutine reachable from `main_offset`. Fails unless the main program
    /// always reaches `END`.
    pub fn analyze(code: &'a [u32], main_offset: u32) -> Result<SubroutineSet, AnalyzeError> {
        if code.len() > MAX_PROGRAM_CODE_LENGTH {
            return Err(AnalyzeError::OutOfRange {
                offset: code.len() as u32,
            });
        }
        if main_offset >= PROGRAM_END {
            return Err(AnalyzeError::OutOfRange {
                offset: main_offset,
            });
        }

        let mut analyzer = Self::new(code);
        let main = analyzer.subroutine(main_offset, PROGRAM_END)?.exit_method;
        if main != ExitMethod::AlwaysEnd {
            return Err(AnalyzeError::NoEnd);
        }
        debug!(
            main_offset,
            subroutines = analyzer.subroutines.len(),
            "analyzed PICA program"
        );
        Ok(analyzer.into_subroutines())
    }

    pub fn into_subroutines(self) -> SubroutineSet {
        self.subroutines
    }

    /// Returns the subroutine for `[begin, end)`, analyzing it on first request.
    pub fn subroutine(&mut self, begin: u32, end: u32) -> Result<&Subroutine, AnalyzeError> {
        self.run(Request {
            begin,
            end,
            labels: None,
        })?;
        self.subroutines
            .get(&(begin, end))
            .ok_or(AnalyzeError::RecursiveFunction { begin, end })
    }

    fn instruction(&self, offset: u32) -> Instruction {
        // Program memory is zero-filled past the uploaded code.
        Instruction(self.code.get(offset as usize).copied().unwrap_or(0))
    }

    /// Drives nested scans with an explicit stack; call chains and jump chains can be as
    /// deep as the program is long.
    fn run(&mut self, request: Request) -> Result<ExitMethod, AnalyzeError> {
        let mut stack = Vec::new();
        let mut delivered = self.open(request, &mut stack)?;
        while let Some(frame) = stack.last_mut() {
            let action = match delivered.take() {
                Some(result) => self.resume(frame, result)?,
                None => self.scan(frame)?,
            };
            match action {
                Action::Request(request) => delivered = self.open(request, &mut stack)?,
                Action::Done(exit_method) => {
                    let Some(frame) = stack.pop() else { break };
                    delivered = Some(self.close(frame, exit_method)?);
                }
            }
        }
        Ok(delivered.unwrap_or(ExitMethod::Undetermined))
    }

    /// Answers `request` from the memo tables, or pushes a frame to scan it. A range already
    /// on the stack answers `Undetermined`.
    fn open(
        &mut self,
        request: Request,
        stack: &mut Vec<Frame>,
    ) -> Result<Option<ExitMethod>, AnalyzeError> {
        let Request { begin, end, labels } = request;
        let subroutine = labels.is_none();
        if subroutine {
            if let Some(subroutine) = self.subroutines.get(&(begin, end)) {
                return Ok(Some(subroutine.exit_method));
            }
        }
        match self.exit_methods.entry((begin, end)) {
            Entry::Occupied(entry) => {
                let exit_method = *entry.get();
                if subroutine {
                    self.record(begin, end, exit_method, BTreeSet::new())?;
                }
                return Ok(Some(exit_method));
            }
            Entry::Vacant(entry) => {
                entry.insert(ExitMethod::Undetermined);
            }
        }
        let labels = labels.unwrap_or_else(|| {
            self.label_sets.push(BTreeSet::new());
            self.label_sets.len() - 1
        });
        stack.push(Frame {
            begin,
            end,
            labels,
            subroutine,
            step: Step::Scan { offset: begin },
        });
        Ok(None)
    }

    fn close(
        &mut self,
        frame: Frame,
        exit_method: ExitMethod,
    ) -> Result<ExitMethod, AnalyzeError> {
        self.exit_methods
            .insert((frame.begin, frame.end), exit_method);
        if frame.subroutine {
            let labels = self
                .label_sets
                .get_mut(frame.labels)
                .map(std::mem::take)
                .unwrap_or_default();
            self.record(frame.begin, frame.end, exit_method, labels)?;
        }
        Ok(exit_method)
    }

    fn record(
        &mut self,
        begin: u32,
        end: u32,
        exit_method: ExitMethod,
        labels: BTreeSet<u32>,
    ) -> Result<(), AnalyzeError> {
        if exit_method == ExitMethod::Undetermined {
            return Err(AnalyzeError::RecursiveFunction { begin, end });
        }
        self.subroutines.insert(
            (begin, end),
            Subroutine {
                begin,
                end,
                exit_method,
                labels,
            },
        );
        Ok(())
    }

    /// Continues `frame` from its current offset until the range ends or a flow control
    /// instruction needs a nested result.
    fn scan(&mut self, frame: &mut Frame) -> Result<Action, AnalyzeError> {
        let Step::Scan { mut offset } = frame.step else {
            return Ok(Action::Done(ExitMethod::Undetermined));
        };
        let (end, labels) = (frame.end, frame.labels);
        let continuation = |begin| Request {
            begin,
            end,
            labels: Some(labels),
        };
        let subroutine = |begin, end| Request {
            begin,
            end,
            labels: None,
        };

        while offset != end && offset != PROGRAM_END {
            if offset > PROGRAM_END {
                return Err(AnalyzeError::OutOfRange { offset });
            }
            let instr = self.instruction(offset);
            let flow = instr.flow_control();
            let dest = flow.dest_offset();
            let num = flow.num_instructions();
            let (step, request) = match instr.opcode() {
                OpCode::End => return Ok(Action::Done(ExitMethod::AlwaysEnd)),
                OpCode::Jmpc | OpCode::Jmpu => {
                    if let Some(set) = self.label_sets.get_mut(labels) {
                        set.insert(dest);
                    }
                    (
                        Step::JumpFallthrough { target: dest },
                        continuation(offset + 1),
                    )
                }
                OpCode::Call => (
                    Step::Callee {
                        then: offset + 1,
                        conditional: false,
                    },
                    subroutine(dest, dest + num),
                ),
                OpCode::CallC | OpCode::CallU => (
                    Step::Callee {
                        then: offset + 1,
                        conditional: true,
                    },
                    subroutine(dest, dest + num),
                ),
                OpCode::Loop => (
                    Step::Callee {
                        then: dest + 1,
                        conditional: false,
                    },
                    subroutine(offset + 1, dest + 1),
                ),
                OpCode::Ifu | OpCode::Ifc => (
                    Step::IfThen {
                        else_begin: dest,
                        else_len: num,
                    },
                    subroutine(offset + 1, dest),
                ),
                _ => {
                    offset += 1;
                    continue;
                }
            };
            frame.step = step;
            return Ok(Action::Request(request));
        }
        Ok(Action::Done(ExitMethod::AlwaysReturn))
    }

    /// Feeds the nested `result` into the construct `frame` is waiting on.
    fn resume(&mut self, frame: &mut Frame, result: ExitMethod) -> Result<Action, AnalyzeError> {
        let (end, labels) = (frame.end, frame.labels);
        let continuation = |begin| Request {
            begin,
            end,
            labels: Some(labels),
        };
        let (step, request) = match frame.step {
            Step::Scan { .. } => return self.scan(frame),
            Step::JumpFallthrough { target } => (
                Step::JumpTarget {
                    fallthrough: result,
                },
                continuation(target),
            ),
            Step::JumpTarget { fallthrough } => {
                return Ok(Action::Done(fallthrough.parallel(result)));
            }
            Step::Callee { then, conditional } => {
                let method = if conditional {
                    result.parallel(ExitMethod::AlwaysReturn)
                } else if result == ExitMethod::AlwaysEnd {
                    return Ok(Action::Done(ExitMethod::AlwaysEnd));
                } else {
                    result
                };
                (Step::Continue { method }, continuation(then))
            }
            Step::IfThen {
                else_begin,
                else_len,
            } => {
                let after = else_begin + else_len;
                if else_len != 0 {
                    (
                        Step::IfElse {
                            then: result,
                            after,
                        },
                        Request {
                            begin: else_begin,
                            end: after,
                            labels: None,
                        },
                    )
                } else {
                    let both = result.parallel(ExitMethod::AlwaysReturn);
                    if both == ExitMethod::AlwaysEnd {
                        return Ok(Action::Done(ExitMethod::AlwaysEnd));
                    }
                    (Step::Continue { method: both }, continuation(after))
                }
            }
            Step::IfElse { then, after } => {
                let both = then.parallel(result);
                if both == ExitMethod::AlwaysEnd {
                    return Ok(Action::Done(ExitMethod::AlwaysEnd));
                }
                (Step::Continue { method: both }, continuation(after))
            }
            Step::Continue { method } => return Ok(Action::Done(method.series(result))),
        };
        frame.step = step;
        Ok(Action::Request(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [ExitMethod; 4] = [
        ExitMethod::Undetermined,
        ExitMethod::AlwaysReturn,
        ExitMethod::Conditional,
        ExitMethod::AlwaysEnd,
    ];

    fn exit_method() -> impl Strategy<Value = ExitMethod> {
        prop::sample::select(ALL.to_vec())
    }

    proptest! {
        #[test]
        fn parallel_absorbs_undetermined(x in exit_method()) {
            prop_assert_eq!(ExitMethod::Undetermined.parallel(x), x);
            prop_assert_eq!(x.parallel(ExitMethod::Undetermined), x);
        }

        #[test]
        fn parallel_is_idempotent(x in exit_method()) {
            prop_assert_eq!(x.parallel(x), x);
        }

        #[test]
        fn parallel_is_commutative(a in exit_method(), b in exit_method()) {
            prop_assert_eq!(a.parallel(b), b.parallel(a));
        }

        #[test]
        fn series_after_return_is_identity(x in exit_method()) {
            prop_assert_eq!(ExitMethod::AlwaysReturn.series(x), x);
        }
    }

    #[test]
    fn parallel_mix_is_conditional() {
        assert_eq!(
            ExitMethod::AlwaysEnd.parallel(ExitMethod::Conditional),
            ExitMethod::Conditional
        );
        assert_eq!(
            ExitMethod::AlwaysEnd.parallel(ExitMethod::AlwaysReturn),
            ExitMethod::Conditional
        );
    }

    #[test]
    fn series_rules() {
        for x in ALL {
            assert_eq!(ExitMethod::Undetermined.series(x), ExitMethod::Undetermined);
        }
        assert_eq!(
            ExitMethod::Conditional.series(ExitMethod::AlwaysEnd),
            ExitMethod::AlwaysEnd
        );
        assert_eq!(
            ExitMethod::Conditional.series(ExitMethod::Undetermined),
            ExitMethod::AlwaysEnd
        );
        assert_eq!(
            ExitMethod::Conditional.series(ExitMethod::AlwaysReturn),
            ExitMethod::Conditional
        );
    }

    #[test]
    fn empty_memory_never_ends() {
        let err = ControlFlowAnalyzer::analyze(&[], 0).unwrap_err();
        assert_eq!(err, AnalyzeError::NoEnd);
    }

    #[test]
    fn long_jump_chains_do_not_exhaust_the_stack() {
        // 0..4000: JMPU b0, <next>
        // 4000: END
        const CHAIN: u32 = 4000;
        let mut code: Vec<u32> = (0..CHAIN)
            .map(|offset| (0x2D << 26) | ((offset + 1) << 10))
            .collect();
        code.push(0x22 << 26);

        let subroutines = ControlFlowAnalyzer::analyze(&code, 0).unwrap();
        let main = &subroutines[&(0, PROGRAM_END)];
        assert_eq!(main.exit_method, ExitMethod::AlwaysEnd);
        assert_eq!(main.labels.len(), CHAIN as usize);
        assert_eq!(main.labels.last(), Some(&CHAIN));
    }

    #[test]
    fn oversized_program_is_rejected() {
        let code = vec![0u32; MAX_PROGRAM_CODE_LENGTH + 1];
        assert!(matches!(
            ControlFlowAnalyzer::analyze(&code, 0),
            Err(AnalyzeError::OutOfRange { .. })
        ));
    }
}
