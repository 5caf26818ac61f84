//! Goto elimination and lowering to the abstract syntax list.
//!
//! The recovered CFG is first flattened into a statement tree of labels, code and conditional
//! gotos. Gotos are then removed one by one, innermost last, by moving them outward, inward or
//! lifting them until they sit next to their label, where they become an `if` or a `do`/`while`.
//! Each label owns a boolean goto variable that carries the goto condition across the moves.
//! The goto-free tree is finally lowered to IR blocks and syntax nodes.

use std::collections::HashMap;

use tracing::debug;

use crate::environment::Environment;
use crate::error::{Result, ShaderError};
use crate::ir::{AbstractSyntaxNode, BlockId, IrEmitter, Program, Value};

use super::control_flow::{Cfg, Condition, EndClass, FlowBlockId, FunctionId};
use super::translate::translate;

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    True,
    False,
    Flow(Condition),
    Var(u32),
    Not(Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn not(self) -> Expr {
        match self {
            Expr::True => Expr::False,
            Expr::False => Expr::True,
            Expr::Not(inner) => *inner,
            other => Expr::Not(Box::new(other)),
        }
    }

    fn from_condition(cond: Condition) -> Expr {
        if cond.is_true() {
            Expr::True
        } else if cond.is_false() {
            Expr::False
        } else {
            Expr::Flow(cond)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StmtId(u32);

#[derive(Debug, Clone, PartialEq)]
enum StmtKind {
    Root,
    Label { id: u32 },
    Code { block: FlowBlockId },
    Goto { cond: Expr, label: StmtId },
    If { cond: Expr },
    Loop { cond: Expr },
    Break { cond: Expr },
    SetVariable { id: u32, value: Expr },
    Return,
    Kill,
}

#[derive(Debug, Clone)]
struct Stmt {
    kind: StmtKind,
    up: Option<StmtId>,
    children: Vec<StmtId>,
}

/// Statement tree arena. Ids stay valid while statements move between parents.
struct Tree {
    stmts: Vec<Stmt>,
    root: StmtId,
    next_label: u32,
}

impl Tree {
    fn new() -> Self {
        Self {
            stmts: vec![Stmt {
                kind: StmtKind::Root,
                up: None,
                children: Vec::new(),
            }],
            root: StmtId(0),
            next_label: 0,
        }
    }

    fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }

    fn stmt_mut(&mut self, id: StmtId) -> &mut Stmt {
        &mut self.stmts[id.0 as usize]
    }

    fn kind(&self, id: StmtId) -> &StmtKind {
        &self.stmt(id).kind
    }

    fn up(&self, id: StmtId) -> Result<StmtId> {
        self.stmt(id)
            .up
            .ok_or_else(|| ShaderError::logic("statement has no parent"))
    }

    fn create(&mut self, kind: StmtKind) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(Stmt {
            kind,
            up: None,
            children: Vec::new(),
        });
        id
    }

    fn insert(&mut self, parent: StmtId, index: usize, kind: StmtKind) -> StmtId {
        let id = self.create(kind);
        self.stmt_mut(id).up = Some(parent);
        self.stmt_mut(parent).children.insert(index, id);
        id
    }

    fn push(&mut self, parent: StmtId, kind: StmtKind) -> StmtId {
        let index = self.stmt(parent).children.len();
        self.insert(parent, index, kind)
    }

    /// Replaces the child at `index` of `parent` with a new statement.
    fn replace(&mut self, parent: StmtId, index: usize, kind: StmtKind) -> StmtId {
        let id = self.create(kind);
        self.stmt_mut(id).up = Some(parent);
        let old = std::mem::replace(&mut self.stmt_mut(parent).children[index], id);
        self.stmt_mut(old).up = None;
        id
    }

    fn position(&self, id: StmtId) -> Result<usize> {
        let parent = self.up(id)?;
        self.stmt(parent)
            .children
            .iter()
            .position(|&child| child == id)
            .ok_or_else(|| ShaderError::logic("statement missing from its parent"))
    }

    fn level(&self, mut id: StmtId) -> usize {
        let mut level = 0;
        while let Some(up) = self.stmt(id).up {
            id = up;
            level += 1;
        }
        level
    }

    /// Moves `parent.children[range]` to the end of `new_parent`.
    fn reparent(&mut self, parent: StmtId, range: std::ops::Range<usize>, new_parent: StmtId) {
        let moved: Vec<StmtId> = self.stmt_mut(parent).children.drain(range).collect();
        for &id in &moved {
            self.stmt_mut(id).up = Some(new_parent);
        }
        self.stmt_mut(new_parent).children.extend(moved);
    }

    fn label_id(&self, label: StmtId) -> Result<u32> {
        match self.kind(label) {
            StmtKind::Label { id } => Ok(*id),
            _ => Err(ShaderError::logic("goto target is not a label")),
        }
    }

    fn goto_parts(&self, goto: StmtId) -> Result<(Expr, StmtId)> {
        match self.kind(goto) {
            StmtKind::Goto { cond, label } => Ok((cond.clone(), *label)),
            _ => Err(ShaderError::logic("statement is not a goto")),
        }
    }
}

/// Builds the goto-free tree for the program entry of `cfg` and lowers it into `program`.
pub(crate) fn build_syntax_list(
    program: &mut Program,
    env: &mut dyn Environment,
    cfg: &Cfg,
) -> Result<()> {
    let mut builder = GotoPass {
        cfg,
        tree: Tree::new(),
        gotos: Vec::new(),
        call_stack: Vec::new(),
    };
    builder.build_tree()?;
    let num_gotos = builder.gotos.len();
    for goto in std::mem::take(&mut builder.gotos).into_iter().rev() {
        builder.remove_goto(goto)?;
    }
    debug!(gotos = num_gotos, statements = builder.tree.stmts.len(), "eliminated gotos");

    let tree = builder.tree;
    let mut lowering = Lowering {
        program: &mut *program,
        env: &mut *env,
        cfg,
        tree: &tree,
    };
    let root = tree.root;
    lowering.visit(root, None, None)?;
    program.block_order = program
        .syntax_list
        .iter()
        .filter_map(|node| match node {
            AbstractSyntaxNode::Block(block) => Some(*block),
            _ => None,
        })
        .collect();
    Ok(())
}

struct GotoPass<'c> {
    cfg: &'c Cfg,
    tree: Tree,
    gotos: Vec<StmtId>,
    call_stack: Vec<FunctionId>,
}

impl GotoPass<'_> {
    fn build_tree(&mut self) -> Result<()> {
        if self.cfg.functions().is_empty() {
            return Err(ShaderError::logic("program has no functions"));
        }
        self.visit_function(0, None)?;
        Ok(())
    }

    /// Adds the statements of `function_id` before `end` (or at the end of the root) and returns
    /// the label of its entry block.
    fn visit_function(&mut self, function_id: FunctionId, end: Option<StmtId>) -> Result<StmtId> {
        if self.call_stack.contains(&function_id) {
            return Err(ShaderError::not_implemented("recursive function call"));
        }
        self.call_stack.push(function_id);

        let root = self.tree.root;
        let function = &self.cfg.functions()[function_id];
        let blocks: Vec<FlowBlockId> = function.blocks().collect();
        let entry = function
            .entry_block()
            .ok_or_else(|| ShaderError::logic("function has no entry block"))?;

        let mut labels = HashMap::new();
        for &block in &blocks {
            let id = self.tree.next_label;
            self.tree.next_label += 1;
            let index = match end {
                Some(end) => self.tree.position(end)?,
                None => self.tree.stmt(root).children.len(),
            };
            let label = self.tree.insert(root, index, StmtKind::Label { id });
            labels.insert(block, label);
        }
        let label_of = |block: Option<FlowBlockId>| -> Result<StmtId> {
            block
                .and_then(|block| labels.get(&block).copied())
                .ok_or_else(|| ShaderError::logic("branch to a block outside the function"))
        };

        for &block_id in &blocks {
            let block = self.cfg.block(block_id).clone();
            let label = labels[&block_id];
            let label_var = self.tree.label_id(label)?;
            // Goto variables start false and are cleared again whenever their label is reached.
            self.tree.insert(
                root,
                0,
                StmtKind::SetVariable {
                    id: label_var,
                    value: Expr::False,
                },
            );
            let index = self.tree.position(label)? + 1;
            self.tree.insert(
                root,
                index,
                StmtKind::SetVariable {
                    id: label_var,
                    value: Expr::False,
                },
            );
            let code = self.tree.insert(root, index + 1, StmtKind::Code { block: block_id });
            let mut index = index + 2;

            match block.end_class {
                EndClass::Branch => {
                    if block.cond.is_true() {
                        let target = label_of(block.branch_true)?;
                        self.add_goto(index, Expr::True, target);
                    } else if block.cond.is_false() {
                        let target = label_of(block.branch_false)?;
                        self.add_goto(index, Expr::True, target);
                    } else {
                        let true_target = label_of(block.branch_true)?;
                        let false_target = label_of(block.branch_false)?;
                        self.add_goto(index, Expr::from_condition(block.cond), true_target);
                        self.add_goto(index + 1, Expr::True, false_target);
                    }
                }
                EndClass::Call => {
                    let return_label = label_of(block.return_block)?;
                    let callee = self.visit_function(block.function_call, Some(return_label))?;
                    index = self.tree.position(code)? + 1;
                    self.add_goto(index, Expr::True, callee);
                }
                EndClass::Exit => {
                    self.tree.insert(root, index, StmtKind::Return);
                }
                EndClass::Return => match end {
                    Some(end) => self.add_goto(index, Expr::True, end),
                    None => {
                        self.tree.insert(root, index, StmtKind::Return);
                    }
                },
                EndClass::Kill => {
                    self.tree.insert(root, index, StmtKind::Kill);
                    index += 1;
                    if block.branch_true.is_some() {
                        let target = label_of(block.branch_true)?;
                        self.add_goto(index, Expr::True, target);
                    }
                }
            }
        }
        self.call_stack.pop();
        Ok(labels[&entry])
    }

    fn add_goto(&mut self, index: usize, cond: Expr, label: StmtId) {
        let root = self.tree.root;
        let goto = self.tree.insert(root, index, StmtKind::Goto { cond, label });
        self.gotos.push(goto);
    }

    fn remove_goto(&mut self, mut goto: StmtId) -> Result<()> {
        let (_, label) = self.tree.goto_parts(goto)?;
        while self.is_indirectly_related(goto, label)? {
            goto = self.move_outward(goto)?;
        }
        let label_level = self.tree.level(label);
        let mut goto_level = self.tree.level(goto);
        if goto_level > label_level {
            while goto_level > label_level {
                goto = self.move_outward(goto)?;
                goto_level -= 1;
            }
        } else if goto_level < label_level {
            if self.needs_lift(goto, label)? {
                goto = self.lift(goto)?;
            }
            while goto_level < label_level {
                goto = self.move_inward(goto)?;
                goto_level += 1;
            }
        }
        if self.tree.stmt(goto).up != self.tree.stmt(label).up {
            return Err(ShaderError::logic("goto and label are not siblings after moves"));
        }
        let goto_pos = self.tree.position(goto)?;
        let label_pos = self.tree.position(label)?;
        if label_pos == goto_pos + 1 {
            let parent = self.tree.up(goto)?;
            self.tree.stmt_mut(parent).children.remove(goto_pos);
            self.tree.stmt_mut(goto).up = None;
        } else if goto_pos < label_pos {
            self.eliminate_as_conditional(goto, label_pos)?;
        } else {
            self.eliminate_as_loop(goto, label_pos)?;
        }
        Ok(())
    }

    fn is_indirectly_related(&self, goto: StmtId, label: StmtId) -> Result<bool> {
        let siblings = self.tree.stmt(goto).up == self.tree.stmt(label).up;
        Ok(!siblings && !self.is_directly_related(goto, label)?)
    }

    /// One of the two is nested in a sibling of the other.
    fn is_directly_related(&self, goto: StmtId, label: StmtId) -> Result<bool> {
        let goto_level = self.tree.level(goto);
        let label_level = self.tree.level(label);
        let (min, mut max, min_level, mut max_level) = if label_level < goto_level {
            (label, goto, label_level, goto_level)
        } else {
            (goto, label, goto_level, label_level)
        };
        while max_level > min_level {
            max = self.tree.up(max)?;
            max_level -= 1;
        }
        Ok(self.tree.stmt(min).up == self.tree.stmt(max).up)
    }

    /// Ancestor of `label` that is a sibling of `goto`.
    fn sibling_from_nephew(&self, goto: StmtId, label: StmtId) -> Result<StmtId> {
        let parent = self.tree.up(goto)?;
        let mut nephew = label;
        loop {
            let up = self.tree.up(nephew)?;
            if up == parent {
                return Ok(nephew);
            }
            nephew = up;
        }
    }

    fn needs_lift(&self, goto: StmtId, label: StmtId) -> Result<bool> {
        let sibling = self.sibling_from_nephew(goto, label)?;
        Ok(self.tree.position(goto)? > self.tree.position(sibling)?)
    }

    fn move_outward(&mut self, goto: StmtId) -> Result<StmtId> {
        let parent = self.tree.up(goto)?;
        match self.tree.kind(parent) {
            StmtKind::If { .. } => self.move_outward_if(goto),
            StmtKind::Loop { .. } => self.move_outward_loop(goto),
            _ => Err(ShaderError::logic("goto cannot move out of its parent")),
        }
    }

    fn move_outward_if(&mut self, goto: StmtId) -> Result<StmtId> {
        let (cond, label) = self.tree.goto_parts(goto)?;
        let id = self.tree.label_id(label)?;
        let parent = self.tree.up(goto)?;
        let index = self.tree.position(goto)?;
        self.tree.replace(parent, index, StmtKind::SetVariable { id, value: cond });

        let len = self.tree.stmt(parent).children.len();
        if index + 1 < len {
            let skip = self.tree.create(StmtKind::If {
                cond: Expr::Var(id).not(),
            });
            self.tree.reparent(parent, index + 1..len, skip);
            self.tree.stmt_mut(skip).up = Some(parent);
            self.tree.stmt_mut(parent).children.push(skip);
        }
        self.insert_goto_after(parent, Expr::Var(id), label)
    }

    fn move_outward_loop(&mut self, goto: StmtId) -> Result<StmtId> {
        let (cond, label) = self.tree.goto_parts(goto)?;
        let id = self.tree.label_id(label)?;
        let parent = self.tree.up(goto)?;
        let index = self.tree.position(goto)?;
        self.tree.replace(parent, index, StmtKind::SetVariable { id, value: cond });
        self.tree
            .insert(parent, index + 1, StmtKind::Break { cond: Expr::Var(id) });
        self.insert_goto_after(parent, Expr::Var(id), label)
    }

    fn insert_goto_after(&mut self, stmt: StmtId, cond: Expr, label: StmtId) -> Result<StmtId> {
        let grandparent = self.tree.up(stmt)?;
        let index = self.tree.position(stmt)? + 1;
        Ok(self.tree.insert(grandparent, index, StmtKind::Goto { cond, label }))
    }

    fn move_inward(&mut self, goto: StmtId) -> Result<StmtId> {
        let (cond, label) = self.tree.goto_parts(goto)?;
        let id = self.tree.label_id(label)?;
        let parent = self.tree.up(goto)?;
        let nested = self.sibling_from_nephew(goto, label)?;
        let index = self.tree.position(goto)?;
        self.tree.replace(parent, index, StmtKind::SetVariable { id, value: cond });

        let nested_index = self.tree.position(nested)?;
        if nested_index > index + 1 {
            let skip = self.tree.create(StmtKind::If {
                cond: Expr::Var(id).not(),
            });
            self.tree.reparent(parent, index + 1..nested_index, skip);
            self.tree.stmt_mut(skip).up = Some(parent);
            self.tree.stmt_mut(parent).children.insert(index + 1, skip);
        }
        match &mut self.tree.stmt_mut(nested).kind {
            StmtKind::If { cond } => {
                let old = std::mem::replace(cond, Expr::True);
                *cond = Expr::Or(Box::new(Expr::Var(id)), Box::new(old));
            }
            StmtKind::Loop { .. } => {}
            _ => return Err(ShaderError::logic("goto moved inward into a non-scope statement")),
        }
        Ok(self.tree.insert(nested, 0, StmtKind::Goto { cond: Expr::Var(id), label }))
    }

    /// Wraps everything from the sibling holding the label up to the goto in a loop, so the goto
    /// comes before its label.
    fn lift(&mut self, goto: StmtId) -> Result<StmtId> {
        let (cond, label) = self.tree.goto_parts(goto)?;
        let id = self.tree.label_id(label)?;
        let parent = self.tree.up(goto)?;
        let nested = self.sibling_from_nephew(goto, label)?;
        let nested_index = self.tree.position(nested)?;
        let goto_index = self.tree.position(goto)?;

        let loop_stmt = self.tree.create(StmtKind::Loop { cond: Expr::Var(id) });
        self.tree.reparent(parent, nested_index..goto_index, loop_stmt);
        self.sanitize_no_breaks(loop_stmt)?;

        let head = StmtKind::Goto {
            cond: Expr::Var(id),
            label,
        };
        let new_goto = self.tree.insert(loop_stmt, 0, head);
        self.tree.push(loop_stmt, StmtKind::SetVariable { id, value: cond });

        // The goto now sits where the lifted range started.
        let slot = &mut self.tree.stmt_mut(parent).children[nested_index];
        let old = std::mem::replace(slot, loop_stmt);
        self.tree.stmt_mut(old).up = None;
        self.tree.stmt_mut(loop_stmt).up = Some(parent);
        Ok(new_goto)
    }

    fn eliminate_as_conditional(&mut self, goto: StmtId, label_index: usize) -> Result<()> {
        let (cond, _) = self.tree.goto_parts(goto)?;
        let parent = self.tree.up(goto)?;
        let goto_index = self.tree.position(goto)?;
        let body = self.tree.create(StmtKind::If { cond: cond.not() });
        self.tree.reparent(parent, goto_index + 1..label_index, body);
        let old = std::mem::replace(&mut self.tree.stmt_mut(parent).children[goto_index], body);
        self.tree.stmt_mut(old).up = None;
        self.tree.stmt_mut(body).up = Some(parent);
        Ok(())
    }

    fn eliminate_as_loop(&mut self, goto: StmtId, label_index: usize) -> Result<()> {
        let (cond, _) = self.tree.goto_parts(goto)?;
        let parent = self.tree.up(goto)?;
        let goto_index = self.tree.position(goto)?;
        let body = self.tree.create(StmtKind::Loop { cond });
        self.tree.reparent(parent, label_index..goto_index, body);
        self.sanitize_no_breaks(body)?;
        let old = std::mem::replace(&mut self.tree.stmt_mut(parent).children[label_index], body);
        self.tree.stmt_mut(old).up = None;
        self.tree.stmt_mut(body).up = Some(parent);
        Ok(())
    }

    /// A break inside a freshly built loop would now leave the wrong loop.
    fn sanitize_no_breaks(&self, scope: StmtId) -> Result<()> {
        for &child in &self.tree.stmt(scope).children {
            match self.tree.kind(child) {
                StmtKind::Break { .. } => {
                    let message = "break statement inside a lifted loop";
                    return Err(ShaderError::not_implemented(message));
                }
                StmtKind::If { .. } => self.sanitize_no_breaks(child)?,
                _ => {}
            }
        }
        Ok(())
    }
}

struct Lowering<'a, 'e> {
    program: &'a mut Program,
    env: &'e mut dyn Environment,
    cfg: &'a Cfg,
    tree: &'a Tree,
}

impl Lowering<'_, '_> {
    fn merge_block(&mut self, current: Option<BlockId>) -> BlockId {
        let block = self.program.new_block();
        if let Some(current) = current {
            self.program.add_branch(current, block);
        }
        self.program.syntax_list.push(AbstractSyntaxNode::Block(block));
        block
    }

    fn ensure_block(&mut self, current: &mut Option<BlockId>) -> BlockId {
        match *current {
            Some(block) => block,
            None => {
                let block = self.program.new_block();
                self.program.syntax_list.push(AbstractSyntaxNode::Block(block));
                *current = Some(block);
                block
            }
        }
    }

    fn expr(&mut self, block: BlockId, expr: &Expr) -> Value {
        match expr {
            Expr::True => Value::U1(true),
            Expr::False => Value::U1(false),
            Expr::Flow(cond) => {
                IrEmitter::new(self.program, block).get_pred(cond.pred, cond.negated)
            }
            Expr::Var(id) => IrEmitter::new(self.program, block).get_goto_variable(*id),
            Expr::Not(inner) => {
                let value = self.expr(block, inner);
                IrEmitter::new(self.program, block).logical_not(value)
            }
            Expr::Or(a, b) => {
                let a = self.expr(block, a);
                let b = self.expr(block, b);
                IrEmitter::new(self.program, block).logical_or(a, b)
            }
        }
    }

    fn condition_ref(&mut self, block: BlockId, expr: &Expr) -> Value {
        let value = self.expr(block, expr);
        IrEmitter::new(self.program, block).condition_ref(value)
    }

    /// Lowers the children of `parent`. `current` is the block being appended to, if any.
    fn visit(
        &mut self,
        parent: StmtId,
        break_block: Option<BlockId>,
        fallthrough: Option<BlockId>,
    ) -> Result<()> {
        let mut current: Option<BlockId> = None;
        if parent != self.tree.root {
            self.ensure_block(&mut current);
        }
        let tree = self.tree;
        for &stmt in &tree.stmt(parent).children {
            match tree.kind(stmt) {
                StmtKind::Root | StmtKind::Label { .. } => {}
                StmtKind::Goto { .. } => {
                    return Err(ShaderError::logic("goto left after goto elimination"));
                }
                StmtKind::Code { block } => {
                    let flow = self.cfg.block(*block);
                    if flow.begin != flow.end {
                        let ir_block = self.ensure_block(&mut current);
                        translate(self.env, self.program, ir_block, flow.begin, flow.end)?;
                    }
                }
                StmtKind::SetVariable { id, value } => {
                    let block = self.ensure_block(&mut current);
                    let value = self.expr(block, value);
                    IrEmitter::new(self.program, block).set_goto_variable(*id, value);
                }
                StmtKind::If { cond } => {
                    let block = self.ensure_block(&mut current);
                    let cond = self.condition_ref(block, cond);
                    let merge = self.program.new_block();
                    let body_index = self.program.syntax_list.len() + 1;
                    self.program.syntax_list.push(AbstractSyntaxNode::If {
                        cond,
                        body: merge,
                        merge,
                    });
                    self.visit(stmt, break_block, Some(merge))?;
                    let body = match self.program.syntax_list.get(body_index) {
                        Some(AbstractSyntaxNode::Block(body)) => *body,
                        _ => return Err(ShaderError::logic("if statement without a body block")),
                    };
                    if let Some(AbstractSyntaxNode::If { body: slot, .. }) =
                        self.program.syntax_list.get_mut(body_index - 1)
                    {
                        *slot = body;
                    }
                    self.program.add_branch(block, body);
                    self.program.add_branch(block, merge);
                    self.program.syntax_list.push(AbstractSyntaxNode::EndIf { merge });
                    self.program.syntax_list.push(AbstractSyntaxNode::Block(merge));
                    current = Some(merge);
                }
                StmtKind::Loop { cond } => {
                    // The header needs a dedicated predecessor for loop entry values.
                    let entry = self.ensure_block(&mut current);
                    let header = self.program.new_block();
                    self.program.add_branch(entry, header);
                    self.program.syntax_list.push(AbstractSyntaxNode::Block(header));

                    let continue_block = self.program.new_block();
                    let merge = self.program.new_block();
                    let loop_index = self.program.syntax_list.len();
                    self.program.syntax_list.push(AbstractSyntaxNode::Loop {
                        body: header,
                        continue_block,
                        merge,
                    });
                    self.visit(stmt, Some(merge), Some(continue_block))?;
                    let body = match self.program.syntax_list.get(loop_index + 1) {
                        Some(AbstractSyntaxNode::Block(body)) => *body,
                        _ => return Err(ShaderError::logic("loop statement without a body block")),
                    };
                    if let Some(AbstractSyntaxNode::Loop { body: slot, .. }) =
                        self.program.syntax_list.get_mut(loop_index)
                    {
                        *slot = body;
                    }
                    self.program.add_branch(header, body);

                    self.program.syntax_list.push(AbstractSyntaxNode::Block(continue_block));
                    let cond = self.condition_ref(continue_block, cond);
                    self.program.syntax_list.push(AbstractSyntaxNode::Repeat {
                        cond,
                        loop_header: header,
                        merge,
                    });
                    self.program.add_branch(continue_block, header);
                    self.program.add_branch(continue_block, merge);
                    self.program.syntax_list.push(AbstractSyntaxNode::Block(merge));
                    current = Some(merge);
                }
                StmtKind::Break { cond } => {
                    let break_target =
                        break_block.ok_or_else(|| ShaderError::logic("break outside of a loop"))?;
                    let block = self.ensure_block(&mut current);
                    let cond = self.condition_ref(block, cond);
                    let skip = self.program.new_block();
                    self.program.add_branch(block, break_target);
                    self.program.add_branch(block, skip);
                    self.program.syntax_list.push(AbstractSyntaxNode::Break {
                        cond,
                        merge: break_target,
                        skip,
                    });
                    self.program.syntax_list.push(AbstractSyntaxNode::Block(skip));
                    current = Some(skip);
                }
                StmtKind::Return => {
                    let block = self.ensure_block(&mut current);
                    let return_block = self.program.new_block();
                    self.program.add_branch(block, return_block);
                    self.program.syntax_list.push(AbstractSyntaxNode::Block(return_block));
                    self.program.syntax_list.push(AbstractSyntaxNode::Return);
                    current = None;
                }
                StmtKind::Kill => {
                    let block = self.ensure_block(&mut current);
                    IrEmitter::new(self.program, block).demote_to_helper_invocation();
                    current = Some(self.merge_block(Some(block)));
                }
            }
        }
        match (current, fallthrough) {
            (Some(current), Some(fallthrough)) => self.program.add_branch(current, fallthrough),
            (Some(_), None) => self.program.syntax_list.push(AbstractSyntaxNode::Unreachable),
            (None, _) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negation_folds_constants_and_double_nots() {
        assert_eq!(Expr::True.not(), Expr::False);
        assert_eq!(Expr::Var(3).not().not(), Expr::Var(3));
    }

    #[test]
    fn lift_wraps_range_before_goto_in_a_loop() {
        let cfg = Cfg::empty_for_tests();
        let mut pass = GotoPass {
            cfg: &cfg,
            tree: Tree::new(),
            gotos: Vec::new(),
            call_stack: Vec::new(),
        };
        let root = pass.tree.root;
        let scope = pass.tree.push(root, StmtKind::If { cond: Expr::Var(9) });
        let label = pass.tree.push(scope, StmtKind::Label { id: 0 });
        let goto = pass.tree.push(
            root,
            StmtKind::Goto {
                cond: Expr::Var(1),
                label,
            },
        );
        pass.remove_goto(goto).unwrap();
        let children = &pass.tree.stmt(root).children;
        assert_eq!(children.len(), 1);
        assert!(matches!(pass.tree.kind(children[0]), StmtKind::Loop { cond: Expr::Var(0) }));
    }
}
