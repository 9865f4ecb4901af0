//! Instruction sink with labels, locals and static stack-depth tracking.

use std::sync::Arc;

use super::{CodeUnit, HandlerEntry, Instr};
use crate::closure::ClosureLayout;
use crate::types::Type;

/// A forward-referenceable code position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Default)]
struct LabelState {
    pc: Option<usize>,
    /// Stack depth every path into the label must agree on.
    depth: Option<usize>,
}

/// Conditional branch kinds; each pops the tested value.
#[derive(Debug, Clone, Copy)]
pub enum BranchKind {
    Always,
    IfTrue,
    IfFalse,
    IfNull,
}

/// Builds one [`CodeUnit`].
///
/// Depth is `None` after an unconditional transfer until the next label is
/// marked; instructions emitted in that state are unreachable.
pub struct CodeBuilder {
    name: Arc<str>,
    params: Vec<Type>,
    ret: Type,
    layout: Option<Arc<ClosureLayout>>,
    instrs: Vec<Instr>,
    locals: Vec<Type>,
    labels: Vec<LabelState>,
    fixups: Vec<(usize, Label)>,
    handlers: Vec<HandlerEntry>,
    depth: Option<usize>,
    max_depth: usize,
    finally_nesting: usize,
}

impl CodeBuilder {
    pub fn new(
        name: impl Into<Arc<str>>,
        params: Vec<Type>,
        ret: Type,
        layout: Option<Arc<ClosureLayout>>,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            layout,
            instrs: Vec::new(),
            locals: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
            depth: Some(0),
            max_depth: 0,
            finally_nesting: 0,
        }
    }

    pub fn pc(&self) -> usize {
        self.instrs.len()
    }

    pub fn depth(&self) -> Option<usize> {
        self.depth
    }

    pub fn is_reachable(&self) -> bool {
        self.depth.is_some()
    }

    pub fn finally_nesting(&self) -> usize {
        self.finally_nesting
    }

    pub fn declare_local(&mut self, ty: Type) -> u16 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u16
    }

    /// Appends a non-branch instruction.
    ///
    /// # Panics
    ///
    /// Panics on stack underflow.
    pub fn emit(&mut self, instr: Instr) {
        assert!(
            instr.branch_target().is_none(),
            "branches go through CodeBuilder::branch"
        );
        match instr {
            Instr::EnterFinally => self.finally_nesting += 1,
            Instr::EndFinally => {
                assert!(self.finally_nesting > 0, "endfinally without enterfinally");
                self.finally_nesting -= 1;
            }
            _ => {}
        }
        self.apply(&instr);
        if instr.ends_flow() {
            self.depth = None;
        }
        self.instrs.push(instr);
    }

    fn apply(&mut self, instr: &Instr) {
        if let Some(depth) = self.depth {
            let (pops, pushes) = instr.stack_effect();
            assert!(
                depth >= pops,
                "stack underflow emitting {instr:?} at depth {depth} in {}",
                self.name
            );
            let after = depth - pops + pushes;
            self.max_depth = self.max_depth.max(after);
            self.depth = Some(after);
        }
    }

    pub fn define_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    /// Emits a branch to `label`, bound or not.
    pub fn branch(&mut self, kind: BranchKind, label: Label) {
        let target = self.labels[label.0].pc.unwrap_or(usize::MAX);
        let instr = match kind {
            BranchKind::Always => Instr::Br(target),
            BranchKind::IfTrue => Instr::BrTrue(target),
            BranchKind::IfFalse => Instr::BrFalse(target),
            BranchKind::IfNull => Instr::BrNull(target),
        };
        self.apply(&instr);
        if let Some(depth) = self.depth {
            self.merge_depth(label, depth);
        }
        if matches!(kind, BranchKind::Always) {
            self.depth = None;
        }
        if target == usize::MAX {
            self.fixups.push((self.instrs.len(), label));
        }
        self.instrs.push(instr);
    }

    fn merge_depth(&mut self, label: Label, depth: usize) {
        let state = &mut self.labels[label.0];
        match state.depth {
            Some(expected) => assert_eq!(
                expected, depth,
                "control paths reach label {} of {} at different stack depths",
                label.0, self.name
            ),
            None => state.depth = Some(depth),
        }
    }

    /// Binds `label` to the next instruction.
    ///
    /// # Panics
    ///
    /// Panics if the label was already bound or paths disagree on depth.
    pub fn mark(&mut self, label: Label) {
        assert!(
            self.labels[label.0].pc.is_none(),
            "label {} marked twice",
            label.0
        );
        if let Some(depth) = self.depth {
            self.merge_depth(label, depth);
        }
        let pc = self.pc();
        self.labels[label.0].pc = Some(pc);
        self.depth = self.labels[label.0].depth;
        let instrs = &mut self.instrs;
        self.fixups.retain(|(at, l)| {
            if *l == label {
                instrs[*at].set_branch_target(pc);
                false
            } else {
                true
            }
        });
    }

    /// Binds a label that the exception machinery enters at `depth`.
    pub fn mark_entry(&mut self, label: Label, depth: usize) {
        self.merge_depth(label, depth);
        self.mark(label);
    }

    pub fn label_pc(&self, label: Label) -> usize {
        self.labels[label.0]
            .pc
            .expect("label must be marked before its position is used")
    }

    pub fn add_handler(&mut self, entry: HandlerEntry) {
        self.handlers.push(entry);
    }

    /// Links the unit.
    ///
    /// # Panics
    ///
    /// Panics if a branch targets a label that was never marked.
    pub fn finish(self) -> CodeUnit {
        assert!(
            self.fixups.is_empty(),
            "{} branches to unmarked labels in {}",
            self.fixups.len(),
            self.name
        );
        assert_eq!(self.finally_nesting, 0, "unbalanced finally in {}", self.name);
        CodeUnit {
            name: self.name,
            params: self.params,
            ret: self.ret,
            layout: self.layout,
            locals: self.locals,
            instrs: self.instrs,
            handlers: self.handlers,
            max_stack: self.max_depth,
            native: None,
        }
    }
}
