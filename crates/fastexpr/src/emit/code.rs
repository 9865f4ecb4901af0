//! Linked compiled units.

use std::fmt;
use std::sync::Arc;

use super::Instr;
use crate::closure::ClosureLayout;
use crate::jit::NativeCode;
use crate::types::Type;

/// What a protected region does with an exception.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerKind {
    /// Jump to the handler with the exception pushed, if it matches.
    Catch(Type),
    /// Run the finally body, then rethrow.
    Finally,
}

/// One exception-table entry covering instructions `start..end`.
///
/// Entries are ordered inner-first; the first covering entry that accepts
/// the exception wins.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    pub start: usize,
    pub end: usize,
    pub kind: HandlerKind,
    pub target: usize,
    /// Evaluation-stack depth at region entry.
    pub stack_depth: usize,
    /// Number of finally bodies already executing at region entry.
    pub finally_depth: usize,
}

impl HandlerEntry {
    pub fn covers(&self, pc: usize) -> bool {
        self.start <= pc && pc < self.end
    }

    /// Depth at the handler's first instruction.
    pub fn entry_depth(&self) -> usize {
        match self.kind {
            HandlerKind::Catch(_) => self.stack_depth + 1,
            HandlerKind::Finally => self.stack_depth,
        }
    }
}

/// A compiled, linked unit of bytecode.
pub struct CodeUnit {
    pub(crate) name: Arc<str>,
    pub(crate) params: Vec<Type>,
    pub(crate) ret: Type,
    pub(crate) layout: Option<Arc<ClosureLayout>>,
    pub(crate) locals: Vec<Type>,
    pub(crate) instrs: Vec<Instr>,
    pub(crate) handlers: Vec<HandlerEntry>,
    pub(crate) max_stack: usize,
    pub(crate) native: Option<NativeCode>,
}

impl CodeUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Formal parameter types, excluding the closure.
    pub fn params(&self) -> &[Type] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn ret(&self) -> &Type {
        &self.ret
    }

    /// True if argument 0 is the unit's closure.
    pub fn has_closure(&self) -> bool {
        self.layout.is_some()
    }

    pub fn layout(&self) -> Option<&Arc<ClosureLayout>> {
        self.layout.as_ref()
    }

    pub fn locals(&self) -> &[Type] {
        &self.locals
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn handlers(&self) -> &[HandlerEntry] {
        &self.handlers
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    pub fn native(&self) -> Option<&NativeCode> {
        self.native.as_ref()
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    pub(crate) fn install_native(&mut self, code: NativeCode) {
        self.native = Some(code);
    }

    /// Stack depth before each instruction, `None` where unreachable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn stack_depths(&self) -> Result<Vec<Option<usize>>, String> {
        let mut depths: Vec<Option<usize>> = vec![None; self.instrs.len()];
        let mut work = vec![(0usize, 0usize)];
        work.extend(self.handlers.iter().map(|h| (h.target, h.entry_depth())));

        while let Some((pc, depth)) = work.pop() {
            let instr = self
                .instrs
                .get(pc)
                .ok_or_else(|| format!("control reaches {pc} past the end"))?;
            match depths[pc] {
                Some(seen) if seen == depth => continue,
                Some(seen) => {
                    return Err(format!(
                        "depth {depth} at {pc} ({instr:?}) disagrees with {seen}"
                    ))
                }
                None => depths[pc] = Some(depth),
            }
            let (pops, pushes) = instr.stack_effect();
            if depth < pops {
                return Err(format!("stack underflow at {pc} ({instr:?})"));
            }
            let after = depth - pops + pushes;
            if let Instr::Ret = instr {
                if depth != 1 {
                    return Err(format!("return at {pc} with depth {depth}"));
                }
            }
            if let Some(target) = instr.branch_target() {
                work.push((target, after));
            }
            if !instr.ends_flow() {
                work.push((pc + 1, after));
            }
        }
        Ok(depths)
    }

    /// Re-checks the stack discipline of the linked unit.
    pub fn verify(&self) -> Result<(), String> {
        self.stack_depths().map(|_| ())
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "unit {} ({} params, {} locals)", self.name, self.params.len(), self.locals.len())?;
        for (pc, instr) in self.instrs.iter().enumerate() {
            writeln!(f, "  {pc:4}: {instr:?}")?;
        }
        for h in &self.handlers {
            writeln!(f, "  .try {}..{} {:?} -> {}", h.start, h.end, h.kind, h.target)?;
        }
        Ok(())
    }
}
