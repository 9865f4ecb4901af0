//! Stack-machine instruction set.

use std::fmt;
use std::sync::Arc;

use crate::closure::ClosureLayout;
use crate::node::{ArithOp, CmpOp};
use crate::types::{CtorRef, IndexerRef, MethodRef, PropertyDef, StaticDef, Type};
use crate::value::{Overflow, Value};

/// One VM instruction. Branch targets are instruction indices.
#[derive(Clone)]
pub enum Instr {
    Nop,
    /// Pushes an immediate.
    Const(Value),
    LoadArg(u16),
    StoreArg(u16),
    LoadArgAddr(u16),
    LoadLocal(u16),
    StoreLocal(u16),
    LoadLocalAddr(u16),
    /// Reads a field of the fixed-arity closure in argument 0.
    LoadClosureField(u16),
    StoreClosureField(u16),
    /// Reads an item of the indexed closure in argument 0; untyped.
    LoadClosureItem(u16),
    StoreClosureItem(u16),
    LoadClosureAddr(u16),
    Unbox(Type),
    CastClass(Type),
    Dup,
    Pop,
    Arith { op: ArithOp, overflow: Overflow },
    Neg(Overflow),
    Not,
    Cmp(CmpOp),
    GenericEq,
    Concat,
    Conv { to: Type, overflow: Overflow },
    UnwrapNullable,
    ArrayLen,
    Br(usize),
    BrTrue(usize),
    BrFalse(usize),
    BrNull(usize),
    /// Calls a host method; instance methods take the receiver below the args.
    Call(MethodRef),
    /// Calls the function value below `argc` arguments.
    CallIndirect { argc: u16, returns: bool },
    NewObject(CtorRef),
    NewArrayInit { elem: Type, count: u16 },
    NewArrayLen(Type),
    LoadElem,
    StoreElem,
    LoadElemAddr,
    LoadField(usize),
    StoreField(usize),
    LoadFieldAddr(usize),
    GetProperty(Arc<PropertyDef>),
    SetProperty(Arc<PropertyDef>),
    LoadStatic(Arc<StaticDef>),
    StoreStatic(Arc<StaticDef>),
    GetIndex(IndexerRef),
    SetIndex(IndexerRef),
    /// Stores the top value through the address below it.
    StoreIndirect,
    LoadDefault(Type),
    /// Builds a closure from the top `layout.len()` values.
    NewClosure(Arc<ClosureLayout>),
    /// Binds a closure to the compiled unit below it.
    Curry,
    Throw,
    /// Opens a finally body reached without an exception.
    EnterFinally,
    /// Closes a finally body; rethrows a pending exception.
    EndFinally,
    Ret,
}

impl Instr {
    /// `(pops, pushes)` of the instruction.
    pub fn stack_effect(&self) -> (usize, usize) {
        use Instr::*;
        match self {
            Nop | Br(_) | EnterFinally | EndFinally => (0, 0),
            Const(_) | LoadArg(_) | LoadArgAddr(_) | LoadLocal(_) | LoadLocalAddr(_) => (0, 1),
            LoadClosureField(_) | LoadClosureItem(_) | LoadClosureAddr(_) => (0, 1),
            LoadStatic(_) | LoadDefault(_) => (0, 1),
            StoreArg(_) | StoreLocal(_) | StoreClosureField(_) | StoreClosureItem(_) => (1, 0),
            StoreStatic(_) | Pop | Throw | Ret => (1, 0),
            BrTrue(_) | BrFalse(_) | BrNull(_) => (1, 0),
            Unbox(_) | CastClass(_) | Neg(_) | Not | Conv { .. } | UnwrapNullable | ArrayLen => {
                (1, 1)
            }
            LoadField(_) | LoadFieldAddr(_) | GetProperty(_) | NewArrayLen(_) => (1, 1),
            Dup => (1, 2),
            Arith { .. } | Cmp(_) | GenericEq | Concat | LoadElem | LoadElemAddr | Curry => (2, 1),
            StoreField(_) | SetProperty(_) | StoreIndirect => (2, 0),
            StoreElem => (3, 0),
            Call(method) => {
                let receiver = usize::from(!method.is_static());
                let returns = usize::from(!method.ret.is_void());
                (method.params.len() + receiver, returns)
            }
            CallIndirect { argc, returns } => (*argc as usize + 1, usize::from(*returns)),
            NewObject(ctor) => (ctor.params.len(), 1),
            NewArrayInit { count, .. } => (*count as usize, 1),
            GetIndex(indexer) => (indexer.params.len() + 1, 1),
            SetIndex(indexer) => (indexer.params.len() + 2, 0),
            NewClosure(layout) => (layout.len(), 1),
        }
    }

    /// Target of a branch instruction.
    pub fn branch_target(&self) -> Option<usize> {
        match self {
            Instr::Br(t) | Instr::BrTrue(t) | Instr::BrFalse(t) | Instr::BrNull(t) => Some(*t),
            _ => None,
        }
    }

    /// True if execution never continues with the next instruction.
    pub fn ends_flow(&self) -> bool {
        matches!(self, Instr::Br(_) | Instr::Throw | Instr::Ret)
    }

    pub(crate) fn set_branch_target(&mut self, target: usize) {
        match self {
            Instr::Br(t) | Instr::BrTrue(t) | Instr::BrFalse(t) | Instr::BrNull(t) => *t = target,
            other => panic!("{other:?} is not a branch"),
        }
    }
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instr::*;
        match self {
            Nop => write!(f, "nop"),
            Const(v) => write!(f, "const {v:?}"),
            LoadArg(i) => write!(f, "ldarg {i}"),
            StoreArg(i) => write!(f, "starg {i}"),
            LoadArgAddr(i) => write!(f, "ldarga {i}"),
            LoadLocal(i) => write!(f, "ldloc {i}"),
            StoreLocal(i) => write!(f, "stloc {i}"),
            LoadLocalAddr(i) => write!(f, "ldloca {i}"),
            LoadClosureField(i) => write!(f, "ldclo.fld {i}"),
            StoreClosureField(i) => write!(f, "stclo.fld {i}"),
            LoadClosureItem(i) => write!(f, "ldclo.item {i}"),
            StoreClosureItem(i) => write!(f, "stclo.item {i}"),
            LoadClosureAddr(i) => write!(f, "ldclo.addr {i}"),
            Unbox(t) => write!(f, "unbox {t}"),
            CastClass(t) => write!(f, "castclass {t}"),
            Dup => write!(f, "dup"),
            Pop => write!(f, "pop"),
            Arith { op, overflow } => write!(f, "{op:?} {overflow:?}"),
            Neg(overflow) => write!(f, "neg {overflow:?}"),
            Not => write!(f, "not"),
            Cmp(op) => write!(f, "cmp {op:?}"),
            GenericEq => write!(f, "eq.generic"),
            Concat => write!(f, "concat"),
            Conv { to, overflow } => write!(f, "conv {to} {overflow:?}"),
            UnwrapNullable => write!(f, "unwrap"),
            ArrayLen => write!(f, "ldlen"),
            Br(t) => write!(f, "br {t}"),
            BrTrue(t) => write!(f, "brtrue {t}"),
            BrFalse(t) => write!(f, "brfalse {t}"),
            BrNull(t) => write!(f, "brnull {t}"),
            Call(m) => write!(f, "call {m:?}"),
            CallIndirect { argc, .. } => write!(f, "calli {argc}"),
            NewObject(c) => write!(f, "newobj {c:?}"),
            NewArrayInit { elem, count } => write!(f, "newarr {elem}[{count}] init"),
            NewArrayLen(elem) => write!(f, "newarr {elem}"),
            LoadElem => write!(f, "ldelem"),
            StoreElem => write!(f, "stelem"),
            LoadElemAddr => write!(f, "ldelema"),
            LoadField(i) => write!(f, "ldfld {i}"),
            StoreField(i) => write!(f, "stfld {i}"),
            LoadFieldAddr(i) => write!(f, "ldflda {i}"),
            GetProperty(p) => write!(f, "get {}", p.name),
            SetProperty(p) => write!(f, "set {}", p.name),
            LoadStatic(s) => write!(f, "ldsfld {}", s.name),
            StoreStatic(s) => write!(f, "stsfld {}", s.name),
            GetIndex(ix) => write!(f, "getidx {ix:?}"),
            SetIndex(ix) => write!(f, "setidx {ix:?}"),
            StoreIndirect => write!(f, "stind"),
            LoadDefault(t) => write!(f, "default {t}"),
            NewClosure(layout) => write!(f, "newclosure {}", layout.len()),
            Curry => write!(f, "curry"),
            Throw => write!(f, "throw"),
            EnterFinally => write!(f, "enterfinally"),
            EndFinally => write!(f, "endfinally"),
            Ret => write!(f, "ret"),
        }
    }
}
