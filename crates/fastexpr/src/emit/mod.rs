//! Code emitter: translates an analysed tree into one [`CodeUnit`].
//!
//! Emission is a recursive descent over [`Shape`]. Every node leaves exactly
//! its value on the evaluation stack, or nothing when the value is void or
//! discarded; [`CodeBuilder`] asserts that all paths into a label agree on the
//! stack depth. A unit with captures receives its closure as argument 0 and
//! addresses items only through [`ClosureLayout::slot`].
//!
//! Any construct without a compiled form returns [`NotSupported`] and the
//! partially built unit is dropped.

mod builder;
mod code;
mod instr;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use crate::closure::{is_immediate, ClosureInfo, ClosureLayout, ClosureStrategy, ItemKind};
use crate::error::NotSupported;
use crate::node::{
    ArithOp, ArrayInit, Binding, CatchBlock, CmpOp, ExpressionNode, LogicalOp, Param, Shape,
    UnaryOp,
};
use crate::types::{resolve_operator, Member, MethodRef, Operator, Type};
use crate::value::ops::{plan_conversion, ConvStep};
use crate::value::{Overflow, Value};

pub use builder::{BranchKind, CodeBuilder, Label};
pub use code::{CodeUnit, HandlerEntry, HandlerKind};
pub use instr::Instr;

/// Whether the enclosing expression consumes a node's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
    Value,
    Discard,
}

/// Storage of a parameter or variable as seen from the current unit.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Arg(u16),
    Local(u16),
    Closure(u16),
}

/// Emits `body` as a unit taking `params` and returning `ret`.
///
/// `layout` must be the layout built from `info`, present exactly when the
/// unit has captures.
pub(crate) fn emit_unit<N: ExpressionNode>(
    name: &str,
    body: &N,
    params: &[Param],
    ret: &Type,
    info: &ClosureInfo,
    layout: Option<Arc<ClosureLayout>>,
) -> Result<CodeUnit, NotSupported> {
    let param_types = params.iter().map(|p| p.ty().clone()).collect();
    let mut emitter = Emitter {
        b: CodeBuilder::new(name, param_types, ret.clone(), layout.clone()),
        params,
        info,
        layout,
        scopes: Vec::new(),
        catch_locals: Vec::new(),
    };
    if ret.is_void() {
        emitter.emit(body, Usage::Discard)?;
        emitter.b.emit(Instr::Const(Value::Null));
    } else {
        emitter.emit_as(body, ret, Usage::Value)?;
    }
    emitter.b.emit(Instr::Ret);
    Ok(emitter.b.finish())
}

fn layout_item(found: Option<usize>, what: impl fmt::Debug) -> usize {
    found.unwrap_or_else(|| panic!("closure layout mismatch: {what:?} was not analysed"))
}

fn too_many(what: &str) -> NotSupported {
    NotSupported::construct(format!("more than {} {what}", u16::MAX))
}

struct Emitter<'a> {
    b: CodeBuilder,
    params: &'a [Param],
    info: &'a ClosureInfo,
    layout: Option<Arc<ClosureLayout>>,
    /// Block and catch variables, innermost last.
    scopes: Vec<Vec<(Param, u16)>>,
    /// Hidden locals holding the exception of each enclosing catch body.
    catch_locals: Vec<u16>,
}

impl Emitter<'_> {
    fn layout(&self) -> &ClosureLayout {
        self.layout
            .as_deref()
            .expect("closure layout mismatch: unit has no closure")
    }

    fn emit<N: ExpressionNode>(&mut self, node: &N, usage: Usage) -> Result<(), NotSupported> {
        let ty = node.ty().clone();
        if usage == Usage::Value && ty.is_void() {
            return Err(NotSupported::construct("void expression used as a value"));
        }
        match node.shape() {
            Shape::Constant(value) => {
                if usage == Usage::Value {
                    self.emit_constant(node, value);
                }
                return Ok(());
            }
            Shape::Parameter(param) => {
                let slot = self.resolve(&param)?;
                if usage == Usage::Value {
                    self.load_slot(slot, param.ty());
                }
                return Ok(());
            }
            Shape::Convert {
                operand,
                checked,
                method,
            } => self.emit_convert(&operand, &ty, checked, method)?,
            Shape::ArrayIndex { array, index } => {
                self.emit(&array, Usage::Value)?;
                self.emit(&index, Usage::Value)?;
                self.b.emit(Instr::LoadElem);
            }
            Shape::Call {
                receiver,
                method,
                args,
            } => {
                match &receiver {
                    Some(receiver) if !method.is_static() => self.emit_receiver(receiver)?,
                    None if method.is_static() => {}
                    _ => {
                        return Err(NotSupported::construct(format!(
                            "receiver mismatch calling {method:?}"
                        )))
                    }
                }
                self.emit_all(&args)?;
                self.b.emit(Instr::Call(method));
            }
            Shape::MemberAccess { receiver, member } => {
                self.emit_member_load(receiver.as_ref(), &member)?
            }
            Shape::New { ctor, args } => {
                self.emit_all(&args)?;
                self.b.emit(Instr::NewObject(ctor));
            }
            Shape::NewArray { elem, init } => match init {
                ArrayInit::Items(items) => {
                    let count = u16::try_from(items.len()).map_err(|_| too_many("array items"))?;
                    self.emit_all(&items)?;
                    self.b.emit(Instr::NewArrayInit { elem, count });
                }
                ArrayInit::Length(length) => {
                    self.emit(&length, Usage::Value)?;
                    self.b.emit(Instr::NewArrayLen(elem));
                }
            },
            Shape::MemberInit { new, bindings } => {
                return self.emit_member_init(&new, &bindings, usage)
            }
            Shape::Lambda { .. } => {
                if usage == Usage::Value {
                    self.emit_lambda_ref(node)?;
                }
                return Ok(());
            }
            Shape::Invoke { target, args } => {
                let argc = u16::try_from(args.len()).map_err(|_| too_many("arguments"))?;
                self.emit(&target, Usage::Value)?;
                self.emit_all(&args)?;
                self.b.emit(Instr::CallIndirect {
                    argc,
                    returns: !ty.is_void(),
                });
            }
            Shape::Comparison {
                op,
                left,
                right,
                method,
            } => self.emit_comparison(op, &left, &right, method)?,
            Shape::Arithmetic {
                op,
                left,
                right,
                checked,
                method,
            } => self.emit_arithmetic(op, &left, &right, checked, method)?,
            Shape::Unary {
                op,
                operand,
                checked,
            } => self.emit_unary(op, &operand, checked)?,
            Shape::Logical { op, left, right } => self.emit_logical(op, &left, &right)?,
            Shape::Coalesce { left, right } => self.emit_coalesce(&ty, &left, &right)?,
            Shape::Conditional {
                test,
                if_true,
                if_false,
            } => return self.emit_conditional(&ty, &test, &if_true, &if_false, usage),
            Shape::Assign { target, value } => return self.emit_assign(&target, &value, usage),
            Shape::Block { variables, body } => {
                return self.emit_block(&variables, &body, &ty, usage)
            }
            Shape::Try {
                body,
                handlers,
                finally,
            } => return self.emit_try(&ty, &body, &handlers, finally.as_ref(), usage),
            Shape::Throw { operand } => return self.emit_throw(operand.as_ref()),
            Shape::Default => {
                if usage == Usage::Value && !ty.is_void() {
                    self.b.emit(Instr::LoadDefault(ty));
                }
                return Ok(());
            }
            Shape::Index {
                receiver,
                indexer,
                args,
            } => {
                self.emit_receiver(&receiver)?;
                self.emit_all(&args)?;
                self.b.emit(Instr::GetIndex(indexer));
            }
        }
        self.settle(usage, &ty)
    }

    /// Emits `node` where a value of type `ty` is expected. A void node in
    /// value position yields the default of `ty`.
    fn emit_as<N: ExpressionNode>(
        &mut self,
        node: &N,
        ty: &Type,
        usage: Usage,
    ) -> Result<(), NotSupported> {
        if usage == Usage::Value && node.ty().is_void() && !ty.is_void() {
            self.emit(node, Usage::Discard)?;
            self.b.emit(Instr::LoadDefault(ty.clone()));
            Ok(())
        } else {
            self.emit(node, usage)
        }
    }

    fn emit_all<N: ExpressionNode>(&mut self, nodes: &[N]) -> Result<(), NotSupported> {
        nodes.iter().try_for_each(|n| self.emit(n, Usage::Value))
    }

    /// Drops a produced value the enclosing expression does not consume.
    fn settle(&mut self, usage: Usage, ty: &Type) -> Result<(), NotSupported> {
        if usage == Usage::Discard && !ty.is_void() {
            self.b.emit(Instr::Pop);
        }
        Ok(())
    }

    fn resolve(&self, param: &Param) -> Result<Slot, NotSupported> {
        let local = self
            .scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(p, _)| p == param);
        if let Some((_, index)) = local {
            return Ok(Slot::Local(*index));
        }
        if let Some(i) = self.params.iter().position(|p| p == param) {
            let shift = usize::from(self.layout.is_some());
            return Ok(Slot::Arg((i + shift) as u16));
        }
        match (self.info.param_index(param), &self.layout) {
            (Some(i), Some(layout)) => Ok(Slot::Closure(layout.slot(ItemKind::Param, i))),
            _ => Err(NotSupported::InvalidCapture {
                name: param.name().to_string(),
            }),
        }
    }

    fn load_param(&mut self, param: &Param) -> Result<(), NotSupported> {
        let slot = self.resolve(param)?;
        self.load_slot(slot, param.ty());
        Ok(())
    }

    fn load_slot(&mut self, slot: Slot, ty: &Type) {
        match slot {
            Slot::Arg(i) => self.b.emit(Instr::LoadArg(i)),
            Slot::Local(i) => self.b.emit(Instr::LoadLocal(i)),
            Slot::Closure(slot) => self.load_closure(slot, ty),
        }
    }

    fn store_slot(&mut self, slot: Slot) {
        let instr = match slot {
            Slot::Arg(i) => Instr::StoreArg(i),
            Slot::Local(i) => Instr::StoreLocal(i),
            Slot::Closure(slot) => match self.layout().strategy() {
                ClosureStrategy::Fixed => Instr::StoreClosureField(slot),
                ClosureStrategy::Indexed => Instr::StoreClosureItem(slot),
            },
        };
        self.b.emit(instr);
    }

    /// Loads closure item `slot` typed as `ty`. Indexed items are untyped
    /// and get checked on the way out.
    fn load_closure(&mut self, slot: u16, ty: &Type) {
        let strategy = self.layout().strategy();
        match strategy {
            ClosureStrategy::Fixed => self.b.emit(Instr::LoadClosureField(slot)),
            ClosureStrategy::Indexed => {
                self.b.emit(Instr::LoadClosureItem(slot));
                if ty.is_value_type() {
                    self.b.emit(Instr::Unbox(ty.clone()));
                } else if *ty != Type::Object {
                    self.b.emit(Instr::CastClass(ty.clone()));
                }
            }
        }
    }

    fn emit_constant<N: ExpressionNode>(&mut self, node: &N, value: Value) {
        if is_immediate(&value) {
            self.b.emit(Instr::Const(value));
            return;
        }
        let index = layout_item(self.info.constant_index(node.id()), node.id());
        let slot = self.layout().slot(ItemKind::Constant, index);
        let ty = self.info.constants()[index].ty.clone();
        self.load_closure(slot, &ty);
    }

    fn emit_convert<N: ExpressionNode>(
        &mut self,
        operand: &N,
        to: &Type,
        checked: bool,
        method: Option<MethodRef>,
    ) -> Result<(), NotSupported> {
        if let Some(method) = method {
            self.emit(operand, Usage::Value)?;
            self.b.emit(Instr::Call(method));
            return Ok(());
        }
        let steps = plan_conversion(operand.ty(), to, checked).ok_or_else(|| {
            NotSupported::construct(format!("conversion from {} to {to}", operand.ty()))
        })?;
        self.emit(operand, Usage::Value)?;
        for step in steps {
            self.b.emit(match step {
                ConvStep::Numeric { to, overflow } => Instr::Conv { to, overflow },
                ConvStep::Unwrap => Instr::UnwrapNullable,
                ConvStep::Unbox(ty) => Instr::Unbox(ty),
                ConvStep::Cast(ty) => Instr::CastClass(ty),
            });
        }
        Ok(())
    }

    /// Value-type receivers are addressed so member access and calls see
    /// the stored struct rather than a copy.
    fn emit_receiver<N: ExpressionNode>(&mut self, node: &N) -> Result<(), NotSupported> {
        if node.ty().is_struct() {
            self.emit_address(node)
        } else {
            self.emit(node, Usage::Value)
        }
    }

    fn emit_address<N: ExpressionNode>(&mut self, node: &N) -> Result<(), NotSupported> {
        match node.shape() {
            Shape::Parameter(param) => {
                let instr = match self.resolve(&param)? {
                    Slot::Arg(i) => Instr::LoadArgAddr(i),
                    Slot::Local(i) => Instr::LoadLocalAddr(i),
                    Slot::Closure(slot) => Instr::LoadClosureAddr(slot),
                };
                self.b.emit(instr);
            }
            Shape::ArrayIndex { array, index } => {
                self.emit(&array, Usage::Value)?;
                self.emit(&index, Usage::Value)?;
                self.b.emit(Instr::LoadElemAddr);
            }
            Shape::MemberAccess {
                receiver: Some(receiver),
                member: Member::Field { index, .. },
            } => {
                self.emit_receiver(&receiver)?;
                self.b.emit(Instr::LoadFieldAddr(index));
            }
            _ => {
                self.emit(node, Usage::Value)?;
                let temp = self.b.declare_local(node.ty().clone());
                self.b.emit(Instr::StoreLocal(temp));
                self.b.emit(Instr::LoadLocalAddr(temp));
            }
        }
        Ok(())
    }

    fn emit_member_load<N: ExpressionNode>(
        &mut self,
        receiver: Option<&N>,
        member: &Member,
    ) -> Result<(), NotSupported> {
        match (member, receiver) {
            (Member::Static(cell), None) => self.b.emit(Instr::LoadStatic(cell.clone())),
            (Member::Field { index, .. }, Some(receiver)) => {
                self.emit_receiver(receiver)?;
                self.b.emit(Instr::LoadField(*index));
            }
            (Member::Property(prop), receiver) => {
                match receiver {
                    Some(receiver) => self.emit_receiver(receiver)?,
                    None => self.b.emit(Instr::Const(Value::Null)),
                }
                self.b.emit(Instr::GetProperty(prop.clone()));
            }
            (member, _) => {
                return Err(NotSupported::construct(format!(
                    "receiver mismatch reading {member:?}"
                )))
            }
        }
        Ok(())
    }

    /// Stores the value on top of the stack into `member` of the receiver
    /// below it. Static members take no receiver.
    fn store_member(&mut self, member: &Member) -> Result<(), NotSupported> {
        let instr = match member {
            Member::Field { index, .. } => Instr::StoreField(*index),
            Member::Property(prop) if prop.setter.is_some() => Instr::SetProperty(prop.clone()),
            Member::Property(prop) => {
                return Err(NotSupported::construct(format!(
                    "property `{}` has no setter",
                    prop.name
                )))
            }
            Member::Static(cell) => Instr::StoreStatic(cell.clone()),
        };
        self.b.emit(instr);
        Ok(())
    }

    fn emit_member_init<N: ExpressionNode>(
        &mut self,
        new: &N,
        bindings: &[Binding<N>],
        usage: Usage,
    ) -> Result<(), NotSupported> {
        let ty = new.ty().clone();
        self.emit(new, Usage::Value)?;
        if ty.is_struct() {
            let temp = self.b.declare_local(ty);
            self.b.emit(Instr::StoreLocal(temp));
            for binding in bindings {
                if !binding.member.is_static() {
                    self.b.emit(Instr::LoadLocalAddr(temp));
                }
                self.emit(&binding.value, Usage::Value)?;
                self.store_member(&binding.member)?;
            }
            if usage == Usage::Value {
                self.b.emit(Instr::LoadLocal(temp));
            }
            Ok(())
        } else {
            for binding in bindings {
                if !binding.member.is_static() {
                    self.b.emit(Instr::Dup);
                }
                self.emit(&binding.value, Usage::Value)?;
                self.store_member(&binding.member)?;
            }
            self.settle(usage, &ty)
        }
    }

    /// Loads a nested lambda as a callable. A nested unit with captures gets
    /// its closure rebuilt here from this unit's own items, in the order of
    /// the child's layout, and is curried with it.
    fn emit_lambda_ref<N: ExpressionNode>(&mut self, node: &N) -> Result<(), NotSupported> {
        let index = layout_item(self.info.nested_index(node.id()), node.id());
        let record = self.info.nested()[index].clone();
        let slot = self.layout().slot(ItemKind::Nested, index);
        self.load_closure(slot, &record.item_type());

        let Some(child) = &record.info else {
            return Ok(());
        };
        let child_layout = record
            .artifact
            .unit()
            .layout()
            .cloned()
            .expect("closure layout mismatch: curryable unit without a layout");
        for constant in child.constants() {
            let i = layout_item(self.info.constant_index(constant.node), constant.node);
            let slot = self.layout().slot(ItemKind::Constant, i);
            self.load_closure(slot, &constant.ty);
        }
        for param in child.params() {
            self.load_param(param)?;
        }
        for nested in child.nested() {
            let i = layout_item(self.info.nested_index(nested.node), nested.node);
            let slot = self.layout().slot(ItemKind::Nested, i);
            self.load_closure(slot, &nested.item_type());
        }
        self.b.emit(Instr::NewClosure(child_layout));
        self.b.emit(Instr::Curry);
        Ok(())
    }

    fn emit_comparison<N: ExpressionNode>(
        &mut self,
        op: CmpOp,
        left: &N,
        right: &N,
        method: Option<MethodRef>,
    ) -> Result<(), NotSupported> {
        let (lt, rt) = (left.ty(), right.ty());
        let builtin = lt.non_nullable() == rt.non_nullable()
            && (lt.non_nullable().is_primitive() || lt.non_nullable() == &Type::Str);
        let instrs = if let Some(method) = method {
            vec![Instr::Call(method)]
        } else if builtin {
            vec![Instr::Cmp(op)]
        } else if let Some(method) = resolve_operator(Operator::Cmp(op), lt, rt) {
            vec![Instr::Call(method)]
        } else {
            match op {
                CmpOp::Eq => vec![Instr::GenericEq],
                CmpOp::Ne => vec![Instr::GenericEq, Instr::Not],
                _ => {
                    return Err(NotSupported::construct(format!(
                        "no {op:?} operator for {lt} and {rt}"
                    )))
                }
            }
        };
        self.emit(left, Usage::Value)?;
        self.emit(right, Usage::Value)?;
        instrs.into_iter().for_each(|i| self.b.emit(i));
        Ok(())
    }

    fn emit_arithmetic<N: ExpressionNode>(
        &mut self,
        op: ArithOp,
        left: &N,
        right: &N,
        checked: bool,
        method: Option<MethodRef>,
    ) -> Result<(), NotSupported> {
        let (lt, rt) = (left.ty(), right.ty());
        let (l, r) = (lt.non_nullable(), rt.non_nullable());
        let instr = if let Some(method) = method {
            Instr::Call(method)
        } else if op == ArithOp::Add && (lt == &Type::Str || rt == &Type::Str) {
            Instr::Concat
        } else if matches!(op, ArithOp::Shl | ArithOp::Shr) && l.is_integer() && r.is_integer() {
            Instr::Arith {
                op,
                overflow: Overflow::Wrap,
            }
        } else if l.is_primitive() && l == r {
            Instr::Arith {
                op,
                overflow: Overflow::select(checked, lt),
            }
        } else if let Some(method) = resolve_operator(Operator::Arith(op), lt, rt) {
            Instr::Call(method)
        } else {
            return Err(NotSupported::construct(format!(
                "no {op:?} operator for {lt} and {rt}"
            )));
        };
        self.emit(left, Usage::Value)?;
        self.emit(right, Usage::Value)?;
        self.b.emit(instr);
        Ok(())
    }

    fn emit_unary<N: ExpressionNode>(
        &mut self,
        op: UnaryOp,
        operand: &N,
        checked: bool,
    ) -> Result<(), NotSupported> {
        let ty = operand.ty().non_nullable();
        let instr = match op {
            UnaryOp::Negate if ty.is_numeric() => {
                Instr::Neg(Overflow::select(checked, operand.ty()))
            }
            UnaryOp::Not if ty == &Type::Bool || ty.is_integer() => Instr::Not,
            UnaryOp::ArrayLength if ty.element().is_some() => Instr::ArrayLen,
            op => {
                return Err(NotSupported::construct(format!(
                    "{op:?} is not defined for {ty}"
                )))
            }
        };
        self.emit(operand, Usage::Value)?;
        self.b.emit(instr);
        Ok(())
    }

    fn emit_logical<N: ExpressionNode>(
        &mut self,
        op: LogicalOp,
        left: &N,
        right: &N,
    ) -> Result<(), NotSupported> {
        if left.ty() != &Type::Bool || right.ty() != &Type::Bool {
            return Err(NotSupported::construct(format!(
                "{op:?} over {} and {}",
                left.ty(),
                right.ty()
            )));
        }
        let end = self.b.define_label();
        self.emit(left, Usage::Value)?;
        self.b.emit(Instr::Dup);
        let kind = match op {
            LogicalOp::AndAlso => BranchKind::IfFalse,
            LogicalOp::OrElse => BranchKind::IfTrue,
        };
        self.b.branch(kind, end);
        self.b.emit(Instr::Pop);
        self.emit(right, Usage::Value)?;
        self.b.mark(end);
        Ok(())
    }

    fn emit_coalesce<N: ExpressionNode>(
        &mut self,
        ty: &Type,
        left: &N,
        right: &N,
    ) -> Result<(), NotSupported> {
        let is_null = self.b.define_label();
        let end = self.b.define_label();
        self.emit(left, Usage::Value)?;
        self.b.emit(Instr::Dup);
        self.b.branch(BranchKind::IfNull, is_null);
        if matches!(left.ty(), Type::Nullable(_)) && !matches!(ty, Type::Nullable(_)) {
            self.b.emit(Instr::UnwrapNullable);
        }
        self.b.branch(BranchKind::Always, end);
        self.b.mark(is_null);
        self.b.emit(Instr::Pop);
        self.emit_as(right, ty, Usage::Value)?;
        self.b.mark(end);
        Ok(())
    }

    fn emit_conditional<N: ExpressionNode>(
        &mut self,
        ty: &Type,
        test: &N,
        if_true: &N,
        if_false: &N,
        usage: Usage,
    ) -> Result<(), NotSupported> {
        if test.ty() != &Type::Bool {
            return Err(NotSupported::construct(format!(
                "conditional test of type {}",
                test.ty()
            )));
        }
        let usage = if ty.is_void() { Usage::Discard } else { usage };
        let otherwise = self.b.define_label();
        let end = self.b.define_label();
        self.emit(test, Usage::Value)?;
        self.b.branch(BranchKind::IfFalse, otherwise);
        self.emit_as(if_true, ty, usage)?;
        self.b.branch(BranchKind::Always, end);
        self.b.mark(otherwise);
        self.emit_as(if_false, ty, usage)?;
        self.b.mark(end);
        Ok(())
    }

    /// Copies the value on top of the stack into a temporary when the
    /// enclosing expression consumes the assignment.
    fn keep(&mut self, usage: Usage, ty: &Type) -> Option<u16> {
        (usage == Usage::Value).then(|| {
            let temp = self.b.declare_local(ty.clone());
            self.b.emit(Instr::Dup);
            self.b.emit(Instr::StoreLocal(temp));
            temp
        })
    }

    fn restore(&mut self, temp: Option<u16>) {
        if let Some(temp) = temp {
            self.b.emit(Instr::LoadLocal(temp));
        }
    }

    fn emit_assign<N: ExpressionNode>(
        &mut self,
        target: &N,
        value: &N,
        usage: Usage,
    ) -> Result<(), NotSupported> {
        let ty = target.ty().clone();
        match target.shape() {
            Shape::Parameter(param) => {
                let slot = self.resolve(&param)?;
                self.emit(value, Usage::Value)?;
                if usage == Usage::Value {
                    self.b.emit(Instr::Dup);
                }
                self.store_slot(slot);
            }
            Shape::MemberAccess {
                receiver: None,
                member: member @ Member::Static(_),
            } => {
                self.emit(value, Usage::Value)?;
                if usage == Usage::Value {
                    self.b.emit(Instr::Dup);
                }
                self.store_member(&member)?;
            }
            Shape::MemberAccess {
                receiver: Some(receiver),
                member,
            } if !member.is_static() => {
                if !member.is_writable() {
                    return Err(NotSupported::construct(format!("{member:?} is read-only")));
                }
                self.emit_receiver(&receiver)?;
                self.emit(value, Usage::Value)?;
                let temp = self.keep(usage, &ty);
                self.store_member(&member)?;
                self.restore(temp);
            }
            Shape::ArrayIndex { array, index } => {
                self.emit(&array, Usage::Value)?;
                self.emit(&index, Usage::Value)?;
                if ty.is_struct() {
                    self.b.emit(Instr::LoadElemAddr);
                    self.emit(value, Usage::Value)?;
                    let temp = self.keep(usage, &ty);
                    self.b.emit(Instr::StoreIndirect);
                    self.restore(temp);
                } else {
                    self.emit(value, Usage::Value)?;
                    let temp = self.keep(usage, &ty);
                    self.b.emit(Instr::StoreElem);
                    self.restore(temp);
                }
            }
            Shape::Index {
                receiver,
                indexer,
                args,
            } => {
                if indexer.setter.is_none() {
                    return Err(NotSupported::construct(format!("{indexer:?} is read-only")));
                }
                self.emit_receiver(&receiver)?;
                self.emit_all(&args)?;
                self.emit(value, Usage::Value)?;
                let temp = self.keep(usage, &ty);
                self.b.emit(Instr::SetIndex(indexer));
                self.restore(temp);
            }
            other => {
                return Err(NotSupported::construct(format!(
                    "assignment to {:?}",
                    other.kind()
                )))
            }
        }
        Ok(())
    }

    fn emit_block<N: ExpressionNode>(
        &mut self,
        variables: &[Param],
        body: &[N],
        ty: &Type,
        usage: Usage,
    ) -> Result<(), NotSupported> {
        let usage = if ty.is_void() { Usage::Discard } else { usage };
        let mut scope = Vec::with_capacity(variables.len());
        for var in variables {
            let local = self.b.declare_local(var.ty().clone());
            self.b.emit(Instr::LoadDefault(var.ty().clone()));
            self.b.emit(Instr::StoreLocal(local));
            scope.push((var.clone(), local));
        }
        self.scopes.push(scope);
        let emitted = self.emit_statements(body, ty, usage);
        self.scopes.pop();
        emitted
    }

    fn emit_statements<N: ExpressionNode>(
        &mut self,
        body: &[N],
        ty: &Type,
        usage: Usage,
    ) -> Result<(), NotSupported> {
        let Some((last, init)) = body.split_last() else {
            if usage == Usage::Value {
                self.b.emit(Instr::LoadDefault(ty.clone()));
            }
            return Ok(());
        };
        for statement in init {
            self.emit(statement, Usage::Discard)?;
        }
        self.emit_as(last, ty, usage)
    }

    /// Protected region whose body and handlers all leave their value in one
    /// result local, read back after the finally body.
    fn emit_try<N: ExpressionNode>(
        &mut self,
        ty: &Type,
        body: &N,
        handlers: &[CatchBlock<N>],
        finally: Option<&N>,
        usage: Usage,
    ) -> Result<(), NotSupported> {
        if handlers.iter().any(|h| h.filter.is_some()) {
            return Err(NotSupported::construct("catch filter"));
        }
        let Some(depth) = self.b.depth() else {
            return Ok(());
        };
        let usage = if ty.is_void() { Usage::Discard } else { usage };
        let result = (usage == Usage::Value).then(|| self.b.declare_local(ty.clone()));
        let finally_depth = self.b.finally_nesting();
        let after = self.b.define_label();

        let try_start = self.b.pc();
        self.emit_as(body, ty, usage)?;
        self.store_result(result);
        self.b.branch(BranchKind::Always, after);
        let try_end = self.b.pc();

        let mut entries = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let entry = self.b.define_label();
            self.b.mark_entry(entry, depth + 1);
            let hidden = self.b.declare_local(Type::Object);
            let mut scope = Vec::new();
            match &handler.variable {
                Some(var) => {
                    let local = self.b.declare_local(var.ty().clone());
                    self.b.emit(Instr::Dup);
                    self.b.emit(Instr::StoreLocal(hidden));
                    self.b.emit(Instr::StoreLocal(local));
                    scope.push((var.clone(), local));
                }
                None => self.b.emit(Instr::StoreLocal(hidden)),
            }
            self.scopes.push(scope);
            self.catch_locals.push(hidden);
            let emitted = self.emit_as(&handler.body, ty, usage);
            self.catch_locals.pop();
            self.scopes.pop();
            emitted?;
            self.store_result(result);
            self.b.branch(BranchKind::Always, after);
            entries.push(HandlerEntry {
                start: try_start,
                end: try_end,
                kind: HandlerKind::Catch(handler.test.clone()),
                target: self.b.label_pc(entry),
                stack_depth: depth,
                finally_depth,
            });
        }
        entries.into_iter().for_each(|e| self.b.add_handler(e));

        match finally {
            Some(finally) => {
                self.b.mark_entry(after, depth);
                let finally_start = self.b.pc();
                self.b.emit(Instr::EnterFinally);
                let target = self.b.pc();
                self.emit(finally, Usage::Discard)?;
                self.b.emit(Instr::EndFinally);
                self.b.add_handler(HandlerEntry {
                    start: try_start,
                    end: finally_start,
                    kind: HandlerKind::Finally,
                    target,
                    stack_depth: depth,
                    finally_depth,
                });
            }
            None => self.b.mark(after),
        }
        if let Some(result) = result {
            self.b.emit(Instr::LoadLocal(result));
        }
        Ok(())
    }

    fn store_result(&mut self, result: Option<u16>) {
        if let Some(result) = result {
            self.b.emit(Instr::StoreLocal(result));
        }
    }

    fn emit_throw<N: ExpressionNode>(&mut self, operand: Option<&N>) -> Result<(), NotSupported> {
        match operand {
            Some(operand) => self.emit(operand, Usage::Value)?,
            None => {
                let hidden = *self
                    .catch_locals
                    .last()
                    .ok_or_else(|| NotSupported::construct("rethrow outside a catch body"))?;
                self.b.emit(Instr::LoadLocal(hidden));
            }
        }
        self.b.emit(Instr::Throw);
        Ok(())
    }
}
