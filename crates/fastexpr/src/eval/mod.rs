//! Reference tree-walking evaluator.
//!
//! Interprets an [`Expr`] directly with the same observable semantics as the
//! compiled path: evaluation order, struct copy semantics, built-in
//! exceptions, finally bodies and catch matching. It serves as the fallback
//! when the compiler declines a tree and as the oracle compiled artifacts
//! are checked against.
//!
//! Nested lambdas capture by value: creating one snapshots every visible
//! variable into fresh cells, which all invocations of that instance share.
//! Catch filters, which have no compiled form, are supported here.


use std::sync::{Arc, RwLock};

use crate::node::{
    ArithOp, ArrayInit, CatchBlock, CmpOp, Expr, ExpressionNode, LogicalOp, Param, Shape, UnaryOp,
};
use crate::types::{resolve_operator, Member, MethodRef, Operator, Type};
use crate::value::ops::{self, plan_conversion, Overflow};
use crate::value::{read_lock, write_lock, ArrayRef, Callable, ObjectRef, Thrown, Value};

type Cell = Arc<RwLock<Value>>;

fn cell(value: Value) -> Cell {
    Arc::new(RwLock::new(value))
}

/// Evaluates `body` with `params` bound to `args`.
///
/// A void body yields `Value::Null`.
///
/// # Errors
///
/// Returns the exception that escaped the tree. A wrong argument count and
/// references to parameters nothing binds raise invalid-operation
/// exceptions.
pub fn evaluate(body: &Expr, params: &[Param], args: &[Value]) -> Result<Value, Thrown> {
    check_arity("expression", params, args)?;
    let mut eval = Evaluator::default();
    eval.bind(params, args);
    eval.eval_as(body, body.ty())
}

/// Wraps a lambda node as an interpreted callable, or `None` if `lambda`
/// is not a lambda.
pub fn interpret_lambda(lambda: &Expr) -> Option<Callable> {
    let Shape::Lambda { params, body, name } = lambda.shape_ref() else {
        return None;
    };
    Some(Callable::Interpreted(Arc::new(InterpretedLambda {
        name: name.clone(),
        params: params.clone(),
        body: body.clone(),
        captured: Vec::new(),
    })))
}

fn check_arity(name: &str, params: &[Param], args: &[Value]) -> Result<(), Thrown> {
    if params.len() == args.len() {
        Ok(())
    } else {
        Err(Thrown::invalid_operation(format!(
            "{name} expects {} arguments, got {}",
            params.len(),
            args.len()
        )))
    }
}

/// A lambda instance run by the evaluator.
pub struct InterpretedLambda {
    name: Option<Arc<str>>,
    params: Vec<Param>,
    body: Expr,
    /// Variables visible where the instance was created, innermost last.
    captured: Vec<(Param, Cell)>,
}

impl InterpretedLambda {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("lambda")
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, Thrown> {
        check_arity(self.name(), &self.params, args)?;
        let mut eval = Evaluator {
            vars: self.captured.clone(),
            handling: Vec::new(),
        };
        eval.bind(&self.params, args);
        eval.eval_as(&self.body, self.body.ty())
    }
}

/// A storage location an assignment or in-place call writes through.
enum Place {
    Var(Cell),
    Element(ArrayRef, usize),
    ObjectField(ObjectRef, usize),
    /// Field of the struct stored at the inner place.
    Field(Box<Place>, usize),
    /// A value with no home; writes are lost.
    Temp(Value),
}

impl Place {
    fn visit(&mut self, f: &mut dyn FnMut(&mut Value)) -> Result<(), Thrown> {
        match self {
            Place::Var(cell) => f(&mut write_lock(cell)),
            Place::Element(array, i) => array.with_element(*i, |slot| f(slot))?,
            Place::ObjectField(object, i) => object.with_field(*i, |slot| f(slot)),
            Place::Temp(value) => f(value),
            Place::Field(inner, index) => {
                let index = *index;
                let mut failure = None;
                inner.visit(&mut |slot| match slot {
                    Value::Struct(s) => f(&mut s.fields[index]),
                    Value::Object(o) => o.with_field(index, |field| f(field)),
                    Value::Null => failure = Some(Thrown::null_reference()),
                    other => {
                        failure = Some(Thrown::invalid_operation(format!(
                            "{other:?} has no field {index}"
                        )))
                    }
                })?;
                if let Some(thrown) = failure {
                    return Err(thrown);
                }
            }
        }
        Ok(())
    }

    fn with<R>(
        &mut self,
        f: impl FnOnce(&mut Value) -> Result<R, Thrown>,
    ) -> Result<R, Thrown> {
        let mut f = Some(f);
        let mut out = None;
        self.visit(&mut |slot| {
            if let Some(f) = f.take() {
                out = Some(f(slot));
            }
        })?;
        out.unwrap_or_else(|| Err(Thrown::invalid_operation("place names no location")))
    }
}

#[derive(Default)]
struct Evaluator {
    /// Visible variables, innermost last.
    vars: Vec<(Param, Cell)>,
    /// Exceptions handled by the enclosing catch bodies, innermost last.
    handling: Vec<Thrown>,
}

impl Evaluator {
    fn bind(&mut self, params: &[Param], args: &[Value]) {
        for (param, arg) in params.iter().zip(args) {
            self.vars.push((param.clone(), cell(arg.clone())));
        }
    }

    fn lookup(&self, param: &Param) -> Result<Cell, Thrown> {
        self.vars
            .iter()
            .rev()
            .find(|(p, _)| p == param)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| {
                Thrown::invalid_operation(format!("parameter `{}` is not bound", param.name()))
            })
    }

    /// Runs `f` with `vars` pushed as an inner scope.
    fn scoped<R>(
        &mut self,
        vars: impl IntoIterator<Item = (Param, Cell)>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let mark = self.vars.len();
        self.vars.extend(vars);
        let out = f(self);
        self.vars.truncate(mark);
        out
    }

    /// Evaluates `expr` where a value of type `ty` is expected; a void
    /// expression there yields the default of `ty`.
    fn eval_as(&mut self, expr: &Expr, ty: &Type) -> Result<Value, Thrown> {
        let value = self.eval(expr)?;
        if expr.ty().is_void() {
            Ok(ty.default_value())
        } else {
            Ok(value)
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, Thrown> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, Thrown> {
        let ty = expr.ty();
        match expr.shape_ref() {
            Shape::Constant(value) => Ok(value.clone()),
            Shape::Parameter(param) => {
                let cell = self.lookup(param)?;
                let value = read_lock(&cell).clone();
                Ok(value)
            }
            Shape::Convert {
                operand,
                checked,
                method,
            } => {
                let value = self.eval(operand)?;
                match method {
                    Some(method) => (method.func)(&mut Value::Null, &[value]),
                    None => {
                        let steps = plan_conversion(operand.ty(), ty, *checked).ok_or_else(|| {
                            Thrown::invalid_cast(&value, ty)
                        })?;
                        ops::apply_conversion(value, &steps)
                    }
                }
            }
            Shape::ArrayIndex { array, index } => {
                let array = self.eval(array)?;
                let index = self.eval(index)?;
                ops::array_get(&array, &index)
            }
            Shape::Call {
                receiver,
                method,
                args,
            } => self.eval_call(receiver.as_ref(), method, args),
            Shape::MemberAccess { receiver, member } => {
                self.eval_member(receiver.as_ref(), member)
            }
            Shape::New { ctor, args } => {
                let args = self.eval_all(args)?;
                (ctor.func)(&args)
            }
            Shape::NewArray { elem, init } => match init {
                ArrayInit::Items(items) => Ok(Value::new_array(elem.clone(), self.eval_all(items)?)),
                ArrayInit::Length(length) => {
                    let length = self.eval(length)?;
                    ops::new_array_len(elem, &length)
                }
            },
            Shape::MemberInit { new, bindings } => {
                let mut target = self.eval(new)?;
                for binding in bindings {
                    let value = self.eval(&binding.value)?;
                    store_member(&mut target, &binding.member, value)?;
                }
                Ok(target)
            }
            Shape::Lambda { params, body, name } => {
                let captured = self
                    .vars
                    .iter()
                    .map(|(p, c)| (p.clone(), cell(read_lock(c).clone())))
                    .collect();
                Ok(Value::Func(Callable::Interpreted(Arc::new(InterpretedLambda {
                    name: name.clone(),
                    params: params.clone(),
                    body: body.clone(),
                    captured,
                }))))
            }
            Shape::Invoke { target, args } => {
                let target = self.eval(target)?;
                let args = self.eval_all(args)?;
                let result = ops::invoke_value(&target, &args)?;
                Ok(if ty.is_void() { Value::Null } else { result })
            }
            Shape::Comparison {
                op,
                left,
                right,
                method,
            } => self.eval_comparison(*op, left, right, method.as_ref()),
            Shape::Arithmetic {
                op,
                left,
                right,
                checked,
                method,
            } => self.eval_arithmetic(*op, left, right, *checked, method.as_ref()),
            Shape::Unary {
                op,
                operand,
                checked,
            } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Negate => {
                        ops::negate(value, Overflow::select(*checked, operand.ty()))
                    }
                    UnaryOp::Not => ops::not(value),
                    UnaryOp::ArrayLength => ops::array_len(&value),
                }
            }
            Shape::Logical { op, left, right } => {
                let left = self.eval(left)?;
                let short = match op {
                    LogicalOp::AndAlso => !matches!(left, Value::Bool(true)),
                    LogicalOp::OrElse => matches!(left, Value::Bool(true)),
                };
                if short {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Shape::Coalesce { left, right } => {
                let value = self.eval(left)?;
                if value.is_null() {
                    self.eval_as(right, ty)
                } else if matches!(left.ty(), Type::Nullable(_)) && !matches!(ty, Type::Nullable(_))
                {
                    ops::unwrap_nullable(value)
                } else {
                    Ok(value)
                }
            }
            Shape::Conditional {
                test,
                if_true,
                if_false,
            } => {
                let branch = if matches!(self.eval(test)?, Value::Bool(true)) {
                    if_true
                } else {
                    if_false
                };
                let value = self.eval_as(branch, ty)?;
                Ok(if ty.is_void() { Value::Null } else { value })
            }
            Shape::Assign { target, value } => self.eval_assign(target, value),
            Shape::Block { variables, body } => {
                let vars = variables
                    .iter()
                    .map(|v| (v.clone(), cell(v.ty().default_value())));
                self.scoped(vars, |eval| {
                    let Some((last, init)) = body.split_last() else {
                        return Ok(ty.default_value());
                    };
                    for statement in init {
                        eval.eval(statement)?;
                    }
                    let value = eval.eval_as(last, ty)?;
                    Ok(if ty.is_void() { Value::Null } else { value })
                })
            }
            Shape::Try {
                body,
                handlers,
                finally,
            } => self.eval_try(ty, body, handlers, finally.as_ref()),
            Shape::Throw { operand: Some(operand) } => {
                let value = self.eval(operand)?;
                Err(ops::throw_value(value))
            }
            Shape::Throw { operand: None } => Err(self
                .handling
                .last()
                .cloned()
                .unwrap_or_else(|| Thrown::invalid_operation("rethrow outside a catch body"))),
            Shape::Default => Ok(ty.default_value()),
            Shape::Index {
                receiver,
                indexer,
                args,
            } => {
                let receiver = self.eval(receiver)?;
                let args = self.eval_all(args)?;
                if receiver.is_null() {
                    return Err(Thrown::null_reference());
                }
                (indexer.getter)(&receiver, &args)
            }
        }
    }

    /// Resolves the storage `expr` denotes, evaluating its subexpressions.
    /// Expressions without storage resolve to a temporary copy.
    fn place(&mut self, expr: &Expr) -> Result<Place, Thrown> {
        match expr.shape_ref() {
            Shape::Parameter(param) => Ok(Place::Var(self.lookup(param)?)),
            Shape::ArrayIndex { array, index } => {
                let array = self.eval(array)?;
                let index = self.eval(index)?;
                match array {
                    Value::Array(array) => {
                        let i = ops::index_of(&index)?;
                        if i >= array.len() {
                            return Err(Thrown::index_out_of_range(i));
                        }
                        Ok(Place::Element(array, i))
                    }
                    Value::Null => Err(Thrown::null_reference()),
                    other => Err(Thrown::invalid_operation(format!(
                        "{other:?} is not an array"
                    ))),
                }
            }
            Shape::MemberAccess {
                receiver: Some(receiver),
                member: Member::Field { index, .. },
            } => {
                if receiver.ty().is_struct() {
                    Ok(Place::Field(Box::new(self.place(receiver)?), *index))
                } else {
                    match self.eval(receiver)? {
                        Value::Object(object) => Ok(Place::ObjectField(object, *index)),
                        Value::Null => Err(Thrown::null_reference()),
                        other => Err(Thrown::invalid_operation(format!(
                            "cannot address field {index} of {other:?}"
                        ))),
                    }
                }
            }
            _ => Ok(Place::Temp(self.eval(expr)?)),
        }
    }

    /// Receiver of a member access or call: the stored struct for value
    /// types, a copy of the reference otherwise.
    fn receiver(&mut self, expr: &Expr) -> Result<Place, Thrown> {
        if expr.ty().is_struct() {
            self.place(expr)
        } else {
            Ok(Place::Temp(self.eval(expr)?))
        }
    }

    fn eval_call(
        &mut self,
        receiver: Option<&Expr>,
        method: &MethodRef,
        args: &[Expr],
    ) -> Result<Value, Thrown> {
        let result = match receiver {
            None if method.is_static() => {
                let args = self.eval_all(args)?;
                (method.func)(&mut Value::Null, &args)?
            }
            Some(receiver) if !method.is_static() => {
                let mut receiver = self.receiver(receiver)?;
                let args = self.eval_all(args)?;
                receiver.with(|recv| {
                    if recv.is_null() {
                        return Err(Thrown::null_reference());
                    }
                    (method.func)(recv, &args)
                })?
            }
            _ => {
                return Err(Thrown::invalid_operation(format!(
                    "receiver mismatch calling {method:?}"
                )))
            }
        };
        Ok(if method.ret.is_void() { Value::Null } else { result })
    }

    fn eval_member(&mut self, receiver: Option<&Expr>, member: &Member) -> Result<Value, Thrown> {
        match (member, receiver) {
            (Member::Static(cell), None) => Ok(cell.load()),
            (Member::Field { index, .. }, Some(receiver)) => {
                let receiver = self.eval(receiver)?;
                ops::load_field(&receiver, *index)
            }
            (Member::Property(prop), receiver) => {
                let receiver = match receiver {
                    Some(receiver) => self.eval(receiver)?,
                    None => Value::Null,
                };
                (prop.getter)(&receiver)
            }
            (member, _) => Err(Thrown::invalid_operation(format!(
                "receiver mismatch reading {member:?}"
            ))),
        }
    }

    fn eval_comparison(
        &mut self,
        op: CmpOp,
        left: &Expr,
        right: &Expr,
        method: Option<&MethodRef>,
    ) -> Result<Value, Thrown> {
        let (lt, rt) = (left.ty(), right.ty());
        let builtin = lt.non_nullable() == rt.non_nullable()
            && (lt.non_nullable().is_primitive() || lt.non_nullable() == &Type::Str);
        let method = match method {
            Some(method) => Some(method.clone()),
            None if builtin => None,
            None => resolve_operator(Operator::Cmp(op), lt, rt),
        };
        if method.is_none() && !builtin && !matches!(op, CmpOp::Eq | CmpOp::Ne) {
            return Err(Thrown::invalid_operation(format!(
                "no {op:?} operator for {lt} and {rt}"
            )));
        }
        let l = self.eval(left)?;
        let r = self.eval(right)?;
        match method {
            Some(method) => (method.func)(&mut Value::Null, &[l, r]),
            None if builtin => Ok(Value::Bool(ops::compare(op, &l, &r))),
            None => Ok(Value::Bool(l.generic_eq(&r) == (op == CmpOp::Eq))),
        }
    }

    fn eval_arithmetic(
        &mut self,
        op: ArithOp,
        left: &Expr,
        right: &Expr,
        checked: bool,
        method: Option<&MethodRef>,
    ) -> Result<Value, Thrown> {
        let (lt, rt) = (left.ty(), right.ty());
        let (l_ty, r_ty) = (lt.non_nullable(), rt.non_nullable());
        let l = self.eval(left)?;
        let r = self.eval(right)?;
        if let Some(method) = method {
            return (method.func)(&mut Value::Null, &[l, r]);
        }
        if op == ArithOp::Add && (lt == &Type::Str || rt == &Type::Str) {
            return Ok(ops::concat(&l, &r));
        }
        if matches!(op, ArithOp::Shl | ArithOp::Shr) && l_ty.is_integer() && r_ty.is_integer() {
            return ops::arith(op, l, r, Overflow::Wrap);
        }
        if l_ty.is_primitive() && l_ty == r_ty {
            return ops::arith(op, l, r, Overflow::select(checked, lt));
        }
        match resolve_operator(Operator::Arith(op), lt, rt) {
            Some(method) => (method.func)(&mut Value::Null, &[l, r]),
            None => Err(Thrown::invalid_operation(format!(
                "no {op:?} operator for {lt} and {rt}"
            ))),
        }
    }

    fn eval_assign(&mut self, target: &Expr, value: &Expr) -> Result<Value, Thrown> {
        match target.shape_ref() {
            Shape::Parameter(param) => {
                let cell = self.lookup(param)?;
                let value = self.eval(value)?;
                *write_lock(&cell) = value.clone();
                Ok(value)
            }
            Shape::MemberAccess {
                receiver: None,
                member: member @ Member::Static(_),
            } => {
                let value = self.eval(value)?;
                store_member(&mut Value::Null, member, value.clone())?;
                Ok(value)
            }
            Shape::MemberAccess {
                receiver: Some(receiver),
                member,
            } if !member.is_static() => {
                if !member.is_writable() {
                    return Err(Thrown::invalid_operation(format!("{member:?} is read-only")));
                }
                let mut receiver = self.receiver(receiver)?;
                let value = self.eval(value)?;
                let stored = value.clone();
                receiver.with(|recv| store_member(recv, member, stored))?;
                Ok(value)
            }
            Shape::ArrayIndex { .. } if target.ty().is_struct() => {
                let mut place = self.place(target)?;
                let value = self.eval(value)?;
                let stored = value.clone();
                place.with(|slot| {
                    *slot = stored;
                    Ok(())
                })?;
                Ok(value)
            }
            Shape::ArrayIndex { array, index } => {
                let array = self.eval(array)?;
                let index = self.eval(index)?;
                let value = self.eval(value)?;
                ops::array_set(&array, &index, value.clone())?;
                Ok(value)
            }
            Shape::Index {
                receiver,
                indexer,
                args,
            } => {
                let setter = indexer.setter.as_ref().ok_or_else(|| {
                    Thrown::invalid_operation(format!("{indexer:?} is read-only"))
                })?;
                let mut receiver = self.receiver(receiver)?;
                let args = self.eval_all(args)?;
                let value = self.eval(value)?;
                let stored = value.clone();
                receiver.with(|recv| {
                    if recv.is_null() {
                        return Err(Thrown::null_reference());
                    }
                    setter(recv, &args, stored)
                })?;
                Ok(value)
            }
            other => Err(Thrown::invalid_operation(format!(
                "assignment to {:?}",
                other.kind()
            ))),
        }
    }

    fn eval_try(
        &mut self,
        ty: &Type,
        body: &Expr,
        handlers: &[CatchBlock<Expr>],
        finally: Option<&Expr>,
    ) -> Result<Value, Thrown> {
        let outcome = match self.eval_as(body, ty) {
            Err(thrown) => self.handle(ty, thrown, handlers),
            ok => ok,
        };
        if let Some(finally) = finally {
            self.eval(finally)?;
        }
        outcome.map(|value| if ty.is_void() { Value::Null } else { value })
    }

    /// Runs the first handler accepting `thrown`, or passes it on.
    fn handle(
        &mut self,
        ty: &Type,
        thrown: Thrown,
        handlers: &[CatchBlock<Expr>],
    ) -> Result<Value, Thrown> {
        for handler in handlers {
            if !thrown.value().type_matches(&handler.test) {
                continue;
            }
            let scope = handler
                .variable
                .iter()
                .map(|var| (var.clone(), cell(thrown.value().clone())))
                .collect::<Vec<_>>();
            if let Some(filter) = &handler.filter {
                // a filter that throws does not match
                let accepted = self.scoped(scope.clone(), |eval| eval.eval(filter));
                if !matches!(accepted, Ok(Value::Bool(true))) {
                    continue;
                }
            }
            self.handling.push(thrown);
            let result = self.scoped(scope, |eval| eval.eval_as(&handler.body, ty));
            self.handling.pop();
            return result;
        }
        Err(thrown)
    }
}

/// Stores `value` into `member` of `target`; static members ignore
/// `target`.
fn store_member(target: &mut Value, member: &Member, value: Value) -> Result<(), Thrown> {
    match member {
        Member::Field { index, .. } => ops::store_field(target, *index, value),
        Member::Property(prop) => match &prop.setter {
            Some(setter) => setter(target, value),
            None => Err(Thrown::invalid_operation(format!(
                "property `{}` has no setter",
                prop.name
            ))),
        },
        Member::Static(cell) => {
            cell.store(value);
            Ok(())
        }
    }
}
