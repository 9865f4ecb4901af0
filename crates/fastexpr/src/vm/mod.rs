//! Bytecode interpreter for linked [`CodeUnit`]s.
//!
//! Each invocation gets its own frame: arguments (argument 0 is the closure
//! when the unit has one), typed locals, the evaluation stack and the stack
//! of finally bodies in progress. Exceptions unwind through the unit's
//! handler table; an exception no entry accepts leaves the frame as
//! `Err(Thrown)`.
//!
//! Structural problems (stack underflow, a missing closure) can only come
//! from the emitter and panic.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::closure::ClosureValue;
use crate::emit::{CodeUnit, HandlerKind, Instr};
use crate::value::ops;
use crate::value::{write_lock, Addr, Callable, Thrown, Value};

/// Runs `unit` with `args`, preferring its native code when the arguments
/// allow it.
///
/// # Errors
///
/// Returns the exception that escaped the unit, or an invalid-operation
/// exception if the call does not match the unit's shape.
pub fn invoke(
    unit: &Arc<CodeUnit>,
    closure: Option<&ClosureValue>,
    args: &[Value],
) -> Result<Value, Thrown> {
    if args.len() != unit.arity() {
        return Err(Thrown::invalid_operation(format!(
            "{} expects {} arguments, got {}",
            unit.name(),
            unit.arity(),
            args.len()
        )));
    }
    if unit.has_closure() != closure.is_some() {
        return Err(Thrown::invalid_operation(format!(
            "{} called {} a closure",
            unit.name(),
            if closure.is_some() { "with" } else { "without" }
        )));
    }
    if let Some(native) = unit.native() {
        if let Some(value) = native.call(args) {
            return Ok(value);
        }
    }
    Frame::new(unit, closure, args).run()
}

enum Flow {
    Next,
    Jump(usize),
    Return(Value),
}

struct Frame<'a> {
    unit: &'a CodeUnit,
    closure: Option<ClosureValue>,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    /// One entry per finally body being executed; `Some` holds the exception
    /// to rethrow when the body completes.
    pending: Vec<Option<Thrown>>,
}

impl<'a> Frame<'a> {
    fn new(unit: &'a CodeUnit, closure: Option<&ClosureValue>, args: &[Value]) -> Self {
        let mut frame_args = Vec::with_capacity(args.len() + 1);
        if let Some(closure) = closure {
            frame_args.push(Value::Closure(closure.clone()));
        }
        frame_args.extend_from_slice(args);
        Self {
            unit,
            closure: closure.cloned(),
            args: frame_args,
            locals: unit.locals().iter().map(|ty| ty.default_value()).collect(),
            stack: Vec::with_capacity(unit.max_stack()),
            pending: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Value, Thrown> {
        let mut pc = 0;
        loop {
            match self.step(pc) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(thrown) => pc = self.unwind(pc, thrown)?,
            }
        }
    }

    /// Finds the first handler covering `pc` that accepts `thrown` and
    /// prepares the frame for it.
    fn unwind(&mut self, pc: usize, thrown: Thrown) -> Result<usize, Thrown> {
        for entry in self.unit.handlers().iter().filter(|h| h.covers(pc)) {
            if let HandlerKind::Catch(test) = &entry.kind {
                if !thrown.value().type_matches(test) {
                    continue;
                }
            }
            self.stack.truncate(entry.stack_depth);
            self.pending.truncate(entry.finally_depth);
            match entry.kind {
                HandlerKind::Catch(_) => self.stack.push(thrown.0),
                HandlerKind::Finally => self.pending.push(Some(thrown)),
            }
            return Ok(entry.target);
        }
        Err(thrown)
    }

    fn closure(&self) -> &ClosureValue {
        self.closure
            .as_ref()
            .expect("closure layout mismatch: frame has no closure")
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("evaluation stack underflow")
    }

    fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let len = self.stack.len();
        assert!(len >= n, "evaluation stack underflow");
        self.stack.split_off(len - n)
    }

    fn top(&self) -> &Value {
        self.stack.last().expect("evaluation stack underflow")
    }

    /// Reads through an address; other values pass unchanged.
    fn operand(&mut self, value: Value) -> Result<Value, Thrown> {
        match value {
            Value::Addr(addr) => self.with_place(&addr, |slot| Ok(slot.clone())),
            other => Ok(other),
        }
    }

    /// Runs `f` on the storage location `addr` names.
    fn with_place<R>(
        &mut self,
        addr: &Addr,
        f: impl FnOnce(&mut Value) -> Result<R, Thrown>,
    ) -> Result<R, Thrown> {
        let mut f = Some(f);
        let mut out = None;
        self.visit_place(addr, &mut |slot| {
            if let Some(f) = f.take() {
                out = Some(f(slot));
            }
        })?;
        out.unwrap_or_else(|| Err(Thrown::invalid_operation("address names no location")))
    }

    fn visit_place(
        &mut self,
        addr: &Addr,
        f: &mut dyn FnMut(&mut Value),
    ) -> Result<(), Thrown> {
        match addr {
            Addr::Arg(i) => f(&mut self.args[*i as usize]),
            Addr::Local(i) => f(&mut self.locals[*i as usize]),
            Addr::Closure(i) => f(&mut write_lock(self.closure().cell(*i))),
            Addr::Element(array, i) => array.with_element(*i, |slot| f(slot))?,
            Addr::ObjectField(object, i) => object.with_field(*i, |slot| f(slot)),
            Addr::Field(inner, i) => {
                let index = *i;
                let mut failure = None;
                self.visit_place(inner, &mut |slot| match slot {
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

    /// Applies `f` to a receiver, in place when it arrives as an address.
    fn with_receiver<R>(
        &mut self,
        receiver: Value,
        f: impl FnOnce(&mut Value) -> Result<R, Thrown>,
    ) -> Result<R, Thrown> {
        match receiver {
            Value::Addr(addr) => self.with_place(&addr, f),
            mut value => f(&mut value),
        }
    }

    fn step(&mut self, pc: usize) -> Result<Flow, Thrown> {
        let unit = self.unit;
        match &unit.instrs()[pc] {
            Instr::Nop => {}
            Instr::Const(value) => self.push(value.clone()),
            Instr::LoadArg(i) => self.push(self.args[*i as usize].clone()),
            Instr::StoreArg(i) => self.args[*i as usize] = self.pop(),
            Instr::LoadArgAddr(i) => self.push(Value::Addr(Addr::Arg(*i))),
            Instr::LoadLocal(i) => self.push(self.locals[*i as usize].clone()),
            Instr::StoreLocal(i) => self.locals[*i as usize] = self.pop(),
            Instr::LoadLocalAddr(i) => self.push(Value::Addr(Addr::Local(*i))),
            Instr::LoadClosureField(i) | Instr::LoadClosureItem(i) => {
                let value = self.closure().get(*i);
                self.push(value);
            }
            Instr::StoreClosureField(i) | Instr::StoreClosureItem(i) => {
                let value = self.pop();
                self.closure().set(*i, value);
            }
            Instr::LoadClosureAddr(i) => self.push(Value::Addr(Addr::Closure(*i))),
            Instr::Unbox(ty) => {
                let value = self.pop();
                self.push(ops::unbox(value, ty)?);
            }
            Instr::CastClass(ty) => {
                let value = self.pop();
                self.push(ops::cast_class(value, ty)?);
            }
            Instr::Dup => self.push(self.top().clone()),
            Instr::Pop => {
                self.pop();
            }
            Instr::Arith { op, overflow } => {
                let right = self.pop();
                let left = self.pop();
                self.push(ops::arith(*op, left, right, *overflow)?);
            }
            Instr::Neg(overflow) => {
                let value = self.pop();
                self.push(ops::negate(value, *overflow)?);
            }
            Instr::Not => {
                let value = self.pop();
                self.push(ops::not(value)?);
            }
            Instr::Cmp(op) => {
                let right = self.pop();
                let left = self.pop();
                self.push(Value::Bool(ops::compare(*op, &left, &right)));
            }
            Instr::GenericEq => {
                let right = self.pop();
                let left = self.pop();
                self.push(Value::Bool(left.generic_eq(&right)));
            }
            Instr::Concat => {
                let right = self.pop();
                let left = self.pop();
                self.push(ops::concat(&left, &right));
            }
            Instr::Conv { to, overflow } => {
                let value = self.pop();
                self.push(ops::convert(value, to, *overflow)?);
            }
            Instr::UnwrapNullable => {
                let value = self.pop();
                self.push(ops::unwrap_nullable(value)?);
            }
            Instr::ArrayLen => {
                let array = self.pop();
                self.push(ops::array_len(&array)?);
            }
            Instr::Br(target) => return Ok(Flow::Jump(*target)),
            Instr::BrTrue(target) => {
                if matches!(self.pop(), Value::Bool(true)) {
                    return Ok(Flow::Jump(*target));
                }
            }
            Instr::BrFalse(target) => {
                if !matches!(self.pop(), Value::Bool(true)) {
                    return Ok(Flow::Jump(*target));
                }
            }
            Instr::BrNull(target) => {
                if self.pop().is_null() {
                    return Ok(Flow::Jump(*target));
                }
            }
            Instr::Call(method) => {
                let args = self.pop_n(method.params.len());
                let result = if method.is_static() {
                    (method.func)(&mut Value::Null, &args)?
                } else {
                    match self.pop() {
                        Value::Null => return Err(Thrown::null_reference()),
                        receiver => self.with_receiver(receiver, |recv| (method.func)(recv, &args))?,
                    }
                };
                if !method.ret.is_void() {
                    self.push(result);
                }
            }
            Instr::CallIndirect { argc, returns } => {
                let args = self.pop_n(*argc as usize);
                let target = self.pop();
                let result = ops::invoke_value(&target, &args)?;
                if *returns {
                    self.push(result);
                }
            }
            Instr::NewObject(ctor) => {
                let args = self.pop_n(ctor.params.len());
                self.push((ctor.func)(&args)?);
            }
            Instr::NewArrayInit { elem, count } => {
                let items = self.pop_n(*count as usize);
                self.push(Value::new_array(elem.clone(), items));
            }
            Instr::NewArrayLen(elem) => {
                let len = self.pop();
                self.push(ops::new_array_len(elem, &len)?);
            }
            Instr::LoadElem => {
                let index = self.pop();
                let array = self.pop();
                self.push(ops::array_get(&array, &index)?);
            }
            Instr::StoreElem => {
                let value = self.pop();
                let index = self.pop();
                let array = self.pop();
                ops::array_set(&array, &index, value)?;
            }
            Instr::LoadElemAddr => {
                let index = self.pop();
                let addr = match self.pop() {
                    Value::Array(array) => {
                        let i = ops::index_of(&index)?;
                        if i >= array.len() {
                            return Err(Thrown::index_out_of_range(i));
                        }
                        Addr::Element(array, i)
                    }
                    Value::Null => return Err(Thrown::null_reference()),
                    other => {
                        return Err(Thrown::invalid_operation(format!(
                            "{other:?} is not an array"
                        )))
                    }
                };
                self.push(Value::Addr(addr));
            }
            Instr::LoadField(index) => {
                let receiver = self.pop();
                let value = self.with_receiver(receiver, |recv| ops::load_field(recv, *index))?;
                self.push(value);
            }
            Instr::StoreField(index) => {
                let value = self.pop();
                let receiver = self.pop();
                self.with_receiver(receiver, |recv| ops::store_field(recv, *index, value))?;
            }
            Instr::LoadFieldAddr(index) => {
                let addr = match self.pop() {
                    Value::Addr(inner) => Addr::Field(Box::new(inner), *index),
                    Value::Object(object) => Addr::ObjectField(object, *index),
                    Value::Null => return Err(Thrown::null_reference()),
                    other => {
                        return Err(Thrown::invalid_operation(format!(
                            "cannot address field {index} of {other:?}"
                        )))
                    }
                };
                self.push(Value::Addr(addr));
            }
            Instr::GetProperty(prop) => {
                let receiver = self.pop();
                let receiver = self.operand(receiver)?;
                self.push((prop.getter)(&receiver)?);
            }
            Instr::SetProperty(prop) => {
                let value = self.pop();
                let receiver = self.pop();
                let setter = prop
                    .setter
                    .as_ref()
                    .expect("emitter stores only through writable properties");
                self.with_receiver(receiver, |recv| setter(recv, value))?;
            }
            Instr::LoadStatic(cell) => self.push(cell.load()),
            Instr::StoreStatic(cell) => {
                let value = self.pop();
                cell.store(value);
            }
            Instr::GetIndex(indexer) => {
                let args = self.pop_n(indexer.params.len());
                let receiver = self.pop();
                let receiver = self.operand(receiver)?;
                if receiver.is_null() {
                    return Err(Thrown::null_reference());
                }
                self.push((indexer.getter)(&receiver, &args)?);
            }
            Instr::SetIndex(indexer) => {
                let value = self.pop();
                let args = self.pop_n(indexer.params.len());
                let receiver = self.pop();
                if receiver.is_null() {
                    return Err(Thrown::null_reference());
                }
                let setter = indexer
                    .setter
                    .as_ref()
                    .expect("emitter stores only through writable indexers");
                self.with_receiver(receiver, |recv| setter(recv, &args, value))?;
            }
            Instr::StoreIndirect => {
                let value = self.pop();
                match self.pop() {
                    Value::Addr(addr) => self.with_place(&addr, |slot| {
                        *slot = value;
                        Ok(())
                    })?,
                    other => panic!("stind through {other:?}"),
                }
            }
            Instr::LoadDefault(ty) => self.push(ty.default_value()),
            Instr::NewClosure(layout) => {
                let items = self.pop_n(layout.len());
                self.push(Value::Closure(layout.instantiate(items)));
            }
            Instr::Curry => {
                let closure = self.pop();
                let code = self.pop();
                match (code, closure) {
                    (Value::Code(unit), Value::Closure(closure)) => {
                        self.push(Value::Func(Callable::Code {
                            unit,
                            closure: Some(closure),
                        }))
                    }
                    (code, closure) => panic!("curry of {code:?} with {closure:?}"),
                }
            }
            Instr::Throw => {
                let value = self.pop();
                return Err(ops::throw_value(value));
            }
            Instr::EnterFinally => self.pending.push(None),
            Instr::EndFinally => {
                let pending = self.pending.pop().expect("endfinally without enterfinally");
                if let Some(thrown) = pending {
                    return Err(thrown);
                }
            }
            Instr::Ret => return Ok(Flow::Return(self.pop())),
        }
        Ok(Flow::Next)
    }
}
