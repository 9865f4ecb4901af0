//! Runtime values shared by the bytecode VM, the native tier and the
//! reference evaluator.

mod exception;
pub mod ops;


use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::closure::ClosureValue;
use crate::emit::CodeUnit;
use crate::eval::InterpretedLambda;
use crate::types::{ClassRef, Type};

pub use exception::{builtin, exception_class};
pub use ops::Overflow;

/// A runtime value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Str(Arc<str>),
    Type(Type),
    /// Instance of a reference-type class; shared.
    Object(ObjectRef),
    /// Instance of a value-type class; copied.
    Struct(Box<StructValue>),
    Array(ArrayRef),
    Func(Callable),
    /// A compiled unit still expecting its closure.
    Code(Arc<CodeUnit>),
    Closure(ClosureValue),
    /// Managed address of a VM slot or array element.
    Addr(Addr),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn new_object(class: ClassRef, fields: Vec<Value>) -> Self {
        Value::Object(Arc::new(Object {
            class,
            fields: RwLock::new(fields),
        }))
    }

    pub fn new_struct(class: ClassRef, fields: Vec<Value>) -> Self {
        Value::Struct(Box::new(StructValue { class, fields }))
    }

    pub fn new_array(elem: Type, items: Vec<Value>) -> Self {
        Value::Array(Arc::new(ArrayObject {
            elem,
            items: RwLock::new(items),
        }))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(n) => Some(*n as i64),
            Value::I64(n) => Some(*n),
            Value::U32(n) => Some(*n as i64),
            Value::U64(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Value::Func(f) => Some(f),
            _ => None,
        }
    }

    /// Runtime type test used by casts and catch clauses.
    pub fn type_matches(&self, ty: &Type) -> bool {
        match (self, ty) {
            (Value::Null, ty) => ty.admits_null(),
            (_, Type::Object) => true,
            (_, Type::Nullable(inner)) => self.type_matches(inner),
            (Value::Bool(_), Type::Bool)
            | (Value::I32(_), Type::I32)
            | (Value::I64(_), Type::I64)
            | (Value::U32(_), Type::U32)
            | (Value::U64(_), Type::U64)
            | (Value::F64(_), Type::F64)
            | (Value::Str(_), Type::Str)
            | (Value::Type(_), Type::TypeToken)
            | (Value::Func(_), Type::Func(_))
            | (Value::Code(_), Type::Func(_)) => true,
            (Value::Object(o), Type::Class(class)) => o.class.derives_from(class),
            (Value::Struct(s), Type::Class(class)) => Arc::ptr_eq(&s.class, class),
            (Value::Array(a), Type::Array(elem)) => a.elem == **elem,
            _ => false,
        }
    }

    /// Generic equality: primitives and strings by value, structs field-wise,
    /// everything else by reference identity.
    pub fn generic_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Struct(a), Value::Struct(b)) => {
                Arc::ptr_eq(&a.class, &b.class)
                    && a.fields.len() == b.fields.len()
                    && a.fields.iter().zip(&b.fields).all(|(x, y)| x.generic_eq(y))
            }
            (Value::Func(a), Value::Func(b)) => a.same(b),
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::I32(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::I64(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::U32(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::U64(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::F64(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::I32(n) => write!(f, "{n}"),
            Value::I64(n) => write!(f, "{n}"),
            Value::U32(n) => write!(f, "{n}"),
            Value::U64(n) => write!(f, "{n}"),
            Value::F64(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Type(t) => write!(f, "type {t}"),
            Value::Object(o) if o.class.derives_from(exception_class()) => {
                write!(f, "{}: {}", o.class.name(), o.get(0))
            }
            Value::Object(o) => write!(f, "<{} object>", o.class.name()),
            Value::Struct(s) => {
                write!(f, "{} {{", s.class.name())?;
                for (i, (def, value)) in s.class.fields().iter().zip(&s.fields).enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {value}", def.name)?;
                }
                write!(f, " }}")
            }
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, item) in read_lock(&a.items).iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Func(_) => write!(f, "<function>"),
            Value::Code(unit) => write!(f, "<code {}>", unit.name()),
            Value::Closure(_) => write!(f, "<closure>"),
            Value::Addr(_) => write!(f, "<address>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::I32(n) => write!(f, "I32({n})"),
            Value::I64(n) => write!(f, "I64({n})"),
            Value::U32(n) => write!(f, "U32({n})"),
            Value::U64(n) => write!(f, "U64({n})"),
            Value::F64(n) => write!(f, "F64({n})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Addr(addr) => write!(f, "Addr({addr:?})"),
            other => write!(f, "{other}"),
        }
    }
}

/// Shared instance of a reference-type class.
pub type ObjectRef = Arc<Object>;

pub struct Object {
    class: ClassRef,
    fields: RwLock<Vec<Value>>,
}

impl Object {
    pub fn class(&self) -> &ClassRef {
        &self.class
    }

    pub fn get(&self, index: usize) -> Value {
        read_lock(&self.fields)[index].clone()
    }

    pub fn set(&self, index: usize, value: Value) {
        write_lock(&self.fields)[index] = value;
    }

    /// Runs `f` on field `index` in place.
    pub fn with_field<R>(&self, index: usize, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut write_lock(&self.fields)[index])
    }

    /// Reads a field by name.
    pub fn get_named(&self, name: &str) -> Option<Value> {
        self.class.field_index(name).map(|i| self.get(i))
    }
}

/// Instance of a value-type class.
#[derive(Clone)]
pub struct StructValue {
    pub class: ClassRef,
    pub fields: Vec<Value>,
}

impl StructValue {
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.class.field_index(name).map(|i| &self.fields[i])
    }
}

/// Shared array.
pub type ArrayRef = Arc<ArrayObject>;

pub struct ArrayObject {
    elem: Type,
    items: RwLock<Vec<Value>>,
}

impl ArrayObject {
    pub fn elem(&self) -> &Type {
        &self.elem
    }

    pub fn len(&self) -> usize {
        read_lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<Value, Thrown> {
        read_lock(&self.items)
            .get(index)
            .cloned()
            .ok_or_else(|| Thrown::index_out_of_range(index))
    }

    pub fn set(&self, index: usize, value: Value) -> Result<(), Thrown> {
        let mut items = write_lock(&self.items);
        let slot = items
            .get_mut(index)
            .ok_or_else(|| Thrown::index_out_of_range(index))?;
        *slot = value;
        Ok(())
    }

    /// Runs `f` on the element in place.
    pub fn with_element<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut Value) -> R,
    ) -> Result<R, Thrown> {
        let mut items = write_lock(&self.items);
        let slot = items
            .get_mut(index)
            .ok_or_else(|| Thrown::index_out_of_range(index))?;
        Ok(f(slot))
    }

    pub fn to_vec(&self) -> Vec<Value> {
        read_lock(&self.items).clone()
    }
}

/// Managed address of a storage location inside a VM frame.
#[derive(Clone)]
pub enum Addr {
    Arg(u16),
    Local(u16),
    /// Item of the frame's own closure.
    Closure(u16),
    Element(ArrayRef, usize),
    /// Field of the struct stored at the inner address.
    Field(Box<Addr>, usize),
    ObjectField(ObjectRef, usize),
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Arg(i) => write!(f, "arg {i}"),
            Addr::Local(i) => write!(f, "local {i}"),
            Addr::Closure(i) => write!(f, "closure {i}"),
            Addr::Element(_, i) => write!(f, "element {i}"),
            Addr::Field(inner, i) => write!(f, "{inner:?}.{i}"),
            Addr::ObjectField(obj, i) => write!(f, "{}.{i}", obj.class().name()),
        }
    }
}

/// Host delegate callable from expression trees.
pub type HostDelegate = Arc<dyn Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync>;

/// Anything that can be invoked with arguments.
#[derive(Clone)]
pub enum Callable {
    /// Compiled unit, with its closure if it has captures.
    Code {
        unit: Arc<CodeUnit>,
        closure: Option<ClosureValue>,
    },
    /// Lambda executed by the reference evaluator.
    Interpreted(Arc<InterpretedLambda>),
    Host(HostDelegate),
}

impl Callable {
    pub fn host(f: impl Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync + 'static) -> Self {
        Callable::Host(Arc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, Thrown> {
        match self {
            Callable::Code { unit, closure } => crate::vm::invoke(unit, closure.as_ref(), args),
            Callable::Interpreted(lambda) => lambda.call(args),
            Callable::Host(f) => f(args),
        }
    }

    fn same(&self, other: &Callable) -> bool {
        match (self, other) {
            (Callable::Code { unit: a, .. }, Callable::Code { unit: b, .. }) => Arc::ptr_eq(a, b),
            (Callable::Interpreted(a), Callable::Interpreted(b)) => Arc::ptr_eq(a, b),
            (Callable::Host(a), Callable::Host(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// An exception in flight.
#[derive(Debug, Clone, Error)]
#[error("unhandled exception: {0}")]
pub struct Thrown(pub Value);

impl Thrown {
    /// Creates an exception object of `class` with the given message.
    pub fn new(class: &ClassRef, message: impl Into<Arc<str>>) -> Self {
        let mut fields: Vec<Value> = class.fields().iter().map(|f| f.ty.default_value()).collect();
        fields[0] = Value::Str(message.into());
        Thrown(Value::new_object(class.clone(), fields))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Class name of the thrown object.
    pub fn class_name(&self) -> Option<&str> {
        self.0.as_object().map(|o| o.class().name())
    }

    /// Message of an exception object.
    pub fn message(&self) -> Option<String> {
        let obj = self.0.as_object()?;
        if !obj.class().derives_from(exception_class()) {
            return None;
        }
        obj.get(0).as_str().map(str::to_string)
    }

    pub fn is_instance_of(&self, class: &ClassRef) -> bool {
        self.0.type_matches(&Type::Class(class.clone()))
    }

    pub fn null_reference() -> Self {
        Self::new(builtin::null_reference(), "Object reference not set to an instance of an object")
    }

    pub fn divide_by_zero() -> Self {
        Self::new(builtin::divide_by_zero(), "Attempted to divide by zero")
    }

    pub fn overflow() -> Self {
        Self::new(builtin::overflow(), "Arithmetic operation resulted in an overflow")
    }

    pub fn invalid_cast(value: &Value, ty: &Type) -> Self {
        Self::new(
            builtin::invalid_cast(),
            format!("Unable to cast {value:?} to {ty}"),
        )
    }

    pub fn index_out_of_range(index: usize) -> Self {
        Self::new(
            builtin::index_out_of_range(),
            format!("Index {index} was outside the bounds of the array"),
        )
    }

    pub fn invalid_operation(message: impl Into<Arc<str>>) -> Self {
        Self::new(builtin::invalid_operation(), message)
    }
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
