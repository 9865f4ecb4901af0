//! Host type model: result types, classes, members and operator overloads.
//!
//! Expression trees are typed against this model. Classes are declared by the
//! embedding application; members and methods carry host functions that the
//! compiled code and the reference evaluator both call.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::node::{ArithOp, CmpOp};
use crate::value::{read_lock, write_lock, Thrown, Value};

/// A result-type descriptor.
#[derive(Clone)]
pub enum Type {
    Void,
    Bool,
    I32,
    I64,
    U32,
    U64,
    F64,
    Str,
    /// Any value; the reference type every other type converts to.
    Object,
    /// A type token (`typeof(T)` style constant).
    TypeToken,
    Class(ClassRef),
    Array(Arc<Type>),
    Nullable(Arc<Type>),
    Func(Arc<FuncSig>),
}

impl Type {
    pub fn array(elem: Type) -> Self {
        Type::Array(Arc::new(elem))
    }

    pub fn nullable(inner: Type) -> Self {
        Type::Nullable(Arc::new(inner))
    }

    pub fn func(params: Vec<Type>, ret: Type) -> Self {
        Type::Func(Arc::new(FuncSig::new(params, ret)))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Bool and the numeric types.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Type::Bool | Type::I32 | Type::I64 | Type::U32 | Type::U64 | Type::F64
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Type::I32 | Type::I64 | Type::U32 | Type::U64 | Type::F64
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::I32 | Type::I64 | Type::U32 | Type::U64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Type::U32 | Type::U64)
    }

    /// Types stored inline and copied on load: primitives, nullables and
    /// value-type classes.
    pub fn is_value_type(&self) -> bool {
        match self {
            Type::Nullable(_) => true,
            Type::Class(class) => class.is_value_type(),
            other => other.is_primitive(),
        }
    }

    /// A value-type class (a struct with fields).
    pub fn is_struct(&self) -> bool {
        matches!(self, Type::Class(class) if class.is_value_type())
    }

    pub fn is_reference(&self) -> bool {
        !self.is_void() && !self.is_value_type()
    }

    /// True if `Null` is a valid value of this type.
    pub fn admits_null(&self) -> bool {
        matches!(self, Type::Nullable(_)) || self.is_reference()
    }

    /// The underlying type of a nullable, or the type itself.
    pub fn non_nullable(&self) -> &Type {
        match self {
            Type::Nullable(inner) => inner,
            other => other,
        }
    }

    pub fn class(&self) -> Option<&ClassRef> {
        match self {
            Type::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Array(elem) => Some(elem),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<&FuncSig> {
        match self {
            Type::Func(sig) => Some(sig),
            _ => None,
        }
    }

    /// Static assignability: a value of type `from` may be stored where `self`
    /// is expected without an explicit conversion.
    pub fn accepts(&self, from: &Type) -> bool {
        if self == from {
            return true;
        }
        match (self, from) {
            (Type::Object, from) => from.is_reference(),
            (Type::Class(to), Type::Class(from)) => from.derives_from(to),
            _ => false,
        }
    }

    /// The zero value for this type.
    pub fn default_value(&self) -> Value {
        match self {
            Type::Bool => Value::Bool(false),
            Type::I32 => Value::I32(0),
            Type::I64 => Value::I64(0),
            Type::U32 => Value::U32(0),
            Type::U64 => Value::U64(0),
            Type::F64 => Value::F64(0.0),
            Type::Class(class) if class.is_value_type() => Value::new_struct(
                class.clone(),
                class.fields().iter().map(|f| f.ty.default_value()).collect(),
            ),
            _ => Value::Null,
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Type::Class(a), Type::Class(b)) => Arc::ptr_eq(a, b),
            (Type::Array(a), Type::Array(b)) => a == b,
            (Type::Nullable(a), Type::Nullable(b)) => a == b,
            (Type::Func(a), Type::Func(b)) => a == b,
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl Eq for Type {}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::U32 => write!(f, "u32"),
            Type::U64 => write!(f, "u64"),
            Type::F64 => write!(f, "f64"),
            Type::Str => write!(f, "string"),
            Type::Object => write!(f, "object"),
            Type::TypeToken => write!(f, "type"),
            Type::Class(class) => write!(f, "{}", class.name()),
            Type::Array(elem) => write!(f, "{elem}[]"),
            Type::Nullable(inner) => write!(f, "{inner}?"),
            Type::Func(sig) => write!(f, "{sig}"),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A callable signature.
#[derive(Clone, PartialEq, Eq)]
pub struct FuncSig {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl FuncSig {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for FuncSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

impl fmt::Debug for FuncSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Shared handle to a class definition. Compared by identity.
pub type ClassRef = Arc<ClassDef>;

/// An instance field declaration.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: Arc<str>,
    pub ty: Type,
}

/// A class declared by the host.
pub struct ClassDef {
    name: Arc<str>,
    base: Option<ClassRef>,
    value_type: bool,
    fields: Vec<FieldDef>,
    operators: RwLock<Vec<OperatorDef>>,
}

impl ClassDef {
    /// Starts a reference-type class declaration.
    pub fn build(name: impl Into<Arc<str>>) -> ClassBuilder {
        ClassBuilder {
            name: name.into(),
            base: None,
            value_type: false,
            fields: Vec::new(),
        }
    }

    /// Starts a value-type (struct) declaration.
    pub fn build_struct(name: impl Into<Arc<str>>) -> ClassBuilder {
        ClassBuilder {
            value_type: true,
            ..Self::build(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Option<&ClassRef> {
        self.base.as_ref()
    }

    pub fn is_value_type(&self) -> bool {
        self.value_type
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Index of the named field, including inherited fields.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| &*f.name == name)
    }

    /// True if `self` is `other` or one of its subclasses.
    pub fn derives_from(&self, other: &ClassDef) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if std::ptr::eq(class, other) {
                return true;
            }
            current = class.base.as_deref();
        }
        false
    }

    /// Registers a user-defined operator. The method must be static and take
    /// exactly the two operand types.
    pub fn add_operator(&self, op: Operator, method: MethodRef) {
        write_lock(&self.operators).push(OperatorDef { op, method });
    }

    fn find_operator(&self, op: Operator, left: &Type, right: &Type) -> Option<MethodRef> {
        read_lock(&self.operators)
            .iter()
            .find(|def| {
                def.op == op
                    && def.method.params.len() == 2
                    && &def.method.params[0] == left
                    && &def.method.params[1] == right
            })
            .map(|def| def.method.clone())
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("value_type", &self.value_type)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Builder for [`ClassDef`].
pub struct ClassBuilder {
    name: Arc<str>,
    base: Option<ClassRef>,
    value_type: bool,
    fields: Vec<FieldDef>,
}

impl ClassBuilder {
    /// Inherits the base class' fields.
    pub fn extends(mut self, base: &ClassRef) -> Self {
        let mut fields = base.fields.clone();
        fields.append(&mut self.fields);
        self.fields = fields;
        self.base = Some(base.clone());
        self
    }

    pub fn field(mut self, name: impl Into<Arc<str>>, ty: Type) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn finish(self) -> ClassRef {
        Arc::new(ClassDef {
            name: self.name,
            base: self.base,
            value_type: self.value_type,
            fields: self.fields,
            operators: RwLock::new(Vec::new()),
        })
    }
}

/// An overloadable operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Arith(ArithOp),
    Cmp(CmpOp),
}

/// A user-defined operator bound to a static method.
#[derive(Debug, Clone)]
pub struct OperatorDef {
    pub op: Operator,
    pub method: MethodRef,
}

/// Finds the overload for `op` whose parameter types match the operands exactly.
pub fn resolve_operator(op: Operator, left: &Type, right: &Type) -> Option<MethodRef> {
    [left, right]
        .into_iter()
        .filter_map(|ty| ty.non_nullable().class())
        .find_map(|class| class.find_operator(op, left, right))
}

/// Host function backing a method: `(receiver, args)`. Static methods receive `Null`.
pub type HostFn = Arc<dyn Fn(&mut Value, &[Value]) -> Result<Value, Thrown> + Send + Sync>;

/// Host function backing a constructor.
pub type CtorFn = Arc<dyn Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync>;

/// Host getter: `(receiver) -> value`.
pub type GetterFn = Arc<dyn Fn(&Value) -> Result<Value, Thrown> + Send + Sync>;

/// Host setter: `(receiver, value)`.
pub type SetterFn = Arc<dyn Fn(&mut Value, Value) -> Result<(), Thrown> + Send + Sync>;

/// Host indexer getter: `(receiver, index args) -> value`.
pub type IndexGetFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, Thrown> + Send + Sync>;

/// Host indexer setter: `(receiver, index args, value)`.
pub type IndexSetFn = Arc<dyn Fn(&mut Value, &[Value], Value) -> Result<(), Thrown> + Send + Sync>;

pub type MethodRef = Arc<MethodDef>;
pub type CtorRef = Arc<CtorDef>;
pub type IndexerRef = Arc<IndexerDef>;

/// A host method.
pub struct MethodDef {
    pub name: Arc<str>,
    /// Receiver type for instance methods, `None` for static methods.
    pub receiver: Option<Type>,
    pub params: Vec<Type>,
    pub ret: Type,
    pub func: HostFn,
}

impl MethodDef {
    pub fn new_static(
        name: impl Into<Arc<str>>,
        params: Vec<Type>,
        ret: Type,
        func: impl Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync + 'static,
    ) -> MethodRef {
        Arc::new(Self {
            name: name.into(),
            receiver: None,
            params,
            ret,
            func: Arc::new(move |_: &mut Value, args: &[Value]| func(args)),
        })
    }

    pub fn new_instance(
        name: impl Into<Arc<str>>,
        receiver: Type,
        params: Vec<Type>,
        ret: Type,
        func: impl Fn(&mut Value, &[Value]) -> Result<Value, Thrown> + Send + Sync + 'static,
    ) -> MethodRef {
        Arc::new(Self {
            name: name.into(),
            receiver: Some(receiver),
            params,
            ret,
            func: Arc::new(func),
        })
    }

    pub fn is_static(&self) -> bool {
        self.receiver.is_none()
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.receiver {
            Some(recv) => write!(f, "{recv}::{}", self.name),
            None => write!(f, "static {}", self.name),
        }
    }
}

/// A host constructor.
pub struct CtorDef {
    pub ty: Type,
    pub params: Vec<Type>,
    pub func: CtorFn,
}

impl CtorDef {
    pub fn new(
        ty: Type,
        params: Vec<Type>,
        func: impl Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync + 'static,
    ) -> CtorRef {
        Arc::new(Self {
            ty,
            params,
            func: Arc::new(func),
        })
    }
}

impl fmt::Debug for CtorDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "new {}({} args)", self.ty, self.params.len())
    }
}

/// A host property with a getter and an optional setter.
pub struct PropertyDef {
    pub name: Arc<str>,
    pub ty: Type,
    pub getter: GetterFn,
    pub setter: Option<SetterFn>,
}

/// A static member cell.
pub struct StaticDef {
    pub name: Arc<str>,
    pub ty: Type,
    cell: RwLock<Value>,
}

impl StaticDef {
    pub fn new(name: impl Into<Arc<str>>, ty: Type, initial: Value) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ty,
            cell: RwLock::new(initial),
        })
    }

    pub fn load(&self) -> Value {
        read_lock(&self.cell).clone()
    }

    pub fn store(&self, value: Value) {
        *write_lock(&self.cell) = value;
    }
}

/// A host indexer (`receiver[args]`).
pub struct IndexerDef {
    pub owner: Type,
    pub params: Vec<Type>,
    pub ty: Type,
    pub getter: IndexGetFn,
    pub setter: Option<IndexSetFn>,
}

impl fmt::Debug for IndexerDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{} args]", self.owner, self.params.len())
    }
}

/// The target of a member access.
#[derive(Clone)]
pub enum Member {
    /// Instance field by index into the class' field list.
    Field { class: ClassRef, index: usize },
    Property(Arc<PropertyDef>),
    Static(Arc<StaticDef>),
}

impl Member {
    /// Looks up an instance field by name.
    pub fn field(class: &ClassRef, name: &str) -> Option<Self> {
        class.field_index(name).map(|index| Member::Field {
            class: class.clone(),
            index,
        })
    }

    pub fn property(
        name: impl Into<Arc<str>>,
        ty: Type,
        getter: impl Fn(&Value) -> Result<Value, Thrown> + Send + Sync + 'static,
        setter: Option<SetterFn>,
    ) -> Self {
        Member::Property(Arc::new(PropertyDef {
            name: name.into(),
            ty,
            getter: Arc::new(getter),
            setter,
        }))
    }

    pub fn ty(&self) -> Type {
        match self {
            Member::Field { class, index } => class.fields[*index].ty.clone(),
            Member::Property(prop) => prop.ty.clone(),
            Member::Static(cell) => cell.ty.clone(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Member::Field { class, index } => &class.fields[*index].name,
            Member::Property(prop) => &prop.name,
            Member::Static(cell) => &cell.name,
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Member::Static(_))
    }

    pub fn is_writable(&self) -> bool {
        match self {
            Member::Property(prop) => prop.setter.is_some(),
            _ => true,
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Field { class, .. } => write!(f, "field {}.{}", class.name(), self.name()),
            Member::Property(_) => write!(f, "property {}", self.name()),
            Member::Static(_) => write!(f, "static {}", self.name()),
        }
    }
}
