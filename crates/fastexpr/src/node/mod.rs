//! Expression node model.
//!
//! Two representations are accepted by the compiler: the owned [`Expr`] tree
//! and the arena-backed [`FlatTree`]. Both expose their kind and result type
//! without touching children and produce children on demand as a [`Shape`],
//! the single per-kind view every pass matches on.

mod expr;
mod flat;


use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::types::{CtorRef, IndexerRef, Member, MethodRef, Type};
use crate::value::Value;

pub use expr::Expr;
pub use flat::{FlatId, FlatRef, FlatTree};

/// Node kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Constant,
    Parameter,
    Convert,
    ArrayIndex,
    Call,
    MemberAccess,
    New,
    NewArray,
    MemberInit,
    Lambda,
    Invoke,
    Comparison,
    Arithmetic,
    Unary,
    Logical,
    Coalesce,
    Conditional,
    Assign,
    Block,
    Try,
    Throw,
    Default,
    Index,
}

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    /// Logical not on bools, bitwise complement on integers.
    Not,
    ArrayLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    AndAlso,
    OrElse,
}

/// A formal parameter or block variable. Equality is reference identity:
/// two parameters with the same name and type are distinct unless cloned
/// from the same handle.
#[derive(Clone)]
pub struct Param(Arc<ParamData>);

struct ParamData {
    name: Arc<str>,
    ty: Type,
}

impl Param {
    pub fn new(name: impl Into<Arc<str>>, ty: Type) -> Self {
        Param(Arc::new(ParamData {
            name: name.into(),
            ty,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }
}

impl PartialEq for Param {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Param {}

impl Hash for Param {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0.name, self.0.ty)
    }
}

/// Stable identity of a node within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub owner: usize,
    pub index: usize,
}

/// Array construction form.
#[derive(Clone)]
pub enum ArrayInit<C> {
    /// Elements given explicitly.
    Items(Vec<C>),
    /// Zero-initialised array of the given length.
    Length(C),
}

/// One member assignment in a member-init node.
#[derive(Clone)]
pub struct Binding<C> {
    pub member: Member,
    pub value: C,
}

/// A catch clause.
#[derive(Clone)]
pub struct CatchBlock<C> {
    /// Exception type caught by this clause.
    pub test: Type,
    /// Variable bound to the caught exception, scoped to `body`.
    pub variable: Option<Param>,
    pub filter: Option<C>,
    pub body: C,
}

/// Kind-specific children of a node, generic over the child representation.
#[derive(Clone)]
pub enum Shape<C> {
    Constant(Value),
    Parameter(Param),
    Convert {
        operand: C,
        checked: bool,
        /// User-defined conversion.
        method: Option<MethodRef>,
    },
    ArrayIndex {
        array: C,
        index: C,
    },
    Call {
        receiver: Option<C>,
        method: MethodRef,
        args: Vec<C>,
    },
    MemberAccess {
        receiver: Option<C>,
        member: Member,
    },
    New {
        ctor: CtorRef,
        args: Vec<C>,
    },
    NewArray {
        elem: Type,
        init: ArrayInit<C>,
    },
    MemberInit {
        new: C,
        bindings: Vec<Binding<C>>,
    },
    Lambda {
        params: Vec<Param>,
        body: C,
        name: Option<Arc<str>>,
    },
    Invoke {
        target: C,
        args: Vec<C>,
    },
    Comparison {
        op: CmpOp,
        left: C,
        right: C,
        method: Option<MethodRef>,
    },
    Arithmetic {
        op: ArithOp,
        left: C,
        right: C,
        checked: bool,
        method: Option<MethodRef>,
    },
    Unary {
        op: UnaryOp,
        operand: C,
        checked: bool,
    },
    Logical {
        op: LogicalOp,
        left: C,
        right: C,
    },
    Coalesce {
        left: C,
        right: C,
    },
    Conditional {
        test: C,
        if_true: C,
        if_false: C,
    },
    Assign {
        target: C,
        value: C,
    },
    Block {
        variables: Vec<Param>,
        body: Vec<C>,
    },
    Try {
        body: C,
        handlers: Vec<CatchBlock<C>>,
        finally: Option<C>,
    },
    /// `operand == None` rethrows the exception being handled.
    Throw {
        operand: Option<C>,
    },
    Default,
    Index {
        receiver: C,
        indexer: IndexerRef,
        args: Vec<C>,
    },
}

impl<C> Shape<C> {
    pub fn kind(&self) -> NodeKind {
        match self {
            Shape::Constant(_) => NodeKind::Constant,
            Shape::Parameter(_) => NodeKind::Parameter,
            Shape::Convert { .. } => NodeKind::Convert,
            Shape::ArrayIndex { .. } => NodeKind::ArrayIndex,
            Shape::Call { .. } => NodeKind::Call,
            Shape::MemberAccess { .. } => NodeKind::MemberAccess,
            Shape::New { .. } => NodeKind::New,
            Shape::NewArray { .. } => NodeKind::NewArray,
            Shape::MemberInit { .. } => NodeKind::MemberInit,
            Shape::Lambda { .. } => NodeKind::Lambda,
            Shape::Invoke { .. } => NodeKind::Invoke,
            Shape::Comparison { .. } => NodeKind::Comparison,
            Shape::Arithmetic { .. } => NodeKind::Arithmetic,
            Shape::Unary { .. } => NodeKind::Unary,
            Shape::Logical { .. } => NodeKind::Logical,
            Shape::Coalesce { .. } => NodeKind::Coalesce,
            Shape::Conditional { .. } => NodeKind::Conditional,
            Shape::Assign { .. } => NodeKind::Assign,
            Shape::Block { .. } => NodeKind::Block,
            Shape::Try { .. } => NodeKind::Try,
            Shape::Throw { .. } => NodeKind::Throw,
            Shape::Default => NodeKind::Default,
            Shape::Index { .. } => NodeKind::Index,
        }
    }

    /// Rebuilds the shape with every child mapped through `f`, in evaluation
    /// order.
    pub fn map<D>(self, mut f: impl FnMut(C) -> D) -> Shape<D> {
        match self {
            Shape::Constant(v) => Shape::Constant(v),
            Shape::Parameter(p) => Shape::Parameter(p),
            Shape::Convert {
                operand,
                checked,
                method,
            } => Shape::Convert {
                operand: f(operand),
                checked,
                method,
            },
            Shape::ArrayIndex { array, index } => Shape::ArrayIndex {
                array: f(array),
                index: f(index),
            },
            Shape::Call {
                receiver,
                method,
                args,
            } => Shape::Call {
                receiver: receiver.map(&mut f),
                method,
                args: args.into_iter().map(&mut f).collect(),
            },
            Shape::MemberAccess { receiver, member } => Shape::MemberAccess {
                receiver: receiver.map(&mut f),
                member,
            },
            Shape::New { ctor, args } => Shape::New {
                ctor,
                args: args.into_iter().map(&mut f).collect(),
            },
            Shape::NewArray { elem, init } => Shape::NewArray {
                elem,
                init: match init {
                    ArrayInit::Items(items) => {
                        ArrayInit::Items(items.into_iter().map(&mut f).collect())
                    }
                    ArrayInit::Length(len) => ArrayInit::Length(f(len)),
                },
            },
            Shape::MemberInit { new, bindings } => Shape::MemberInit {
                new: f(new),
                bindings: bindings
                    .into_iter()
                    .map(|b| Binding {
                        member: b.member,
                        value: f(b.value),
                    })
                    .collect(),
            },
            Shape::Lambda { params, body, name } => Shape::Lambda {
                params,
                body: f(body),
                name,
            },
            Shape::Invoke { target, args } => Shape::Invoke {
                target: f(target),
                args: args.into_iter().map(&mut f).collect(),
            },
            Shape::Comparison {
                op,
                left,
                right,
                method,
            } => Shape::Comparison {
                op,
                left: f(left),
                right: f(right),
                method,
            },
            Shape::Arithmetic {
                op,
                left,
                right,
                checked,
                method,
            } => Shape::Arithmetic {
                op,
                left: f(left),
                right: f(right),
                checked,
                method,
            },
            Shape::Unary {
                op,
                operand,
                checked,
            } => Shape::Unary {
                op,
                operand: f(operand),
                checked,
            },
            Shape::Logical { op, left, right } => Shape::Logical {
                op,
                left: f(left),
                right: f(right),
            },
            Shape::Coalesce { left, right } => Shape::Coalesce {
                left: f(left),
                right: f(right),
            },
            Shape::Conditional {
                test,
                if_true,
                if_false,
            } => Shape::Conditional {
                test: f(test),
                if_true: f(if_true),
                if_false: f(if_false),
            },
            Shape::Assign { target, value } => Shape::Assign {
                target: f(target),
                value: f(value),
            },
            Shape::Block { variables, body } => Shape::Block {
                variables,
                body: body.into_iter().map(&mut f).collect(),
            },
            Shape::Try {
                body,
                handlers,
                finally,
            } => Shape::Try {
                body: f(body),
                handlers: handlers
                    .into_iter()
                    .map(|h| CatchBlock {
                        test: h.test,
                        variable: h.variable,
                        filter: h.filter.map(&mut f),
                        body: f(h.body),
                    })
                    .collect(),
                finally: finally.map(&mut f),
            },
            Shape::Throw { operand } => Shape::Throw {
                operand: operand.map(&mut f),
            },
            Shape::Default => Shape::Default,
            Shape::Index {
                receiver,
                indexer,
                args,
            } => Shape::Index {
                receiver: f(receiver),
                indexer,
                args: args.into_iter().map(&mut f).collect(),
            },
        }
    }

    /// Children in evaluation order.
    pub fn children(&self) -> Vec<&C> {
        let mut out = Vec::new();
        self.as_ref().map(|c| out.push(c));
        out
    }

    pub fn as_ref(&self) -> Shape<&C> {
        match self {
            Shape::Constant(v) => Shape::Constant(v.clone()),
            Shape::Parameter(p) => Shape::Parameter(p.clone()),
            Shape::Convert {
                operand,
                checked,
                method,
            } => Shape::Convert {
                operand,
                checked: *checked,
                method: method.clone(),
            },
            Shape::ArrayIndex { array, index } => Shape::ArrayIndex { array, index },
            Shape::Call {
                receiver,
                method,
                args,
            } => Shape::Call {
                receiver: receiver.as_ref(),
                method: method.clone(),
                args: args.iter().collect(),
            },
            Shape::MemberAccess { receiver, member } => Shape::MemberAccess {
                receiver: receiver.as_ref(),
                member: member.clone(),
            },
            Shape::New { ctor, args } => Shape::New {
                ctor: ctor.clone(),
                args: args.iter().collect(),
            },
            Shape::NewArray { elem, init } => Shape::NewArray {
                elem: elem.clone(),
                init: match init {
                    ArrayInit::Items(items) => ArrayInit::Items(items.iter().collect()),
                    ArrayInit::Length(len) => ArrayInit::Length(len),
                },
            },
            Shape::MemberInit { new, bindings } => Shape::MemberInit {
                new,
                bindings: bindings
                    .iter()
                    .map(|b| Binding {
                        member: b.member.clone(),
                        value: &b.value,
                    })
                    .collect(),
            },
            Shape::Lambda { params, body, name } => Shape::Lambda {
                params: params.clone(),
                body,
                name: name.clone(),
            },
            Shape::Invoke { target, args } => Shape::Invoke {
                target,
                args: args.iter().collect(),
            },
            Shape::Comparison {
                op,
                left,
                right,
                method,
            } => Shape::Comparison {
                op: *op,
                left,
                right,
                method: method.clone(),
            },
            Shape::Arithmetic {
                op,
                left,
                right,
                checked,
                method,
            } => Shape::Arithmetic {
                op: *op,
                left,
                right,
                checked: *checked,
                method: method.clone(),
            },
            Shape::Unary {
                op,
                operand,
                checked,
            } => Shape::Unary {
                op: *op,
                operand,
                checked: *checked,
            },
            Shape::Logical { op, left, right } => Shape::Logical {
                op: *op,
                left,
                right,
            },
            Shape::Coalesce { left, right } => Shape::Coalesce { left, right },
            Shape::Conditional {
                test,
                if_true,
                if_false,
            } => Shape::Conditional {
                test,
                if_true,
                if_false,
            },
            Shape::Assign { target, value } => Shape::Assign { target, value },
            Shape::Block { variables, body } => Shape::Block {
                variables: variables.clone(),
                body: body.iter().collect(),
            },
            Shape::Try {
                body,
                handlers,
                finally,
            } => Shape::Try {
                body,
                handlers: handlers
                    .iter()
                    .map(|h| CatchBlock {
                        test: h.test.clone(),
                        variable: h.variable.clone(),
                        filter: h.filter.as_ref(),
                        body: &h.body,
                    })
                    .collect(),
                finally: finally.as_ref(),
            },
            Shape::Throw { operand } => Shape::Throw {
                operand: operand.as_ref(),
            },
            Shape::Default => Shape::Default,
            Shape::Index {
                receiver,
                indexer,
                args,
            } => Shape::Index {
                receiver,
                indexer: indexer.clone(),
                args: args.iter().collect(),
            },
        }
    }
}

/// Uniform read-only view over a node of either representation.
///
/// `kind` and `ty` are O(1); `shape` materialises the direct children only.
pub trait ExpressionNode: Clone {
    fn kind(&self) -> NodeKind;

    fn ty(&self) -> &Type;

    /// Identity used to deduplicate constants.
    fn id(&self) -> NodeId;

    fn shape(&self) -> Shape<Self>;

    /// Converts to an owned tree for the reference evaluator.
    fn to_expr(&self) -> Expr;
}
