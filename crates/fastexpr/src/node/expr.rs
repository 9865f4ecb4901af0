//! Owned expression trees with typed constructors.

use std::fmt;
use std::sync::Arc;

use super::{
    ArithOp, ArrayInit, Binding, CatchBlock, CmpOp, ExpressionNode, LogicalOp, NodeId, NodeKind,
    Param, Shape, UnaryOp,
};
use crate::types::{CtorRef, FuncSig, IndexerRef, Member, MethodRef, Type};
use crate::value::Value;

/// An immutable, reference-counted expression node.
///
/// Cloning shares the node; a node reachable from several parents keeps a
/// single identity.
#[derive(Clone)]
pub struct Expr(Arc<ExprData>);

struct ExprData {
    ty: Type,
    shape: Shape<Expr>,
}

impl Expr {
    /// Creates a node with an explicit result type.
    pub fn new(ty: Type, shape: Shape<Expr>) -> Self {
        Expr(Arc::new(ExprData { ty, shape }))
    }

    pub fn constant(value: impl Into<Value>, ty: Type) -> Self {
        Self::new(ty, Shape::Constant(value.into()))
    }

    pub fn int(n: i32) -> Self {
        Self::constant(n, Type::I32)
    }

    pub fn long(n: i64) -> Self {
        Self::constant(n, Type::I64)
    }

    pub fn bool(b: bool) -> Self {
        Self::constant(b, Type::Bool)
    }

    pub fn string(s: &str) -> Self {
        Self::constant(s, Type::Str)
    }

    pub fn null(ty: Type) -> Self {
        Self::constant(Value::Null, ty)
    }

    pub fn param(p: &Param) -> Self {
        Self::new(p.ty().clone(), Shape::Parameter(p.clone()))
    }

    pub fn convert(operand: Expr, to: Type) -> Self {
        Self::new(
            to,
            Shape::Convert {
                operand,
                checked: false,
                method: None,
            },
        )
    }

    pub fn convert_checked(operand: Expr, to: Type) -> Self {
        Self::new(
            to,
            Shape::Convert {
                operand,
                checked: true,
                method: None,
            },
        )
    }

    /// Conversion through a user-defined static method.
    pub fn convert_with(operand: Expr, method: MethodRef) -> Self {
        Self::new(
            method.ret.clone(),
            Shape::Convert {
                operand,
                checked: false,
                method: Some(method),
            },
        )
    }

    pub fn array_index(array: Expr, index: Expr) -> Self {
        let ty = array.ty().element().cloned().unwrap_or(Type::Object);
        Self::new(ty, Shape::ArrayIndex { array, index })
    }

    pub fn call(receiver: Option<Expr>, method: MethodRef, args: Vec<Expr>) -> Self {
        Self::new(
            method.ret.clone(),
            Shape::Call {
                receiver,
                method,
                args,
            },
        )
    }

    pub fn call_static(method: MethodRef, args: Vec<Expr>) -> Self {
        Self::call(None, method, args)
    }

    /// Instance member access; static members pass `None`.
    pub fn member(receiver: Option<Expr>, member: Member) -> Self {
        Self::new(member.ty(), Shape::MemberAccess { receiver, member })
    }

    pub fn field(receiver: Expr, member: Member) -> Self {
        Self::member(Some(receiver), member)
    }

    pub fn new_object(ctor: CtorRef, args: Vec<Expr>) -> Self {
        Self::new(ctor.ty.clone(), Shape::New { ctor, args })
    }

    pub fn new_array(elem: Type, items: Vec<Expr>) -> Self {
        Self::new(
            Type::array(elem.clone()),
            Shape::NewArray {
                elem,
                init: ArrayInit::Items(items),
            },
        )
    }

    pub fn new_array_bounds(elem: Type, length: Expr) -> Self {
        Self::new(
            Type::array(elem.clone()),
            Shape::NewArray {
                elem,
                init: ArrayInit::Length(length),
            },
        )
    }

    pub fn member_init(new: Expr, bindings: Vec<(Member, Expr)>) -> Self {
        let bindings = bindings
            .into_iter()
            .map(|(member, value)| Binding { member, value })
            .collect();
        Self::new(new.ty().clone(), Shape::MemberInit { new, bindings })
    }

    pub fn lambda(params: Vec<Param>, body: Expr) -> Self {
        Self::lambda_node(params, body, None)
    }

    pub fn lambda_named(name: &str, params: Vec<Param>, body: Expr) -> Self {
        Self::lambda_node(params, body, Some(name.into()))
    }

    fn lambda_node(params: Vec<Param>, body: Expr, name: Option<Arc<str>>) -> Self {
        let sig = FuncSig::new(
            params.iter().map(|p| p.ty().clone()).collect(),
            body.ty().clone(),
        );
        Self::new(Type::Func(Arc::new(sig)), Shape::Lambda { params, body, name })
    }

    pub fn invoke(target: Expr, args: Vec<Expr>) -> Self {
        let ty = target
            .ty()
            .signature()
            .map(|sig| sig.ret.clone())
            .unwrap_or(Type::Object);
        Self::new(ty, Shape::Invoke { target, args })
    }

    pub fn compare(op: CmpOp, left: Expr, right: Expr) -> Self {
        Self::new(
            Type::Bool,
            Shape::Comparison {
                op,
                left,
                right,
                method: None,
            },
        )
    }

    /// Comparison through a user-defined operator method.
    pub fn compare_with(op: CmpOp, left: Expr, right: Expr, method: MethodRef) -> Self {
        Self::new(
            method.ret.clone(),
            Shape::Comparison {
                op,
                left,
                right,
                method: Some(method),
            },
        )
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::compare(CmpOp::Eq, left, right)
    }

    pub fn ne(left: Expr, right: Expr) -> Self {
        Self::compare(CmpOp::Ne, left, right)
    }

    pub fn lt(left: Expr, right: Expr) -> Self {
        Self::compare(CmpOp::Lt, left, right)
    }

    pub fn gt(left: Expr, right: Expr) -> Self {
        Self::compare(CmpOp::Gt, left, right)
    }

    fn arith_node(op: ArithOp, left: Expr, right: Expr, checked: bool) -> Self {
        let concat = op == ArithOp::Add && (left.ty() == &Type::Str || right.ty() == &Type::Str);
        let ty = if concat { Type::Str } else { left.ty().clone() };
        Self::new(
            ty,
            Shape::Arithmetic {
                op,
                left,
                right,
                checked,
                method: None,
            },
        )
    }

    pub fn arith(op: ArithOp, left: Expr, right: Expr) -> Self {
        Self::arith_node(op, left, right, false)
    }

    pub fn arith_checked(op: ArithOp, left: Expr, right: Expr) -> Self {
        Self::arith_node(op, left, right, true)
    }

    /// Arithmetic through a user-defined operator method.
    pub fn arith_with(op: ArithOp, left: Expr, right: Expr, method: MethodRef) -> Self {
        Self::new(
            method.ret.clone(),
            Shape::Arithmetic {
                op,
                left,
                right,
                checked: false,
                method: Some(method),
            },
        )
    }

    pub fn add(left: Expr, right: Expr) -> Self {
        Self::arith(ArithOp::Add, left, right)
    }

    pub fn sub(left: Expr, right: Expr) -> Self {
        Self::arith(ArithOp::Sub, left, right)
    }

    pub fn mul(left: Expr, right: Expr) -> Self {
        Self::arith(ArithOp::Mul, left, right)
    }

    pub fn div(left: Expr, right: Expr) -> Self {
        Self::arith(ArithOp::Div, left, right)
    }

    pub fn negate(operand: Expr) -> Self {
        Self::unary(UnaryOp::Negate, operand, false)
    }

    pub fn negate_checked(operand: Expr) -> Self {
        Self::unary(UnaryOp::Negate, operand, true)
    }

    pub fn not(operand: Expr) -> Self {
        Self::unary(UnaryOp::Not, operand, false)
    }

    pub fn array_length(array: Expr) -> Self {
        Self::new(
            Type::I32,
            Shape::Unary {
                op: UnaryOp::ArrayLength,
                operand: array,
                checked: false,
            },
        )
    }

    fn unary(op: UnaryOp, operand: Expr, checked: bool) -> Self {
        Self::new(
            operand.ty().clone(),
            Shape::Unary {
                op,
                operand,
                checked,
            },
        )
    }

    pub fn and_also(left: Expr, right: Expr) -> Self {
        Self::new(
            Type::Bool,
            Shape::Logical {
                op: LogicalOp::AndAlso,
                left,
                right,
            },
        )
    }

    pub fn or_else(left: Expr, right: Expr) -> Self {
        Self::new(
            Type::Bool,
            Shape::Logical {
                op: LogicalOp::OrElse,
                left,
                right,
            },
        )
    }

    /// `left ?? right`. A nullable left with a right of its underlying type
    /// yields the underlying type.
    pub fn coalesce(left: Expr, right: Expr) -> Self {
        let ty = match left.ty() {
            Type::Nullable(inner) if &**inner == right.ty() => right.ty().clone(),
            other => other.clone(),
        };
        Self::new(ty, Shape::Coalesce { left, right })
    }

    pub fn condition(test: Expr, if_true: Expr, if_false: Expr) -> Self {
        let ty = if_true.ty().clone();
        Self::condition_typed(test, if_true, if_false, ty)
    }

    pub fn condition_typed(test: Expr, if_true: Expr, if_false: Expr, ty: Type) -> Self {
        Self::new(
            ty,
            Shape::Conditional {
                test,
                if_true,
                if_false,
            },
        )
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Self::new(target.ty().clone(), Shape::Assign { target, value })
    }

    /// A block yields the value of its last expression.
    pub fn block(variables: Vec<Param>, body: Vec<Expr>) -> Self {
        let ty = body.last().map(|e| e.ty().clone()).unwrap_or(Type::Void);
        Self::block_typed(variables, body, ty)
    }

    pub fn block_typed(variables: Vec<Param>, body: Vec<Expr>, ty: Type) -> Self {
        Self::new(ty, Shape::Block { variables, body })
    }

    pub fn try_catch(body: Expr, handlers: Vec<CatchBlock<Expr>>) -> Self {
        Self::try_catch_finally(body, handlers, None)
    }

    pub fn try_finally(body: Expr, finally: Expr) -> Self {
        Self::try_catch_finally(body, Vec::new(), Some(finally))
    }

    pub fn try_catch_finally(
        body: Expr,
        handlers: Vec<CatchBlock<Expr>>,
        finally: Option<Expr>,
    ) -> Self {
        Self::new(
            body.ty().clone(),
            Shape::Try {
                body,
                handlers,
                finally,
            },
        )
    }

    pub fn catch(test: Type, variable: Option<Param>, body: Expr) -> CatchBlock<Expr> {
        CatchBlock {
            test,
            variable,
            filter: None,
            body,
        }
    }

    pub fn catch_filtered(
        test: Type,
        variable: Option<Param>,
        filter: Expr,
        body: Expr,
    ) -> CatchBlock<Expr> {
        CatchBlock {
            test,
            variable,
            filter: Some(filter),
            body,
        }
    }

    pub fn throw(operand: Expr) -> Self {
        Self::throw_typed(operand, Type::Void)
    }

    /// A throw used in value position.
    pub fn throw_typed(operand: Expr, ty: Type) -> Self {
        Self::new(
            ty,
            Shape::Throw {
                operand: Some(operand),
            },
        )
    }

    pub fn rethrow() -> Self {
        Self::new(Type::Void, Shape::Throw { operand: None })
    }

    pub fn default(ty: Type) -> Self {
        Self::new(ty, Shape::Default)
    }

    pub fn index(receiver: Expr, indexer: IndexerRef, args: Vec<Expr>) -> Self {
        Self::new(
            indexer.ty.clone(),
            Shape::Index {
                receiver,
                indexer,
                args,
            },
        )
    }

    /// Borrowed view of this node's shape.
    pub fn shape_ref(&self) -> &Shape<Expr> {
        &self.0.shape
    }

    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl ExpressionNode for Expr {
    fn kind(&self) -> NodeKind {
        self.0.shape.kind()
    }

    fn ty(&self) -> &Type {
        &self.0.ty
    }

    fn id(&self) -> NodeId {
        NodeId {
            owner: 0,
            index: self.addr(),
        }
    }

    fn shape(&self) -> Shape<Self> {
        self.0.shape.clone()
    }

    fn to_expr(&self) -> Expr {
        self.clone()
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind(), self.ty())
    }
}
