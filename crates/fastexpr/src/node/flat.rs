//! Arena-backed expression trees.
//!
//! Nodes live in one vector and refer to their children by index, which keeps
//! large generated trees in a single allocation.

use std::collections::HashMap;

use super::{ExpressionNode, NodeId, NodeKind, Shape};
use crate::node::Expr;
use crate::types::Type;

/// Index of a node inside its [`FlatTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlatId(pub(crate) u32);

struct FlatNode {
    ty: Type,
    shape: Shape<FlatId>,
}

/// An expression tree stored as an arena.
#[derive(Default)]
pub struct FlatTree {
    nodes: Vec<FlatNode>,
    root: Option<FlatId>,
}

impl FlatTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node whose children were pushed earlier.
    ///
    /// # Panics
    ///
    /// Panics if a child id does not refer to an existing node.
    pub fn push(&mut self, ty: Type, shape: Shape<FlatId>) -> FlatId {
        let len = self.nodes.len() as u32;
        for child in shape.children() {
            assert!(child.0 < len, "child {child:?} pushed after its parent");
        }
        self.nodes.push(FlatNode { ty, shape });
        FlatId(len)
    }

    pub fn set_root(&mut self, root: FlatId) {
        self.root = Some(root);
    }

    /// Flattens an owned tree. Shared subtrees stay shared.
    pub fn from_expr(expr: &Expr) -> Self {
        let mut tree = FlatTree::new();
        let mut memo = HashMap::new();
        let root = tree.intern(expr, &mut memo);
        tree.set_root(root);
        tree
    }

    fn intern(&mut self, expr: &Expr, memo: &mut HashMap<usize, FlatId>) -> FlatId {
        if let Some(id) = memo.get(&expr.addr()) {
            return *id;
        }
        let shape = expr.shape_ref().as_ref().map(|child| self.intern(child, memo));
        let id = self.push(expr.ty().clone(), shape);
        memo.insert(expr.addr(), id);
        id
    }

    /// The root node.
    ///
    /// # Panics
    ///
    /// Panics if no root was set.
    pub fn root(&self) -> FlatRef<'_> {
        let id = self.root.expect("flat tree has no root");
        self.get(id)
    }

    pub fn get(&self, id: FlatId) -> FlatRef<'_> {
        FlatRef { tree: self, id }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A borrowed node of a [`FlatTree`].
#[derive(Clone, Copy)]
pub struct FlatRef<'a> {
    tree: &'a FlatTree,
    id: FlatId,
}

impl<'a> FlatRef<'a> {
    fn node(&self) -> &'a FlatNode {
        &self.tree.nodes[self.id.0 as usize]
    }

    pub fn flat_id(&self) -> FlatId {
        self.id
    }
}

impl ExpressionNode for FlatRef<'_> {
    fn kind(&self) -> NodeKind {
        self.node().shape.kind()
    }

    fn ty(&self) -> &Type {
        &self.node().ty
    }

    fn id(&self) -> NodeId {
        NodeId {
            owner: self.tree as *const FlatTree as usize,
            index: self.id.0 as usize,
        }
    }

    fn shape(&self) -> Shape<Self> {
        let tree = self.tree;
        self.node().shape.clone().map(|id| FlatRef { tree, id })
    }

    fn to_expr(&self) -> Expr {
        let shape = self.shape().map(|child| child.to_expr());
        Expr::new(self.ty().clone(), shape)
    }
}
