//! Closure information gathered by analysis and its materialised form.
//!
//! A compiled unit with captures receives one closure value as its implicit
//! first argument. Items are always ordered constants, then captured
//! parameters, then nested lambda artifacts; [`ClosureLayout::slot`] is the
//! only place that turns that order into offsets.

mod layout;


use std::sync::Arc;

use crate::compiler::CompiledArtifact;
use crate::node::{NodeId, Param};
use crate::types::{FuncSig, Type};
use crate::value::Value;

pub use layout::{ClosureLayout, ClosureStrategy, ClosureValue, FieldRecord, IndexedClosure, ItemKind};

/// True if a constant is encoded directly in the instruction stream.
pub fn is_immediate(value: &Value) -> bool {
    matches!(
        value,
        Value::Null
            | Value::Bool(_)
            | Value::I32(_)
            | Value::I64(_)
            | Value::U32(_)
            | Value::U64(_)
            | Value::F64(_)
            | Value::Str(_)
            | Value::Type(_)
    )
}

/// A non-immediate constant embedded through the closure.
#[derive(Debug, Clone)]
pub struct ConstantRecord {
    pub node: NodeId,
    pub value: Value,
    pub ty: Type,
}

/// A nested lambda compiled as its own unit.
pub struct NestedLambda {
    /// The lambda node inside the parent tree.
    pub node: NodeId,
    pub artifact: CompiledArtifact,
    /// Items the nested unit expects in its closure; `None` for a bare unit.
    pub info: Option<ClosureInfo>,
    pub sig: Arc<FuncSig>,
}

impl NestedLambda {
    /// Static type of this record's closure item.
    pub fn item_type(&self) -> Type {
        if self.info.is_some() {
            Type::Object
        } else {
            Type::Func(self.sig.clone())
        }
    }

    /// Value stored for this record in a materialised closure.
    pub fn item_value(&self) -> Value {
        self.artifact.item_value()
    }
}

/// Captured items of one compiled unit.
///
/// Appended during a single analysis pass; each kind is deduplicated by
/// identity and keeps first-seen order.
#[derive(Clone, Default)]
pub struct ClosureInfo {
    constants: Vec<ConstantRecord>,
    params: Vec<Param>,
    nested: Vec<Arc<NestedLambda>>,
}

impl ClosureInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constant; returns false if the node was already recorded.
    pub fn add_constant(&mut self, record: ConstantRecord) -> bool {
        if self.constant_index(record.node).is_some() {
            return false;
        }
        self.constants.push(record);
        true
    }

    pub fn add_param(&mut self, param: &Param) -> bool {
        if self.param_index(param).is_some() {
            return false;
        }
        self.params.push(param.clone());
        true
    }

    pub fn add_nested(&mut self, nested: Arc<NestedLambda>) -> bool {
        let seen = self
            .nested
            .iter()
            .any(|n| Arc::ptr_eq(n, &nested) || n.node == nested.node);
        if seen {
            return false;
        }
        self.nested.push(nested);
        true
    }

    pub fn constant_index(&self, node: NodeId) -> Option<usize> {
        self.constants.iter().position(|c| c.node == node)
    }

    pub fn param_index(&self, param: &Param) -> Option<usize> {
        self.params.iter().position(|p| p == param)
    }

    pub fn nested_index(&self, node: NodeId) -> Option<usize> {
        self.nested.iter().position(|n| n.node == node)
    }

    pub fn constants(&self) -> &[ConstantRecord] {
        &self.constants
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn nested(&self) -> &[Arc<NestedLambda>] {
        &self.nested
    }

    /// Total number of closure items.
    pub fn len(&self) -> usize {
        self.constants.len() + self.params.len() + self.nested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds the closure value of a root unit. Root units never capture
    /// parameters, so only constants and nested artifacts are stored.
    pub fn materialize(&self, layout: &ClosureLayout) -> ClosureValue {
        assert!(
            self.params.is_empty(),
            "root closure cannot hold captured parameters"
        );
        let items = self
            .constants
            .iter()
            .map(|c| c.value.clone())
            .chain(self.nested.iter().map(|n| n.item_value()))
            .collect();
        layout.instantiate(items)
    }
}

impl std::fmt::Debug for ClosureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureInfo")
            .field("constants", &self.constants.len())
            .field("params", &self.params)
            .field("nested", &self.nested.len())
            .finish()
    }
}
