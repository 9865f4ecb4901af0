//! Closure storage strategies and the shared offset helper.

use std::sync::{Arc, RwLock};

use fastexpr_config::MAX_FIXED_FIELD_LIMIT;

use super::ClosureInfo;
use crate::types::Type;
use crate::value::{read_lock, write_lock, Value};

/// How closure items are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureStrategy {
    /// One field per item in a fixed-arity record.
    Fixed,
    /// One boxed sequence; loads are type-checked.
    Indexed,
}

/// The three item groups, in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Constant,
    Param,
    Nested,
}

/// Shape of a closure: item counts, item types and storage strategy.
#[derive(Debug, Clone)]
pub struct ClosureLayout {
    constants: usize,
    params: usize,
    nested: usize,
    item_types: Vec<Type>,
    strategy: ClosureStrategy,
}

impl ClosureLayout {
    /// Chooses the strategy for `info`: fixed records up to `fixed_limit`
    /// items, indexed storage above.
    pub fn new(info: &ClosureInfo, fixed_limit: usize) -> Self {
        let item_types: Vec<Type> = info
            .constants()
            .iter()
            .map(|c| c.ty.clone())
            .chain(info.params().iter().map(|p| p.ty().clone()))
            .chain(info.nested().iter().map(|n| n.item_type()))
            .collect();
        let limit = fixed_limit.min(MAX_FIXED_FIELD_LIMIT);
        let strategy = if item_types.len() <= limit {
            ClosureStrategy::Fixed
        } else {
            ClosureStrategy::Indexed
        };
        Self {
            constants: info.constants().len(),
            params: info.params().len(),
            nested: info.nested().len(),
            item_types,
            strategy,
        }
    }

    pub fn strategy(&self) -> ClosureStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.item_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_types.is_empty()
    }

    pub fn count(&self, kind: ItemKind) -> usize {
        match kind {
            ItemKind::Constant => self.constants,
            ItemKind::Param => self.params,
            ItemKind::Nested => self.nested,
        }
    }

    /// Offset of the `index`-th item of `kind`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the group: the emitter and the analysis
    /// disagree on the closure layout.
    pub fn slot(&self, kind: ItemKind, index: usize) -> u16 {
        assert!(
            index < self.count(kind),
            "closure layout mismatch: {kind:?} item {index} of {}",
            self.count(kind)
        );
        let base = match kind {
            ItemKind::Constant => 0,
            ItemKind::Param => self.constants,
            ItemKind::Nested => self.constants + self.params,
        };
        (base + index) as u16
    }

    pub fn item_type(&self, slot: u16) -> &Type {
        &self.item_types[slot as usize]
    }

    /// Builds a closure value holding `items` in layout order.
    ///
    /// # Panics
    ///
    /// Panics if the item count differs from the layout.
    pub fn instantiate(&self, items: Vec<Value>) -> ClosureValue {
        assert_eq!(
            items.len(),
            self.len(),
            "closure layout mismatch: {} items for a layout of {}",
            items.len(),
            self.len()
        );
        match self.strategy {
            ClosureStrategy::Fixed => ClosureValue::Fixed(fixed_record(items)),
            ClosureStrategy::Indexed => ClosureValue::Indexed(Arc::new(IndexedClosure {
                items: items.into_iter().map(RwLock::new).collect(),
            })),
        }
    }
}

/// Storage of a fixed-arity closure record.
pub trait FieldRecord: Send + Sync {
    fn arity(&self) -> usize;

    fn cell(&self, index: usize) -> &RwLock<Value>;
}

struct Record<const N: usize> {
    fields: [RwLock<Value>; N],
}

impl<const N: usize> Record<N> {
    fn new(items: Vec<Value>) -> Self {
        let mut items = items.into_iter();
        Self {
            fields: std::array::from_fn(|_| RwLock::new(items.next().unwrap_or_default())),
        }
    }
}

impl<const N: usize> FieldRecord for Record<N> {
    fn arity(&self) -> usize {
        N
    }

    fn cell(&self, index: usize) -> &RwLock<Value> {
        &self.fields[index]
    }
}

macro_rules! fixed_records {
    ($items:ident; $($n:literal)*) => {
        match $items.len() {
            $($n => Arc::new(Record::<$n>::new($items)) as Arc<dyn FieldRecord>,)*
            n => panic!("no fixed closure record of arity {n}"),
        }
    };
}

fn fixed_record(items: Vec<Value>) -> Arc<dyn FieldRecord> {
    fixed_records!(items; 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16)
}

/// Indexed closure storage.
pub struct IndexedClosure {
    items: Box<[RwLock<Value>]>,
}

/// A materialised closure. Cloning shares the cells.
#[derive(Clone)]
pub enum ClosureValue {
    Fixed(Arc<dyn FieldRecord>),
    Indexed(Arc<IndexedClosure>),
}

impl ClosureValue {
    pub fn strategy(&self) -> ClosureStrategy {
        match self {
            ClosureValue::Fixed(_) => ClosureStrategy::Fixed,
            ClosureValue::Indexed(_) => ClosureStrategy::Indexed,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ClosureValue::Fixed(record) => record.arity(),
            ClosureValue::Indexed(closure) => closure.items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell(&self, slot: u16) -> &RwLock<Value> {
        match self {
            ClosureValue::Fixed(record) => record.cell(slot as usize),
            ClosureValue::Indexed(closure) => &closure.items[slot as usize],
        }
    }

    pub fn get(&self, slot: u16) -> Value {
        read_lock(self.cell(slot)).clone()
    }

    pub fn set(&self, slot: u16, value: Value) {
        *write_lock(self.cell(slot)) = value;
    }
}
