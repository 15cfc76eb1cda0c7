//! Closure and upvalue cell types.

use crate::value::Value;
use crate::ENV_SYMBOL;
use std::sync::{Arc, RwLock};

// ── Upvalue cells ─────────────────────────────────────────────────────────────

/// A shared, mutable variable slot.
///
/// Frame locals live in cells from the moment they are first assigned, so a
/// closure capturing a local simply clones the `Arc`: writes through either
/// side are visible to both for as long as anyone holds the cell.
#[derive(Debug, Clone, Default)]
pub struct ValueCell(Arc<RwLock<Value>>);

impl ValueCell {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn get(&self) -> Value {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = value;
    }

    /// Whether both handles refer to the same slot.
    pub fn ptr_eq(&self, other: &ValueCell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// ── Closure context ───────────────────────────────────────────────────────────

/// The captured cells of a closure, with their source names for debugging.
#[derive(Debug, Default)]
pub struct ClosureContext {
    pub symbols: Vec<Arc<str>>,
    pub cells: Vec<ValueCell>,
}

impl ClosureContext {
    pub fn new(symbols: Vec<Arc<str>>, cells: Vec<ValueCell>) -> Self {
        debug_assert_eq!(symbols.len(), cells.len());
        Self { symbols, cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ValueCell> {
        self.cells.get(index)
    }
}

/// Shape of a closure's captures, as far as binary dumping is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvaluesType {
    /// Nothing captured.
    None,
    /// Only the `_ENV` environment.
    Environment,
    /// Anything else.
    Closure,
}

// ── Closure ───────────────────────────────────────────────────────────────────

/// A runtime closure: an entry address in the shared bytecode paired with
/// its captured upvalue cells.
#[derive(Debug)]
pub struct Closure {
    /// Address of the function's `Meta` instruction.
    pub entry_point: usize,
    pub context: Arc<ClosureContext>,
}

impl Closure {
    pub fn new(entry_point: usize, context: ClosureContext) -> Self {
        Self {
            entry_point,
            context: Arc::new(context),
        }
    }

    pub fn upvalues_count(&self) -> usize {
        self.context.len()
    }

    pub fn upvalue_name(&self, index: usize) -> Option<&str> {
        self.context.symbols.get(index).map(|s| &**s)
    }

    pub fn upvalues_type(&self) -> UpvaluesType {
        if self.context.is_empty() {
            UpvaluesType::None
        } else if self.context.symbols.iter().all(|s| &**s == ENV_SYMBOL) {
            UpvaluesType::Environment
        } else {
            UpvaluesType::Closure
        }
    }
}
