//! Scope descriptors handed over by a front end's resolver.
//!
//! They only carry what the emitted scope instructions need: slot ranges and
//! the symbols that must be finalized when the scope ends.

use tidal_core::SymbolRef;

/// A lexical block inside a function.
///
/// `from..=to_inclusive` is the range of local slots the block (and its
/// nested blocks) may touch; `to` is the last slot declared directly in it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeScopeBlock {
    pub from: i32,
    pub to: i32,
    pub to_inclusive: i32,
    /// Locals declared `<close>` in this block, in declaration order.
    pub to_be_closed: Vec<SymbolRef>,
}

impl RuntimeScopeBlock {
    pub fn new(from: i32, to: i32, to_inclusive: i32) -> Self {
        Self {
            from,
            to,
            to_inclusive,
            to_be_closed: Vec::new(),
        }
    }

    pub fn with_closers(mut self, closers: Vec<SymbolRef>) -> Self {
        self.to_be_closed = closers;
        self
    }

    /// Closers living in the nested part of the range (`index > to`).
    pub fn nested_closers(&self) -> Vec<SymbolRef> {
        self.to_be_closed
            .iter()
            .filter(|s| s.index() as i64 > self.to as i64)
            .cloned()
            .collect()
    }
}

/// The locals layout of one function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeScopeFrame {
    /// Every local of the function, indexed by slot, for debuggers and
    /// by-name lookup.
    pub debug_symbols: Vec<SymbolRef>,
    /// Number of local slots to allocate.
    pub count: usize,
    /// Last slot of the function's root block, or `-1` when it has none.
    pub to_first_block: i32,
}

impl RuntimeScopeFrame {
    pub fn new(debug_symbols: Vec<SymbolRef>, to_first_block: i32) -> Self {
        Self {
            count: debug_symbols.len(),
            debug_symbols,
            to_first_block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_core::SymbolAttributes;

    #[test]
    fn nested_closers_are_past_the_block_end() {
        let a = SymbolRef::local_with("a", 1, SymbolAttributes::TO_BE_CLOSED);
        let b = SymbolRef::local_with("b", 4, SymbolAttributes::TO_BE_CLOSED);
        let block = RuntimeScopeBlock::new(0, 2, 5).with_closers(vec![a, b.clone()]);
        assert_eq!(block.nested_closers(), vec![b]);
    }

    #[test]
    fn frame_counts_its_symbols() {
        let frame = RuntimeScopeFrame::new(
            vec![SymbolRef::local("x", 0), SymbolRef::local("y", 1)],
            1,
        );
        assert_eq!(frame.count, 2);
    }
}
