use crate::opcode::{FieldUsage, OpCode};
use crate::symbol::SymbolRef;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Source location of an instruction, for error messages and breakpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub source_id: u32,
    pub from_line: u32,
    pub to_line: u32,
    pub from_char: u32,
    pub to_char: u32,
    /// Cleared for synthetic code the debugger should not stop on.
    pub breakpoint: bool,
}

impl SourceRef {
    pub fn new(source_id: u32, from_line: u32, to_line: u32, from_char: u32, to_char: u32) -> Self {
        Self {
            source_id,
            from_line,
            to_line,
            from_char,
            to_char,
            breakpoint: true,
        }
    }

    /// A single-line location.
    pub fn line(source_id: u32, line: u32, from_char: u32, to_char: u32) -> Self {
        Self::new(source_id, line, line, from_char, to_char)
    }

    pub fn includes_line(&self, line: u32) -> bool {
        (self.from_line..=self.to_line).contains(&line)
    }

    /// Whether `(line, col)` of source `source_id` falls inside this range.
    pub fn includes_location(&self, source_id: u32, line: u32, col: u32) -> bool {
        if source_id != self.source_id || line < self.from_line || line > self.to_line {
            return false;
        }
        if self.from_line == self.to_line {
            col >= self.from_char && col <= self.to_char
        } else if line == self.from_line {
            col >= self.from_char
        } else if line == self.to_line {
            col <= self.to_char
        } else {
            true
        }
    }

    /// Rough distance from `(line, col)` to this range, a line counting as
    /// four columns. `None` for another source.
    pub fn location_distance(&self, source_id: u32, line: u32, col: u32) -> Option<u32> {
        const TAB_WIDTH: u32 = 4;
        if source_id != self.source_id {
            return None;
        }
        let d = if self.from_line == self.to_line {
            if line == self.from_line {
                if col < self.from_char {
                    self.from_char - col
                } else {
                    col.saturating_sub(self.to_char)
                }
            } else {
                line.abs_diff(self.from_line) * TAB_WIDTH
            }
        } else if line == self.from_line {
            self.from_char.saturating_sub(col)
        } else if line == self.to_line {
            col.saturating_sub(self.to_char)
        } else if line > self.from_line && line < self.to_line {
            0
        } else if line < self.from_line {
            (self.from_line - line) * TAB_WIDTH
        } else {
            (line - self.to_line) * TAB_WIDTH
        };
        Some(d)
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from_line == self.to_line {
            write!(
                f,
                "chunk_{}:({},{}-{})",
                self.source_id, self.from_line, self.from_char, self.to_char
            )
        } else {
            write!(
                f,
                "chunk_{}:({},{}-{},{})",
                self.source_id, self.from_line, self.from_char, self.to_line, self.to_char
            )
        }
    }
}

/// One stack-machine instruction.
///
/// Which optional fields are meaningful is decided by
/// [`OpCode::field_usage`]; clones are cheap (shared payloads).
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    pub num_val: i32,
    pub num_val2: i32,
    pub value: Option<Value>,
    pub symbol: Option<SymbolRef>,
    pub symbol_list: Option<Arc<[SymbolRef]>>,
    pub name: Option<Arc<str>>,
    pub source_ref: Option<SourceRef>,
}

impl Instruction {
    pub fn new(op: OpCode) -> Self {
        Self {
            op,
            num_val: 0,
            num_val2: 0,
            value: None,
            symbol: None,
            symbol_list: None,
            name: None,
            source_ref: None,
        }
    }

    pub fn with_num(mut self, num_val: i32) -> Self {
        self.num_val = num_val;
        self
    }

    pub fn with_num2(mut self, num_val2: i32) -> Self {
        self.num_val2 = num_val2;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_symbol(mut self, symbol: SymbolRef) -> Self {
        self.symbol = Some(symbol);
        self
    }

    pub fn with_symbols(mut self, symbols: impl Into<Arc<[SymbolRef]>>) -> Self {
        self.symbol_list = Some(symbols.into());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn symbols(&self) -> &[SymbolRef] {
        self.symbol_list.as_deref().unwrap_or(&[])
    }

    /// `num_val` as a non-negative count or address.
    pub fn num(&self) -> usize {
        self.num_val.max(0) as usize
    }

    pub fn num2(&self) -> usize {
        self.num_val2.max(0) as usize
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let usage = self.op.field_usage();
        let op: &'static str = self.op.into();
        write!(f, "{op:<10}")?;
        if usage.contains(FieldUsage::NUM_VAL_AS_CODE_ADDRESS) {
            write!(f, "{:08X}", self.num_val)?;
        } else if usage.contains(FieldUsage::NUM_VAL) {
            write!(f, "{}", self.num_val)?;
        }
        if usage.contains(FieldUsage::NUM_VAL2) {
            write!(f, ", {}", self.num_val2)?;
        }
        if usage.contains(FieldUsage::NAME) {
            if let Some(name) = &self.name {
                write!(f, " {name}")?;
            }
        }
        if usage.contains(FieldUsage::VALUE) {
            if let Some(v) = &self.value {
                match v {
                    Value::String(s) => write!(f, " {s:?}")?,
                    other => write!(f, " {other}")?,
                }
            }
        }
        if usage.contains(FieldUsage::SYMBOL) {
            if let Some(s) = &self.symbol {
                write!(f, " {s}")?;
            }
        }
        if usage.contains(FieldUsage::SYMBOL_LIST) {
            let names: Vec<&str> = self.symbols().iter().map(SymbolRef::name).collect();
            write!(f, " [{}]", names.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_follows_field_usage() {
        let jump = Instruction::new(OpCode::Jump).with_num(26).with_name("ignored");
        assert_eq!(jump.to_string().trim_end(), "JUMP      0000001A");
        let call = Instruction::new(OpCode::Call).with_num(2).with_name("print");
        assert_eq!(call.to_string(), "CALL      2 print");
        let lit = Instruction::new(OpCode::Literal).with_value(Value::from("x"));
        assert_eq!(lit.to_string(), "LITERAL    \"x\"");
    }

    #[test]
    fn source_refs_render_chunk_positions() {
        assert_eq!(SourceRef::line(0, 3, 1, 9).to_string(), "chunk_0:(3,1-9)");
        assert!(SourceRef::new(1, 2, 4, 0, 0).includes_line(3));
    }

    #[test]
    fn location_lookup_for_breakpoints() {
        let single = SourceRef::line(0, 3, 5, 9);
        assert!(single.includes_location(0, 3, 7));
        assert!(!single.includes_location(0, 3, 10));
        assert!(!single.includes_location(1, 3, 7));
        assert_eq!(single.location_distance(0, 3, 2), Some(3));
        assert_eq!(single.location_distance(0, 5, 7), Some(8));
        assert_eq!(single.location_distance(2, 3, 7), None);

        let multi = SourceRef::new(0, 2, 4, 6, 1);
        assert!(multi.includes_location(0, 3, 0));
        assert!(!multi.includes_location(0, 2, 5));
        assert_eq!(multi.location_distance(0, 4, 3), Some(2));
    }
}
