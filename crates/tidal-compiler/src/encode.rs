//! Binary encoder: one function of a [`ByteCode`] → `Vec<u8>`.
//!
//! Format: header, symbol table, then the function's instructions from its
//! `Meta` to its last instruction. Code addresses are stored relative to the
//! `Meta` so the function can be loaded anywhere. All integers little-endian.

use std::collections::HashMap;

use log::debug;
use tidal_core::{FieldUsage, Instruction, LuaError, SymbolRef, Value};

use crate::bytecode::ByteCode;

/// Identifies a tidal binary chunk.
pub const MAGIC: u64 = 0x1A0D_234E_4F4F_4D1D;

/// Bumped whenever the layout changes.
pub const VERSION: i32 = 0x151;

pub(crate) const VALUE_NIL: u8 = 0;
pub(crate) const VALUE_BOOLEAN: u8 = 1;
pub(crate) const VALUE_NUMBER: u8 = 2;
pub(crate) const VALUE_STRING: u8 = 3;
pub(crate) const VALUE_ENV_TABLE: u8 = 4;

// ── Low-level write helpers ────────────────────────────────────────────────

fn push_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn push_i32_le(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u64_le(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_f64_le(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    push_u32_le(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

// ── Symbol table ───────────────────────────────────────────────────────────

/// Symbols referenced by the dumped range, numbered in first-seen order.
#[derive(Default)]
struct SymbolTable {
    order: Vec<SymbolRef>,
    ids: HashMap<SymbolRef, i32>,
}

impl SymbolTable {
    fn add(&mut self, sym: &SymbolRef) {
        if self.ids.contains_key(sym) {
            return;
        }
        self.ids.insert(sym.clone(), self.order.len() as i32);
        self.order.push(sym.clone());
        if let Some(env) = sym.env() {
            self.add(env);
        }
    }

    fn id(&self, sym: Option<&SymbolRef>) -> i32 {
        sym.and_then(|s| self.ids.get(s).copied()).unwrap_or(-1)
    }
}

fn encode_symbol(sym: &SymbolRef, table: &SymbolTable, buf: &mut Vec<u8>) {
    push_u8(buf, sym.kind() as u8);
    push_i32_le(buf, sym.index() as i32);
    push_str(buf, sym.name());
    push_u8(buf, sym.attributes().bits());
    push_i32_le(buf, table.id(sym.env()));
}

// ── Instruction encoder ────────────────────────────────────────────────────

fn encode_value(value: Option<&Value>, buf: &mut Vec<u8>) -> Result<(), LuaError> {
    let Some(value) = value else {
        push_u8(buf, 0);
        return Ok(());
    };
    push_u8(buf, 1);
    match value {
        Value::Nil => push_u8(buf, VALUE_NIL),
        Value::Boolean(b) => {
            push_u8(buf, VALUE_BOOLEAN);
            push_u8(buf, *b as u8);
        }
        Value::Number(n) => {
            push_u8(buf, VALUE_NUMBER);
            push_f64_le(buf, *n);
        }
        Value::String(s) => {
            push_u8(buf, VALUE_STRING);
            push_str(buf, s);
        }
        // Only an environment can appear here; it is rebound on load.
        Value::Table(_) => push_u8(buf, VALUE_ENV_TABLE),
        other => {
            return Err(LuaError::InvalidArgument(format!(
                "cannot dump a {} constant",
                other.type_name()
            )))
        }
    }
    Ok(())
}

fn encode_instruction(
    instr: &Instruction,
    base: usize,
    symbols: &SymbolTable,
    buf: &mut Vec<u8>,
) -> Result<(), LuaError> {
    let usage = instr.op.field_usage();
    push_u8(buf, instr.op.as_u8());

    if usage.contains(FieldUsage::NUM_VAL_AS_CODE_ADDRESS) {
        push_i32_le(buf, instr.num_val - base as i32);
    } else if usage.contains(FieldUsage::NUM_VAL) {
        push_i32_le(buf, instr.num_val);
    }
    if usage.contains(FieldUsage::NUM_VAL2) {
        push_i32_le(buf, instr.num_val2);
    }
    if usage.contains(FieldUsage::NAME) {
        push_str(buf, instr.name.as_deref().unwrap_or(""));
    }
    if usage.contains(FieldUsage::VALUE) {
        encode_value(instr.value.as_ref(), buf)?;
    }
    if usage.contains(FieldUsage::SYMBOL) {
        push_i32_le(buf, symbols.id(instr.symbol.as_ref()));
    }
    if usage.contains(FieldUsage::SYMBOL_LIST) {
        match &instr.symbol_list {
            Some(list) => {
                push_i32_le(buf, list.len() as i32);
                for s in list.iter() {
                    push_i32_le(buf, symbols.id(Some(s)));
                }
            }
            None => push_i32_le(buf, -1),
        }
    }
    Ok(())
}

/// Address of the `Meta` that starts the function at `base_address`,
/// skipping leading `Nop`s.
pub fn find_meta(code: &ByteCode, base_address: usize) -> Result<usize, LuaError> {
    let mut ip = base_address;
    while let Some(instr) = code.get(ip) {
        match instr.op {
            tidal_core::OpCode::Nop => ip += 1,
            tidal_core::OpCode::Meta => return Ok(ip),
            _ => break,
        }
    }
    Err(LuaError::InvalidArgument(format!(
        "base_address {base_address} does not start a function"
    )))
}

// ── Public API ─────────────────────────────────────────────────────────────

/// Serializes the function starting at `base_address`.
///
/// `has_upvalues` records whether the function closes over `_ENV`, so the
/// loader knows to bind one.
pub fn encode_function(
    code: &ByteCode,
    base_address: usize,
    has_upvalues: bool,
) -> Result<Vec<u8>, LuaError> {
    let base = find_meta(code, base_address)?;
    let meta_len = code.code[base].num_val.max(0) as usize;
    let end = base + meta_len;
    if end >= code.len() {
        return Err(LuaError::InvalidArgument(format!(
            "function at base_address {base} runs past the end of the code"
        )));
    }
    let range = &code.code[base..=end];

    let mut symbols = SymbolTable::default();
    for instr in range {
        if let Some(s) = &instr.symbol {
            symbols.add(s);
        }
        for s in instr.symbols() {
            symbols.add(s);
        }
    }

    let mut buf = Vec::new();
    push_u64_le(&mut buf, MAGIC);
    push_i32_le(&mut buf, VERSION);
    push_u8(&mut buf, has_upvalues as u8);
    push_i32_le(&mut buf, meta_len as i32);

    push_i32_le(&mut buf, symbols.order.len() as i32);
    for sym in &symbols.order {
        encode_symbol(sym, &symbols, &mut buf);
    }

    for instr in range {
        encode_instruction(instr, base, &symbols, &mut buf)?;
    }

    debug!(
        "dumped function at {base}: {} instructions, {} symbols, {} bytes",
        range.len(),
        symbols.order.len(),
        buf.len()
    );
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::MetaKind;
    use tidal_core::OpCode;

    fn tiny_function(bc: &mut ByteCode) -> usize {
        let meta = bc.emit_meta("f", MetaKind::FunctionEntrypoint);
        bc.emit_literal(Value::from(1));
        bc.emit_ret(1);
        bc.finish_function(meta).unwrap();
        meta
    }

    #[test]
    fn header_layout() {
        let mut bc = ByteCode::new();
        let meta = tiny_function(&mut bc);
        let bytes = encode_function(&bc, meta, true).unwrap();
        assert_eq!(&bytes[0..8], &MAGIC.to_le_bytes());
        assert_eq!(&bytes[8..12], &VERSION.to_le_bytes());
        assert_eq!(bytes[12], 1);
        assert_eq!(&bytes[13..17], &2i32.to_le_bytes());
    }

    #[test]
    fn leading_nops_are_skipped() {
        let mut bc = ByteCode::new();
        bc.emit_nop("pad");
        bc.emit_nop("pad");
        tiny_function(&mut bc);
        assert_eq!(find_meta(&bc, 0).unwrap(), 2);
    }

    #[test]
    fn base_must_be_a_function_preamble() {
        let mut bc = ByteCode::new();
        bc.emit_jump(OpCode::Jump, 0);
        tiny_function(&mut bc);
        let err = encode_function(&bc, 0, false).unwrap_err();
        assert!(matches!(err, LuaError::InvalidArgument(ref m) if m.contains("base_address")));
    }

    #[test]
    fn host_values_cannot_be_dumped() {
        let mut bc = ByteCode::new();
        let meta = bc.emit_meta("f", MetaKind::FunctionEntrypoint);
        bc.emit_literal(Value::tuple_of(vec![Value::from(1), Value::from(2)]));
        bc.finish_function(meta).unwrap();
        assert!(matches!(
            encode_function(&bc, meta, false),
            Err(LuaError::InvalidArgument(_))
        ));
    }
}
