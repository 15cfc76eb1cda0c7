//! Binary decoder: `&[u8]` → instructions appended to a [`ByteCode`].
//!
//! Mirrors the encoding in `encode.rs` exactly. The whole chunk is decoded
//! before anything is appended, so a bad chunk leaves the target untouched.

use std::sync::Arc;

use log::debug;
use tidal_core::{
    FieldUsage, Instruction, LuaError, OpCode, SourceRef, SymbolAttributes, SymbolRef,
    SymbolRefType, Value,
};

use crate::bytecode::ByteCode;
use crate::encode::{
    MAGIC, VALUE_BOOLEAN, VALUE_ENV_TABLE, VALUE_NIL, VALUE_NUMBER, VALUE_STRING, VERSION,
};

/// Global symbols chain through their environments; real chunks are one
/// level deep.
const MAX_ENV_DEPTH: usize = 16;

/// Where a loaded function landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFunction {
    /// Address of the function's `Meta`.
    pub entry_point: usize,
    pub instruction_count: usize,
    /// The function closed over `_ENV` when it was dumped.
    pub has_upvalues: bool,
}

fn chunk_err(msg: impl Into<String>) -> LuaError {
    LuaError::Chunk(msg.into())
}

// ── Cursor reader ─────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], LuaError> {
        if self.remaining() < n {
            return Err(chunk_err(format!(
                "unexpected end of data: need {n} bytes at offset {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], LuaError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, LuaError> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_i32_le(&mut self) -> Result<i32, LuaError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    fn read_u32_le(&mut self) -> Result<u32, LuaError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64_le(&mut self) -> Result<u64, LuaError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_f64_le(&mut self) -> Result<f64, LuaError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    fn read_str(&mut self) -> Result<String, LuaError> {
        let len = self.read_u32_le()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| chunk_err(format!("invalid UTF-8 in string: {e}")))
    }

    /// A count field; negative means "absent".
    fn read_count(&mut self) -> Result<Option<usize>, LuaError> {
        let n = self.read_i32_le()?;
        Ok(usize::try_from(n).ok())
    }
}

// ── Symbols ───────────────────────────────────────────────────────────────────

struct SymbolRecord {
    kind: u8,
    index: i32,
    name: String,
    attributes: u8,
    env: i32,
}

fn read_symbol_record(r: &mut Reader<'_>) -> Result<SymbolRecord, LuaError> {
    Ok(SymbolRecord {
        kind: r.read_u8()?,
        index: r.read_i32_le()?,
        name: r.read_str()?,
        attributes: r.read_u8()?,
        env: r.read_i32_le()?,
    })
}

fn resolve_symbol(
    records: &[SymbolRecord],
    id: usize,
    depth: usize,
) -> Result<SymbolRef, LuaError> {
    if depth > MAX_ENV_DEPTH {
        return Err(chunk_err("symbol environments nest too deeply"));
    }
    let rec = records
        .get(id)
        .ok_or_else(|| chunk_err(format!("symbol id {id} out of range")))?;
    let index = usize::try_from(rec.index)
        .map_err(|_| chunk_err(format!("negative index for symbol '{}'", rec.name)))?;
    let sym = match rec.kind {
        k if k == SymbolRefType::Local as u8 => SymbolRef::local_with(
            &rec.name,
            index,
            SymbolAttributes::from_bits_truncate(rec.attributes),
        ),
        k if k == SymbolRefType::Upvalue as u8 => SymbolRef::upvalue(&rec.name, index),
        k if k == SymbolRefType::Global as u8 => {
            let env_id = usize::try_from(rec.env)
                .map_err(|_| chunk_err(format!("global '{}' has no environment", rec.name)))?;
            SymbolRef::global(&rec.name, resolve_symbol(records, env_id, depth + 1)?)
        }
        k if k == SymbolRefType::DefaultEnv as u8 => SymbolRef::DefaultEnv,
        k => return Err(chunk_err(format!("unknown symbol kind: {k}"))),
    };
    Ok(sym)
}

fn decode_symbol_id(r: &mut Reader<'_>, symbols: &[SymbolRef]) -> Result<Option<SymbolRef>, LuaError> {
    let id = r.read_i32_le()?;
    if id < 0 {
        return Ok(None);
    }
    symbols
        .get(id as usize)
        .cloned()
        .map(Some)
        .ok_or_else(|| chunk_err(format!("symbol id {id} out of range")))
}

// ── Instructions ──────────────────────────────────────────────────────────────

fn decode_value(r: &mut Reader<'_>, env: &Value) -> Result<Option<Value>, LuaError> {
    if r.read_u8()? == 0 {
        return Ok(None);
    }
    let v = match r.read_u8()? {
        VALUE_NIL => Value::Nil,
        VALUE_BOOLEAN => Value::Boolean(r.read_u8()? != 0),
        VALUE_NUMBER => Value::Number(r.read_f64_le()?),
        VALUE_STRING => Value::from(r.read_str()?),
        VALUE_ENV_TABLE => env.clone(),
        t => return Err(chunk_err(format!("unknown value tag: {t}"))),
    };
    Ok(Some(v))
}

/// Maps a function-relative code address to its place in the target
/// bytecode. Addresses must land inside the function being loaded.
fn rebase_address(relative: i32, base: usize, meta_len: usize) -> Result<i32, LuaError> {
    let offset = usize::try_from(relative)
        .ok()
        .filter(|&offset| offset <= meta_len)
        .ok_or_else(|| chunk_err(format!("code address {relative} outside the function")))?;
    base.checked_add(offset)
        .and_then(|address| i32::try_from(address).ok())
        .ok_or_else(|| chunk_err(format!("code address {relative} overflows at base {base}")))
}

fn decode_instruction(
    r: &mut Reader<'_>,
    base: usize,
    meta_len: usize,
    env: &Value,
    symbols: &[SymbolRef],
    source_ref: &SourceRef,
) -> Result<Instruction, LuaError> {
    let byte = r.read_u8()?;
    let op = OpCode::from_repr(byte).ok_or_else(|| chunk_err(format!("unknown opcode: {byte}")))?;
    let usage = op.field_usage();
    let mut instr = Instruction::new(op);

    if usage.contains(FieldUsage::NUM_VAL_AS_CODE_ADDRESS) {
        instr.num_val = rebase_address(r.read_i32_le()?, base, meta_len)?;
    } else if usage.contains(FieldUsage::NUM_VAL) {
        instr.num_val = r.read_i32_le()?;
    }
    if usage.contains(FieldUsage::NUM_VAL2) {
        instr.num_val2 = r.read_i32_le()?;
    }
    if usage.contains(FieldUsage::NAME) {
        let name = r.read_str()?;
        if !name.is_empty() {
            instr.name = Some(name.into());
        }
    }
    if usage.contains(FieldUsage::VALUE) {
        instr.value = decode_value(r, env)?;
    }
    if usage.contains(FieldUsage::SYMBOL) {
        instr.symbol = decode_symbol_id(r, symbols)?;
    }
    if usage.contains(FieldUsage::SYMBOL_LIST) {
        if let Some(count) = r.read_count()? {
            let mut list = Vec::with_capacity(count.min(r.remaining() / 4));
            for _ in 0..count {
                let sym = decode_symbol_id(r, symbols)?
                    .ok_or_else(|| chunk_err("missing symbol in symbol list"))?;
                list.push(sym);
            }
            instr.symbol_list = Some(Arc::from(list));
        }
    }
    instr.source_ref = Some(source_ref.clone());
    Ok(instr)
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Loads a chunk produced by [`encode_function`](crate::encode_function),
/// appending its instructions to `code`.
///
/// Environment-table constants are bound to `env`; every loaded instruction
/// is tagged with an empty location in `source_id`.
pub fn decode_function(
    data: &[u8],
    code: &mut ByteCode,
    source_id: u32,
    env: &Value,
) -> Result<DecodedFunction, LuaError> {
    let mut r = Reader::new(data);

    if r.read_u64_le().ok() != Some(MAGIC) {
        return Err(chunk_err("Not a tidal chunk"));
    }
    if r.read_i32_le()? != VERSION {
        return Err(chunk_err("Invalid version"));
    }
    let has_upvalues = r.read_u8()? != 0;
    let meta_len = r
        .read_count()?
        .ok_or_else(|| chunk_err("negative function length"))?;

    let symbol_count = r
        .read_count()?
        .ok_or_else(|| chunk_err("negative symbol count"))?;
    let mut records = Vec::with_capacity(symbol_count.min(r.remaining()));
    for _ in 0..symbol_count {
        records.push(read_symbol_record(&mut r)?);
    }
    let symbols = (0..records.len())
        .map(|id| resolve_symbol(&records, id, 0))
        .collect::<Result<Vec<_>, _>>()?;

    let base = code.len();
    let source_ref = SourceRef {
        breakpoint: false,
        ..SourceRef::new(source_id, 0, 0, 0, 0)
    };
    let mut instructions = Vec::with_capacity((meta_len + 1).min(r.remaining()));
    for _ in 0..=meta_len {
        instructions.push(decode_instruction(&mut r, base, meta_len, env, &symbols, &source_ref)?);
    }
    if instructions.first().map(|i| i.op) != Some(OpCode::Meta) {
        return Err(chunk_err("chunk does not start with a function preamble"));
    }

    let count = instructions.len();
    code.code.extend(instructions);
    debug!("loaded {count} instructions at {base} (source {source_id})");
    Ok(DecodedFunction {
        entry_point: base,
        instruction_count: count,
        has_upvalues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::MetaKind;
    use crate::encode::encode_function;
    use crate::scope::RuntimeScopeFrame;
    use pretty_assertions::assert_eq;

    /// `function f(a) if a then return g end return "no" end`, hand-assembled.
    fn sample(bc: &mut ByteCode) -> usize {
        let env = SymbolRef::upvalue("_ENV", 0);
        let a = SymbolRef::local("a", 0);
        let g = SymbolRef::global("g", env);
        let meta = bc.emit_meta("f", MetaKind::FunctionEntrypoint);
        bc.emit_begin_fn(&RuntimeScopeFrame::new(vec![a.clone()], 0));
        bc.emit_args(&[a.clone()]);
        bc.emit_load(&a).unwrap();
        let jf = bc.emit_jump(OpCode::Jf, -1);
        bc.emit_load(&g).unwrap();
        bc.emit_ret(1);
        let target = bc.next_address();
        bc.set_jump_target(jf, target).unwrap();
        bc.emit_literal(Value::from("no"));
        bc.emit_ret(1);
        bc.finish_function(meta).unwrap();
        meta
    }

    #[test]
    fn round_trip_rebases_code_addresses() {
        let mut src = ByteCode::new();
        src.emit_nop("pad");
        let meta = sample(&mut src);
        let bytes = encode_function(&src, 0, true).unwrap();

        let mut dst = ByteCode::new();
        for _ in 0..5 {
            dst.emit_nop("existing");
        }
        let loaded = decode_function(&bytes, &mut dst, 7, &Value::Nil).unwrap();
        assert_eq!(loaded.entry_point, 5);
        assert!(loaded.has_upvalues);
        assert_eq!(loaded.instruction_count, src.len() - meta);

        for (orig, copy) in src.code[meta..].iter().zip(&dst.code[5..]) {
            assert_eq!(orig.op, copy.op);
            assert_eq!(orig.symbol, copy.symbol);
            assert_eq!(orig.symbol_list, copy.symbol_list);
            assert_eq!(orig.value, copy.value);
            assert_eq!(orig.num_val2, copy.num_val2);
            if orig.op.is_jump() {
                assert_eq!(copy.num_val as usize, orig.num_val as usize - meta + 5);
            } else {
                assert_eq!(orig.num_val, copy.num_val);
            }
            let sref = copy.source_ref.as_ref().unwrap();
            assert_eq!(sref.source_id, 7);
            assert!(!sref.breakpoint);
        }
    }

    #[test]
    fn env_constants_bind_to_the_target_environment() {
        let mut src = ByteCode::new();
        let meta = src.emit_meta("chunk", MetaKind::ChunkEntrypoint);
        src.emit_literal(Value::new_table());
        src.finish_function(meta).unwrap();
        let bytes = encode_function(&src, meta, false).unwrap();

        let env = Value::new_table();
        let mut dst = ByteCode::new();
        decode_function(&bytes, &mut dst, 0, &env).unwrap();
        assert_eq!(dst.code[1].value.as_ref(), Some(&env));
    }

    #[test]
    fn bad_header_leaves_code_untouched() {
        let mut src = ByteCode::new();
        let meta = sample(&mut src);
        let mut bytes = encode_function(&src, meta, true).unwrap();

        let mut dst = ByteCode::new();
        let mut wrong_magic = bytes.clone();
        wrong_magic[0] ^= 0xFF;
        let err = decode_function(&wrong_magic, &mut dst, 0, &Value::Nil).unwrap_err();
        assert_eq!(err, LuaError::Chunk("Not a tidal chunk".into()));

        bytes[8] ^= 0xFF;
        let err = decode_function(&bytes, &mut dst, 0, &Value::Nil).unwrap_err();
        assert_eq!(err, LuaError::Chunk("Invalid version".into()));
        assert!(dst.is_empty());
    }

    #[test]
    fn code_addresses_must_stay_inside_the_function() {
        let mut src = ByteCode::new();
        let meta = sample(&mut src);
        let bytes = encode_function(&src, meta, true).unwrap();

        // Locate the encoded Jf: its opcode byte followed by the relative target.
        let jf = src.code.iter().find(|i| i.op == OpCode::Jf).unwrap();
        let mut pattern = vec![OpCode::Jf.as_u8()];
        pattern.extend_from_slice(&(jf.num_val - meta as i32).to_le_bytes());
        let operand = bytes.windows(5).position(|w| w == pattern.as_slice()).unwrap() + 1;

        for bad in [i32::MAX, -1, 1000] {
            let mut corrupt = bytes.clone();
            corrupt[operand..operand + 4].copy_from_slice(&bad.to_le_bytes());
            let mut dst = ByteCode::new();
            for _ in 0..4 {
                dst.emit_nop("existing");
            }
            let err = decode_function(&corrupt, &mut dst, 0, &Value::Nil).unwrap_err();
            assert!(matches!(err, LuaError::Chunk(ref m) if m.contains("outside the function")));
            assert_eq!(dst.len(), 4);
        }
    }

    #[test]
    fn truncated_chunk_is_rejected() {
        let mut src = ByteCode::new();
        let meta = sample(&mut src);
        let bytes = encode_function(&src, meta, true).unwrap();
        let mut dst = ByteCode::new();
        let err = decode_function(&bytes[..bytes.len() - 3], &mut dst, 0, &Value::Nil).unwrap_err();
        assert!(matches!(err, LuaError::Chunk(ref m) if m.contains("unexpected end")));
        assert!(dst.is_empty());
        assert!(decode_function(&[], &mut dst, 0, &Value::Nil).is_err());
    }
}
