use tidal_core::{OpCode, SourceRef};

use crate::bytecode::{ByteCode, MetaKind};

/// Disassemble a whole [`ByteCode`] into a human-readable listing.
pub fn disassemble(code: &ByteCode) -> String {
    disassemble_range(code, 0, code.len())
}

/// Disassemble the instructions in `from..to`.
///
/// Each `Meta` opens a section header, and a `;` line marks every change of
/// source location.
pub fn disassemble_range(code: &ByteCode, from: usize, to: usize) -> String {
    let mut out = String::new();
    let mut last_source: Option<&SourceRef> = None;
    for ip in from..to.min(code.len()) {
        let instr = &code.code[ip];
        if instr.op == OpCode::Meta {
            let kind = match MetaKind::from_i32(instr.num_val2) {
                Some(MetaKind::ChunkEntrypoint) => "chunk",
                Some(MetaKind::FunctionEntrypoint) => "function",
                None => "?",
            };
            out.push_str(&format!(
                "== {} ==  ({kind}, {} instructions)\n",
                instr.name.as_deref().unwrap_or("<?>"),
                instr.num_val
            ));
        }
        if let Some(sref) = &instr.source_ref {
            if last_source != Some(sref) {
                out.push_str(&format!("          ; {sref}\n"));
                last_source = Some(sref);
            }
        }
        out.push_str(&format!("{ip:08X}  {instr}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_core::{SourceRef, SymbolRef, Value};

    #[test]
    fn listing_shows_headers_and_locations() {
        let mut bc = ByteCode::new();
        let meta = bc.emit_meta("main", MetaKind::ChunkEntrypoint);
        {
            let mut s = bc.enter_source(Some(SourceRef::line(0, 1, 0, 8)));
            s.emit_literal(Value::from(2));
            s.emit_store(&SymbolRef::local("x", 0), 0, 0).unwrap();
        }
        bc.emit_ret(0);
        bc.finish_function(meta).unwrap();

        let text = disassemble(&bc);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "== main ==  (chunk, 3 instructions)");
        assert!(lines[1].starts_with("00000000  META"));
        assert_eq!(lines[2].trim(), "; chunk_0:(1,0-8)");
        assert_eq!(lines[3], "00000001  LITERAL    2");
        assert!(lines[4].starts_with("00000002  STORELCL  0, 0 x : local / 0"));
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn range_is_clamped() {
        let mut bc = ByteCode::new();
        bc.emit_nop("a");
        assert_eq!(disassemble_range(&bc, 0, 10).lines().count(), 1);
        assert!(disassemble_range(&bc, 1, 10).is_empty());
    }
}
