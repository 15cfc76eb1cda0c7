//! Hand-assembled functions for tests.

use tidal_compiler::{ByteCode, MetaKind, RuntimeScopeFrame};
use tidal_core::{SymbolRef, Value};

use crate::Script;

pub(crate) fn env() -> SymbolRef {
    SymbolRef::upvalue("_ENV", 0)
}

pub(crate) fn global(name: &str) -> SymbolRef {
    SymbolRef::global(name, env())
}

/// Emits a function whose locals are `params` followed by `locals`, and
/// returns it as a closure over the script's globals. `body` must end in
/// a `Ret`.
pub(crate) fn function(
    script: &Script,
    name: &str,
    params: &[&str],
    locals: &[&str],
    body: impl FnOnce(&mut ByteCode),
) -> Value {
    let symbols: Vec<SymbolRef> = params
        .iter()
        .chain(locals)
        .enumerate()
        .map(|(i, n)| SymbolRef::local(n, i))
        .collect();
    let last_slot = symbols.len() as i32 - 1;
    function_with(script, name, symbols, params.len(), last_slot, body)
}

/// Like [`function`], with the locals spelled out. The first `params` of
/// them are parameters; to-be-closed locals up to `to_first_block` belong
/// to the function's root block.
pub(crate) fn function_with(
    script: &Script,
    name: &str,
    symbols: Vec<SymbolRef>,
    params: usize,
    to_first_block: i32,
    body: impl FnOnce(&mut ByteCode),
) -> Value {
    let args = symbols[..params].to_vec();
    let entry = script.emit(|bc| {
        let meta = bc.emit_meta(name, MetaKind::FunctionEntrypoint);
        bc.emit_begin_fn(&RuntimeScopeFrame::new(symbols, to_first_block));
        bc.emit_args(&args);
        body(bc);
        bc.finish_function(meta).unwrap();
        meta
    });
    script.make_closure(entry, Some(script.globals()))
}

/// Pushes `library.name`, e.g. `coroutine.yield`.
pub(crate) fn emit_library_fn(bc: &mut ByteCode, library: &str, name: &str) {
    bc.emit_load(&global(library)).unwrap();
    bc.emit_index(Some(Value::from(name)), true, false);
}
