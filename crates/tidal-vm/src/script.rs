//! The root object hosts talk to.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;
use tidal_compiler::ByteCode;
use tidal_core::{
    table, Closure, ClosureContext, CoroutineType, Instruction, LuaError, SourceRef, Table,
    TableRef, Value, ValueCell, ENV_SYMBOL,
};

use crate::coroutine::{self, Coroutine};
use crate::debugger::Debugger;
use crate::options::ScriptOptions;
use crate::processor::{DebugContext, Processor};

/// Engine state every processor of a script shares.
pub(crate) struct ScriptShared {
    code: RwLock<ByteCode>,
    pub globals: TableRef,
    options: RwLock<ScriptOptions>,
    /// Coroutine processors currently running, innermost last.
    coroutine_stack: Mutex<Vec<Processor>>,
    debug: Mutex<DebugContext>,
    debugger_enabled: AtomicBool,
    next_source_id: AtomicU32,
}

impl ScriptShared {
    fn new(options: ScriptOptions) -> Self {
        Self {
            code: RwLock::new(ByteCode::new()),
            globals: Arc::new(RwLock::new(Table::new())),
            options: RwLock::new(options),
            coroutine_stack: Mutex::new(Vec::new()),
            debug: Mutex::new(DebugContext::default()),
            debugger_enabled: AtomicBool::new(false),
            next_source_id: AtomicU32::new(0),
        }
    }

    pub(crate) fn options(&self) -> ScriptOptions {
        self.options.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn code(&self) -> RwLockReadGuard<'_, ByteCode> {
        self.code.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn code_mut(&self) -> RwLockWriteGuard<'_, ByteCode> {
        self.code.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn instruction(&self, ip: usize) -> Result<Instruction, LuaError> {
        self.code()
            .get(ip)
            .cloned()
            .ok_or_else(|| LuaError::internal(format!("instruction pointer {ip} out of range")))
    }

    pub(crate) fn source_ref_at(&self, ip: usize) -> Option<SourceRef> {
        self.code().get(ip).and_then(|i| i.source_ref.clone())
    }

    /// Distinct locations of `source_id` a breakpoint may be put on, in
    /// code order.
    pub(crate) fn breakable_refs(&self, source_id: u32) -> Vec<SourceRef> {
        let code = self.code();
        let mut seen = HashSet::new();
        code.code
            .iter()
            .filter_map(|i| i.source_ref.as_ref())
            .filter(|r| r.source_id == source_id && r.breakpoint)
            .filter(|r| seen.insert((*r).clone()))
            .cloned()
            .collect()
    }

    // ── Active coroutines ─────────────────────────────────────────────────

    fn coroutine_stack(&self) -> MutexGuard<'_, Vec<Processor>> {
        self.coroutine_stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn active_processor(&self) -> Option<Processor> {
        self.coroutine_stack().last().cloned()
    }

    pub(crate) fn active_processors(&self) -> Vec<Processor> {
        self.coroutine_stack().clone()
    }

    pub(crate) fn push_active(&self, processor: Processor) {
        self.coroutine_stack().push(processor);
    }

    pub(crate) fn pop_active(&self) {
        self.coroutine_stack().pop();
    }

    // ── Debugger ──────────────────────────────────────────────────────────

    pub(crate) fn debug_context(&self) -> MutexGuard<'_, DebugContext> {
        self.debug.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn debugger(&self) -> Option<Arc<dyn Debugger>> {
        self.debug_context().debugger.clone()
    }

    pub(crate) fn debugger_enabled(&self) -> bool {
        self.debugger_enabled.load(Ordering::Acquire)
    }
}

/// A script: shared bytecode, a globals table and the main processor.
///
/// Clones are handles to the same script. A front end emits code through
/// [`Script::emit`] and turns entry points into callable closures with
/// [`Script::make_closure`].
#[derive(Clone)]
pub struct Script {
    pub(crate) shared: Arc<ScriptShared>,
    pub(crate) main: Processor,
    main_coroutine: Arc<Coroutine>,
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("instructions", &self.shared.code().len())
            .finish_non_exhaustive()
    }
}

impl Script {
    pub fn new() -> Self {
        Self::with_options(ScriptOptions::default())
    }

    pub fn with_options(options: ScriptOptions) -> Self {
        let register = options.register_stdlib();
        let shared = Arc::new(ScriptShared::new(options));
        let main = Processor::new_main(shared.clone());
        let main_coroutine = Arc::new(Coroutine::from_processor(main.clone()));
        main.set_owner(Arc::downgrade(&main_coroutine));
        if register {
            crate::stdlib::register(&shared.globals);
        }
        Self {
            shared,
            main,
            main_coroutine,
        }
    }

    // ── Configuration and state ───────────────────────────────────────────

    pub fn globals(&self) -> TableRef {
        self.shared.globals.clone()
    }

    pub fn set_global(&self, name: &str, value: impl Into<Value>) {
        table::write(&self.shared.globals).set_str(name, value.into());
    }

    pub fn get_global(&self, name: &str) -> Value {
        table::read(&self.shared.globals).get_str(name)
    }

    pub fn options(&self) -> ScriptOptions {
        self.shared.options()
    }

    pub fn set_options(&self, options: ScriptOptions) -> Result<(), LuaError> {
        options.validate()?;
        *self
            .shared
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner) = options;
        Ok(())
    }

    /// The coroutine handle of the main processor (state `Main`).
    pub fn main_coroutine(&self) -> Arc<Coroutine> {
        self.main_coroutine.clone()
    }

    /// Allocates the id tagging the next chunk's source locations.
    pub fn next_source_id(&self) -> u32 {
        self.shared.next_source_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── Code ──────────────────────────────────────────────────────────────

    /// Runs `f` with exclusive access to the script's bytecode.
    pub fn emit<R>(&self, f: impl FnOnce(&mut ByteCode) -> R) -> R {
        f(&mut self.shared.code_mut())
    }

    /// A closure over the function whose `Meta` sits at `entry_point`.
    /// With an environment, the closure's single upvalue is `_ENV`.
    pub fn make_closure(&self, entry_point: usize, env: Option<TableRef>) -> Value {
        let context = match env {
            Some(env) => ClosureContext::new(
                vec![Arc::from(ENV_SYMBOL)],
                vec![ValueCell::new(Value::Table(env))],
            ),
            None => ClosureContext::default(),
        };
        Value::Closure(Arc::new(Closure::new(entry_point, context)))
    }

    pub fn disassemble(&self) -> String {
        tidal_compiler::disassemble(&self.shared.code())
    }

    // ── Calls ─────────────────────────────────────────────────────────────

    /// Calls `function` and runs it to completion. Multiple results come
    /// back as a tuple.
    pub fn call(&self, function: &Value, args: Vec<Value>) -> Result<Value, LuaError> {
        self.main.call(function, args)
    }

    /// Calls the global named `name`.
    pub fn call_global(&self, name: &str, args: Vec<Value>) -> Result<Value, LuaError> {
        let function = self.get_global(name);
        self.call(&function, args)
    }

    // ── Coroutines ────────────────────────────────────────────────────────

    /// Wraps `function` into a new coroutine: a script closure gets a
    /// processor of its own, a native function becomes a one-shot callback.
    pub fn create_coroutine(&self, function: Value) -> Result<Arc<Coroutine>, LuaError> {
        coroutine::create(&self.main, function)
    }

    /// Reuses the stacks of a dead coroutine for a new one running
    /// `function`. The old handle is left `Recycled`.
    pub fn recycle_coroutine(
        &self,
        co: &Arc<Coroutine>,
        function: Value,
    ) -> Result<Arc<Coroutine>, LuaError> {
        let Some(dead) = co.processor() else {
            return Err(LuaError::InvalidOperation(
                "only processor-backed coroutines can be recycled".into(),
            ));
        };
        if co.state() != tidal_core::CoroutineState::Dead {
            return Err(LuaError::InvalidOperation(format!(
                "cannot recycle a coroutine in state {}",
                co.state()
            )));
        }
        if !matches!(function, Value::Closure(_)) {
            return Err(LuaError::InvalidArgument(
                "a recycled coroutine needs a script function".into(),
            ));
        }

        let processor = Processor::recycle(&self.main, &dead, function);
        co.mark_recycled();
        debug_assert_eq!(co.kind(), CoroutineType::Recycled);
        let fresh = Arc::new(Coroutine::from_processor(processor.clone()));
        processor.set_owner(Arc::downgrade(&fresh));
        debug!("recycled coroutine {:#x}", Arc::as_ptr(co) as usize);
        Ok(fresh)
    }

    // ── Binary chunks ─────────────────────────────────────────────────────

    /// Writes `function` as a binary chunk.
    pub fn dump(&self, function: &Value, writer: &mut impl Write) -> Result<(), LuaError> {
        let bytes = self.main.dump(function)?;
        writer
            .write_all(&bytes)
            .map_err(|e| LuaError::InvalidOperation(format!("cannot write chunk: {e}")))?;
        debug!("dumped {} bytes", bytes.len());
        Ok(())
    }

    /// Loads a binary chunk into this script and returns its function.
    pub fn load_binary(&self, reader: &mut impl Read) -> Result<Value, LuaError> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| LuaError::Chunk(format!("cannot read chunk: {e}")))?;
        let source_id = self.next_source_id();
        self.main.undump(&data, source_id)
    }

    // ── Debugger ──────────────────────────────────────────────────────────

    pub fn attach_debugger(&self, debugger: Arc<dyn Debugger>) {
        self.shared.debug_context().attach(debugger);
        self.shared.debugger_enabled.store(true, Ordering::Release);
        debug!("debugger attached");
    }

    pub fn detach_debugger(&self) {
        self.shared.debugger_enabled.store(false, Ordering::Release);
        self.shared.debug_context().detach();
        debug!("debugger detached");
    }

    /// Suspends or resumes debugger callbacks without detaching it.
    pub fn set_debugger_enabled(&self, enabled: bool) {
        let attached = self.shared.debug_context().debugger.is_some();
        self.shared
            .debugger_enabled
            .store(enabled && attached, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{function, global};
    use tidal_core::OpCode;

    #[test]
    fn stdlib_registration_follows_options() {
        let script = Script::new();
        assert!(matches!(script.get_global("pcall"), Value::NativeFunction(_)));

        let mut options = ScriptOptions::new();
        options.set_register_stdlib(false);
        let bare = Script::with_options(options);
        assert!(bare.get_global("pcall").is_nil());
    }

    #[test]
    fn set_options_validates() {
        let script = Script::new();
        let mut options = script.options();
        options.set_default_auto_yield_counter(10);
        script.set_options(options).unwrap();
        assert_eq!(script.options().default_auto_yield_counter(), 10);
    }

    #[test]
    fn call_runs_a_function_to_completion() {
        let script = Script::new();
        script.set_global("x", 41);
        let f = function(&script, "f", &[], &[], |bc| {
            bc.emit_load(&global("x")).unwrap();
            bc.emit_literal(Value::from(1));
            bc.emit_operator(OpCode::Add);
            bc.emit_ret(1);
        });
        assert_eq!(script.call(&f, vec![]).unwrap(), Value::from(42));
    }

    #[test]
    fn dump_refuses_natives_and_foreign_upvalues() {
        let script = Script::new();
        let native = script.get_global("print");
        let err = script.dump(&native, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, LuaError::InvalidArgument(_)));

        let entry = script.emit(|bc| {
            let meta = bc.emit_meta("g", tidal_compiler::MetaKind::FunctionEntrypoint);
            bc.emit_ret(0);
            bc.finish_function(meta).unwrap();
            meta
        });
        let captured = Value::Closure(Arc::new(Closure::new(
            entry,
            ClosureContext::new(vec![Arc::from("counter")], vec![ValueCell::default()]),
        )));
        let err = script.dump(&captured, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, LuaError::InvalidArgument(_)));
    }

    #[test]
    fn dumped_functions_load_into_another_script() {
        let source = Script::new();
        source.set_global("greeting", "hi");
        let f = function(&source, "f", &[], &[], |bc| {
            bc.emit_load(&global("greeting")).unwrap();
            bc.emit_ret(1);
        });
        let mut chunk = Vec::new();
        source.dump(&f, &mut chunk).unwrap();

        let target = Script::new();
        target.set_global("greeting", "hello");
        let loaded = target.load_binary(&mut chunk.as_slice()).unwrap();
        assert_eq!(target.call(&loaded, vec![]).unwrap(), Value::from("hello"));
    }

    #[test]
    fn bad_chunks_leave_the_code_untouched() {
        let script = Script::new();
        let before = script.emit(|bc| bc.len());
        let err = script.load_binary(&mut &b"not a chunk at all"[..]).unwrap_err();
        assert!(matches!(err, LuaError::Chunk(_)));
        assert_eq!(script.emit(|bc| bc.len()), before);
    }
}
