//! The stack machine.
//!
//! A [`Processor`] owns a value stack and a call stack and walks the shared
//! bytecode of its script. The main processor of a script runs host calls;
//! every coroutine gets a processor of its own whose parent is the main one.
//!
//! State sits behind a mutex that is only ever held for the duration of a
//! stack operation, never across a call into native code, a finalizer or
//! the debugger, so the same processor can be re-entered recursively.

mod calls;
mod coroutines;
mod debug;
mod dump;
mod exec;
pub(crate) mod frame;
mod scope;

pub(crate) use debug::DebugContext;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use log::debug;
use tidal_core::{CoroutineState, LuaError, Value};

use crate::coroutine::Coroutine;
use crate::script::ScriptShared;
use frame::{CallSetup, CallStackFlags, CallStackItem};

/// What the loop does after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    Jump(usize),
    /// The entry frame returned; its result is on top of the stack.
    ReturnToNative,
    /// A yield request is on top of the stack.
    Yield,
}

impl Flow {
    fn resume_at(return_address: Option<usize>) -> Flow {
        match return_address {
            Some(ip) => Flow::Jump(ip),
            None => Flow::ReturnToNative,
        }
    }
}

pub(crate) struct ProcessorState {
    pub value_stack: Vec<Value>,
    pub exec_stack: Vec<CallStackItem>,
    pub state: CoroutineState,
    pub can_yield: bool,
    pub saved_ip: Option<usize>,
    pub last_close_error: Value,
    owning_thread: Option<ThreadId>,
    nesting: usize,
    pub auto_yield_counter: u64,
}

impl ProcessorState {
    fn new(state: CoroutineState, auto_yield_counter: u64) -> Self {
        Self {
            value_stack: Vec::new(),
            exec_stack: Vec::new(),
            state,
            can_yield: true,
            saved_ip: None,
            last_close_error: Value::Nil,
            owning_thread: None,
            nesting: 0,
            auto_yield_counter,
        }
    }

    // ── Stack helpers ─────────────────────────────────────────────────────

    pub fn push(&mut self, v: Value) {
        self.value_stack.push(v);
    }

    pub fn pop(&mut self) -> Result<Value, LuaError> {
        self.value_stack
            .pop()
            .ok_or_else(|| LuaError::internal("value stack underflow"))
    }

    /// The value `depth` slots below the top.
    pub fn peek(&self, depth: usize) -> Result<&Value, LuaError> {
        let len = self.value_stack.len();
        if depth < len {
            Ok(&self.value_stack[len - 1 - depth])
        } else {
            Err(LuaError::internal(format!("value stack peek({depth}) past the bottom")))
        }
    }

    pub fn peek_mut(&mut self, depth: usize) -> Result<&mut Value, LuaError> {
        let len = self.value_stack.len();
        if depth < len {
            Ok(&mut self.value_stack[len - 1 - depth])
        } else {
            Err(LuaError::internal(format!("value stack peek({depth}) past the bottom")))
        }
    }

    pub fn remove_last(&mut self, count: usize) -> Result<(), LuaError> {
        let len = self.value_stack.len();
        if count > len {
            return Err(LuaError::internal("value stack underflow"));
        }
        self.value_stack.truncate(len - count);
        Ok(())
    }

    /// Pops `count` values, bottom-most first.
    pub fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, LuaError> {
        let len = self.value_stack.len();
        if count > len {
            return Err(LuaError::internal("value stack underflow"));
        }
        Ok(self.value_stack.split_off(len - count))
    }

    pub fn top_frame(&self) -> Result<&CallStackItem, LuaError> {
        self.exec_stack
            .last()
            .ok_or_else(|| LuaError::internal("call stack is empty"))
    }

    pub fn top_frame_mut(&mut self) -> Result<&mut CallStackItem, LuaError> {
        self.exec_stack
            .last_mut()
            .ok_or_else(|| LuaError::internal("call stack is empty"))
    }

    /// Pops the top frame and drops everything it pushed.
    pub fn pop_to_base_pointer(&mut self) -> Result<CallStackItem, LuaError> {
        let frame = self
            .exec_stack
            .pop()
            .ok_or_else(|| LuaError::internal("call stack is empty"))?;
        self.value_stack.truncate(frame.base_pointer);
        Ok(frame)
    }

    /// Pops the argument count a script frame sits on, then the arguments
    /// and the callee below it.
    pub fn pop_call_arguments(&mut self) -> Result<(), LuaError> {
        let argc = match self.pop()? {
            Value::Number(n) if n >= 0.0 => n as usize,
            other => {
                return Err(LuaError::internal(format!(
                    "expected an argument count on the stack, found {}",
                    other.type_name()
                )))
            }
        };
        self.remove_last(argc + 1)
    }
}

pub(crate) struct ProcessorInner {
    pub shared: Arc<ScriptShared>,
    pub parent: Option<Processor>,
    state: Mutex<ProcessorState>,
    owner: Mutex<Weak<Coroutine>>,
}

/// A cheap handle; clones share the same stacks.
#[derive(Clone)]
pub(crate) struct Processor {
    inner: Arc<ProcessorInner>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Processor({:#x}, {})", self.address(), self.state())
    }
}

impl Processor {
    pub(crate) fn new_main(shared: Arc<ScriptShared>) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                shared,
                parent: None,
                state: Mutex::new(ProcessorState::new(CoroutineState::Main, 0)),
                owner: Mutex::new(Weak::new()),
            }),
        }
    }

    /// A not yet started coroutine processor that will call `function`.
    pub(crate) fn new_child(parent: &Processor, function: Value) -> Self {
        Self::child_with_stacks(parent, function, Vec::new(), Vec::new())
    }

    /// A fresh coroutine processor built on the emptied stacks of a dead one.
    pub(crate) fn recycle(parent: &Processor, dead: &Processor, function: Value) -> Self {
        let (mut values, mut frames) = {
            let mut s = dead.lock();
            (
                std::mem::take(&mut s.value_stack),
                std::mem::take(&mut s.exec_stack),
            )
        };
        values.clear();
        frames.clear();
        Self::child_with_stacks(parent, function, values, frames)
    }

    fn child_with_stacks(
        parent: &Processor,
        function: Value,
        mut value_stack: Vec<Value>,
        exec_stack: Vec<CallStackItem>,
    ) -> Self {
        let main = parent.main();
        let counter = main.shared().options().default_auto_yield_counter();
        value_stack.push(function);
        let mut state = ProcessorState::new(CoroutineState::NotStarted, counter);
        state.value_stack = value_stack;
        state.exec_stack = exec_stack;
        Self {
            inner: Arc::new(ProcessorInner {
                shared: main.shared().clone(),
                parent: Some(main),
                state: Mutex::new(state),
                owner: Mutex::new(Weak::new()),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ScriptShared> {
        &self.inner.shared
    }

    /// The script's main processor.
    pub(crate) fn main(&self) -> Processor {
        self.inner.parent.clone().unwrap_or_else(|| self.clone())
    }

    pub(crate) fn is_main(&self) -> bool {
        self.inner.parent.is_none()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ProcessorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ptr_eq(&self, other: &Processor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn owner(&self) -> Option<Arc<Coroutine>> {
        self.inner.owner.lock().unwrap_or_else(PoisonError::into_inner).upgrade()
    }

    pub(crate) fn set_owner(&self, owner: Weak<Coroutine>) {
        *self.inner.owner.lock().unwrap_or_else(PoisonError::into_inner) = owner;
    }

    pub(crate) fn state(&self) -> CoroutineState {
        self.lock().state
    }

    pub(crate) fn set_state(&self, state: CoroutineState) {
        let mut s = self.lock();
        if s.state != state {
            debug!("processor {:#x}: {} -> {state}", self.address(), s.state);
            s.state = state;
        }
    }

    pub(crate) fn can_yield(&self) -> bool {
        self.lock().can_yield
    }

    pub(crate) fn auto_yield_counter(&self) -> u64 {
        self.lock().auto_yield_counter
    }

    pub(crate) fn set_auto_yield_counter(&self, counter: u64) {
        self.lock().auto_yield_counter = counter;
    }

    pub(crate) fn push(&self, v: Value) {
        self.lock().push(v);
    }

    pub(crate) fn pop(&self) -> Result<Value, LuaError> {
        self.lock().pop()
    }

    // ── Entering and leaving ──────────────────────────────────────────────

    /// Marks this thread as running the processor. Coroutine processors
    /// also become the script's active processor until the guard drops.
    fn enter(&self) -> Result<EnterGuard<'_>, LuaError> {
        let me = thread::current().id();
        let check = self.shared().options().check_thread_access();
        {
            let mut s = self.lock();
            if let Some(owner) = s.owning_thread {
                if check && s.nesting > 0 && owner != me {
                    return Err(LuaError::InvalidOperation(format!(
                        "cannot enter the same processor from two different threads: {owner:?} and {me:?}"
                    )));
                }
            }
            s.owning_thread = Some(me);
            s.nesting += 1;
        }
        let activated = !self.is_main();
        if activated {
            self.shared().push_active(self.clone());
        }
        Ok(EnterGuard {
            processor: self,
            activated,
        })
    }

    // ── Host calls ────────────────────────────────────────────────────────

    /// Calls `function` from native code and runs it to completion.
    ///
    /// When another processor is active (a coroutine is running), the call
    /// is forwarded to it so the stacks stay consistent.
    pub(crate) fn call(&self, function: &Value, args: Vec<Value>) -> Result<Value, LuaError> {
        if let Some(active) = self.shared().active_processor() {
            if !active.ptr_eq(self) {
                return active.call(function, args);
            }
        }

        let result = {
            let _guard = self.enter()?;
            let (saved_can_yield, values, frames) = {
                let mut s = self.lock();
                let saved = std::mem::replace(&mut s.can_yield, false);
                (saved, s.value_stack.len(), s.exec_stack.len())
            };
            let result = self.call_entry(function, args);
            let mut s = self.lock();
            s.can_yield = saved_can_yield;
            if result.is_err() {
                s.value_stack.truncate(values);
                s.exec_stack.truncate(frames);
            }
            result
        };

        if self.lock().nesting == 0 {
            if let Some(debugger) = self.shared().debugger() {
                debugger.signal_execution_ended();
            }
        }
        result
    }

    fn call_entry(&self, function: &Value, args: Vec<Value>) -> Result<Value, LuaError> {
        let argc = args.len();
        {
            let mut s = self.lock();
            s.push(function.clone());
            s.value_stack.extend(args);
        }
        let flow = self.exec_call(argc, CallSetup::entry(CallStackFlags::CALL_ENTRY_POINT))?;
        self.drive(flow)
    }

    /// Finishes what a call set in motion outside the loop.
    fn drive(&self, flow: Flow) -> Result<Value, LuaError> {
        match flow {
            Flow::Jump(entry) => self.processing_loop(entry),
            Flow::ReturnToNative | Flow::Yield => self.pop(),
            Flow::Next => Err(LuaError::internal("call setup fell through")),
        }
    }
}

struct EnterGuard<'a> {
    processor: &'a Processor,
    activated: bool,
}

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        if self.activated {
            self.processor.shared().pop_active();
        }
        let mut s = self.processor.lock();
        s.nesting = s.nesting.saturating_sub(1);
        if s.nesting == 0 {
            s.owning_thread = None;
        }
    }
}
