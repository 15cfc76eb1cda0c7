//! Coroutine handles.
//!
//! A [`Coroutine`] is backed by a processor of its own, or by a native
//! function that runs exactly once. Handles of recycled coroutines stay
//! valid but can no longer run.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use tidal_core::{
    CoroutineObject, CoroutineState, CoroutineType, ExecutionContext, LuaError, NativeFunction,
    Value,
};

use crate::debugger::WatchItem;
use crate::processor::Processor;

enum CoroutineBody {
    Processor(Processor),
    Callback(NativeFunction),
    CallbackDead,
    Recycled,
}

pub struct Coroutine {
    body: Mutex<CoroutineBody>,
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Coroutine({}, {})", self.kind(), self.state())
    }
}

/// Wraps `function` into a coroutine running on a child of `main`.
pub(crate) fn create(main: &Processor, function: Value) -> Result<Arc<Coroutine>, LuaError> {
    match function {
        Value::NativeFunction(native) => Ok(Arc::new(Coroutine {
            body: Mutex::new(CoroutineBody::Callback(native)),
        })),
        Value::Closure(_) => {
            let processor = Processor::new_child(main, function);
            let co = Arc::new(Coroutine::from_processor(processor.clone()));
            processor.set_owner(Arc::downgrade(&co));
            debug!("created coroutine on processor {:#x}", processor.address());
            Ok(co)
        }
        other => Err(LuaError::InvalidArgument(format!(
            "cannot create a coroutine from a {} value",
            other.type_name()
        ))),
    }
}

impl Coroutine {
    pub(crate) fn from_processor(processor: Processor) -> Self {
        Self {
            body: Mutex::new(CoroutineBody::Processor(processor)),
        }
    }

    fn body(&self) -> MutexGuard<'_, CoroutineBody> {
        self.body.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn processor(&self) -> Option<Processor> {
        match &*self.body() {
            CoroutineBody::Processor(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub(crate) fn mark_recycled(&self) {
        *self.body() = CoroutineBody::Recycled;
    }

    fn require_processor(&self) -> Result<Processor, LuaError> {
        self.processor().ok_or_else(|| {
            LuaError::InvalidOperation(format!("a {} coroutine cannot be resumed from the host", self.kind()))
        })
    }

    pub fn state(&self) -> CoroutineState {
        match &*self.body() {
            CoroutineBody::Processor(p) => p.state(),
            CoroutineBody::Callback(_) => CoroutineState::NotStarted,
            CoroutineBody::CallbackDead | CoroutineBody::Recycled => CoroutineState::Dead,
        }
    }

    pub fn kind(&self) -> CoroutineType {
        match &*self.body() {
            CoroutineBody::Processor(_) => CoroutineType::Coroutine,
            CoroutineBody::Callback(_) => CoroutineType::ClrCallback,
            CoroutineBody::CallbackDead => CoroutineType::ClrCallbackDead,
            CoroutineBody::Recycled => CoroutineType::Recycled,
        }
    }

    // ── Running ───────────────────────────────────────────────────────────

    /// Resumes a processor-backed coroutine from the host.
    ///
    /// Yielded values come back as a tuple. When the instruction budget ran
    /// out the result is a forced [`Value::YieldRequest`] and the coroutine
    /// is `ForceSuspended`; resume it again with no arguments.
    pub fn resume(&self, args: Vec<Value>) -> Result<Value, LuaError> {
        self.require_processor()?.resume(args)
    }

    pub fn resume_values<I>(&self, args: I) -> Result<Value, LuaError>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.resume(args.into_iter().map(Into::into).collect())
    }

    fn resume_with_context(
        &self,
        ctx: &mut dyn ExecutionContext,
        args: Vec<Value>,
    ) -> Result<Value, LuaError> {
        let mut body = self.body();
        match std::mem::replace(&mut *body, CoroutineBody::CallbackDead) {
            CoroutineBody::Processor(p) => {
                *body = CoroutineBody::Processor(p.clone());
                drop(body);
                p.resume(args)
            }
            CoroutineBody::Callback(native) => {
                drop(body);
                native.invoke(ctx, args, false)
            }
            gone => {
                *body = gone;
                Err(LuaError::cannot_resume_not_suspended(CoroutineState::Dead))
            }
        }
    }

    /// Closes the coroutine. Returns `true`, or `(false, error)` when a
    /// pending finalizer failed. Callback coroutines close trivially.
    pub fn close(&self) -> Result<Value, LuaError> {
        match self.processor() {
            Some(p) => p.close(),
            None => Ok(Value::Boolean(true)),
        }
    }

    /// Instructions the coroutine may run before it is force-suspended;
    /// zero disables the budget.
    pub fn auto_yield_counter(&self) -> u64 {
        self.processor().map_or(0, |p| p.auto_yield_counter())
    }

    pub fn set_auto_yield_counter(&self, counter: u64) -> Result<(), LuaError> {
        self.require_processor()?.set_auto_yield_counter(counter);
        Ok(())
    }

    /// The coroutine's call stack, innermost first, minus `skip` entries.
    pub fn stack_trace(&self, skip: usize) -> Vec<WatchItem> {
        self.processor()
            .map(|p| p.call_stack(None).into_iter().skip(skip).collect())
            .unwrap_or_default()
    }

    // ── Iteration ─────────────────────────────────────────────────────────

    /// Every resume result as-is: tuples, plain values and forced yield
    /// requests.
    pub fn as_typed_iter(self: &Arc<Self>) -> Result<CoroutineIter<Value>, LuaError> {
        self.iter_with(Ok)
    }

    /// Every resume result in scalar form.
    pub fn as_iter(self: &Arc<Self>) -> Result<CoroutineIter<Value>, LuaError> {
        self.iter_with(|v| Ok(v.to_scalar()))
    }

    /// Every resume result converted to `T`.
    pub fn as_iter_of<T>(self: &Arc<Self>) -> Result<CoroutineIter<T>, LuaError>
    where
        T: TryFrom<Value, Error = LuaError>,
    {
        self.iter_with(|v| T::try_from(v.to_scalar()))
    }

    /// Drives the coroutine to the end, discarding what it yields. Useful
    /// with an instruction budget to run a script in slices.
    pub fn as_unit_steps(self: &Arc<Self>) -> Result<CoroutineIter<()>, LuaError> {
        self.iter_with(|_| Ok(()))
    }

    fn iter_with<T>(self: &Arc<Self>, map: fn(Value) -> Result<T, LuaError>) -> Result<CoroutineIter<T>, LuaError> {
        self.require_processor()?;
        Ok(CoroutineIter {
            co: self.clone(),
            map,
            done: false,
        })
    }
}

impl CoroutineObject for Coroutine {
    fn state(&self) -> CoroutineState {
        Coroutine::state(self)
    }

    fn kind(&self) -> CoroutineType {
        Coroutine::kind(self)
    }

    fn resume(&self, ctx: &mut dyn ExecutionContext, args: Vec<Value>) -> Result<Value, LuaError> {
        self.resume_with_context(ctx, args)
    }

    fn close(&self) -> Result<Value, LuaError> {
        Coroutine::close(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Resumes a coroutine with no arguments for as long as it can run.
///
/// The first error ends the iteration after being yielded.
pub struct CoroutineIter<T> {
    co: Arc<Coroutine>,
    map: fn(Value) -> Result<T, LuaError>,
    done: bool,
}

impl<T> Iterator for CoroutineIter<T> {
    type Item = Result<T, LuaError>;

    fn next(&mut self) -> Option<Self::Item> {
        let resumable = matches!(
            self.co.state(),
            CoroutineState::NotStarted | CoroutineState::Suspended | CoroutineState::ForceSuspended
        );
        if self.done || !resumable {
            return None;
        }
        let item = self.co.resume(Vec::new()).and_then(self.map);
        self.done = item.is_err();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{emit_library_fn, function};
    use crate::Script;
    use tidal_core::CallbackArguments;

    fn counting_coroutine(script: &Script) -> Arc<Coroutine> {
        // yield 1; yield 2; return 3
        let f = function(script, "gen", &[], &[], |bc| {
            for n in [1, 2] {
                emit_library_fn(bc, "coroutine", "yield");
                bc.emit_literal(Value::from(n));
                bc.emit_call(1, Some("yield"));
                bc.emit_pop(1);
            }
            bc.emit_literal(Value::from(3));
            bc.emit_ret(1);
        });
        script.create_coroutine(f).unwrap()
    }

    #[test]
    fn native_callbacks_run_once() {
        let script = Script::new();
        let native = NativeFunction::new("once", |_, args: CallbackArguments| {
            Ok(Value::from(args.len() as i64))
        });
        let co = script.create_coroutine(Value::NativeFunction(native)).unwrap();
        assert_eq!(co.kind(), CoroutineType::ClrCallback);
        assert_eq!(co.state(), CoroutineState::NotStarted);
        assert!(matches!(co.resume(vec![]), Err(LuaError::InvalidOperation(_))));

        let resume = script.get_global("coroutine");
        let resume = tidal_core::table::read(resume.as_table().unwrap()).get_str("resume");
        let out = script
            .call(&resume, vec![Value::Coroutine(tidal_core::CoroutineRef::new(co.clone())), Value::from("a")])
            .unwrap();
        assert_eq!(out.into_values(), vec![Value::Boolean(true), Value::from(1)]);
        assert_eq!(co.kind(), CoroutineType::ClrCallbackDead);
        assert_eq!(co.state(), CoroutineState::Dead);
        assert_eq!(co.close().unwrap(), Value::Boolean(true));
    }

    #[test]
    fn only_functions_make_coroutines() {
        let script = Script::new();
        let err = script.create_coroutine(Value::from(5)).unwrap_err();
        assert!(matches!(err, LuaError::InvalidArgument(_)));
    }

    #[test]
    fn iterating_collects_every_step() {
        let script = Script::new();
        let co = counting_coroutine(&script);
        let values: Vec<Value> = co.as_iter().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(values, vec![Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(co.state(), CoroutineState::Dead);
    }

    #[test]
    fn typed_iteration_converts_values() {
        let script = Script::new();
        let co = counting_coroutine(&script);
        let numbers: Vec<f64> = co.as_iter_of::<f64>().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(numbers, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn unit_steps_run_to_completion() {
        let script = Script::new();
        let co = counting_coroutine(&script);
        assert_eq!(co.as_unit_steps().unwrap().count(), 3);
        assert_eq!(co.state(), CoroutineState::Dead);
    }

    #[test]
    fn main_coroutine_reports_main() {
        let script = Script::new();
        let main = script.main_coroutine();
        assert_eq!(main.state(), CoroutineState::Main);
        assert!(matches!(
            main.resume(vec![]),
            Err(LuaError::Runtime(_))
        ));
        assert!(matches!(main.close(), Err(LuaError::Runtime(_))));
    }
}
