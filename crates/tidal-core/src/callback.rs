//! Native callbacks and the execution context they receive.

use crate::coroutine::CoroutineRef;
use crate::error::LuaError;
use crate::instruction::SourceRef;
use crate::table::TableRef;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// What a native function can ask of the engine while it runs.
pub trait ExecutionContext {
    /// Calls a function through the engine (script closures included) and
    /// returns its result.
    fn call(&mut self, function: &Value, args: Vec<Value>) -> Result<Value, LuaError>;

    /// The script's globals table.
    fn globals(&self) -> TableRef;

    /// Whether a `YieldRequest` returned now would suspend a coroutine.
    fn is_yieldable(&self) -> bool;

    /// The coroutine whose processor is running this callback.
    fn running_coroutine(&self) -> Option<CoroutineRef>;

    /// Whether the running processor is the script's main one.
    fn is_main(&self) -> bool;

    /// Wraps a function into a new, not yet started coroutine.
    fn create_coroutine(&mut self, function: Value) -> Result<Value, LuaError>;

    /// Location of the instruction that invoked this callback.
    fn calling_location(&self) -> Option<SourceRef>;

    /// Location `level` frames up the call stack, where level 1 is the
    /// caller of this callback.
    fn location_at_level(&self, level: usize) -> Option<SourceRef>;
}

pub type Callback =
    dyn Fn(&mut dyn ExecutionContext, CallbackArguments) -> Result<Value, LuaError> + Send + Sync;

/// A host function callable from scripts.
///
/// The returned value may be a [`Value::Tuple`] for multiple results, or a
/// [`Value::YieldRequest`] / [`Value::TailCallRequest`] to steer the processor.
#[derive(Clone)]
pub struct NativeFunction {
    name: Arc<str>,
    callback: Arc<Callback>,
}

impl NativeFunction {
    pub fn new<F>(name: &str, callback: F) -> Self
    where
        F: Fn(&mut dyn ExecutionContext, CallbackArguments) -> Result<Value, LuaError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            callback: Arc::new(callback),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(
        &self,
        ctx: &mut dyn ExecutionContext,
        args: Vec<Value>,
        method_call: bool,
    ) -> Result<Value, LuaError> {
        (self.callback)(ctx, CallbackArguments::new(args, method_call))
    }

    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.callback) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &NativeFunction) -> bool {
        self.address() == other.address()
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// Arguments of a native call. A trailing tuple is spread into separate
/// arguments on construction.
#[derive(Debug, Clone, Default)]
pub struct CallbackArguments {
    values: Vec<Value>,
    method_call: bool,
}

impl CallbackArguments {
    pub fn new(mut values: Vec<Value>, method_call: bool) -> Self {
        if let Some(Value::Tuple(last)) = values.last() {
            let last = last.clone();
            values.pop();
            values.extend(last.iter().cloned());
        }
        Self { values, method_call }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Argument `index` in scalar form; nil when absent.
    pub fn get(&self, index: usize) -> Value {
        self.values.get(index).map(Value::to_scalar).unwrap_or(Value::Nil)
    }

    pub fn raw(&self) -> &[Value] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.values
    }

    /// Arguments from `index` on.
    pub fn skip(&self, index: usize) -> Vec<Value> {
        self.values.iter().skip(index).cloned().collect()
    }

    /// Whether the call used method syntax (`obj:m()`).
    pub fn is_method_call(&self) -> bool {
        self.method_call
    }

    pub fn check_function(&self, index: usize, function_name: &str) -> Result<Value, LuaError> {
        let v = self.get(index);
        if v.is_callable() {
            Ok(v)
        } else {
            Err(self.type_error(index, function_name, "function", &v))
        }
    }

    pub fn check_table(&self, index: usize, function_name: &str) -> Result<TableRef, LuaError> {
        match self.get(index) {
            Value::Table(t) => Ok(t),
            v => Err(self.type_error(index, function_name, "table", &v)),
        }
    }

    pub fn check_coroutine(&self, index: usize, function_name: &str) -> Result<CoroutineRef, LuaError> {
        match self.get(index) {
            Value::Coroutine(c) => Ok(c),
            v => Err(self.type_error(index, function_name, "coroutine", &v)),
        }
    }

    pub fn check_number(&self, index: usize, function_name: &str) -> Result<f64, LuaError> {
        let v = self.get(index);
        v.cast_to_number()
            .ok_or_else(|| self.type_error(index, function_name, "number", &v))
    }

    pub fn check_present(&self, index: usize, function_name: &str) -> Result<Value, LuaError> {
        if index < self.values.len() {
            Ok(self.get(index))
        } else {
            Err(LuaError::bad_argument(index + 1, function_name, "value expected"))
        }
    }

    fn type_error(&self, index: usize, function_name: &str, expected: &str, got: &Value) -> LuaError {
        let got = if index < self.values.len() { got.type_name() } else { "no value" };
        LuaError::bad_argument(index + 1, function_name, &format!("{expected} expected, got {got}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_tuple_is_spread() {
        let args = CallbackArguments::new(
            vec![Value::from(1), Value::tuple_of(vec![Value::from(2), Value::from(3)])],
            false,
        );
        assert_eq!(args.len(), 3);
        assert_eq!(args.get(2), Value::from(3));
        assert_eq!(args.get(5), Value::Nil);
    }

    #[test]
    fn type_checks_report_argument_position() {
        let args = CallbackArguments::new(vec![Value::from(1)], false);
        let err = args.check_function(0, "pcall").unwrap_err();
        assert_eq!(
            err.to_string(),
            "bad argument #1 to 'pcall' (function expected, got number)"
        );
        let err = args.check_table(1, "setmetatable").unwrap_err();
        assert!(err.to_string().contains("got no value"));
    }
}
