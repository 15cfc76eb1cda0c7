//! Per-script engine settings.

use serde::{Deserialize, Serialize};
use tidal_core::LuaError;

const MIN_CALL_DEPTH: usize = 16;

/// Settings threaded through a [`Script`](crate::Script).
///
/// Every way of building one validates it: the setters, [`TryFrom`] and
/// deserialization all reject out-of-range values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawScriptOptions", into = "RawScriptOptions")]
pub struct ScriptOptions {
    check_thread_access: bool,
    tail_call_optimization_threshold: usize,
    max_call_depth: usize,
    default_auto_yield_counter: u64,
    register_stdlib: bool,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            check_thread_access: true,
            tail_call_optimization_threshold: 65_536,
            max_call_depth: 131_072,
            default_auto_yield_counter: 0,
            register_stdlib: true,
        }
    }
}

impl ScriptOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether entering a busy processor from a second thread is an error.
    pub fn check_thread_access(&self) -> bool {
        self.check_thread_access
    }

    pub fn set_check_thread_access(&mut self, on: bool) {
        self.check_thread_access = on;
    }

    /// Stack depth (calls or values) past which calls in tail position
    /// reuse the caller's frame.
    pub fn tail_call_optimization_threshold(&self) -> usize {
        self.tail_call_optimization_threshold
    }

    pub fn set_tail_call_optimization_threshold(&mut self, threshold: usize) -> Result<(), LuaError> {
        if threshold == 0 {
            return Err(LuaError::Config(
                "tail_call_optimization_threshold must be at least 1".into(),
            ));
        }
        self.tail_call_optimization_threshold = threshold;
        Ok(())
    }

    /// Most call frames a processor may hold before "stack overflow".
    pub fn max_call_depth(&self) -> usize {
        self.max_call_depth
    }

    pub fn set_max_call_depth(&mut self, depth: usize) -> Result<(), LuaError> {
        if depth < MIN_CALL_DEPTH {
            return Err(LuaError::Config(format!(
                "max_call_depth must be at least {MIN_CALL_DEPTH}"
            )));
        }
        self.max_call_depth = depth;
        Ok(())
    }

    /// Instruction budget given to new coroutines; `0` disables forced yields.
    pub fn default_auto_yield_counter(&self) -> u64 {
        self.default_auto_yield_counter
    }

    pub fn set_default_auto_yield_counter(&mut self, counter: u64) {
        self.default_auto_yield_counter = counter;
    }

    pub fn register_stdlib(&self) -> bool {
        self.register_stdlib
    }

    pub fn set_register_stdlib(&mut self, on: bool) {
        self.register_stdlib = on;
    }

    pub fn validate(&self) -> Result<(), LuaError> {
        ScriptOptions::try_from(RawScriptOptions::from(self.clone())).map(|_| ())
    }
}

/// Unvalidated mirror used for (de)serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RawScriptOptions {
    check_thread_access: bool,
    tail_call_optimization_threshold: usize,
    max_call_depth: usize,
    default_auto_yield_counter: u64,
    register_stdlib: bool,
}

impl Default for RawScriptOptions {
    fn default() -> Self {
        ScriptOptions::default().into()
    }
}

impl From<ScriptOptions> for RawScriptOptions {
    fn from(o: ScriptOptions) -> Self {
        Self {
            check_thread_access: o.check_thread_access,
            tail_call_optimization_threshold: o.tail_call_optimization_threshold,
            max_call_depth: o.max_call_depth,
            default_auto_yield_counter: o.default_auto_yield_counter,
            register_stdlib: o.register_stdlib,
        }
    }
}

impl TryFrom<RawScriptOptions> for ScriptOptions {
    type Error = LuaError;

    fn try_from(raw: RawScriptOptions) -> Result<Self, LuaError> {
        let mut o = ScriptOptions::default();
        o.set_check_thread_access(raw.check_thread_access);
        o.set_tail_call_optimization_threshold(raw.tail_call_optimization_threshold)?;
        o.set_max_call_depth(raw.max_call_depth)?;
        o.set_default_auto_yield_counter(raw.default_auto_yield_counter);
        o.set_register_stdlib(raw.register_stdlib);
        Ok(o)
    }
}
