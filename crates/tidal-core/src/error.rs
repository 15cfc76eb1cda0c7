use crate::coroutine::CoroutineState;
use crate::instruction::SourceRef;
use crate::value::Value;
use std::fmt;
use thiserror::Error;

/// All errors that can occur within the tidal runtime.
///
/// Only [`LuaError::Runtime`] is visible to scripts: protected calls catch
/// it and nothing else.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LuaError {
    /// A script runtime error (raised by `error()` or a failed operation).
    #[error("{0}")]
    Runtime(ScriptRuntimeError),

    /// Internal consistency violation: the engine met bytecode or state
    /// valid compiled input never produces.
    #[error("internal error: {0}")]
    Internal(String),

    /// The host used the engine in a way its state does not allow.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The host passed an argument the engine cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A binary chunk could not be loaded.
    #[error("bad binary chunk: {0}")]
    Chunk(String),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A catchable script error.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRuntimeError {
    pub message: String,
    /// The message prefixed with the location that raised it, once known.
    pub decorated_message: Option<String>,
    /// The value passed to `error()`, when there was one.
    pub value: Option<Value>,
    pub do_not_decorate: bool,
}

impl ScriptRuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            decorated_message: None,
            value: None,
            do_not_decorate: false,
        }
    }

    /// An error raised with an arbitrary value, as `error(v)` does.
    pub fn with_value(value: Value) -> Self {
        let message = match &value {
            Value::Nil => "nil".to_string(),
            v => v.to_print_string(),
        };
        Self {
            value: Some(value),
            ..Self::new(message)
        }
    }

    /// Prefixes the message with `location`, at most once.
    pub fn decorate(&mut self, location: Option<&SourceRef>) {
        if self.decorated_message.is_some() {
            return;
        }
        self.decorated_message = Some(match location {
            Some(sref) if !self.do_not_decorate => format!("{sref}: {}", self.message),
            _ => self.message.clone(),
        });
    }

    pub fn decorated(&self) -> &str {
        self.decorated_message.as_deref().unwrap_or(&self.message)
    }

    /// What a protected call hands back to the script: the raised value if
    /// it was not a string, otherwise the decorated message.
    pub fn to_value(&self) -> Value {
        match &self.value {
            Some(v) if !matches!(v, Value::String(_)) => v.clone(),
            _ => Value::string(self.decorated()),
        }
    }
}

impl fmt::Display for ScriptRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.decorated())
    }
}

impl From<ScriptRuntimeError> for LuaError {
    fn from(e: ScriptRuntimeError) -> Self {
        LuaError::Runtime(e)
    }
}

// ── Constructors for engine-raised runtime errors ─────────────────────────────

/// The value that makes a binary arithmetic operation fail.
fn offending<'a>(l: &'a Value, r: &'a Value) -> &'a Value {
    if l.cast_to_number().is_some() {
        r
    } else {
        l
    }
}

impl LuaError {
    pub fn runtime(message: impl Into<String>) -> Self {
        LuaError::Runtime(ScriptRuntimeError::new(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        LuaError::Internal(message.into())
    }

    pub fn is_runtime(&self) -> bool {
        matches!(self, LuaError::Runtime(_))
    }

    pub fn as_runtime(&self) -> Option<&ScriptRuntimeError> {
        match self {
            LuaError::Runtime(e) => Some(e),
            _ => None,
        }
    }

    pub fn attempt_to_call_non_func(value: &Value, debug_text: Option<&str>) -> Self {
        match debug_text {
            Some(name) => LuaError::runtime(format!(
                "attempt to call a {} value near '{name}'",
                value.type_name()
            )),
            None => LuaError::runtime(format!("attempt to call a {} value", value.type_name())),
        }
    }

    pub fn arithmetic_on_non_number(l: &Value, r: Option<&Value>) -> Self {
        let bad = match r {
            Some(r) => offending(l, r),
            None => l,
        };
        LuaError::runtime(format!(
            "attempt to perform arithmetic on a {} value",
            bad.type_name()
        ))
    }

    pub fn concat_on_non_string(l: &Value, r: &Value) -> Self {
        let bad = if l.cast_to_string().is_some() { r } else { l };
        LuaError::runtime(format!("attempt to concatenate a {} value", bad.type_name()))
    }

    pub fn len_on_invalid_type(value: &Value) -> Self {
        LuaError::runtime(format!("attempt to get length of a {} value", value.type_name()))
    }

    pub fn compare_invalid_type(l: &Value, r: &Value) -> Self {
        if l.type_name() == r.type_name() {
            LuaError::runtime(format!("attempt to compare two {} values", l.type_name()))
        } else {
            LuaError::runtime(format!(
                "attempt to compare {} with {}",
                l.type_name(),
                r.type_name()
            ))
        }
    }

    pub fn index_type(obj: &Value, key: &Value) -> Self {
        match key {
            Value::String(k) => LuaError::runtime(format!(
                "attempt to index a {} value (field '{k}')",
                obj.type_name()
            )),
            _ => LuaError::runtime(format!("attempt to index a {} value", obj.type_name())),
        }
    }

    pub fn bitwise_on_non_integer(value: &Value) -> Self {
        if value.cast_to_number().is_some() {
            LuaError::runtime("number has no integer representation")
        } else {
            LuaError::runtime(format!(
                "attempt to perform bitwise operation on a {} value",
                value.type_name()
            ))
        }
    }

    pub fn loop_in_index() -> Self {
        LuaError::runtime("loop in gettable")
    }

    pub fn loop_in_new_index() -> Self {
        LuaError::runtime("loop in settable")
    }

    pub fn cannot_resume_not_suspended(state: CoroutineState) -> Self {
        if state == CoroutineState::Dead {
            LuaError::runtime("cannot resume dead coroutine")
        } else {
            LuaError::runtime("cannot resume non-suspended coroutine")
        }
    }

    pub fn cannot_resume_force_suspended_with_args() -> Self {
        LuaError::runtime("args must be empty to resume a force-suspended coroutine")
    }

    pub fn cannot_yield() -> Self {
        LuaError::runtime("attempt to yield across a C-call boundary")
    }

    pub fn cannot_yield_main() -> Self {
        LuaError::runtime("attempt to yield from outside a coroutine")
    }

    pub fn cannot_close_coroutine(state: CoroutineState) -> Self {
        match state {
            CoroutineState::Main => LuaError::runtime("cannot close the main coroutine"),
            CoroutineState::Running => LuaError::runtime("cannot close a running coroutine"),
            other => LuaError::runtime(format!("cannot close a {other} coroutine")),
        }
    }

    pub fn close_metamethod_expected(name: &str) -> Self {
        LuaError::runtime(format!("variable '{name}' got a non-closable value"))
    }

    /// `stage`: 1 initial value, 2 step, 3 limit of a numeric `for`.
    pub fn convert_to_number_failed(stage: i32) -> Self {
        match stage {
            1 => LuaError::runtime("'for' initial value must be a number"),
            2 => LuaError::runtime("'for' step must be a number"),
            3 => LuaError::runtime("'for' limit must be a number"),
            _ => LuaError::runtime("value must be a number"),
        }
    }

    pub fn stack_overflow() -> Self {
        LuaError::runtime("stack overflow")
    }

    /// A native function's control request cannot cross a protected call.
    pub fn cannot_call_directly(function_name: &str) -> Self {
        LuaError::runtime(format!(
            "the function passed to {function_name} cannot be called directly by {function_name}. \
             wrap in a script function instead."
        ))
    }

    pub fn bad_argument(index: usize, function_name: &str, message: &str) -> Self {
        LuaError::runtime(format!(
            "bad argument #{index} to '{function_name}' ({message})"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoration_happens_once() {
        let mut e = ScriptRuntimeError::new("boom");
        e.decorate(Some(&SourceRef::line(2, 5, 1, 4)));
        e.decorate(Some(&SourceRef::line(9, 9, 9, 9)));
        assert_eq!(e.decorated(), "chunk_2:(5,1-4): boom");
        assert_eq!(LuaError::Runtime(e).to_string(), "chunk_2:(5,1-4): boom");
    }

    #[test]
    fn undecorated_errors_keep_their_message() {
        let mut e = ScriptRuntimeError::new("plain");
        e.do_not_decorate = true;
        e.decorate(Some(&SourceRef::line(0, 1, 1, 1)));
        assert_eq!(e.decorated(), "plain");
    }

    #[test]
    fn arithmetic_blames_the_non_number() {
        let err = LuaError::arithmetic_on_non_number(&Value::from(1), Some(&Value::new_table()));
        assert_eq!(err.to_string(), "attempt to perform arithmetic on a table value");
    }

    #[test]
    fn dead_coroutine_message() {
        assert_eq!(
            LuaError::cannot_resume_not_suspended(CoroutineState::Dead).to_string(),
            "cannot resume dead coroutine"
        );
        assert!(LuaError::cannot_resume_force_suspended_with_args().is_runtime());
    }

    #[test]
    fn error_values_survive_protected_calls() {
        let t = Value::new_table();
        assert_eq!(ScriptRuntimeError::with_value(t.clone()).to_value(), t);
        let mut s = ScriptRuntimeError::with_value(Value::from("x"));
        s.decorate(None);
        assert_eq!(s.to_value(), Value::from("x"));
    }
}
