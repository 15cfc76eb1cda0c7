//! The coroutine seam between the value model and the VM.

use crate::callback::ExecutionContext;
use crate::error::LuaError;
use crate::value::Value;
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use strum::Display;

/// Lifecycle of a coroutine (or of the main processor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum CoroutineState {
    /// The script's own processor; never resumable.
    Main,
    NotStarted,
    Running,
    Suspended,
    /// Suspended by the instruction budget rather than by a script yield.
    ForceSuspended,
    Dead,
}

/// What backs a coroutine handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum CoroutineType {
    /// A processor running script code.
    Coroutine,
    /// A native callback that runs once.
    ClrCallback,
    /// A native callback that already ran.
    ClrCallbackDead,
    /// A handle whose processor was handed to a newer coroutine.
    Recycled,
}

/// Implemented by the VM's coroutine type.
pub trait CoroutineObject: Send + Sync + fmt::Debug {
    fn state(&self) -> CoroutineState;

    fn kind(&self) -> CoroutineType;

    /// Resumes from library code, with the caller's execution context.
    fn resume(&self, ctx: &mut dyn ExecutionContext, args: Vec<Value>) -> Result<Value, LuaError>;

    /// Closes the coroutine, returning `true` or `(false, error)`.
    fn close(&self) -> Result<Value, LuaError>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared handle stored in [`Value::Coroutine`].
#[derive(Clone)]
pub struct CoroutineRef(pub Arc<dyn CoroutineObject>);

impl CoroutineRef {
    pub fn new(co: Arc<dyn CoroutineObject>) -> Self {
        Self(co)
    }

    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &CoroutineRef) -> bool {
        self.address() == other.address()
    }

    /// Recovers the concrete coroutine type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().into_any().downcast::<T>().ok()
    }
}

impl Deref for CoroutineRef {
    type Target = dyn CoroutineObject;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for CoroutineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoroutineRef({:#x}, {:?})", self.address(), self.0.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed(CoroutineState);

    impl CoroutineObject for Fixed {
        fn state(&self) -> CoroutineState {
            self.0
        }

        fn kind(&self) -> CoroutineType {
            CoroutineType::Coroutine
        }

        fn resume(&self, _: &mut dyn ExecutionContext, _: Vec<Value>) -> Result<Value, LuaError> {
            Err(LuaError::cannot_resume_not_suspended(self.0))
        }

        fn close(&self) -> Result<Value, LuaError> {
            Ok(Value::Boolean(true))
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn downcast_preserves_identity() {
        let concrete = Arc::new(Fixed(CoroutineState::Dead));
        let handle = CoroutineRef::new(concrete.clone());
        let back = handle.downcast::<Fixed>().unwrap();
        assert!(Arc::ptr_eq(&concrete, &back));
        assert_eq!(handle.state(), CoroutineState::Dead);
        assert!(handle.ptr_eq(&handle.clone()));
    }

    #[test]
    fn states_print_lowercase() {
        assert_eq!(CoroutineState::ForceSuspended.to_string(), "forcesuspended");
    }
}
