//! `tidal-vm`: the stack-machine processor that executes [`ByteCode`].
//!
//! A [`Script`] owns the shared bytecode, the globals table and a main
//! processor; every [`Coroutine`] runs on a processor of its own. Native
//! code talks to the engine through [`ExecutionContext`].
//!
//! [`ByteCode`]: tidal_compiler::ByteCode
//! [`ExecutionContext`]: tidal_core::ExecutionContext

pub mod context;
pub mod coroutine;
pub mod debugger;
pub mod options;
mod processor;
pub mod script;
pub mod stdlib;

#[cfg(test)]
pub(crate) mod testing;

pub use context::ScriptExecutionContext;
pub use coroutine::{Coroutine, CoroutineIter};
pub use debugger::{BreakpointLocation, Debugger, DebuggerAction, WatchItem, WatchKind};
pub use options::ScriptOptions;
pub use script::Script;
