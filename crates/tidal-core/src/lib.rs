//! `tidal-core`: foundational types shared across the entire tidal workspace.
//!
//! This crate defines:
//! - [`Value`]: the dynamically-typed value enum, including the transient
//!   tuple and control-request carriers the processor understands
//! - [`LuaError`]: the unified error type
//! - The stack-machine [`OpCode`] set and the [`Instruction`] record
//! - [`SymbolRef`]: resolved variable references handed over by a front end
//! - Key seams (`ExecutionContext`, `CoroutineObject`) that let the VM crate
//!   plug coroutines and native callbacks into the value model

pub mod callback;
pub mod closure;
pub mod coroutine;
pub mod error;
pub mod instruction;
pub mod opcode;
pub mod symbol;
pub mod table;
pub mod value;

pub use callback::{CallbackArguments, ExecutionContext, NativeFunction};
pub use closure::{Closure, ClosureContext, UpvaluesType, ValueCell};
pub use coroutine::{CoroutineObject, CoroutineRef, CoroutineState, CoroutineType};
pub use error::{LuaError, ScriptRuntimeError};
pub use instruction::{Instruction, SourceRef};
pub use opcode::{FieldUsage, OpCode};
pub use symbol::{SymbolAttributes, SymbolRef, SymbolRefType};
pub use table::{Table, TableKey, TableRef};
pub use value::{TailCallRequest, UserData, Value, YieldRequest};

/// Name of the implicit environment upvalue every chunk closes over.
pub const ENV_SYMBOL: &str = "_ENV";

/// Name of the symbol that collects variadic arguments.
pub const VARARGS_SYMBOL: &str = "...";
