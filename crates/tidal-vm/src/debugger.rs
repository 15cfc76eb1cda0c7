//! The interface an attached debugger implements.
//!
//! The processor drives it: it asks for an action whenever execution may
//! pause, pushes watch data before each pause, and reports runtime errors
//! before they unwind. Transports (sockets, IDE protocols) live elsewhere.

use std::fmt;
use tidal_core::{ScriptRuntimeError, SourceRef, SymbolRef, Value};

/// A position in a source as a debugger front end names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BreakpointLocation {
    pub source_id: u32,
    pub line: u32,
    pub col: u32,
}

/// What the debugger wants the processor to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggerAction {
    /// Run until a breakpoint or a pause request.
    Run,
    StepIn,
    StepOver,
    StepOut,
    ByteCodeStepIn,
    ByteCodeStepOver,
    ByteCodeStepOut,
    ToggleBreakpoint(BreakpointLocation),
    SetBreakpoint(BreakpointLocation),
    ClearBreakpoint(BreakpointLocation),
    /// Replaces every breakpoint of a source with one per listed line.
    ResetBreakpoints { source_id: u32, lines: Vec<u32> },
    /// Re-send watch data.
    Refresh,
    /// Re-send watch data and the breakpoint list.
    HardRefresh,
    /// Nothing yet; the processor asks again.
    None,
}

impl DebuggerAction {
    /// Actions that resume execution rather than being handled in place.
    pub fn resumes(&self) -> bool {
        matches!(
            self,
            DebuggerAction::Run
                | DebuggerAction::StepIn
                | DebuggerAction::StepOver
                | DebuggerAction::StepOut
                | DebuggerAction::ByteCodeStepIn
                | DebuggerAction::ByteCodeStepOver
                | DebuggerAction::ByteCodeStepOut
        )
    }
}

/// The data sets a debugger can display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    CallStack,
    Watches,
    VStack,
    Locals,
    Threads,
}

/// One row of watch data: a call-stack entry, a local, a stack slot, ...
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchItem {
    pub address: Option<usize>,
    pub base_pointer: Option<usize>,
    pub return_address: Option<usize>,
    pub name: Option<String>,
    pub value: Option<Value>,
    pub symbol: Option<SymbolRef>,
    pub is_error: bool,
    pub location: Option<SourceRef>,
}

impl fmt::Display for WatchItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name.as_deref().unwrap_or("?");
        match &self.value {
            Some(v) => write!(f, "{name} = {v}"),
            None => write!(f, "{name}"),
        }
    }
}

/// A debugger attached to a [`Script`](crate::Script).
///
/// Callbacks arrive on the thread running the script, with no engine lock
/// held, so an implementation may block in [`Debugger::get_action`] until
/// its user decides.
pub trait Debugger: Send + Sync {
    /// Polled before every instruction; `true` pauses at the next one.
    fn is_pause_requested(&self) -> bool;

    /// Asked repeatedly while paused at `ip` until a resuming action comes back.
    fn get_action(&self, ip: usize, source_ref: Option<&SourceRef>) -> DebuggerAction;

    /// A runtime error is about to unwind; return `true` to pause on it.
    fn signal_runtime_exception(&self, error: &ScriptRuntimeError) -> bool;

    /// The outermost host call returned.
    fn signal_execution_ended(&self);

    fn update(&self, kind: WatchKind, items: Vec<WatchItem>);

    /// Variable names to evaluate into [`WatchKind::Watches`].
    fn watch_expressions(&self) -> Vec<String>;

    fn refresh_breakpoints(&self, breakpoints: &[SourceRef]);

    /// Whether breakpoints and steps work on whole lines rather than on
    /// exact source ranges.
    fn line_based_breakpoints(&self) -> bool;
}
