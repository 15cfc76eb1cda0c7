//! Debugger integration: stepping, breakpoints and watch data.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use tidal_core::{table, Instruction, LuaError, OpCode, SourceRef, SymbolRef, Value, ENV_SYMBOL};

use super::Processor;
use crate::debugger::{BreakpointLocation, Debugger, DebuggerAction, WatchItem, WatchKind};

/// How many value-stack slots a refresh reports.
const VSTACK_WATCH_DEPTH: usize = 32;

/// Debugger state shared by every processor of a script.
pub(crate) struct DebugContext {
    pub debugger: Option<Arc<dyn Debugger>>,
    pub line_based: bool,
    pub breakpoints: HashSet<SourceRef>,
    action: DebuggerAction,
    action_target: Option<usize>,
    exec_depth_at_step: usize,
    last_hl_ref: Option<SourceRef>,
}

impl Default for DebugContext {
    fn default() -> Self {
        Self {
            debugger: None,
            line_based: false,
            breakpoints: HashSet::new(),
            // A freshly attached debugger pauses on the first instruction.
            action: DebuggerAction::ByteCodeStepIn,
            action_target: None,
            exec_depth_at_step: 0,
            last_hl_ref: None,
        }
    }
}

impl DebugContext {
    pub(crate) fn attach(&mut self, debugger: Arc<dyn Debugger>) {
        self.line_based = debugger.line_based_breakpoints();
        self.debugger = Some(debugger);
        self.action = DebuggerAction::ByteCodeStepIn;
        self.action_target = None;
        self.last_hl_ref = None;
    }

    pub(crate) fn detach(&mut self) {
        *self = DebugContext {
            breakpoints: std::mem::take(&mut self.breakpoints),
            ..DebugContext::default()
        };
    }

    fn on_different_ref(&self, sref: Option<&SourceRef>) -> bool {
        match (sref, &self.last_hl_ref) {
            (Some(cur), Some(last)) if self.line_based => {
                cur.source_id != last.source_id || cur.from_line != last.from_line
            }
            (Some(cur), Some(last)) => cur != last,
            (None, Some(_)) => false,
            (cur, None) => cur.is_some(),
        }
    }

    /// Whether execution goes on without asking the debugger.
    fn keeps_running(&mut self, ip: usize, depth: usize, sref: Option<&SourceRef>) -> bool {
        match self.action {
            DebuggerAction::Run => {
                if self.line_based {
                    self.last_hl_ref = sref.cloned();
                }
                true
            }
            DebuggerAction::ByteCodeStepOver => self.action_target != Some(ip),
            DebuggerAction::ByteCodeStepOut | DebuggerAction::StepOut => {
                depth >= self.exec_depth_at_step
            }
            DebuggerAction::StepIn => {
                depth >= self.exec_depth_at_step
                    && (sref.is_none() || sref == self.last_hl_ref.as_ref())
            }
            DebuggerAction::StepOver => {
                sref.is_none()
                    || sref == self.last_hl_ref.as_ref()
                    || depth > self.exec_depth_at_step
            }
            _ => false,
        }
    }
}

fn apply_breakpoint(breakpoints: &mut HashSet<SourceRef>, sref: &SourceRef, state: Option<bool>) {
    let on = state.unwrap_or_else(|| !breakpoints.contains(sref));
    if on {
        breakpoints.insert(sref.clone());
    } else {
        breakpoints.remove(sref);
    }
}

impl Processor {
    // ── Pausing ───────────────────────────────────────────────────────────

    /// Called before each instruction while a debugger is attached. Blocks
    /// in [`Debugger::get_action`] until the debugger resumes execution.
    pub(super) fn listen_debugger(
        &self,
        ip: usize,
        instr: &Instruction,
        force_pause: bool,
    ) -> Result<(), LuaError> {
        let Some(debugger) = self.shared().debugger() else {
            return Ok(());
        };
        let sref = instr.source_ref.as_ref();
        let depth = self.lock().exec_stack.len();
        let pause_requested = force_pause || debugger.is_pause_requested();
        {
            let mut dbg = self.shared().debug_context();
            let at_breakpoint =
                sref.is_some_and(|r| dbg.breakpoints.contains(r)) && dbg.on_different_ref(sref);
            if pause_requested || at_breakpoint {
                dbg.action = DebuggerAction::ByteCodeStepIn;
                dbg.action_target = None;
            }
            if dbg.keeps_running(ip, depth, sref) {
                return Ok(());
            }
        }

        self.refresh_debugger(debugger.as_ref(), false, ip);
        loop {
            let action = debugger.get_action(ip, sref);
            match action {
                DebuggerAction::StepIn
                | DebuggerAction::StepOver
                | DebuggerAction::StepOut
                | DebuggerAction::ByteCodeStepOut => {
                    let mut dbg = self.shared().debug_context();
                    dbg.action = action;
                    dbg.last_hl_ref = sref.cloned();
                    dbg.exec_depth_at_step = depth;
                    return Ok(());
                }
                DebuggerAction::ByteCodeStepIn => {
                    let mut dbg = self.shared().debug_context();
                    dbg.action = action;
                    dbg.action_target = None;
                    return Ok(());
                }
                DebuggerAction::ByteCodeStepOver => {
                    let mut dbg = self.shared().debug_context();
                    dbg.action = action;
                    dbg.action_target = Some(ip + 1);
                    return Ok(());
                }
                DebuggerAction::Run => {
                    let mut dbg = self.shared().debug_context();
                    dbg.action = action;
                    dbg.last_hl_ref = sref.cloned();
                    dbg.action_target = None;
                    return Ok(());
                }
                DebuggerAction::ToggleBreakpoint(loc) => {
                    self.toggle_breakpoint(loc, None);
                    self.refresh_debugger(debugger.as_ref(), true, ip);
                }
                DebuggerAction::SetBreakpoint(loc) => {
                    self.toggle_breakpoint(loc, Some(true));
                    self.refresh_debugger(debugger.as_ref(), true, ip);
                }
                DebuggerAction::ClearBreakpoint(loc) => {
                    self.toggle_breakpoint(loc, Some(false));
                    self.refresh_debugger(debugger.as_ref(), true, ip);
                }
                DebuggerAction::ResetBreakpoints { source_id, lines } => {
                    self.reset_breakpoints(source_id, &lines);
                    self.refresh_debugger(debugger.as_ref(), true, ip);
                }
                DebuggerAction::Refresh => self.refresh_debugger(debugger.as_ref(), false, ip),
                DebuggerAction::HardRefresh => self.refresh_debugger(debugger.as_ref(), true, ip),
                DebuggerAction::None => thread::yield_now(),
            }
        }
    }

    // ── Breakpoints ───────────────────────────────────────────────────────

    /// Flips (or sets) the breakpoint on every location of the source
    /// containing `loc`, or on the nearest one when none contains it.
    /// Returns whether a location was found.
    pub(crate) fn toggle_breakpoint(&self, loc: BreakpointLocation, state: Option<bool>) -> bool {
        let refs = self.shared().breakable_refs(loc.source_id);
        let mut dbg = self.shared().debug_context();

        let containing: Vec<&SourceRef> = refs
            .iter()
            .filter(|r| r.includes_location(loc.source_id, loc.line, loc.col))
            .collect();
        if !containing.is_empty() {
            for r in containing {
                apply_breakpoint(&mut dbg.breakpoints, r, state);
            }
            return true;
        }

        let nearest = refs
            .iter()
            .filter_map(|r| r.location_distance(loc.source_id, loc.line, loc.col).map(|d| (d, r)))
            .min_by_key(|(d, _)| *d);
        match nearest {
            Some((_, r)) => {
                apply_breakpoint(&mut dbg.breakpoints, r, state);
                true
            }
            None => false,
        }
    }

    /// Leaves breakpoints on exactly the locations of `source_id` starting
    /// on one of `lines`; returns the lines that got one.
    pub(crate) fn reset_breakpoints(&self, source_id: u32, lines: &[u32]) -> HashSet<u32> {
        let refs = self.shared().breakable_refs(source_id);
        let mut dbg = self.shared().debug_context();
        let mut set = HashSet::new();
        for r in &refs {
            let on = lines.contains(&r.from_line);
            apply_breakpoint(&mut dbg.breakpoints, r, Some(on));
            if on {
                set.insert(r.from_line);
            }
        }
        set
    }

    // ── Watches ───────────────────────────────────────────────────────────

    fn refresh_debugger(&self, debugger: &dyn Debugger, hard: bool, ip: usize) {
        let sref = self.shared().source_ref_at(ip);
        let watches = debugger
            .watch_expressions()
            .into_iter()
            .map(|name| self.watch(name))
            .collect();

        debugger.update(WatchKind::CallStack, self.call_stack(sref));
        debugger.update(WatchKind::Watches, watches);
        debugger.update(WatchKind::VStack, self.value_stack_watch());
        debugger.update(WatchKind::Locals, self.locals_watch());
        debugger.update(WatchKind::Threads, self.threads_watch());

        if hard {
            let breakpoints: Vec<SourceRef> =
                self.shared().debug_context().breakpoints.iter().cloned().collect();
            debugger.refresh_breakpoints(&breakpoints);
        }
    }

    fn watch(&self, name: String) -> WatchItem {
        let symbol = self.find_symbol_by_name(&name);
        match self.get_generic_symbol(&symbol) {
            Ok(value) => WatchItem {
                name: Some(name),
                symbol: Some(symbol),
                value: Some(value),
                ..WatchItem::default()
            },
            Err(e) => WatchItem {
                name: Some(name),
                value: Some(Value::string(e.to_string())),
                is_error: true,
                ..WatchItem::default()
            },
        }
    }

    fn value_stack_watch(&self) -> Vec<WatchItem> {
        let s = self.lock();
        s.value_stack
            .iter()
            .rev()
            .take(VSTACK_WATCH_DEPTH)
            .enumerate()
            .map(|(i, v)| WatchItem {
                address: Some(i),
                value: Some(v.clone()),
                ..WatchItem::default()
            })
            .collect()
    }

    fn locals_watch(&self) -> Vec<WatchItem> {
        let s = self.lock();
        let Some(frame) = s.exec_stack.iter().rev().find(|f| !f.is_native()) else {
            return Vec::new();
        };
        frame
            .debug_symbols
            .iter()
            .zip(&frame.local_scope)
            .map(|(sym, cell)| WatchItem {
                name: Some(sym.name().to_string()),
                symbol: Some(sym.clone()),
                value: cell.as_ref().map(|c| c.get()),
                ..WatchItem::default()
            })
            .collect()
    }

    fn threads_watch(&self) -> Vec<WatchItem> {
        self.shared()
            .active_processors()
            .iter()
            .filter_map(Processor::owner)
            .map(|co| {
                let address = Arc::as_ptr(&co) as usize;
                WatchItem {
                    address: Some(address),
                    name: Some(format!("coroutine #{address:x}")),
                    ..WatchItem::default()
                }
            })
            .collect()
    }

    /// The call stack, innermost first. `starting` is the location being
    /// executed in the innermost frame; each outer frame is placed at the
    /// call that entered the frame inside it.
    pub(crate) fn call_stack(&self, mut starting: Option<SourceRef>) -> Vec<WatchItem> {
        let frames = self.lock().exec_stack.clone();
        let mut items = Vec::with_capacity(frames.len());
        for frame in frames.iter().rev() {
            match &frame.native {
                Some(native) => items.push(WatchItem {
                    return_address: frame.return_address,
                    name: Some(native.name().to_string()),
                    location: starting.clone(),
                    ..WatchItem::default()
                }),
                None => {
                    let name = self
                        .shared()
                        .instruction(frame.debug_entry_point)
                        .ok()
                        .filter(|i| i.op == OpCode::Meta)
                        .and_then(|i| i.name.as_deref().map(str::to_string));
                    items.push(WatchItem {
                        address: Some(frame.debug_entry_point),
                        base_pointer: Some(frame.base_pointer),
                        return_address: frame.return_address,
                        name,
                        location: starting.clone(),
                        ..WatchItem::default()
                    });
                }
            }
            starting = frame.calling_source_ref.clone();
            if let Some(continuation) = &frame.handlers.continuation {
                items.push(WatchItem {
                    name: Some(continuation.name().to_string()),
                    ..WatchItem::default()
                });
            }
        }
        items
    }

    // ── Symbols by name ───────────────────────────────────────────────────

    /// Resolves `name` the way the innermost script function would see it:
    /// a live local, then an upvalue, then a global through `_ENV`.
    pub(crate) fn find_symbol_by_name(&self, name: &str) -> SymbolRef {
        {
            let s = self.lock();
            if let Some(frame) = s.exec_stack.iter().rev().find(|f| !f.is_native()) {
                let local = frame
                    .debug_symbols
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(i, sym)| {
                        sym.name() == name && frame.local_scope.get(*i).is_some_and(Option::is_some)
                    });
                if let Some((_, sym)) = local {
                    return sym.clone();
                }
                if let Some(i) = frame.closure_scope.symbols.iter().position(|s| &**s == name) {
                    return SymbolRef::upvalue(name, i);
                }
            }
        }
        if name == ENV_SYMBOL {
            SymbolRef::DefaultEnv
        } else {
            SymbolRef::global(name, self.find_symbol_by_name(ENV_SYMBOL))
        }
    }

    /// Reads the current value of a symbol from the innermost script frame.
    pub(crate) fn get_generic_symbol(&self, symbol: &SymbolRef) -> Result<Value, LuaError> {
        match symbol {
            SymbolRef::DefaultEnv => Ok(Value::Table(self.shared().globals.clone())),
            SymbolRef::Global { name, env } => match self.get_generic_symbol(env)? {
                Value::Table(t) => Ok(table::read(&t).get_str(name)),
                _ => Err(LuaError::InvalidOperation("_ENV is not a table".into())),
            },
            SymbolRef::Local { index, .. } => {
                let s = self.lock();
                Ok(s
                    .exec_stack
                    .iter()
                    .rev()
                    .find(|f| !f.is_native())
                    .map(|f| f.local_value(*index))
                    .unwrap_or(Value::Nil))
            }
            SymbolRef::Upvalue { index, .. } => {
                let s = self.lock();
                Ok(s
                    .exec_stack
                    .iter()
                    .rev()
                    .find(|f| !f.is_native())
                    .and_then(|f| f.closure_scope.get(*index).map(|c| c.get()))
                    .unwrap_or(Value::Nil))
            }
        }
    }
}
