//! Locals, upvalues and to-be-closed variables.

use std::sync::Arc;

use tidal_core::{ClosureContext, Closure, Instruction, LuaError, SymbolRef, Value, ValueCell};

use super::Processor;

impl Processor {
    // ── Variables ─────────────────────────────────────────────────────────

    pub(super) fn exec_local(&self, instr: &Instruction) -> Result<(), LuaError> {
        let sym = symbol_of(instr)?;
        let mut s = self.lock();
        let v = s.top_frame()?.local_value(sym.index());
        s.push(v);
        Ok(())
    }

    pub(super) fn exec_upvalue(&self, instr: &Instruction) -> Result<(), LuaError> {
        let sym = symbol_of(instr)?;
        let mut s = self.lock();
        let v = s
            .top_frame()?
            .closure_scope
            .get(sym.index())
            .map(ValueCell::get)
            .ok_or_else(|| LuaError::internal(format!("no upvalue for {sym}")))?;
        s.push(v);
        Ok(())
    }

    pub(super) fn exec_store_local(&self, instr: &Instruction) -> Result<(), LuaError> {
        let sym = symbol_of(instr)?;
        let value = self.store_value(instr)?;
        self.assign_local(sym, value)
    }

    pub(super) fn exec_store_upvalue(&self, instr: &Instruction) -> Result<(), LuaError> {
        let sym = symbol_of(instr)?;
        let value = self.store_value(instr)?;
        let s = self.lock();
        let cell = s
            .top_frame()?
            .closure_scope
            .get(sym.index())
            .ok_or_else(|| LuaError::internal(format!("no upvalue for {sym}")))?;
        cell.set(value);
        Ok(())
    }

    /// The value a store instruction assigns: `num_val` slots down the
    /// stack, element `num_val2` when that slot holds a tuple.
    pub(super) fn store_value(&self, instr: &Instruction) -> Result<Value, LuaError> {
        let s = self.lock();
        let v = s.peek(instr.num())?;
        let tuple_index = instr.num2();
        Ok(match v {
            Value::Tuple(items) => items.get(tuple_index).map(Value::to_scalar).unwrap_or(Value::Nil),
            other if tuple_index == 0 => other.to_scalar(),
            _ => Value::Nil,
        })
    }

    /// Writes a local of the current frame. A to-be-closed local checks
    /// its new value and finalizes the one it replaces.
    pub(super) fn assign_local(&self, sym: &SymbolRef, value: Value) -> Result<(), LuaError> {
        let index = sym.index();
        if sym.is_to_be_closed() {
            if value.is_truthy() && value.metamethod("__close").is_none() {
                return Err(LuaError::close_metamethod_expected(sym.name()));
            }
            let previous = self.lock().top_frame()?.local_value(index);
            if previous.is_truthy() && !previous.raw_equals(&value) {
                self.close_value(sym, previous, &Value::Nil)?;
            }
        }

        let mut s = self.lock();
        let frame = s.top_frame_mut()?;
        if index >= frame.local_scope.len() {
            frame.local_scope.resize(index + 1, None);
        }
        match &frame.local_scope[index] {
            Some(cell) => cell.set(value),
            None => frame.local_scope[index] = Some(ValueCell::new(value)),
        }
        if sym.is_to_be_closed() {
            frame.to_be_closed_indices.insert(index);
        }
        Ok(())
    }

    /// `Args`: binds the frame's arguments to its parameters.
    pub(super) fn exec_args(&self, instr: &Instruction) -> Result<(), LuaError> {
        let mut args = {
            let s = self.lock();
            let base = s.top_frame()?.base_pointer;
            let argc = match s.value_stack.get(base.wrapping_sub(1)) {
                Some(Value::Number(n)) => *n as usize,
                _ => return Err(LuaError::internal("ARGS without an argument count")),
            };
            s.value_stack[base - 1 - argc..base - 1].to_vec()
        };
        if let Some(Value::Tuple(last)) = args.last() {
            let last = last.clone();
            args.pop();
            args.extend(last.iter().cloned());
        }

        for (i, param) in instr.symbols().iter().enumerate() {
            let value = if param.name() == tidal_core::VARARGS_SYMBOL {
                Value::tuple_of(args.iter().skip(i).map(Value::to_scalar).collect())
            } else {
                args.get(i).map(Value::to_scalar).unwrap_or(Value::Nil)
            };
            self.assign_local(param, value)?;
        }
        Ok(())
    }

    /// `Closure`: captures the listed cells of the running frame.
    pub(super) fn exec_closure(&self, instr: &Instruction) -> Result<Value, LuaError> {
        let mut s = self.lock();
        let frame = s.top_frame_mut()?;
        let mut names = Vec::with_capacity(instr.symbols().len());
        let mut cells = Vec::with_capacity(instr.symbols().len());
        for sym in instr.symbols() {
            let cell = match sym {
                SymbolRef::Local { index, .. } => {
                    if *index >= frame.local_scope.len() {
                        frame.local_scope.resize(index + 1, None);
                    }
                    frame.local_scope[*index]
                        .get_or_insert_with(ValueCell::default)
                        .clone()
                }
                SymbolRef::Upvalue { index, .. } => frame
                    .closure_scope
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| LuaError::internal(format!("no upvalue for {sym}")))?,
                SymbolRef::DefaultEnv => ValueCell::new(Value::Table(self.shared().globals.clone())),
                SymbolRef::Global { .. } => {
                    return Err(LuaError::internal(format!("cannot capture global {sym}")))
                }
            };
            names.push(Arc::from(sym.name()));
            cells.push(cell);
        }
        Ok(Value::Closure(Arc::new(Closure::new(
            instr.num(),
            ClosureContext::new(names, cells),
        ))))
    }

    // ── Blocks ────────────────────────────────────────────────────────────

    /// `BeginFn`: allocates the frame's locals and registers the root
    /// block's finalizers.
    pub(super) fn exec_begin_fn(&self, instr: &Instruction) -> Result<(), LuaError> {
        let mut s = self.lock();
        let frame = s.top_frame_mut()?;
        frame.debug_symbols = instr.symbol_list.clone().unwrap_or_else(|| Arc::from(Vec::new()));
        frame.local_scope = vec![None; instr.num()];
        frame.blocks_to_close.clear();
        frame.to_be_closed_indices.clear();
        let root: Vec<SymbolRef> = if instr.num_val2 >= 0 {
            instr
                .symbols()
                .iter()
                .filter(|s| s.is_to_be_closed() && s.index() as i64 <= instr.num_val2 as i64)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        frame.to_be_closed_indices.extend(root.iter().map(SymbolRef::index));
        frame.blocks_to_close.push(root);
        Ok(())
    }

    /// `Enter`: finalizes leftovers of a previous pass through the block,
    /// clears its slots and opens its finalizer list.
    pub(super) fn exec_enter(&self, instr: &Instruction) -> Result<(), LuaError> {
        self.close_symbols(instr.symbols(), &Value::Nil)?;
        let mut s = self.lock();
        let frame = s.top_frame_mut()?;
        frame.clear_block_data(instr.num_val, instr.num_val2);
        frame.to_be_closed_indices.extend(instr.symbols().iter().map(SymbolRef::index));
        frame.blocks_to_close.push(instr.symbols().to_vec());
        Ok(())
    }

    /// `Leave` / `Exit`: finalizes the innermost block and clears its slots.
    pub(super) fn exec_leave(&self, instr: &Instruction) -> Result<(), LuaError> {
        self.close_current_block(&Value::Nil)?;
        self.lock()
            .top_frame_mut()?
            .clear_block_data(instr.num_val, instr.num_val2);
        Ok(())
    }

    /// `Clean`: finalizes the nested closers listed and clears the range.
    pub(super) fn exec_clean(&self, instr: &Instruction) -> Result<(), LuaError> {
        self.close_symbols(instr.symbols(), &Value::Nil)?;
        self.lock()
            .top_frame_mut()?
            .clear_block_data(instr.num_val, instr.num_val2);
        Ok(())
    }

    // ── Finalizers ────────────────────────────────────────────────────────

    /// Empties the slot of `sym` if it still awaits finalization and
    /// returns the value to close.
    fn take_closable(&self, sym: &SymbolRef) -> Result<Option<Value>, LuaError> {
        let mut s = self.lock();
        let frame = s.top_frame_mut()?;
        let index = sym.index();
        if !frame.to_be_closed_indices.remove(&index) {
            return Ok(None);
        }
        let value = frame
            .local_scope
            .get_mut(index)
            .and_then(Option::take)
            .map(|c| c.get())
            .unwrap_or(Value::Nil);
        Ok(Some(value))
    }

    /// Finalizes `symbols` in reverse declaration order.
    fn close_symbols(&self, symbols: &[SymbolRef], err: &Value) -> Result<(), LuaError> {
        for sym in symbols.iter().rev() {
            if let Some(v) = self.take_closable(sym)? {
                self.close_value(sym, v, err)?;
            }
        }
        Ok(())
    }

    /// Finalizes and pops the innermost block of the running frame.
    ///
    /// Closers are taken one at a time, so after a failing finalizer the
    /// rest stay queued for whoever unwinds next.
    pub(super) fn close_current_block(&self, err: &Value) -> Result<(), LuaError> {
        loop {
            let next = {
                let mut s = self.lock();
                let frame = s.top_frame_mut()?;
                let Some(block) = frame.blocks_to_close.last_mut() else {
                    return Ok(());
                };
                match block.pop() {
                    Some(sym) => sym,
                    None => {
                        frame.blocks_to_close.pop();
                        return Ok(());
                    }
                }
            };
            if let Some(v) = self.take_closable(&next)? {
                self.close_value(&next, v, err)?;
            }
        }
    }

    /// Finalizes every open block of the running frame.
    pub(super) fn close_all_pending_blocks(&self, err: &Value) -> Result<(), LuaError> {
        while !self.lock().top_frame()?.blocks_to_close.is_empty() {
            self.close_current_block(err)?;
        }
        Ok(())
    }

    /// Calls `__close(value, err)`; nil and false need no finalization.
    fn close_value(&self, sym: &SymbolRef, value: Value, err: &Value) -> Result<(), LuaError> {
        if !value.is_truthy() {
            return Ok(());
        }
        let Some(handler) = value.metamethod("__close") else {
            return Err(LuaError::close_metamethod_expected(sym.name()));
        };
        self.call(&handler, vec![value, err.clone()])?;
        Ok(())
    }
}

fn symbol_of(instr: &Instruction) -> Result<&SymbolRef, LuaError> {
    instr
        .symbol
        .as_ref()
        .ok_or_else(|| LuaError::internal(format!("{} without a symbol", instr.op)))
}
