//! The instruction loop, the opcode handlers and error unwinding.

use std::cmp::Ordering;
use std::sync::Arc;

use log::{trace, warn};
use tidal_core::{
    table, CoroutineState, Instruction, LuaError, OpCode, ScriptRuntimeError, Value, YieldRequest,
};

use super::frame::{CallSetup, CallStackFlags};
use super::{Flow, Processor};
use crate::context::ScriptExecutionContext;

/// How many `__index` / `__newindex` hops one access may follow.
const MAX_META_HOPS: usize = 100;

impl Processor {
    // ── Loop ──────────────────────────────────────────────────────────────

    /// Runs from `entry` until the entry frame returns or the coroutine
    /// yields, and hands back the value that left the loop.
    ///
    /// Runtime errors unwind to the nearest frame with an error handler; when
    /// an entry frame is reached first they propagate to the caller.
    pub(super) fn processing_loop(&self, entry: usize) -> Result<Value, LuaError> {
        let mut ip = entry;
        let mut executed: u64 = 0;
        loop {
            match self.run(&mut ip, &mut executed) {
                Ok(v) => return Ok(v),
                Err(LuaError::Runtime(err)) => match self.unwind(err, ip)? {
                    Flow::Jump(next) => ip = next,
                    Flow::ReturnToNative | Flow::Yield => return self.pop(),
                    Flow::Next => return Err(LuaError::internal("error handler fell through")),
                },
                Err(other) => return Err(other),
            }
        }
    }

    fn run(&self, ip: &mut usize, executed: &mut u64) -> Result<Value, LuaError> {
        let budget = {
            let s = self.lock();
            let can_auto_yield =
                s.auto_yield_counter > 0 && s.can_yield && s.state != CoroutineState::Main;
            can_auto_yield.then_some(s.auto_yield_counter)
        };

        loop {
            let instr = self.shared().instruction(*ip)?;

            if self.shared().debugger_enabled() {
                self.listen_debugger(*ip, &instr, false)?;
            }

            if let Some(budget) = budget {
                *executed += 1;
                if *executed > budget {
                    self.lock().saved_ip = Some(*ip);
                    trace!("instruction budget of {budget} spent at {ip}");
                    return Ok(Value::YieldRequest(Arc::new(YieldRequest {
                        values: Vec::new(),
                        forced: true,
                    })));
                }
            }

            match self.execute(&instr, *ip)? {
                Flow::Next => *ip += 1,
                Flow::Jump(target) => *ip = target,
                Flow::ReturnToNative | Flow::Yield => return self.pop(),
            }
        }
    }

    fn execute(&self, instr: &Instruction, ip: usize) -> Result<Flow, LuaError> {
        match instr.op {
            OpCode::Nop | OpCode::Debug | OpCode::Meta => Ok(Flow::Next),
            OpCode::Invalid => Err(LuaError::internal(format!(
                "Invalid opcode: {}",
                instr.name.as_deref().unwrap_or("")
            ))),

            // ── Stack ─────────────────────────────────────────────────────
            OpCode::Pop => {
                self.lock().remove_last(instr.num())?;
                Ok(Flow::Next)
            }
            OpCode::Copy => {
                let mut s = self.lock();
                let v = s.peek(instr.num())?.clone();
                s.push(v);
                Ok(Flow::Next)
            }
            OpCode::Swap => {
                let mut s = self.lock();
                let len = s.value_stack.len();
                let (a, b) = (instr.num(), instr.num2());
                if a >= len || b >= len {
                    return Err(LuaError::internal("SWAP past the bottom of the stack"));
                }
                s.value_stack.swap(len - 1 - a, len - 1 - b);
                Ok(Flow::Next)
            }
            OpCode::Literal => {
                let v = instr
                    .value
                    .clone()
                    .ok_or_else(|| LuaError::internal("LITERAL without a value"))?;
                self.push(v);
                Ok(Flow::Next)
            }
            OpCode::MkTuple => {
                let mut s = self.lock();
                let values = s.pop_n(instr.num())?;
                s.push(Value::tuple_of(Value::tuple(values).into_values()));
                Ok(Flow::Next)
            }
            OpCode::ExpTuple => {
                let mut s = self.lock();
                let v = s.peek(instr.num())?.clone();
                match v {
                    Value::Tuple(items) => s.value_stack.extend(items.iter().cloned()),
                    other => s.push(other),
                }
                Ok(Flow::Next)
            }
            OpCode::Scalar => self.map_top(|v| Ok(v.to_scalar())),
            OpCode::ToBool => self.map_top(|v| Ok(Value::Boolean(v.to_scalar().is_truthy()))),
            OpCode::Not => self.map_top(|v| Ok(Value::Boolean(!v.to_scalar().is_truthy()))),
            OpCode::CNot => {
                let mut s = self.lock();
                let v = s.pop()?.to_scalar();
                let flag = s.pop()?.to_scalar();
                let Value::Boolean(flag) = flag else {
                    return Err(LuaError::internal("CNOT had non-bool arg"));
                };
                let truthy = v.is_truthy();
                s.push(Value::Boolean(if flag { !truthy } else { truthy }));
                Ok(Flow::Next)
            }
            OpCode::ToNum => {
                let stage = instr.num_val;
                self.map_top(|v| {
                    v.cast_to_number()
                        .map(Value::Number)
                        .ok_or_else(|| LuaError::convert_to_number_failed(stage))
                })
            }
            OpCode::Incr => {
                let mut s = self.lock();
                let step = s.peek(instr.num())?.cast_to_number();
                let top = s.peek_mut(0)?;
                match (top.cast_to_number(), step) {
                    (Some(a), Some(b)) => *top = Value::Number(a + b),
                    _ => return Err(LuaError::internal("INCR on non-numbers")),
                }
                Ok(Flow::Next)
            }

            // ── Values ────────────────────────────────────────────────────
            OpCode::Closure => {
                let closure = self.exec_closure(instr)?;
                self.push(closure);
                Ok(Flow::Next)
            }
            OpCode::NewTable => {
                self.push(Value::new_table());
                Ok(Flow::Next)
            }
            OpCode::TblInitN => {
                let mut s = self.lock();
                let v = s.pop()?.to_scalar();
                let k = s.pop()?.to_scalar();
                let Value::Table(t) = s.peek(0)? else {
                    return Err(LuaError::internal("Unexpected type in table ctor"));
                };
                table::write(t).set(k, v)?;
                Ok(Flow::Next)
            }
            OpCode::TblInitI => {
                let mut s = self.lock();
                let v = s.pop()?;
                let Value::Table(t) = s.peek(0)? else {
                    return Err(LuaError::internal("Unexpected type in table ctor"));
                };
                table::write(t).init_next_array_keys(v, instr.num_val != 0);
                Ok(Flow::Next)
            }

            // ── Variables ─────────────────────────────────────────────────
            OpCode::Local => self.exec_local(instr).map(|_| Flow::Next),
            OpCode::Upvalue => self.exec_upvalue(instr).map(|_| Flow::Next),
            OpCode::StoreLcl => self.exec_store_local(instr).map(|_| Flow::Next),
            OpCode::StoreUpv => self.exec_store_upvalue(instr).map(|_| Flow::Next),
            OpCode::Index | OpCode::IndexN | OpCode::IndexL => self.exec_index(instr, ip),
            OpCode::IndexSet | OpCode::IndexSetN | OpCode::IndexSetL => {
                self.exec_index_set(instr, ip)
            }

            // ── Frames and scopes ─────────────────────────────────────────
            OpCode::BeginFn => self.exec_begin_fn(instr).map(|_| Flow::Next),
            OpCode::Args => self.exec_args(instr).map(|_| Flow::Next),
            OpCode::Enter => self.exec_enter(instr).map(|_| Flow::Next),
            OpCode::Leave | OpCode::Exit => self.exec_leave(instr).map(|_| Flow::Next),
            OpCode::Clean => self.exec_clean(instr).map(|_| Flow::Next),
            OpCode::Call | OpCode::ThisCall => self.exec_call_instruction(instr, ip),
            OpCode::Ret => self.exec_ret(instr, ip),

            // ── Jumps ─────────────────────────────────────────────────────
            OpCode::Jump => Ok(Flow::Jump(instr.num())),
            OpCode::Jf => {
                let v = self.pop()?.to_scalar();
                Ok(if v.is_truthy() { Flow::Next } else { Flow::Jump(instr.num()) })
            }
            OpCode::JNil => {
                let v = self.pop()?.to_scalar();
                Ok(if v.is_nil_or_void() { Flow::Jump(instr.num()) } else { Flow::Next })
            }
            OpCode::JtOrPop | OpCode::JfOrPop => {
                let mut s = self.lock();
                let truthy = s.peek(0)?.to_scalar().is_truthy();
                if truthy == (instr.op == OpCode::JtOrPop) {
                    Ok(Flow::Jump(instr.num()))
                } else {
                    s.pop()?;
                    Ok(Flow::Next)
                }
            }
            OpCode::JFor => {
                let s = self.lock();
                let number = |depth| match s.peek(depth) {
                    Ok(Value::Number(n)) => Ok(*n),
                    _ => Err(LuaError::internal("JFOR on non-numbers")),
                };
                let (val, step, stop) = (number(0)?, number(1)?, number(2)?);
                let keep_going = if step > 0.0 { val <= stop } else { val >= stop };
                Ok(if keep_going { Flow::Next } else { Flow::Jump(instr.num()) })
            }

            // ── Iteration ─────────────────────────────────────────────────
            OpCode::IterPrep => self.exec_iter_prep().map(|_| Flow::Next),
            OpCode::IterUpd => {
                let mut s = self.lock();
                let var = s.peek(0)?.to_scalar();
                let current = s.peek(1)?.clone();
                let mut items = current.into_values();
                items.resize(3, Value::Nil);
                items[2] = var;
                *s.peek_mut(1)? = Value::tuple_of(items);
                Ok(Flow::Next)
            }

            // ── Operators ─────────────────────────────────────────────────
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Power
            | OpCode::FloorDiv => self.exec_arith(instr.op, ip),
            OpCode::Neg => self.exec_neg(ip),
            OpCode::Len => self.exec_len(ip),
            OpCode::Concat => self.exec_concat(ip),
            OpCode::Eq => self.exec_eq(ip),
            OpCode::Less => self.exec_less(ip),
            OpCode::LessEq => self.exec_less_eq(ip),
            OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::ShiftLeft
            | OpCode::ShiftRight => self.exec_bitwise(instr.op, ip),
            OpCode::BitNot => self.exec_bit_not(ip),
        }
    }

    fn map_top(&self, f: impl FnOnce(&Value) -> Result<Value, LuaError>) -> Result<Flow, LuaError> {
        let mut s = self.lock();
        let top = s.peek_mut(0)?;
        *top = f(top)?;
        Ok(Flow::Next)
    }

    fn pop_operands(&self) -> Result<(Value, Value), LuaError> {
        let mut s = self.lock();
        let r = s.pop()?.to_scalar();
        let l = s.pop()?.to_scalar();
        Ok((l, r))
    }

    // ── Metamethod dispatch ───────────────────────────────────────────────

    /// Calls the `event` handler of `l` (else of `r`) with `(l, r)`, after
    /// pushing `extra` below it. `None` when neither operand has one.
    fn binary_metamethod(
        &self,
        l: &Value,
        r: &Value,
        event: &str,
        extra: Option<Value>,
        ip: usize,
    ) -> Result<Option<Flow>, LuaError> {
        let Some(handler) = l.metamethod(event).or_else(|| r.metamethod(event)) else {
            return Ok(None);
        };
        {
            let mut s = self.lock();
            if let Some(extra) = extra {
                s.push(extra);
            }
            s.push(handler);
            s.push(l.clone());
            s.push(r.clone());
        }
        self.exec_call(2, CallSetup::from_instruction(ip)).map(Some)
    }

    fn unary_metamethod(&self, v: &Value, event: &str, ip: usize) -> Result<Option<Flow>, LuaError> {
        let Some(handler) = v.metamethod(event) else {
            return Ok(None);
        };
        {
            let mut s = self.lock();
            s.push(handler);
            s.push(v.clone());
        }
        self.exec_call(1, CallSetup::from_instruction(ip)).map(Some)
    }

    // ── Arithmetic ────────────────────────────────────────────────────────

    fn exec_arith(&self, op: OpCode, ip: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        if let (Some(a), Some(b)) = (l.cast_to_number(), r.cast_to_number()) {
            let n = match op {
                OpCode::Add => a + b,
                OpCode::Sub => a - b,
                OpCode::Mul => a * b,
                OpCode::Div => a / b,
                OpCode::Mod => modulo(a, b),
                OpCode::Power => a.powf(b),
                _ => (a / b).floor(),
            };
            self.push(Value::Number(n));
            return Ok(Flow::Next);
        }
        let event = match op {
            OpCode::Add => "__add",
            OpCode::Sub => "__sub",
            OpCode::Mul => "__mul",
            OpCode::Div => "__div",
            OpCode::Mod => "__mod",
            OpCode::Power => "__pow",
            _ => "__idiv",
        };
        self.binary_metamethod(&l, &r, event, None, ip)?
            .ok_or_else(|| LuaError::arithmetic_on_non_number(&l, Some(&r)))
    }

    fn exec_neg(&self, ip: usize) -> Result<Flow, LuaError> {
        let v = self.pop()?.to_scalar();
        if let Some(n) = v.cast_to_number() {
            self.push(Value::Number(-n));
            return Ok(Flow::Next);
        }
        self.unary_metamethod(&v, "__unm", ip)?
            .ok_or_else(|| LuaError::arithmetic_on_non_number(&v, None))
    }

    fn exec_len(&self, ip: usize) -> Result<Flow, LuaError> {
        let v = self.pop()?.to_scalar();
        if let Value::String(s) = &v {
            self.push(Value::Number(s.len() as f64));
            return Ok(Flow::Next);
        }
        if let Some(flow) = self.unary_metamethod(&v, "__len", ip)? {
            return Ok(flow);
        }
        match &v {
            Value::Table(t) => {
                let len = table::read(t).length();
                self.push(Value::Number(len as f64));
                Ok(Flow::Next)
            }
            _ => Err(LuaError::len_on_invalid_type(&v)),
        }
    }

    fn exec_concat(&self, ip: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        if let (Some(a), Some(b)) = (l.cast_to_string(), r.cast_to_string()) {
            self.push(Value::string(a + &b));
            return Ok(Flow::Next);
        }
        self.binary_metamethod(&l, &r, "__concat", None, ip)?
            .ok_or_else(|| LuaError::concat_on_non_string(&l, &r))
    }

    // ── Bitwise ───────────────────────────────────────────────────────────

    fn exec_bitwise(&self, op: OpCode, ip: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        if let (Some(a), Some(b)) = (l.as_integer(), r.as_integer()) {
            let n = match op {
                OpCode::BitAnd => a & b,
                OpCode::BitOr => a | b,
                OpCode::BitXor => a ^ b,
                OpCode::ShiftLeft => shift_left(a, b),
                _ => shift_left(a, b.wrapping_neg()),
            };
            self.push(Value::Number(n as f64));
            return Ok(Flow::Next);
        }
        let event = match op {
            OpCode::BitAnd => "__band",
            OpCode::BitOr => "__bor",
            OpCode::BitXor => "__bxor",
            OpCode::ShiftLeft => "__shl",
            _ => "__shr",
        };
        if let Some(flow) = self.binary_metamethod(&l, &r, event, None, ip)? {
            return Ok(flow);
        }
        let offending = if l.as_integer().is_some() { &r } else { &l };
        Err(LuaError::bitwise_on_non_integer(offending))
    }

    fn exec_bit_not(&self, ip: usize) -> Result<Flow, LuaError> {
        let v = self.pop()?.to_scalar();
        if let Some(n) = v.as_integer() {
            self.push(Value::Number(!n as f64));
            return Ok(Flow::Next);
        }
        self.unary_metamethod(&v, "__bnot", ip)?
            .ok_or_else(|| LuaError::bitwise_on_non_integer(&v))
    }

    // ── Comparison ────────────────────────────────────────────────────────

    fn exec_eq(&self, ip: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        if l.raw_equals(&r) {
            self.push(Value::Boolean(true));
            return Ok(Flow::Next);
        }
        if matches!(l, Value::UserData(_)) || matches!(r, Value::UserData(_)) {
            if let Some(flow) = self.binary_metamethod(&l, &r, "__eq", None, ip)? {
                return Ok(flow);
            }
        }
        if l.type_name() != r.type_name() {
            self.push(Value::Boolean(false));
            return Ok(Flow::Next);
        }
        if let (Value::Table(_), Some(lm), Some(rm)) = (&l, l.metatable(), r.metatable()) {
            if Arc::ptr_eq(&lm, &rm) {
                if let Some(flow) = self.binary_metamethod(&l, &r, "__eq", None, ip)? {
                    return Ok(flow);
                }
            }
        }
        self.push(Value::Boolean(false));
        Ok(Flow::Next)
    }

    fn exec_less(&self, ip: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        if let Some(ord) = primitive_order(&l, &r) {
            self.push(Value::Boolean(ord == Some(Ordering::Less)));
            return Ok(Flow::Next);
        }
        self.binary_metamethod(&l, &r, "__lt", None, ip)?
            .ok_or_else(|| LuaError::compare_invalid_type(&l, &r))
    }

    /// Leaves a flag under the result for the `CNot` that follows: `true`
    /// when the result came from `__lt(r, l)` and must be inverted.
    fn exec_less_eq(&self, ip: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        if let Some(ord) = primitive_order(&l, &r) {
            let le = matches!(ord, Some(Ordering::Less | Ordering::Equal));
            let mut s = self.lock();
            s.push(Value::Boolean(false));
            s.push(Value::Boolean(le));
            return Ok(Flow::Next);
        }
        if let Some(flow) = self.binary_metamethod(&l, &r, "__le", Some(Value::Boolean(false)), ip)? {
            return Ok(flow);
        }
        self.binary_metamethod(&r, &l, "__lt", Some(Value::Boolean(true)), ip)?
            .ok_or_else(|| LuaError::compare_invalid_type(&l, &r))
    }

    // ── Indexing ──────────────────────────────────────────────────────────

    fn exec_index(&self, instr: &Instruction, ip: usize) -> Result<Flow, LuaError> {
        let multi = instr.op == OpCode::IndexL;
        let (mut obj, key) = {
            let mut s = self.lock();
            let key = match &instr.value {
                Some(v) => v.clone(),
                None => s.pop()?,
            }
            .to_scalar();
            (s.pop()?.to_scalar(), key)
        };

        for _ in 0..MAX_META_HOPS {
            let handler = match &obj {
                Value::Table(t) => {
                    if !multi {
                        let v = table::read(t).get(&key);
                        if !v.is_nil() {
                            self.push(v);
                            return Ok(Flow::Next);
                        }
                    }
                    match obj.metamethod("__index") {
                        Some(h) => h,
                        None if multi => {
                            return Err(LuaError::runtime(
                                "cannot multi-index a table. userdata expected",
                            ))
                        }
                        None => {
                            self.push(Value::Nil);
                            return Ok(Flow::Next);
                        }
                    }
                }
                other => other
                    .metamethod("__index")
                    .ok_or_else(|| LuaError::index_type(other, &key))?,
            };

            if handler.is_callable() {
                if multi {
                    return Err(LuaError::runtime(
                        "cannot multi-index through metamethods. userdata expected",
                    ));
                }
                {
                    let mut s = self.lock();
                    s.push(handler);
                    s.push(obj);
                    s.push(key);
                }
                return self.exec_call(2, CallSetup::from_instruction(ip));
            }
            obj = handler;
        }
        Err(LuaError::loop_in_index())
    }

    fn exec_index_set(&self, instr: &Instruction, ip: usize) -> Result<Flow, LuaError> {
        let multi = instr.op == OpCode::IndexSetL;
        let (mut obj, key) = {
            let mut s = self.lock();
            let key = match &instr.value {
                Some(v) => v.clone(),
                None => s.pop()?,
            }
            .to_scalar();
            (s.pop()?.to_scalar(), key)
        };
        let value = self.store_value(instr)?;

        for _ in 0..MAX_META_HOPS {
            let handler = match &obj {
                Value::Table(t) => {
                    if !multi && !table::read(t).get(&key).is_nil() {
                        table::write(t).set(key, value)?;
                        return Ok(Flow::Next);
                    }
                    match obj.metamethod("__newindex") {
                        Some(h) => h,
                        None if multi => {
                            return Err(LuaError::runtime(
                                "cannot multi-index a table. userdata expected",
                            ))
                        }
                        None => {
                            table::write(t).set(key, value)?;
                            return Ok(Flow::Next);
                        }
                    }
                }
                other => other
                    .metamethod("__newindex")
                    .ok_or_else(|| LuaError::index_type(other, &key))?,
            };

            if handler.is_callable() {
                if multi {
                    return Err(LuaError::runtime(
                        "cannot multi-index through metamethods. userdata expected",
                    ));
                }
                {
                    let mut s = self.lock();
                    // The handler's result takes the stored value's slot.
                    s.pop()?;
                    s.push(handler);
                    s.push(obj);
                    s.push(key);
                    s.push(value);
                }
                return self.exec_call(3, CallSetup::from_instruction(ip));
            }
            obj = handler;
        }
        Err(LuaError::loop_in_new_index())
    }

    // ── Generic for ───────────────────────────────────────────────────────

    /// Normalizes the `in` list of a generic `for` into `(f, s, var)`.
    ///
    /// A non-function with an `__iterator` metamethod supplies its own
    /// triple; a plain table iterates with `next`.
    fn exec_iter_prep(&self) -> Result<(), LuaError> {
        let v = self.pop()?;
        let triple = |v: Value| {
            let mut items = match v {
                Value::Tuple(_) => v.into_values(),
                other => vec![other],
            };
            items.resize(3, Value::Nil);
            items
        };
        let mut items = triple(v);

        if !items[0].is_callable() {
            if let Some(meta) = items[0].metamethod("__iterator") {
                let produced = match meta {
                    Value::Tuple(_) => meta,
                    meta => self.call(&meta, items.clone())?,
                };
                items = triple(produced);
            } else if matches!(items[0], Value::Table(_)) && items[0].metamethod("__call").is_none() {
                let t = items[0].clone();
                items = vec![
                    Value::NativeFunction(crate::stdlib::next_function()),
                    t,
                    Value::Nil,
                ];
            }
        }
        self.push(Value::tuple_of(items));
        Ok(())
    }

    // ── Unwinding ─────────────────────────────────────────────────────────

    /// Unwinds after `err` was raised at `ip`, stopping at the first frame
    /// with an error handler. Reaching an entry frame first returns the
    /// error to whoever entered the loop.
    fn unwind(&self, mut err: ScriptRuntimeError, ip: usize) -> Result<Flow, LuaError> {
        err.decorate(self.shared().source_ref_at(ip).as_ref());
        trace!("unwinding: {}", err.decorated());

        if let Some(debugger) = self.shared().debugger() {
            if debugger.signal_runtime_exception(&err) {
                let instr = self.shared().instruction(ip)?;
                self.listen_debugger(ip, &instr, true)?;
            }
        }

        let before_unwind: Vec<Value> = self
            .lock()
            .exec_stack
            .iter()
            .rev()
            .filter_map(|f| f.handlers.error_handler_before_unwind.clone())
            .collect();
        for handler in before_unwind {
            err = self.decorate_before_unwind(&handler, err)?;
        }

        loop {
            if self.lock().exec_stack.is_empty() {
                return Err(LuaError::Runtime(err));
            }

            if let Err(e) = self.close_all_pending_blocks(&err.to_value()) {
                match e {
                    LuaError::Runtime(mut raised) => {
                        raised.decorate(None);
                        warn!(
                            "finalizer failed while unwinding '{}': {}",
                            err.decorated(),
                            raised.decorated()
                        );
                        err = raised;
                        continue;
                    }
                    other => return Err(other),
                }
            }

            let frame = {
                let mut s = self.lock();
                let frame = s.pop_to_base_pointer()?;
                if frame.handlers.error_handler.is_some() && !frame.is_native() {
                    s.pop_call_arguments()?;
                }
                frame
            };

            if let Some(handler) = &frame.handlers.error_handler {
                trace!("error caught by '{}'", handler.name());
                let mut ctx = ScriptExecutionContext::new(self.clone(), frame.calling_source_ref.clone());
                let result = handler.invoke(&mut ctx, vec![err.to_value()], false)?;
                self.push(result);
                return self.check_tail_requests(frame.return_address, frame.flags.entry_bits());
            }
            if frame.flags.contains(CallStackFlags::ENTRY_POINT) {
                return Err(LuaError::Runtime(err));
            }
        }
    }

    /// Lets a message handler rewrite the error while the stack that
    /// raised it is still intact.
    /// Only runtime errors raised by the handler are folded into the
    /// message; anything else aborts the unwind.
    fn decorate_before_unwind(
        &self,
        handler: &Value,
        mut err: ScriptRuntimeError,
    ) -> Result<ScriptRuntimeError, LuaError> {
        let message = Value::string(err.decorated());
        let outcome = if handler.is_callable() {
            self.call(handler, vec![message])
        } else {
            Err(LuaError::runtime("error handler not set to a function"))
        };
        match outcome {
            Ok(v) => {
                let v = v.to_scalar();
                err.decorated_message = Some(v.to_print_string());
                err.value = Some(v);
            }
            Err(LuaError::Runtime(inner)) => {
                let combined = format!("{}\n{}", inner.message, err.decorated());
                err.value = None;
                err.decorated_message = Some(combined);
            }
            Err(other) => return Err(other),
        }
        Ok(err)
    }
}

/// Ordering of two numbers or two strings; `None` for any other pair.
fn primitive_order(l: &Value, r: &Value) -> Option<Option<Ordering>> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => Some(a.partial_cmp(b)),
        (Value::String(a), Value::String(b)) => Some(Some(a.as_bytes().cmp(b.as_bytes()))),
        _ => None,
    }
}

/// Remainder with the sign of the divisor.
fn modulo(a: f64, b: f64) -> f64 {
    let m = a - (a / b).round_ties_even() * b;
    if m < 0.0 {
        m + b
    } else {
        m
    }
}

/// Logical shift; negative counts shift right, counts past 63 clear.
fn shift_left(a: i64, count: i64) -> i64 {
    if count <= -64 || count >= 64 {
        0
    } else if count >= 0 {
        ((a as u64) << count) as i64
    } else {
        ((a as u64) >> (-count)) as i64
    }
}
