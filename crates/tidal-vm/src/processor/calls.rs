//! Calls, returns, tail calls and control requests.

use log::trace;
use tidal_core::{CoroutineState, Instruction, LuaError, OpCode, SourceRef, Value};

use super::frame::{CallHandlers, CallSetup, CallStackFlags, CallStackItem};
use super::{Flow, Processor};
use crate::context::ScriptExecutionContext;

/// Longest chain of `__call` metamethods followed for one call.
const MAX_CALL_CHAIN: usize = 100;

fn is_request(v: &Value) -> bool {
    matches!(v, Value::YieldRequest(_) | Value::TailCallRequest(_))
}

impl Processor {
    /// Calls the value sitting below `argc` arguments on the stack.
    pub(super) fn exec_call(&self, mut argc: usize, setup: CallSetup) -> Result<Flow, LuaError> {
        let mut setup = setup;
        let mut chain = 0;
        loop {
            let callee = self.lock().peek(argc)?.to_scalar();
            match callee {
                Value::NativeFunction(_) | Value::Closure(_) => break,
                other => {
                    let Some(handler) = other.metamethod("__call") else {
                        return Err(LuaError::attempt_to_call_non_func(
                            &other,
                            setup.debug_name.as_deref(),
                        ));
                    };
                    chain += 1;
                    if chain > MAX_CALL_CHAIN {
                        return Err(LuaError::runtime("'__call' chain too long; possible loop"));
                    }
                    let mut s = self.lock();
                    let slot = s.value_stack.len() - argc - 1;
                    s.value_stack.insert(slot, handler);
                    argc += 1;
                }
            }
        }

        if self.try_tail_call(argc, &mut setup)? {
            trace!("tail call with {argc} arguments");
        }

        let (callee, fn_slot) = {
            let s = self.lock();
            if s.exec_stack.len() >= self.shared().options().max_call_depth() {
                return Err(LuaError::stack_overflow());
            }
            let fn_slot = s.value_stack.len() - argc - 1;
            (s.value_stack[fn_slot].to_scalar(), fn_slot)
        };
        let calling_source_ref = setup
            .calling_ip
            .and_then(|ip| self.shared().source_ref_at(ip));

        match callee {
            Value::Closure(closure) => {
                let mut s = self.lock();
                s.push(Value::Number(argc as f64));
                let mut frame = CallStackItem::new(s.value_stack.len(), &setup);
                frame.debug_entry_point = closure.entry_point;
                frame.closure_scope = closure.context.clone();
                frame.calling_source_ref = calling_source_ref;
                s.exec_stack.push(frame);
                trace!("call script function at {} ({argc} args)", closure.entry_point);
                Ok(Flow::Jump(closure.entry_point))
            }
            Value::NativeFunction(native) => {
                let args = {
                    let mut s = self.lock();
                    let args = s.value_stack[fn_slot + 1..].to_vec();
                    let mut frame = CallStackItem::new(fn_slot, &setup);
                    frame.native = Some(native.clone());
                    frame.calling_source_ref = calling_source_ref.clone();
                    s.exec_stack.push(frame);
                    args
                };
                trace!("call native '{}' ({argc} args)", native.name());

                let mut ctx = ScriptExecutionContext::new(self.clone(), calling_source_ref.clone());
                // On error the native frame stays for the unwinder.
                let ret = native.invoke(&mut ctx, args, setup.method_call)?;
                let ret = self.apply_continuation(&setup.handlers, ret, calling_source_ref)?;

                {
                    let mut s = self.lock();
                    s.exec_stack.pop();
                    s.value_stack.truncate(fn_slot);
                    s.push(ret);
                }
                self.check_tail_requests(setup.return_address, setup.entry_flags)
            }
            _ => Err(LuaError::internal("callee changed while setting up a call")),
        }
    }

    /// Drops the current frame when a call in tail position would only grow
    /// an already deep stack. The callee and its arguments move down into
    /// the caller's slot and inherit its return address.
    fn try_tail_call(&self, argc: usize, setup: &mut CallSetup) -> Result<bool, LuaError> {
        let threshold = self.shared().options().tail_call_optimization_threshold();
        let Some(next) = setup.return_address else {
            return Ok(false);
        };
        {
            let s = self.lock();
            let deep = (s.exec_stack.len() > threshold && s.exec_stack.len() > 1)
                || (s.value_stack.len() > threshold && s.value_stack.len() > 1);
            if !deep || !setup.handlers.is_empty() {
                return Ok(false);
            }
            let Some(frame) = s.exec_stack.last() else {
                return Ok(false);
            };
            if frame.is_native() || !frame.handlers.is_empty() || frame.has_pending_closers() {
                return Ok(false);
            }
        }
        let returns_at_once = matches!(
            self.shared().instruction(next),
            Ok(Instruction { op: OpCode::Ret, num_val: 1, .. })
        );
        if !returns_at_once {
            return Ok(false);
        }

        let mut s = self.lock();
        let moved = s.pop_n(argc + 1)?;
        let frame = s.pop_to_base_pointer()?;
        s.pop_call_arguments()?;
        s.value_stack.extend(moved);
        setup.return_address = frame.return_address;
        setup.entry_flags = frame.flags.entry_bits() | CallStackFlags::TAIL_CALL;
        Ok(true)
    }

    /// `Ret`: runs the frame's finalizers, unwinds it and hands its result
    /// to the caller.
    pub(super) fn exec_ret(&self, instr: &Instruction, ip: usize) -> Result<Flow, LuaError> {
        self.close_all_pending_blocks(&Value::Nil)?;

        let frame = {
            let mut s = self.lock();
            let retval = match instr.num_val {
                0 => Value::empty_tuple(),
                1 => s.pop()?,
                _ => return Err(LuaError::internal("RET supports only 0 and 1 ret val scenarios")),
            };
            let frame = s.pop_to_base_pointer()?;
            s.pop_call_arguments()?;
            s.push(retval);
            frame
        };
        trace!("return from function at {}", frame.debug_entry_point);

        if frame.handlers.continuation.is_some() {
            let retval = self.pop()?;
            let retval =
                self.apply_continuation(&frame.handlers, retval, self.shared().source_ref_at(ip))?;
            self.push(retval);
        }
        self.check_tail_requests(frame.return_address, frame.flags.entry_bits())
    }

    /// Runs the continuation of a finished call on its result.
    fn apply_continuation(
        &self,
        handlers: &CallHandlers,
        value: Value,
        location: Option<SourceRef>,
    ) -> Result<Value, LuaError> {
        let Some(continuation) = &handlers.continuation else {
            return Ok(value);
        };
        if is_request(&value) {
            return Err(LuaError::runtime(format!(
                "a {} cannot replace a call continued by '{}'",
                value.type_name(),
                continuation.name()
            )));
        }
        let mut ctx = ScriptExecutionContext::new(self.clone(), location);
        continuation.invoke(&mut ctx, vec![value], false)
    }

    /// Resolves a control request left on top of the stack by a call.
    pub(super) fn check_tail_requests(
        &self,
        return_address: Option<usize>,
        entry_flags: CallStackFlags,
    ) -> Result<Flow, LuaError> {
        let top = self.lock().peek(0)?.clone();
        match top {
            Value::TailCallRequest(request) => {
                let argc = request.args.len();
                {
                    let mut s = self.lock();
                    s.pop()?;
                    s.push(request.function.clone());
                    s.value_stack.extend(request.args.iter().cloned());
                }
                trace!("resolving tail call request ({argc} args)");
                self.exec_call(
                    argc,
                    CallSetup {
                        return_address,
                        entry_flags,
                        handlers: CallHandlers::from_request(&request),
                        ..CallSetup::default()
                    },
                )
            }
            Value::YieldRequest(request) => {
                let mut s = self.lock();
                if s.state == CoroutineState::Main {
                    return Err(LuaError::cannot_yield_main());
                }
                if !s.can_yield {
                    return Err(LuaError::cannot_yield());
                }
                s.saved_ip = return_address;
                trace!("yield with {} values", request.values.len());
                Ok(Flow::Yield)
            }
            _ => Ok(Flow::resume_at(return_address)),
        }
    }

    /// `Call` / `ThisCall`.
    pub(super) fn exec_call_instruction(&self, instr: &Instruction, ip: usize) -> Result<Flow, LuaError> {
        let setup = CallSetup {
            method_call: instr.op == OpCode::ThisCall,
            debug_name: instr.name.clone(),
            ..CallSetup::from_instruction(ip)
        };
        self.exec_call(instr.num(), setup)
    }
}
