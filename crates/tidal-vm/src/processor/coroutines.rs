//! Resuming and closing coroutine processors.

use log::debug;
use tidal_core::{CoroutineState, LuaError, Value};

use super::frame::{CallSetup, CallStackFlags};
use super::Processor;

impl Processor {
    /// Runs the coroutine until it yields, returns or fails.
    ///
    /// A normal yield comes back as a tuple of the yielded values; a yield
    /// forced by the instruction budget comes back as the request itself.
    pub(crate) fn resume(&self, args: Vec<Value>) -> Result<Value, LuaError> {
        let _guard = self.enter()?;

        let state = self.state();
        let outcome = match state {
            CoroutineState::NotStarted => {
                self.set_state(CoroutineState::Running);
                let argc = args.len();
                self.lock().value_stack.extend(args);
                let setup = CallSetup::entry(CallStackFlags::RESUME_ENTRY_POINT);
                self.exec_call(argc, setup).and_then(|flow| self.drive(flow))
            }
            CoroutineState::Suspended => {
                self.set_state(CoroutineState::Running);
                self.push(Value::tuple_of(args));
                self.continue_saved()
            }
            CoroutineState::ForceSuspended => {
                if args.is_empty() {
                    self.set_state(CoroutineState::Running);
                    self.continue_saved()
                } else {
                    Err(LuaError::cannot_resume_force_suspended_with_args())
                }
            }
            other => return Err(LuaError::cannot_resume_not_suspended(other)),
        };

        match outcome {
            Ok(Value::YieldRequest(request)) if request.forced => {
                self.set_state(CoroutineState::ForceSuspended);
                Ok(Value::YieldRequest(request))
            }
            Ok(Value::YieldRequest(request)) => {
                self.set_state(CoroutineState::Suspended);
                self.lock().last_close_error = Value::Nil;
                Ok(Value::tuple_of(request.values.clone()))
            }
            Ok(v) => {
                self.set_state(CoroutineState::Dead);
                self.lock().last_close_error = Value::Nil;
                Ok(v)
            }
            Err(e) => {
                self.set_state(CoroutineState::Dead);
                if let LuaError::Runtime(err) = &e {
                    self.lock().last_close_error = err.to_value();
                }
                debug!("coroutine {:#x} died: {e}", self.address());
                Err(e)
            }
        }
    }

    /// Picks up where the last yield left off. Without a saved address the
    /// yield ended the entry frame, so the resume values are its result.
    fn continue_saved(&self) -> Result<Value, LuaError> {
        let saved = self.lock().saved_ip.take();
        match saved {
            Some(ip) => self.processing_loop(ip),
            None => self.pop(),
        }
    }

    /// Closes the coroutine: pending to-be-closed variables of every frame
    /// are finalized and the coroutine dies.
    ///
    /// Returns `true`, or `(false, error)` when a finalizer (or, for an
    /// already dead coroutine, its body) failed.
    pub(crate) fn close(&self) -> Result<Value, LuaError> {
        match self.state() {
            state @ (CoroutineState::Main | CoroutineState::Running) => {
                Err(LuaError::cannot_close_coroutine(state))
            }
            CoroutineState::Dead => {
                let last = self.lock().last_close_error.clone();
                Ok(if last.is_nil() {
                    Value::Boolean(true)
                } else {
                    Value::tuple_of(vec![Value::Boolean(false), last])
                })
            }
            CoroutineState::NotStarted => {
                self.set_state(CoroutineState::Dead);
                Ok(Value::Boolean(true))
            }
            CoroutineState::Suspended | CoroutineState::ForceSuspended => {
                let _guard = self.enter()?;
                self.set_state(CoroutineState::Running);
                let closed = self.close_all_frames();
                {
                    let mut s = self.lock();
                    s.value_stack.clear();
                    s.exec_stack.clear();
                    s.saved_ip = None;
                }
                self.set_state(CoroutineState::Dead);
                match closed {
                    Ok(()) => {
                        self.lock().last_close_error = Value::Nil;
                        Ok(Value::Boolean(true))
                    }
                    Err(LuaError::Runtime(err)) => {
                        let v = err.to_value();
                        self.lock().last_close_error = v.clone();
                        Ok(Value::tuple_of(vec![Value::Boolean(false), v]))
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    fn close_all_frames(&self) -> Result<(), LuaError> {
        while !self.lock().exec_stack.is_empty() {
            self.close_all_pending_blocks(&Value::Nil)?;
            self.lock().pop_to_base_pointer()?;
        }
        Ok(())
    }
}
