//! The [`ExecutionContext`] native callbacks receive.

use std::sync::Arc;

use tidal_core::{
    CoroutineObject, CoroutineRef, CoroutineState, ExecutionContext, LuaError, SourceRef, TableRef,
    Value,
};

use crate::coroutine;
use crate::processor::Processor;

/// Ties a native call to the processor that made it.
pub struct ScriptExecutionContext {
    processor: Processor,
    calling_location: Option<SourceRef>,
}

impl ScriptExecutionContext {
    pub(crate) fn new(processor: Processor, calling_location: Option<SourceRef>) -> Self {
        Self {
            processor,
            calling_location,
        }
    }
}

impl std::fmt::Debug for ScriptExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptExecutionContext")
            .field("processor", &self.processor)
            .field("calling_location", &self.calling_location)
            .finish()
    }
}

impl ExecutionContext for ScriptExecutionContext {
    fn call(&mut self, function: &Value, args: Vec<Value>) -> Result<Value, LuaError> {
        self.processor.call(function, args)
    }

    fn globals(&self) -> TableRef {
        self.processor.shared().globals.clone()
    }

    fn is_yieldable(&self) -> bool {
        self.processor.state() != CoroutineState::Main && self.processor.can_yield()
    }

    fn running_coroutine(&self) -> Option<CoroutineRef> {
        let running = self
            .processor
            .shared()
            .active_processor()
            .unwrap_or_else(|| self.processor.main());
        let owner: Arc<dyn CoroutineObject> = running.owner()?;
        Some(CoroutineRef::new(owner))
    }

    fn is_main(&self) -> bool {
        self.processor.is_main()
    }

    fn create_coroutine(&mut self, function: Value) -> Result<Value, LuaError> {
        let co: Arc<dyn CoroutineObject> = coroutine::create(&self.processor.main(), function)?;
        Ok(Value::Coroutine(CoroutineRef::new(co)))
    }

    fn calling_location(&self) -> Option<SourceRef> {
        self.calling_location.clone()
    }

    fn location_at_level(&self, level: usize) -> Option<SourceRef> {
        self.processor
            .call_stack(self.calling_location.clone())
            .into_iter()
            .nth(level)
            .and_then(|item| item.location)
    }
}
