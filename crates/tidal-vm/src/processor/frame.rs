//! Call-stack entries.

use bitflags::bitflags;
use std::collections::HashSet;
use std::sync::Arc;
use tidal_core::{ClosureContext, NativeFunction, SourceRef, SymbolRef, TailCallRequest, Value, ValueCell};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct CallStackFlags: u8 {
        /// Popping this frame leaves the processing loop.
        const ENTRY_POINT = 0x01;
        const RESUME_ENTRY_POINT = 0x02 | Self::ENTRY_POINT.bits();
        const CALL_ENTRY_POINT = 0x04 | Self::ENTRY_POINT.bits();
        const TAIL_CALL = 0x08;
        const METHOD_CALL = 0x10;
    }
}

impl CallStackFlags {
    /// The entry-point bits, which travel with a frame that gets replaced.
    pub(crate) fn entry_bits(self) -> CallStackFlags {
        self & (CallStackFlags::RESUME_ENTRY_POINT | CallStackFlags::CALL_ENTRY_POINT)
    }
}

/// Hooks a call can carry, taken from a [`TailCallRequest`].
#[derive(Debug, Clone, Default)]
pub(crate) struct CallHandlers {
    pub continuation: Option<NativeFunction>,
    pub error_handler: Option<NativeFunction>,
    pub error_handler_before_unwind: Option<Value>,
}

impl CallHandlers {
    pub(crate) fn from_request(request: &TailCallRequest) -> Self {
        Self {
            continuation: request.continuation.clone(),
            error_handler: request.error_handler.clone(),
            error_handler_before_unwind: request.error_handler_before_unwind.clone(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.continuation.is_none()
            && self.error_handler.is_none()
            && self.error_handler_before_unwind.is_none()
    }
}

/// How a call is being made.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallSetup {
    /// Where the caller continues; `None` hands the result back to native code.
    pub return_address: Option<usize>,
    pub entry_flags: CallStackFlags,
    pub handlers: CallHandlers,
    pub method_call: bool,
    pub debug_name: Option<Arc<str>>,
    /// The calling instruction, for locations in traces.
    pub calling_ip: Option<usize>,
}

impl CallSetup {
    pub(crate) fn entry(flags: CallStackFlags) -> Self {
        Self {
            entry_flags: flags,
            ..Self::default()
        }
    }

    /// A call made by the instruction at `ip`, continuing at `ip + 1`.
    pub(crate) fn from_instruction(ip: usize) -> Self {
        Self {
            return_address: Some(ip + 1),
            calling_ip: Some(ip),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CallStackItem {
    /// Address of the callee's `Meta`; unused for native frames.
    pub debug_entry_point: usize,
    pub debug_symbols: Arc<[SymbolRef]>,
    /// Value-stack height at frame start. Script frames sit just above the
    /// argument count; native frames at the callee slot.
    pub base_pointer: usize,
    pub return_address: Option<usize>,
    pub local_scope: Vec<Option<ValueCell>>,
    pub closure_scope: Arc<ClosureContext>,
    pub native: Option<NativeFunction>,
    pub handlers: CallHandlers,
    pub flags: CallStackFlags,
    pub calling_source_ref: Option<SourceRef>,
    /// Finalizer lists of the open blocks, innermost last.
    pub blocks_to_close: Vec<Vec<SymbolRef>>,
    pub to_be_closed_indices: HashSet<usize>,
}

impl CallStackItem {
    pub(crate) fn new(base_pointer: usize, setup: &CallSetup) -> Self {
        let mut flags = setup.entry_flags;
        if setup.method_call {
            flags |= CallStackFlags::METHOD_CALL;
        }
        Self {
            debug_entry_point: 0,
            debug_symbols: Arc::from(Vec::new()),
            base_pointer,
            return_address: setup.return_address,
            local_scope: Vec::new(),
            closure_scope: Arc::new(ClosureContext::default()),
            native: None,
            handlers: setup.handlers.clone(),
            flags,
            calling_source_ref: None,
            blocks_to_close: Vec::new(),
            to_be_closed_indices: HashSet::new(),
        }
    }

    pub(crate) fn is_native(&self) -> bool {
        self.native.is_some()
    }

    pub(crate) fn has_pending_closers(&self) -> bool {
        self.blocks_to_close.iter().any(|b| !b.is_empty())
    }

    /// Empties the local slots `from..=to` and forgets their finalizers.
    pub(crate) fn clear_block_data(&mut self, from: i32, to: i32) {
        if from < 0 || to < from {
            return;
        }
        for slot in from as usize..=to as usize {
            if let Some(s) = self.local_scope.get_mut(slot) {
                *s = None;
            }
            self.to_be_closed_indices.remove(&slot);
        }
    }

    pub(crate) fn local_value(&self, index: usize) -> Value {
        self.local_scope
            .get(index)
            .and_then(|c| c.as_ref())
            .map(ValueCell::get)
            .unwrap_or(Value::Nil)
    }
}
