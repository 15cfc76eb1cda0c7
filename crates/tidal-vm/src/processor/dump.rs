//! Binary dump and load of script functions.

use std::sync::Arc;

use log::debug;
use tidal_compiler::{decode_function, encode_function};
use tidal_core::{Closure, ClosureContext, LuaError, UpvaluesType, Value, ValueCell, ENV_SYMBOL};

use super::Processor;

impl Processor {
    /// Serializes a closure whose only capture, if any, is `_ENV`.
    pub(crate) fn dump(&self, function: &Value) -> Result<Vec<u8>, LuaError> {
        let Value::Closure(closure) = function else {
            return Err(LuaError::InvalidArgument(format!(
                "cannot dump a {} value, a script function is required",
                function.type_name()
            )));
        };
        let has_upvalues = match closure.upvalues_type() {
            UpvaluesType::None => false,
            UpvaluesType::Environment => true,
            UpvaluesType::Closure => {
                return Err(LuaError::InvalidArgument(
                    "function has upvalues other than _ENV".into(),
                ))
            }
        };
        let code = self.shared().code();
        encode_function(&code, closure.entry_point, has_upvalues)
    }

    /// Appends a dumped function to the script's bytecode and returns it as
    /// a closure, bound to the globals when it was dumped with `_ENV`.
    pub(crate) fn undump(&self, data: &[u8], source_id: u32) -> Result<Value, LuaError> {
        let globals = Value::Table(self.shared().globals.clone());
        let decoded = {
            let mut code = self.shared().code_mut();
            decode_function(data, &mut code, source_id, &globals)?
        };
        debug!(
            "undumped {} instructions at {} as source {source_id}",
            decoded.instruction_count, decoded.entry_point
        );

        let context = if decoded.has_upvalues {
            ClosureContext::new(vec![Arc::from(ENV_SYMBOL)], vec![ValueCell::new(globals)])
        } else {
            ClosureContext::default()
        };
        Ok(Value::Closure(Arc::new(Closure::new(decoded.entry_point, context))))
    }
}
