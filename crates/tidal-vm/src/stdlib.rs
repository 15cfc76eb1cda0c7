//! The control library: protected calls, errors, coroutines and the basic
//! functions scripts expect to find in their globals.

use std::sync::Arc;

use log::info;
use tidal_core::{
    table, CallbackArguments, CoroutineState, ExecutionContext, LuaError, NativeFunction,
    ScriptRuntimeError, Table, TableRef, TailCallRequest, Value, YieldRequest,
};

pub fn register(globals: &TableRef) {
    let basics: [(&str, fn(&mut dyn ExecutionContext, CallbackArguments) -> Result<Value, LuaError>); 16] = [
        ("pcall", lua_pcall),
        ("xpcall", lua_xpcall),
        ("error", lua_error),
        ("assert", lua_assert),
        ("print", lua_print),
        ("type", lua_type),
        ("tostring", lua_tostring),
        ("tonumber", lua_tonumber),
        ("select", lua_select),
        ("setmetatable", lua_setmetatable),
        ("getmetatable", lua_getmetatable),
        ("rawget", lua_rawget),
        ("rawset", lua_rawset),
        ("rawequal", lua_rawequal),
        ("next", lua_next),
        ("ipairs", lua_ipairs),
    ];

    let mut coroutine = Table::new();
    let coroutine_fns: [(&str, fn(&mut dyn ExecutionContext, CallbackArguments) -> Result<Value, LuaError>); 8] = [
        ("create", co_create),
        ("wrap", co_wrap),
        ("resume", co_resume),
        ("yield", co_yield),
        ("running", co_running),
        ("status", co_status),
        ("close", co_close),
        ("isyieldable", co_isyieldable),
    ];
    for (name, f) in coroutine_fns {
        coroutine.set_str(name, NativeFunction::new(name, f).into());
    }

    let mut g = table::write(globals);
    for (name, f) in basics {
        g.set_str(name, NativeFunction::new(name, f).into());
    }
    g.set_str("coroutine", Value::from_table(coroutine));
    g.set_str("_G", Value::Table(globals.clone()));
}

/// The iterator a generic `for` falls back to for plain tables.
pub(crate) fn next_function() -> NativeFunction {
    NativeFunction::new("next", lua_next)
}

// ── Protected calls ───────────────────────────────────────────────────────

fn lua_pcall(ctx: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let f = args.get(0);
    protected_call(ctx, "pcall", f, args.skip(1), None)
}

fn lua_xpcall(ctx: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let f = args.get(0);
    let handler = args.get(1);
    if !handler.is_nil() && !handler.is_callable() {
        return Err(LuaError::bad_argument(2, "xpcall", "function or nil expected"));
    }
    let handler = (!handler.is_nil()).then_some(handler);
    protected_call(ctx, "xpcall", f, args.skip(2), handler)
}

fn protected_call(
    ctx: &mut dyn ExecutionContext,
    fname: &str,
    f: Value,
    args: Vec<Value>,
    handler: Option<Value>,
) -> Result<Value, LuaError> {
    match f {
        Value::NativeFunction(native) => {
            let outcome = native.invoke(ctx, args, false).and_then(|ret| match ret {
                Value::TailCallRequest(request) => {
                    if request.continuation.is_some() || request.error_handler.is_some() {
                        return Err(LuaError::cannot_call_directly(fname));
                    }
                    Ok(guarded(fname, request.function.clone(), request.args.clone(), handler.clone()))
                }
                Value::YieldRequest(_) => Err(LuaError::cannot_call_directly(fname)),
                ret => Ok(Value::tuple(vec![Value::Boolean(true), ret])),
            });
            match outcome {
                Err(LuaError::Runtime(mut err)) => {
                    err.decorate(ctx.calling_location().as_ref());
                    if let Some(handler) = &handler {
                        err = rewrite_error(ctx, handler, err)?;
                    }
                    Ok(Value::tuple_of(vec![Value::Boolean(false), err.to_value()]))
                }
                other => other,
            }
        }
        Value::Closure(_) => Ok(guarded(fname, f, args, handler)),
        _ => Ok(Value::tuple_of(vec![
            Value::Boolean(false),
            Value::string(format!("attempt to {fname} a non-function")),
        ])),
    }
}

/// A tail call whose result is prefixed with `true`, or replaced by
/// `(false, error)` when it raises.
fn guarded(fname: &str, function: Value, args: Vec<Value>, handler: Option<Value>) -> Value {
    let mut request = TailCallRequest::new(function, args);
    request.continuation = Some(NativeFunction::new(fname, |_, args| {
        Ok(with_status(true, args))
    }));
    request.error_handler = Some(NativeFunction::new(fname, |_, args| {
        Ok(with_status(false, args))
    }));
    request.error_handler_before_unwind = handler;
    Value::TailCallRequest(Arc::new(request))
}

fn with_status(status: bool, args: CallbackArguments) -> Value {
    let mut values = Vec::with_capacity(args.len() + 1);
    values.push(Value::Boolean(status));
    values.extend(args.into_vec());
    Value::tuple_of(values)
}

/// Runs an `xpcall` message handler on an error raised by a native callee.
/// Errors from the handler other than runtime errors are not recoverable.
fn rewrite_error(
    ctx: &mut dyn ExecutionContext,
    handler: &Value,
    mut err: ScriptRuntimeError,
) -> Result<ScriptRuntimeError, LuaError> {
    match ctx.call(handler, vec![Value::string(err.decorated())]) {
        Ok(v) => {
            let v = v.to_scalar();
            err.decorated_message = Some(v.to_print_string());
            err.value = Some(v);
        }
        Err(LuaError::Runtime(inner)) => {
            err.decorated_message = Some(format!("{}\n{}", inner.message, err.decorated()));
            err.value = None;
        }
        Err(other) => return Err(other),
    }
    Ok(err)
}

fn lua_error(ctx: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let value = args.get(0);
    let level = match args.get(1) {
        Value::Nil => 1,
        v => v
            .as_integer()
            .ok_or_else(|| LuaError::bad_argument(2, "error", "number expected"))?,
    };
    let mut err = ScriptRuntimeError::with_value(value.clone());
    if matches!(value, Value::String(_)) && level > 0 {
        err.decorate(ctx.location_at_level(level as usize).as_ref());
    } else {
        err.do_not_decorate = true;
    }
    Err(LuaError::Runtime(err))
}

fn lua_assert(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    if args.get(0).is_truthy() {
        return Ok(Value::tuple(args.into_vec()));
    }
    match args.get(1) {
        Value::Nil => Err(LuaError::runtime("assertion failed!")),
        message => Err(LuaError::Runtime(ScriptRuntimeError::with_value(message))),
    }
}

// ── Basic functions ───────────────────────────────────────────────────────

fn lua_print(ctx: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let mut parts = Vec::with_capacity(args.len());
    for v in args.into_vec() {
        parts.push(to_display(ctx, v.to_scalar())?);
    }
    info!("{}", parts.join("\t"));
    Ok(Value::empty_tuple())
}

fn lua_type(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let v = args.check_present(0, "type")?;
    Ok(Value::string(v.type_name()))
}

fn lua_tostring(ctx: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let v = args.check_present(0, "tostring")?;
    to_display(ctx, v).map(Value::from)
}

/// `tostring` semantics: `__tostring` wins, and must produce a string.
fn to_display(ctx: &mut dyn ExecutionContext, v: Value) -> Result<String, LuaError> {
    match v.metamethod("__tostring") {
        Some(mm) => match ctx.call(&mm, vec![v])?.to_scalar() {
            Value::String(s) => Ok(s.to_string()),
            _ => Err(LuaError::runtime("'__tostring' must return a string")),
        },
        None => Ok(v.to_print_string()),
    }
}

fn lua_tonumber(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let v = args.check_present(0, "tonumber")?;
    let base = args.get(1);
    if base.is_nil() {
        return Ok(v.cast_to_number().map_or(Value::Nil, Value::Number));
    }
    let base = match base.as_integer() {
        Some(b) if (2..=36).contains(&b) => b as u32,
        _ => return Err(LuaError::bad_argument(2, "tonumber", "base out of range")),
    };
    let Value::String(s) = v else {
        return Err(LuaError::bad_argument(1, "tonumber", "string expected"));
    };
    let text = s.trim().to_ascii_lowercase();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.as_str()),
    };
    Ok(match i64::from_str_radix(digits, base) {
        Ok(n) if !digits.is_empty() => {
            let n = if negative { -n } else { n };
            Value::Number(n as f64)
        }
        _ => Value::Nil,
    })
}

fn lua_select(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let selector = args.get(0);
    let rest = args.skip(1);
    if selector.as_str() == Some("#") {
        return Ok(Value::Number(rest.len() as f64));
    }
    let n = selector
        .as_integer()
        .ok_or_else(|| LuaError::bad_argument(1, "select", "number expected"))?;
    let start = match n {
        n if n > 0 => (n - 1) as usize,
        n if n < 0 && n.unsigned_abs() as usize <= rest.len() => rest.len() - n.unsigned_abs() as usize,
        _ => return Err(LuaError::bad_argument(1, "select", "index out of range")),
    };
    Ok(Value::tuple_of(rest.into_iter().skip(start).collect()))
}

fn lua_setmetatable(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let t = args.check_table(0, "setmetatable")?;
    let mt = match args.get(1) {
        Value::Nil => None,
        Value::Table(mt) => Some(mt),
        _ => return Err(LuaError::bad_argument(2, "setmetatable", "nil or table expected")),
    };
    let current = table::read(&t).metatable();
    if let Some(current) = current {
        if !table::read(&current).get_str("__metatable").is_nil() {
            return Err(LuaError::runtime("cannot change a protected metatable"));
        }
    }
    table::write(&t).set_metatable(mt);
    Ok(Value::Table(t))
}

fn lua_getmetatable(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let Some(mt) = args.get(0).metatable() else {
        return Ok(Value::Nil);
    };
    let protected = table::read(&mt).get_str("__metatable");
    Ok(if protected.is_nil() { Value::Table(mt) } else { protected })
}

fn lua_rawget(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let t = args.check_table(0, "rawget")?;
    let v = table::read(&t).get(&args.get(1));
    Ok(v)
}

fn lua_rawset(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let t = args.check_table(0, "rawset")?;
    table::write(&t).set(args.get(1), args.get(2))?;
    Ok(Value::Table(t))
}

fn lua_rawequal(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    Ok(Value::Boolean(args.get(0).raw_equals(&args.get(1))))
}

fn lua_next(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let t = args.check_table(0, "next")?;
    let entry = table::read(&t).next(&args.get(1))?;
    Ok(match entry {
        Some((k, v)) => Value::tuple_of(vec![k, v]),
        None => Value::Nil,
    })
}

fn lua_ipairs(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let t = args.check_table(0, "ipairs")?;
    let step = NativeFunction::new("ipairs_iter", |_, args| {
        let t = args.check_table(0, "ipairs")?;
        let i = args.get(1).as_integer().unwrap_or(0) + 1;
        let v = table::read(&t).get_int(i);
        Ok(if v.is_nil() {
            Value::Nil
        } else {
            Value::tuple_of(vec![Value::from(i), v])
        })
    });
    Ok(Value::tuple_of(vec![step.into(), Value::Table(t), Value::from(0)]))
}

// ── coroutine.* ───────────────────────────────────────────────────────────

fn co_create(ctx: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let f = args.check_function(0, "create")?;
    ctx.create_coroutine(f)
}

fn co_wrap(ctx: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let f = args.check_function(0, "wrap")?;
    let Value::Coroutine(co) = ctx.create_coroutine(f)? else {
        return Err(LuaError::internal("create_coroutine returned a non-coroutine"));
    };
    Ok(NativeFunction::new("wrap", move |ctx, args| {
        match co.resume(ctx, args.into_vec())? {
            Value::YieldRequest(request) if request.forced => Ok(Value::empty_tuple()),
            v => Ok(v),
        }
    })
    .into())
}

fn co_resume(ctx: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let co = args.check_coroutine(0, "resume")?;
    match co.resume(ctx, args.skip(1)) {
        // The budget suspended the child, not the caller: report a resume
        // that produced nothing, the child stays resumable.
        Ok(Value::YieldRequest(request)) if request.forced => {
            Ok(Value::tuple_of(vec![Value::Boolean(true)]))
        }
        Ok(v) => {
            let mut values = vec![Value::Boolean(true)];
            values.extend(v.into_values());
            Ok(Value::tuple(values))
        }
        Err(LuaError::Runtime(err)) => Ok(Value::tuple_of(vec![Value::Boolean(false), err.to_value()])),
        Err(other) => Err(other),
    }
}

fn co_yield(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    Ok(Value::YieldRequest(Arc::new(YieldRequest {
        values: args.into_vec(),
        forced: false,
    })))
}

fn co_running(ctx: &mut dyn ExecutionContext, _: CallbackArguments) -> Result<Value, LuaError> {
    let co = ctx.running_coroutine().map_or(Value::Nil, Value::Coroutine);
    Ok(Value::tuple_of(vec![co, Value::Boolean(ctx.is_main())]))
}

fn co_status(ctx: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let co = args.check_coroutine(0, "status")?;
    let running = ctx.running_coroutine().is_some_and(|r| r.ptr_eq(&co));
    let status = match co.state() {
        _ if running => "running",
        CoroutineState::Main | CoroutineState::Running => "normal",
        CoroutineState::NotStarted | CoroutineState::Suspended | CoroutineState::ForceSuspended => {
            "suspended"
        }
        CoroutineState::Dead => "dead",
    };
    Ok(Value::string(status))
}

fn co_close(_: &mut dyn ExecutionContext, args: CallbackArguments) -> Result<Value, LuaError> {
    let co = args.check_coroutine(0, "close")?;
    co.close()
}

fn co_isyieldable(ctx: &mut dyn ExecutionContext, _: CallbackArguments) -> Result<Value, LuaError> {
    Ok(Value::Boolean(ctx.is_yieldable()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Script;
    use pretty_assertions::assert_eq;

    fn call(script: &Script, name: &str, args: Vec<Value>) -> Result<Value, LuaError> {
        script.call_global(name, args)
    }

    #[test]
    fn pcall_catches_native_errors() {
        let script = Script::new();
        let error = script.get_global("error");
        let out = call(&script, "pcall", vec![error, Value::from("boom")]).unwrap();
        assert_eq!(out.into_values(), vec![Value::Boolean(false), Value::from("boom")]);
    }

    #[test]
    fn pcall_keeps_non_string_error_values() {
        let script = Script::new();
        let error = script.get_global("error");
        let payload = Value::new_table();
        let out = call(&script, "pcall", vec![error, payload.clone()]).unwrap();
        assert_eq!(out.into_values(), vec![Value::Boolean(false), payload]);
    }

    #[test]
    fn pcall_of_a_non_function() {
        let script = Script::new();
        let out = call(&script, "pcall", vec![Value::from(3)]).unwrap();
        assert_eq!(
            out.into_values(),
            vec![Value::Boolean(false), Value::from("attempt to pcall a non-function")]
        );
    }

    #[test]
    fn pcall_refuses_native_yields() {
        let script = Script::new();
        let co = script.get_global("coroutine");
        let yield_fn = table::read(co.as_table().unwrap()).get_str("yield");
        let out = call(&script, "pcall", vec![yield_fn]).unwrap().into_values();
        assert_eq!(out[0], Value::Boolean(false));
        assert!(out[1]
            .to_print_string()
            .contains("cannot be called directly by pcall"));
    }

    #[test]
    fn xpcall_handler_rewrites_native_errors() {
        let script = Script::new();
        let handler = NativeFunction::new("h", |_, args| {
            Ok(Value::string(format!("handled: {}", args.get(0).to_print_string())))
        });
        let error = script.get_global("error");
        let out = call(&script, "xpcall", vec![error, handler.into(), Value::from("bad")]).unwrap();
        assert_eq!(
            out.into_values(),
            vec![Value::Boolean(false), Value::from("handled: bad")]
        );
    }

    #[test]
    fn xpcall_handler_internal_errors_escape() {
        let script = Script::new();
        let handler = NativeFunction::new("h", |_, _| Err(LuaError::internal("handler state corrupt")));
        let error = script.get_global("error");
        let err = call(&script, "xpcall", vec![error, handler.into(), Value::from("bad")]).unwrap_err();
        assert!(matches!(err, LuaError::Internal(ref m) if m.contains("handler state corrupt")));
    }

    #[test]
    fn xpcall_rejects_non_function_handlers() {
        let script = Script::new();
        let error = script.get_global("error");
        let err = call(&script, "xpcall", vec![error, Value::from(1)]).unwrap_err();
        assert!(err.to_string().contains("bad argument #2 to 'xpcall'"));
    }

    #[test]
    fn select_counts_and_slices() {
        let script = Script::new();
        let args = |first: Value| vec![first, Value::from("a"), Value::from("b"), Value::from("c")];
        assert_eq!(call(&script, "select", args(Value::from("#"))).unwrap(), Value::from(3));
        assert_eq!(
            call(&script, "select", args(Value::from(2))).unwrap().into_values(),
            vec![Value::from("b"), Value::from("c")]
        );
        assert_eq!(
            call(&script, "select", args(Value::from(-1))).unwrap().into_values(),
            vec![Value::from("c")]
        );
        assert!(call(&script, "select", args(Value::from(0))).is_err());
    }

    #[test]
    fn protected_metatables_stay_put() {
        let script = Script::new();
        let t = Value::new_table();
        let mt = Value::new_table();
        table::write(mt.as_table().unwrap()).set_str("__metatable", Value::from("locked"));
        call(&script, "setmetatable", vec![t.clone(), mt]).unwrap();
        assert_eq!(
            call(&script, "getmetatable", vec![t.clone()]).unwrap(),
            Value::from("locked")
        );
        let err = call(&script, "setmetatable", vec![t, Value::Nil]).unwrap_err();
        assert_eq!(err.to_string(), "cannot change a protected metatable");
    }

    #[test]
    fn tostring_honours_metamethods() {
        let script = Script::new();
        let t = Value::new_table();
        let mt = Value::new_table();
        let show = NativeFunction::new("show", |_, _| Ok(Value::from("<thing>")));
        table::write(mt.as_table().unwrap()).set_str("__tostring", show.into());
        table::write(t.as_table().unwrap()).set_metatable(mt.as_table().cloned());
        assert_eq!(call(&script, "tostring", vec![t]).unwrap(), Value::from("<thing>"));
        assert_eq!(call(&script, "tostring", vec![Value::from(1.5)]).unwrap(), Value::from("1.5"));
    }

    #[test]
    fn tonumber_parses_bases() {
        let script = Script::new();
        assert_eq!(
            call(&script, "tonumber", vec![Value::from("ff"), Value::from(16)]).unwrap(),
            Value::from(255)
        );
        assert_eq!(call(&script, "tonumber", vec![Value::from("0x10")]).unwrap(), Value::from(16));
        assert_eq!(call(&script, "tonumber", vec![Value::from("zz")]).unwrap(), Value::Nil);
    }

    #[test]
    fn assert_passes_values_through() {
        let script = Script::new();
        let out = call(&script, "assert", vec![Value::from(1), Value::from("msg")]).unwrap();
        assert_eq!(out.into_values(), vec![Value::from(1), Value::from("msg")]);
        let err = call(&script, "assert", vec![Value::Boolean(false)]).unwrap_err();
        assert_eq!(err.to_string(), "assertion failed!");
    }

    #[test]
    fn raw_access_skips_metamethods() {
        let script = Script::new();
        let t = Value::new_table();
        call(&script, "rawset", vec![t.clone(), Value::from("k"), Value::from(7)]).unwrap();
        assert_eq!(
            call(&script, "rawget", vec![t.clone(), Value::from("k")]).unwrap(),
            Value::from(7)
        );
        assert_eq!(
            call(&script, "next", vec![t]).unwrap().into_values(),
            vec![Value::from("k"), Value::from(7)]
        );
    }

    #[test]
    fn running_outside_coroutines_is_main() {
        let script = Script::new();
        let co = script.get_global("coroutine");
        let running = table::read(co.as_table().unwrap()).get_str("running");
        let out = script.call(&running, vec![]).unwrap().into_values();
        assert!(matches!(&out[0], Value::Coroutine(c) if c.state() == CoroutineState::Main));
        assert_eq!(out[1], Value::Boolean(true));
    }
}
