use crate::callback::NativeFunction;
use crate::closure::Closure;
use crate::coroutine::CoroutineRef;
use crate::table::{Table, TableRef};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};

/// All runtime value types.
///
/// Besides the script-visible types, three variants only ever live on the
/// processor's operand stack or travel back from native callbacks:
/// [`Value::Tuple`] carries multiple results, [`Value::YieldRequest`] and
/// [`Value::TailCallRequest`] ask the processor to suspend or to replace the
/// current call.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    String(Arc<str>),
    /// A table (array + hash parts, reference-counted + interior mutability).
    Table(TableRef),
    /// A script closure (entry address + captured upvalue cells).
    Closure(Arc<Closure>),
    /// A native Rust function callable from scripts.
    NativeFunction(NativeFunction),
    Coroutine(CoroutineRef),
    /// An opaque host object.
    UserData(Arc<UserData>),
    /// Multiple values in flight. Never nested once built through [`Value::tuple`].
    Tuple(Arc<[Value]>),
    YieldRequest(Arc<YieldRequest>),
    TailCallRequest(Arc<TailCallRequest>),
}

/// Values handed back by `coroutine.yield`, or an engine-initiated yield.
#[derive(Debug, Clone, PartialEq)]
pub struct YieldRequest {
    pub values: Vec<Value>,
    /// Set when the instruction budget ran out rather than a script yielding.
    pub forced: bool,
}

/// Asks the processor to call `function` in place of the native callback
/// that returned this request.
#[derive(Debug, Clone)]
pub struct TailCallRequest {
    pub function: Value,
    pub args: Vec<Value>,
    /// Applied to the call's result before it reaches the caller.
    pub continuation: Option<NativeFunction>,
    /// Produces the call's result when it raises a runtime error.
    pub error_handler: Option<NativeFunction>,
    /// Gets a chance to rewrite the error message before the stack unwinds.
    pub error_handler_before_unwind: Option<Value>,
}

impl TailCallRequest {
    pub fn new(function: Value, args: Vec<Value>) -> Self {
        Self {
            function,
            args,
            continuation: None,
            error_handler: None,
            error_handler_before_unwind: None,
        }
    }
}

/// A host object exposed to scripts. Behaviour comes from its metatable.
pub struct UserData {
    pub type_name: Arc<str>,
    pub object: Box<dyn Any + Send + Sync>,
    pub metatable: Option<TableRef>,
}

impl UserData {
    pub fn new<T: Any + Send + Sync>(type_name: &str, object: T, metatable: Option<TableRef>) -> Self {
        Self {
            type_name: type_name.into(),
            object: Box::new(object),
            metatable,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.object.downcast_ref()
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl Value {
    /// Returns the type name string as per the reference manual.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Closure(_) | Value::NativeFunction(_) => "function",
            Value::Coroutine(_) => "thread",
            Value::UserData(_) => "userdata",
            Value::Tuple(_) => "tuple",
            Value::YieldRequest(_) => "yieldrequest",
            Value::TailCallRequest(_) => "tailcallrequest",
        }
    }

    /// Builds a tuple, expanding a trailing tuple so the result never nests.
    ///
    /// Inner positions are collapsed to their first element; a single value
    /// is returned unwrapped.
    pub fn tuple(values: Vec<Value>) -> Value {
        let count = values.len();
        let mut flat = Vec::with_capacity(count);
        for (i, v) in values.into_iter().enumerate() {
            match v {
                Value::Tuple(inner) if i + 1 == count => flat.extend(inner.iter().cloned()),
                Value::Tuple(inner) => flat.push(inner.first().cloned().unwrap_or(Value::Nil)),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Value::Nil)
        } else {
            Value::Tuple(flat.into())
        }
    }

    /// Builds a tuple without unwrapping single values.
    pub fn tuple_of(values: Vec<Value>) -> Value {
        Value::Tuple(values.into())
    }

    pub fn empty_tuple() -> Value {
        Value::Tuple(Arc::from(Vec::new()))
    }

    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(Arc::from(s.as_ref()))
    }

    /// Create a new empty table value.
    pub fn new_table() -> Self {
        Value::Table(Arc::new(RwLock::new(Table::new())))
    }

    pub fn from_table(table: Table) -> Self {
        Value::Table(Arc::new(RwLock::new(table)))
    }

    /// Returns `true` if the value is truthy
    /// (everything except `nil` and `false` is truthy).
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil | Value::Boolean(false) => false,
            Value::Tuple(items) => items.first().is_some_and(Value::is_truthy),
            _ => true,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Nil, or an empty tuple standing in for "no value".
    pub fn is_nil_or_void(&self) -> bool {
        match self {
            Value::Nil => true,
            Value::Tuple(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::NativeFunction(_))
    }

    /// The value as seen in single-value context: a tuple collapses to its
    /// first element, an empty one to nil.
    pub fn to_scalar(&self) -> Value {
        match self {
            Value::Tuple(items) => items.first().map(Value::to_scalar).unwrap_or(Value::Nil),
            other => other.clone(),
        }
    }

    /// Expands a tuple into its elements; any other value yields itself.
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Value::Tuple(items) => items.to_vec(),
            other => vec![other],
        }
    }

    /// Numbers, and strings that parse as numbers (decimal or `0x` hex).
    pub fn cast_to_number(&self) -> Option<f64> {
        match self.to_scalar() {
            Value::Number(n) => Some(n),
            Value::String(s) => parse_number(&s),
            _ => None,
        }
    }

    /// Strings, and numbers rendered the way `tostring` would.
    pub fn cast_to_string(&self) -> Option<String> {
        match self.to_scalar() {
            Value::String(s) => Some(s.to_string()),
            Value::Number(n) => Some(format_number(n)),
            _ => None,
        }
    }

    /// An integer when the number is exactly representable as one.
    pub fn as_integer(&self) -> Option<i64> {
        let n = self.cast_to_number()?;
        if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
            Some(n as i64)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_coroutine(&self) -> Option<&CoroutineRef> {
        match self {
            Value::Coroutine(c) => Some(c),
            _ => None,
        }
    }

    /// The metatable consulted for metamethods: tables and userdata carry one.
    pub fn metatable(&self) -> Option<TableRef> {
        match self {
            Value::Table(t) => crate::table::read(t).metatable(),
            Value::UserData(ud) => ud.metatable.clone(),
            _ => None,
        }
    }

    /// Raw metamethod lookup (`__index`, `__close`, ...). Missing and nil
    /// entries both yield `None`.
    pub fn metamethod(&self, event: &str) -> Option<Value> {
        let mt = self.metatable()?;
        let handler = crate::table::read(&mt).get_str(event);
        (!handler.is_nil()).then_some(handler)
    }

    /// Identity equality for reference types, value equality for scalars.
    pub fn raw_equals(&self, other: &Value) -> bool {
        self == other
    }

    /// Text used by `tostring` / `print`.
    pub fn to_print_string(&self) -> String {
        match self {
            Value::String(s) => s.to_string(),
            Value::Tuple(items) => items
                .iter()
                .map(Value::to_print_string)
                .collect::<Vec<_>>()
                .join("\t"),
            other => other.to_string(),
        }
    }

    /// Address used to print reference types.
    fn address(&self) -> usize {
        match self {
            Value::Table(t) => Arc::as_ptr(t) as *const () as usize,
            Value::Closure(c) => Arc::as_ptr(c) as *const () as usize,
            Value::NativeFunction(f) => f.address(),
            Value::Coroutine(c) => c.address(),
            Value::UserData(u) => Arc::as_ptr(u) as *const () as usize,
            _ => 0,
        }
    }
}

/// Parses a numeric string: trimmed decimal, exponent or `0x` hexadecimal.
pub fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        let n = i64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if negative { -n } else { n });
    }
    if body.is_empty() || body.starts_with(|c: char| c.is_alphabetic()) {
        return None;
    }
    let n: f64 = body.parse().ok()?;
    Some(if negative { -n } else { n })
}

/// Integral numbers print without a fractional part (`3`, not `3.0`).
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else if n.is_nan() {
        if n.is_sign_negative() { "-nan".into() } else { "nan".into() }
    } else if n.is_infinite() {
        if n > 0.0 { "inf".into() } else { "-inf".into() }
    } else {
        format!("{n}")
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            // Reference types are equal only if they are the exact same object
            (Value::Table(a), Value::Table(b)) => Arc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::NativeFunction(a), Value::NativeFunction(b)) => a.ptr_eq(b),
            (Value::Coroutine(a), Value::Coroutine(b)) => a.ptr_eq(b),
            (Value::UserData(a), Value::UserData(b)) => Arc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::YieldRequest(a), Value::YieldRequest(b)) => a == b,
            (Value::TailCallRequest(a), Value::TailCallRequest(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Value::Nil"),
            Value::Boolean(b) => write!(f, "Value::Boolean({b})"),
            Value::Number(n) => write!(f, "Value::Number({n})"),
            Value::String(s) => write!(f, "Value::String({s:?})"),
            Value::Table(_) => write!(f, "Value::Table({:#x})", self.address()),
            Value::Closure(c) => write!(f, "Value::Closure(@{})", c.entry_point),
            Value::NativeFunction(nf) => write!(f, "Value::NativeFunction({})", nf.name()),
            Value::Coroutine(_) => write!(f, "Value::Coroutine({:#x})", self.address()),
            Value::UserData(u) => write!(f, "Value::UserData({})", u.type_name),
            Value::Tuple(items) => f.debug_tuple("Value::Tuple").field(&&items[..]).finish(),
            Value::YieldRequest(y) => write!(f, "Value::YieldRequest({:?}, forced={})", y.values, y.forced),
            Value::TailCallRequest(t) => write!(f, "Value::TailCallRequest({:?})", t.function),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{s}"),
            Value::Table(_) => write!(f, "table: {:#010x}", self.address()),
            Value::Closure(_) | Value::NativeFunction(_) => {
                write!(f, "function: {:#010x}", self.address())
            }
            Value::Coroutine(_) => write!(f, "thread: {:#010x}", self.address()),
            Value::UserData(u) => write!(f, "{}: {:#010x}", u.type_name, self.address()),
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
            Value::YieldRequest(_) => write!(f, "(yield request)"),
            Value::TailCallRequest(_) => write!(f, "(tail call request)"),
        }
    }
}

// ── Host conversions ──────────────────────────────────────────────────────────

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nil)
    }
}

impl From<NativeFunction> for Value {
    fn from(f: NativeFunction) -> Self {
        Value::NativeFunction(f)
    }
}

impl TryFrom<Value> for f64 {
    type Error = crate::error::LuaError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        v.cast_to_number().ok_or_else(|| {
            crate::error::LuaError::InvalidArgument(format!("cannot convert a {} to a number", v.type_name()))
        })
    }
}

impl TryFrom<Value> for String {
    type Error = crate::error::LuaError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        v.cast_to_string().ok_or_else(|| {
            crate::error::LuaError::InvalidArgument(format!("cannot convert a {} to a string", v.type_name()))
        })
    }
}

impl TryFrom<Value> for bool {
    type Error = crate::error::LuaError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        Ok(v.is_truthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nil_is_falsy() {
        assert!(!Value::Nil.is_truthy());
    }

    #[test]
    fn false_is_falsy() {
        assert!(!Value::Boolean(false).is_truthy());
    }

    #[test]
    fn zero_is_truthy() {
        assert!(Value::Number(0.0).is_truthy());
    }

    #[test]
    fn type_names() {
        assert_eq!(Value::Nil.type_name(), "nil");
        assert_eq!(Value::Boolean(true).type_name(), "boolean");
        assert_eq!(Value::Number(1.0).type_name(), "number");
        assert_eq!(Value::string("hi").type_name(), "string");
        assert_eq!(Value::new_table().type_name(), "table");
    }

    #[test]
    fn tuple_expands_last_and_collapses_inner() {
        let inner = Value::tuple_of(vec![Value::from(2), Value::from(3)]);
        let t = Value::tuple(vec![inner.clone(), Value::from(1), inner]);
        assert_eq!(
            t,
            Value::tuple_of(vec![Value::from(2), Value::from(1), Value::from(2), Value::from(3)])
        );
    }

    #[test]
    fn tuple_in_scalar_context_is_first_element() {
        let t = Value::tuple_of(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(t.to_scalar(), Value::from("a"));
        assert_eq!(Value::empty_tuple().to_scalar(), Value::Nil);
        let nested = Value::tuple_of(vec![Value::tuple_of(vec![Value::from(7)])]);
        assert_eq!(nested.to_scalar(), Value::from(7));
    }

    #[test]
    fn single_value_tuple_unwraps() {
        assert_eq!(Value::tuple(vec![Value::from(5)]), Value::from(5));
    }

    #[test]
    fn numeric_strings_cast() {
        assert_eq!(Value::from(" 10 ").cast_to_number(), Some(10.0));
        assert_eq!(Value::from("0x10").cast_to_number(), Some(16.0));
        assert_eq!(Value::from("1e2").cast_to_number(), Some(100.0));
        assert_eq!(Value::from("abc").cast_to_number(), None);
        assert_eq!(Value::from("inf").cast_to_number(), None);
        assert_eq!(Value::Number(3.0).cast_to_string().as_deref(), Some("3"));
        assert_eq!(Value::Number(1.5).cast_to_string().as_deref(), Some("1.5"));
    }

    #[test]
    fn integers_require_exact_representation() {
        assert_eq!(Value::Number(4.0).as_integer(), Some(4));
        assert_eq!(Value::Number(4.5).as_integer(), None);
        assert_eq!(Value::from("8").as_integer(), Some(8));
    }

    #[test]
    fn table_reference_equality() {
        let t1 = Value::new_table();
        let t2 = Value::new_table();
        assert_eq!(t1, t1.clone()); // same Arc → equal
        assert_ne!(t1, t2); // different Arcs → not equal
    }

    #[test]
    fn metamethod_lookup_ignores_nil_entries() {
        let mt = Value::new_table();
        let t = Value::new_table();
        if let (Value::Table(t), Value::Table(mt)) = (&t, &mt) {
            crate::table::write(mt).set_str("__close", Value::from(true));
            crate::table::write(t).set_metatable(Some(mt.clone()));
        }
        assert_eq!(t.metamethod("__close"), Some(Value::from(true)));
        assert_eq!(t.metamethod("__index"), None);
    }
}
