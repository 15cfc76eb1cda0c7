use crate::error::LuaError;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared handle to a table.
pub type TableRef = Arc<RwLock<Table>>;

/// Read-locks a table. Poisoning is ignored: a table is never left half-updated.
pub fn read(table: &TableRef) -> RwLockReadGuard<'_, Table> {
    table.read().unwrap_or_else(|e| e.into_inner())
}

/// Write-locks a table. Poisoning is ignored: a table is never left half-updated.
pub fn write(table: &TableRef) -> RwLockWriteGuard<'_, Table> {
    table.write().unwrap_or_else(|e| e.into_inner())
}

/// An associative array keyed by any non-nil, non-NaN value.
///
/// Stores integer keys 1..n in a compact `array` part for fast sequential access;
/// everything else goes into the `hash` part, which remembers insertion order
/// so traversal with [`Table::next`] is deterministic.
#[derive(Debug, Clone, Default)]
pub struct Table {
    array: Vec<Value>, // 1-indexed: array[i-1] = t[i]
    entries: Vec<(Value, Value)>,
    index: HashMap<TableKey, usize>,
    /// Entries whose value was set to nil but whose slot is kept so an
    /// in-progress traversal can continue past them.
    dead: usize,
    metatable: Option<TableRef>,
    init_array: i64,
}

/// Keys that can be stored in the hash part of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    /// Bit pattern of a normalized number (`-0.0` folds into `0.0`).
    Number(u64),
    Str(Arc<str>),
    Bool(bool),
    /// Identity of a reference type.
    Ref(usize),
}

impl TableKey {
    pub fn from_value(v: &Value) -> Option<TableKey> {
        match v {
            Value::Number(n) if n.is_nan() => None,
            Value::Number(n) => {
                let n = if *n == 0.0 { 0.0 } else { *n };
                Some(TableKey::Number(n.to_bits()))
            }
            Value::String(s) => Some(TableKey::Str(s.clone())),
            Value::Boolean(b) => Some(TableKey::Bool(*b)),
            Value::Table(t) => Some(TableKey::Ref(Arc::as_ptr(t) as *const () as usize)),
            Value::Closure(c) => Some(TableKey::Ref(Arc::as_ptr(c) as *const () as usize)),
            Value::NativeFunction(f) => Some(TableKey::Ref(f.address())),
            Value::Coroutine(c) => Some(TableKey::Ref(c.address())),
            Value::UserData(u) => Some(TableKey::Ref(Arc::as_ptr(u) as *const () as usize)),
            Value::Tuple(items) => items.first().and_then(TableKey::from_value),
            Value::Nil | Value::YieldRequest(_) | Value::TailCallRequest(_) => None,
        }
    }
}

/// Array slot for `key` when it is an integer in `1..`.
fn array_slot(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if n.fract() == 0.0 && *n >= 1.0 && *n <= usize::MAX as f64 => {
            Some(*n as usize - 1)
        }
        _ => None,
    }
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, mt: Option<TableRef>) {
        self.metatable = mt;
    }

    /// Read `t[key]`. Returns `Value::Nil` for missing keys.
    pub fn get(&self, key: &Value) -> Value {
        let key = key.to_scalar();
        if let Some(slot) = array_slot(&key) {
            if slot < self.array.len() {
                return self.array[slot].clone();
            }
        }
        TableKey::from_value(&key)
            .and_then(|hk| self.index.get(&hk))
            .map(|&i| self.entries[i].1.clone())
            .unwrap_or(Value::Nil)
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.index
            .get(&TableKey::Str(key.into()))
            .map(|&i| self.entries[i].1.clone())
            .unwrap_or(Value::Nil)
    }

    pub fn get_int(&self, key: i64) -> Value {
        self.get(&Value::Number(key as f64))
    }

    /// Write `t[key] = val`. Setting to nil deletes the entry.
    pub fn set(&mut self, key: Value, val: Value) -> Result<(), LuaError> {
        let key = key.to_scalar();
        match &key {
            Value::Nil => return Err(LuaError::runtime("table index is nil")),
            Value::Number(n) if n.is_nan() => return Err(LuaError::runtime("table index is NaN")),
            _ => {}
        }
        if let Some(slot) = array_slot(&key) {
            if slot < self.array.len() {
                self.array[slot] = val;
                // Keep the last array element non-nil so `length` stays a border
                while matches!(self.array.last(), Some(Value::Nil)) {
                    self.array.pop();
                }
                return Ok(());
            } else if slot == self.array.len() && !val.is_nil() {
                self.remove_entry(&key);
                self.array.push(val);
                // Drain consecutive integer keys from hash into array
                self.rehash_sequence();
                return Ok(());
            }
        }
        if let Some(hk) = TableKey::from_value(&key) {
            self.set_entry(hk, key, val);
        }
        Ok(())
    }

    pub fn set_str(&mut self, key: &str, val: Value) {
        let key = Value::string(key);
        if let Some(hk) = TableKey::from_value(&key) {
            self.set_entry(hk, key, val);
        }
    }

    pub fn set_int(&mut self, key: i64, val: Value) {
        // Integer keys are never nil or NaN
        let _ = self.set(Value::Number(key as f64), val);
    }

    fn set_entry(&mut self, hk: TableKey, key: Value, val: Value) {
        match self.index.get(&hk) {
            Some(&i) => {
                let was_nil = self.entries[i].1.is_nil();
                match (was_nil, val.is_nil()) {
                    (false, true) => self.dead += 1,
                    (true, false) => self.dead -= 1,
                    _ => {}
                }
                self.entries[i].1 = val;
            }
            None if val.is_nil() => {}
            None => {
                if self.dead > 8 && self.dead * 2 > self.entries.len() {
                    self.compact();
                }
                self.index.insert(hk, self.entries.len());
                self.entries.push((key, val));
            }
        }
    }

    fn remove_entry(&mut self, key: &Value) {
        if let Some(hk) = TableKey::from_value(key) {
            if let Some(&i) = self.index.get(&hk) {
                if !self.entries[i].1.is_nil() {
                    self.entries[i].1 = Value::Nil;
                    self.dead += 1;
                }
            }
        }
    }

    /// Drops dead entries and rebuilds the key index.
    fn compact(&mut self) {
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (i, (k, _)) in self.entries.iter().enumerate() {
            if let Some(hk) = TableKey::from_value(k) {
                self.index.insert(hk, i);
            }
        }
        self.dead = 0;
    }

    /// Length: the border of the array sequence (largest n where t[n] ~= nil).
    pub fn length(&self) -> usize {
        self.array.len()
    }

    /// Append `val` to the array part (equivalent to `t[#t+1] = val`).
    pub fn push(&mut self, val: Value) {
        if !val.is_nil() {
            self.array.push(val);
            self.rehash_sequence();
        }
    }

    /// Positional append used by table constructors. A tuple in the last
    /// position spreads over consecutive keys.
    pub fn init_next_array_keys(&mut self, val: Value, last_position: bool) {
        match val {
            Value::Tuple(items) if last_position => {
                for v in items.iter() {
                    self.init_next_array_keys(v.clone(), true);
                }
            }
            other => {
                self.init_array += 1;
                let key = self.init_array;
                self.set_int(key, other.to_scalar());
            }
        }
    }

    /// Traversal step: the entry following `key` (`nil` starts over).
    /// Returns `Ok(None)` past the last entry.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, LuaError> {
        let key = key.to_scalar();
        let mut entry_start = 0;
        if key.is_nil() {
            if let Some(found) = self.next_in_array(0) {
                return Ok(Some(found));
            }
        } else if let Some(slot) = array_slot(&key).filter(|s| *s < self.array.len()) {
            if let Some(found) = self.next_in_array(slot + 1) {
                return Ok(Some(found));
            }
        } else {
            let i = TableKey::from_value(&key)
                .and_then(|hk| self.index.get(&hk).copied())
                .ok_or_else(|| LuaError::runtime("invalid key to 'next'"))?;
            entry_start = i + 1;
        }
        Ok(self.entries[entry_start.min(self.entries.len())..]
            .iter()
            .find(|(_, v)| !v.is_nil())
            .cloned())
    }

    fn next_in_array(&self, from: usize) -> Option<(Value, Value)> {
        self.array
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::Number((i + 1) as f64), v.clone()))
    }

    /// After a new integer key extends the array part, pull consecutive keys
    /// from the hash part into the array to keep the invariant.
    fn rehash_sequence(&mut self) {
        loop {
            let next = Value::Number((self.array.len() + 1) as f64);
            let Some(hk) = TableKey::from_value(&next) else { break };
            let Some(&i) = self.index.get(&hk) else { break };
            if self.entries[i].1.is_nil() {
                break;
            }
            let v = std::mem::replace(&mut self.entries[i].1, Value::Nil);
            self.dead += 1;
            self.array.push(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn integer_keys_fill_array_part() {
        let mut t = Table::new();
        t.set_int(1, Value::from("a"));
        t.set_int(3, Value::from("c"));
        assert_eq!(t.length(), 1);
        t.set_int(2, Value::from("b"));
        assert_eq!(t.length(), 3);
        assert_eq!(t.get_int(3), Value::from("c"));
    }

    #[test]
    fn float_keys_with_integral_value_alias_integers() {
        let mut t = Table::new();
        t.set(Value::Number(2.0), Value::from(true)).unwrap();
        assert_eq!(t.get_int(2), Value::from(true));
        t.set(Value::Number(0.5), Value::from(1)).unwrap();
        assert_eq!(t.get(&Value::Number(0.5)), Value::from(1));
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let mut t = Table::new();
        assert!(t.set(Value::Nil, Value::from(1)).is_err());
        assert!(t.set(Value::Number(f64::NAN), Value::from(1)).is_err());
    }

    #[test]
    fn reference_keys_use_identity() {
        let mut t = Table::new();
        let k1 = Value::new_table();
        let k2 = Value::new_table();
        t.set(k1.clone(), Value::from("one")).unwrap();
        assert_eq!(t.get(&k1), Value::from("one"));
        assert_eq!(t.get(&k2), Value::Nil);
    }

    #[test]
    fn next_walks_array_then_insertion_order() {
        let mut t = Table::new();
        t.set_str("z", Value::from(1));
        t.set_int(1, Value::from(10));
        t.set_str("a", Value::from(2));
        let mut keys = Vec::new();
        let mut k = Value::Nil;
        while let Some((nk, _)) = t.next(&k).unwrap() {
            keys.push(nk.clone());
            k = nk;
        }
        assert_eq!(keys, vec![Value::from(1), Value::from("z"), Value::from("a")]);
    }

    #[test]
    fn clearing_during_traversal_keeps_iteration_valid() {
        let mut t = Table::new();
        t.set_str("a", Value::from(1));
        t.set_str("b", Value::from(2));
        let (k, _) = t.next(&Value::Nil).unwrap().unwrap();
        t.set(k.clone(), Value::Nil).unwrap();
        let (k2, _) = t.next(&k).unwrap().unwrap();
        assert_eq!(k2, Value::from("b"));
    }

    #[test]
    fn constructor_spreads_trailing_tuple() {
        let mut t = Table::new();
        t.init_next_array_keys(Value::from("x"), false);
        t.init_next_array_keys(Value::tuple_of(vec![Value::from(1), Value::from(2)]), true);
        assert_eq!(t.length(), 3);
        assert_eq!(t.get_int(3), Value::from(2));
    }

    #[test]
    fn setting_last_element_to_nil_shrinks_border() {
        let mut t = Table::new();
        t.push(Value::from(1));
        t.push(Value::from(2));
        t.set_int(2, Value::Nil);
        assert_eq!(t.length(), 1);
    }
}
