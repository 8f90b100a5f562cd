//! Converters from raw script values into host types.
//!
//! Every converter fails with a script error (never a panic) so native
//! functions can propagate it with `?` and the script sees a normal raised
//! error.

use std::collections::BTreeMap;
use std::time::Duration;

use mlua::{Table, Value};

use super::duration::parse_duration;

/// Raise a runtime error inside the script.
pub fn throw<T>(message: impl std::fmt::Display) -> mlua::Result<T> {
    Err(mlua::Error::runtime(message.to_string()))
}

/// String conversion; `nil` becomes the empty string, numbers are rendered.
pub fn string(value: &Value) -> mlua::Result<String> {
    match value {
        Value::Nil => Ok(String::new()),
        Value::String(s) => Ok(s.to_str()?.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        other => throw(format!("needs to be a string, was a {:?}", other.type_name())),
    }
}

/// Like [`string`], but `nil` is an error.
pub fn required_string(value: &Value) -> mlua::Result<String> {
    if value.is_nil() {
        return throw("is required");
    }
    string(value)
}

pub fn int(value: &Value) -> mlua::Result<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Ok(*n as i64),
        Value::String(s) => {
            let raw = s.to_str()?;
            raw.trim()
                .parse()
                .or_else(|_| throw(format!("{:?} is not an integer", &*raw)))
        }
        other => throw(format!("needs to be an integer, was a {:?}", other.type_name())),
    }
}

/// An ordered sequence of strings; `nil` is an empty sequence.
pub fn string_slice(value: &Value) -> mlua::Result<Vec<String>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Table(table) => {
            let mut out = Vec::new();
            for (i, item) in table.clone().sequence_values::<Value>().enumerate() {
                let item = item?;
                let s = string(&item)
                    .or_else(|e| throw(format!("element {} is not a string: {}", i + 1, super::describe(&e))))?;
                out.push(s);
            }
            Ok(out)
        }
        other => throw(format!("needs to be an array, was a {:?}", other.type_name())),
    }
}

/// A string-keyed map of string sequences; a bare string value is accepted
/// as a one-element sequence.
pub fn string_map_slice(value: &Value) -> mlua::Result<BTreeMap<String, Vec<String>>> {
    let mut out = BTreeMap::new();
    for (key, item) in entries(value)? {
        let values = match &item {
            Value::Table(_) => string_slice(&item),
            _ => string(&item).map(|s| vec![s]),
        }
        .or_else(|e| throw(format!("element {key:?}: {}", super::describe(&e))))?;
        out.insert(key, values);
    }
    Ok(out)
}

pub fn duration(value: &Value) -> mlua::Result<Duration> {
    let raw = match value {
        Value::String(s) => s.to_str()?.to_string(),
        other => return throw(format!("needs to be a string, was a {:?}", other.type_name())),
    };
    parse_duration(&raw).or_else(|e| throw(format!("can't parse duration: {e}")))
}

fn entries(value: &Value) -> mlua::Result<Vec<(String, Value)>> {
    let table = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Table(table) => table.clone(),
        other => return throw(format!("needs to be an object, was a {:?}", other.type_name())),
    };
    let mut out = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        let (k, v) = pair?;
        let key = string(&k).or_else(|_| throw(format!("can't use a {} as a key", k.type_name())))?;
        out.push((key, v));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Key-driven reader over a script-side options object.
///
/// Each [`ObjectReader::field`] call fetches one property and runs its
/// converter; a failure is re-raised with the offending key in the message,
/// so config authors see exactly which option was wrong.
pub struct ObjectReader {
    table: Table,
}

impl ObjectReader {
    pub fn new(value: Value) -> mlua::Result<Self> {
        match value {
            Value::Table(table) => Ok(Self { table }),
            other => throw(format!("need to be an object, not a {:?}", other.type_name())),
        }
    }

    pub fn field<T>(&self, key: &str, convert: impl FnOnce(&Value) -> mlua::Result<T>) -> mlua::Result<T> {
        let value = self
            .table
            .get::<Value>(key)
            .or_else(|e| throw(format!("can't get key {key:?}: {}", super::describe(&e))))?;
        convert(&value)
            .or_else(|e| throw(format!("can't use value in key {key:?}, {}", super::describe(&e))))
    }
}
