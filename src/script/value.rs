//! Host-side representation of script values.

use std::collections::BTreeMap;
use std::ffi::c_void;

use mlua::{FromLua, IntoLua, Lua, Table, Value};
use serde::{Deserialize, Serialize};

/// A script value marshaled out of (or into) an execution context.
///
/// Tables become [`HostValue::List`] when they are a proper sequence
/// (`1..n` keys, nothing else) and [`HostValue::Map`] otherwise. Maps only
/// carry string keys; functions, userdata and threads have no host form and
/// fail to convert.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostValue {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<HostValue>),
    Map(BTreeMap<String, HostValue>),
}

impl HostValue {
    /// Build a map value from `(key, value)` pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<HostValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        HostValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Int(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::String(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::String(v)
    }
}

impl From<Vec<String>> for HostValue {
    fn from(v: Vec<String>) -> Self {
        HostValue::List(v.into_iter().map(HostValue::String).collect())
    }
}

impl From<std::time::Duration> for HostValue {
    fn from(v: std::time::Duration) -> Self {
        HostValue::String(super::duration::format_duration(v))
    }
}

impl From<HostValue> for serde_json::Value {
    fn from(v: HostValue) -> Self {
        match v {
            HostValue::Nil => serde_json::Value::Null,
            HostValue::Bool(b) => serde_json::Value::Bool(b),
            HostValue::Int(i) => serde_json::Value::from(i),
            HostValue::Float(f) => serde_json::Value::from(f),
            HostValue::String(s) => serde_json::Value::String(s),
            HostValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            HostValue::Map(entries) => serde_json::Value::Object(
                entries.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl IntoLua for HostValue {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        match self {
            HostValue::Nil => Ok(Value::Nil),
            HostValue::Bool(b) => Ok(Value::Boolean(b)),
            HostValue::Int(i) => Ok(Value::Integer(i)),
            HostValue::Float(f) => Ok(Value::Number(f)),
            HostValue::String(s) => Ok(Value::String(lua.create_string(&s)?)),
            HostValue::List(items) => {
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.into_iter().enumerate() {
                    table.raw_set(i + 1, item)?;
                }
                Ok(Value::Table(table))
            }
            HostValue::Map(entries) => {
                let table = lua.create_table_with_capacity(0, entries.len())?;
                for (k, v) in entries {
                    table.raw_set(k, v)?;
                }
                Ok(Value::Table(table))
            }
        }
    }
}

impl FromLua for HostValue {
    fn from_lua(value: Value, _lua: &Lua) -> mlua::Result<Self> {
        let mut path = Vec::new();
        marshal(value, &mut path)
    }
}

/// Tables nested deeper than this don't marshal.
const MAX_DEPTH: usize = 64;

/// Convert `value`, with `path` holding the tables currently being converted
/// so a self-reference is reported instead of recursed into.
fn marshal(value: Value, path: &mut Vec<*const c_void>) -> mlua::Result<HostValue> {
    match value {
        Value::Nil => Ok(HostValue::Nil),
        Value::Boolean(b) => Ok(HostValue::Bool(b)),
        Value::Integer(i) => Ok(HostValue::Int(i)),
        Value::Number(f) => Ok(HostValue::Float(f)),
        Value::String(s) => Ok(HostValue::String(s.to_str()?.to_string())),
        Value::Table(table) => {
            let ptr = table.to_pointer();
            if path.contains(&ptr) {
                return Err(mlua::Error::runtime("can't marshal a table that contains itself"));
            }
            if path.len() >= MAX_DEPTH {
                return Err(mlua::Error::runtime(format!(
                    "can't marshal tables nested more than {MAX_DEPTH} deep"
                )));
            }
            path.push(ptr);
            let converted = marshal_table(table, path);
            path.pop();
            converted
        }
        other => Err(mlua::Error::runtime(format!(
            "can't marshal a {} out of the script",
            other.type_name()
        ))),
    }
}

fn marshal_table(table: Table, path: &mut Vec<*const c_void>) -> mlua::Result<HostValue> {
    let len = table.raw_len();
    let mut count = 0usize;
    for pair in table.clone().pairs::<Value, Value>() {
        pair?;
        count += 1;
    }

    if len > 0 && count == len {
        let mut items = Vec::with_capacity(len);
        for item in table.sequence_values::<Value>() {
            items.push(marshal(item?, path)?);
        }
        return Ok(HostValue::List(items));
    }

    let mut entries = BTreeMap::new();
    for pair in table.pairs::<Value, Value>() {
        let (k, v) = pair?;
        let key = match k {
            Value::String(s) => s.to_str()?.to_string(),
            Value::Integer(i) => i.to_string(),
            other => {
                return Err(mlua::Error::runtime(format!(
                    "can't use {} as a map key",
                    other.type_name()
                )))
            }
        };
        entries.insert(key, marshal(v, path)?);
    }
    Ok(HostValue::Map(entries))
}
