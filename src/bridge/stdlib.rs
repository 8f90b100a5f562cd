//! Small helper namespaces: `time`, `os` and `do`.

use chrono::{DateTime, SecondsFormat, Utc};
use mlua::{Lua, Table, Value};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::runtime::Handle;

use super::{arg, build_namespace, native, wait};
use crate::script::convert::{self, throw};
use crate::script::Interrupter;

pub(super) fn time_namespace(lua: &Lua, runtime: Handle, interrupter: Interrupter) -> mlua::Result<Table> {
    let scope = interrupter.clone();
    let sleep = native(lua, &interrupter, move |_, args| {
        let duration = convert::duration(&arg(&args, 0))?;
        wait(&runtime, &scope, "sleep", async move {
            tokio::time::sleep(duration).await;
            Ok(Value::Nil)
        })
    })?;

    let now = native(lua, &interrupter, |lua, _| {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        lua.create_string(stamp).map(Value::String)
    })?;

    let since = native(lua, &interrupter, |lua, args| {
        let raw = convert::string(&arg(&args, 0))?;
        let start = DateTime::parse_from_rfc3339(&raw)
            .or_else(|e| throw(format!("can't parse time value: {e}")))?;
        let elapsed = Utc::now().signed_duration_since(start.with_timezone(&Utc));
        let seconds = elapsed.num_nanoseconds().map_or(elapsed.num_seconds() as f64, |n| n as f64 / 1e9);

        let result = lua.create_table()?;
        result.set("seconds", lua.create_function(move |_, ()| Ok(seconds))?)?;
        Ok(Value::Table(result))
    })?;

    build_namespace(lua, vec![("sleep", sleep), ("now", now), ("since", since)])
}

pub(super) fn os_namespace(lua: &Lua, interrupter: Interrupter) -> mlua::Result<Table> {
    let getenv = native(lua, &interrupter, |lua, args| {
        let key = convert::string(&arg(&args, 0))?;
        let value = std::env::var(&key).unwrap_or_default();
        lua.create_string(value).map(Value::String)
    })?;
    build_namespace(lua, vec![("getenv", getenv)])
}

pub(super) fn do_namespace(lua: &Lua, interrupter: Interrupter) -> mlua::Result<Table> {
    let rand_string = native(lua, &interrupter, |lua, args| {
        let length = convert::int(&arg(&args, 0))?;
        lua.create_string(random_hex(length)?).map(Value::String)
    })?;
    build_namespace(lua, vec![("rand_string", rand_string)])
}

/// Longest string `rand_string` hands out.
const MAX_RAND_STRING: i64 = 1 << 20;

/// Hex string of `length / 2` random bytes, so the result is `length`
/// characters long for even lengths.
fn random_hex(length: i64) -> mlua::Result<String> {
    if length > MAX_RAND_STRING {
        return throw(format!("length too large, got {length} (max {MAX_RAND_STRING})"));
    }
    let bytes = usize::try_from(length / 2)
        .or_else(|_| throw(format!("length must not be negative, got {length}")))?;
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    Ok(buf.iter().map(|b| format!("{b:02x}")).collect())
}
