//! Capability bridge: the native namespaces a check script can reach.
//!
//! A test body sees exactly these globals on top of the sandboxed Lua
//! libraries:
//!
//! - `http` -- `http["do"](method, url, headers, body)` (alias `http.request`)
//! - `log` -- `info`, `error`, `fail`, `kv`
//! - `time` -- `sleep`, `now`, `since`
//! - `os` -- `getenv`
//! - `do` -- `rand_string` (alias table `util`, since `do` is a Lua keyword)
//!
//! Every native that blocks (HTTP, sleep) waits on the run's interrupt token,
//! and every native checks for a pending interrupt on entry.

pub mod http;
pub mod log;
pub mod stdlib;

use std::future::Future;

use mlua::{Function, Lua, Table, Value, Variadic};
use tokio::runtime::Handle;

use crate::script::{convert, ExecutionContext, Interrupter, ScriptError};

pub use self::log::ScriptLogger;

/// Everything one run's natives are bound to.
#[derive(Clone)]
pub struct Capabilities {
    pub http: reqwest::Client,
    pub logger: ScriptLogger,
    pub runtime: Handle,
}

/// Install the full test-script surface into `ctx`.
pub fn install(ctx: &ExecutionContext, caps: &Capabilities) -> Result<(), ScriptError> {
    let lua = ctx.lua();
    let interrupter = ctx.interrupter();
    let host_err = |e: mlua::Error| ScriptError::Host(crate::script::describe(&e));

    let http = http::namespace(lua, caps.http.clone(), caps.runtime.clone(), interrupter.clone())
        .map_err(host_err)?;
    ctx.set_global("http", http)?;

    let log = log::namespace(lua, caps.logger.clone(), interrupter.clone()).map_err(host_err)?;
    ctx.set_global("log", log)?;

    let time = stdlib::time_namespace(lua, caps.runtime.clone(), interrupter.clone()).map_err(host_err)?;
    ctx.set_global("time", time)?;

    ctx.set_global("os", stdlib::os_namespace(lua, interrupter.clone()).map_err(host_err)?)?;

    let util = stdlib::do_namespace(lua, interrupter).map_err(host_err)?;
    ctx.set_global("do", util.clone())?;
    ctx.set_global("util", util)?;
    Ok(())
}

/// Install the `std` helper table (`std.time`, `std.os`, `std["do"]`) used by
/// configuration scripts.
pub fn install_std(ctx: &ExecutionContext, runtime: Handle) -> Result<(), ScriptError> {
    let lua = ctx.lua();
    let interrupter = ctx.interrupter();
    let build = || -> mlua::Result<Table> {
        let std = lua.create_table()?;
        std.set("time", stdlib::time_namespace(lua, runtime, interrupter.clone())?)?;
        std.set("os", stdlib::os_namespace(lua, interrupter.clone())?)?;
        std.set("do", stdlib::do_namespace(lua, interrupter.clone())?)?;
        Ok(std)
    };
    let std = build().map_err(|e| ScriptError::Host(crate::script::describe(&e)))?;
    ctx.set_global("std", std)
}

/// Build a namespace table from named native functions.
fn build_namespace(lua: &Lua, methods: Vec<(&str, Function)>) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for (name, method) in methods {
        table.set(name, method)?;
    }
    Ok(table)
}

/// Wrap a native so that it first honours a pending interrupt.
fn native<F>(lua: &Lua, interrupter: &Interrupter, f: F) -> mlua::Result<Function>
where
    F: Fn(&Lua, Variadic<Value>) -> mlua::Result<Value> + Send + 'static,
{
    let interrupter = interrupter.clone();
    lua.create_function(move |lua, args: Variadic<Value>| {
        interrupter.check()?;
        f(lua, args)
    })
}

/// Positional argument, `nil` when absent.
fn arg(args: &Variadic<Value>, index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Nil)
}

/// Drive `fut` to completion on `runtime`, giving up as soon as the run is
/// interrupted. Called from the script's blocking thread.
fn wait<T, F>(runtime: &Handle, interrupter: &Interrupter, what: &str, fut: F) -> mlua::Result<T>
where
    F: Future<Output = mlua::Result<T>>,
{
    interrupter.check()?;
    runtime.block_on(async {
        tokio::select! {
            _ = interrupter.token().cancelled() => convert::throw(format!(
                "{what} interrupted: {}",
                interrupter.reason().unwrap_or("run cancelled")
            )),
            result = fut => result,
        }
    })
}
