//! Embedded script host.
//!
//! A [`ScriptHost`] holds the base bindings every run starts from. Each run
//! gets its own [`ExecutionContext`] (a fresh, sandboxed Lua state with those
//! bindings replayed into it), so nothing a script does leaks into the base
//! or into a concurrently running sibling.
//!
//! Scripts are compiled once into a [`CompiledScript`] and may then be
//! executed in any number of contexts.

pub mod convert;
pub mod duration;
mod interrupt;
mod value;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use mlua::{FromLua, HookTriggers, IntoLua, Lua, LuaOptions, StdLib, Value, Variadic, VmState};
use thiserror::Error;

pub use self::interrupt::Interrupter;
pub use self::value::HostValue;

/// How often (in VM instructions) a running script polls for interrupts.
const INTERRUPT_CHECK_INSTRUCTIONS: u32 = 1000;

/// Base-library globals that reach the filesystem.
const REMOVED_GLOBALS: &[&str] = &["dofile", "loadfile"];

/// Replaces the error-catching primitives with versions that re-raise once an
/// interrupt is delivered, so a script can't `pcall` its way past one. The
/// originals stay reachable only as upvalues of the wrappers.
const PROTECTED_CALL_GUARD: &str = r#"
local guard = ...
local raw_pcall, raw_xpcall = pcall, xpcall
local raw_resume, raw_wrap = coroutine.resume, coroutine.wrap

local function settle(...)
    guard()
    return ...
end

pcall = function(...) return settle(raw_pcall(...)) end
xpcall = function(...) return settle(raw_xpcall(...)) end
coroutine.resume = function(...) return settle(raw_resume(...)) end
coroutine.wrap = function(f)
    local step = raw_wrap(f)
    return function(...) return settle(step(...)) end
end
"#;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScriptError {
    #[error("can't compile {name:?}: {message}")]
    Compile { name: String, message: String },

    #[error("{0}")]
    Runtime(String),

    #[error("{0}")]
    Interrupted(String),

    #[error("can't marshal value: {0}")]
    Marshal(String),

    #[error("script host: {0}")]
    Host(String),
}

impl ScriptError {
    fn host(err: mlua::Error) -> Self {
        ScriptError::Host(describe(&err))
    }
}

/// Human-readable description of a script error, without the Lua traceback
/// and wrapper noise that `mlua` adds around errors raised by native calls.
pub fn describe(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => describe(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::ExternalError(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

/// A native function callable from scripts.
pub type NativeFn = Arc<dyn Fn(&Lua, Variadic<Value>) -> mlua::Result<Value> + Send + Sync>;

/// A named binding installed into an execution context.
#[derive(Clone)]
pub enum Binding {
    Value(HostValue),
    Native(NativeFn),
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Binding::Native(_) => f.write_str("Native(..)"),
        }
    }
}

impl From<HostValue> for Binding {
    fn from(v: HostValue) -> Self {
        Binding::Value(v)
    }
}

/// Script source that has passed syntax checking and can be run repeatedly.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    name: Arc<str>,
    source: Arc<str>,
}

impl CompiledScript {
    /// Parse `source` once, reporting syntax errors against `name`.
    pub fn compile(name: &str, source: &str) -> Result<Self, ScriptError> {
        let lua = Lua::new_with(StdLib::NONE, LuaOptions::default()).map_err(ScriptError::host)?;
        lua.load(source)
            .set_name(name)
            .into_function()
            .map_err(|e| ScriptError::Compile {
                name: name.to_string(),
                message: describe(&e),
            })?;
        Ok(Self {
            name: Arc::from(name),
            source: Arc::from(source),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Base configuration that execution contexts are derived from.
#[derive(Debug, Clone, Default)]
pub struct ScriptHost {
    bindings: BTreeMap<String, Binding>,
}

impl ScriptHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a base binding; contexts derived afterwards see it.
    pub fn bind(&mut self, name: impl Into<String>, binding: impl Into<Binding>) {
        self.bindings.insert(name.into(), binding.into());
    }

    pub fn bind_native<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Lua, Variadic<Value>) -> mlua::Result<Value> + Send + Sync + 'static,
    {
        self.bind(name, Binding::Native(Arc::new(f)));
    }

    pub fn compile(&self, name: &str, source: &str) -> Result<CompiledScript, ScriptError> {
        CompiledScript::compile(name, source)
    }

    /// Create an isolated context starting from the current base bindings.
    pub fn derive(&self) -> Result<ExecutionContext, ScriptError> {
        let ctx = ExecutionContext::sandboxed()?;
        for (name, binding) in &self.bindings {
            ctx.bind(name, binding.clone())?;
        }
        Ok(ctx)
    }
}

/// One sandboxed script state, used for a single run and then dropped.
pub struct ExecutionContext {
    lua: Lua,
    interrupter: Interrupter,
}

impl ExecutionContext {
    fn sandboxed() -> Result<Self, ScriptError> {
        let libs = StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
        let lua = Lua::new_with(libs, LuaOptions::default()).map_err(ScriptError::host)?;

        let globals = lua.globals();
        for name in REMOVED_GLOBALS {
            globals.set(*name, Value::Nil).map_err(ScriptError::host)?;
        }

        let interrupter = Interrupter::new();
        let guarded = interrupter.clone();
        let guard = lua
            .create_function(move |_, ()| guarded.check())
            .map_err(ScriptError::host)?;
        lua.load(PROTECTED_CALL_GUARD)
            .set_name("=sandbox")
            .call::<()>(guard)
            .map_err(ScriptError::host)?;

        let watched = interrupter.clone();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(INTERRUPT_CHECK_INSTRUCTIONS),
            move |_lua, _debug| match watched.reason() {
                Some(reason) => Err(mlua::Error::runtime(reason)),
                None => Ok(VmState::Continue),
            },
        );

        Ok(Self { lua, interrupter })
    }

    pub fn bind(&self, name: &str, binding: Binding) -> Result<(), ScriptError> {
        match binding {
            Binding::Value(value) => self.set_global(name, value),
            Binding::Native(f) => {
                let func = self
                    .lua
                    .create_function(move |lua, args: Variadic<Value>| f(lua, args))
                    .map_err(ScriptError::host)?;
                self.set_global(name, func)
            }
        }
    }

    pub fn bind_native<F>(&self, name: &str, f: F) -> Result<(), ScriptError>
    where
        F: Fn(&Lua, Variadic<Value>) -> mlua::Result<Value> + Send + Sync + 'static,
    {
        self.bind(name, Binding::Native(Arc::new(f)))
    }

    /// Install any Lua value (typically a namespace table) as a global.
    pub fn set_global(&self, name: &str, value: impl IntoLua) -> Result<(), ScriptError> {
        self.lua.globals().set(name, value).map_err(ScriptError::host)
    }

    /// Read a global back out of the context.
    pub fn global(&self, name: &str) -> Result<HostValue, ScriptError> {
        let value = self
            .lua
            .globals()
            .get::<Value>(name)
            .map_err(ScriptError::host)?;
        HostValue::from_lua(value, &self.lua).map_err(|e| ScriptError::Marshal(describe(&e)))
    }

    /// The underlying state, for building native namespaces.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Run `script` to completion on the calling thread.
    ///
    /// If an interrupt was delivered at any point, the result is
    /// [`ScriptError::Interrupted`] with its reason, even when the script
    /// caught the raised error itself.
    pub fn execute(&self, script: &CompiledScript) -> Result<HostValue, ScriptError> {
        let result = match self.interrupter.check() {
            Ok(()) => self
                .lua
                .load(script.source())
                .set_name(script.name())
                .call::<Value>(()),
            Err(e) => Err(e),
        };
        self.interrupter.finish();

        if let Some(reason) = self.interrupter.reason() {
            return Err(ScriptError::Interrupted(reason.to_string()));
        }
        let value = result.map_err(|e| ScriptError::Runtime(describe(&e)))?;
        HostValue::from_lua(value, &self.lua).map_err(|e| ScriptError::Marshal(describe(&e)))
    }
}
