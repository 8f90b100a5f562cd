//! Interpreter for the configuration DSL (`settings`, `register_test`, `file`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::{CanaryConfig, TestDefinition};
use crate::bridge;
use crate::script::convert::{self, throw, ObjectReader};
use crate::script::{CompiledScript, ScriptError, ScriptHost};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("can't prepare config context: {0}")]
    Host(#[from] ScriptError),

    #[error("can't apply configuration: {0}")]
    Apply(String),
}

#[derive(Default)]
struct LoadState {
    canary: Option<CanaryConfig>,
    tests: Vec<TestDefinition>,
    names: HashSet<String>,
}

type SharedState = Arc<Mutex<LoadState>>;

/// Runs a configuration script once, in its own context derived from the
/// base host, and collects what it declared.
///
/// Interpretation blocks the calling thread (the script may call
/// `std.time.sleep`), so call it from a blocking task or a plain thread.
#[derive(Debug, Clone)]
pub struct ConfigInterpreter {
    root: PathBuf,
    runtime: Handle,
}

impl ConfigInterpreter {
    /// `root` is the directory `file(...)` paths are resolved against.
    pub fn new(root: impl Into<PathBuf>, runtime: Handle) -> Self {
        Self {
            root: root.into(),
            runtime,
        }
    }

    /// Read and interpret the script at `path` (relative to the root).
    pub fn load(
        &self,
        host: &ScriptHost,
        path: impl AsRef<Path>,
    ) -> Result<(CanaryConfig, Vec<TestDefinition>), ConfigError> {
        let path = self.root.join(path);
        let source = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let name = path.display().to_string();
        self.interpret(host, &name, &source)
    }

    /// Interpret configuration `source`. Calls take effect in program order.
    pub fn interpret(
        &self,
        host: &ScriptHost,
        name: &str,
        source: &str,
    ) -> Result<(CanaryConfig, Vec<TestDefinition>), ConfigError> {
        let state = SharedState::default();

        let ctx = host.derive()?;
        ctx.bind_native("settings", settings(state.clone()))?;
        ctx.bind_native("register_test", register_test(state.clone()))?;
        ctx.bind_native("file", file(self.root.clone()))?;
        bridge::install_std(&ctx, self.runtime.clone())?;

        let script = CompiledScript::compile(name, source).map_err(|e| ConfigError::Apply(e.to_string()))?;
        ctx.execute(&script).map_err(|e| ConfigError::Apply(e.to_string()))?;
        drop(ctx);

        let mut state = state
            .lock()
            .map_err(|_| ConfigError::Apply("config state poisoned".to_string()))?;
        let state = std::mem::take(&mut *state);
        let canary = state.canary.unwrap_or_default();

        info!(canary = %canary.name, tests = state.tests.len(), "configuration loaded");
        Ok((canary, state.tests))
    }
}

fn settings(state: SharedState) -> impl Fn(&mlua::Lua, mlua::Variadic<Value>) -> mlua::Result<Value> + Send + Sync {
    move |_, args| {
        let options = ObjectReader::new(first(&args))
            .or_else(|e| throw(format!("settings: {}", crate::script::describe(&e))))?;
        let name = options.field("name", convert::string)?;

        let mut state = lock(&state)?;
        state.canary = Some(CanaryConfig { name });
        Ok(Value::Nil)
    }
}

fn register_test(state: SharedState) -> impl Fn(&mlua::Lua, mlua::Variadic<Value>) -> mlua::Result<Value> + Send + Sync {
    move |_, args| {
        let options = ObjectReader::new(first(&args))
            .or_else(|e| throw(format!("register_test: options {}", crate::script::describe(&e))))?;
        let name = options.field("name", convert::required_string)?;
        if name.is_empty() {
            return throw("register_test: test name must not be empty");
        }
        let frequency = options.field("frequency", positive_duration)?;
        let timeout = options.field("timeout", positive_duration)?;

        let source = convert::required_string(&args.get(1).cloned().unwrap_or(Value::Nil))
            .or_else(|_| throw(format!("register_test: test {name:?} needs a script source")))?;
        let body = CompiledScript::compile(&name, &source).or_else(throw)?;

        let mut state = lock(&state)?;
        if !state.names.insert(name.clone()) {
            return throw(format!("register_test: test {name:?} is already registered"));
        }
        debug!(test = %name, ?frequency, ?timeout, "test registered");
        state.tests.push(TestDefinition {
            name,
            frequency,
            timeout,
            body,
        });
        Ok(Value::Nil)
    }
}

fn file(root: PathBuf) -> impl Fn(&mlua::Lua, mlua::Variadic<Value>) -> mlua::Result<Value> + Send + Sync {
    move |lua, args| {
        let path = convert::required_string(&first(&args))
            .or_else(|e| throw(format!("file: path {}", crate::script::describe(&e))))?;
        let data = std::fs::read_to_string(root.join(&path))
            .or_else(|e| throw(format!("can't read {path:?}: {e}")))?;
        lua.create_string(data).map(Value::String)
    }
}

fn positive_duration(value: &Value) -> mlua::Result<Duration> {
    let duration = convert::duration(value)?;
    if duration.is_zero() {
        return throw("must be greater than zero");
    }
    Ok(duration)
}

fn first(args: &mlua::Variadic<Value>) -> Value {
    args.first().cloned().unwrap_or(Value::Nil)
}

fn lock(state: &SharedState) -> mlua::Result<std::sync::MutexGuard<'_, LoadState>> {
    state.lock().or_else(|_| throw("config state poisoned"))
}
