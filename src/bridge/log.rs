//! `log` namespace: structured logging from inside a check script.

use mlua::{FromLua, Lua, Table, Value, Variadic};
use serde_json::{Map, Value as JsonValue};
use tracing::Span;

use super::{arg, build_namespace, native};
use crate::script::convert::{self, throw};
use crate::script::{HostValue, Interrupter};

/// Logger handed to a script run.
///
/// Events are emitted inside `span` (which carries the test name and run
/// id), together with the fields accumulated through `log.kv`.
#[derive(Debug, Clone)]
pub struct ScriptLogger {
    span: Span,
    fields: Map<String, JsonValue>,
}

impl ScriptLogger {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            fields: Map::new(),
        }
    }

    pub fn with_fields(&self, extra: impl IntoIterator<Item = (String, JsonValue)>) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        Self {
            span: self.span.clone(),
            fields,
        }
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    pub fn info(&self, message: &str) {
        let kv = JsonValue::Object(self.fields.clone());
        tracing::info!(parent: &self.span, kv = %kv, "{message}");
    }

    pub fn error(&self, message: &str) {
        let kv = JsonValue::Object(self.fields.clone());
        tracing::error!(parent: &self.span, kv = %kv, "{message}");
    }
}

pub(super) fn namespace(lua: &Lua, logger: ScriptLogger, interrupter: Interrupter) -> mlua::Result<Table> {
    let info = {
        let logger = logger.clone();
        native(lua, &interrupter, move |_, args| {
            logger.info(&convert::string(&arg(&args, 0))?);
            Ok(Value::Nil)
        })?
    };

    let error = {
        let logger = logger.clone();
        native(lua, &interrupter, move |_, args| {
            logger.error(&convert::string(&arg(&args, 0))?);
            Ok(Value::Nil)
        })?
    };

    // Records the message, then raises it so the run ends as failed.
    let fail = {
        let logger = logger.clone();
        native(lua, &interrupter, move |_, args| {
            let message = convert::string(&arg(&args, 0))?;
            logger.error(&message);
            throw(message)
        })?
    };

    let kv = {
        let scope = interrupter.clone();
        native(lua, &interrupter, move |lua, args| {
            let child = logger.with_fields(kv_fields(lua, args)?);
            namespace(lua, child, scope.clone()).map(Value::Table)
        })?
    };

    build_namespace(
        lua,
        vec![("info", info), ("error", error), ("fail", fail), ("kv", kv)],
    )
}

/// Fields for `log.kv`: either one object, or alternating key/value pairs.
fn kv_fields(lua: &Lua, args: Variadic<Value>) -> mlua::Result<Vec<(String, JsonValue)>> {
    let to_json = |value: Value| -> mlua::Result<JsonValue> {
        Ok(HostValue::from_lua(value, lua)?.into())
    };

    match args.first() {
        Some(Value::Table(table)) if args.len() == 1 => {
            let mut fields = Vec::new();
            for pair in table.clone().pairs::<Value, Value>() {
                let (k, v) = pair?;
                fields.push((convert::string(&k)?, to_json(v)?));
            }
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(fields)
        }
        _ if args.len() % 2 == 0 => args
            .chunks(2)
            .map(|pair| Ok((convert::string(&pair[0])?, to_json(pair[1].clone())?)))
            .collect(),
        _ => throw("invalid call to log.kv"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptHost;

    fn logger_ctx() -> crate::script::ExecutionContext {
        let host = ScriptHost::new();
        let ctx = host.derive().unwrap();
        let logger = ScriptLogger::new(tracing::info_span!("test_run"));
        let table = namespace(ctx.lua(), logger, ctx.interrupter()).unwrap();
        ctx.set_global("log", table).unwrap();
        ctx
    }

    #[test]
    fn test_fail_raises_its_message() {
        let ctx = logger_ctx();
        let script = crate::script::CompiledScript::compile("boom", "log.fail('nope')").unwrap();
        let err = ctx.execute(&script).unwrap_err();
        assert!(err.to_string().contains("nope"), "{err}");
    }

    #[test]
    fn test_kv_chains_and_accepts_both_forms() {
        let ctx = logger_ctx();
        let script = crate::script::CompiledScript::compile(
            "kv",
            r#"
            local a = log.kv({ region = "eu", attempt = 2 })
            local b = a.kv("target", "api", "ok", true)
            b.info("checked")
            return type(b.info)
            "#,
        )
        .unwrap();
        assert_eq!(ctx.execute(&script).unwrap(), HostValue::from("function"));
    }

    #[test]
    fn test_kv_rejects_odd_arguments() {
        let ctx = logger_ctx();
        let script =
            crate::script::CompiledScript::compile("odd", "log.kv('a', 1, 'b')").unwrap();
        let err = ctx.execute(&script).unwrap_err();
        assert!(err.to_string().contains("invalid call to log.kv"), "{err}");
    }

    #[test]
    fn test_kv_rejects_self_referencing_values() {
        let ctx = logger_ctx();
        let script = crate::script::CompiledScript::compile(
            "cycle",
            "local t = {} t.self = t log.kv({ a = t })",
        )
        .unwrap();
        let err = ctx.execute(&script).unwrap_err();
        assert!(err.to_string().contains("contains itself"), "{err}");
    }

    #[test]
    fn test_with_fields_accumulates() {
        let logger = ScriptLogger::new(Span::none())
            .with_fields([("a".to_string(), JsonValue::from(1))])
            .with_fields([("b".to_string(), JsonValue::from("x"))]);
        assert_eq!(logger.fields().len(), 2);
        assert_eq!(logger.fields()["b"], JsonValue::from("x"));
    }
}
