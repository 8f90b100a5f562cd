//! `http` namespace: one request primitive over the shared client.

use std::collections::BTreeMap;

use mlua::{IntoLua, Lua, Table};
use reqwest::{Client, Method};
use tokio::runtime::Handle;

use super::{arg, build_namespace, native, wait};
use crate::script::convert::{self, throw};
use crate::script::{describe, HostValue, Interrupter};

pub(super) fn namespace(
    lua: &Lua,
    client: Client,
    runtime: Handle,
    interrupter: Interrupter,
) -> mlua::Result<Table> {
    let scope = interrupter.clone();
    let do_request = native(lua, &interrupter, move |lua, args| {
        let method = convert::required_string(&arg(&args, 0))
            .or_else(|e| throw(format!("method: {}", describe(&e))))?;
        let url = convert::required_string(&arg(&args, 1))
            .or_else(|e| throw(format!("url: {}", describe(&e))))?;
        let headers = convert::string_map_slice(&arg(&args, 2))
            .or_else(|e| throw(format!("headers: {}", describe(&e))))?;
        let body = convert::string(&arg(&args, 3))?;

        perform(&client, &runtime, &scope, &method, &url, headers, body)?.into_lua(lua)
    })?;

    build_namespace(lua, vec![("do", do_request.clone()), ("request", do_request)])
}

fn perform(
    client: &Client,
    runtime: &Handle,
    interrupter: &Interrupter,
    method: &str,
    url: &str,
    headers: BTreeMap<String, Vec<String>>,
    body: String,
) -> mlua::Result<HostValue> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .or_else(|_| throw(format!("invalid HTTP method {method:?}")))?;

    let mut request = client.request(method, url).body(body);
    for (name, values) in &headers {
        for value in values {
            request = request.header(name.as_str(), value.as_str());
        }
    }

    wait(runtime, interrupter, "request", async move {
        let response = request.send().await.or_else(throw)?;
        let code = i64::from(response.status().as_u16());

        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(canonical_header(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let body = response.text().await.or_else(throw)?;

        Ok(HostValue::map([
            ("code", HostValue::Int(code)),
            (
                "headers",
                HostValue::map(headers.into_iter().map(|(k, v)| (k, HostValue::from(v)))),
            ),
            ("body", HostValue::String(body)),
        ]))
    })
}

/// `content-type` -> `Content-Type`, so scripts index headers the way they
/// are conventionally written.
fn canonical_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
