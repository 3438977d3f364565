//! Request-scoped accessors: `lunet.req.*`.
//!
//! Only invocations submitted with a [`RequestContext`] have a request; the
//! accessors raise `no request found` everywhere else, including timers.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use mlua::prelude::*;

use crate::lua::batch::LuaBatch;
use crate::lua::state::Bindings;

/// The request an invocation is serving.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// HTTP method, e.g. `GET`.
    pub method: String,
    /// Request target including the query string.
    pub uri: String,
    /// Header pairs in arrival order. Names are matched case-insensitively.
    pub headers: Vec<(String, String)>,
    /// Raw request body.
    pub body: Bytes,
}

impl RequestContext {
    /// A bodiless request with no headers.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Encode the headers as one table keyed by lowercased name. A repeated
    /// header becomes an array of its values in arrival order.
    pub(crate) fn headers_batch(&self) -> LuaBatch {
        let mut grouped: Vec<(String, Vec<&str>)> = Vec::new();
        for (name, value) in &self.headers {
            let name = name.to_ascii_lowercase();
            match grouped.iter_mut().find(|(n, _)| *n == name) {
                Some((_, values)) => values.push(value.as_str()),
                None => grouped.push((name, vec![value.as_str()])),
            }
        }

        let mut batch = LuaBatch::new();
        batch.table_sized(0, u32::try_from(grouped.len()).unwrap_or(u32::MAX));
        for (name, values) in grouped {
            batch.string(name);
            if let [single] = values.as_slice() {
                batch.string(Bytes::copy_from_slice(single.as_bytes()));
            } else {
                batch.table_sized(u32::try_from(values.len()).unwrap_or(u32::MAX), 0);
                for (i, value) in (1u32..).zip(values) {
                    batch
                        .string(Bytes::copy_from_slice(value.as_bytes()))
                        .set_index(i);
                }
            }
            batch.set();
        }
        batch
    }
}

fn current(bindings: &Bindings) -> LuaResult<Arc<RequestContext>> {
    bindings
        .current_request()
        .ok_or_else(|| LuaError::runtime("no request found"))
}

pub(crate) fn register(lua: &Lua, raw: &LuaTable, bindings: &Bindings) -> Result<()> {
    let req = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create req table: {e}"))?;

    let b = bindings.clone();
    let get_method = lua
        .create_function(move |_, ()| Ok(current(&b)?.method.clone()))
        .map_err(|e| anyhow!("Failed to create req.get_method function: {e}"))?;

    let b = bindings.clone();
    let get_uri = lua
        .create_function(move |_, ()| Ok(current(&b)?.uri.clone()))
        .map_err(|e| anyhow!("Failed to create req.get_uri function: {e}"))?;

    let b = bindings.clone();
    let get_headers = lua
        .create_function(move |lua, ()| {
            let mut values = current(&b)?.headers_batch().execute(lua)?;
            Ok(values.pop().unwrap_or(LuaValue::Nil))
        })
        .map_err(|e| anyhow!("Failed to create req.get_headers function: {e}"))?;

    let b = bindings.clone();
    let get_body_data = lua
        .create_function(move |lua, ()| {
            let request = current(&b)?;
            if request.body.is_empty() {
                return Ok(LuaValue::Nil);
            }
            Ok(LuaValue::String(lua.create_string(&request.body)?))
        })
        .map_err(|e| anyhow!("Failed to create req.get_body_data function: {e}"))?;

    for (name, function) in [
        ("get_method", get_method),
        ("get_uri", get_uri),
        ("get_headers", get_headers),
        ("get_body_data", get_body_data),
    ] {
        req.set(name, function)
            .map_err(|e| anyhow!("Failed to set req.{name}: {e}"))?;
    }
    raw.set("req", req)
        .map_err(|e| anyhow!("Failed to register req table: {e}"))?;
    Ok(())
}
