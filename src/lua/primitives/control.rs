//! Flow control natives: `sleep`, `exit`, `get_phase`.

use std::time::Duration;

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use crate::lua::bridge::{self, NO_CONTEXT};
use crate::lua::state::Bindings;

pub(crate) fn register(lua: &Lua, raw: &LuaTable, bindings: &Bindings) -> Result<()> {
    let b = bindings.clone();
    let sleep = lua
        .create_function(move |lua, args: LuaMultiValue| {
            if args.len() != 1 {
                return bridge::failure(lua, "expecting exactly one argument (seconds)");
            }
            let seconds = match args.iter().next() {
                Some(LuaValue::Integer(i)) => *i as f64,
                Some(LuaValue::Number(n)) => *n,
                _ => return bridge::failure(lua, "sleep argument must be a number"),
            };
            if seconds < 0.0 {
                return bridge::failure(lua, "sleep argument must be non-negative");
            }
            let Ok(delay) = Duration::try_from_secs_f64(seconds) else {
                return bridge::failure(lua, "sleep argument is out of range");
            };
            let Some(handle) = b.resume_handle() else {
                return bridge::failure(lua, NO_CONTEXT);
            };

            bridge::suspend(&b, async move {
                tokio::time::sleep(delay).await;
                handle.resume(Vec::new());
            })
        })
        .map_err(|e| anyhow!("Failed to create sleep function: {e}"))?;

    let b = bindings.clone();
    let exit = lua
        .create_function(move |_, code: Option<i64>| {
            b.with_current(|co| co.exit_code = Some(code.unwrap_or(0)))
                .ok_or_else(|| LuaError::runtime(format!("exit: {NO_CONTEXT}")))
        })
        .map_err(|e| anyhow!("Failed to create exit function: {e}"))?;

    let b = bindings.clone();
    let get_phase = lua
        .create_function(move |_, ()| {
            Ok(b.current_origin().map_or("init", |origin| origin.phase()))
        })
        .map_err(|e| anyhow!("Failed to create get_phase function: {e}"))?;

    raw.set("sleep", sleep)
        .map_err(|e| anyhow!("Failed to set sleep: {e}"))?;
    raw.set("exit", exit)
        .map_err(|e| anyhow!("Failed to set exit: {e}"))?;
    raw.set("get_phase", get_phase)
        .map_err(|e| anyhow!("Failed to set get_phase: {e}"))?;

    Ok(())
}
