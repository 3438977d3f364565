//! `print` and `say`: write flattened arguments to the current output sink.

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use super::flatten_args;
use crate::lua::bridge;
use crate::lua::state::Bindings;

pub(crate) fn register(lua: &Lua, raw: &LuaTable, bindings: &Bindings) -> Result<()> {
    for (name, newline) in [("print", false), ("say", true)] {
        let b = bindings.clone();
        let write = lua
            .create_function(move |lua, args: LuaMultiValue| {
                let mut data = flatten_args(&args).map_err(LuaError::runtime)?;
                if newline {
                    data.push(b'\n');
                }
                match b.output().write_bytes(&data) {
                    Ok(()) => Ok(LuaMultiValue::from_vec(vec![LuaValue::Integer(1)])),
                    Err(e) => bridge::failure(lua, e.to_string()),
                }
            })
            .map_err(|e| anyhow!("Failed to create {name} function: {e}"))?;
        raw.set(name, write)
            .map_err(|e| anyhow!("Failed to set {name}: {e}"))?;
    }
    Ok(())
}
