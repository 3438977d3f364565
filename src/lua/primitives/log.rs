//! `lunet.log.*`: script logging through the `log` crate.
//!
//! ```lua
//! lunet.log.info("listening on ", port)
//! lunet.log.debug("payload: ", { "a", "b" })
//! ```
//!
//! Arguments are flattened like `print`. Records use the `lua` target, so
//! `RUST_LOG=lua=debug` controls script output independently of the runtime.

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use super::flatten_args;

pub(crate) fn register(lua: &Lua, raw: &LuaTable) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    let levels = [
        ("debug", log::Level::Debug),
        ("info", log::Level::Info),
        ("warn", log::Level::Warn),
        ("error", log::Level::Error),
    ];
    for (name, level) in levels {
        let log_fn = lua
            .create_function(move |_, args: LuaMultiValue| {
                let message = flatten_args(&args).map_err(LuaError::runtime)?;
                log::log!(target: "lua", level, "{}", String::from_utf8_lossy(&message));
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create log.{name} function: {e}"))?;
        log_table
            .set(name, log_fn)
            .map_err(|e| anyhow!("Failed to set log.{name}: {e}"))?;
    }

    raw.set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_functions_exist_and_accept_mixed_args() {
        let lua = Lua::new();
        let raw = lua.create_table().expect("raw table");
        register(&lua, &raw).expect("register log");
        lua.globals().set("raw", raw).expect("set raw");

        lua.load(
            r#"
            raw.log.debug("debug ", 1)
            raw.log.info("info")
            raw.log.warn("warn ", { "a", "b" })
            raw.log.error("error ", 2.5)
            "#,
        )
        .exec()
        .expect("log calls should succeed");
    }

    #[test]
    fn test_log_rejects_unprintable_values() {
        let lua = Lua::new();
        let raw = lua.create_table().expect("raw table");
        register(&lua, &raw).expect("register log");
        lua.globals().set("raw", raw).expect("set raw");

        assert!(lua.load("raw.log.info(function() end)").exec().is_err());
    }
}
