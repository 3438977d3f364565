//! `lunet.resolve(host)`: asynchronous name resolution.
//!
//! Resumes with an array of unique address strings in resolver order, or
//! `nil, err`.

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use crate::lua::batch::LuaBatch;
use crate::lua::bridge::{self, NO_CONTEXT};
use crate::lua::events::ResumeValue;
use crate::lua::state::Bindings;

/// Encode addresses as an array table.
fn address_batch(addresses: &[String]) -> LuaBatch {
    let mut batch = LuaBatch::new();
    batch.table_sized(u32::try_from(addresses.len()).unwrap_or(u32::MAX), 0);
    for (i, address) in (1u32..).zip(addresses) {
        batch.string(address.clone()).set_index(i);
    }
    batch
}

pub(crate) fn register(lua: &Lua, raw: &LuaTable, bindings: &Bindings) -> Result<()> {
    let b = bindings.clone();
    let resolve = lua
        .create_function(move |lua, host: Option<String>| {
            let Some(host) = host.filter(|h| !h.is_empty()) else {
                return bridge::failure(lua, "host name expected");
            };
            let Some(handle) = b.resume_handle() else {
                return bridge::failure(lua, NO_CONTEXT);
            };

            bridge::suspend(&b, async move {
                match tokio::net::lookup_host((host.as_str(), 0)).await {
                    Ok(found) => {
                        let mut addresses: Vec<String> = Vec::new();
                        for addr in found {
                            let ip = addr.ip().to_string();
                            if !addresses.contains(&ip) {
                                addresses.push(ip);
                            }
                        }
                        log::debug!("[resolve] {host} -> {addresses:?}");
                        handle.resume(vec![ResumeValue::Batch(address_batch(&addresses))]);
                    }
                    Err(e) => {
                        handle.resume(vec![
                            ResumeValue::Nil,
                            ResumeValue::from(format!("failed to resolve {host}: {e}")),
                        ]);
                    }
                }
            })
        })
        .map_err(|e| anyhow!("Failed to create resolve function: {e}"))?;

    raw.set("resolve", resolve)
        .map_err(|e| anyhow!("Failed to set resolve: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_batch_builds_array() {
        let lua = Lua::new();
        let addresses = vec!["127.0.0.1".to_string(), "::1".to_string()];
        let mut values = address_batch(&addresses).execute(&lua).expect("execute");
        let Some(LuaValue::Table(table)) = values.pop() else {
            panic!("expected array table");
        };
        assert_eq!(table.raw_len(), 2);
        assert_eq!(table.get::<String>(2).expect("second"), "::1");
    }
}
