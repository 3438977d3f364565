//! Native functions behind the `lunet` script table.
//!
//! Each submodule registers its functions into a private `raw` table. The
//! prelude (`prelude.lua`) then assembles the public `lunet` table from it,
//! adding the yield handling that natives cannot do themselves.
//!
//! # Conventions
//!
//! - Expected failures return `nil, "message"`; argument type errors raise.
//! - Natives that wait return the suspend marker through
//!   [`bridge::suspend`](super::bridge::suspend) and are wrapped with `await`
//!   in the prelude.
//! - Async completions that touch resource state go through
//!   `ResumeHandle::resume_with` so the state change happens on the loop.

pub(crate) mod control;
pub(crate) mod log;
pub(crate) mod output;
pub(crate) mod request;
pub(crate) mod resolve;
pub(crate) mod tcp;
pub(crate) mod timer;
pub(crate) mod udp;

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use super::bridge;
use super::state::Bindings;

const PRELUDE: &str = include_str!("../prelude.lua");

/// Install every native and build the `lunet` table. Returns the table.
pub(crate) fn register_all(lua: &Lua, bindings: &Bindings) -> Result<LuaTable> {
    let raw = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create native table: {e}"))?;

    raw.set("version", env!("CARGO_PKG_VERSION"))
        .map_err(|e| anyhow!("Failed to set version: {e}"))?;
    output::register(lua, &raw, bindings)?;
    control::register(lua, &raw, bindings)?;
    timer::register(lua, &raw, bindings)?;
    log::register(lua, &raw)?;
    request::register(lua, &raw, bindings)?;
    resolve::register(lua, &raw, bindings)?;
    tcp::register(lua, &raw, bindings)?;
    udp::register(lua, &raw, bindings)?;

    let script: LuaTable = lua
        .load(PRELUDE)
        .set_name("=lunet.prelude")
        .call((raw, bridge::suspend_marker(), bridge::exit_marker()))
        .map_err(|e| anyhow!("Failed to run prelude: {e}"))?;

    let globals = lua.globals();
    globals
        .set("lunet", script.clone())
        .map_err(|e| anyhow!("Failed to set lunet global: {e}"))?;
    if bindings.shared.config.ngx_alias {
        globals
            .set("ngx", script.clone())
            .map_err(|e| anyhow!("Failed to set ngx global: {e}"))?;
    }

    Ok(script)
}

/// Flatten a printable value into `buf`.
///
/// Strings, numbers, booleans and nil print as themselves; array tables are
/// flattened recursively, and inside them only strings, numbers and nested
/// arrays are accepted.
pub(crate) fn append_value(
    value: &LuaValue,
    buf: &mut Vec<u8>,
    in_array: bool,
) -> Result<(), String> {
    match value {
        LuaValue::String(s) => buf.extend_from_slice(&s.as_bytes()),
        LuaValue::Integer(i) => buf.extend_from_slice(i.to_string().as_bytes()),
        LuaValue::Number(n) => append_number(*n, buf),
        LuaValue::Boolean(b) if !in_array => {
            buf.extend_from_slice(if *b { b"true" } else { b"false" });
        }
        LuaValue::Nil if !in_array => buf.extend_from_slice(b"nil"),
        LuaValue::Table(table) => {
            for i in 1..=table.raw_len() {
                let item: LuaValue = table.raw_get(i).map_err(|e| e.to_string())?;
                append_value(&item, buf, true)?;
            }
        }
        other if in_array => {
            return Err(format!(
                "bad data type {} in the array",
                other.type_name()
            ));
        }
        other => {
            return Err(format!(
                "string, number, boolean, nil, or array table expected, got {}",
                other.type_name()
            ))
        }
    }
    Ok(())
}

/// Whole floats print without a fractional part.
fn append_number(n: f64, buf: &mut Vec<u8>) {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        buf.extend_from_slice((n as i64).to_string().as_bytes());
    } else {
        buf.extend_from_slice(n.to_string().as_bytes());
    }
}

/// Flatten every argument, for `print`/`say`/`send`.
pub(crate) fn flatten_args(args: &LuaMultiValue) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    for value in args.iter() {
        append_value(value, &mut buf, false)?;
    }
    Ok(buf)
}

/// Absolute deadline for a whole socket operation, spanning every read or
/// write it performs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<tokio::time::Instant>);

impl Deadline {
    pub fn after(limit: Option<std::time::Duration>) -> Self {
        // A limit too far out to represent is no limit at all.
        Self(limit.and_then(|d| tokio::time::Instant::now().checked_add(d)))
    }

    pub async fn run<T>(
        self,
        fut: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> std::io::Result<T> {
        match self.0 {
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .unwrap_or_else(|_elapsed| Err(std::io::ErrorKind::TimedOut.into())),
            None => fut.await,
        }
    }
}

/// Script-facing message for a socket I/O error.
pub(crate) fn describe_io_error(err: &std::io::Error) -> String {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => "timeout".to_string(),
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => "closed".to_string(),
        ErrorKind::ConnectionRefused => "connection refused".to_string(),
        _ => err.to_string(),
    }
}

/// Read an optional timeout in milliseconds. `nil`, zero, negative and
/// unrepresentably large values mean no timeout.
pub(crate) fn timeout_arg(value: Option<f64>) -> Option<std::time::Duration> {
    value
        .filter(|ms| *ms > 0.0)
        .and_then(|ms| std::time::Duration::try_from_secs_f64(ms / 1000.0).ok())
}

/// Validate a port argument. Accepts integers and integral floats in 1..=65535.
pub(crate) fn port_arg(value: Option<&LuaValue>) -> Result<u16, &'static str> {
    let port = match value {
        Some(LuaValue::Integer(i)) => *i,
        Some(LuaValue::Number(n)) if n.fract() == 0.0 => *n as i64,
        Some(LuaValue::Nil) | None => return Err("missing port"),
        Some(_) => return Err("invalid port"),
    };
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or("invalid port")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(lua: &Lua, code: &str) -> Result<Vec<u8>, String> {
        let args: LuaMultiValue = lua.load(code).eval().expect("eval args");
        flatten_args(&args)
    }

    #[test]
    fn test_flatten_scalars() {
        let lua = Lua::new();
        assert_eq!(
            flatten(&lua, r#"return "a", 1, 2.0, 2.5, true, nil"#).expect("flatten"),
            b"a122.5truenil".to_vec()
        );
    }

    #[test]
    fn test_flatten_nested_arrays() {
        let lua = Lua::new();
        assert_eq!(
            flatten(&lua, r#"return {"x", {"y", 1}, "z"}"#).expect("flatten"),
            b"xy1z".to_vec()
        );
    }

    #[test]
    fn test_flatten_rejects_functions_and_array_booleans() {
        let lua = Lua::new();
        let err = flatten(&lua, "return print").expect_err("function is not printable");
        assert!(err.contains("got function"), "{err}");

        let err = flatten(&lua, "return {true}").expect_err("boolean inside array");
        assert!(err.contains("bad data type boolean"), "{err}");
    }

    #[test]
    fn test_port_arg_bounds() {
        assert_eq!(port_arg(Some(&LuaValue::Integer(80))), Ok(80));
        assert_eq!(port_arg(Some(&LuaValue::Number(443.0))), Ok(443));
        assert_eq!(port_arg(Some(&LuaValue::Integer(0))), Err("invalid port"));
        assert_eq!(port_arg(Some(&LuaValue::Integer(65536))), Err("invalid port"));
        assert_eq!(port_arg(None), Err("missing port"));
    }

    #[test]
    fn test_describe_io_error() {
        use std::io::{Error, ErrorKind};
        assert_eq!(describe_io_error(&Error::from(ErrorKind::TimedOut)), "timeout");
        assert_eq!(describe_io_error(&Error::from(ErrorKind::ConnectionReset)), "closed");
        assert_eq!(
            describe_io_error(&Error::from(ErrorKind::ConnectionRefused)),
            "connection refused"
        );
    }

    #[tokio::test]
    async fn test_deadline_times_out_pending_future() {
        let deadline = Deadline::after(Some(std::time::Duration::from_millis(10)));
        let result: std::io::Result<()> = deadline.run(std::future::pending()).await;
        assert_eq!(
            result.expect_err("pending future must time out").kind(),
            std::io::ErrorKind::TimedOut
        );
    }

    #[test]
    fn test_timeout_arg() {
        assert_eq!(timeout_arg(None), None);
        assert_eq!(timeout_arg(Some(0.0)), None);
        assert_eq!(timeout_arg(Some(-5.0)), None);
        assert_eq!(
            timeout_arg(Some(1500.0)),
            Some(std::time::Duration::from_millis(1500))
        );
        assert_eq!(timeout_arg(Some(1e300)), None);
        assert_eq!(timeout_arg(Some(f64::INFINITY)), None);
        assert_eq!(timeout_arg(Some(f64::NAN)), None);
    }

    #[tokio::test]
    async fn test_deadline_beyond_clock_range_never_fires() {
        let deadline = Deadline::after(Some(std::time::Duration::MAX));
        let result = deadline.run(async { Ok(7) }).await;
        assert_eq!(result.expect("no deadline"), 7);
    }
}
