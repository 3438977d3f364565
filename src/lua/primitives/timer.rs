//! `lunet.timer.at` and timer introspection.
//!
//! ```lua
//! local ok, err = lunet.timer.at(0.5, function(premature, name)
//!     if premature then return end
//!     lunet.say("hello ", name)
//! end, "world")
//! ```
//!
//! The callback runs later in its own coroutine with phase `timer`, writing to
//! the instance's default output. It receives `premature = true` when the
//! timer was cancelled or the instance is shutting down.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use crate::lua::bridge;
use crate::lua::state::Bindings;
use crate::lua::timers::{self, TimerSlot};

pub(crate) fn register(lua: &Lua, raw: &LuaTable, bindings: &Bindings) -> Result<()> {
    let b = bindings.clone();
    let timer_at = lua
        .create_function(move |lua, args: LuaMultiValue| {
            let mut args = args.into_iter();
            let delay = match args.next() {
                Some(LuaValue::Integer(i)) => i as f64,
                Some(LuaValue::Number(n)) => n,
                _ => return bridge::failure(lua, "bad delay"),
            };
            let Ok(delay) = Duration::try_from_secs_f64(delay) else {
                return bridge::failure(lua, "bad delay");
            };
            let Some(LuaValue::Function(callback)) = args.next() else {
                return Err(LuaError::runtime("timer.at: callback must be a function"));
            };
            if b.shared.stopping.load(Ordering::Acquire) {
                return bridge::failure(lua, "process exiting");
            }

            let thread = lua.create_thread(callback)?;
            let timer = b.shared.timers.create(delay);
            b.state.borrow_mut().timer_slots.insert(
                timer.id(),
                TimerSlot {
                    thread,
                    args: args.collect(),
                },
            );
            b.shared.work.add();
            log::debug!("[timer] Scheduled {:?} in {delay:?}", timer.id());
            timers::arm(timer, b.shared.events.clone(), &b.shared.runtime);

            Ok(LuaMultiValue::from_vec(vec![LuaValue::Boolean(true)]))
        })
        .map_err(|e| anyhow!("Failed to create timer.at function: {e}"))?;

    let b = bindings.clone();
    let pending_count = lua
        .create_function(move |_, ()| Ok(b.shared.timers.len()))
        .map_err(|e| anyhow!("Failed to create pending_timer_count function: {e}"))?;

    let b = bindings.clone();
    let cancel_timers = lua
        .create_function(move |_, ()| {
            let cancelled = b.shared.timers.cancel_all();
            log::debug!("[timer] Cancelled {cancelled} pending timer(s) from script");
            Ok(cancelled)
        })
        .map_err(|e| anyhow!("Failed to create cancel_timers function: {e}"))?;

    raw.set("timer_at", timer_at)
        .map_err(|e| anyhow!("Failed to set timer_at: {e}"))?;
    raw.set("pending_timer_count", pending_count)
        .map_err(|e| anyhow!("Failed to set pending_timer_count: {e}"))?;
    raw.set("cancel_timers", cancel_timers)
        .map_err(|e| anyhow!("Failed to set cancel_timers: {e}"))?;

    Ok(())
}
