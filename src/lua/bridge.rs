//! Bridge between yielding natives and async tasks.
//!
//! A native that has to wait (sleep, connect, receive, resolve) captures a
//! [`ResumeHandle`] for the current coroutine, spawns its work on the tokio
//! runtime with [`suspend`], and returns the `SUSPEND` marker. The Lua prelude
//! turns that marker into a yield all the way up to the event loop, which
//! leaves the coroutine `Yielded`. When the task finishes it posts
//! [`Event::ResumeThread`] through the handle, and the loop resumes the
//! coroutine with the task's values.
//!
//! The markers are light userdata pointing at private statics, so no script
//! value can ever compare equal to them.

use std::future::Future;

use mlua::prelude::*;

use super::affinity::Resources;
use super::coroutine::CoroutineId;
use super::events::{Event, EventSender, ResumeValue};
use super::state::Bindings;

static SUSPEND_MARK: u8 = 1;
static EXIT_MARK: u8 = 2;

/// Message returned when a yielding native is called outside any coroutine.
pub(crate) const NO_CONTEXT: &str = "no coroutine context";

fn marker(mark: &'static u8) -> LuaValue {
    LuaValue::LightUserData(LuaLightUserData(std::ptr::from_ref(mark).cast_mut().cast()))
}

/// Yielded by a coroutine waiting for a [`ResumeHandle`].
pub(crate) fn suspend_marker() -> LuaValue {
    marker(&SUSPEND_MARK)
}

/// Yielded by a coroutine that called `lunet.exit`.
pub(crate) fn exit_marker() -> LuaValue {
    marker(&EXIT_MARK)
}

pub(crate) fn is_suspend(value: &LuaValue) -> bool {
    *value == suspend_marker()
}

pub(crate) fn is_exit(value: &LuaValue) -> bool {
    *value == exit_marker()
}

/// Posts the resume of one suspended coroutine. Consumed on use, so a
/// suspension is resumed at most once.
#[derive(Debug)]
pub struct ResumeHandle {
    coroutine: CoroutineId,
    suspension: u64,
    events: EventSender,
}

impl ResumeHandle {
    pub(crate) fn new(coroutine: CoroutineId, suspension: u64, events: EventSender) -> Self {
        Self {
            coroutine,
            suspension,
            events,
        }
    }

    /// The suspended coroutine this handle resumes.
    #[must_use]
    pub fn coroutine(&self) -> CoroutineId {
        self.coroutine
    }

    /// Resume with `values` as the results of the suspended call.
    pub fn resume(self, values: Vec<ResumeValue>) {
        self.post(values, None);
    }

    /// Resume after `commit` has run on the event loop. `commit` may rewrite
    /// the values, e.g. to report `closed` for a resource that went stale.
    pub(crate) fn resume_with(
        self,
        values: Vec<ResumeValue>,
        commit: impl FnOnce(&mut Resources, &mut Vec<ResumeValue>) + Send + 'static,
    ) {
        self.post(values, Some(Box::new(commit)));
    }

    fn post(self, values: Vec<ResumeValue>, on_resume: Option<super::events::OnResume>) {
        let event = Event::ResumeThread {
            coroutine: self.coroutine,
            suspension: self.suspension,
            values,
            on_resume,
        };
        if self.events.send(event).is_err() {
            log::debug!(
                "[bridge] Event loop gone, dropping resume for {}",
                self.coroutine
            );
        }
    }
}

/// Spawn `task` and return the marker that suspends the calling coroutine.
pub(crate) fn suspend<F>(bindings: &Bindings, task: F) -> LuaResult<LuaMultiValue>
where
    F: Future<Output = ()> + Send + 'static,
{
    bindings.shared.runtime.spawn(task);
    Ok(LuaMultiValue::from_vec(vec![suspend_marker()]))
}

/// The conventional `nil, message` failure return.
pub(crate) fn failure(lua: &Lua, message: impl AsRef<str>) -> LuaResult<LuaMultiValue> {
    Ok(LuaMultiValue::from_vec(vec![
        LuaValue::Nil,
        LuaValue::String(lua.create_string(message.as_ref())?),
    ]))
}

/// Values for an operation whose resource was closed or replaced meanwhile.
pub(crate) fn closed_values() -> Vec<ResumeValue> {
    vec![ResumeValue::Nil, ResumeValue::from("closed")]
}
