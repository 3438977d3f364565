//! Coroutine registry entries and the resume protocol.
//!
//! Every unit of script work (an invocation, a timer callback) runs in its own
//! Lua thread registered under a [`CoroutineId`]. [`resume`] is the single
//! place a registered thread is entered:
//!
//! 1. mark the coroutine `Running`, publish it as the current coroutine and
//!    point `lunet.ctx` at its context table
//! 2. resume the Lua thread
//! 3. clear `lunet.ctx` and the current coroutine, even if the resume errored
//! 4. classify the outcome into a [`Step`]
//!
//! Releasing a finished coroutine (registry removal, work accounting, reply)
//! belongs to the event loop; this module never removes entries.

use std::sync::Arc;

use mlua::prelude::*;

use super::bridge;
use super::events::ReplySender;
use super::output::OutputSink;
use super::primitives::request::RequestContext;
use super::state::Bindings;

/// Field of the script table holding the running coroutine's context table.
pub(crate) const CTX_FIELD: &str = "ctx";

/// Identifies a coroutine within one instance. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(pub(crate) u64);

impl std::fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "co#{}", self.0)
    }
}

/// Lifecycle of a registered coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Registered, not yet resumed.
    Created,
    /// Executing on the event loop.
    Running,
    /// Suspended waiting for an async operation to post a resume.
    Yielded,
    /// Finished, failed or exited. Never resumed again.
    Dead,
}

/// What started the coroutine. Determines `get_phase` and error routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// A submitted request.
    Invocation,
    /// A timer callback.
    Timer,
}

impl Origin {
    pub(crate) fn phase(self) -> &'static str {
        match self {
            Origin::Invocation => "content",
            Origin::Timer => "timer",
        }
    }
}

/// Registry entry for one Lua thread.
pub(crate) struct Coroutine {
    pub thread: LuaThread,
    pub status: CoroutineStatus,
    pub origin: Origin,
    /// Where the outcome goes once the coroutine is released.
    pub reply: Option<ReplySender>,
    /// Per-invocation output override. `None` writes to the instance default.
    pub output: Option<Arc<dyn OutputSink>>,
    pub request: Option<Arc<RequestContext>>,
    /// Exposed to scripts as `lunet.ctx` while this coroutine runs.
    pub ctx: LuaTable,
    /// Set by `lunet.exit` just before the thread yields for good.
    pub exit_code: Option<i64>,
    /// Sequence number of the latest [`ResumeHandle`](super::bridge::ResumeHandle)
    /// handed out. Only that handle may resume the coroutine.
    pub suspension: u64,
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("status", &self.status)
            .field("origin", &self.origin)
            .field("exit_code", &self.exit_code)
            .field("suspension", &self.suspension)
            .finish_non_exhaustive()
    }
}

/// Result of one resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// Suspended on an async operation; a resume event will follow.
    Yielded,
    /// Returned normally.
    Finished,
    /// Called `lunet.exit(code)`.
    Exited(i64),
    /// Raised an error. Message includes the Lua traceback.
    Failed(String),
}

/// Enter coroutine `id` with `args`.
///
/// # Panics
///
/// Resuming an unknown, dead or already running coroutine means the event
/// loop lost track of its registry, which is unrecoverable.
pub(crate) fn resume(
    script: &LuaTable,
    bindings: &Bindings,
    id: CoroutineId,
    args: LuaMultiValue,
) -> Step {
    let (thread, ctx) = {
        let mut state = bindings.state.borrow_mut();
        let Some(co) = state.coroutines.get_mut(&id) else {
            panic!("lunet: resume of unknown coroutine {id}");
        };
        assert!(
            matches!(co.status, CoroutineStatus::Created | CoroutineStatus::Yielded),
            "lunet: resume of {:?} coroutine {id}",
            co.status
        );
        co.status = CoroutineStatus::Running;
        let entered = (co.thread.clone(), co.ctx.clone());
        state.current = Some(id);
        entered
    };

    let result = {
        let _vm = bindings.shared.stats.enter();
        let _current = scopeguard::guard((), |()| {
            if let Err(e) = script.raw_set(CTX_FIELD, LuaValue::Nil) {
                log::warn!("[coroutine] Failed to clear ctx slot: {e}");
            }
            bindings.state.borrow_mut().current = None;
        });
        script
            .raw_set(CTX_FIELD, ctx)
            .and_then(|()| thread.resume::<LuaMultiValue>(args))
    };

    let exit_code = bindings
        .state
        .borrow()
        .coroutines
        .get(&id)
        .and_then(|co| co.exit_code);

    let step = match result {
        Ok(values) => match thread.status() {
            LuaThreadStatus::Resumable => match values.iter().next() {
                Some(v) if bridge::is_suspend(v) => Step::Yielded,
                Some(v) if bridge::is_exit(v) => Step::Exited(exit_code.unwrap_or(0)),
                _ => Step::Failed(
                    "attempt to yield across the host boundary (use coroutine.wrap for generators)"
                        .to_string(),
                ),
            },
            _ => Step::Finished,
        },
        // mlua appends the failed thread's traceback to string errors.
        Err(err) => Step::Failed(error_message(&err)),
    };

    let mut state = bindings.state.borrow_mut();
    let Some(co) = state.coroutines.get_mut(&id) else {
        panic!("lunet: coroutine {id} vanished during its own resume");
    };
    co.status = if step == Step::Yielded {
        CoroutineStatus::Yielded
    } else {
        CoroutineStatus::Dead
    };
    step
}

/// The innermost human-readable message of an mlua error.
pub(crate) fn error_message(err: &LuaError) -> String {
    match err {
        LuaError::RuntimeError(msg) => msg.clone(),
        LuaError::SyntaxError { message, .. } => message.clone(),
        LuaError::CallbackError { cause, .. } => error_message(cause),
        other => other.to_string(),
    }
}
