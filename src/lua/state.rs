//! Loop-thread state reachable from native functions.
//!
//! [`LoopState`] is only ever touched on the event loop thread, so it sits in
//! an `Rc<RefCell<_>>`. Borrows must never be held across a call into Lua:
//! natives called from the resumed script borrow it again.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use mlua::prelude::*;

use super::affinity::Resources;
use super::bridge::ResumeHandle;
use super::coroutine::{Coroutine, CoroutineId, Origin};
use super::output::OutputSink;
use super::primitives::request::RequestContext;
use super::shared::Shared;
use super::timers::{TimerId, TimerSlot};

#[derive(Default)]
pub(crate) struct LoopState {
    pub coroutines: HashMap<CoroutineId, Coroutine>,
    /// Coroutine being resumed right now, if any.
    pub current: Option<CoroutineId>,
    pub timer_slots: HashMap<TimerId, TimerSlot>,
    pub resources: Resources,
    pub entry_point: Option<LuaFunction>,
    next_coroutine: u64,
}

impl LoopState {
    pub fn next_coroutine_id(&mut self) -> CoroutineId {
        self.next_coroutine += 1;
        CoroutineId(self.next_coroutine)
    }
}

/// Everything a native function needs, captured by clone into its closure.
#[derive(Clone)]
pub(crate) struct Bindings {
    pub state: Rc<RefCell<LoopState>>,
    pub shared: Arc<Shared>,
}

impl Bindings {
    pub fn current(&self) -> Option<CoroutineId> {
        self.state.borrow().current
    }

    /// Run `f` on the current coroutine's registry entry.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Coroutine) -> R) -> Option<R> {
        let mut state = self.state.borrow_mut();
        let id = state.current?;
        state.coroutines.get_mut(&id).map(f)
    }

    pub fn current_origin(&self) -> Option<Origin> {
        self.with_current(|co| co.origin)
    }

    pub fn current_request(&self) -> Option<Arc<RequestContext>> {
        self.with_current(|co| co.request.clone()).flatten()
    }

    /// The current coroutine's output override, or the instance default.
    pub fn output(&self) -> Arc<dyn OutputSink> {
        self.with_current(|co| co.output.clone())
            .flatten()
            .unwrap_or_else(|| self.shared.default_output())
    }

    /// Handle that resumes the current coroutine from another thread.
    ///
    /// Each call starts a new suspension and supersedes every handle issued
    /// before it, so a completion that nobody awaited cannot resume a later
    /// wait.
    pub fn resume_handle(&self) -> Option<ResumeHandle> {
        let mut state = self.state.borrow_mut();
        let id = state.current?;
        let co = state.coroutines.get_mut(&id)?;
        co.suspension += 1;
        Some(ResumeHandle::new(
            id,
            co.suspension,
            self.shared.events.clone(),
        ))
    }
}
