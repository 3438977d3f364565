//! The single-writer event loop.
//!
//! [`EventLoop`] owns the Lua state and is the only code that ever enters it.
//! It runs on the dedicated `lunet-loop` thread started by
//! [`Instance::start`](super::Instance::start) and handles one [`Event`] at a
//! time until it sees [`Event::Stop`] or every sender is gone.
//!
//! Coroutine bookkeeping:
//!
//! - a submitted [`Request`] adds one unit of work when it is queued and
//!   registers a coroutine when it is handled
//! - a scheduled timer adds its unit of work up front (see `timer.at`), and the
//!   coroutine created when it fires inherits it
//! - [`EventLoop::release`] removes a coroutine, returns its unit of work and
//!   is the only place a reply is sent; an entry can only be removed once
//!
//! Submitters block on a oneshot reply that is sent when the coroutine is
//! released, however many suspensions that takes.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::prelude::*;
use tokio::sync::mpsc;

use super::coroutine::{self, Coroutine, CoroutineId, CoroutineStatus, Origin, Step};
use super::entry_point::EntryPoint;
use super::events::{
    self, Chunk, Completion, Event, Invocation, OnResume, Outcome, ReplySender, Request,
    ResumeValue,
};
use super::primitives;
use super::shared::Shared;
use super::state::{Bindings, LoopState};
use super::timers::{PendingTimer, TimerId};
use crate::error::ScriptError;

pub(crate) struct EventLoop {
    lua: Lua,
    /// The `lunet` table; `ctx` is installed on it around every resume.
    script: LuaTable,
    bindings: Bindings,
}

impl EventLoop {
    /// Create the Lua state and install the script surface.
    pub fn new(shared: Arc<Shared>) -> Result<Self> {
        let lua = Lua::new();
        if let Some(dir) = &shared.config.lua_path {
            setup_package_path(&lua, dir)?;
        }

        let bindings = Bindings {
            state: Rc::new(RefCell::new(LoopState::default())),
            shared,
        };
        let script = primitives::register_all(&lua, &bindings)?;

        Ok(Self {
            lua,
            script,
            bindings,
        })
    }

    /// Handle events until stopped.
    pub fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        log::debug!("[loop] Event loop started");
        while let Some(event) = events.blocking_recv() {
            if self.dispatch(event).is_break() {
                break;
            }
        }
        // Whatever is still queued is dropped; pending replies observe a
        // closed channel. Queued runs were already counted as work.
        events.close();
        while let Ok(event) = events.try_recv() {
            if let Event::Run { .. } = event {
                self.bindings.shared.work.done();
            }
        }
        self.bindings.shared.running.store(false, Ordering::Release);
        log::debug!("[loop] Event loop exited");
    }

    fn dispatch(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Run { request, reply } => self.handle_run(request, reply),
            Event::LoadEntryPoint { entry, reply } => {
                let _ = reply.send(self.handle_load(&entry));
            }
            Event::ResumeThread {
                coroutine,
                suspension,
                values,
                on_resume,
            } => self.handle_resume(coroutine, suspension, values, on_resume),
            Event::TimerFire { timer, premature } => self.handle_timer_fire(&timer, premature),
            Event::Stop { reply } => {
                self.handle_stop();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_run(&mut self, request: Request, reply: Option<ReplySender>) {
        let Request {
            chunk,
            args,
            invocation,
        } = request;

        // The unit of work was added by the submitter.
        let thread = match self.load_chunk(&chunk) {
            Ok(function) => self
                .lua
                .create_thread(function)
                .map_err(|e| ScriptError::Runtime(e.to_string())),
            Err(e) => Err(e),
        };
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                self.bindings.shared.work.done();
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };

        let Some(id) = self.register(thread, Origin::Invocation, invocation, reply) else {
            return;
        };
        match events::to_lua_args(&self.lua, args) {
            Ok(args) => self.resume(id, args),
            Err(e) => self.finish(id, Err(ScriptError::Runtime(e.to_string()))),
        }
    }

    fn handle_load(&mut self, entry: &EntryPoint) -> Result<(), ScriptError> {
        let function = self.load_chunk(&entry.chunk())?;
        self.bindings.state.borrow_mut().entry_point = Some(function);
        log::debug!("[loop] Loaded entry point {entry}");
        Ok(())
    }

    fn handle_resume(
        &mut self,
        id: CoroutineId,
        suspension: u64,
        mut values: Vec<ResumeValue>,
        on_resume: Option<OnResume>,
    ) {
        // Resource bookkeeping (busy flags, new streams) is committed even
        // when nobody waits for the values any more.
        let waiting = {
            let mut state = self.bindings.state.borrow_mut();
            if let Some(commit) = on_resume {
                commit(&mut state.resources, &mut values);
            }
            // The coroutine may have failed after starting the async work,
            // e.g. by yielding across a C call boundary, or started newer
            // work whose completion is the one it waits for.
            state.coroutines.get(&id).is_some_and(|co| {
                co.status == CoroutineStatus::Yielded && co.suspension == suspension
            })
        };
        if !waiting {
            log::debug!("[loop] Dropping resume #{suspension} for {id}, not waiting on it");
            return;
        }
        match events::to_lua_args(&self.lua, values) {
            Ok(args) => self.resume(id, args),
            Err(e) => self.finish(id, Err(ScriptError::Runtime(e.to_string()))),
        }
    }

    fn handle_timer_fire(&mut self, timer: &PendingTimer, premature: bool) {
        if self.bindings.shared.timers.remove(timer.id()).is_none() {
            log::debug!("[timer] Ignoring fire for {:?}, no longer pending", timer.id());
            return;
        }
        self.fire_timer(timer.id(), premature);
    }

    /// Run a timer callback that has just been removed from the pending set.
    fn fire_timer(&mut self, id: TimerId, premature: bool) {
        let slot = self.bindings.state.borrow_mut().timer_slots.remove(&id);
        let Some(slot) = slot else {
            log::warn!("[timer] No callback registered for {id:?}");
            self.bindings.shared.work.done();
            return;
        };

        // The unit of work added by timer.at transfers to this coroutine.
        let Some(co) = self.register(slot.thread, Origin::Timer, Invocation::default(), None) else {
            return;
        };
        let mut args = Vec::with_capacity(slot.args.len() + 1);
        args.push(LuaValue::Boolean(premature));
        args.extend(slot.args);
        self.resume(co, LuaMultiValue::from_vec(args));
    }

    fn handle_stop(&mut self) {
        let shared = Arc::clone(&self.bindings.shared);
        shared.running.store(false, Ordering::Release);

        let drained = shared.timers.drain();
        if !drained.is_empty() {
            log::debug!("[loop] Running {} pending timer(s) prematurely", drained.len());
        }
        for timer in drained {
            timer.cancel();
            // Claim the fire so the arming task never posts it.
            let _ = timer.try_resolve();
            self.fire_timer(timer.id(), true);
        }

        let abandoned: Vec<CoroutineId> =
            self.bindings.state.borrow().coroutines.keys().copied().collect();
        for id in abandoned {
            self.finish(id, Err(ScriptError::Interrupted));
        }
    }

    fn load_chunk(&self, chunk: &Chunk) -> Result<LuaFunction, ScriptError> {
        let loaded = match chunk {
            Chunk::EntryPoint => {
                return self
                    .bindings
                    .state
                    .borrow()
                    .entry_point
                    .clone()
                    .ok_or(ScriptError::NoEntryPoint);
            }
            Chunk::Source { name, code } => self
                .lua
                .load(code.as_str())
                .set_name(name.as_str())
                .into_function(),
            Chunk::File(path) => {
                let mut code = std::fs::read_to_string(path).map_err(|e| {
                    ScriptError::Load(format!("cannot open {}: {e}", path.display()))
                })?;
                // Turn a shebang line into a comment, keeping line numbers.
                if code.starts_with('#') {
                    code.insert_str(0, "--");
                }
                self.lua
                    .load(code)
                    .set_name(format!("@{}", path.display()))
                    .into_function()
            }
        };
        loaded.map_err(|e| ScriptError::Load(coroutine::error_message(&e)))
    }

    fn register(
        &mut self,
        thread: LuaThread,
        origin: Origin,
        invocation: Invocation,
        reply: Option<ReplySender>,
    ) -> Option<CoroutineId> {
        let ctx = match self.lua.create_table() {
            Ok(ctx) => ctx,
            Err(e) => {
                log::error!("[loop] Failed to create coroutine context: {e}");
                self.bindings.shared.work.done();
                if let Some(reply) = reply {
                    let _ = reply.send(Err(ScriptError::Runtime(e.to_string())));
                }
                return None;
            }
        };

        let mut state = self.bindings.state.borrow_mut();
        let id = state.next_coroutine_id();
        state.coroutines.insert(
            id,
            Coroutine {
                thread,
                status: CoroutineStatus::Created,
                origin,
                reply,
                output: invocation.output,
                request: invocation.request,
                ctx,
                exit_code: None,
                suspension: 0,
            },
        );
        Some(id)
    }

    fn resume(&mut self, id: CoroutineId, args: LuaMultiValue) {
        let step = coroutine::resume(&self.script, &self.bindings, id, args);
        let outcome = match step {
            Step::Yielded => return,
            Step::Finished => Ok(Completion { exit_code: None }),
            Step::Exited(code) => Ok(Completion {
                exit_code: Some(code),
            }),
            Step::Failed(message) => {
                let is_timer = self
                    .bindings
                    .state
                    .borrow()
                    .coroutines
                    .get(&id)
                    .is_some_and(|co| co.origin == Origin::Timer);
                if is_timer {
                    log::error!("[timer] Callback failed: {message}");
                    self.bindings.shared.record_timer_error(message.clone());
                }
                Err(ScriptError::Runtime(message))
            }
        };
        self.finish(id, outcome);
    }

    /// Release `id` and deliver its outcome.
    fn finish(&mut self, id: CoroutineId, outcome: Outcome) {
        if let Some(reply) = self.release(id).and_then(|co| co.reply) {
            let _ = reply.send(outcome);
        }
    }

    /// Remove a coroutine from the registry and return its unit of work.
    /// Returns `None` if it was already released.
    fn release(&mut self, id: CoroutineId) -> Option<Coroutine> {
        let mut co = self.bindings.state.borrow_mut().coroutines.remove(&id)?;
        co.status = CoroutineStatus::Dead;
        self.bindings.shared.work.done();
        Some(co)
    }
}

/// Prepend `{dir}/?.lua;{dir}/?/init.lua` to `package.path`.
fn setup_package_path(lua: &Lua, dir: &Path) -> Result<()> {
    let package: LuaTable = lua
        .globals()
        .get("package")
        .map_err(|e| anyhow!("Failed to get package table: {e}"))?;
    let current: String = package
        .get("path")
        .map_err(|e| anyhow!("Failed to get package.path: {e}"))?;

    let dir = dir.display();
    let path = format!("{dir}/?.lua;{dir}/?/init.lua;{current}");
    package
        .set("path", path)
        .map_err(|e| anyhow!("Failed to set package.path: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::lua::output::BufferSink;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::oneshot;

    /// A loop driven by hand. Spawned tasks queue on a runtime nobody polls.
    fn manual_loop() -> (EventLoop, BufferSink, tokio::runtime::Runtime) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build runtime");
        let (events, _receiver) = mpsc::unbounded_channel();
        let out = BufferSink::new();
        let shared = Arc::new(Shared::new(
            events,
            runtime.handle().clone(),
            RuntimeConfig::default(),
            Arc::new(out.clone()),
        ));
        let event_loop = EventLoop::new(shared).expect("create event loop");
        (event_loop, out, runtime)
    }

    #[test]
    fn test_superseded_resume_is_committed_but_not_delivered() {
        let (mut event_loop, out, _runtime) = manual_loop();
        let (reply, mut done) = oneshot::channel();
        event_loop.bindings.shared.work.add();
        assert!(event_loop
            .dispatch(Event::Run {
                request: Request::source("lunet.say(select('#', lunet.sleep(10)))"),
                reply: Some(reply),
            })
            .is_continue());

        let id = CoroutineId(1);
        let suspension = event_loop.bindings.state.borrow().coroutines[&id].suspension;
        assert_eq!(suspension, 1);

        let committed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&committed);
        let _ = event_loop.dispatch(Event::ResumeThread {
            coroutine: id,
            suspension: suspension - 1,
            values: vec![ResumeValue::Int(1)],
            on_resume: Some(Box::new(move |_, _| flag.store(true, Ordering::SeqCst))),
        });
        assert!(committed.load(Ordering::SeqCst));
        assert_eq!(
            event_loop.bindings.state.borrow().coroutines[&id].status,
            CoroutineStatus::Yielded
        );
        assert!(done.try_recv().is_err());

        let _ = event_loop.dispatch(Event::ResumeThread {
            coroutine: id,
            suspension,
            values: Vec::new(),
            on_resume: None,
        });
        assert_eq!(done.try_recv().expect("reply sent"), Ok(Completion::default()));
        assert_eq!(out.contents(), "0\n");
        assert_eq!(event_loop.bindings.shared.work.outstanding(), 0);
    }

    #[test]
    fn test_resume_for_released_coroutine_is_ignored() {
        let (mut event_loop, _out, _runtime) = manual_loop();
        let _ = event_loop.dispatch(Event::ResumeThread {
            coroutine: CoroutineId(42),
            suspension: 1,
            values: vec![ResumeValue::Int(1)],
            on_resume: None,
        });
        assert!(event_loop.bindings.state.borrow().coroutines.is_empty());
    }

    #[test]
    fn test_setup_package_path_prepends_dir() {
        let lua = Lua::new();
        setup_package_path(&lua, Path::new("/srv/lua")).expect("setup package path");
        let path: String = lua.load("return package.path").eval().expect("read package.path");
        assert!(path.starts_with("/srv/lua/?.lua;/srv/lua/?/init.lua;"));
    }
}
