//! [`Instance`]: the thread-safe handle to one Lua state.
//!
//! An instance owns a tokio runtime for async natives and, once started, a
//! `lunet-loop` thread running the [`EventLoop`]. Every public method can be
//! called from any thread that is not itself inside an async context; the
//! blocking ones wait on a oneshot reply from the loop.
//!
//! ```ignore
//! let instance = Instance::new(RuntimeConfig::default())?;
//! instance.start()?;
//! instance.run_string("lunet.sleep(0.1) lunet.say('done')")?;
//! instance.wait();
//! instance.stop();
//! ```

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, oneshot};

use super::entry_point::EntryPoint;
use super::event_loop::EventLoop;
use super::events::{Completion, Event, Invocation, ReplySender, Request, ResumeValue};
use super::output::{OutputSink, StdoutSink};
use super::shared::{Shared, VmStats};
use crate::config::RuntimeConfig;
use crate::error::ScriptError;

/// One Lua state with its event loop thread.
pub struct Instance {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    /// Owned runtime, if the instance created its own.
    runtime: Option<Runtime>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("running", &self.is_running())
            .field("pending_timers", &self.pending_timer_count())
            .field("outstanding", &self.shared.work.outstanding())
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Create an instance with its own multi-thread tokio runtime.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("lunet-worker");
        if config.worker_threads > 0 {
            builder.worker_threads(config.worker_threads);
        }
        let runtime = builder
            .build()
            .context("Failed to build tokio runtime for async natives")?;
        let handle = runtime.handle().clone();
        Ok(Self::assemble(config, handle, Some(runtime)))
    }

    /// Create an instance whose async natives run on an existing runtime.
    #[must_use]
    pub fn with_handle(config: RuntimeConfig, handle: Handle) -> Self {
        Self::assemble(config, handle, None)
    }

    fn assemble(config: RuntimeConfig, handle: Handle, runtime: Option<Runtime>) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(events, handle, config, Arc::new(StdoutSink)));
        Self {
            shared,
            receiver: Mutex::new(Some(receiver)),
            consumer: Mutex::new(None),
            runtime,
        }
    }

    /// Spawn the event loop thread. Fails if the Lua state cannot be set up
    /// or the instance was already started.
    pub fn start(&self) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .expect("instance receiver mutex poisoned")
            .take()
            .ok_or_else(|| anyhow!("Lua instance already started"))?;

        let shared = Arc::clone(&self.shared);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let consumer = std::thread::Builder::new()
            .name("lunet-loop".to_string())
            .spawn(move || match EventLoop::new(Arc::clone(&shared)) {
                Ok(event_loop) => {
                    shared.running.store(true, Ordering::Release);
                    let _ = ready_tx.send(Ok(()));
                    event_loop.run(receiver);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .context("Failed to spawn Lua event loop thread")?;

        let ready = ready_rx
            .blocking_recv()
            .map_err(|_closed| anyhow!("Lua event loop thread exited during startup"))
            .and_then(|result| result);
        if let Err(e) = ready {
            let _ = consumer.join();
            return Err(e.context("Failed to start Lua instance"));
        }

        *self.consumer.lock().expect("instance consumer mutex poisoned") = Some(consumer);
        log::info!("[loop] Lua instance started");
        Ok(())
    }

    /// Shut down: refuse new timers, cancel pending ones, let the loop run
    /// them prematurely and interrupt suspended coroutines, then join the
    /// loop thread. Idempotent.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.timers.cancel_all();

        let consumer = self
            .consumer
            .lock()
            .expect("instance consumer mutex poisoned")
            .take();
        let Some(consumer) = consumer else {
            self.shared.running.store(false, Ordering::Release);
            return;
        };

        let (reply, done) = oneshot::channel();
        if self.shared.events.send(Event::Stop { reply: Some(reply) }).is_ok() {
            let _ = done.blocking_recv();
        }
        if consumer.join().is_err() {
            log::error!("[loop] Event loop thread panicked");
        }
        self.shared.running.store(false, Ordering::Release);
        log::info!("[loop] Lua instance stopped");
    }

    /// Block until every invocation and scheduled timer has finished.
    pub fn wait(&self) {
        self.shared.work.wait();
    }

    /// Whether the event loop is accepting work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn send(&self, event: Event) -> Result<(), ScriptError> {
        if !self.is_running() {
            return Err(ScriptError::NotRunning);
        }
        self.shared.events.send(event).or(Err(ScriptError::NotRunning))
    }

    /// Count a run as outstanding before it is queued, so `wait` called right
    /// after `dispatch` covers it.
    fn send_run(&self, request: Request, reply: Option<ReplySender>) -> Result<(), ScriptError> {
        self.shared.work.add();
        let sent = self.send(Event::Run { request, reply });
        if sent.is_err() {
            self.shared.work.done();
        }
        sent
    }

    /// Run a request and block until its coroutine is released, across any
    /// number of suspensions.
    pub fn submit(&self, request: Request) -> Result<Completion, ScriptError> {
        let (reply, outcome) = oneshot::channel();
        self.send_run(request, Some(reply))?;
        outcome.blocking_recv().unwrap_or(Err(ScriptError::NotRunning))
    }

    /// Enqueue a request without waiting for it. Use [`wait`](Self::wait) to
    /// observe completion.
    pub fn dispatch(&self, request: Request) -> Result<(), ScriptError> {
        self.send_run(request, None)
    }

    /// Run `code` and block until its coroutine finishes.
    pub fn run_string(&self, code: &str) -> Result<Completion, ScriptError> {
        self.submit(Request::source(code))
    }

    /// Run a Lua file with string arguments visible as `...`.
    pub fn run_file(&self, path: &Path, args: &[String]) -> Result<Completion, ScriptError> {
        self.submit(Request::file(path).with_args(args.iter().map(ResumeValue::from)))
    }

    /// Compile an entry point for later [`run_entry_point`](Self::run_entry_point)
    /// calls.
    pub fn load_entry_point(&self, entry: EntryPoint) -> Result<(), ScriptError> {
        let (reply, loaded) = oneshot::channel();
        self.send(Event::LoadEntryPoint { entry, reply })?;
        loaded.blocking_recv().unwrap_or(Err(ScriptError::NotRunning))
    }

    /// Run the loaded entry point with `args` as `...`.
    pub fn run_entry_point(
        &self,
        args: Vec<ResumeValue>,
        invocation: Invocation,
    ) -> Result<Completion, ScriptError> {
        let mut request = Request::entry_point().with_args(args);
        request.invocation = invocation;
        self.submit(request)
    }

    /// Replace the default output used by invocations without an override
    /// and by every timer callback.
    pub fn set_output(&self, output: Arc<dyn OutputSink>) {
        self.shared.set_default_output(output);
    }

    /// Cancel every pending timer. Each still fires, with `premature = true`.
    pub fn cancel_all_timers(&self) -> usize {
        self.shared.timers.cancel_all()
    }

    /// Timers scheduled but not yet fired.
    #[must_use]
    pub fn pending_timer_count(&self) -> usize {
        self.shared.timers.len()
    }

    /// Failures of timer callbacks, oldest first.
    #[must_use]
    pub fn timer_errors(&self) -> Vec<String> {
        self.shared.timer_errors()
    }

    /// Counters collected by the event loop.
    #[must_use]
    pub fn stats(&self) -> VmStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calls_before_start_are_refused() {
        let instance = Instance::new(RuntimeConfig::default()).expect("create instance");
        assert!(!instance.is_running());
        assert_eq!(instance.run_string("return 1"), Err(ScriptError::NotRunning));
        assert_eq!(
            instance.load_entry_point(EntryPoint::Code("return 1".into())),
            Err(ScriptError::NotRunning)
        );
    }

    #[test]
    fn test_start_twice_fails() {
        let instance = Instance::new(RuntimeConfig::default()).expect("create instance");
        instance.start().expect("first start");
        assert!(instance.start().is_err());
        instance.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let instance = Instance::new(RuntimeConfig::default()).expect("create instance");
        instance.start().expect("start");
        instance.stop();
        instance.stop();
        assert!(!instance.is_running());
        assert_eq!(instance.run_string("return 1"), Err(ScriptError::NotRunning));
    }

    #[test]
    fn test_stop_without_start() {
        let instance = Instance::new(RuntimeConfig::default()).expect("create instance");
        instance.stop();
        assert!(!instance.is_running());
    }
}
