//! State shared between the event loop, async tasks and callers.
//!
//! Nothing in here touches Lua. The loop-only half lives in
//! [`state`](super::state).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tokio::runtime::Handle;

use super::events::EventSender;
use super::output::OutputSink;
use super::timers::TimerSet;
use crate::config::RuntimeConfig;

pub(crate) struct Shared {
    pub events: EventSender,
    /// Runtime that executes every async operation started by a script.
    pub runtime: Handle,
    pub timers: TimerSet,
    pub work: WorkTracker,
    /// Set once shutdown begins; new timers are refused from then on.
    pub stopping: AtomicBool,
    /// The loop thread is accepting events.
    pub running: AtomicBool,
    pub stats: VmCounters,
    pub config: RuntimeConfig,
    output: Mutex<Arc<dyn OutputSink>>,
    timer_errors: Mutex<VecDeque<String>>,
}

impl Shared {
    pub fn new(
        events: EventSender,
        runtime: Handle,
        config: RuntimeConfig,
        output: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            events,
            runtime,
            timers: TimerSet::default(),
            work: WorkTracker::default(),
            stopping: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: VmCounters::default(),
            config,
            output: Mutex::new(output),
            timer_errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn default_output(&self) -> Arc<dyn OutputSink> {
        Arc::clone(&self.output.lock().expect("output mutex poisoned"))
    }

    pub fn set_default_output(&self, output: Arc<dyn OutputSink>) {
        *self.output.lock().expect("output mutex poisoned") = output;
    }

    /// Keep the most recent timer failures, up to `max_timer_errors`.
    pub fn record_timer_error(&self, message: String) {
        let limit = self.config.max_timer_errors;
        if limit == 0 {
            return;
        }
        let mut errors = self.timer_errors.lock().expect("timer errors mutex poisoned");
        while errors.len() >= limit {
            errors.pop_front();
        }
        errors.push_back(message);
    }

    pub fn timer_errors(&self) -> Vec<String> {
        self.timer_errors
            .lock()
            .expect("timer errors mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Counts coroutines that have been started but not released, plus timers
/// that have been scheduled but not yet fired. [`wait`](Self::wait) blocks
/// until the count returns to zero.
#[derive(Debug, Default)]
pub(crate) struct WorkTracker {
    count: Mutex<usize>,
    idle: Condvar,
}

impl WorkTracker {
    pub fn add(&self) {
        *self.count.lock().expect("work tracker mutex poisoned") += 1;
    }

    pub fn done(&self) {
        let mut count = self.count.lock().expect("work tracker mutex poisoned");
        debug_assert!(*count > 0, "work tracker released more than it added");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.count.lock().expect("work tracker mutex poisoned")
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().expect("work tracker mutex poisoned");
        while *count > 0 {
            count = self.idle.wait(count).expect("work tracker mutex poisoned");
        }
    }
}

/// Counters sampled around every resume.
#[derive(Debug, Default)]
pub(crate) struct VmCounters {
    resumes: AtomicU64,
    inside: AtomicUsize,
    peak: AtomicUsize,
}

impl VmCounters {
    /// Mark a thread as executing inside the VM until the guard drops.
    pub fn enter(&self) -> VmGuard<'_> {
        self.resumes.fetch_add(1, Ordering::Relaxed);
        let inside = self.inside.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(inside, Ordering::AcqRel);
        VmGuard(self)
    }

    pub fn snapshot(&self) -> VmStats {
        VmStats {
            resumes: self.resumes.load(Ordering::Relaxed),
            peak_vm_concurrency: self.peak.load(Ordering::Acquire),
        }
    }
}

pub(crate) struct VmGuard<'a>(&'a VmCounters);

impl Drop for VmGuard<'_> {
    fn drop(&mut self) {
        self.0.inside.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Execution statistics of one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Coroutine resumes performed so far.
    pub resumes: u64,
    /// Most threads ever observed inside the VM at once. Always at most 1.
    pub peak_vm_concurrency: usize,
}
