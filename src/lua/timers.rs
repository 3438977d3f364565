//! Timer scheduling and premature cancellation.
//!
//! `lunet.timer.at(delay, callback, ...)` registers a [`PendingTimer`] in the
//! instance's [`TimerSet`] and arms a tokio task that waits for either the
//! delay or the timer's cancellation token. Whichever happens first decides
//! `premature`; the task then posts [`Event::TimerFire`] so the callback runs
//! on the event loop like any other coroutine.
//!
//! Firing is exactly-once. The arming task only posts if it wins
//! [`PendingTimer::try_resolve`], and the loop only runs a fire whose timer it
//! can still remove from the pending set. Shutdown removes every pending timer
//! itself and runs them with `premature = true`, so fires already queued
//! behind the stop are never observed.
//!
//! The Lua side of a timer (callback thread and extra arguments) cannot leave
//! the loop thread; it lives in [`TimerSlot`]s keyed by [`TimerId`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::prelude::*;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::events::{Event, EventSender};

/// Identifies a timer within one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Thread-safe half of a scheduled timer.
#[derive(Debug)]
pub struct PendingTimer {
    id: TimerId,
    delay: Duration,
    cancel: CancellationToken,
    resolved: AtomicBool,
}

impl PendingTimer {
    /// Registry key of the timer.
    #[must_use]
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Delay the timer was scheduled with.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Request premature firing. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether premature firing was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claim the right to post this timer's fire. Succeeds at most once.
    pub(crate) fn try_resolve(&self) -> bool {
        self.resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Timers that have been scheduled and not yet fired.
#[derive(Debug)]
pub(crate) struct TimerSet {
    next_id: AtomicU64,
    pending: Mutex<HashMap<TimerId, Arc<PendingTimer>>>,
}

impl Default for TimerSet {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl TimerSet {
    /// Create and register a timer.
    pub fn create(&self, delay: Duration) -> Arc<PendingTimer> {
        let timer = Arc::new(PendingTimer {
            id: TimerId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            delay,
            cancel: CancellationToken::new(),
            resolved: AtomicBool::new(false),
        });
        self.pending
            .lock()
            .expect("timer set mutex poisoned")
            .insert(timer.id, Arc::clone(&timer));
        timer
    }

    /// Remove a timer, returning it if it was still pending.
    pub fn remove(&self, id: TimerId) -> Option<Arc<PendingTimer>> {
        self.pending
            .lock()
            .expect("timer set mutex poisoned")
            .remove(&id)
    }

    /// Remove and return every pending timer.
    pub fn drain(&self) -> Vec<Arc<PendingTimer>> {
        let mut pending = self.pending.lock().expect("timer set mutex poisoned");
        let mut timers: Vec<_> = pending.drain().map(|(_, timer)| timer).collect();
        timers.sort_by_key(|t| t.id.0);
        timers
    }

    /// Cancel every pending timer. They stay pending until their fire is
    /// handled.
    pub fn cancel_all(&self) -> usize {
        let pending = self.pending.lock().expect("timer set mutex poisoned");
        for timer in pending.values() {
            timer.cancel();
        }
        pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("timer set mutex poisoned").len()
    }
}

/// Loop-side half of a timer: the callback thread and its extra arguments.
pub(crate) struct TimerSlot {
    pub thread: LuaThread,
    pub args: Vec<LuaValue>,
}

/// Spawn the task that waits out `timer` and posts its fire.
pub(crate) fn arm(timer: Arc<PendingTimer>, events: EventSender, runtime: &Handle) {
    runtime.spawn(async move {
        let premature = tokio::select! {
            biased;
            () = timer.cancel.cancelled() => true,
            () = tokio::time::sleep(timer.delay) => false,
        };

        if !timer.try_resolve() {
            return;
        }
        let id = timer.id;
        if events.send(Event::TimerFire { timer, premature }).is_err() {
            log::debug!("[timer] Event loop gone, dropping fire for {id:?}");
        }
    });
}
