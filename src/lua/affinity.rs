//! Ownership and staleness guards for script-visible resources.
//!
//! A socket belongs to the coroutine that created it. Any operation from a
//! different coroutine is refused with `"bad request"`. Each resource also
//! carries a generation counter, bumped whenever the underlying connection is
//! torn down or replaced (close, keepalive, reconnect). Async completions
//! capture the generation they started under and are discarded if it has
//! moved on by the time they reach the event loop.
//!
//! Lua owns a resource through its userdata (`Rc<RefCell<T>>`); completions
//! find it again through a [`ResourceTable`] of weak references, so a socket
//! collected by the GC simply stops resolving.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use super::coroutine::CoroutineId;
use super::primitives::tcp::TcpSocket;
use super::primitives::udp::UdpSocket;

/// Refusal message for a cross-coroutine access.
pub const WRONG_OWNER: &str = "bad request";

/// Snapshot of a resource's generation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// Owner and generation of one resource.
#[derive(Debug)]
pub struct Affinity {
    owner: CoroutineId,
    generation: u64,
}

impl Affinity {
    /// A resource owned by `owner`, at generation zero.
    #[must_use]
    pub fn new(owner: CoroutineId) -> Self {
        Self {
            owner,
            generation: 0,
        }
    }

    /// The coroutine the resource belongs to.
    #[must_use]
    pub fn owner(&self) -> CoroutineId {
        self.owner
    }

    /// Refuse unless `caller` is the owning coroutine.
    pub fn check(&self, caller: Option<CoroutineId>) -> Result<(), &'static str> {
        if caller == Some(self.owner) {
            Ok(())
        } else {
            Err(WRONG_OWNER)
        }
    }

    /// Current generation, to be captured by an async operation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        Generation(self.generation)
    }

    /// Invalidate every in-flight completion.
    pub fn invalidate(&mut self) {
        self.generation += 1;
    }

    /// Returns `true` if `captured` predates the last invalidation.
    #[must_use]
    pub fn is_stale(&self, captured: Generation) -> bool {
        captured.0 != self.generation
    }
}

/// Identifier of a resource within its [`ResourceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

/// Weak index of live resources of one kind, owned by the event loop.
#[derive(Debug)]
pub(crate) struct ResourceTable<T> {
    next_id: u64,
    entries: HashMap<ResourceId, Weak<RefCell<T>>>,
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }
}

impl<T> ResourceTable<T> {
    /// Create a resource with a fresh id and index it.
    pub fn insert_with(&mut self, make: impl FnOnce(ResourceId) -> T) -> Rc<RefCell<T>> {
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        let resource = Rc::new(RefCell::new(make(id)));
        self.entries.insert(id, Rc::downgrade(&resource));
        resource
    }

    /// Look up a live resource. Entries whose resource was dropped are pruned.
    pub fn get(&mut self, id: ResourceId) -> Option<Rc<RefCell<T>>> {
        let resource = self.entries.get(&id)?.upgrade();
        if resource.is_none() {
            self.entries.remove(&id);
        }
        resource
    }

    /// Number of indexed resources that are still alive.
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|w| w.strong_count() > 0).count()
    }
}

/// Every resource kind the event loop can complete operations for.
#[derive(Debug, Default)]
pub(crate) struct Resources {
    pub tcp: ResourceTable<TcpSocket>,
    pub udp: ResourceTable<UdpSocket>,
}
