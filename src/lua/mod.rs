//! Single-writer Lua runtime.
//!
//! Each [`Instance`] owns one Lua state. Only its loop thread ever touches
//! that state; everything else talks to it through events.
//!
//! # Architecture
//!
//! ```text
//! Instance (any thread)
//!  ├── submit/dispatch ──► Event channel ──► EventLoop (lunet-loop thread)
//!  │                                          ├── Lua state (mlua)
//!  │                                          ├── coroutines + ctx slot
//!  │                                          ├── timer slots
//!  │                                          └── resource tables (tcp, udp)
//!  └── tokio runtime (lunet-worker threads)
//!       ├── sleeps, timers, DNS, socket I/O
//!       └── ResumeHandle ──► Event::ResumeThread
//! ```
//!
//! A script suspends by calling a native that starts async work and returns
//! the suspend marker; the prelude's `await` yields it to the loop. When the
//! work completes, its [`ResumeHandle`] posts the result back and the loop
//! resumes the coroutine with it.
//!
//! # Primitives
//!
//! Natives live in `primitives` and are exposed through the global `lunet`
//! table (and `ngx`, when [`RuntimeConfig::ngx_alias`](crate::RuntimeConfig)
//! is set).

pub(crate) mod affinity;
pub(crate) mod batch;
pub(crate) mod bridge;
pub(crate) mod coroutine;
pub(crate) mod entry_point;
pub(crate) mod event_loop;
pub(crate) mod events;
pub(crate) mod output;
pub(crate) mod pool;
pub(crate) mod primitives;
pub(crate) mod runtime;
pub(crate) mod shared;
pub(crate) mod state;
pub(crate) mod timers;

pub use affinity::{Affinity, Generation, WRONG_OWNER};
pub use batch::LuaBatch;
pub use bridge::ResumeHandle;
pub use coroutine::{CoroutineId, CoroutineStatus};
pub use entry_point::EntryPoint;
pub use events::{Chunk, Completion, Invocation, Request, ResumeValue};
pub use output::{BufferSink, OutputSink, StdoutSink};
pub use pool::{InstancePool, PooledInstance};
pub use primitives::request::RequestContext;
pub use runtime::Instance;
pub use shared::VmStats;
pub use timers::{PendingTimer, TimerId};
