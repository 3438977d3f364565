//! lunet - an embeddable Lua runtime with coroutine-based async I/O.
//!
//! Scripts run as coroutines on a single loop thread per instance. Sleeping,
//! timers, name resolution and socket I/O suspend the calling coroutine while
//! the work runs on a tokio runtime, and resume it with the result.
//!
//! # Modules
//!
//! - [`lua`] - Instances, the event loop and the script primitives
//! - [`config`] - Runtime configuration
//! - [`error`] - Errors reported to callers

pub mod config;
pub mod error;
pub mod lua;

pub use config::RuntimeConfig;
pub use error::ScriptError;
pub use lua::{
    BufferSink, Chunk, Completion, EntryPoint, Instance, InstancePool, Invocation, LuaBatch,
    OutputSink, Request, RequestContext, ResumeValue, StdoutSink, VmStats,
};
