//! Errors reported to callers submitting work to an instance.
//!
//! Script-level failures stay in Lua as `nil, "message"` pairs; this type only
//! describes why a whole coroutine or submission did not complete.

/// Outcome of a failed submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    /// The chunk did not compile, or its file could not be read.
    #[error("load error: {0}")]
    Load(String),

    /// The coroutine raised an error. Carries the message with a Lua traceback.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// `Chunk::EntryPoint` was submitted before an entry point was loaded.
    #[error("no entry point loaded")]
    NoEntryPoint,

    /// The instance is not started, already stopped, or stopped before the
    /// submitted work could be dispatched.
    #[error("lua instance is not running")]
    NotRunning,

    /// The instance stopped while the coroutine was suspended.
    #[error("coroutine interrupted by shutdown")]
    Interrupted,
}
