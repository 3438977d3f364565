//! Events consumed by the event loop.
//!
//! Everything that touches the Lua state arrives through one unbounded
//! channel and is handled in order on the loop thread: submissions from
//! callers, resumes posted by async operations, timer fires and shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use mlua::prelude::*;
use tokio::sync::{mpsc, oneshot};

use super::affinity::Resources;
use super::batch::LuaBatch;
use super::coroutine::CoroutineId;
use super::entry_point::EntryPoint;
use super::output::OutputSink;
use super::primitives::request::RequestContext;
use super::timers::PendingTimer;
use crate::error::ScriptError;

/// Sender half of the event channel.
pub(crate) type EventSender = mpsc::UnboundedSender<Event>;

/// Final result of a coroutine, delivered to whoever submitted it.
pub(crate) type Outcome = Result<Completion, ScriptError>;

pub(crate) type ReplySender = oneshot::Sender<Outcome>;

/// Runs on the loop just before a resume, with access to the resource tables.
/// Used to commit async results into resource state and to replace the
/// resume values when the resource went stale in the meantime.
pub(crate) type OnResume = Box<dyn FnOnce(&mut Resources, &mut Vec<ResumeValue>) + Send>;

/// How a coroutine finished without error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    /// Code passed to `lunet.exit`, if the script exited explicitly.
    pub exit_code: Option<i64>,
}

/// A value handed back to a suspended coroutine.
///
/// These are plain data so they can be produced on any thread; the event
/// loop converts them to Lua values right before resuming.
#[derive(Debug, Clone)]
pub enum ResumeValue {
    /// Lua `nil`.
    Nil,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float.
    Number(f64),
    /// A byte string, not necessarily UTF-8.
    Str(Bytes),
    /// Expands into every value the batch leaves on its stack.
    Batch(LuaBatch),
}

impl ResumeValue {
    pub(crate) fn push_into(self, lua: &Lua, out: &mut Vec<LuaValue>) -> LuaResult<()> {
        let value = match self {
            ResumeValue::Nil => LuaValue::Nil,
            ResumeValue::Bool(b) => LuaValue::Boolean(b),
            ResumeValue::Int(i) => LuaValue::Integer(i),
            ResumeValue::Number(n) => LuaValue::Number(n),
            ResumeValue::Str(s) => LuaValue::String(lua.create_string(&s)?),
            ResumeValue::Batch(batch) => {
                out.extend(batch.execute(lua)?);
                return Ok(());
            }
        };
        out.push(value);
        Ok(())
    }

    /// Shorthand for `ResumeValue::Str` from anything byte-like.
    pub fn str(s: impl Into<Bytes>) -> Self {
        ResumeValue::Str(s.into())
    }
}

impl From<&str> for ResumeValue {
    fn from(s: &str) -> Self {
        ResumeValue::Str(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<&String> for ResumeValue {
    fn from(s: &String) -> Self {
        ResumeValue::from(s.as_str())
    }
}

impl From<String> for ResumeValue {
    fn from(s: String) -> Self {
        ResumeValue::Str(Bytes::from(s))
    }
}

impl From<i64> for ResumeValue {
    fn from(i: i64) -> Self {
        ResumeValue::Int(i)
    }
}

impl From<bool> for ResumeValue {
    fn from(b: bool) -> Self {
        ResumeValue::Bool(b)
    }
}

impl From<f64> for ResumeValue {
    fn from(n: f64) -> Self {
        ResumeValue::Number(n)
    }
}

/// Convert resume values into the argument list of a resume.
pub(crate) fn to_lua_args(lua: &Lua, values: Vec<ResumeValue>) -> LuaResult<LuaMultiValue> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        value.push_into(lua, &mut out)?;
    }
    Ok(LuaMultiValue::from_vec(out))
}

/// Code to run for a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// The entry point previously loaded with
    /// [`Instance::load_entry_point`](crate::Instance::load_entry_point).
    EntryPoint,
    /// Source text, with the chunk name used in error messages.
    Source { name: String, code: String },
    /// A Lua file, read when the request is dispatched.
    File(PathBuf),
}

/// Per-invocation bindings.
#[derive(Clone, Default)]
pub struct Invocation {
    /// Overrides the instance's default output for this invocation only.
    pub output: Option<Arc<dyn OutputSink>>,
    /// Exposed through `lunet.req.*`.
    pub request: Option<Arc<RequestContext>>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("output", &self.output.as_ref().map(|_| "custom"))
            .field("request", &self.request)
            .finish()
    }
}

/// A unit of work submitted to an instance.
#[derive(Debug, Clone)]
pub struct Request {
    /// What to run.
    pub chunk: Chunk,
    /// Passed to the chunk as `...`.
    pub args: Vec<ResumeValue>,
    /// Per-invocation output and request context.
    pub invocation: Invocation,
}

impl Request {
    /// Run `code`.
    pub fn source(code: impl Into<String>) -> Self {
        Self::new(Chunk::Source {
            name: "=(string)".to_string(),
            code: code.into(),
        })
    }

    /// Run a Lua file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(Chunk::File(path.into()))
    }

    /// Run the loaded entry point.
    #[must_use]
    pub fn entry_point() -> Self {
        Self::new(Chunk::EntryPoint)
    }

    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            args: Vec::new(),
            invocation: Invocation::default(),
        }
    }

    /// Replace the chunk arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = ResumeValue>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    /// Send output to `output` instead of the instance default.
    #[must_use]
    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.invocation.output = Some(output);
        self
    }

    /// Attach the request served by this invocation.
    #[must_use]
    pub fn with_request(mut self, request: RequestContext) -> Self {
        self.invocation.request = Some(Arc::new(request));
        self
    }
}

/// Events handled by the event loop.
pub(crate) enum Event {
    /// Start a coroutine for a submitted request.
    Run {
        request: Request,
        reply: Option<ReplySender>,
    },

    /// Compile an entry point and keep the function for later
    /// `Chunk::EntryPoint` requests.
    LoadEntryPoint {
        entry: EntryPoint,
        reply: oneshot::Sender<Result<(), ScriptError>>,
    },

    /// Resume a suspended coroutine with the result of an async operation.
    ResumeThread {
        coroutine: CoroutineId,
        /// Which suspension of `coroutine` this completes.
        suspension: u64,
        values: Vec<ResumeValue>,
        on_resume: Option<OnResume>,
    },

    /// A timer elapsed or was cancelled.
    TimerFire {
        timer: Arc<PendingTimer>,
        premature: bool,
    },

    /// Drain pending timers, abandon suspended coroutines and exit the loop.
    Stop { reply: Option<oneshot::Sender<()>> },
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Run { request, .. } => {
                f.debug_struct("Run").field("chunk", &request.chunk).finish()
            }
            Event::LoadEntryPoint { entry, .. } => {
                f.debug_struct("LoadEntryPoint").field("entry", entry).finish()
            }
            Event::ResumeThread {
                coroutine,
                suspension,
                values,
                ..
            } => f
                .debug_struct("ResumeThread")
                .field("coroutine", coroutine)
                .field("suspension", suspension)
                .field("values", &values.len())
                .finish(),
            Event::TimerFire { timer, premature } => f
                .debug_struct("TimerFire")
                .field("timer", &timer.id())
                .field("premature", premature)
                .finish(),
            Event::Stop { .. } => f.write_str("Stop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_value_expands_in_place() {
        let lua = Lua::new();
        let mut batch = LuaBatch::new();
        batch.int(2).int(3);

        let args = to_lua_args(
            &lua,
            vec![ResumeValue::Int(1), ResumeValue::Batch(batch), ResumeValue::from("x")],
        )
        .expect("convert");
        let values: Vec<LuaValue> = args.into_iter().collect();
        assert_eq!(values.len(), 4);
        assert_eq!(values[2], LuaValue::Integer(3));
        match &values[3] {
            LuaValue::String(s) => assert_eq!(&s.as_bytes()[..], b"x"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_request_builders() {
        let request = Request::file("/tmp/x.lua").with_args(vec![ResumeValue::from("a")]);
        assert_eq!(request.chunk, Chunk::File(PathBuf::from("/tmp/x.lua")));
        assert_eq!(request.args.len(), 1);
        assert!(request.invocation.output.is_none());
    }
}
