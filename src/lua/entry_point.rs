//! Preloaded entry points.
//!
//! An entry point is a chunk compiled once per instance and kept in the loop
//! state. Every [`Request::entry_point`](super::Request::entry_point)
//! submission starts a fresh coroutine from the same function, with the
//! request arguments as `...`. Loading again replaces the previous one.

use std::path::PathBuf;

use super::events::Chunk;

/// Code compiled once and run for every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    /// A Lua file.
    File(PathBuf),
    /// Inline source text.
    Code(String),
}

impl EntryPoint {
    pub(crate) fn chunk(&self) -> Chunk {
        match self {
            EntryPoint::File(path) => Chunk::File(path.clone()),
            EntryPoint::Code(code) => Chunk::Source {
                name: "=entrypoint".to_string(),
                code: code.clone(),
            },
        }
    }
}

impl std::fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryPoint::File(path) => write!(f, "{}", path.display()),
            EntryPoint::Code(_) => f.write_str("(inline code)"),
        }
    }
}
