//! Output sinks for `lunet.print` and `lunet.say`.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Destination for script output.
///
/// Every invocation may carry its own sink; timer callbacks always write to
/// the instance default.
pub trait OutputSink: Send + Sync {
    /// Write one complete `print`/`say` payload.
    fn write_bytes(&self, data: &[u8]) -> io::Result<()>;
}

/// Writes to the process stdout, flushing after every payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_bytes(&self, data: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(data)?;
        out.flush()
    }
}

/// Collects output in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl BufferSink {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded as UTF-8.
    #[must_use]
    pub fn contents(&self) -> String {
        let buf = self.inner.lock().expect("output buffer mutex poisoned");
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Take the raw bytes, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock().expect("output buffer mutex poisoned"))
    }
}

impl OutputSink for BufferSink {
    fn write_bytes(&self, data: &[u8]) -> io::Result<()> {
        self.inner
            .lock()
            .expect("output buffer mutex poisoned")
            .extend_from_slice(data);
        Ok(())
    }
}
