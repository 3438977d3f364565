//! Shared helpers for integration tests.

#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::sync::Arc;
use std::time::{Duration, Instant as Clock};

use lunet::{BufferSink, Instance, RuntimeConfig};

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        worker_threads: 2,
        ..RuntimeConfig::default()
    }
}

/// A started instance whose default output is captured.
pub fn start_instance() -> (Instance, BufferSink) {
    start_with(test_config())
}

pub fn start_with(config: RuntimeConfig) -> (Instance, BufferSink) {
    let instance = Instance::new(config).expect("create instance");
    let sink = BufferSink::new();
    instance.set_output(Arc::new(sink.clone()));
    instance.start().expect("start instance");
    (instance, sink)
}

/// Poll `condition` until it holds or five seconds pass.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Clock::now() + Duration::from_secs(5);
    while Clock::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
