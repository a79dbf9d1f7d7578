//! Instrumentation events.
//!
//! Instrumentation is fire-and-forget: sinks get a name and a flat
//! key/value payload and must not be able to fail the code path that emits.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::debug;

/// A named instrumentation event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: &'static str,
    pub payload: BTreeMap<&'static str, String>,
}

impl Event {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            payload: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.payload.insert(key, value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

/// Receiver of instrumentation events.
pub trait Instrumenter: Send + Sync {
    fn instrument(&self, event: &Event);
}

/// Emit `event` to `sink`, swallowing any panic raised by the sink.
pub fn emit(sink: &dyn Instrumenter, event: Event) {
    let event = event.with("process_id", std::process::id());
    let _ = catch_unwind(AssertUnwindSafe(|| sink.instrument(&event)));
}

/// Forwards events to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInstrumenter;

impl Instrumenter for TracingInstrumenter {
    fn instrument(&self, event: &Event) {
        debug!(target: "jobrow::instrument", event = event.name, payload = ?event.payload);
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumenter;

impl Instrumenter for NoopInstrumenter {
    fn instrument(&self, _event: &Event) {}
}
