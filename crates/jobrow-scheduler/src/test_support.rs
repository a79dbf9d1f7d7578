//! Executors and fixtures shared by the scheduler tests.

use async_trait::async_trait;
use jobrow_core::{Event, ExecutionContext, Executor, Instrumenter, JobFailure, JobOutput};
use jobrow_db::MemoryJobRepo;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{JobRunner, PerformOptions};

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Raise,
    ReturnFailure,
    SignalRetry,
    SignalDiscard,
    Panic,
}

pub struct ScriptedExecutor {
    behavior: Behavior,
    delay: Option<Duration>,
    calls: AtomicUsize,
    params: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedExecutor {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            delay: None,
            calls: AtomicUsize::new(0),
            params: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<serde_json::Value> {
        self.params.lock().unwrap().last().cloned()
    }

    /// Every params value seen, in execution order.
    pub fn seen(&self) -> Vec<serde_json::Value> {
        self.params.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<JobOutput, JobFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.params.lock().unwrap().push(params);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.behavior {
            Behavior::Succeed => Ok(JobOutput::Value(serde_json::json!("ok"))),
            Behavior::Raise => Err(JobFailure::new("RuntimeError", "boom")),
            Behavior::ReturnFailure => Ok(JobOutput::Failure(JobFailure::new(
                "Returned",
                "bad value",
            ))),
            Behavior::SignalRetry => {
                ctx.retry_with(JobFailure::new("Timeout", "try later"));
                Ok(JobOutput::unit())
            }
            Behavior::SignalDiscard => {
                ctx.discard_with(JobFailure::new("Invalid", "give up"));
                Ok(JobOutput::unit())
            }
            Behavior::Panic => panic!("job exploded"),
        }
    }
}

/// Keeps every instrumentation event it receives.
#[derive(Default)]
pub struct RecordingInstrumenter {
    events: Mutex<Vec<Event>>,
}

impl RecordingInstrumenter {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name).collect()
    }

    /// The first event called `name`.
    pub fn find(&self, name: &str) -> Option<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }
}

impl Instrumenter for RecordingInstrumenter {
    fn instrument(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn runner_for(
    executor: Arc<ScriptedExecutor>,
    options: PerformOptions,
) -> Arc<JobRunner<MemoryJobRepo>> {
    Arc::new(JobRunner::new(
        Arc::new(MemoryJobRepo::new()),
        executor,
        options,
    ))
}

pub fn runner_with(
    behavior: Behavior,
    options: PerformOptions,
) -> (Arc<JobRunner<MemoryJobRepo>>, Arc<ScriptedExecutor>) {
    let executor = Arc::new(ScriptedExecutor::new(behavior));
    (runner_for(executor.clone(), options), executor)
}
