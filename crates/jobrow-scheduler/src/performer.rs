//! Performers bind a claim action to an admission filter.

use futures::FutureExt;
use futures::future::BoxFuture;
use jobrow_config::QueueGroup;
use jobrow_db::JobStore;
use std::future::Future;
use std::sync::Arc;

use crate::{JobRunner, PerformedJob, SchedulerResult};

/// A hint passed with a wake-up, e.g. "a job was just enqueued on queue X".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WakeState {
    pub queue_name: Option<String>,
}

impl WakeState {
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: Some(queue_name.into()),
        }
    }
}

type ClaimFn = dyn Fn() -> BoxFuture<'static, SchedulerResult<Option<PerformedJob>>> + Send + Sync;
type FilterFn = dyn Fn(&WakeState) -> bool + Send + Sync;

/// A named unit of work a scheduler can call repeatedly.
///
/// `next` claims and runs at most one job. `next_admits` answers, without
/// touching storage, whether a wake-up hint could concern this performer.
pub struct Performer {
    name: String,
    claim: Arc<ClaimFn>,
    filter: Option<Arc<FilterFn>>,
}

impl Performer {
    pub fn new<F, Fut>(name: impl Into<String>, claim: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SchedulerResult<Option<PerformedJob>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            claim: Arc::new(move || claim().boxed()),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&WakeState) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// A performer that claims jobs from `group`'s queues and admits only
    /// wake-ups for those queues.
    pub fn for_queue_group<R: JobStore>(runner: Arc<JobRunner<R>>, group: &QueueGroup) -> Self {
        let selector = Arc::new(group.selector.clone());
        let admits = group.selector.predicate();

        Self::new(group.name.clone(), move || {
            let runner = runner.clone();
            let selector = selector.clone();
            async move { runner.perform_with_advisory_lock(&selector).await }
        })
        .with_filter(move |state| admits(state.queue_name.as_deref()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim and run one job, if any is available.
    pub fn next(&self) -> BoxFuture<'static, SchedulerResult<Option<PerformedJob>>> {
        (self.claim)()
    }

    /// Whether work described by `state` could be served here.
    pub fn next_admits(&self, state: &WakeState) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(state))
    }
}

impl std::fmt::Debug for Performer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Performer")
            .field("name", &self.name)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}
