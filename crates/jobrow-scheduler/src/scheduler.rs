//! Schedulers keep a worker pool fed with claim attempts.
//!
//! Every scheduler has a single [`Performer`]. A wake-up reserves an idle
//! worker and asks the performer to claim and run one job. When a job was
//! found the worker wakes the scheduler again straight away, so a backlog
//! drains without waiting on the timer. When nothing was found the worker
//! stops, and the next attempt comes from the timer or an external wake.

use futures::FutureExt;
use jobrow_config::{QueueConfig, QueueGroup};
use jobrow_core::instrument::emit;
use jobrow_core::{Event, Instrumenter, TracingInstrumenter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::pool::WorkerPool;
use crate::{
    PerformedJob, Performer, SchedulerError, SchedulerRegistry, SchedulerResult,
    ThreadErrorHandler, WakeState,
};

/// Result of asking a scheduler to start work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// A worker was dispatched to claim a job.
    Started,
    /// The wake-up hint cannot concern this scheduler's queues.
    Declined,
    /// The pool is shut down or has no idle worker.
    Unavailable,
}

impl WakeOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, WakeOutcome::Started)
    }
}

/// Pool and timer settings for one scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub max_threads: usize,
    /// Zero disables the timer; the scheduler then only runs on wake-ups.
    pub poll_interval: Duration,
    /// Longest a waiting shutdown blocks on in-flight jobs.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        let config = QueueConfig::default();
        Self {
            max_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(config.max_threads),
            poll_interval: config.poll_interval,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

impl SchedulerOptions {
    pub fn for_group(group: &QueueGroup, config: &QueueConfig) -> Self {
        Self {
            max_threads: group.max_threads,
            poll_interval: config.poll_interval,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// Where schedulers report what they do.
#[derive(Clone)]
pub struct SchedulerHooks {
    pub instrumenter: Arc<dyn Instrumenter>,
    /// Receives errors from pool tasks and timer ticks. When unset they are
    /// logged.
    pub on_thread_error: Option<ThreadErrorHandler>,
}

impl Default for SchedulerHooks {
    fn default() -> Self {
        Self {
            instrumenter: Arc::new(TracingInstrumenter),
            on_thread_error: None,
        }
    }
}

struct Timer {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Pools {
    pool: Arc<WorkerPool>,
    timer: Option<Timer>,
}

struct Inner {
    name: String,
    performer: Arc<Performer>,
    options: SchedulerOptions,
    hooks: SchedulerHooks,
    pools: Mutex<Pools>,
    shutdown: AtomicBool,
}

/// A worker pool plus polling timer driven by one performer.
///
/// Cloning yields another handle to the same scheduler. Creating one
/// spawns tasks, so it must happen inside a tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Build a scheduler, start its pool and timer, and add it to `registry`.
    pub fn new(
        performer: Performer,
        options: SchedulerOptions,
        hooks: SchedulerHooks,
        registry: &SchedulerRegistry,
    ) -> SchedulerResult<Self> {
        if options.max_threads == 0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "scheduler for queues {:?} needs at least one thread",
                performer.name()
            )));
        }

        let name = format!(
            "Scheduler(queues={} max_threads={} poll_interval={})",
            performer.name(),
            options.max_threads,
            options.poll_interval.as_secs_f64()
        );

        let inner = Arc::new(Inner {
            pools: Mutex::new(Pools {
                pool: Arc::new(WorkerPool::new(name.clone(), options.max_threads)),
                timer: None,
            }),
            name,
            performer: Arc::new(performer),
            options,
            hooks,
            shutdown: AtomicBool::new(false),
        });

        let scheduler = Self { inner };
        scheduler.start_timer();
        scheduler.instrument_create_pools();
        registry.register(scheduler.clone());

        info!(scheduler = %scheduler.name(), "Scheduler started");
        Ok(scheduler)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn performer(&self) -> &Performer {
        &self.inner.performer
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    /// Whether shutdown was requested and no restart followed.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Whether the pool accepts work.
    pub fn is_running(&self) -> bool {
        self.pool().is_running()
    }

    /// Whether the pool has stopped and every dispatched task has finished.
    pub fn is_terminated(&self) -> bool {
        let pools = self.lock_pools();
        let timer_done = pools
            .timer
            .as_ref()
            .is_none_or(|timer| timer.handle.is_finished());
        pools.pool.is_terminated() && timer_done
    }

    /// Idle workers available for new work.
    pub fn ready_worker_count(&self) -> usize {
        self.pool().ready_worker_count()
    }

    /// Try to start one unit of work.
    ///
    /// With a `state` hint, the performer's filter is consulted first and a
    /// mismatch declines without using a worker or touching storage.
    pub fn wake(&self, state: Option<&WakeState>) -> WakeOutcome {
        let pool = self.pool();
        if !pool.is_running() || pool.ready_worker_count() == 0 {
            return WakeOutcome::Unavailable;
        }

        if let Some(state) = state {
            if !self.inner.performer.next_admits(state) {
                return WakeOutcome::Declined;
            }
        }

        let Some(slot) = pool.try_reserve() else {
            return WakeOutcome::Unavailable;
        };

        let work = AssertUnwindSafe(self.inner.performer.next()).catch_unwind();
        let scheduler = self.clone();
        pool.execute(slot, work, move |output| {
            let output = output.unwrap_or_else(|payload| Err(SchedulerError::from_panic(payload)));
            scheduler.task_observer(output);
        });

        WakeOutcome::Started
    }

    /// Stop taking work and stop the timer. With `wait`, block until the
    /// timer has exited and in-flight jobs finish or the shutdown timeout
    /// passes. Calling it again is harmless.
    pub async fn shutdown(&self, wait: bool) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.instrument(Event::new("scheduler_shutdown_start").with("wait", wait));
        let started = Instant::now();

        let (pool, timer) = {
            let mut pools = self.lock_pools();
            (pools.pool.clone(), pools.timer.take())
        };

        if let Some(timer) = timer {
            let _ = timer.stop.send(true);
            if wait {
                let _ = timer.handle.await;
            }
        }

        if pool.is_running() {
            pool.shutdown();
            if wait && !pool.wait_for_termination(self.inner.options.shutdown_timeout).await {
                warn!(
                    pool = pool.name(),
                    active = pool.active_count(),
                    "Timed out waiting for jobs to finish"
                );
            }
        }

        self.instrument(
            Event::new("scheduler_shutdown")
                .with("wait", wait)
                .with("duration_ms", started.elapsed().as_millis()),
        );
        info!(scheduler = %self.name(), wait, "Scheduler shut down");
    }

    /// Shut down if running, then start with a fresh pool and timer.
    pub async fn restart(&self, wait: bool) {
        self.instrument(Event::new("scheduler_restart_pools"));
        if !self.is_shutdown() {
            self.shutdown(wait).await;
        }

        self.lock_pools().pool = Arc::new(WorkerPool::new(
            self.inner.name.clone(),
            self.inner.options.max_threads,
        ));
        self.start_timer();
        self.instrument_create_pools();
        self.inner.shutdown.store(false, Ordering::SeqCst);
    }

    fn task_observer(&self, output: SchedulerResult<Option<PerformedJob>>) {
        let found = match &output {
            Ok(Some(performed)) => {
                debug!(scheduler = %self.name(), job_id = %performed.job.id, "Task performed job");
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.report(e);
                false
            }
        };

        let mut event = Event::new("finished_job_task").with("found_job", found);
        if let Err(e) = &output {
            event = event.with("error", e);
        }
        self.instrument(event);

        if found {
            self.wake(None);
        }
    }

    fn timer_tick(&self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.wake(None)));

        let mut event = Event::new("finished_timer_task");
        match outcome {
            Ok(outcome) => event = event.with("result", format!("{outcome:?}")),
            Err(payload) => {
                let e = SchedulerError::from_panic(payload);
                self.report(&e);
                event = event.with("error", e);
            }
        }
        self.instrument(event);
    }

    fn start_timer(&self) {
        let interval = self.inner.options.poll_interval;
        if interval.is_zero() {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_timer(Arc::downgrade(&self.inner), interval, stop_rx));
        self.lock_pools().timer = Some(Timer { stop, handle });
    }

    fn report(&self, e: &SchedulerError) {
        match &self.inner.hooks.on_thread_error {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(e))).is_err() {
                    error!(scheduler = %self.name(), error = %e, "Thread error handler panicked");
                }
            }
            None => error!(scheduler = %self.name(), error = %e, "Scheduler task failed"),
        }
    }

    fn instrument_create_pools(&self) {
        self.instrument(
            Event::new("scheduler_create_pools")
                .with("performer_name", self.inner.performer.name())
                .with("max_threads", self.inner.options.max_threads)
                .with("poll_interval", self.inner.options.poll_interval.as_secs_f64()),
        );
    }

    fn instrument(&self, event: Event) {
        emit(
            self.inner.hooks.instrumenter.as_ref(),
            event.with("scheduler", &self.inner.name),
        );
    }

    fn pool(&self) -> Arc<WorkerPool> {
        self.lock_pools().pool.clone()
    }

    fn lock_pools(&self) -> std::sync::MutexGuard<'_, Pools> {
        self.inner
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

async fn run_timer(scheduler: Weak<Inner>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }

        let Some(inner) = scheduler.upgrade() else {
            break;
        };
        Scheduler { inner }.timer_tick();
    }
}
