//! Claiming the next eligible job under an advisory lock.
//!
//! A claim is one selection: the best-ranked eligible job for a queue
//! selection that no other session has locked, locked in the same step.
//! Jobs that are running elsewhere are passed over, so every worker of
//! every pool can be busy at once. When all eligible jobs are held the
//! attempt reports no work.

use chrono::Utc;
use jobrow_core::{Error, JobId, QueueSelector};
use jobrow_db::JobStore;
use tracing::{debug, warn};

use crate::{JobRunner, PerformedJob, SchedulerResult};

impl<R: JobStore> JobRunner<R> {
    /// Lock the next eligible job matching `selector` and run it.
    ///
    /// Returns `None` when nothing is eligible or every eligible job is
    /// locked by another session. The lock is released when the attempt
    /// ends, including on error.
    pub async fn perform_with_advisory_lock(
        &self,
        selector: &QueueSelector,
    ) -> SchedulerResult<Option<PerformedJob>> {
        let Some((id, lock)) = self.claim(selector).await? else {
            return Ok(None);
        };

        let outcome = self.perform_claimed(id).await;

        if let Err(e) = self.repo.unlock(lock).await {
            warn!(job_id = %id, error = %e, "Failed to release advisory lock");
        }

        outcome
    }

    /// Take and verify the lock for the next job, or report no work.
    async fn claim(&self, selector: &QueueSelector) -> SchedulerResult<Option<(JobId, R::Lock)>> {
        let Some((job, mut lock)) = self.repo.try_lock_next(selector, Utc::now()).await? else {
            debug!(?selector, "No unlocked eligible job");
            return Ok(None);
        };
        let id = job.id;

        match self.repo.owns(&mut lock).await {
            Ok(true) => Ok(Some((id, lock))),
            Ok(false) => {
                warn!(job_id = %id, reason = %Error::UnownedLockRace(id), "Skipping job");
                if let Err(e) = self.repo.unlock(lock).await {
                    warn!(job_id = %id, error = %e, "Failed to release unowned advisory lock");
                }
                Ok(None)
            }
            Err(e) => {
                if let Err(unlock_err) = self.repo.unlock(lock).await {
                    warn!(job_id = %id, error = %unlock_err, "Failed to release advisory lock");
                }
                Err(e.into())
            }
        }
    }

    /// Re-read a locked job and run it if it still needs running.
    async fn perform_claimed(&self, id: JobId) -> SchedulerResult<Option<PerformedJob>> {
        let Some(mut job) = self.repo.find(id).await? else {
            debug!(job_id = %id, "Job vanished before it could run");
            return Ok(None);
        };
        if job.is_finished() {
            debug!(job_id = %id, "Job finished before it could run");
            return Ok(None);
        }

        let (result, error) = self.perform(&mut job).await?;
        Ok(Some(PerformedJob { job, result, error }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Behavior, ScriptedExecutor, runner_for, runner_with};
    use crate::{PerformOptions, SchedulerError};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use jobrow_core::{Job, NewJob};
    use jobrow_db::{AdvisoryLocker, DbError, DbResult, JobRepo, MemoryJobRepo, MemoryLock};
    use std::sync::Arc;

    fn kept() -> PerformOptions {
        PerformOptions {
            preserve_job_records: true,
            reperform_jobs_on_standard_error: true,
        }
    }

    #[tokio::test]
    async fn test_enqueued_job_is_claimed() {
        let (runner, _) = runner_with(Behavior::Succeed, kept());
        let job = runner.enqueue(NewJob::new(serde_json::json!({}))).await.unwrap();

        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::All)
            .await
            .unwrap()
            .expect("job should be claimed");
        assert_eq!(performed.job.id, job.id);
        assert!(performed.job.finished_at.is_some());
        assert!(!runner.repo().is_locked(job.id));
    }

    #[tokio::test]
    async fn test_nothing_to_claim() {
        let (runner, executor) = runner_with(Behavior::Succeed, kept());
        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::All)
            .await
            .unwrap();
        assert!(performed.is_none());
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_jobs_run_in_priority_order() {
        let (runner, executor) = runner_with(Behavior::Succeed, kept());
        for priority in [5, 1, 3] {
            runner
                .enqueue(NewJob::new(serde_json::json!({ "p": priority })).priority(priority))
                .await
                .unwrap();
        }

        while runner
            .perform_with_advisory_lock(&QueueSelector::All)
            .await
            .unwrap()
            .is_some()
        {}

        let order: Vec<i64> = executor
            .seen()
            .iter()
            .map(|p| p["p"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![5, 3, 1]);
    }

    #[tokio::test]
    async fn test_future_job_waits_for_its_schedule() {
        let (runner, executor) = runner_with(Behavior::Succeed, kept());
        let mut job = runner
            .enqueue(NewJob::new(serde_json::json!({})).scheduled_at(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::All)
            .await
            .unwrap();
        assert!(performed.is_none());
        assert_eq!(executor.calls(), 0);

        job.scheduled_at = Some(Utc::now() - Duration::seconds(1));
        runner.repo().save(&job).await.unwrap();

        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::All)
            .await
            .unwrap();
        assert_eq!(performed.map(|p| p.job.id), Some(job.id));
    }

    #[tokio::test]
    async fn test_selector_limits_claims() {
        let (runner, _) = runner_with(Behavior::Succeed, kept());
        runner
            .enqueue(NewJob::new(serde_json::json!({})).queue("elephant"))
            .await
            .unwrap();

        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::parse("mice"))
            .await
            .unwrap();
        assert!(performed.is_none());

        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::parse("-mice"))
            .await
            .unwrap();
        assert!(performed.is_some());
    }

    #[tokio::test]
    async fn test_locked_job_is_passed_over() {
        let (runner, executor) = runner_with(Behavior::Succeed, kept());
        let top = runner
            .enqueue(NewJob::new(serde_json::json!({})).priority(5))
            .await
            .unwrap();
        let other = runner
            .enqueue(NewJob::new(serde_json::json!({})).priority(1))
            .await
            .unwrap();

        let held = runner.repo().try_lock(top.id).await.unwrap().unwrap();

        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::All)
            .await
            .unwrap();
        assert_eq!(performed.map(|p| p.job.id), Some(other.id));
        assert_eq!(executor.calls(), 1);

        // Only the held job is left.
        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::All)
            .await
            .unwrap();
        assert!(performed.is_none());
        assert!(runner.repo().get_by_id(top.id).await.unwrap().finished_at.is_none());

        drop(held);
        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::All)
            .await
            .unwrap();
        assert_eq!(performed.map(|p| p.job.id), Some(top.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_workers_run_two_jobs_at_once() {
        let executor = Arc::new(
            ScriptedExecutor::new(Behavior::Succeed).with_delay(std::time::Duration::from_millis(200)),
        );
        let runner = runner_for(executor.clone(), kept());
        let first = runner.enqueue(NewJob::new(serde_json::json!({}))).await.unwrap();
        let second = runner.enqueue(NewJob::new(serde_json::json!({}))).await.unwrap();

        let worker_a = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.perform_with_advisory_lock(&QueueSelector::All).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let worker_b = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.perform_with_advisory_lock(&QueueSelector::All).await })
        };

        let ran_a = worker_a.await.unwrap().unwrap().map(|p| p.job.id);
        let ran_b = worker_b.await.unwrap().unwrap().map(|p| p.job.id);
        assert_eq!(ran_a, Some(first.id));
        assert_eq!(ran_b, Some(second.id));
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_workers_run_a_job_once() {
        let executor = Arc::new(
            ScriptedExecutor::new(Behavior::Succeed).with_delay(std::time::Duration::from_millis(100)),
        );
        let runner = runner_for(executor.clone(), kept());
        runner.enqueue(NewJob::new(serde_json::json!({}))).await.unwrap();

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let runner = runner.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                runner
                    .perform_with_advisory_lock(&QueueSelector::All)
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(executor.calls(), 1);
    }

    /// A store whose locks are never confirmed as owned. With `failing`,
    /// the ownership check errors instead.
    struct Disowning {
        memory: MemoryJobRepo,
        failing: bool,
    }

    #[async_trait]
    impl JobRepo for Disowning {
        async fn insert(&self, job: &Job) -> DbResult<()> {
            self.memory.insert(job).await
        }

        async fn find(&self, id: JobId) -> DbResult<Option<Job>> {
            self.memory.find(id).await
        }

        async fn save(&self, job: &Job) -> DbResult<()> {
            self.memory.save(job).await
        }

        async fn destroy(&self, id: JobId) -> DbResult<()> {
            self.memory.destroy(id).await
        }

        async fn next_eligible(
            &self,
            selector: &QueueSelector,
            now: DateTime<Utc>,
        ) -> DbResult<Option<Job>> {
            self.memory.next_eligible(selector, now).await
        }

        async fn list_unfinished(&self, limit: i64) -> DbResult<Vec<Job>> {
            self.memory.list_unfinished(limit).await
        }

        async fn list_finished(
            &self,
            before: Option<DateTime<Utc>>,
            limit: i64,
        ) -> DbResult<Vec<Job>> {
            self.memory.list_finished(before, limit).await
        }
    }

    #[async_trait]
    impl AdvisoryLocker for Disowning {
        type Lock = MemoryLock;

        async fn try_lock(&self, id: JobId) -> DbResult<Option<MemoryLock>> {
            self.memory.try_lock(id).await
        }

        async fn try_lock_next(
            &self,
            selector: &QueueSelector,
            now: DateTime<Utc>,
        ) -> DbResult<Option<(Job, MemoryLock)>> {
            self.memory.try_lock_next(selector, now).await
        }

        async fn owns(&self, lock: &mut MemoryLock) -> DbResult<bool> {
            if self.failing {
                return Err(DbError::NotFound(lock.job_id()));
            }
            Ok(false)
        }

        async fn unlock(&self, lock: MemoryLock) -> DbResult<()> {
            self.memory.unlock(lock).await
        }
    }

    #[tokio::test]
    async fn test_unowned_lock_is_treated_as_no_work() {
        let memory = MemoryJobRepo::new();
        let executor = Arc::new(ScriptedExecutor::new(Behavior::Succeed));
        let store = Disowning {
            memory: memory.clone(),
            failing: false,
        };
        let runner = JobRunner::new(Arc::new(store), executor.clone(), kept());
        let job = runner.enqueue(NewJob::new(serde_json::json!({}))).await.unwrap();

        let performed = runner
            .perform_with_advisory_lock(&QueueSelector::All)
            .await
            .unwrap();
        assert!(performed.is_none());
        assert_eq!(executor.calls(), 0);
        assert!(!memory.is_locked(job.id));
        assert!(memory.get_by_id(job.id).await.unwrap().performed_at.is_none());
    }

    #[tokio::test]
    async fn test_ownership_check_error_releases_lock() {
        let memory = MemoryJobRepo::new();
        let executor = Arc::new(ScriptedExecutor::new(Behavior::Succeed));
        let store = Disowning {
            memory: memory.clone(),
            failing: true,
        };
        let runner = JobRunner::new(Arc::new(store), executor.clone(), kept());
        let job = runner.enqueue(NewJob::new(serde_json::json!({}))).await.unwrap();

        let result = runner.perform_with_advisory_lock(&QueueSelector::All).await;
        assert!(matches!(result, Err(SchedulerError::Db(DbError::NotFound(id))) if id == job.id));
        assert_eq!(executor.calls(), 0);
        assert!(!memory.is_locked(job.id));
    }
}
