//! In-memory job storage.
//!
//! Mirrors the PostgreSQL selection order and lock semantics so the claim
//! protocol and scheduler behave the same against either store. Every
//! [`MemoryLock`] is its own session: dropping it releases the lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobrow_core::{Job, JobId, QueueSelector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::instrument;

use crate::{AdvisoryLocker, DbError, DbResult, JobRepo};

struct StoredJob {
    /// Insertion sequence, used as the final tie-break.
    seq: u64,
    job: Job,
}

#[derive(Clone, Default)]
pub struct MemoryJobRepo {
    jobs: Arc<RwLock<HashMap<JobId, StoredJob>>>,
    locks: Arc<Mutex<HashMap<JobId, u64>>>,
    sequence: Arc<AtomicU64>,
}

impl MemoryJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows, finished or not.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether any session currently holds the lock for `id`.
    pub fn is_locked(&self, id: JobId) -> bool {
        self.locks
            .lock()
            .map(|locks| locks.contains_key(&id))
            .unwrap_or(false)
    }

    fn eligible<'a>(selector: &'a QueueSelector, now: DateTime<Utc>) -> impl Fn(&Job) -> bool + 'a {
        move |job| job.is_eligible_at(now) && selector.matches(job.queue_name.as_deref())
    }

    /// Record a new session holding `id`. The caller has checked it is free.
    fn hold(&self, locks: &mut HashMap<JobId, u64>, id: JobId) -> MemoryLock {
        let session = self.sequence.fetch_add(1, Ordering::SeqCst);
        locks.insert(id, session);
        MemoryLock {
            job_id: id,
            session,
            locks: self.locks.clone(),
        }
    }

    fn sorted(jobs: &HashMap<JobId, StoredJob>, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut matching: Vec<&StoredJob> = jobs.values().filter(|s| keep(&s.job)).collect();
        matching.sort_by(|a, b| {
            b.job
                .priority
                .cmp(&a.job.priority)
                .then(a.job.created_at.cmp(&b.job.created_at))
                .then(a.seq.cmp(&b.seq))
        });
        matching.into_iter().map(|s| s.job.clone()).collect()
    }
}

#[async_trait]
impl JobRepo for MemoryJobRepo {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn insert(&self, job: &Job) -> DbResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(DbError::Duplicate(job.id));
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        jobs.insert(
            job.id,
            StoredJob {
                seq,
                job: job.clone(),
            },
        );
        Ok(())
    }

    async fn find(&self, id: JobId) -> DbResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).map(|s| s.job.clone()))
    }

    async fn save(&self, job: &Job) -> DbResult<()> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| DbError::NotFound(job.id))?;
        stored.job = job.clone();
        stored.job.updated_at = Utc::now();
        Ok(())
    }

    async fn destroy(&self, id: JobId) -> DbResult<()> {
        self.jobs.write().await.remove(&id);
        Ok(())
    }

    async fn next_eligible(
        &self,
        selector: &QueueSelector,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        let jobs = self.jobs.read().await;
        Ok(Self::sorted(&jobs, Self::eligible(selector, now))
            .into_iter()
            .next())
    }

    async fn list_unfinished(&self, limit: i64) -> DbResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(Self::sorted(&jobs, |job| !job.is_finished())
            .into_iter()
            .take(limit)
            .collect())
    }

    async fn list_finished(
        &self,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DbResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut finished: Vec<Job> = jobs
            .values()
            .map(|s| &s.job)
            .filter(|job| match (job.finished_at, before) {
                (Some(at), Some(before)) => at <= before,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .cloned()
            .collect();
        finished.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        finished.truncate(limit);
        Ok(finished)
    }
}

/// A held in-memory advisory lock.
pub struct MemoryLock {
    job_id: JobId,
    session: u64,
    locks: Arc<Mutex<HashMap<JobId, u64>>>,
}

impl MemoryLock {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.locks.lock() {
            if locks.get(&self.job_id) == Some(&self.session) {
                locks.remove(&self.job_id);
            }
        }
    }
}

#[async_trait]
impl AdvisoryLocker for MemoryJobRepo {
    type Lock = MemoryLock;

    async fn try_lock(&self, id: JobId) -> DbResult<Option<MemoryLock>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        if locks.contains_key(&id) {
            return Ok(None);
        }
        Ok(Some(self.hold(&mut locks, id)))
    }

    async fn try_lock_next(
        &self,
        selector: &QueueSelector,
        now: DateTime<Utc>,
    ) -> DbResult<Option<(Job, MemoryLock)>> {
        let jobs = self.jobs.read().await;
        let candidates = Self::sorted(&jobs, Self::eligible(selector, now));
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(job) = candidates.into_iter().find(|job| !locks.contains_key(&job.id)) else {
            return Ok(None);
        };
        let lock = self.hold(&mut locks, job.id);
        Ok(Some((job, lock)))
    }

    async fn owns(&self, lock: &mut MemoryLock) -> DbResult<bool> {
        Ok(self
            .locks
            .lock()
            .map(|locks| locks.get(&lock.job_id) == Some(&lock.session))
            .unwrap_or(false))
    }

    async fn unlock(&self, lock: MemoryLock) -> DbResult<()> {
        drop(lock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobrow_core::NewJob;

    fn job(queue: &str, priority: i32) -> Job {
        Job::from_new(
            NewJob::new(serde_json::json!({})).queue(queue).priority(priority),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_next_eligible_prefers_priority_then_age() {
        let repo = MemoryJobRepo::new();
        let low = job("default", 1);
        let high_first = job("default", 5);
        let high_second = job("default", 5);
        for j in [&low, &high_first, &high_second] {
            repo.insert(j).await.unwrap();
        }

        let next = repo
            .next_eligible(&QueueSelector::All, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, high_first.id);
    }

    #[tokio::test]
    async fn test_next_eligible_skips_future_and_finished() {
        let repo = MemoryJobRepo::new();
        let now = Utc::now();

        let mut later = job("default", 10);
        later.scheduled_at = Some(now + Duration::hours(1));
        let mut done = job("default", 9);
        done.finished_at = Some(now);
        let ready = job("default", 0);
        for j in [&later, &done, &ready] {
            repo.insert(j).await.unwrap();
        }

        let next = repo.next_eligible(&QueueSelector::All, now).await.unwrap();
        assert_eq!(next.map(|j| j.id), Some(ready.id));

        let next = repo
            .next_eligible(&QueueSelector::All, now + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(next.map(|j| j.id), Some(later.id));
    }

    #[tokio::test]
    async fn test_next_eligible_respects_selector() {
        let repo = MemoryJobRepo::new();
        let mice = job("mice", 0);
        let mut unnamed = job("default", 5);
        unnamed.queue_name = None;
        repo.insert(&mice).await.unwrap();
        repo.insert(&unnamed).await.unwrap();

        let now = Utc::now();
        let include = repo
            .next_eligible(&QueueSelector::parse("mice"), now)
            .await
            .unwrap();
        assert_eq!(include.map(|j| j.id), Some(mice.id));

        let exclude = repo
            .next_eligible(&QueueSelector::parse("-mice"), now)
            .await
            .unwrap();
        assert_eq!(exclude.map(|j| j.id), Some(unnamed.id));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let repo = MemoryJobRepo::new();
        let id = JobId::new();

        let mut held = repo.try_lock(id).await.unwrap().expect("first lock");
        assert!(repo.owns(&mut held).await.unwrap());
        assert!(repo.try_lock(id).await.unwrap().is_none());

        repo.unlock(held).await.unwrap();
        assert!(!repo.is_locked(id));
        assert!(repo.try_lock(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_next_passes_over_held_rows() {
        let repo = MemoryJobRepo::new();
        let first = job("default", 5);
        let second = job("default", 1);
        let elsewhere = job("ferrets", 9);
        for j in [&first, &second, &elsewhere] {
            repo.insert(j).await.unwrap();
        }
        let selector = QueueSelector::parse("default");

        let held = repo.try_lock(first.id).await.unwrap().unwrap();
        let (next, mut lock) = repo
            .try_lock_next(&selector, Utc::now())
            .await
            .unwrap()
            .expect("second job should be claimable");
        assert_eq!(next.id, second.id);
        assert!(repo.owns(&mut lock).await.unwrap());
        assert!(repo.try_lock_next(&selector, Utc::now()).await.unwrap().is_none());

        drop(held);
        let (next, _lock) = repo
            .try_lock_next(&selector, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, first.id);
    }

    #[tokio::test]
    async fn test_dropping_lock_releases_it() {
        let repo = MemoryJobRepo::new();
        let id = JobId::new();

        let held = repo.try_lock(id).await.unwrap().unwrap();
        drop(held);
        assert!(!repo.is_locked(id));
    }

    #[tokio::test]
    async fn test_errors_name_the_job() {
        let repo = MemoryJobRepo::new();
        let stored = job("default", 0);
        repo.insert(&stored).await.unwrap();

        let err = repo.insert(&stored).await.unwrap_err();
        assert!(matches!(err, DbError::Duplicate(id) if id == stored.id));

        let missing = job("default", 0);
        let err = repo.save(&missing).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(id) if id == missing.id));
        assert_eq!(err.to_string(), format!("job {} does not exist", missing.id));
        assert!(matches!(
            repo.get_by_id(missing.id).await.unwrap_err(),
            DbError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_list_finished_filters_by_time() {
        let repo = MemoryJobRepo::new();
        let now = Utc::now();
        let mut old = job("default", 0);
        old.finished_at = Some(now - Duration::days(2));
        let mut recent = job("default", 0);
        recent.finished_at = Some(now);
        repo.insert(&old).await.unwrap();
        repo.insert(&recent).await.unwrap();
        repo.insert(&job("default", 0)).await.unwrap();

        assert_eq!(repo.list_finished(None, 10).await.unwrap().len(), 2);
        let before = repo
            .list_finished(Some(now - Duration::days(1)), 10)
            .await
            .unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].id, old.id);
        assert_eq!(repo.list_unfinished(10).await.unwrap().len(), 1);
    }
}
