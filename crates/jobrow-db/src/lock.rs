//! Session-scoped advisory locks.
//!
//! A lock is held by one storage session and is independent of row and
//! table locks. Acquisition never blocks, and the lock disappears when the
//! session that holds it goes away, which is how jobs owned by a crashed
//! worker become claimable again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobrow_core::{Job, JobId, QueueSelector};
use sqlx::Postgres;
use sqlx::pool::PoolConnection;
use tracing::warn;

use crate::repo::{JobRecord, lock_next_query};
use crate::{DbResult, PgJobRepo};

/// Non-blocking mutual exclusion keyed by job identity.
#[async_trait]
pub trait AdvisoryLocker: Send + Sync {
    /// Proof of a held lock. Dropping it without [`AdvisoryLocker::unlock`]
    /// ends the session, which releases the lock.
    type Lock: Send + Sync;

    /// Try to take the lock for `id`. `None` means another session holds it.
    async fn try_lock(&self, id: JobId) -> DbResult<Option<Self::Lock>>;

    /// Select the best-ranked eligible job for `selector` at `now` that no
    /// session has locked, and lock it in the same step. Rows locked by
    /// others are passed over, so concurrent claimers spread across the
    /// eligible jobs instead of contending for the first one.
    async fn try_lock_next(
        &self,
        selector: &QueueSelector,
        now: DateTime<Utc>,
    ) -> DbResult<Option<(Job, Self::Lock)>>;

    /// Whether the session behind `lock` really owns it.
    async fn owns(&self, lock: &mut Self::Lock) -> DbResult<bool>;

    /// Release the lock and end its session's hold on it.
    async fn unlock(&self, lock: Self::Lock) -> DbResult<()>;
}

/// The 64-bit advisory lock key for a job: the leading eight bytes of
/// `md5("jobs" || id)`.
pub fn lock_key(id: JobId) -> i64 {
    let digest = md5::compute(format!("jobs{}", id));
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.0[..8]);
    i64::from_be_bytes(bytes)
}

/// A PostgreSQL advisory lock pinned to the pooled connection that took it.
pub struct PgAdvisoryLock {
    job_id: JobId,
    key: i64,
    conn: Option<PoolConnection<Postgres>>,
}

impl PgAdvisoryLock {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for PgAdvisoryLock {
    fn drop(&mut self) {
        // Returning a connection to the pool would keep the lock alive.
        if let Some(conn) = self.conn.as_mut() {
            conn.close_on_drop();
        }
    }
}

#[async_trait]
impl AdvisoryLocker for PgJobRepo {
    type Lock = PgAdvisoryLock;

    async fn try_lock(&self, id: JobId) -> DbResult<Option<PgAdvisoryLock>> {
        let key = lock_key(id);
        let mut conn = self.pool.acquire().await?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if !locked {
            return Ok(None);
        }

        Ok(Some(PgAdvisoryLock {
            job_id: id,
            key,
            conn: Some(conn),
        }))
    }

    async fn try_lock_next(
        &self,
        selector: &QueueSelector,
        now: DateTime<Utc>,
    ) -> DbResult<Option<(Job, PgAdvisoryLock)>> {
        let mut conn = self.pool.acquire().await?;
        let mut query = lock_next_query(selector, now);

        let record = match query
            .build_query_as::<JobRecord>()
            .fetch_optional(&mut *conn)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                // The statement may have taken a lock before failing.
                conn.close_on_drop();
                return Err(e.into());
            }
        };

        let Some(record) = record else {
            return Ok(None);
        };
        let job = Job::from(record);
        let lock = PgAdvisoryLock {
            job_id: job.id,
            key: lock_key(job.id),
            conn: Some(conn),
        };
        Ok(Some((job, lock)))
    }

    async fn owns(&self, lock: &mut PgAdvisoryLock) -> DbResult<bool> {
        let Some(conn) = lock.conn.as_mut() else {
            return Ok(false);
        };

        let owned: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND objsubid = 1
                  AND classid = (($1::bigint >> 32) & 4294967295)::oid
                  AND objid = ($1::bigint & 4294967295)::oid
                  AND pid = pg_backend_pid()
            )
            "#,
        )
        .bind(lock.key)
        .fetch_one(&mut **conn)
        .await?;

        Ok(owned)
    }

    async fn unlock(&self, mut lock: PgAdvisoryLock) -> DbResult<()> {
        let Some(mut conn) = lock.conn.take() else {
            return Ok(());
        };

        let released: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(lock.key)
                .fetch_one(&mut *conn)
                .await;

        match released {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(job_id = %lock.job_id, "Advisory lock was not held at unlock");
                conn.close_on_drop();
                Ok(())
            }
            Err(e) => {
                conn.close_on_drop();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_stable_per_job() {
        let id = JobId::new();
        assert_eq!(lock_key(id), lock_key(id));
        assert_ne!(lock_key(id), lock_key(JobId::new()));
    }
}
