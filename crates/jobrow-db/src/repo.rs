//! Job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobrow_core::{Job, JobId, QueueSelector};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{AdvisoryLocker, DbError, DbResult};

/// A job row in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: uuid::Uuid,
    pub queue_name: Option<String>,
    pub priority: i32,
    pub serialized_params: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub performed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobRecord> for Job {
    fn from(record: JobRecord) -> Self {
        Self {
            id: JobId::from_uuid(record.id),
            queue_name: record.queue_name,
            priority: record.priority,
            serialized_params: record.serialized_params,
            scheduled_at: record.scheduled_at,
            performed_at: record.performed_at,
            finished_at: record.finished_at,
            error: record.error,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Row-level persistence for jobs.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: &Job) -> DbResult<()>;

    async fn find(&self, id: JobId) -> DbResult<Option<Job>>;

    async fn get_by_id(&self, id: JobId) -> DbResult<Job> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(id))
    }

    /// Write every mutable column of an existing job.
    async fn save(&self, job: &Job) -> DbResult<()>;

    async fn destroy(&self, id: JobId) -> DbResult<()>;

    /// The best-ranked job a claim cycle at `now` may take: unfinished,
    /// scheduled no later than `now`, inside `selector`, highest priority
    /// first and oldest first among equals.
    async fn next_eligible(
        &self,
        selector: &QueueSelector,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>>;

    /// Unfinished jobs in claim order.
    async fn list_unfinished(&self, limit: i64) -> DbResult<Vec<Job>>;

    /// Finished jobs, optionally only those finished no later than `before`.
    async fn list_finished(
        &self,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DbResult<Vec<Job>>;
}

/// Storage that can both persist jobs and lock them.
pub trait JobStore: JobRepo + AdvisoryLocker + 'static {}

impl<T: JobRepo + AdvisoryLocker + 'static> JobStore for T {}

/// PostgreSQL implementation of JobRepo.
#[derive(Clone)]
pub struct PgJobRepo {
    pub(crate) pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const CLAIM_ORDER: &str = " ORDER BY priority DESC NULLS LAST, created_at ASC, id ASC";

/// The advisory lock key of `rows.id`, computed the same way as
/// [`crate::lock_key`].
const ROW_LOCK_KEY: &str = "('x' || substr(md5('jobs' || rows.id::text), 1, 16))::bit(64)::bigint";

/// Append the eligibility and queue filters to a `WHERE` clause.
fn push_eligible_filter(
    query: &mut QueryBuilder<'static, Postgres>,
    selector: &QueueSelector,
    now: DateTime<Utc>,
) {
    query.push(" WHERE finished_at IS NULL AND (scheduled_at IS NULL OR scheduled_at <= ");
    query.push_bind(now);
    query.push(")");

    match selector {
        QueueSelector::All => {}
        QueueSelector::Exclude(names) => {
            query.push(" AND (queue_name IS NULL OR queue_name <> ALL(");
            query.push_bind(names.clone());
            query.push("))");
        }
        QueueSelector::Include(names) => {
            query.push(" AND queue_name = ANY(");
            query.push_bind(names.clone());
            query.push(")");
        }
    }
}

/// Build the claim-order selection query for `selector`.
pub(crate) fn next_eligible_query(
    selector: &QueueSelector,
    now: DateTime<Utc>,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("SELECT * FROM jobs");
    push_eligible_filter(&mut query, selector, now);
    query.push(CLAIM_ORDER);
    query.push(" LIMIT 1");
    query
}

/// Select and lock the best-ranked eligible row that no session holds.
///
/// The candidates are materialized in claim order first, so the lock call
/// in the outer filter runs row by row in that order and stops at the
/// first one it wins.
pub(crate) fn lock_next_query(
    selector: &QueueSelector,
    now: DateTime<Utc>,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("WITH rows AS MATERIALIZED (SELECT * FROM jobs");
    push_eligible_filter(&mut query, selector, now);
    query.push(CLAIM_ORDER);
    query.push(") SELECT * FROM rows WHERE pg_try_advisory_lock(");
    query.push(ROW_LOCK_KEY);
    // No outer ORDER BY: sorting after the filter would lock every row.
    query.push(") LIMIT 1");
    query
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn insert(&self, job: &Job) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, queue_name, priority, serialized_params, scheduled_at,
                              performed_at, finished_at, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.queue_name)
        .bind(job.priority)
        .bind(&job.serialized_params)
        .bind(job.scheduled_at)
        .bind(job.performed_at)
        .bind(job.finished_at)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(DbError::Duplicate(job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, id: JobId) -> DbResult<Option<Job>> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(record.map(Job::from))
    }

    async fn save(&self, job: &Job) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET queue_name = $2, priority = $3, serialized_params = $4, scheduled_at = $5,
                performed_at = $6, finished_at = $7, error = $8, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.queue_name)
        .bind(job.priority)
        .bind(&job.serialized_params)
        .bind(job.scheduled_at)
        .bind(job.performed_at)
        .bind(job.finished_at)
        .bind(&job.error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(job.id));
        }
        Ok(())
    }

    async fn destroy(&self, id: JobId) -> DbResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_eligible(
        &self,
        selector: &QueueSelector,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        let mut query = next_eligible_query(selector, now);
        let record = query
            .build_query_as::<JobRecord>()
            .fetch_optional(&self.pool)
            .await?;
        Ok(record.map(Job::from))
    }

    async fn list_unfinished(&self, limit: i64) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE finished_at IS NULL
            ORDER BY priority DESC NULLS LAST, created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records.into_iter().map(Job::from).collect())
    }

    async fn list_finished(
        &self,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE finished_at IS NOT NULL
              AND ($1::timestamptz IS NULL OR finished_at <= $1)
            ORDER BY finished_at DESC
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records.into_iter().map(Job::from).collect())
    }
}
