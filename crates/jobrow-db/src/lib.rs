//! Job storage for jobrow.
//!
//! Provides the row-level [`JobRepo`] and session-scoped [`AdvisoryLocker`]
//! traits, a PostgreSQL implementation of both, and an in-memory one.

pub mod error;
pub mod lock;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use lock::{AdvisoryLocker, PgAdvisoryLock, lock_key};
pub use memory::{MemoryJobRepo, MemoryLock};
pub use repo::{JobRecord, JobRepo, JobStore, PgJobRepo};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
///
/// Every running job holds one connection for its advisory lock, so
/// `max_connections` must exceed the total worker count.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
