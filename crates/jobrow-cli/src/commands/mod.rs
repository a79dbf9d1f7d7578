//! CLI command implementations.

pub mod jobs;
pub mod work;

use anyhow::{Context, Result};
use jobrow_db::{PgJobRepo, create_pool};

/// Connect with a pool of `max_connections`.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgJobRepo> {
    let pool = create_pool(database_url, max_connections)
        .await
        .context("Failed to connect to database")?;
    Ok(PgJobRepo::new(pool))
}
