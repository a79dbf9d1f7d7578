//! Admin commands: migrations, enqueueing and listing.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use jobrow_core::{Job, NewJob, TracingInstrumenter};
use jobrow_db::{JobRepo, run_migrations};
use tracing::info;

use super::connect;

pub async fn migrate(database_url: &str) -> Result<()> {
    let repo = connect(database_url, 1).await?;
    run_migrations(repo.pool())
        .await
        .context("Failed to run migrations")?;
    info!("Migrations applied");
    Ok(())
}

pub async fn enqueue(
    database_url: &str,
    queue: &str,
    priority: i32,
    delay: Option<u64>,
    params: &str,
) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(params).context("Job parameters must be valid JSON")?;
    let new = build_job(params, queue, priority, delay)?;

    let repo = connect(database_url, 1).await?;
    let job = jobrow_scheduler::enqueue(&repo, &TracingInstrumenter, new)
        .await
        .context("Failed to enqueue job")?;

    println!("{}", job.id);
    Ok(())
}

fn build_job(
    params: serde_json::Value,
    queue: &str,
    priority: i32,
    delay: Option<u64>,
) -> Result<NewJob> {
    let mut new = NewJob::new(params).queue(queue).priority(priority);
    if let Some(secs) = delay {
        let secs = i64::try_from(secs).context("Delay is too large")?;
        new = new.scheduled_at(Utc::now() + Duration::seconds(secs));
    }
    Ok(new)
}

pub async fn list(database_url: &str, finished: bool, limit: i64) -> Result<()> {
    let repo = connect(database_url, 1).await?;
    let jobs = if finished {
        repo.list_finished(None, limit).await?
    } else {
        repo.list_unfinished(limit).await?
    };

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:>8}  {:<25}  ERROR",
        "ID", "QUEUE", "PRIORITY", if finished { "FINISHED" } else { "SCHEDULED" }
    );
    for job in &jobs {
        println!("{}", format_row(job, finished));
    }
    Ok(())
}

fn format_row(job: &Job, finished: bool) -> String {
    let when = if finished { job.finished_at } else { job.scheduled_at };
    format!(
        "{:<36}  {:<16}  {:>8}  {:<25}  {}",
        job.id,
        job.queue_name.as_deref().unwrap_or("-"),
        job.priority,
        when.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
        job.error.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_job_applies_delay() {
        let before = Utc::now();
        let new = build_job(serde_json::json!({"a": 1}), "mice", 3, Some(60)).unwrap();
        let job = Job::from_new(new, Utc::now());

        assert_eq!(job.queue_name.as_deref(), Some("mice"));
        assert_eq!(job.priority, 3);
        let at = job.scheduled_at.unwrap();
        assert!(at >= before + Duration::seconds(60));
        assert!(!job.is_eligible_at(Utc::now()));
    }

    #[test]
    fn test_build_job_without_delay_is_eligible_now() {
        let new = build_job(serde_json::json!(null), "default", 0, None).unwrap();
        let job = Job::from_new(new, Utc::now());
        assert!(job.scheduled_at.is_none());
        assert!(job.is_eligible_at(Utc::now()));
    }

    #[test]
    fn test_format_row_uses_placeholders() {
        let job = Job::from_new(NewJob::new(serde_json::json!({})), Utc::now());
        let row = format_row(&job, false);
        assert!(row.starts_with(&job.id.to_string()));
        assert!(row.contains("default"));
        assert!(row.contains(" - "));
    }
}
