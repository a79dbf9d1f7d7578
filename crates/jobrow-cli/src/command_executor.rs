//! Runs job bodies as external processes.

use async_trait::async_trait;
use jobrow_core::{ExecutionContext, Executor, JobFailure, JobOutput};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit code asking for the job to be retried later (`EX_TEMPFAIL`).
pub const EXIT_RETRY: i32 = 75;
/// Exit code reporting that the job can never succeed (`EX_DATAERR`).
pub const EXIT_DISCARD: i32 = 65;

/// Spawns `program` once per job with the job's parameters as JSON on
/// stdin. Stdout, when it is valid JSON, becomes the job's result.
///
/// A zero exit succeeds. [`EXIT_RETRY`] and [`EXIT_DISCARD`] finish the
/// attempt normally but flag the outcome on the context. Any other exit
/// is a raised failure.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<JobOutput, JobFailure> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("JOBROW_JOB_ID", ctx.job_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(queue) = &ctx.queue_name {
            command.env("JOBROW_QUEUE_NAME", queue);
        }

        let mut child = command
            .spawn()
            .map_err(|e| JobFailure::new("Spawn", format!("{}: {e}", self.program)))?;

        let input = params.to_string().into_bytes();
        if let Some(mut stdin) = child.stdin.take() {
            // The program may exit without reading its input.
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| JobFailure::new("Wait", e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code();
        debug!(job_id = %ctx.job_id, program = %self.program, ?code, "Command exited");

        let message = |fallback: String| if stderr.is_empty() { fallback } else { stderr.clone() };

        match code {
            Some(0) => Ok(JobOutput::Value(parse_stdout(&output.stdout))),
            Some(EXIT_RETRY) => {
                ctx.retry_with(JobFailure::new(
                    "TempFail",
                    message(format!("exit status {EXIT_RETRY}")),
                ));
                Ok(JobOutput::unit())
            }
            Some(EXIT_DISCARD) => {
                ctx.discard_with(JobFailure::new(
                    "DataErr",
                    message(format!("exit status {EXIT_DISCARD}")),
                ));
                Ok(JobOutput::unit())
            }
            Some(code) => Err(JobFailure::new(
                "ExitStatus",
                message(format!("exit status {code}")),
            )),
            None => Err(JobFailure::new(
                "Signal",
                message("terminated by signal".to_string()),
            )),
        }
    }
}

fn parse_stdout(stdout: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}
