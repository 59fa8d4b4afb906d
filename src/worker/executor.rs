//! Subprocess execution for job runs.
//!
//! The command runs under `sh -c` with the argument map passed through the
//! environment, stdout and stderr streamed to a per-run log file, and the
//! tail of stderr kept in memory for the run's `error_summary`. Termination
//! is SIGTERM first, SIGKILL after a grace interval.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::RunState;

/// Bytes of trailing stderr preserved for the error summary.
const STDERR_TAIL_BYTES: usize = 1024;

const KILL_GRACE: Duration = Duration::from_secs(5);

/// Terminal outcome of one subprocess execution.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub job_run_id: Uuid,
    pub final_state: RunState,
    pub exit_code: Option<i32>,
    pub error_summary: String,
}

#[derive(Debug, Clone)]
pub struct JobExecutor {
    logs_dir: PathBuf,
}

impl JobExecutor {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    pub fn log_path(&self, worker_id: &str, job_run_id: Uuid) -> PathBuf {
        self.logs_dir
            .join(worker_id)
            .join(format!("jobrun_{job_run_id}.log"))
    }

    /// Run `command_name` to completion, a timeout, or a token firing.
    ///
    /// - clean exit 0 -> SUCCEEDED
    /// - non-zero exit -> FAILED with the stderr tail in the summary
    /// - timeout -> TIMED_OUT after TERM, then KILL past the grace period
    /// - `cancel` fired -> CANCELED
    /// - `abort` fired -> FAILED with a continuation-abort summary
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        worker_id: &str,
        job_run_id: Uuid,
        command_name: &str,
        args_json: &str,
        timeout_seconds: i32,
        cancel: CancellationToken,
        abort: CancellationToken,
    ) -> ExecutionOutcome {
        tracing::info!(
            job_run_id = %job_run_id,
            command = command_name,
            timeout_seconds,
            "Executing job"
        );

        let log_path = self.log_path(worker_id, job_run_id);
        let child = match self
            .spawn(worker_id, job_run_id, command_name, args_json, &log_path)
            .await
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_run_id = %job_run_id, error = %e, "Failed to spawn job");
                return ExecutionOutcome {
                    job_run_id,
                    final_state: RunState::Failed,
                    exit_code: None,
                    error_summary: format!("failed to start subprocess: {e}"),
                };
            }
        };

        self.supervise(job_run_id, child, timeout_seconds, cancel, abort)
            .await
    }

    async fn spawn(
        &self,
        worker_id: &str,
        job_run_id: Uuid,
        command_name: &str,
        args_json: &str,
        log_path: &Path,
    ) -> std::io::Result<Child> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Command::new("sh")
            .arg("-c")
            .arg(command_name)
            .env("TASKHERD_ARGS_JSON", args_json)
            .env("TASKHERD_JOB_RUN_ID", job_run_id.to_string())
            .env("TASKHERD_WORKER_ID", worker_id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    async fn supervise(
        &self,
        job_run_id: Uuid,
        mut child: Child,
        timeout_seconds: i32,
        cancel: CancellationToken,
        abort: CancellationToken,
    ) -> ExecutionOutcome {
        // Pump stderr concurrently, keeping only the tail.
        let stderr = child.stderr.take();
        let tail_task = tokio::spawn(async move {
            let mut tail: Vec<u8> = Vec::new();
            if let Some(mut stderr) = stderr {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let excess = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..excess);
                    }
                }
            }
            String::from_utf8_lossy(&tail).into_owned()
        });

        let timeout = if timeout_seconds > 0 {
            Duration::from_secs(timeout_seconds as u64)
        } else {
            // Effectively unbounded; the select arm still needs a future.
            Duration::from_secs(u64::MAX / 4)
        };

        enum Ending {
            Exited(std::process::ExitStatus),
            TimedOut,
            Canceled,
            Aborted,
        }

        let ending = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Ending::Exited(status),
                Err(e) => {
                    tracing::error!(job_run_id = %job_run_id, error = %e, "Wait failed");
                    return ExecutionOutcome {
                        job_run_id,
                        final_state: RunState::Failed,
                        exit_code: None,
                        error_summary: format!("wait failed: {e}"),
                    };
                }
            },
            _ = tokio::time::sleep(timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Canceled,
            _ = abort.cancelled() => Ending::Aborted,
        };

        let exit_code = match &ending {
            Ending::Exited(status) => status.code(),
            _ => terminate_with_grace(job_run_id, &mut child).await,
        };

        let stderr_tail = tail_task.await.unwrap_or_default();

        let (final_state, error_summary) = match ending {
            Ending::Exited(status) if status.success() => (RunState::Succeeded, String::new()),
            Ending::Exited(_) => {
                let summary = if stderr_tail.trim().is_empty() {
                    format!("exit_code={exit_code:?}")
                } else {
                    format!("exit_code={exit_code:?}: {}", stderr_tail.trim())
                };
                (RunState::Failed, summary)
            }
            Ending::TimedOut => (
                RunState::TimedOut,
                format!("timed out after {timeout_seconds}s"),
            ),
            Ending::Canceled => (RunState::Canceled, "canceled".to_string()),
            Ending::Aborted => (
                RunState::Failed,
                "continuation aborted: coordinator denied or unreachable".to_string(),
            ),
        };

        tracing::info!(
            job_run_id = %job_run_id,
            state = %final_state,
            exit_code = ?exit_code,
            "Job finished"
        );

        ExecutionOutcome {
            job_run_id,
            final_state,
            exit_code,
            error_summary,
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL. Returns the exit code
/// when the process reported one.
async fn terminate_with_grace(job_run_id: Uuid, child: &mut Child) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(job_run_id = %job_run_id, error = %e, "SIGTERM failed");
        }
        if let Ok(Ok(status)) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
            return status.code();
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(job_run_id = %job_run_id, error = %e, "Force kill failed");
    }
    child.wait().await.ok().and_then(|status| status.code())
}
