//! Spawns the downloader subprocess for one attempt and streams its output.
//!
//! A [`Runner`] owns no state of its own; `execute_attempt` is a free function
//! over a `&Arc<Job>` so the Scheduler can call it from inside `runDownload`
//! without the Runner needing to know about the job table or queue.

pub mod error;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

pub use error::RunnerError;

use crate::job::Job;
use crate::output::LineSplitter;

/// The external program invoked for every attempt, per the downloader subprocess contract.
pub const DOWNLOADER_PROGRAM: &str = "ytdlp-nfo";

/// Runs one attempt of the downloader subprocess against `job`'s URL.
///
/// `token` is a child of the Scheduler's shutdown token (or of a per-job
/// cancellation), so both process shutdown and an explicit delete observe the
/// same cancellation path. The token is stashed on the job for the duration
/// of the attempt and cleared before returning.
#[instrument(skip(job, token), fields(job_id = job.id(), url))]
pub async fn execute_attempt(
    job: &Arc<Job>,
    url: &str,
    download_dir: &Path,
    token: CancellationToken,
) -> Result<(), RunnerError> {
    tokio::fs::create_dir_all(download_dir)
        .await
        .map_err(RunnerError::CreateDownloadDir)?;

    job.set_cancel(Some(token.clone())).await;

    let spawn_result = Command::new(DOWNLOADER_PROGRAM)
        .arg(url)
        .current_dir(download_dir)
        .env("PYTHONUNBUFFERED", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawn_result {
        Ok(child) => child,
        Err(e) => {
            job.set_cancel(None).await;
            return Err(RunnerError::Spawn(e));
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(pump_stdout(stdout, job.clone()));
    let stderr_task = tokio::spawn(pump_stderr(stderr, job.clone()));

    let wait_outcome = tokio::select! {
        biased;
        () = token.cancelled() => None,
        status = child.wait() => Some(status),
    };

    let Some(status) = wait_outcome else {
        if let Err(e) = child.start_kill() {
            warn!(job_id = job.id(), error = %e, "failed to signal kill on cancelled attempt");
        }
        let _ = child.wait().await;
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        job.set_cancel(None).await;
        return Err(RunnerError::Cancelled);
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;
    job.set_cancel(None).await;

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(RunnerError::NonZeroExit(describe_exit(&status))),
        Err(e) => Err(RunnerError::NonZeroExit(format!("wait failed: {e}"))),
    }
}

/// Reads a piped stream to completion, feeding every completed line to the
/// job's output buffer through the CR/LF/CRLF-aware splitter.
async fn pump(mut reader: impl AsyncReadExt + Unpin, job: Arc<Job>) {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                for line in splitter.feed(&chunk) {
                    job.append(&line).await;
                }
            }
        }
    }
    if let Some(line) = splitter.flush() {
        job.append(&line).await;
    }
}

async fn pump_stdout(stream: Option<ChildStdout>, job: Arc<Job>) {
    if let Some(stream) = stream {
        pump(stream, job).await;
    }
}

async fn pump_stderr(stream: Option<ChildStderr>, job: Arc<Job>) {
    if let Some(stream) = stream {
        pump(stream, job).await;
    }
}

#[cfg(unix)]
fn describe_exit(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => match status.signal() {
            Some(signal) => format!("signal {signal}"),
            None => "unknown termination".to_string(),
        },
    }
}

#[cfg(not(unix))]
fn describe_exit(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "unknown termination".to_string(),
    }
}
