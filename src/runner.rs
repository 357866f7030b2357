use crate::command::{BuiltCommand, Invocation};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::debug;

/// Inability to start or supervise the process. A non-zero exit code
/// is not an error here; it is reported as data in [`RunOutput`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("executable '{binary}' not found: {source}")]
    NotFound { binary: String, source: io::Error },
    #[error("failed to spawn '{binary}': {source}")]
    Spawn { binary: String, source: io::Error },
    #[error("failed to supervise '{binary}': {source}")]
    Wait { binary: String, source: io::Error },
    #[error("failed to write run artifact: {0}")]
    Artifact(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Killed by a cancellation request (only with `kill_on_cancel`).
    pub cancelled: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }
}

/// Supervises one external process: spawn as argv or via `sh -c`,
/// capture both streams fully, enforce a hard wall-clock timeout and
/// write a raw transcript next to the primary artifact.
pub struct ProcessRunner;

impl ProcessRunner {
    pub async fn run(
        built: &BuiltCommand,
        working_dir: &Path,
        timeout: Duration,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutput, RunnerError> {
        let binary = match &built.invocation {
            Invocation::Argv(argv) => argv.first().cloned().unwrap_or_default(),
            Invocation::Shell(line) => line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string(),
        };

        let mut cmd = match &built.invocation {
            Invocation::Argv(argv) => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            Invocation::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        };
        cmd.current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                RunnerError::NotFound {
                    binary: binary.clone(),
                    source,
                }
            } else {
                RunnerError::Spawn {
                    binary: binary.clone(),
                    source,
                }
            }
        })?;

        let stdout_task = tokio::spawn(read_to_string(child.stdout.take()));
        let stderr_task = tokio::spawn(read_to_string(child.stderr.take()));

        let mut timed_out = false;
        let mut cancelled = false;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        enum WaitOutcome {
            Exited(std::process::ExitStatus),
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status.map_err(|source| {
                RunnerError::Wait { binary: binary.clone(), source }
            })?),
            _ = &mut deadline => WaitOutcome::TimedOut,
            _ = cancel_requested(&mut cancel) => WaitOutcome::Cancelled,
        };

        let status = match outcome {
            WaitOutcome::Exited(status) => Some(status),
            WaitOutcome::TimedOut => {
                debug!("run of '{}' exceeded {}s, killing", binary, timeout.as_secs());
                timed_out = true;
                kill_process_tree(&mut child).await;
                None
            }
            WaitOutcome::Cancelled => {
                debug!("cancellation observed mid-run, killing '{}'", binary);
                cancelled = true;
                kill_process_tree(&mut child).await;
                None
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let output = RunOutput {
            exit_code: status.and_then(|s| s.code()),
            stdout,
            stderr,
            timed_out,
            cancelled,
        };

        Self::write_artifacts(built, working_dir, &output).await?;
        Ok(output)
    }

    /// Raw transcript is written regardless of outcome; stdout is
    /// mirrored into the expected artifact only when the template did
    /// not designate an output placeholder of its own.
    async fn write_artifacts(
        built: &BuiltCommand,
        working_dir: &Path,
        output: &RunOutput,
    ) -> Result<(), RunnerError> {
        let outcome = if output.timed_out {
            "TIMEOUT EXPIRED".to_string()
        } else if output.cancelled {
            "KILLED BY CANCELLATION".to_string()
        } else {
            output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        };
        let transcript = format!(
            "--- Command ---\n{}\n\n--- Return Code: {} ---\n\n--- STDOUT ---\n{}\n\n--- STDERR ---\n{}\n",
            built.display,
            outcome,
            if output.stdout.is_empty() { "<no stdout>" } else { output.stdout.as_str() },
            if output.stderr.is_empty() { "<no stderr>" } else { output.stderr.as_str() },
        );
        let transcript_path = working_dir.join(format!("{}_raw.log", built.artifact_base));
        tokio::fs::write(&transcript_path, transcript).await?;

        if !built.declares_output && !output.stdout.is_empty() {
            tokio::fs::write(&built.artifact_path, &output.stdout).await?;
        }
        Ok(())
    }
}

async fn read_to_string<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    match pipe {
        Some(mut pipe) => {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        }
        None => String::new(),
    }
}

/// Resolves when the cancel flag flips to true; pends forever when no
/// probe was supplied so the select arm never fires.
async fn cancel_requested(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

async fn kill_process_tree(child: &mut Child) {
    // The child runs in its own process group; take the group down so
    // shell pipelines do not outlive it.
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}
