use crate::archive::archive_job_dir;
use crate::catalog::Catalog;
use crate::command::CommandBuilder;
use crate::config::EngineConfig;
use crate::job::{run_key, JobStatus, LogLevel, RunRecord, RunStatus, ToolSelection};
use crate::ledger::{self, JobSummary};
use crate::paths::{now_iso, timestamp_str, JobPaths};
use crate::runner::{ProcessRunner, RunnerError};
use crate::store::JobStore;
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const STDERR_SNIPPET_CHARS: usize = 250;

/// Drives a job end to end: directory setup, sequential tool runs
/// over every (target, tool) pair, dual-write progress into the
/// ledger document and the job row, and archiving on completion.
pub struct Engine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    store: Arc<JobStore>,
}

impl Engine {
    pub fn new(config: EngineConfig, catalog: Arc<Catalog>, store: Arc<JobStore>) -> Self {
        Self {
            config,
            catalog,
            store,
        }
    }

    /// Loads the catalog and opens the database named by the config.
    pub async fn bootstrap(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let catalog = Catalog::from_file(&config.catalog_path).with_context(|| {
            format!("cannot load tool catalog {}", config.catalog_path.display())
        })?;
        let store = JobStore::connect(&config.database_url)
            .await
            .with_context(|| format!("cannot open job database {}", config.database_url))?;
        Ok(Self::new(config, Arc::new(catalog), Arc::new(store)))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn job_paths(&self, job_id: &str) -> JobPaths {
        JobPaths::new(&self.config.jobs_dir, job_id)
    }

    /// Creates the job directory, targets file, ledger and job row.
    /// The ledger is written before the row; if the row insert fails
    /// the directory is removed so no orphan remains.
    pub async fn create_job(
        &self,
        name: &str,
        targets: Vec<String>,
        selections: Vec<ToolSelection>,
    ) -> Result<String> {
        if targets.is_empty() {
            bail!("a job needs at least one target");
        }
        if selections.is_empty() {
            bail!("a job needs at least one tool selection");
        }
        // Ledger records are keyed (tool, target); duplicates would
        // share one record and corrupt the pair count.
        let mut seen_tools = BTreeSet::new();
        for selection in &selections {
            if !seen_tools.insert(selection.tool_id.as_str()) {
                bail!("tool '{}' is selected more than once", selection.tool_id);
            }
            if self.catalog.get(&selection.tool_id).is_none() {
                warn!("selection '{}' is not in the catalog", selection.tool_id);
            }
        }
        let mut seen_targets = BTreeSet::new();
        for target in &targets {
            if !seen_targets.insert(target.as_str()) {
                bail!("target '{target}' is listed more than once");
            }
        }

        let job_id = timestamp_str();
        let paths = self.job_paths(&job_id);
        paths
            .create()
            .with_context(|| format!("cannot create job directory {}", paths.root().display()))?;
        paths.write_targets_file(&targets)?;

        let summary = JobSummary::new(
            &job_id,
            name,
            targets,
            selections,
            &self.catalog,
            &paths.root().display().to_string(),
        );
        ledger::save(paths.root(), &summary)?;

        if let Err(err) = self.store.create_job(&summary).await {
            let _ = fs::remove_dir_all(paths.root());
            return Err(err).context("cannot register job row");
        }

        info!(job_id = %job_id, "job created");
        Ok(job_id)
    }

    /// Runs a PENDING job to a terminal state. The returned status is
    /// the terminal one; engine faults are themselves recorded as
    /// `ERROR` before the error is surfaced.
    pub async fn execute(&self, job_id: &str) -> Result<JobStatus> {
        let paths = self.job_paths(job_id);
        let mut summary = ledger::load(paths.root())?
            .with_context(|| format!("job {job_id} has no ledger"))?;

        let status = self.store.read_status(job_id).await?;
        if status.cancel_seen() {
            // Cancelled before the engine ever picked it up.
            return self.finish_cancelled(&paths, &mut summary).await;
        }
        if status != JobStatus::Pending {
            bail!("job {job_id} is {status}, only PENDING jobs can start");
        }

        match self.run_job(&paths, &mut summary).await {
            Ok(status) => Ok(status),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(job_id = %job_id, "engine fault: {message}");
                summary.status = JobStatus::Error;
                summary.error_message = Some(message.clone());
                summary.end_timestamp = Some(now_iso());
                summary.overall_progress = 100;
                summary.log(LogLevel::Error, format!("Job failed: {message}"));
                let _ = ledger::save(paths.root(), &summary);
                let _ = self
                    .store
                    .finalize(job_id, JobStatus::Error, Some(&message), true)
                    .await;
                Err(err)
            }
        }
    }

    async fn run_job(&self, paths: &JobPaths, summary: &mut JobSummary) -> Result<JobStatus> {
        let job_id = summary.job_id.clone();

        self.transition(paths, summary, JobStatus::Initializing, false)
            .await?;
        summary.start_timestamp = Some(now_iso());
        summary.log(LogLevel::Info, "Job started.");
        self.transition(paths, summary, JobStatus::Running, true)
            .await?;

        let cancel_rx = self.spawn_cancel_watch(&job_id);
        let outputs_dir = paths.tool_outputs();
        let targets = summary.targets.clone();
        let selections = summary.selections.clone();

        let mut cancelled = false;
        'targets: for target in &targets {
            for selection in &selections {
                if self.store.read_status(&job_id).await?.cancel_seen() {
                    cancelled = true;
                    break 'targets;
                }
                self.run_pair(paths, summary, selection, target, &outputs_dir, &cancel_rx)
                    .await?;
            }
        }

        if cancelled {
            return self.finish_cancelled(paths, summary).await;
        }

        let status = summary.aggregate_status();
        summary.status = status;
        summary.end_timestamp = Some(now_iso());
        summary.overall_progress = 100;
        let level = if status == JobStatus::Completed {
            LogLevel::Success
        } else {
            LogLevel::Warn
        };
        summary.log(level, format!("Job finished with status {status}."));
        ledger::save(paths.root(), summary)?;
        self.store.finalize(&job_id, status, None, true).await?;

        self.archive(paths, summary).await;
        info!(job_id = %job_id, status = %status, "job finished");
        Ok(status)
    }

    /// One (tool, target) pair. Every failure mode lands in the run
    /// record; only I/O on the ledger or the store aborts the job.
    async fn run_pair(
        &self,
        paths: &JobPaths,
        summary: &mut JobSummary,
        selection: &ToolSelection,
        target: &str,
        outputs_dir: &Path,
        cancel_rx: &Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let key = run_key(&selection.tool_id, target);

        let Some(tool) = self.catalog.get(&selection.tool_id).cloned() else {
            summary.log(
                LogLevel::Warn,
                format!("Tool '{}' is not in the catalog, skipping.", selection.tool_id),
            );
            self.settle_record(paths, summary, &key, |r| {
                r.status = RunStatus::Skipped;
                r.error_message = Some("Tool not found in catalog.".to_string());
            })
            .await?;
            return Ok(());
        };

        if let Some(record) = summary.record_mut(&key) {
            record.status = RunStatus::Running;
            record.start_time = Some(now_iso());
        }
        ledger::save(paths.root(), summary)?;

        let built = match CommandBuilder::new(&tool, target, paths).build(selection) {
            Ok(built) => built,
            Err(err) => {
                let skipped = err.is_tool_missing();
                let message = err.to_string();
                summary.log(LogLevel::Warn, message.clone());
                self.settle_record(paths, summary, &key, |r| {
                    r.status = if skipped {
                        RunStatus::Skipped
                    } else {
                        RunStatus::Error
                    };
                    r.error_message = Some(message);
                })
                .await?;
                return Ok(());
            }
        };

        summary.log(LogLevel::Command, built.display.clone());
        if let Some(record) = summary.record_mut(&key) {
            record.command = Some(built.display.clone());
        }
        ledger::save(paths.root(), summary)?;

        let timeout = selection
            .timeout_secs
            .filter(|t| *t > 0)
            .or_else(|| tool.timeout_secs.filter(|t| *t > 0))
            .unwrap_or(self.config.default_timeout_secs);

        let outcome = ProcessRunner::run(
            &built,
            outputs_dir,
            Duration::from_secs(timeout),
            cancel_rx.clone(),
        )
        .await;

        let artifact = artifact_reference(&built.artifact_path);
        self.settle_record(paths, summary, &key, |r| match outcome {
            Ok(output) if output.timed_out => {
                r.status = RunStatus::Timeout;
                r.error_message = Some(format!("Timed out after {timeout} seconds."));
            }
            Ok(output) if output.cancelled => {
                r.status = RunStatus::Error;
                r.error_message = Some("Cancelled while running.".to_string());
            }
            Ok(output) if output.success() => {
                r.status = RunStatus::Completed;
                r.output_file = artifact;
            }
            Ok(output) => {
                r.status = RunStatus::Error;
                r.output_file = artifact;
                r.error_message = Some(format!(
                    "Exit code {}. Stderr: {}",
                    output.exit_code.unwrap_or(-1),
                    truncate_chars(output.stderr.trim(), STDERR_SNIPPET_CHARS),
                ));
            }
            Err(RunnerError::NotFound { ref binary, .. }) => {
                r.status = RunStatus::Skipped;
                r.error_message = Some(format!("Executable '{binary}' not found on PATH."));
            }
            Err(ref err) => {
                r.status = RunStatus::Error;
                r.error_message = Some(err.to_string());
            }
        })
        .await?;
        Ok(())
    }

    /// Terminal write for one record plus the dual progress write.
    async fn settle_record(
        &self,
        paths: &JobPaths,
        summary: &mut JobSummary,
        key: &str,
        apply: impl FnOnce(&mut RunRecord),
    ) -> Result<()> {
        if let Some(record) = summary.record_mut(key) {
            apply(record);
            record.end_time = Some(now_iso());
            if let Some(message) = record.error_message.clone() {
                let name = record.name.clone();
                summary.log(LogLevel::Error, format!("{name}: {message}"));
            }
        }
        let percent = summary.recompute_progress();
        ledger::save(paths.root(), summary)?;
        self.store.update_progress(&summary.job_id, percent).await?;
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        paths: &JobPaths,
        summary: &mut JobSummary,
    ) -> Result<JobStatus> {
        summary.status = JobStatus::Cancelled;
        summary.end_timestamp = Some(now_iso());
        summary.log(LogLevel::Warn, "Job cancelled; remaining tools were not run.");
        ledger::save(paths.root(), summary)?;
        self.store
            .finalize(&summary.job_id, JobStatus::Cancelled, None, false)
            .await?;
        self.archive(paths, summary).await;
        info!(job_id = %summary.job_id, "job cancelled");
        Ok(JobStatus::Cancelled)
    }

    /// Ledger + row transition in ledger-first order.
    async fn transition(
        &self,
        paths: &JobPaths,
        summary: &mut JobSummary,
        status: JobStatus,
        set_started: bool,
    ) -> Result<()> {
        summary.status = status;
        ledger::save(paths.root(), summary)?;
        self.store
            .update_status(&summary.job_id, status, set_started, false)
            .await?;
        Ok(())
    }

    /// Best effort: an archive failure never changes the terminal
    /// status, it only leaves a ledger log entry.
    async fn archive(&self, paths: &JobPaths, summary: &mut JobSummary) {
        let job_dir = paths.root().to_path_buf();
        let result = tokio::task::spawn_blocking(move || archive_job_dir(&job_dir)).await;
        match result {
            Ok(Ok(zip_path)) => {
                let zip = zip_path.display().to_string();
                summary.archive_path = Some(zip.clone());
                summary.log(LogLevel::Info, format!("Results archived to {zip}."));
                if let Err(err) = self.store.set_archive_path(&summary.job_id, &zip).await {
                    warn!("cannot record archive path: {err}");
                }
            }
            Ok(Err(err)) => {
                summary.log(LogLevel::Warn, format!("Archiving failed: {err:#}"));
            }
            Err(err) => {
                summary.log(LogLevel::Warn, format!("Archiving task failed: {err}"));
            }
        }
        if let Err(err) = ledger::save(paths.root(), summary) {
            warn!("cannot save ledger after archiving: {err:#}");
        }
    }

    /// With `kill_on_cancel` a background task polls the job row and
    /// flips the watch channel once REQUEST_CANCEL appears, so the
    /// runner can kill the in-flight process instead of letting it
    /// finish. Without it cancellation only takes effect between
    /// pairs.
    fn spawn_cancel_watch(&self, job_id: &str) -> Option<watch::Receiver<bool>> {
        if !self.config.kill_on_cancel {
            return None;
        }
        let (tx, rx) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let job_id = job_id.to_string();
        let interval = Duration::from_millis(self.config.cancel_poll_interval_ms.max(50));
        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    break;
                }
                match store.read_status(&job_id).await {
                    Ok(status) if status.cancel_seen() => {
                        let _ = tx.send(true);
                        break;
                    }
                    Ok(status) if status.is_terminal() => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("cancel watch cannot read job {job_id}: {err}");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
        Some(rx)
    }
}

/// `None` unless the expected artifact materialized; directories are
/// referenced with a trailing slash.
fn artifact_reference(path: &Path) -> Option<String> {
    let meta = fs::metadata(path).ok()?;
    if meta.is_dir() {
        Some(format!("{}/", path.display()))
    } else if meta.len() > 0 {
        Some(path.display().to_string())
    } else {
        None
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}
