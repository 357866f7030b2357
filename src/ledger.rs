use crate::catalog::Catalog;
use crate::job::{run_key, JobStatus, LogEvent, LogLevel, RunRecord, RunStatus, ToolSelection};
use crate::paths::now_iso;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const LEDGER_FILE: &str = "summary.json";

/// Durable projection of a job: status mirror, append-only event log
/// and one run record per (tool, target) pair. Source of truth for
/// per-tool detail; the relational row carries only the coarse
/// status/progress other readers poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    pub targets: Vec<String>,
    pub selections: Vec<ToolSelection>,
    pub creation_timestamp: String,
    #[serde(default)]
    pub start_timestamp: Option<String>,
    #[serde(default)]
    pub end_timestamp: Option<String>,
    pub overall_progress: u8,
    #[serde(default)]
    pub logs: Vec<LogEvent>,
    #[serde(default)]
    pub tool_progress: BTreeMap<String, RunRecord>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub results_path: String,
    #[serde(default)]
    pub archive_path: Option<String>,
}

impl JobSummary {
    /// Creates the job with the full selection × target cross product
    /// pre-populated as `pending` records.
    pub fn new(
        job_id: &str,
        name: &str,
        targets: Vec<String>,
        selections: Vec<ToolSelection>,
        catalog: &Catalog,
        results_path: &str,
    ) -> Self {
        let mut tool_progress = BTreeMap::new();
        for target in &targets {
            for selection in &selections {
                let display_name = catalog
                    .get(&selection.tool_id)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| selection.tool_id.clone());
                tool_progress.insert(
                    run_key(&selection.tool_id, target),
                    RunRecord::pending(&selection.tool_id, &display_name),
                );
            }
        }

        let mut summary = Self {
            job_id: job_id.to_string(),
            name: name.to_string(),
            status: JobStatus::Pending,
            targets,
            selections,
            creation_timestamp: now_iso(),
            start_timestamp: None,
            end_timestamp: None,
            overall_progress: 0,
            logs: Vec::new(),
            tool_progress,
            error_message: None,
            results_path: results_path.to_string(),
            archive_path: None,
        };
        summary.log(LogLevel::Info, format!("Job {job_id} created and queued."));
        summary
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEvent::new(level, message));
    }

    pub fn record_mut(&mut self, key: &str) -> Option<&mut RunRecord> {
        self.tool_progress.get_mut(key)
    }

    pub fn total_pairs(&self) -> usize {
        self.targets.len() * self.selections.len()
    }

    /// `floor(100 * terminal_pairs / total_pairs)`; never decreases.
    pub fn recompute_progress(&mut self) -> u8 {
        let total = self.total_pairs();
        if total == 0 {
            return self.overall_progress;
        }
        let done = self
            .tool_progress
            .values()
            .filter(|r| r.status.is_terminal())
            .count();
        let percent = (done * 100 / total) as u8;
        self.overall_progress = self.overall_progress.max(percent);
        self.overall_progress
    }

    /// Terminal aggregation after all pairs ran: `COMPLETED` only when
    /// every record completed, otherwise `COMPLETED_WITH_ERRORS`.
    pub fn aggregate_status(&self) -> JobStatus {
        let all_completed = self
            .tool_progress
            .values()
            .all(|r| r.status == RunStatus::Completed);
        if all_completed {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithErrors
        }
    }
}

/// `None` when no ledger exists yet, so callers can initialize fresh
/// state instead of handling an error.
pub fn load(job_dir: &Path) -> Result<Option<JobSummary>> {
    let path = job_dir.join(LEDGER_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("failed to read ledger {}", path.display()))?;
    let summary = serde_json::from_str(&contents)
        .with_context(|| format!("corrupt ledger {}", path.display()))?;
    Ok(Some(summary))
}

/// Write-then-rename so concurrent readers never observe a partial
/// document.
pub fn save(job_dir: &Path, summary: &JobSummary) -> Result<()> {
    let path = job_dir.join(LEDGER_FILE);
    let tmp = job_dir.join(format!("{LEDGER_FILE}.tmp"));
    let body = serde_json::to_vec_pretty(summary).context("failed to serialize ledger")?;
    fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("failed to replace ledger {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolDefinition;
    use pretty_assertions::assert_eq;

    fn catalog() -> Catalog {
        Catalog::from_definitions(vec![
            ToolDefinition {
                id: "subfinder".to_string(),
                name: "Subfinder".to_string(),
                command_template: "subfinder -d {target}".to_string(),
                params: Vec::new(),
                timeout_secs: Some(600),
                needs_shell: false,
                dangerous: false,
                description: String::new(),
            },
            ToolDefinition {
                id: "dnsx".to_string(),
                name: "DNSX".to_string(),
                command_template: "dnsx -l {targets_file}".to_string(),
                params: Vec::new(),
                timeout_secs: Some(600),
                needs_shell: false,
                dangerous: false,
                description: String::new(),
            },
        ])
        .unwrap()
    }

    fn summary() -> JobSummary {
        JobSummary::new(
            "job1",
            "Scan_job1",
            vec!["a.com".to_string(), "b.com".to_string(), "c.com".to_string()],
            vec![
                ToolSelection::new("subfinder"),
                ToolSelection::new("dnsx"),
            ],
            &catalog(),
            "/tmp/jobs/job1",
        )
    }

    #[test]
    fn cross_product_starts_pending() {
        let summary = summary();
        assert_eq!(summary.total_pairs(), 6);
        assert_eq!(summary.tool_progress.len(), 6);
        assert!(summary
            .tool_progress
            .values()
            .all(|r| r.status == RunStatus::Pending));
        assert_eq!(
            summary.tool_progress["subfinder_on_a.com"].name,
            "Subfinder"
        );
    }

    #[test]
    fn progress_is_floored_and_monotone() {
        let mut summary = summary();
        assert_eq!(summary.recompute_progress(), 0);

        summary.record_mut("subfinder_on_a.com").unwrap().status = RunStatus::Completed;
        summary.record_mut("dnsx_on_a.com").unwrap().status = RunStatus::Error;
        assert_eq!(summary.recompute_progress(), 33);

        // A recompute can never move backwards.
        summary.overall_progress = 50;
        assert_eq!(summary.recompute_progress(), 50);
    }

    #[test]
    fn aggregate_includes_skipped_as_errors() {
        let mut summary = summary();
        for record in summary.tool_progress.values_mut() {
            record.status = RunStatus::Completed;
        }
        assert_eq!(summary.aggregate_status(), JobStatus::Completed);

        summary.record_mut("dnsx_on_b.com").unwrap().status = RunStatus::Skipped;
        assert_eq!(summary.aggregate_status(), JobStatus::CompletedWithErrors);
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut original = summary();
        original.log(LogLevel::Warn, "something noteworthy");
        save(tmp.path(), &original).unwrap();

        let loaded = load(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded.job_id, original.job_id);
        assert_eq!(loaded.tool_progress.len(), 6);
        assert_eq!(loaded.logs.last().unwrap().message, "something noteworthy");
        // No stale temp file once the rename landed.
        assert!(!tmp.path().join(format!("{LEDGER_FILE}.tmp")).exists());
    }

    #[test]
    fn missing_ledger_is_a_sentinel_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load(tmp.path()).unwrap().is_none());
    }
}
