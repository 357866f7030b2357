use chrono::{Local, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const TARGETS_FILE: &str = "targets.txt";
pub const TOOL_OUTPUTS_DIR: &str = "tool_outputs";

/// Filesystem-safe timestamp used for job ids and artifact names.
pub fn timestamp_str() -> String {
    let now = Local::now();
    format!(
        "{}_{:06}",
        now.format("%Y%m%d_%H%M%S"),
        now.timestamp_subsec_micros()
    )
}

/// ISO-8601 timestamp for ledger entries and log events.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Targets appear in artifact filenames; strip URL syntax that would
/// break paths.
pub fn sanitize_target(target: &str) -> String {
    target
        .replace("://", "_")
        .replace('/', "_")
        .replace(':', "_")
}

/// `{tool}_{sanitized_target}_{timestamp}`, the base every per-run
/// artifact name is derived from.
pub fn artifact_base(tool_id: &str, target: &str) -> String {
    format!("{}_{}_{}", tool_id, sanitize_target(target), timestamp_str())
}

/// On-disk layout of a single job directory.
#[derive(Debug, Clone)]
pub struct JobPaths {
    root: PathBuf,
}

impl JobPaths {
    pub fn new(jobs_dir: &Path, job_id: &str) -> Self {
        Self {
            root: jobs_dir.join(job_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tool_outputs(&self) -> PathBuf {
        self.root.join(TOOL_OUTPUTS_DIR)
    }

    pub fn targets_file(&self) -> PathBuf {
        self.root.join(TARGETS_FILE)
    }

    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(self.tool_outputs())
    }

    /// Written once at job creation; `{targets_file}` placeholders
    /// resolve to this path.
    pub fn write_targets_file(&self, targets: &[String]) -> io::Result<()> {
        let mut body = targets.join("\n");
        body.push('\n');
        fs::write(self.targets_file(), body)
    }
}
