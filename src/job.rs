use crate::paths::now_iso;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Coarse job lifecycle. `REQUEST_CANCEL` is written by an external
/// actor; every other transition belongs to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Initializing,
    Running,
    RequestCancel,
    Completed,
    CompletedWithErrors,
    Cancelled,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Initializing => "INITIALIZING",
            JobStatus::Running => "RUNNING",
            JobStatus::RequestCancel => "REQUEST_CANCEL",
            JobStatus::Completed => "COMPLETED",
            JobStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "INITIALIZING" => Some(JobStatus::Initializing),
            "RUNNING" => Some(JobStatus::Running),
            "REQUEST_CANCEL" => Some(JobStatus::RequestCancel),
            "COMPLETED" => Some(JobStatus::Completed),
            "COMPLETED_WITH_ERRORS" => Some(JobStatus::CompletedWithErrors),
            "CANCELLED" => Some(JobStatus::Cancelled),
            "ERROR" => Some(JobStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithErrors
                | JobStatus::Cancelled
                | JobStatus::Error
        )
    }

    /// True once an external actor has asked for cancellation, or the
    /// job has already been cancelled.
    pub fn cancel_seen(&self) -> bool {
        matches!(self, JobStatus::RequestCancel | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-status of one (tool, target) pair. Leaves `pending` exactly
/// once and never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
    Timeout,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Error | RunStatus::Timeout | RunStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
            RunStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool chosen for a job; expanded against every target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSelection {
    pub tool_id: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_args: String,
    /// Per-invocation timeout override; honored only when positive.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ToolSelection {
    pub fn new(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            params: BTreeMap::new(),
            extra_args: String::new(),
            timeout_secs: None,
        }
    }
}

/// Progress/result state for one (tool, target) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub tool_id: String,
    pub name: String,
    pub status: RunStatus,
    pub command: Option<String>,
    pub output_file: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub error_message: Option<String>,
}

impl RunRecord {
    pub fn pending(tool_id: &str, name: &str) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            name: name.to_string(),
            status: RunStatus::Pending,
            command: None,
            output_file: None,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }
}

/// Ledger key for a pair.
pub fn run_key(tool_id: &str, target: &str) -> String {
    format!("{}_on_{}", tool_id, target)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
    Command,
}

/// Append-only, human-readable ledger event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: now_iso(),
            level,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Initializing,
            JobStatus::Running,
            JobStatus::RequestCancel,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Cancelled,
            JobStatus::Error,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("RUNNING_FAST"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::RequestCancel.is_terminal());
        assert!(JobStatus::RequestCancel.cancel_seen());
        assert!(RunStatus::Skipped.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn run_key_format() {
        assert_eq!(run_key("nmap_quick", "10.0.0.1"), "nmap_quick_on_10.0.0.1");
    }
}
