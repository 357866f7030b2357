use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine-wide settings, loaded from a YAML file or defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding one subdirectory per job.
    pub jobs_dir: PathBuf,
    /// SQLite URL for the relational job rows.
    pub database_url: String,
    /// Tool catalog file.
    pub catalog_path: PathBuf,
    /// Fallback timeout when neither the selection nor the tool
    /// definition declares one.
    pub default_timeout_secs: u64,
    /// How often the runner polls for cancellation while a process is
    /// in flight (only used with `kill_on_cancel`).
    pub cancel_poll_interval_ms: u64,
    /// When true, a cancellation request also kills the in-flight
    /// process instead of letting it finish. Off by default: the
    /// reference behavior never interrupts a spawned tool.
    pub kill_on_cancel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("scanforge_jobs"),
            database_url: "sqlite://scanforge.db?mode=rwc".to_string(),
            catalog_path: PathBuf::from("catalog.yaml"),
            default_timeout_secs: 3600,
            cancel_poll_interval_ms: 500,
            kill_on_cancel: false,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Explicit path when given, otherwise defaults; a missing default
    /// file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new("scanforge.yaml");
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            bail!("database_url cannot be empty");
        }
        if self.default_timeout_secs == 0 {
            bail!("default_timeout_secs must be greater than 0");
        }
        if self.cancel_poll_interval_ms == 0 {
            bail!("cancel_poll_interval_ms must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_timeout_secs, 3600);
        assert!(!config.kill_on_cancel);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::write(tmp.path(), "jobs_dir: /tmp/jobs\nkill_on_cancel: true\n").unwrap();
        let config = EngineConfig::from_file(tmp.path()).unwrap();
        assert_eq!(config.jobs_dir, PathBuf::from("/tmp/jobs"));
        assert!(config.kill_on_cancel);
        assert_eq!(config.default_timeout_secs, 3600);
    }

    #[test]
    fn rejects_zero_timeout() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::write(tmp.path(), "default_timeout_secs: 0\n").unwrap();
        assert!(EngineConfig::from_file(tmp.path()).is_err());
    }
}
