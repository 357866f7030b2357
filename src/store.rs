use crate::job::JobStatus;
use crate::ledger::JobSummary;
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {id} has unrecognized status '{status}'")]
    InvalidStatus { id: String, status: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Coarse job row other parts of the system (status API, UI) read
/// concurrently. Status and overall_progress here are the
/// coordination point for cancellation; per-tool detail lives in the
/// ledger document.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub targets: Vec<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub overall_progress: i64,
    pub error_message: Option<String>,
    pub results_path: String,
    pub archive_path: Option<String>,
}

pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// URL format: `sqlite:///path/to/db.sqlite?mode=rwc` or
    /// `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests; single connection so every query
    /// sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                targets TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                overall_progress INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                results_path TEXT NOT NULL,
                archive_path TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at)")
            .execute(&self.pool)
            .await?;

        debug!("job table schema ready");
        Ok(())
    }

    pub async fn create_job(&self, summary: &JobSummary) -> Result<()> {
        let targets = serde_json::to_string(&summary.targets)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, status, targets, created_at, overall_progress, results_path)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&summary.job_id)
        .bind(&summary.name)
        .bind(JobStatus::Pending.as_str())
        .bind(&targets)
        .bind(&summary.creation_timestamp)
        .bind(&summary.results_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        set_started_at: bool,
        set_ended_at: bool,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let started_at = set_started_at.then(|| now.clone());
        let ended_at = set_ended_at.then(|| now.clone());
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?,
                started_at = COALESCE(?, started_at),
                ended_at = COALESCE(?, ended_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(started_at)
        .bind(ended_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_progress(&self, id: &str, percent: u8) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET overall_progress = ? WHERE id = ?")
            .bind(percent as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// The cancellation poll the engine issues before every pair.
    pub async fn read_status(&self, id: &str) -> Result<JobStatus> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let status: String = row.get("status");
        JobStatus::parse(&status).ok_or_else(|| StoreError::InvalidStatus {
            id: id.to_string(),
            status,
        })
    }

    /// Terminal write: status + end timestamp, progress forced to 100
    /// unless the caller preserves it (CANCELLED), error message only
    /// for engine faults.
    pub async fn finalize(
        &self,
        id: &str,
        status: JobStatus,
        error_message: Option<&str>,
        force_full_progress: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?,
                ended_at = ?,
                error_message = COALESCE(?, error_message),
                overall_progress = CASE WHEN ? THEN 100 ELSE overall_progress END
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(error_message)
        .bind(force_full_progress)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_archive_path(&self, id: &str, path: &str) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET archive_path = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// External-actor transition: only non-terminal, not-yet-cancelled
    /// jobs can move to REQUEST_CANCEL. Returns whether the flag was
    /// set; terminal states are engine-exclusive writes.
    pub async fn request_cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?
            WHERE id = ? AND status IN ('PENDING', 'INITIALIZING', 'RUNNING')
            "#,
        )
        .bind(JobStatus::RequestCancel.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRow>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<JobRow> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let targets_json: String = row.get("targets");
    let status = JobStatus::parse(&status).ok_or_else(|| StoreError::InvalidStatus {
        id: id.clone(),
        status: status.clone(),
    })?;
    Ok(JobRow {
        id,
        name: row.get("name"),
        status,
        targets: serde_json::from_str(&targets_json)?,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        overall_progress: row.get("overall_progress"),
        error_message: row.get("error_message"),
        results_path: row.get("results_path"),
        archive_path: row.get("archive_path"),
    })
}
