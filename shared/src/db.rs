//! Typed CRUD over the `processing_jobs` table.
//!
//! The repository exclusively owns job state transitions. Workers and the
//! HTTP layer never touch rows directly: claiming and the download access
//! counter are single-statement read-modify-writes so no two callers can
//! observe the same claimed job or the same access slot.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use deadpool_postgres::Pool;
use serde_json::Value;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::dto::{JobRecord, JobStatus, ToolId};
use crate::error::{JobError, Result};

const JOB_COLUMNS: &str = "id, tool_id, status, progress, input_file_paths, options, \
     file_name, public_url, file_size, access_count, worker_id, error_message, \
     created_at, updated_at";

/// Partial update applied by [`JobRepository::update_progress`].
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub progress: i32,
    pub file_name: Option<String>,
    pub public_url: Option<String>,
    pub file_size: Option<i64>,
    pub error_message: Option<String>,
}

impl Default for JobUpdate {
    fn default() -> Self {
        Self {
            status: JobStatus::InProgress,
            progress: 0,
            file_name: None,
            public_url: None,
            file_size: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueCounts {
    pub pending: i64,
    pub in_progress: i64,
}

/// Outcome of one atomic access-count bump.
#[derive(Debug, Clone, Copy)]
pub struct AccessDecision {
    pub deleted: bool,
    pub access_count: i32,
}

#[derive(Clone)]
pub struct JobRepository {
    pool: Pool,
}

impl JobRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Ensure the job table and its claim index exist before serving.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS processing_jobs (
                    id               uuid PRIMARY KEY,
                    tool_id          text NOT NULL,
                    status           text NOT NULL DEFAULT 'pending',
                    progress         int  NOT NULL DEFAULT 0,
                    input_file_paths text[] NOT NULL,
                    options          jsonb NOT NULL DEFAULT '{}'::jsonb,
                    file_name        text,
                    public_url       text,
                    file_size        bigint,
                    access_count     int  NOT NULL DEFAULT 0,
                    worker_id        text,
                    error_message    text,
                    created_at       timestamptz NOT NULL DEFAULT now(),
                    updated_at       timestamptz NOT NULL DEFAULT now()
                 );
                 CREATE INDEX IF NOT EXISTS idx_processing_jobs_claim
                     ON processing_jobs (status, created_at);",
            )
            .await?;
        Ok(())
    }

    /// Creates a pending row under the caller-assigned id (raw inputs are
    /// uploaded to id-keyed paths before the row exists) and returns it.
    pub async fn insert_pending(
        &self,
        id: Uuid,
        tool_id: ToolId,
        input_paths: &[String],
        options: &Value,
    ) -> Result<Uuid> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO processing_jobs
                     (id, tool_id, status, progress, input_file_paths, options, access_count)
                 VALUES ($1, $2, 'pending', 0, $3, $4, 0)",
                &[&id, &tool_id.to_string(), &input_paths, options],
            )
            .await?;
        Ok(id)
    }

    /// Atomically claims the oldest pending job for `worker_id`.
    ///
    /// `FOR UPDATE SKIP LOCKED` guarantees that concurrent workers never
    /// observe the same row: a claimed row is invisible to other claimers
    /// within the statement, and committed as `in_progress` afterwards.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<JobRecord>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE processing_jobs
                SET status = 'in_progress', worker_id = $1, updated_at = now()
              WHERE id = (SELECT id FROM processing_jobs
                           WHERE status = 'pending'
                           ORDER BY created_at ASC
                           LIMIT 1
                           FOR UPDATE SKIP LOCKED)
          RETURNING {JOB_COLUMNS}"
        );
        let row = client.query_opt(sql.as_str(), &[&worker_id]).await?;
        row.map(record_from_row).transpose()
    }

    /// Applies a partial state update, rejecting transitions that violate
    /// the job invariants (terminal states absorbing, monotone progress,
    /// success fields mandatory). Runs as a transaction with the row
    /// locked so validation and write are one logical step.
    pub async fn update_progress(&self, job_id: Uuid, update: JobUpdate) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await.map_err(JobError::from)?;

        let row = tx
            .query_opt(
                "SELECT status, progress FROM processing_jobs WHERE id = $1 FOR UPDATE",
                &[&job_id],
            )
            .await?
            .ok_or_else(|| JobError::Database(format!("job {job_id} not found")))?;
        let current_status = parse_status(row.get::<_, String>(0).as_str())?;
        let current_progress: i32 = row.get(1);

        validate_transition(current_status, current_progress, &update)?;

        tx.execute(
            "UPDATE processing_jobs
                SET status = $2,
                    progress = $3,
                    file_name = COALESCE($4, file_name),
                    public_url = COALESCE($5, public_url),
                    file_size = COALESCE($6, file_size),
                    error_message = COALESCE($7, error_message),
                    worker_id = CASE WHEN $2 = 'in_progress' THEN worker_id ELSE NULL END,
                    updated_at = now()
              WHERE id = $1",
            &[
                &job_id,
                &update.status.as_str(),
                &update.progress,
                &update.file_name,
                &update.public_url,
                &update.file_size,
                &update.error_message,
            ],
        )
        .await?;

        tx.commit().await.map_err(JobError::from)?;
        Ok(())
    }

    /// Atomic access-count bump for the proxied download gate.
    ///
    /// The single-row UPDATE is the serialization point: across any number
    /// of concurrent invocations at most `threshold` of them observe
    /// `deleted = false`. When the post-increment count exceeds the
    /// threshold the caller must delete the artifact first and then the
    /// row. Returns `None` when the job is already gone.
    pub async fn increment_access(
        &self,
        job_id: Uuid,
        threshold: i32,
    ) -> Result<Option<AccessDecision>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE processing_jobs
                    SET access_count = access_count + 1, updated_at = now()
                  WHERE id = $1
              RETURNING access_count",
                &[&job_id],
            )
            .await?;
        Ok(row.map(|row| {
            let access_count: i32 = row.get(0);
            AccessDecision {
                deleted: access_count > threshold,
                access_count,
            }
        }))
    }

    /// Read-only projection of one job.
    pub async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = $1");
        let row = client.query_opt(sql.as_str(), &[&job_id]).await?;
        row.map(record_from_row).transpose()
    }

    /// Queue depth used for the submission ETA.
    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT count(*) FILTER (WHERE status = 'pending'),
                        count(*) FILTER (WHERE status = 'in_progress')
                   FROM processing_jobs",
                &[],
            )
            .await?;
        Ok(QueueCounts {
            pending: row.get(0),
            in_progress: row.get(1),
        })
    }

    /// Terminal rows older than `age`; the caller deletes artifacts before
    /// calling [`JobRepository::delete`] per row. Non-terminal rows are
    /// never returned regardless of age.
    pub async fn sweep_terminal_older_than(&self, age: Duration) -> Result<Vec<JobRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age)
                .map_err(|err| JobError::Database(err.to_string()))?;
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs
              WHERE status IN ('succeeded', 'failed') AND updated_at < $1
              ORDER BY updated_at ASC"
        );
        let rows = client.query(sql.as_str(), &[&cutoff]).await?;
        rows.into_iter().map(record_from_row).collect()
    }

    /// Removes a row; idempotent.
    pub async fn delete(&self, job_id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let affected = client
            .execute("DELETE FROM processing_jobs WHERE id = $1", &[&job_id])
            .await?;
        Ok(affected > 0)
    }
}

fn parse_status(raw: &str) -> Result<JobStatus> {
    JobStatus::from_str(raw).map_err(|err| JobError::Database(err.to_string()))
}

fn record_from_row(row: Row) -> Result<JobRecord> {
    let tool_raw: String = row.get("tool_id");
    let tool_id = ToolId::from_str(&tool_raw)
        .map_err(|_| JobError::Database(format!("unknown tool_id '{tool_raw}' in job row")))?;
    let status = parse_status(row.get::<_, String>("status").as_str())?;
    Ok(JobRecord {
        id: row.get("id"),
        tool_id,
        status,
        progress: row.get("progress"),
        input_file_paths: row.get("input_file_paths"),
        options: row.get("options"),
        file_name: row.get("file_name"),
        public_url: row.get("public_url"),
        file_size: row.get("file_size"),
        access_count: row.get("access_count"),
        worker_id: row.get("worker_id"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Pure transition check shared by [`JobRepository::update_progress`].
///
/// Claiming is the only pending → in_progress path, so updates are only
/// accepted on rows a worker already holds.
fn validate_transition(
    current_status: JobStatus,
    current_progress: i32,
    update: &JobUpdate,
) -> Result<()> {
    if current_status.is_terminal() {
        return Err(JobError::Database(format!(
            "job is already {}, update rejected",
            current_status.as_str()
        )));
    }
    if current_status == JobStatus::Pending {
        return Err(JobError::Database(
            "job is pending; it must be claimed before updates".into(),
        ));
    }

    match update.status {
        JobStatus::Pending => Err(JobError::Database(
            "jobs cannot return to pending".into(),
        )),
        JobStatus::InProgress => {
            if !(0..=100).contains(&update.progress) {
                return Err(JobError::Database(format!(
                    "progress {} out of range",
                    update.progress
                )));
            }
            if update.progress < current_progress {
                return Err(JobError::Database(format!(
                    "progress must not decrease ({} -> {})",
                    current_progress, update.progress
                )));
            }
            Ok(())
        }
        JobStatus::Succeeded => {
            if update.progress != 100 {
                return Err(JobError::Database(
                    "succeeded jobs must report progress 100".into(),
                ));
            }
            if update.file_name.is_none() || update.public_url.is_none() || update.file_size.is_none()
            {
                return Err(JobError::Database(
                    "success update requires file_name, public_url and file_size".into(),
                ));
            }
            Ok(())
        }
        JobStatus::Failed => {
            if update.progress != 0 {
                return Err(JobError::Database(
                    "failed jobs must report progress 0".into(),
                ));
            }
            if update.file_name.is_some() || update.public_url.is_some() {
                return Err(JobError::Database(
                    "failed jobs must not carry output fields".into(),
                ));
            }
            if update.error_message.is_none() {
                return Err(JobError::Database(
                    "failure update requires error_message".into(),
                ));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(progress: i32) -> JobUpdate {
        JobUpdate {
            status: JobStatus::InProgress,
            progress,
            ..JobUpdate::default()
        }
    }

    fn success() -> JobUpdate {
        JobUpdate {
            status: JobStatus::Succeeded,
            progress: 100,
            file_name: Some("DocSmart_merged_documents_abcd1234.pdf".into()),
            public_url: Some("http://store/object/public/processed-pdfs/x".into()),
            file_size: Some(1234),
            ..JobUpdate::default()
        }
    }

    fn failure() -> JobUpdate {
        JobUpdate {
            status: JobStatus::Failed,
            progress: 0,
            error_message: Some("gs failed (1): oops".into()),
            ..JobUpdate::default()
        }
    }

    #[test]
    fn progress_is_monotone_within_in_progress() {
        assert!(validate_transition(JobStatus::InProgress, 20, &progress(20)).is_ok());
        assert!(validate_transition(JobStatus::InProgress, 20, &progress(80)).is_ok());
        assert!(validate_transition(JobStatus::InProgress, 80, &progress(20)).is_err());
        assert!(validate_transition(JobStatus::InProgress, 0, &progress(101)).is_err());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        assert!(validate_transition(JobStatus::Succeeded, 100, &progress(100)).is_err());
        assert!(validate_transition(JobStatus::Failed, 0, &success()).is_err());
    }

    #[test]
    fn pending_rows_require_a_claim_first() {
        assert!(validate_transition(JobStatus::Pending, 0, &progress(10)).is_err());
    }

    #[test]
    fn success_requires_output_fields_and_full_progress() {
        assert!(validate_transition(JobStatus::InProgress, 80, &success()).is_ok());

        let mut missing = success();
        missing.public_url = None;
        assert!(validate_transition(JobStatus::InProgress, 80, &missing).is_err());

        let mut short = success();
        short.progress = 99;
        assert!(validate_transition(JobStatus::InProgress, 80, &short).is_err());
    }

    #[test]
    fn failure_resets_progress_and_rejects_output_fields() {
        assert!(validate_transition(JobStatus::InProgress, 40, &failure()).is_ok());

        let mut with_output = failure();
        with_output.file_name = Some("x.pdf".into());
        assert!(validate_transition(JobStatus::InProgress, 40, &with_output).is_err());

        let mut nonzero = failure();
        nonzero.progress = 40;
        assert!(validate_transition(JobStatus::InProgress, 40, &nonzero).is_err());

        let mut silent = failure();
        silent.error_message = None;
        assert!(validate_transition(JobStatus::InProgress, 40, &silent).is_err());
    }
}
