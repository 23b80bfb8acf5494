//! Durable queue of pending GitHub writes.
//!
//! The outbox is the only legal path to external GitHub side effects.
//! Enqueue is idempotent (keyed on run/kind/target/payload-hash), delivery
//! is at-least-once with exponential backoff, and claims use a DB-level
//! compare-and-swap so multiple workers never double-send.

pub mod processor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::github::WriteHandles;
use crate::redaction;
pub use processor::{process_outbox, ProcessOptions, ProcessReport};

pub const WRITE_COMMENT: &str = "comment";
pub const WRITE_PULL_REQUEST: &str = "pull_request";
pub const WRITE_CHECK_RUN: &str = "check_run";
pub const WRITE_BRANCH: &str = "branch";
// Reserved kinds: enqueueable, but processing fails them cleanly.
pub const WRITE_LABEL: &str = "label";
pub const WRITE_REVIEW: &str = "review";
pub const WRITE_PROJECT_FIELD_UPDATE: &str = "project_field_update";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WriteStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl WriteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriteStatus::Completed | WriteStatus::Cancelled)
    }
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WriteStatus::Queued => "queued",
            WriteStatus::Processing => "processing",
            WriteStatus::Completed => "completed",
            WriteStatus::Failed => "failed",
            WriteStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One pending (or settled) external GitHub mutation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GithubWrite {
    pub github_write_id: String,
    pub run_id: String,
    pub kind: String,
    pub target_node_id: String,
    pub target_type: String,
    pub idempotency_key: String,
    pub payload_hash: String,
    pub payload: String,
    pub status: WriteStatus,
    pub retry_count: i64,
    pub error: Option<String>,
    pub github_id: Option<String>,
    pub github_url: Option<String>,
    pub github_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl GithubWrite {
    pub fn payload_json(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct NewWrite {
    pub run_id: String,
    pub kind: String,
    pub target_node_id: String,
    pub target_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnqueueResult {
    pub github_write_id: String,
    pub is_new: bool,
    pub status: WriteStatus,
}

const WRITE_COLUMNS: &str = r#"
    github_write_id, run_id, kind, target_node_id, target_type,
    idempotency_key, payload_hash, payload, status, retry_count, error,
    github_id, github_url, github_number, created_at, updated_at, sent_at
"#;

/// Idempotently enqueue a write. Re-enqueueing the same logical write
/// returns the existing row, whatever state it has reached.
pub async fn enqueue_write(pool: &SqlitePool, input: NewWrite) -> CoreResult<EnqueueResult> {
    let redacted = redaction::redact(&input.payload);
    let idempotency_key = input.idempotency_key.unwrap_or_else(|| {
        format!(
            "{}:{}:{}:{}",
            input.run_id, input.kind, input.target_node_id, redacted.payload_hash
        )
    });

    let mut tx = pool.begin().await?;

    let existing: Option<(String, WriteStatus)> = sqlx::query_as(
        "SELECT github_write_id, status FROM github_writes WHERE idempotency_key = ?1",
    )
    .bind(&idempotency_key)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some((github_write_id, status)) = existing {
        tx.commit().await?;
        debug!(%github_write_id, %idempotency_key, "write already enqueued");
        return Ok(EnqueueResult {
            github_write_id,
            is_new: false,
            status,
        });
    }

    let github_write_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO github_writes (
            github_write_id, run_id, kind, target_node_id, target_type,
            idempotency_key, payload_hash, payload, status, retry_count,
            created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', 0, ?9, ?9)
        "#,
    )
    .bind(&github_write_id)
    .bind(&input.run_id)
    .bind(&input.kind)
    .bind(&input.target_node_id)
    .bind(&input.target_type)
    .bind(&idempotency_key)
    .bind(&redacted.payload_hash)
    .bind(serde_json::to_string(&input.payload)?)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(EnqueueResult {
        github_write_id,
        is_new: true,
        status: WriteStatus::Queued,
    })
}

pub async fn get_write(pool: &SqlitePool, github_write_id: &str) -> CoreResult<Option<GithubWrite>> {
    let row = sqlx::query_as::<_, GithubWrite>(&format!(
        "SELECT {WRITE_COLUMNS} FROM github_writes WHERE github_write_id = ?1"
    ))
    .bind(github_write_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Claim a row for processing. Returns false when another worker won.
pub async fn claim_write(pool: &SqlitePool, github_write_id: &str) -> CoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE github_writes
        SET status = 'processing', updated_at = ?1
        WHERE github_write_id = ?2 AND status IN ('queued', 'failed')
        "#,
    )
    .bind(Utc::now())
    .bind(github_write_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_write_completed(
    pool: &SqlitePool,
    github_write_id: &str,
    handles: &WriteHandles,
) -> CoreResult<()> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE github_writes
        SET status = 'completed', error = NULL, sent_at = ?1, updated_at = ?1,
            github_id = ?2, github_url = ?3, github_number = ?4
        WHERE github_write_id = ?5 AND status = 'processing'
        "#,
    )
    .bind(now)
    .bind(handles.node_id.as_deref().or(handles.id.as_deref()))
    .bind(&handles.url)
    .bind(handles.number)
    .bind(github_write_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(format!(
            "processing write {github_write_id}"
        )));
    }
    Ok(())
}

/// Record a failed attempt. A permanent failure saturates `retry_count`
/// to the retry budget so the fetch filter never selects it again.
pub async fn mark_write_failed(
    pool: &SqlitePool,
    github_write_id: &str,
    error: &str,
    permanent: bool,
    max_retries: u32,
) -> CoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE github_writes
        SET status = 'failed',
            error = ?1,
            retry_count = CASE WHEN ?2 THEN MAX(retry_count + 1, ?3) ELSE retry_count + 1 END,
            updated_at = ?4
        WHERE github_write_id = ?5 AND status = 'processing'
        "#,
    )
    .bind(error)
    .bind(permanent)
    .bind(max_retries as i64)
    .bind(Utc::now())
    .bind(github_write_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(format!(
            "processing write {github_write_id}"
        )));
    }
    Ok(())
}

/// Recover one row stuck in `processing` after a worker crash. Returns
/// false when the row is not processing or not yet stale.
pub async fn reset_stalled_write(
    pool: &SqlitePool,
    github_write_id: &str,
    stale_after: Duration,
) -> CoreResult<bool> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(stale_after)
            .map_err(|e| CoreError::Validation(format!("stale_after out of range: {e}")))?;
    let result = sqlx::query(
        r#"
        UPDATE github_writes
        SET status = 'queued', updated_at = ?1
        WHERE github_write_id = ?2 AND status = 'processing' AND updated_at < ?3
        "#,
    )
    .bind(Utc::now())
    .bind(github_write_id)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Janitor: recover every row stuck in `processing` after worker crashes.
pub async fn reset_stalled_writes(pool: &SqlitePool, stale_after: Duration) -> CoreResult<u64> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(stale_after)
            .map_err(|e| CoreError::Validation(format!("stale_after out of range: {e}")))?;
    let result = sqlx::query(
        r#"
        UPDATE github_writes
        SET status = 'queued', updated_at = ?1
        WHERE status = 'processing' AND updated_at < ?2
        "#,
    )
    .bind(Utc::now())
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Move every non-terminal write for a run to `cancelled`. Called during
/// run cancellation so no orphan comments or PRs appear afterwards.
pub async fn cancel_run_writes(pool: &SqlitePool, run_id: &str) -> CoreResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE github_writes
        SET status = 'cancelled', updated_at = ?1
        WHERE run_id = ?2 AND status IN ('queued', 'processing', 'failed')
        "#,
    )
    .bind(Utc::now())
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Writes for a run, oldest first.
pub async fn list_run_writes(pool: &SqlitePool, run_id: &str) -> CoreResult<Vec<GithubWrite>> {
    let rows = sqlx::query_as::<_, GithubWrite>(&format!(
        "SELECT {WRITE_COLUMNS} FROM github_writes WHERE run_id = ?1 ORDER BY created_at ASC"
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
