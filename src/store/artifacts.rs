use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::redaction;

pub const ARTIFACT_PLAN: &str = "plan";
pub const ARTIFACT_REVIEW: &str = "review";
pub const ARTIFACT_TEST_REPORT: &str = "test_report";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Valid,
    Invalid,
}

/// An agent-produced output (plan, review, test report). Versions increment
/// per (run, type); only `valid` artifacts are visible to gate evaluation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Artifact {
    pub artifact_id: String,
    pub run_id: String,
    pub artifact_type: String,
    pub version: i64,
    pub content_markdown: Option<String>,
    pub blob_ref: Option<String>,
    pub size_bytes: i64,
    pub checksum_sha256: Option<String>,
    pub validation_status: ValidationStatus,
    pub source_tool_invocation_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub run_id: String,
    pub artifact_type: String,
    pub content_markdown: Option<String>,
    pub blob_ref: Option<String>,
    pub source_tool_invocation_id: Option<String>,
    pub created_by: String,
}

const ARTIFACT_COLUMNS: &str = r#"
    artifact_id, run_id, artifact_type, version, content_markdown, blob_ref,
    size_bytes, checksum_sha256, validation_status, source_tool_invocation_id,
    created_by, created_at, updated_at
"#;

/// Insert a new artifact version. The version counter is scoped to
/// `(run_id, artifact_type)` and allocated inside the caller's transaction.
pub async fn create_artifact(
    conn: &mut SqliteConnection,
    input: NewArtifact,
) -> CoreResult<Artifact> {
    let version: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM artifacts WHERE run_id = ?1 AND artifact_type = ?2",
    )
    .bind(&input.run_id)
    .bind(&input.artifact_type)
    .fetch_one(&mut *conn)
    .await?;

    let content = input.content_markdown.as_deref().unwrap_or("");
    let now = Utc::now();
    let artifact = Artifact {
        artifact_id: Uuid::new_v4().to_string(),
        run_id: input.run_id,
        artifact_type: input.artifact_type,
        version,
        size_bytes: content.len() as i64,
        checksum_sha256: Some(redaction::sha256_hex(content.as_bytes())),
        content_markdown: input.content_markdown,
        blob_ref: input.blob_ref,
        validation_status: ValidationStatus::Pending,
        source_tool_invocation_id: input.source_tool_invocation_id,
        created_by: input.created_by,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO artifacts (
            artifact_id, run_id, artifact_type, version, content_markdown, blob_ref,
            size_bytes, checksum_sha256, validation_status, source_tool_invocation_id,
            created_by, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
    )
    .bind(&artifact.artifact_id)
    .bind(&artifact.run_id)
    .bind(&artifact.artifact_type)
    .bind(artifact.version)
    .bind(&artifact.content_markdown)
    .bind(&artifact.blob_ref)
    .bind(artifact.size_bytes)
    .bind(&artifact.checksum_sha256)
    .bind(artifact.validation_status)
    .bind(&artifact.source_tool_invocation_id)
    .bind(&artifact.created_by)
    .bind(artifact.created_at)
    .bind(artifact.updated_at)
    .execute(conn)
    .await?;

    Ok(artifact)
}

pub async fn set_validation_status(
    pool: &SqlitePool,
    artifact_id: &str,
    status: ValidationStatus,
) -> CoreResult<()> {
    let result =
        sqlx::query("UPDATE artifacts SET validation_status = ?1, updated_at = ?2 WHERE artifact_id = ?3")
            .bind(status)
            .bind(Utc::now())
            .bind(artifact_id)
            .execute(pool)
            .await?;
    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(format!("artifact {artifact_id}")));
    }
    Ok(())
}

/// All validated artifacts for a run, newest version first within each type.
pub async fn list_valid_artifacts(
    conn: &mut SqliteConnection,
    run_id: &str,
) -> CoreResult<Vec<Artifact>> {
    let artifacts = sqlx::query_as::<_, Artifact>(&format!(
        r#"
        SELECT {ARTIFACT_COLUMNS} FROM artifacts
        WHERE run_id = ?1 AND validation_status = 'valid'
        ORDER BY artifact_type ASC, version DESC
        "#
    ))
    .bind(run_id)
    .fetch_all(conn)
    .await?;
    Ok(artifacts)
}

pub async fn latest_valid_artifact(
    pool: &SqlitePool,
    run_id: &str,
    artifact_type: &str,
) -> CoreResult<Option<Artifact>> {
    let artifact = sqlx::query_as::<_, Artifact>(&format!(
        r#"
        SELECT {ARTIFACT_COLUMNS} FROM artifacts
        WHERE run_id = ?1 AND artifact_type = ?2 AND validation_status = 'valid'
        ORDER BY version DESC
        LIMIT 1
        "#
    ))
    .bind(run_id)
    .bind(artifact_type)
    .fetch_optional(pool)
    .await?;
    Ok(artifact)
}
