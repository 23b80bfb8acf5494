use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OverrideKind {
    PolicyException,
    SkipTests,
    AcceptWithIssues,
}

impl fmt::Display for OverrideKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverrideKind::PolicyException => "policy_exception",
            OverrideKind::SkipTests => "skip_tests",
            OverrideKind::AcceptWithIssues => "accept_with_issues",
        };
        f.write_str(s)
    }
}

/// How far an override reaches from the run it was recorded on. Broader
/// scopes take precedence when several overrides cover the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OverrideScope {
    ThisRun,
    ThisTask,
    ThisRepo,
    ProjectWide,
}

/// A scoped, justified operator decision that forces a gate outcome or
/// authorizes a policy exception.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Override {
    pub override_id: String,
    pub run_id: String,
    pub kind: OverrideKind,
    pub target_id: Option<String>,
    pub scope: OverrideScope,
    pub operator: String,
    pub justification: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOverride {
    pub run_id: String,
    pub kind: OverrideKind,
    pub target_id: Option<String>,
    pub scope: OverrideScope,
    pub operator: String,
    pub justification: String,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn create_override(
    conn: &mut SqliteConnection,
    input: NewOverride,
) -> CoreResult<Override> {
    let row = Override {
        override_id: Uuid::new_v4().to_string(),
        run_id: input.run_id,
        kind: input.kind,
        target_id: input.target_id,
        scope: input.scope,
        operator: input.operator,
        justification: input.justification,
        expires_at: input.expires_at,
        created_at: Utc::now(),
    };
    sqlx::query(
        r#"
        INSERT INTO overrides (
            override_id, run_id, kind, target_id, scope, operator,
            justification, expires_at, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&row.override_id)
    .bind(&row.run_id)
    .bind(row.kind)
    .bind(&row.target_id)
    .bind(row.scope)
    .bind(&row.operator)
    .bind(&row.justification)
    .bind(row.expires_at)
    .bind(row.created_at)
    .execute(conn)
    .await?;
    Ok(row)
}

/// Find the highest-precedence active override of `kind` covering `run_id`.
///
/// The overrides table joins against runs twice: once for the run the
/// override was recorded on, once for the target run. Scope constraints
/// relate the two; unexpired rows only. Ties break broader-scope-first
/// (a blanket project override subsumes a narrower one), then newest.
pub async fn find_matching_override(
    conn: &mut SqliteConnection,
    run_id: &str,
    kind: OverrideKind,
    target_id: Option<&str>,
) -> CoreResult<Option<Override>> {
    let row = sqlx::query_as::<_, Override>(
        r#"
        SELECT o.override_id, o.run_id, o.kind, o.target_id, o.scope, o.operator,
               o.justification, o.expires_at, o.created_at
        FROM overrides o
        JOIN runs origin ON origin.run_id = o.run_id
        JOIN runs target ON target.run_id = ?1
        WHERE o.kind = ?2
          AND (o.target_id IS NULL OR o.target_id = ?3)
          AND (o.expires_at IS NULL OR o.expires_at > ?4)
          AND (
              (o.scope = 'this_run' AND o.run_id = target.run_id)
              OR (o.scope = 'this_task' AND origin.task_id = target.task_id)
              OR (o.scope = 'this_repo' AND origin.repo_id = target.repo_id)
              OR (o.scope = 'project_wide' AND origin.project_id = target.project_id)
          )
        ORDER BY CASE o.scope
                     WHEN 'project_wide' THEN 0
                     WHEN 'this_repo' THEN 1
                     WHEN 'this_task' THEN 2
                     ELSE 3
                 END,
                 o.created_at DESC
        LIMIT 1
        "#,
    )
    .bind(run_id)
    .bind(kind)
    .bind(target_id)
    .bind(Utc::now())
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Pool convenience wrapper around [`find_matching_override`].
pub async fn find_matching_override_pool(
    pool: &SqlitePool,
    run_id: &str,
    kind: OverrideKind,
    target_id: Option<&str>,
) -> CoreResult<Option<Override>> {
    let mut conn = pool.acquire().await?;
    find_matching_override(&mut conn, run_id, kind, target_id).await
}
