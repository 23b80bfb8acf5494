use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::orchestrator::machine::Phase;

/// Current state of one attempt to resolve a task. Mutated only inside the
/// transaction that appends the causing event; `phase`, `next_sequence`, and
/// `last_event_sequence` are written exclusively by the orchestrator.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Run {
    pub run_id: String,
    pub task_id: String,
    pub project_id: String,
    pub repo_id: String,
    pub run_number: i64,
    pub phase: Phase,
    pub step: Option<String>,
    pub next_sequence: i64,
    pub last_event_sequence: i64,
    pub base_branch: String,
    pub branch: Option<String>,
    pub plan_revisions: i64,
    pub test_fix_attempts: i64,
    pub review_rounds: i64,
    pub result: Option<String>,
    pub result_reason: Option<String>,
    pub blocked_reason: Option<String>,
    pub blocked_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub task_id: String,
    pub project_id: String,
    pub repo_id: String,
    pub base_branch: String,
    pub branch: Option<String>,
}

const RUN_COLUMNS: &str = r#"
    run_id, task_id, project_id, repo_id, run_number, phase, step,
    next_sequence, last_event_sequence, base_branch, branch,
    plan_revisions, test_fix_attempts, review_rounds,
    result, result_reason, blocked_reason, blocked_context,
    created_at, updated_at, started_at, completed_at
"#;

/// Create a run in `pending` with the next run_number for its task, and
/// point the task's `active_run_id` at it.
pub async fn create_run(conn: &mut SqliteConnection, input: NewRun) -> CoreResult<Run> {
    let run_number: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs WHERE task_id = ?1")
            .bind(&input.task_id)
            .fetch_one(&mut *conn)
            .await?;

    let now = Utc::now();
    let run = Run {
        run_id: Uuid::new_v4().to_string(),
        task_id: input.task_id,
        project_id: input.project_id,
        repo_id: input.repo_id,
        run_number,
        phase: Phase::Pending,
        step: None,
        next_sequence: 1,
        last_event_sequence: 0,
        base_branch: input.base_branch,
        branch: input.branch,
        plan_revisions: 0,
        test_fix_attempts: 0,
        review_rounds: 0,
        result: None,
        result_reason: None,
        blocked_reason: None,
        blocked_context: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
    };

    sqlx::query(
        r#"
        INSERT INTO runs (
            run_id, task_id, project_id, repo_id, run_number, phase, step,
            next_sequence, last_event_sequence, base_branch, branch,
            plan_revisions, test_fix_attempts, review_rounds, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
    )
    .bind(&run.run_id)
    .bind(&run.task_id)
    .bind(&run.project_id)
    .bind(&run.repo_id)
    .bind(run.run_number)
    .bind(run.phase)
    .bind(&run.step)
    .bind(run.next_sequence)
    .bind(run.last_event_sequence)
    .bind(&run.base_branch)
    .bind(&run.branch)
    .bind(run.plan_revisions)
    .bind(run.test_fix_attempts)
    .bind(run.review_rounds)
    .bind(run.created_at)
    .bind(run.updated_at)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE tasks SET active_run_id = ?1, updated_at = ?2 WHERE task_id = ?3")
        .bind(&run.run_id)
        .bind(now)
        .bind(&run.task_id)
        .execute(&mut *conn)
        .await?;

    Ok(run)
}

pub async fn get_run(conn: &mut SqliteConnection, run_id: &str) -> CoreResult<Option<Run>> {
    let run = sqlx::query_as::<_, Run>(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"
    ))
    .bind(run_id)
    .fetch_optional(conn)
    .await?;
    Ok(run)
}

pub async fn require_run(conn: &mut SqliteConnection, run_id: &str) -> CoreResult<Run> {
    get_run(conn, run_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))
}

pub async fn get_run_by_pool(pool: &SqlitePool, run_id: &str) -> CoreResult<Option<Run>> {
    let mut conn = pool.acquire().await?;
    get_run(&mut conn, run_id).await
}

/// Runs a project operator needs to look at: waiting on plan approval or
/// parked in `blocked`.
pub async fn runs_awaiting_gates(pool: &SqlitePool, project_id: &str) -> CoreResult<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(&format!(
        r#"
        SELECT {RUN_COLUMNS} FROM runs
        WHERE project_id = ?1 AND phase IN ('awaiting_plan_approval', 'blocked')
        ORDER BY updated_at ASC
        "#
    ))
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(runs)
}

/// Bump the failed-test counter. Called by the worker after recording a
/// failing test report so the tests_pass gate sees the attempt budget.
pub async fn increment_test_fix_attempts(
    conn: &mut SqliteConnection,
    run_id: &str,
) -> CoreResult<i64> {
    sqlx::query(
        "UPDATE runs SET test_fix_attempts = test_fix_attempts + 1, updated_at = ?1 WHERE run_id = ?2",
    )
    .bind(Utc::now())
    .bind(run_id)
    .execute(&mut *conn)
    .await?;
    let attempts: i64 =
        sqlx::query_scalar("SELECT test_fix_attempts FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_one(conn)
            .await?;
    Ok(attempts)
}
