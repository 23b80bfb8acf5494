use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::CoreResult;

/// A unit of work (typically a GitHub issue) that runs attempt to resolve.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub task_id: String,
    pub project_id: String,
    pub repo_id: String,
    pub title: String,
    pub active_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn create_task(
    conn: &mut SqliteConnection,
    project_id: &str,
    repo_id: &str,
    title: &str,
) -> CoreResult<Task> {
    let now = Utc::now();
    let task = Task {
        task_id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        repo_id: repo_id.to_string(),
        title: title.to_string(),
        active_run_id: None,
        created_at: now,
        updated_at: now,
    };
    sqlx::query(
        r#"
        INSERT INTO tasks (task_id, project_id, repo_id, title, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&task.task_id)
    .bind(&task.project_id)
    .bind(&task.repo_id)
    .bind(&task.title)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(conn)
    .await?;
    Ok(task)
}

pub async fn get_task(pool: &SqlitePool, task_id: &str) -> CoreResult<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT task_id, project_id, repo_id, title, active_run_id, created_at, updated_at FROM tasks WHERE task_id = ?1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;
    Ok(task)
}
