use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// A record of one tool execution (test run, build, linter) performed by the
/// tool layer on behalf of an agent. `result_meta.exit_code` is the ground
/// truth the tests_pass gate trusts over any agent-authored summary.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolInvocation {
    pub tool_invocation_id: String,
    pub run_id: String,
    pub tool: String,
    pub args: String,
    pub result_meta: Option<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolInvocation {
    pub fn result_meta_json(&self) -> Value {
        self.result_meta
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null)
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.result_meta_json().get("exit_code")?.as_i64()
    }
}

pub async fn create_tool_invocation(
    conn: &mut SqliteConnection,
    run_id: &str,
    tool: &str,
    args: &Value,
) -> CoreResult<ToolInvocation> {
    let invocation = ToolInvocation {
        tool_invocation_id: Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        tool: tool.to_string(),
        args: serde_json::to_string(args)?,
        result_meta: None,
        status: "running".to_string(),
        started_at: Utc::now(),
        finished_at: None,
    };
    sqlx::query(
        r#"
        INSERT INTO tool_invocations (tool_invocation_id, run_id, tool, args, status, started_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&invocation.tool_invocation_id)
    .bind(&invocation.run_id)
    .bind(&invocation.tool)
    .bind(&invocation.args)
    .bind(&invocation.status)
    .bind(invocation.started_at)
    .execute(conn)
    .await?;
    Ok(invocation)
}

pub async fn finish_tool_invocation(
    pool: &SqlitePool,
    tool_invocation_id: &str,
    result_meta: &Value,
) -> CoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE tool_invocations
        SET result_meta = ?1, status = 'finished', finished_at = ?2
        WHERE tool_invocation_id = ?3
        "#,
    )
    .bind(serde_json::to_string(result_meta)?)
    .bind(Utc::now())
    .bind(tool_invocation_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(format!(
            "tool invocation {tool_invocation_id}"
        )));
    }
    Ok(())
}

pub async fn list_tool_invocations(
    conn: &mut SqliteConnection,
    run_id: &str,
) -> CoreResult<Vec<ToolInvocation>> {
    let invocations = sqlx::query_as::<_, ToolInvocation>(
        r#"
        SELECT tool_invocation_id, run_id, tool, args, result_meta, status,
               started_at, finished_at
        FROM tool_invocations
        WHERE run_id = ?1
        ORDER BY started_at ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(conn)
    .await?;
    Ok(invocations)
}
