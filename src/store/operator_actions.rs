use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::events::{self, event_types, EventClass, EventSource, NewEvent};

pub const ACTION_APPROVE_PLAN: &str = "approve_plan";
pub const ACTION_REJECT_RUN: &str = "reject_run";
pub const ACTION_APPROVE_CODE: &str = "approve_code";
pub const ACTION_REQUEST_CHANGES: &str = "request_changes";
pub const ACTION_RETRY: &str = "retry";

/// An explicit operator decision on a run (approve, reject, retry, ...).
/// The projection row is written in the same transaction as its
/// `operator.action` fact event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperatorAction {
    pub action_id: String,
    pub run_id: String,
    pub action_type: String,
    pub operator: String,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOperatorAction {
    pub run_id: String,
    pub action_type: String,
    pub operator: String,
    pub comment: Option<String>,
}

/// Record an operator action: append the `operator.action` fact and insert
/// the projection row atomically.
pub async fn record_operator_action(
    conn: &mut SqliteConnection,
    input: NewOperatorAction,
) -> CoreResult<OperatorAction> {
    let action = OperatorAction {
        action_id: Uuid::new_v4().to_string(),
        run_id: input.run_id,
        action_type: input.action_type,
        operator: input.operator,
        comment: input.comment,
        created_at: Utc::now(),
    };

    events::append_event(
        &mut *conn,
        NewEvent::new(
            event_types::OPERATOR_ACTION,
            EventClass::Fact,
            EventSource::Operator,
            format!("operator:{}", action.action_id),
        )
        .for_run(action.run_id.clone())
        .with_payload(json!({
            "action_type": action.action_type,
            "operator": action.operator,
            "comment": action.comment,
        })),
    )
    .await?;

    sqlx::query(
        r#"
        INSERT INTO operator_actions (action_id, run_id, action_type, operator, comment, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&action.action_id)
    .bind(&action.run_id)
    .bind(&action.action_type)
    .bind(&action.operator)
    .bind(&action.comment)
    .bind(action.created_at)
    .execute(conn)
    .await?;

    Ok(action)
}

/// Actions on a run, oldest first.
pub async fn list_operator_actions(
    conn: &mut SqliteConnection,
    run_id: &str,
) -> CoreResult<Vec<OperatorAction>> {
    let actions = sqlx::query_as::<_, OperatorAction>(
        r#"
        SELECT action_id, run_id, action_type, operator, comment, created_at
        FROM operator_actions
        WHERE run_id = ?1
        ORDER BY created_at ASC, action_id ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(conn)
    .await?;
    Ok(actions)
}

pub async fn record_operator_action_pool(
    pool: &SqlitePool,
    input: NewOperatorAction,
) -> CoreResult<OperatorAction> {
    let mut tx = pool.begin().await?;
    let action = record_operator_action(&mut *tx, input).await?;
    tx.commit().await?;
    Ok(action)
}
