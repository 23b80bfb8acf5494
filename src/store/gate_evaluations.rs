use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;

use crate::error::CoreResult;
use crate::gates::{GateKind, GateStatus};

/// A point-in-time verdict for one gate on one run, tied to the
/// `gate.evaluated` decision event that caused it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GateEvaluation {
    pub gate_evaluation_id: i64,
    pub run_id: String,
    pub gate_id: String,
    pub kind: GateKind,
    pub status: GateStatus,
    pub reason: Option<String>,
    pub details: Option<String>,
    pub causation_event_id: String,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGateEvaluation {
    pub run_id: String,
    pub gate_id: String,
    pub kind: GateKind,
    pub status: GateStatus,
    pub reason: Option<String>,
    pub details: Option<serde_json::Value>,
    pub causation_event_id: String,
}

pub async fn insert_gate_evaluation(
    conn: &mut SqliteConnection,
    input: NewGateEvaluation,
) -> CoreResult<GateEvaluation> {
    let evaluated_at = Utc::now();
    let details = match &input.details {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    };
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO gate_evaluations (
            run_id, gate_id, kind, status, reason, details, causation_event_id, evaluated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING gate_evaluation_id
        "#,
    )
    .bind(&input.run_id)
    .bind(&input.gate_id)
    .bind(input.kind)
    .bind(input.status)
    .bind(&input.reason)
    .bind(&details)
    .bind(&input.causation_event_id)
    .bind(evaluated_at)
    .fetch_one(conn)
    .await?;

    Ok(GateEvaluation {
        gate_evaluation_id: id,
        run_id: input.run_id,
        gate_id: input.gate_id,
        kind: input.kind,
        status: input.status,
        reason: input.reason,
        details,
        causation_event_id: input.causation_event_id,
        evaluated_at,
    })
}

/// Derive the current status of every evaluated gate on a run.
///
/// The latest evaluation per gate wins, ordered by the sequence of its
/// causation event, then by evaluation id. Recomputed on every read; gate
/// state is never denormalized onto the run.
pub async fn derive_gate_state(
    pool: &SqlitePool,
    run_id: &str,
) -> CoreResult<HashMap<String, GateStatus>> {
    let rows: Vec<(String, GateStatus)> = sqlx::query_as(
        r#"
        SELECT ge.gate_id, ge.status
        FROM gate_evaluations ge
        JOIN events e ON e.event_id = ge.causation_event_id
        WHERE ge.run_id = ?1
          AND NOT EXISTS (
              SELECT 1
              FROM gate_evaluations newer
              JOIN events ne ON ne.event_id = newer.causation_event_id
              WHERE newer.run_id = ge.run_id
                AND newer.gate_id = ge.gate_id
                AND (ne.sequence > e.sequence
                     OR (ne.sequence = e.sequence
                         AND newer.gate_evaluation_id > ge.gate_evaluation_id))
          )
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Full evaluation history for a run, oldest first.
pub async fn list_gate_evaluations(
    pool: &SqlitePool,
    run_id: &str,
) -> CoreResult<Vec<GateEvaluation>> {
    let evaluations = sqlx::query_as::<_, GateEvaluation>(
        r#"
        SELECT gate_evaluation_id, run_id, gate_id, kind, status, reason, details,
               causation_event_id, evaluated_at
        FROM gate_evaluations
        WHERE run_id = ?1
        ORDER BY gate_evaluation_id ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(evaluations)
}
