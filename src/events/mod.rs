//! Append-only event log.
//!
//! Every fact, decision, and signal in the system lands here. Run-scoped
//! events carry a per-run `sequence` forming a strict total order; the
//! orchestrator pins sequences for its decisions while worker facts
//! auto-allocate past the current maximum, so neither blocks the other.

pub mod types;

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
pub use types::{event_types, Event, EventClass, EventSource, NewEvent};

/// Highest allocated sequence for a run, or 0 when the run has no events.
pub async fn max_sequence(conn: &mut SqliteConnection, run_id: &str) -> CoreResult<i64> {
    let max: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM events WHERE run_id = ?1")
            .bind(run_id)
            .fetch_one(conn)
            .await?;
    Ok(max)
}

/// Insert a new event, enforcing source authority and idempotency.
///
/// Returns `Ok(None)` when `idempotency_key` was already recorded: replays
/// are a contract, not an error. `phase.transitioned` events and any event
/// of class `decision` are rejected with `Forbidden` unless authored by the
/// orchestrator.
///
/// Takes a bare connection so callers can run it inside the transaction
/// that also updates projections.
pub async fn append_event(
    conn: &mut SqliteConnection,
    input: NewEvent,
) -> CoreResult<Option<Event>> {
    if input.event_type == event_types::PHASE_TRANSITIONED
        && input.source != EventSource::Orchestrator
    {
        return Err(CoreError::Forbidden(format!(
            "{} events require source=orchestrator, got {}",
            event_types::PHASE_TRANSITIONED,
            input.source
        )));
    }
    if input.class == EventClass::Decision && input.source != EventSource::Orchestrator {
        return Err(CoreError::Forbidden(format!(
            "decision events require source=orchestrator, got {}",
            input.source
        )));
    }
    if input.run_id.is_none() && input.sequence.is_some() {
        return Err(CoreError::Validation(
            "sequence is only meaningful for run-scoped events".into(),
        ));
    }

    let already: Option<String> =
        sqlx::query_scalar("SELECT event_id FROM events WHERE idempotency_key = ?1")
            .bind(&input.idempotency_key)
            .fetch_optional(&mut *conn)
            .await?;
    if let Some(existing) = already {
        debug!(
            idempotency_key = %input.idempotency_key,
            existing_event_id = %existing,
            "duplicate event append deduplicated"
        );
        return Ok(None);
    }

    let sequence = match (&input.run_id, input.sequence) {
        (Some(run_id), None) => Some(max_sequence(&mut *conn, run_id).await? + 1),
        (Some(_), Some(seq)) => Some(seq),
        (None, _) => None,
    };

    let event = Event {
        event_id: Uuid::new_v4().to_string(),
        run_id: input.run_id,
        event_type: input.event_type,
        class: input.class,
        source: input.source,
        payload: serde_json::to_string(&input.payload)?,
        sequence,
        idempotency_key: input.idempotency_key,
        causation_id: input.causation_id,
        correlation_id: input.correlation_id,
        created_at: Utc::now(),
        processed_at: None,
    };

    let insert = sqlx::query(
        r#"
        INSERT INTO events (
            event_id, run_id, event_type, class, source, payload,
            sequence, idempotency_key, causation_id, correlation_id, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&event.event_id)
    .bind(&event.run_id)
    .bind(&event.event_type)
    .bind(event.class)
    .bind(event.source)
    .bind(&event.payload)
    .bind(event.sequence)
    .bind(&event.idempotency_key)
    .bind(&event.causation_id)
    .bind(&event.correlation_id)
    .bind(event.created_at)
    .execute(&mut *conn)
    .await;

    match insert {
        Ok(_) => Ok(Some(event)),
        // Lost the idempotency race between the lookup and the insert.
        Err(sqlx::Error::Database(db)) if db.message().contains("idempotency_key") => {
            debug!(idempotency_key = %event.idempotency_key, "event insert raced a duplicate");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// List a run's events in sequence order.
pub async fn list_run_events(
    pool: &SqlitePool,
    run_id: &str,
    limit: i64,
    offset: i64,
) -> CoreResult<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        r#"
        SELECT event_id, run_id, event_type, class, source, payload,
               sequence, idempotency_key, causation_id, correlation_id,
               created_at, processed_at
        FROM events
        WHERE run_id = ?1
        ORDER BY sequence ASC
        LIMIT ?2 OFFSET ?3
        "#,
    )
    .bind(run_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(events)
}

/// Stamp `processed_at` for downstream consumers. Non-blocking for the
/// append path.
pub async fn mark_event_processed(pool: &SqlitePool, event_id: &str) -> CoreResult<()> {
    let result = sqlx::query("UPDATE events SET processed_at = ?1 WHERE event_id = ?2")
        .bind(Utc::now())
        .bind(event_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(format!("event {event_id}")));
    }
    Ok(())
}
