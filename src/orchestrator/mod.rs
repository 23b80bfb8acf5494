//! The orchestrator: sole author of decision events and phase transitions.
//!
//! Every transition runs in one transaction that appends the
//! `phase.transitioned` event, advances the run's sequence counters, and
//! applies the projection update under an optimistic lock
//! (`WHERE phase = from`). At most one concurrent orchestrator wins; the
//! others get `OptimisticLockFailed` and must re-read.

pub mod machine;

use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};
use std::cmp::max;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cancel::CancellationRegistry;
use crate::error::{CoreError, CoreResult};
use crate::events::{self, event_types, Event, EventClass, EventSource, NewEvent};
use crate::gates::{self, GateContext, GateRegistry};
use crate::outbox;
use crate::store::gate_evaluations::{self, GateEvaluation, NewGateEvaluation};
use crate::store::routing;
use crate::store::runs::{self, Run};
pub use machine::{is_valid_transition, Phase};

/// Input to [`Orchestrator::transition_phase`].
#[derive(Debug, Clone)]
pub struct TransitionInput {
    pub run_id: String,
    pub to_phase: Phase,
    pub to_step: Option<String>,
    pub triggered_by: String,
    pub reason: Option<String>,
    pub result: Option<String>,
    pub result_reason: Option<String>,
    pub blocked_reason: Option<String>,
    pub blocked_context: Option<Value>,
    /// The phase the caller last observed. When set, the transition is
    /// validated and applied against it, so a run moved by another worker
    /// in the meantime surfaces as `OptimisticLockFailed` instead of
    /// silently re-basing on the new phase.
    pub expected_phase: Option<Phase>,
}

impl TransitionInput {
    pub fn new(run_id: impl Into<String>, to_phase: Phase, triggered_by: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            to_phase,
            to_step: None,
            triggered_by: triggered_by.into(),
            reason: None,
            result: None,
            result_reason: None,
            blocked_reason: None,
            blocked_context: None,
            expected_phase: None,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.to_step = Some(step.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_result_reason(mut self, reason: impl Into<String>) -> Self {
        self.result_reason = Some(reason.into());
        self
    }

    pub fn blocked(mut self, reason: impl Into<String>, context: Value) -> Self {
        self.blocked_reason = Some(reason.into());
        self.blocked_context = Some(context);
        self
    }

    pub fn expecting(mut self, phase: Phase) -> Self {
        self.expected_phase = Some(phase);
        self
    }
}

/// A committed phase transition: the updated run and its decision event.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub run: Run,
    pub event: Event,
}

/// Result of a gate sweep: every verdict persisted this round, plus the
/// transition if all required gates passed.
#[derive(Debug)]
pub struct GateSweep {
    pub evaluations: Vec<GateEvaluation>,
    pub transitioned: Option<TransitionOutcome>,
}

pub struct Orchestrator {
    pool: SqlitePool,
    registry: GateRegistry,
    cancellations: Arc<CancellationRegistry>,
}

impl Orchestrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            registry: GateRegistry::builtin(),
            cancellations: Arc::new(CancellationRegistry::new()),
        }
    }

    pub fn with_registry(mut self, registry: GateRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_cancellations(mut self, cancellations: Arc<CancellationRegistry>) -> Self {
        self.cancellations = cancellations;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn cancellations(&self) -> Arc<CancellationRegistry> {
        self.cancellations.clone()
    }

    /// Move a run to a new phase. Fully transactional: on any failure no
    /// event is appended and no state changes.
    pub async fn transition_phase(&self, input: TransitionInput) -> CoreResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = transition_in_tx(&mut *tx, input).await?;
        tx.commit().await?;
        info!(
            run_id = %outcome.run.run_id,
            phase = %outcome.run.phase,
            sequence = outcome.event.sequence,
            "run transitioned"
        );
        Ok(outcome)
    }

    /// Evaluate the gates guarding `phase` and, if every required gate
    /// passed, apply `candidate` in the same transaction.
    pub async fn evaluate_gates_and_transition(
        &self,
        run_id: &str,
        phase: Phase,
        candidate: TransitionInput,
    ) -> CoreResult<GateSweep> {
        let mut tx = self.pool.begin().await?;
        let run = runs::require_run(&mut *tx, run_id).await?;

        let mut gate_ids: Vec<String> = gates::default_gates_for_phase(phase)
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(decision) = routing::get_routing_decision(&mut *tx, run_id).await? {
            if let Some(required) = decision.required_gates() {
                gate_ids.retain(|g| required.contains(g));
            }
        }

        let ctx = GateContext::load(&mut *tx, &run).await?;

        let mut evaluations = Vec::with_capacity(gate_ids.len());
        let mut all_passed = true;
        for gate_id in &gate_ids {
            let evaluator = self.registry.get(gate_id).ok_or_else(|| {
                CoreError::NotImplemented(format!("no evaluator registered for gate {gate_id}"))
            })?;
            let outcome = evaluator.evaluate(&ctx);
            all_passed &= outcome.status == gates::GateStatus::Passed;

            let sequence = events::max_sequence(&mut *tx, run_id).await? + 1;
            let event = events::append_event(
                &mut *tx,
                NewEvent::new(
                    event_types::GATE_EVALUATED,
                    EventClass::Decision,
                    EventSource::Orchestrator,
                    format!("gate:{run_id}:{gate_id}:{sequence}"),
                )
                .for_run(run_id.to_string())
                .with_sequence(sequence)
                .with_payload(json!({
                    "gate_id": gate_id,
                    "status": outcome.status,
                    "reason": outcome.reason,
                    "escalate": outcome.escalate,
                    "details": outcome.details,
                })),
            )
            .await?
            .ok_or(CoreError::OptimisticLockFailed)?;

            let evaluation = gate_evaluations::insert_gate_evaluation(
                &mut *tx,
                NewGateEvaluation {
                    run_id: run_id.to_string(),
                    gate_id: gate_id.clone(),
                    kind: evaluator.kind(),
                    status: outcome.status,
                    reason: outcome.reason.clone(),
                    details: outcome.details.clone(),
                    causation_event_id: event.event_id.clone(),
                },
            )
            .await?;
            evaluations.push(evaluation);
        }

        let transitioned = if all_passed {
            Some(transition_in_tx(&mut *tx, candidate).await?)
        } else {
            None
        };

        tx.commit().await?;
        Ok(GateSweep {
            evaluations,
            transitioned,
        })
    }

    /// Cancel a run: signal the in-process token, move the run to
    /// `cancelled`, and cancel its pending outbox writes.
    pub async fn cancel_run(
        &self,
        run_id: &str,
        triggered_by: &str,
        reason: Option<String>,
    ) -> CoreResult<TransitionOutcome> {
        self.cancellations.signal(run_id);

        let mut input = TransitionInput::new(run_id, Phase::Cancelled, triggered_by)
            .with_result("cancelled");
        input.result_reason = reason;
        let outcome = self.transition_phase(input).await?;

        let cancelled_writes = outbox::cancel_run_writes(&self.pool, run_id).await?;
        if cancelled_writes > 0 {
            warn!(run_id, cancelled_writes, "cancelled pending outbox writes");
        }
        Ok(outcome)
    }
}

/// The transition protocol, usable inside a larger transaction.
async fn transition_in_tx(
    conn: &mut SqliteConnection,
    input: TransitionInput,
) -> CoreResult<TransitionOutcome> {
    let run = runs::require_run(&mut *conn, &input.run_id).await?;
    let from = input.expected_phase.unwrap_or(run.phase);
    let to = input.to_phase;

    if !machine::is_valid_transition(from, to) {
        return Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    // Sequence floor: never collide with worker facts appended since the
    // last transition.
    let sequence = max(
        run.next_sequence,
        events::max_sequence(&mut *conn, &run.run_id).await? + 1,
    );

    let event = events::append_event(
        &mut *conn,
        NewEvent::new(
            event_types::PHASE_TRANSITIONED,
            EventClass::Decision,
            EventSource::Orchestrator,
            format!("phase:{}:{}", run.run_id, sequence),
        )
        .for_run(run.run_id.clone())
        .with_sequence(sequence)
        .with_payload(json!({
            "from": from,
            "to": to,
            "step": input.to_step,
            "triggered_by": input.triggered_by,
            "reason": input.reason,
        })),
    )
    .await?
    // A duplicate phase key means another orchestrator already claimed
    // this sequence slot.
    .ok_or(CoreError::OptimisticLockFailed)?;

    let now = chrono::Utc::now();
    let plan_revisions = run.plan_revisions
        + i64::from(from == Phase::AwaitingPlanApproval && to == Phase::Planning);
    let review_rounds =
        run.review_rounds + i64::from(from == Phase::AwaitingReview && to == Phase::Executing);
    let completed_at = if to.is_terminal() {
        Some(now)
    } else {
        run.completed_at
    };
    let blocked_context = match &input.blocked_context {
        Some(ctx) => Some(serde_json::to_string(ctx)?),
        None => None,
    };

    let updated = sqlx::query(
        r#"
        UPDATE runs
        SET phase = ?1,
            step = COALESCE(?2, step),
            next_sequence = ?3,
            last_event_sequence = ?4,
            updated_at = ?5,
            started_at = CASE WHEN ?1 = 'planning' THEN COALESCE(started_at, ?5) ELSE started_at END,
            completed_at = ?6,
            result = COALESCE(?7, result),
            result_reason = COALESCE(?8, result_reason),
            blocked_reason = ?9,
            blocked_context = ?10,
            plan_revisions = ?11,
            review_rounds = ?12
        WHERE run_id = ?13 AND phase = ?14
        "#,
    )
    .bind(to)
    .bind(&input.to_step)
    .bind(sequence + 1)
    .bind(sequence)
    .bind(now)
    .bind(completed_at)
    .bind(&input.result)
    .bind(&input.result_reason)
    .bind(&input.blocked_reason)
    .bind(&blocked_context)
    .bind(plan_revisions)
    .bind(review_rounds)
    .bind(&run.run_id)
    .bind(from)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(CoreError::OptimisticLockFailed);
    }

    if to.is_terminal() {
        sqlx::query(
            "UPDATE tasks SET active_run_id = NULL, updated_at = ?1 WHERE active_run_id = ?2",
        )
        .bind(now)
        .bind(&run.run_id)
        .execute(&mut *conn)
        .await?;
    }

    let run = runs::require_run(&mut *conn, &run.run_id).await?;
    Ok(TransitionOutcome { run, event })
}
