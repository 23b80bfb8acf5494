//! Agent runtime seam and the cooperative executor step.
//!
//! The runtime itself (LLM calls, tool execution, worktrees) lives outside
//! the core. The executor wraps one agent invocation with the event-log
//! bookkeeping the core owns: `agent.started` / `agent.completed` /
//! `agent.failed` facts, artifact persistence, and both cancellation paths
//! (in-process token, cross-process phase poll).

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::{self, CancellationRegistry};
use crate::error::CoreResult;
use crate::events::{self, event_types, EventClass, EventSource, NewEvent};
use crate::store::artifacts::{self, Artifact, NewArtifact};
use crate::store::runs::{self, Run};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent cancelled")]
    Cancelled,

    #[error("agent failed: {0}")]
    Failed(String),

    #[error("tool execution failed: {0}")]
    Tool(String),
}

/// What a completed agent invocation hands back to the core.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub artifact_type: String,
    pub content_markdown: String,
    /// Required for test reports: the tool-layer record whose exit code is
    /// the ground truth for the tests_pass gate.
    pub source_tool_invocation_id: Option<String>,
}

/// External agent runtime. Blocking calls accept a cancellation token;
/// cancellation is cooperative, not preemptive.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run_agent(
        &self,
        run: &Run,
        role: &str,
        context: Value,
        cancel: CancellationToken,
    ) -> Result<AgentOutput, AgentError>;

    async fn execute_tool(
        &self,
        tool_invocation_id: &str,
        args: Value,
    ) -> Result<Value, AgentError>;
}

/// Outcome of one executor step.
#[derive(Debug)]
pub enum StepResult {
    /// Agent finished; its artifact was stored (validation pending).
    Completed(Artifact),
    /// The run was cancelled before or during the step; exited cleanly.
    Cancelled,
    /// Agent errored; an `agent.failed` fact was recorded for the
    /// orchestrator to decide on.
    Failed(String),
}

pub struct AgentExecutor {
    pool: SqlitePool,
    cancellations: Arc<CancellationRegistry>,
}

impl AgentExecutor {
    pub fn new(pool: SqlitePool, cancellations: Arc<CancellationRegistry>) -> Self {
        Self {
            pool,
            cancellations,
        }
    }

    /// Run one agent invocation for a run, with full event bookkeeping.
    pub async fn run_step(
        &self,
        runtime: &dyn AgentRuntime,
        run_id: &str,
        role: &str,
        context: Value,
    ) -> CoreResult<StepResult> {
        let Some(run) = runs::get_run_by_pool(&self.pool, run_id).await? else {
            return Err(crate::error::CoreError::NotFound(format!("run {run_id}")));
        };
        if run.phase.is_terminal() {
            return Ok(StepResult::Cancelled);
        }

        let token = self.cancellations.register(run_id);
        let attempt = Uuid::new_v4().to_string();
        let result = self
            .run_step_inner(runtime, &run, role, context, token, &attempt)
            .await;
        self.cancellations.unregister(run_id);
        result
    }

    async fn run_step_inner(
        &self,
        runtime: &dyn AgentRuntime,
        run: &Run,
        role: &str,
        context: Value,
        token: CancellationToken,
        attempt: &str,
    ) -> CoreResult<StepResult> {
        let mut conn = self.pool.acquire().await?;
        events::append_event(
            &mut conn,
            NewEvent::new(
                event_types::AGENT_STARTED,
                EventClass::Fact,
                EventSource::Worker,
                format!("agent:{}:{role}:{attempt}", run.run_id),
            )
            .for_run(run.run_id.clone())
            .with_payload(json!({ "role": role, "attempt": attempt })),
        )
        .await?;
        drop(conn);

        let outcome = runtime
            .run_agent(run, role, context, token.clone())
            .await;

        // Cross-process fallback: another worker may have cancelled the run
        // while the agent was in flight.
        if token.is_cancelled() || cancel::run_cancelled_in_db(&self.pool, &run.run_id).await? {
            info!(run_id = %run.run_id, role, "agent step exited on cancellation");
            return Ok(StepResult::Cancelled);
        }

        match outcome {
            Ok(output) => {
                let mut tx = self.pool.begin().await?;
                let artifact = artifacts::create_artifact(
                    &mut *tx,
                    NewArtifact {
                        run_id: run.run_id.clone(),
                        artifact_type: output.artifact_type.clone(),
                        content_markdown: Some(output.content_markdown),
                        blob_ref: None,
                        source_tool_invocation_id: output.source_tool_invocation_id,
                        created_by: role.to_string(),
                    },
                )
                .await?;
                events::append_event(
                    &mut *tx,
                    NewEvent::new(
                        event_types::AGENT_COMPLETED,
                        EventClass::Fact,
                        EventSource::Worker,
                        format!("agent:{}:{role}:{attempt}:completed", run.run_id),
                    )
                    .for_run(run.run_id.clone())
                    .with_payload(json!({
                        "role": role,
                        "artifact_id": artifact.artifact_id,
                        "artifact_type": artifact.artifact_type,
                        "version": artifact.version,
                    })),
                )
                .await?;
                tx.commit().await?;
                Ok(StepResult::Completed(artifact))
            }
            Err(AgentError::Cancelled) => Ok(StepResult::Cancelled),
            Err(err) => {
                warn!(run_id = %run.run_id, role, error = %err, "agent step failed");
                let mut conn = self.pool.acquire().await?;
                events::append_event(
                    &mut conn,
                    NewEvent::new(
                        event_types::AGENT_FAILED,
                        EventClass::Fact,
                        EventSource::Worker,
                        format!("agent:{}:{role}:{attempt}:failed", run.run_id),
                    )
                    .for_run(run.run_id.clone())
                    .with_payload(json!({ "role": role, "error": err.to_string() })),
                )
                .await?;
                Ok(StepResult::Failed(err.to_string()))
            }
        }
    }
}
