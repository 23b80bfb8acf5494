use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::HashMap;

use crate::error::CoreResult;
use crate::events::{event_types, Event};
use crate::store::artifacts::{self, Artifact};
use crate::store::operator_actions::{self, OperatorAction};
use crate::store::overrides::{self, Override, OverrideKind};
use crate::store::runs::Run;
use crate::store::tool_invocations::{self, ToolInvocation};

/// PR state distilled from webhook fact events. The upstream normalizer
/// supplies derived booleans (`changes_requested`, `merged`); the core never
/// re-derives them from raw review or check payloads. PR identity is the
/// stable node id, never the PR number.
#[derive(Debug, Clone, Default)]
pub struct PrSignals {
    pub node_id: Option<String>,
    pub review_approved: bool,
    pub changes_requested: bool,
    pub merged: bool,
    pub closed_without_merge: bool,
}

impl PrSignals {
    /// Fold pr.* fact events, in sequence order, into the latest PR state.
    /// A new `pr.opened` resets review state: signals belong to one PR.
    pub fn from_events(events: &[Event]) -> Self {
        let mut signals = PrSignals::default();
        for event in events {
            let payload = event.payload_json();
            let event_node = payload.get("node_id").and_then(Value::as_str);
            match event.event_type.as_str() {
                event_types::PR_OPENED => {
                    signals = PrSignals {
                        node_id: event_node.map(str::to_string),
                        ..PrSignals::default()
                    };
                }
                event_types::PR_REVIEW_SUBMITTED => {
                    if signals.matches(event_node) {
                        signals.changes_requested = payload
                            .get("changes_requested")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        signals.review_approved =
                            payload.get("state").and_then(Value::as_str) == Some("approved");
                    }
                }
                event_types::PR_MERGED => {
                    if signals.matches(event_node) {
                        signals.merged = true;
                    }
                }
                event_types::PR_CLOSED => {
                    let merged = payload
                        .get("merged")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if signals.matches(event_node) && !merged {
                        signals.closed_without_merge = true;
                    }
                }
                _ => {}
            }
        }
        signals
    }

    fn matches(&self, event_node: Option<&str>) -> bool {
        match (&self.node_id, event_node) {
            (Some(ours), Some(theirs)) => ours == theirs,
            // Events that do not name a PR apply to the run's only PR.
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Everything a gate evaluator may consult, loaded in one snapshot inside
/// the orchestrator's transaction. Only `valid` artifacts are included.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub run: Run,
    pub artifacts: Vec<Artifact>,
    pub operator_actions: Vec<OperatorAction>,
    pub skip_tests_override: Option<Override>,
    pub tool_invocations: HashMap<String, ToolInvocation>,
    pub pr: PrSignals,
    pub gate_configs: HashMap<String, Value>,
}

impl GateContext {
    pub async fn load(conn: &mut SqliteConnection, run: &Run) -> CoreResult<Self> {
        let artifacts = artifacts::list_valid_artifacts(&mut *conn, &run.run_id).await?;
        let actions = operator_actions::list_operator_actions(&mut *conn, &run.run_id).await?;
        let skip_tests_override = overrides::find_matching_override(
            &mut *conn,
            &run.run_id,
            OverrideKind::SkipTests,
            None,
        )
        .await?;
        let invocations = tool_invocations::list_tool_invocations(&mut *conn, &run.run_id)
            .await?
            .into_iter()
            .map(|inv| (inv.tool_invocation_id.clone(), inv))
            .collect();

        let pr_events = sqlx::query_as::<_, Event>(
            r#"
            SELECT event_id, run_id, event_type, class, source, payload,
                   sequence, idempotency_key, causation_id, correlation_id,
                   created_at, processed_at
            FROM events
            WHERE run_id = ?1 AND event_type LIKE 'pr.%'
            ORDER BY COALESCE(sequence, 0) ASC, created_at ASC
            "#,
        )
        .bind(&run.run_id)
        .fetch_all(&mut *conn)
        .await?;
        let pr = PrSignals::from_events(&pr_events);

        let config_rows: Vec<(String, String)> =
            sqlx::query_as("SELECT gate_id, default_config_json FROM gates")
                .fetch_all(&mut *conn)
                .await?;
        let gate_configs = config_rows
            .into_iter()
            .filter_map(|(gate_id, raw)| {
                serde_json::from_str(&raw).ok().map(|cfg| (gate_id, cfg))
            })
            .collect();

        Ok(Self {
            run: run.clone(),
            artifacts,
            operator_actions: actions,
            skip_tests_override,
            tool_invocations: invocations,
            pr,
            gate_configs,
        })
    }

    /// Latest valid artifact of a type. `artifacts` is ordered newest
    /// version first within each type.
    pub fn latest_artifact(&self, artifact_type: &str) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.artifact_type == artifact_type)
    }

    /// Earliest operator action of a type, if any.
    pub fn action(&self, action_type: &str) -> Option<&OperatorAction> {
        self.operator_actions
            .iter()
            .find(|a| a.action_type == action_type)
    }

    /// Config value from the gate definition, e.g. `max_retries`.
    pub fn gate_config_u32(&self, gate_id: &str, key: &str, default: u32) -> u32 {
        self.gate_configs
            .get(gate_id)
            .and_then(|cfg| cfg.get(key))
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(default)
    }
}
