use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::error::CoreResult;

/// Immutable per-run record of classifier output: which agent graph runs the
/// task and which gates are required or optional. Absent for most runs, in
/// which case the orchestrator falls back to its defaults.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoutingDecision {
    pub routing_decision_id: String,
    pub run_id: String,
    pub classifier_json: String,
    pub agent_graph: String,
    pub required_gates_json: Option<String>,
    pub optional_gates_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RoutingDecision {
    pub fn required_gates(&self) -> Option<Vec<String>> {
        self.required_gates_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn optional_gates(&self) -> Option<Vec<String>> {
        self.optional_gates_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

#[derive(Debug, Clone)]
pub struct NewRoutingDecision {
    pub run_id: String,
    pub classifier: serde_json::Value,
    pub agent_graph: String,
    pub required_gates: Option<Vec<String>>,
    pub optional_gates: Option<Vec<String>>,
}

pub async fn create_routing_decision(
    conn: &mut SqliteConnection,
    input: NewRoutingDecision,
) -> CoreResult<RoutingDecision> {
    let row = RoutingDecision {
        routing_decision_id: Uuid::new_v4().to_string(),
        run_id: input.run_id,
        classifier_json: serde_json::to_string(&input.classifier)?,
        agent_graph: input.agent_graph,
        required_gates_json: match &input.required_gates {
            Some(gates) => Some(serde_json::to_string(gates)?),
            None => None,
        },
        optional_gates_json: match &input.optional_gates {
            Some(gates) => Some(serde_json::to_string(gates)?),
            None => None,
        },
        created_at: Utc::now(),
    };
    sqlx::query(
        r#"
        INSERT INTO routing_decisions (
            routing_decision_id, run_id, classifier_json, agent_graph,
            required_gates_json, optional_gates_json, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&row.routing_decision_id)
    .bind(&row.run_id)
    .bind(&row.classifier_json)
    .bind(&row.agent_graph)
    .bind(&row.required_gates_json)
    .bind(&row.optional_gates_json)
    .bind(row.created_at)
    .execute(conn)
    .await?;
    Ok(row)
}

pub async fn get_routing_decision(
    conn: &mut SqliteConnection,
    run_id: &str,
) -> CoreResult<Option<RoutingDecision>> {
    let row = sqlx::query_as::<_, RoutingDecision>(
        r#"
        SELECT routing_decision_id, run_id, classifier_json, agent_graph,
               required_gates_json, optional_gates_json, created_at
        FROM routing_decisions
        WHERE run_id = ?1
        "#,
    )
    .bind(run_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}
