use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// What an event record asserts: a fact (something happened), a decision
/// (the orchestrator chose), or a signal (advisory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EventClass {
    Fact,
    Decision,
    Signal,
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventClass::Fact => "fact",
            EventClass::Decision => "decision",
            EventClass::Signal => "signal",
        };
        f.write_str(s)
    }
}

/// Which subsystem authored an event. Source authority is enforced at append
/// time: only the orchestrator may emit phase transitions or decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Worker,
    Orchestrator,
    ToolLayer,
    Operator,
    System,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventSource::Webhook => "webhook",
            EventSource::Worker => "worker",
            EventSource::Orchestrator => "orchestrator",
            EventSource::ToolLayer => "tool_layer",
            EventSource::Operator => "operator",
            EventSource::System => "system",
        };
        f.write_str(s)
    }
}

/// Event type names. Kept as string constants rather than a closed enum:
/// webhook subtypes (`issue.*`, `pr.*`, ...) arrive from upstream and the
/// taxonomy grows without schema changes.
pub mod event_types {
    pub const PHASE_TRANSITIONED: &str = "phase.transitioned";

    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_COMPLETED: &str = "agent.completed";
    pub const AGENT_FAILED: &str = "agent.failed";

    pub const GATE_EVALUATED: &str = "gate.evaluated";
    pub const GATE_PASSED: &str = "gate.passed";
    pub const GATE_FAILED: &str = "gate.failed";

    pub const OPERATOR_ACTION: &str = "operator.action";

    pub const SYSTEM_TIMEOUT: &str = "system.timeout";
    pub const SYSTEM_RETRY: &str = "system.retry";

    pub const PR_OPENED: &str = "pr.opened";
    pub const PR_REVIEW_SUBMITTED: &str = "pr.review_submitted";
    pub const PR_MERGED: &str = "pr.merged";
    pub const PR_CLOSED: &str = "pr.closed";

    pub const PUSH_RECEIVED: &str = "push.received";
    pub const CHECK_SUITE_COMPLETED: &str = "check_suite.completed";
    pub const CHECK_RUN_COMPLETED: &str = "check_run.completed";
}

/// An immutable log entry. Rows are never updated after insert, with the
/// single exception of `processed_at`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Event {
    pub event_id: String,
    pub run_id: Option<String>,
    pub event_type: String,
    pub class: EventClass,
    pub source: EventSource,
    pub payload: String,
    pub sequence: Option<i64>,
    pub idempotency_key: String,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Decode the payload column. Malformed payloads decode to `Null` rather
    /// than failing the read path; the append path only writes valid JSON.
    pub fn payload_json(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or(Value::Null)
    }
}

/// Input for [`crate::events::append_event`].
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub run_id: Option<String>,
    pub event_type: String,
    pub class: EventClass,
    pub source: EventSource,
    pub payload: Value,
    /// When set, the caller (orchestrator) pins the run sequence. When
    /// absent, run-scoped events auto-allocate past the current maximum.
    pub sequence: Option<i64>,
    pub idempotency_key: String,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl NewEvent {
    pub fn new(
        event_type: impl Into<String>,
        class: EventClass,
        source: EventSource,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            run_id: None,
            event_type: event_type.into(),
            class,
            source,
            payload: Value::Object(serde_json::Map::new()),
            sequence: None,
            idempotency_key: idempotency_key.into(),
            causation_id: None,
            correlation_id: None,
        }
    }

    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn caused_by(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}
