//! Gate engine: a registry of pure evaluators keyed by gate id.
//!
//! Evaluators never touch the database; the orchestrator loads a
//! [`GateContext`] snapshot and persists verdicts. Outcomes are strictly
//! ternary: `pending`, `passed`, `failed`.

pub mod code_review;
pub mod context;
pub mod merge_wait;
pub mod plan_approval;
pub mod tests_pass;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::orchestrator::machine::Phase;
pub use context::{GateContext, PrSignals};

pub const GATE_PLAN_APPROVAL: &str = "plan_approval";
pub const GATE_TESTS_PASS: &str = "tests_pass";
pub const GATE_CODE_REVIEW: &str = "code_review";
pub const GATE_MERGE_WAIT: &str = "merge_wait";

/// The full default required set when no routing decision narrows it.
pub const DEFAULT_REQUIRED_GATES: [&str; 4] = [
    GATE_PLAN_APPROVAL,
    GATE_TESTS_PASS,
    GATE_CODE_REVIEW,
    GATE_MERGE_WAIT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Passed,
    Failed,
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateStatus::Pending => "pending",
            GateStatus::Passed => "passed",
            GateStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum GateKind {
    Automatic,
    Human,
}

/// The result of evaluating one gate against one run snapshot.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub status: GateStatus,
    pub reason: Option<String>,
    pub escalate: bool,
    pub details: Option<Value>,
}

impl GateOutcome {
    pub fn pending(reason: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Pending,
            reason: Some(reason.into()),
            escalate: false,
            details: None,
        }
    }

    pub fn passed(reason: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Passed,
            reason: Some(reason.into()),
            escalate: false,
            details: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Failed,
            reason: Some(reason.into()),
            escalate: false,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn escalated(mut self) -> Self {
        self.escalate = true;
        self
    }
}

/// A pure verdict function for one gate. Implementations must not perform
/// I/O; everything they need is in the context snapshot.
pub trait GateEvaluator: Send + Sync {
    fn gate_id(&self) -> &'static str;
    fn kind(&self) -> GateKind;
    fn evaluate(&self, ctx: &GateContext) -> GateOutcome;
}

/// String-keyed evaluator registry. Extensible without inheritance: new
/// gates register under a new id.
pub struct GateRegistry {
    evaluators: HashMap<&'static str, Box<dyn GateEvaluator>>,
}

impl GateRegistry {
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    /// Registry with the four built-in gates.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(plan_approval::PlanApproval));
        registry.register(Box::new(tests_pass::TestsPass));
        registry.register(Box::new(code_review::CodeReview));
        registry.register(Box::new(merge_wait::MergeWait));
        registry
    }

    pub fn register(&mut self, evaluator: Box<dyn GateEvaluator>) {
        self.evaluators.insert(evaluator.gate_id(), evaluator);
    }

    pub fn get(&self, gate_id: &str) -> Option<&dyn GateEvaluator> {
        self.evaluators.get(gate_id).map(|b| b.as_ref())
    }
}

impl Default for GateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Which required gates guard the exit of a phase when no routing decision
/// says otherwise. Phases not listed progress on orchestrator decisions
/// alone.
pub fn default_gates_for_phase(phase: Phase) -> &'static [&'static str] {
    match phase {
        Phase::AwaitingPlanApproval => &[GATE_PLAN_APPROVAL],
        Phase::Executing => &[GATE_TESTS_PASS],
        Phase::AwaitingReview => &[GATE_CODE_REVIEW, GATE_MERGE_WAIT],
        _ => &[],
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::orchestrator::machine::Phase;
    use crate::store::runs::Run;
    use chrono::Utc;

    pub fn run_in_phase(phase: Phase) -> Run {
        let now = Utc::now();
        Run {
            run_id: "run-1".into(),
            task_id: "task-1".into(),
            project_id: "project-1".into(),
            repo_id: "repo-1".into(),
            run_number: 1,
            phase,
            step: None,
            next_sequence: 1,
            last_event_sequence: 0,
            base_branch: "main".into(),
            branch: Some("conductor/run-1".into()),
            plan_revisions: 0,
            test_fix_attempts: 0,
            review_rounds: 0,
            result: None,
            result_reason: None,
            blocked_reason: None,
            blocked_context: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn empty_context(phase: Phase) -> GateContext {
        GateContext {
            run: run_in_phase(phase),
            artifacts: Vec::new(),
            operator_actions: Vec::new(),
            skip_tests_override: None,
            tool_invocations: HashMap::new(),
            pr: PrSignals::default(),
            gate_configs: HashMap::new(),
        }
    }
}
