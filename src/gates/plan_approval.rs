use super::{GateContext, GateEvaluator, GateKind, GateOutcome};
use crate::store::artifacts::{ARTIFACT_PLAN, ARTIFACT_REVIEW};
use crate::store::operator_actions::{ACTION_APPROVE_PLAN, ACTION_REJECT_RUN};

/// Human gate guarding the exit of `awaiting_plan_approval`: a validated
/// plan and plan review must exist, the review must not request changes,
/// and an operator must have approved.
///
/// Rejection is checked before approval so a stale approve cannot shadow a
/// rejection.
pub struct PlanApproval;

impl GateEvaluator for PlanApproval {
    fn gate_id(&self) -> &'static str {
        super::GATE_PLAN_APPROVAL
    }

    fn kind(&self) -> GateKind {
        GateKind::Human
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        let Some(_plan) = ctx.latest_artifact(ARTIFACT_PLAN) else {
            return GateOutcome::pending("Awaiting validated plan artifact");
        };

        let Some(review) = ctx.latest_artifact(ARTIFACT_REVIEW) else {
            return GateOutcome::pending("Awaiting validated review artifact");
        };

        let review_content = review.content_markdown.as_deref().unwrap_or("");
        if review_content.contains("CHANGES_REQUESTED") {
            return GateOutcome::pending("Review requested changes");
        }

        if let Some(reject) = ctx.action(ACTION_REJECT_RUN) {
            let reason = reject
                .comment
                .clone()
                .unwrap_or_else(|| "Run rejected by operator".to_string());
            return GateOutcome::failed(reason);
        }

        if let Some(approval) = ctx.action(ACTION_APPROVE_PLAN) {
            return GateOutcome::passed(format!("Plan approved by @{}", approval.operator));
        }

        GateOutcome::pending("Awaiting operator approval")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::testutil::empty_context;
    use crate::gates::GateStatus;
    use crate::orchestrator::machine::Phase;
    use crate::store::artifacts::{Artifact, ValidationStatus};
    use crate::store::operator_actions::OperatorAction;
    use chrono::Utc;
    use uuid::Uuid;

    fn artifact(artifact_type: &str, content: &str) -> Artifact {
        let now = Utc::now();
        Artifact {
            artifact_id: Uuid::new_v4().to_string(),
            run_id: "run-1".into(),
            artifact_type: artifact_type.into(),
            version: 1,
            content_markdown: Some(content.into()),
            blob_ref: None,
            size_bytes: content.len() as i64,
            checksum_sha256: None,
            validation_status: ValidationStatus::Valid,
            source_tool_invocation_id: None,
            created_by: "planner".into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn action(action_type: &str, comment: Option<&str>) -> OperatorAction {
        OperatorAction {
            action_id: Uuid::new_v4().to_string(),
            run_id: "run-1".into(),
            action_type: action_type.into(),
            operator: "casey".into(),
            comment: comment.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn pending_without_plan() {
        let ctx = empty_context(Phase::AwaitingPlanApproval);
        let outcome = PlanApproval.evaluate(&ctx);
        assert_eq!(outcome.status, GateStatus::Pending);
        assert_eq!(outcome.reason.as_deref(), Some("Awaiting validated plan artifact"));
    }

    #[test]
    fn pending_without_review() {
        let mut ctx = empty_context(Phase::AwaitingPlanApproval);
        ctx.artifacts.push(artifact("plan", "# Plan"));
        let outcome = PlanApproval.evaluate(&ctx);
        assert_eq!(outcome.status, GateStatus::Pending);
        assert_eq!(
            outcome.reason.as_deref(),
            Some("Awaiting validated review artifact")
        );
    }

    #[test]
    fn pending_when_review_requests_changes() {
        let mut ctx = empty_context(Phase::AwaitingPlanApproval);
        ctx.artifacts.push(artifact("plan", "# Plan"));
        ctx.artifacts
            .push(artifact("review", "CHANGES_REQUESTED: tighten scope"));
        ctx.operator_actions.push(action(ACTION_APPROVE_PLAN, None));
        let outcome = PlanApproval.evaluate(&ctx);
        assert_eq!(outcome.status, GateStatus::Pending);
        assert_eq!(outcome.reason.as_deref(), Some("Review requested changes"));
    }

    #[test]
    fn reject_beats_stale_approve() {
        let mut ctx = empty_context(Phase::AwaitingPlanApproval);
        ctx.artifacts.push(artifact("plan", "# Plan"));
        ctx.artifacts.push(artifact("review", "LGTM"));
        ctx.operator_actions.push(action(ACTION_APPROVE_PLAN, None));
        ctx.operator_actions
            .push(action(ACTION_REJECT_RUN, Some("wrong direction")));
        let outcome = PlanApproval.evaluate(&ctx);
        assert_eq!(outcome.status, GateStatus::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("wrong direction"));
    }

    #[test]
    fn passes_on_approval() {
        let mut ctx = empty_context(Phase::AwaitingPlanApproval);
        ctx.artifacts.push(artifact("plan", "# Plan"));
        ctx.artifacts.push(artifact("review", "LGTM"));
        ctx.operator_actions.push(action(ACTION_APPROVE_PLAN, None));
        let outcome = PlanApproval.evaluate(&ctx);
        assert_eq!(outcome.status, GateStatus::Passed);
    }

    #[test]
    fn pending_awaiting_operator() {
        let mut ctx = empty_context(Phase::AwaitingPlanApproval);
        ctx.artifacts.push(artifact("plan", "# Plan"));
        ctx.artifacts.push(artifact("review", "LGTM"));
        let outcome = PlanApproval.evaluate(&ctx);
        assert_eq!(outcome.status, GateStatus::Pending);
        assert_eq!(outcome.reason.as_deref(), Some("Awaiting operator approval"));
    }
}
