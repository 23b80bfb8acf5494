use super::{GateContext, GateEvaluator, GateKind, GateOutcome};
use crate::store::operator_actions::{ACTION_APPROVE_CODE, ACTION_REJECT_RUN};

/// Human gate guarding the exit of `awaiting_review`.
///
/// Event-driven: review verdicts arrive as webhook facts normalized
/// upstream. The gate keys the PR by its stable node id.
pub struct CodeReview;

impl GateEvaluator for CodeReview {
    fn gate_id(&self) -> &'static str {
        super::GATE_CODE_REVIEW
    }

    fn kind(&self) -> GateKind {
        GateKind::Human
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        if ctx.pr.node_id.is_none() {
            return GateOutcome::pending("Awaiting pull request");
        }

        if let Some(reject) = ctx.action(ACTION_REJECT_RUN) {
            let reason = reject
                .comment
                .clone()
                .unwrap_or_else(|| "Run rejected by operator".to_string());
            return GateOutcome::failed(reason);
        }

        if ctx.pr.changes_requested {
            return GateOutcome::pending("Review requested changes");
        }

        if ctx.pr.review_approved {
            return GateOutcome::passed("Code review approved");
        }
        if let Some(approval) = ctx.action(ACTION_APPROVE_CODE) {
            return GateOutcome::passed(format!("Code approved by @{}", approval.operator));
        }

        GateOutcome::pending("Awaiting code review")
    }
}
