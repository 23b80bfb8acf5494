use super::{GateContext, GateEvaluator, GateKind, GateOutcome};

/// Automatic gate that holds a run in `awaiting_review` until its pull
/// request actually merges. Driven entirely by `pr.merged` / `pr.closed`
/// webhook facts keyed on the PR node id.
pub struct MergeWait;

impl GateEvaluator for MergeWait {
    fn gate_id(&self) -> &'static str {
        super::GATE_MERGE_WAIT
    }

    fn kind(&self) -> GateKind {
        GateKind::Automatic
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        if ctx.pr.node_id.is_none() {
            return GateOutcome::pending("Awaiting pull request");
        }
        if ctx.pr.merged {
            return GateOutcome::passed("Pull request merged");
        }
        if ctx.pr.closed_without_merge {
            return GateOutcome::failed("Pull request closed without merge");
        }
        GateOutcome::pending("Awaiting merge")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::testutil::empty_context;
    use crate::gates::GateStatus;
    use crate::orchestrator::machine::Phase;

    #[test]
    fn pending_until_merge() {
        let mut ctx = empty_context(Phase::AwaitingReview);
        ctx.pr.node_id = Some("PR_node".into());
        let outcome = MergeWait.evaluate(&ctx);
        assert_eq!(outcome.status, GateStatus::Pending);
        assert_eq!(outcome.reason.as_deref(), Some("Awaiting merge"));
    }

    #[test]
    fn merged_passes() {
        let mut ctx = empty_context(Phase::AwaitingReview);
        ctx.pr.node_id = Some("PR_node".into());
        ctx.pr.merged = true;
        let outcome = MergeWait.evaluate(&ctx);
        assert_eq!(outcome.status, GateStatus::Passed);
    }

    #[test]
    fn closed_without_merge_fails() {
        let mut ctx = empty_context(Phase::AwaitingReview);
        ctx.pr.node_id = Some("PR_node".into());
        ctx.pr.closed_without_merge = true;
        let outcome = MergeWait.evaluate(&ctx);
        assert_eq!(outcome.status, GateStatus::Failed);
    }
}
