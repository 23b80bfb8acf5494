use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse-grained run state. Only the orchestrator moves a run between
/// phases, and every move is validated against [`is_valid_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Planning,
    AwaitingPlanApproval,
    Executing,
    AwaitingReview,
    Blocked,
    Completed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Planning => "planning",
            Phase::AwaitingPlanApproval => "awaiting_plan_approval",
            Phase::Executing => "executing",
            Phase::AwaitingReview => "awaiting_review",
            Phase::Blocked => "blocked",
            Phase::Completed => "completed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Phase::Pending),
            "planning" => Ok(Phase::Planning),
            "awaiting_plan_approval" => Ok(Phase::AwaitingPlanApproval),
            "executing" => Ok(Phase::Executing),
            "awaiting_review" => Ok(Phase::AwaitingReview),
            "blocked" => Ok(Phase::Blocked),
            "completed" => Ok(Phase::Completed),
            "cancelled" => Ok(Phase::Cancelled),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// The canonical transition table. `blocked` can resume into any working
/// phase; terminal phases admit nothing.
pub fn is_valid_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;
    match from {
        Pending => matches!(to, Planning | Blocked | Cancelled),
        Planning => matches!(to, AwaitingPlanApproval | Blocked | Cancelled),
        AwaitingPlanApproval => matches!(to, Planning | Executing | Blocked | Cancelled),
        Executing => matches!(to, AwaitingReview | Blocked | Cancelled),
        AwaitingReview => matches!(to, Executing | Completed | Blocked | Cancelled),
        Blocked => matches!(
            to,
            Pending | Planning | AwaitingPlanApproval | Executing | AwaitingReview | Cancelled
        ),
        Completed | Cancelled => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases_admit_nothing() {
        for to in [
            Phase::Pending,
            Phase::Planning,
            Phase::AwaitingPlanApproval,
            Phase::Executing,
            Phase::AwaitingReview,
            Phase::Blocked,
            Phase::Completed,
            Phase::Cancelled,
        ] {
            assert!(!is_valid_transition(Phase::Completed, to));
            assert!(!is_valid_transition(Phase::Cancelled, to));
        }
    }

    #[test]
    fn every_working_phase_can_cancel() {
        for from in [
            Phase::Pending,
            Phase::Planning,
            Phase::AwaitingPlanApproval,
            Phase::Executing,
            Phase::AwaitingReview,
            Phase::Blocked,
        ] {
            assert!(is_valid_transition(from, Phase::Cancelled));
        }
    }

    #[test]
    fn revision_loops_are_allowed() {
        assert!(is_valid_transition(
            Phase::AwaitingPlanApproval,
            Phase::Planning
        ));
        assert!(is_valid_transition(Phase::AwaitingReview, Phase::Executing));
    }

    #[test]
    fn skipping_phases_is_rejected() {
        assert!(!is_valid_transition(Phase::Pending, Phase::Executing));
        assert!(!is_valid_transition(Phase::Planning, Phase::Completed));
        assert!(!is_valid_transition(Phase::Executing, Phase::Completed));
    }

    #[test]
    fn blocked_resumes_anywhere_but_terminal_completion() {
        assert!(is_valid_transition(Phase::Blocked, Phase::Executing));
        assert!(is_valid_transition(Phase::Blocked, Phase::Pending));
        assert!(!is_valid_transition(Phase::Blocked, Phase::Completed));
    }

    #[test]
    fn phase_round_trips_through_strings() {
        for phase in [
            Phase::Pending,
            Phase::Planning,
            Phase::AwaitingPlanApproval,
            Phase::Executing,
            Phase::AwaitingReview,
            Phase::Blocked,
            Phase::Completed,
            Phase::Cancelled,
        ] {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
    }
}
