//! Projection store: mutable "current state" rows derived from the event
//! log. Every mutation happens in the same transaction as the event that
//! caused it; there is no background apply loop.

pub mod artifacts;
pub mod gate_evaluations;
pub mod operator_actions;
pub mod overrides;
pub mod routing;
pub mod runs;
pub mod tasks;
pub mod tool_invocations;

pub use artifacts::{Artifact, NewArtifact, ValidationStatus};
pub use gate_evaluations::{derive_gate_state, GateEvaluation, NewGateEvaluation};
pub use operator_actions::{NewOperatorAction, OperatorAction};
pub use overrides::{
    find_matching_override, find_matching_override_pool, NewOverride, Override, OverrideKind,
    OverrideScope,
};
pub use routing::{NewRoutingDecision, RoutingDecision};
pub use runs::{NewRun, Run};
pub use tasks::Task;
pub use tool_invocations::ToolInvocation;
