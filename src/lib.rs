// Conductor - Run Orchestration for Autonomous Engineering Agents
// This exposes the core components for testing and integration

pub mod agent;
pub mod cancel;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod gates;
pub mod github;
pub mod orchestrator;
pub mod outbox;
pub mod redaction;
pub mod store;
pub mod telemetry;

// Re-export key types for easy access
pub use agent::{AgentError, AgentExecutor, AgentOutput, AgentRuntime, StepResult};
pub use cancel::{run_cancelled_in_db, CancellationRegistry};
pub use config::{config, init_config, ConductorConfig};
pub use database::DatabaseManager;
pub use error::{CoreError, CoreResult};
pub use events::{append_event, list_run_events, mark_event_processed, Event, EventClass, EventSource, NewEvent};
pub use gates::{GateContext, GateKind, GateOutcome, GateRegistry, GateStatus};
pub use github::{GitHubWriteError, GitHubWriter, OctocrabWriter, WriteHandles};
pub use orchestrator::{
    GateSweep, Orchestrator, Phase, TransitionInput, TransitionOutcome,
};
pub use outbox::{
    cancel_run_writes, enqueue_write, process_outbox, reset_stalled_write, reset_stalled_writes,
    EnqueueResult, GithubWrite, NewWrite, ProcessOptions, ProcessReport, WriteStatus,
};
pub use store::{derive_gate_state, Artifact, Override, Run, Task};
pub use telemetry::{
    create_run_span, generate_correlation_id, init_telemetry, shutdown_telemetry,
};
