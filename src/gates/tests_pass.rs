use serde_json::json;

use super::{GateContext, GateEvaluator, GateKind, GateOutcome};
use crate::store::artifacts::ARTIFACT_TEST_REPORT;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Automatic gate guarding the exit of `executing`.
///
/// The verdict comes from the tool layer's recorded exit code, never from
/// the agent's summary: a test report without a backing tool invocation
/// cannot pass. An active `skip_tests` override short-circuits everything.
pub struct TestsPass;

impl GateEvaluator for TestsPass {
    fn gate_id(&self) -> &'static str {
        super::GATE_TESTS_PASS
    }

    fn kind(&self) -> GateKind {
        GateKind::Automatic
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        if let Some(active) = &ctx.skip_tests_override {
            return GateOutcome::passed(format!(
                "Overridden: skip_tests by @{}",
                active.operator
            ))
            .with_details(json!({ "override": true, "override_id": active.override_id }));
        }

        let Some(report) = ctx.latest_artifact(ARTIFACT_TEST_REPORT) else {
            return GateOutcome::pending("Tests not yet run");
        };

        let Some(invocation_id) = report.source_tool_invocation_id.as_deref() else {
            return GateOutcome::pending(
                "Test report has no tool invocation; cannot verify results",
            );
        };

        let Some(invocation) = ctx.tool_invocations.get(invocation_id) else {
            return GateOutcome::pending(
                "Tool invocation record missing; cannot verify results",
            );
        };

        let Some(exit_code) = invocation.exit_code() else {
            return GateOutcome::pending(
                "Tool invocation has no exit code; cannot verify results",
            );
        };

        if exit_code == 0 {
            return GateOutcome::passed("All tests passed");
        }

        let attempts = ctx.run.test_fix_attempts as u32;
        let max_retries = ctx.gate_config_u32(self.gate_id(), "max_retries", DEFAULT_MAX_RETRIES);
        if attempts < max_retries {
            GateOutcome::pending(format!(
                "Tests failed, retry {}/{}",
                attempts + 1,
                max_retries
            ))
            .with_details(json!({
                "test_fix_attempts": attempts,
                "max_retries": max_retries,
                "exit_code": exit_code,
            }))
        } else {
            GateOutcome::failed(format!("Tests failed after {max_retries} attempts"))
                .escalated()
                .with_details(json!({
                    "test_fix_attempts": attempts,
                    "max_retries": max_retries,
                    "exit_code": exit_code,
                }))
        }
    }
}
