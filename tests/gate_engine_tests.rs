//! Gate engine behavior against the real store: ground-truth test results,
//! override scope resolution, derived gate state, and routing-decision
//! narrowing.

mod common;

use chrono::{Duration, Utc};
use serde_json::json;

use conductor::events::{self, event_types, EventClass, EventSource, NewEvent};
use conductor::gates::GateStatus;
use conductor::orchestrator::{Orchestrator, Phase, TransitionInput};
use conductor::store::overrides::{
    self, find_matching_override_pool, NewOverride, OverrideKind, OverrideScope,
};
use conductor::store::routing::{self, NewRoutingDecision};
use conductor::store::tool_invocations;
use conductor::store::{derive_gate_state, runs};

use common::{seed_run, seed_run_for_project, seed_sibling_run, test_pool, valid_artifact};

async fn drive_to_executing(orchestrator: &Orchestrator, run_id: &str) {
    for phase in [Phase::Planning, Phase::AwaitingPlanApproval, Phase::Executing] {
        orchestrator
            .transition_phase(TransitionInput::new(run_id, phase, "test-driver"))
            .await
            .unwrap();
    }
}

/// Record a test report whose tool invocation carries the real exit code.
async fn failing_test_report(pool: &sqlx::SqlitePool, run_id: &str, lie: &str) -> String {
    let mut tx = pool.begin().await.unwrap();
    let invocation = tool_invocations::create_tool_invocation(
        &mut tx,
        run_id,
        "cargo-test",
        &json!({ "command": "cargo test" }),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    tool_invocations::finish_tool_invocation(
        pool,
        &invocation.tool_invocation_id,
        &json!({ "exit_code": 1, "result": lie }),
    )
    .await
    .unwrap();
    valid_artifact(
        pool,
        run_id,
        "test_report",
        "All tests passed! 42/42 green.",
        Some(&invocation.tool_invocation_id),
    )
    .await;
    invocation.tool_invocation_id
}

#[tokio::test]
async fn agent_cannot_lie_about_test_results() {
    let pool = test_pool().await;
    let run = seed_run(&pool).await;
    let orchestrator = Orchestrator::new(pool.clone());
    drive_to_executing(&orchestrator, &run.run_id).await;

    // The agent claims success; the tool layer recorded exit code 1.
    failing_test_report(&pool, &run.run_id, "pass").await;

    let sweep = orchestrator
        .evaluate_gates_and_transition(
            &run.run_id,
            Phase::Executing,
            TransitionInput::new(&run.run_id, Phase::AwaitingReview, "orchestrator"),
        )
        .await
        .unwrap();

    assert_eq!(sweep.evaluations.len(), 1);
    assert_eq!(sweep.evaluations[0].gate_id, "tests_pass");
    assert_ne!(sweep.evaluations[0].status, GateStatus::Passed);
    assert_eq!(
        sweep.evaluations[0].reason.as_deref(),
        Some("Tests failed, retry 1/3")
    );
    assert!(sweep.transitioned.is_none());

    let current = runs::get_run_by_pool(&pool, &run.run_id).await.unwrap().unwrap();
    assert_eq!(current.phase, Phase::Executing);
}

#[tokio::test]
async fn tests_pass_escalates_once_retry_budget_is_spent() {
    let pool = test_pool().await;
    let run = seed_run(&pool).await;
    let orchestrator = Orchestrator::new(pool.clone());
    drive_to_executing(&orchestrator, &run.run_id).await;
    failing_test_report(&pool, &run.run_id, "fail").await;

    // Two failed fix attempts recorded: still inside the budget of 3.
    let mut conn = pool.acquire().await.unwrap();
    runs::increment_test_fix_attempts(&mut conn, &run.run_id)
        .await
        .unwrap();
    let attempts = runs::increment_test_fix_attempts(&mut conn, &run.run_id)
        .await
        .unwrap();
    assert_eq!(attempts, 2);
    drop(conn);

    let sweep = orchestrator
        .evaluate_gates_and_transition(
            &run.run_id,
            Phase::Executing,
            TransitionInput::new(&run.run_id, Phase::AwaitingReview, "orchestrator"),
        )
        .await
        .unwrap();
    assert_eq!(sweep.evaluations[0].status, GateStatus::Pending);
    assert_eq!(
        sweep.evaluations[0].reason.as_deref(),
        Some("Tests failed, retry 3/3")
    );

    // Third failed attempt exhausts the budget: failed with escalation.
    let mut conn = pool.acquire().await.unwrap();
    runs::increment_test_fix_attempts(&mut conn, &run.run_id)
        .await
        .unwrap();
    drop(conn);

    let sweep = orchestrator
        .evaluate_gates_and_transition(
            &run.run_id,
            Phase::Executing,
            TransitionInput::new(&run.run_id, Phase::AwaitingReview, "orchestrator"),
        )
        .await
        .unwrap();
    assert_eq!(sweep.evaluations[0].status, GateStatus::Failed);
    assert_eq!(
        sweep.evaluations[0].reason.as_deref(),
        Some("Tests failed after 3 attempts")
    );
    let details: serde_json::Value =
        serde_json::from_str(sweep.evaluations[0].details.as_deref().unwrap()).unwrap();
    assert_eq!(details["max_retries"], 3);
    assert!(sweep.transitioned.is_none());
}

#[tokio::test]
async fn skip_tests_override_reaches_sibling_runs_in_task() {
    let pool = test_pool().await;
    let r1 = seed_run(&pool).await;
    let r2 = seed_sibling_run(&pool, &r1).await;
    // A run in an unrelated project and task.
    let r3 = seed_run_for_project(&pool, "project-2", "repo-2").await;

    let mut conn = pool.acquire().await.unwrap();
    overrides::create_override(
        &mut conn,
        NewOverride {
            run_id: r1.run_id.clone(),
            kind: OverrideKind::SkipTests,
            target_id: None,
            scope: OverrideScope::ThisTask,
            operator: "casey".to_string(),
            justification: "suite broken upstream, tracked in issue 88".to_string(),
            expires_at: None,
        },
    )
    .await
    .unwrap();
    drop(conn);

    let orchestrator = Orchestrator::new(pool.clone());
    drive_to_executing(&orchestrator, &r2.run_id).await;
    failing_test_report(&pool, &r2.run_id, "fail").await;

    // Sibling run in the same task: overridden despite the failing report.
    let sweep = orchestrator
        .evaluate_gates_and_transition(
            &r2.run_id,
            Phase::Executing,
            TransitionInput::new(&r2.run_id, Phase::AwaitingReview, "orchestrator"),
        )
        .await
        .unwrap();
    assert_eq!(sweep.evaluations[0].status, GateStatus::Passed);
    assert_eq!(
        sweep.evaluations[0].reason.as_deref(),
        Some("Overridden: skip_tests by @casey")
    );
    assert!(sweep.transitioned.is_some());

    // Unrelated task: no override match.
    let found = find_matching_override_pool(&pool, &r3.run_id, OverrideKind::SkipTests, None)
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn expired_override_is_ignored() {
    let pool = test_pool().await;
    let run = seed_run(&pool).await;

    let mut conn = pool.acquire().await.unwrap();
    overrides::create_override(
        &mut conn,
        NewOverride {
            run_id: run.run_id.clone(),
            kind: OverrideKind::SkipTests,
            target_id: None,
            scope: OverrideScope::ThisRun,
            operator: "casey".to_string(),
            justification: "temporary exception".to_string(),
            expires_at: Some(Utc::now() - Duration::microseconds(1)),
        },
    )
    .await
    .unwrap();
    drop(conn);

    let found = find_matching_override_pool(&pool, &run.run_id, OverrideKind::SkipTests, None)
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn broader_scope_wins_ties() {
    let pool = test_pool().await;
    let run = seed_run(&pool).await;

    let mut conn = pool.acquire().await.unwrap();
    for (scope, justification) in [
        (OverrideScope::ThisRun, "narrow"),
        (OverrideScope::ProjectWide, "blanket"),
    ] {
        overrides::create_override(
            &mut conn,
            NewOverride {
                run_id: run.run_id.clone(),
                kind: OverrideKind::SkipTests,
                target_id: None,
                scope,
                operator: "casey".to_string(),
                justification: justification.to_string(),
                expires_at: None,
            },
        )
        .await
        .unwrap();
    }
    drop(conn);

    let found = find_matching_override_pool(&pool, &run.run_id, OverrideKind::SkipTests, None)
        .await
        .unwrap()
        .expect("an override applies");
    assert_eq!(found.scope, OverrideScope::ProjectWide);
}

#[tokio::test]
async fn derived_gate_state_takes_latest_by_causation_sequence() {
    let pool = test_pool().await;
    let run = seed_run(&pool).await;
    let orchestrator = Orchestrator::new(pool.clone());
    drive_to_executing(&orchestrator, &run.run_id).await;

    // First sweep: no report yet, tests_pass pending.
    orchestrator
        .evaluate_gates_and_transition(
            &run.run_id,
            Phase::Executing,
            TransitionInput::new(&run.run_id, Phase::AwaitingReview, "orchestrator"),
        )
        .await
        .unwrap();
    let state = derive_gate_state(&pool, &run.run_id).await.unwrap();
    assert_eq!(state.get("tests_pass"), Some(&GateStatus::Pending));

    // Now a green run arrives; the newer evaluation wins.
    let mut tx = pool.begin().await.unwrap();
    let invocation = tool_invocations::create_tool_invocation(
        &mut tx,
        &run.run_id,
        "cargo-test",
        &json!({}),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    tool_invocations::finish_tool_invocation(
        &pool,
        &invocation.tool_invocation_id,
        &json!({ "exit_code": 0 }),
    )
    .await
    .unwrap();
    valid_artifact(
        &pool,
        &run.run_id,
        "test_report",
        "42 passed",
        Some(&invocation.tool_invocation_id),
    )
    .await;

    let sweep = orchestrator
        .evaluate_gates_and_transition(
            &run.run_id,
            Phase::Executing,
            TransitionInput::new(&run.run_id, Phase::AwaitingReview, "orchestrator"),
        )
        .await
        .unwrap();
    assert_eq!(sweep.evaluations[0].status, GateStatus::Passed);

    let state = derive_gate_state(&pool, &run.run_id).await.unwrap();
    assert_eq!(state.get("tests_pass"), Some(&GateStatus::Passed));
}

#[tokio::test]
async fn routing_decision_narrows_required_gates() {
    let pool = test_pool().await;
    let run = seed_run(&pool).await;
    let orchestrator = Orchestrator::new(pool.clone());
    drive_to_executing(&orchestrator, &run.run_id).await;
    orchestrator
        .transition_phase(TransitionInput::new(
            &run.run_id,
            Phase::AwaitingReview,
            "test-driver",
        ))
        .await
        .unwrap();

    // Routing says only code_review is required; merge_wait drops out.
    let mut conn = pool.acquire().await.unwrap();
    routing::create_routing_decision(
        &mut conn,
        NewRoutingDecision {
            run_id: run.run_id.clone(),
            classifier: json!({ "complexity": "low" }),
            agent_graph: "single-agent".to_string(),
            required_gates: Some(vec!["plan_approval".into(), "code_review".into()]),
            optional_gates: None,
        },
    )
    .await
    .unwrap();

    // An approved review fact arrives from the webhook normalizer.
    events::append_event(
        &mut conn,
        NewEvent::new(
            event_types::PR_OPENED,
            EventClass::Fact,
            EventSource::Webhook,
            "delivery-1:pr.opened",
        )
        .for_run(run.run_id.clone())
        .with_payload(json!({ "node_id": "PR_kwDO123", "number": 7 })),
    )
    .await
    .unwrap();
    events::append_event(
        &mut conn,
        NewEvent::new(
            event_types::PR_REVIEW_SUBMITTED,
            EventClass::Fact,
            EventSource::Webhook,
            "delivery-2:pr.review_submitted",
        )
        .for_run(run.run_id.clone())
        .with_payload(json!({
            "node_id": "PR_kwDO123",
            "state": "approved",
            "changes_requested": false,
        })),
    )
    .await
    .unwrap();
    drop(conn);

    let sweep = orchestrator
        .evaluate_gates_and_transition(
            &run.run_id,
            Phase::AwaitingReview,
            TransitionInput::new(&run.run_id, Phase::Completed, "orchestrator")
                .with_result("success"),
        )
        .await
        .unwrap();

    let evaluated: Vec<&str> = sweep
        .evaluations
        .iter()
        .map(|e| e.gate_id.as_str())
        .collect();
    assert_eq!(evaluated, vec!["code_review"]);
    assert_eq!(sweep.evaluations[0].status, GateStatus::Passed);
    let moved = sweep.transitioned.expect("only required gate passed");
    assert_eq!(moved.run.phase, Phase::Completed);
    assert!(moved.run.completed_at.is_some());
}

#[tokio::test]
async fn merge_wait_follows_pr_lifecycle() {
    let pool = test_pool().await;
    let run = seed_run(&pool).await;
    let orchestrator = Orchestrator::new(pool.clone());
    drive_to_executing(&orchestrator, &run.run_id).await;
    orchestrator
        .transition_phase(TransitionInput::new(
            &run.run_id,
            Phase::AwaitingReview,
            "test-driver",
        ))
        .await
        .unwrap();

    let mut conn = pool.acquire().await.unwrap();
    events::append_event(
        &mut conn,
        NewEvent::new(
            event_types::PR_OPENED,
            EventClass::Fact,
            EventSource::Webhook,
            "delivery-3:pr.opened",
        )
        .for_run(run.run_id.clone())
        .with_payload(json!({ "node_id": "PR_kwDO999" })),
    )
    .await
    .unwrap();
    events::append_event(
        &mut conn,
        NewEvent::new(
            event_types::PR_REVIEW_SUBMITTED,
            EventClass::Fact,
            EventSource::Webhook,
            "delivery-4:pr.review_submitted",
        )
        .for_run(run.run_id.clone())
        .with_payload(json!({ "node_id": "PR_kwDO999", "state": "approved" })),
    )
    .await
    .unwrap();
    drop(conn);

    // Review approved but PR not merged: merge_wait holds the run.
    let sweep = orchestrator
        .evaluate_gates_and_transition(
            &run.run_id,
            Phase::AwaitingReview,
            TransitionInput::new(&run.run_id, Phase::Completed, "orchestrator")
                .with_result("success"),
        )
        .await
        .unwrap();
    let by_gate: std::collections::HashMap<&str, GateStatus> = sweep
        .evaluations
        .iter()
        .map(|e| (e.gate_id.as_str(), e.status))
        .collect();
    assert_eq!(by_gate["code_review"], GateStatus::Passed);
    assert_eq!(by_gate["merge_wait"], GateStatus::Pending);
    assert!(sweep.transitioned.is_none());

    // The merge webhook lands (derived from closed + merged=true upstream).
    let mut conn = pool.acquire().await.unwrap();
    events::append_event(
        &mut conn,
        NewEvent::new(
            event_types::PR_MERGED,
            EventClass::Fact,
            EventSource::Webhook,
            "delivery-5:pr.merged",
        )
        .for_run(run.run_id.clone())
        .with_payload(json!({ "node_id": "PR_kwDO999" })),
    )
    .await
    .unwrap();
    drop(conn);

    let sweep = orchestrator
        .evaluate_gates_and_transition(
            &run.run_id,
            Phase::AwaitingReview,
            TransitionInput::new(&run.run_id, Phase::Completed, "orchestrator")
                .with_result("success"),
        )
        .await
        .unwrap();
    let moved = sweep.transitioned.expect("merged PR completes the run");
    assert_eq!(moved.run.phase, Phase::Completed);
    assert_eq!(moved.run.result.as_deref(), Some("success"));
}
