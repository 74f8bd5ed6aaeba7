//! Transport behavior observed through a full session: variable
//! seeding, output truncation, and the execute-deadline watchdog.

use rlm_common::{RlmConfig, RlmError, RlmEvent};
use rlm_core::ToolRegistry;
use rlm_tests::{
    drain_events, worker_sandbox_config, worker_session, worker_session_with, ScriptedModel,
    SlowTool,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn query_and_context_are_seeded_into_the_sandbox() {
    let model = ScriptedModel::new(["```\nget query\nget context\n```", "FINAL(\"ok\")"]);
    let session = worker_session(RlmConfig::default(), model);
    let mut events = session.subscribe();

    session.complete("the question", "the context").await.unwrap();

    let output = drain_events(&mut events)
        .iter()
        .find_map(|e| match e {
            RlmEvent::CodeExecutionCompleted { output, .. } => Some(output.clone()),
            _ => None,
        })
        .expect("execution output");
    assert!(output.contains("the question"));
    assert!(output.contains("the context"));

    session.shutdown().await;
}

#[tokio::test]
async fn long_output_is_truncated_with_a_marker() {
    let config = RlmConfig {
        max_execution_output_chars: 16,
        ..RlmConfig::default()
    };
    let long_line = "x".repeat(200);
    let model = ScriptedModel::new([
        format!("```\nprint {long_line}\n```"),
        "FINAL(\"ok\")".to_string(),
    ]);
    let session = worker_session(config, model);
    let mut events = session.subscribe();

    session.complete("q", "").await.unwrap();

    let output = drain_events(&mut events)
        .iter()
        .find_map(|e| match e {
            RlmEvent::CodeExecutionCompleted { output, .. } => Some(output.clone()),
            _ => None,
        })
        .expect("execution output");
    assert!(output.starts_with(&"x".repeat(16)));
    assert!(output.contains("output truncated"));

    session.shutdown().await;
}

#[tokio::test]
async fn bridge_round_trips_extend_the_execute_deadline() {
    let mut sandbox_config = worker_sandbox_config();
    sandbox_config.execute_timeout = Duration::from_millis(300);

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SlowTool {
        delay: Duration::from_millis(200),
        result: serde_json::json!("slow done"),
    }));

    // Total wall time exceeds the execute timeout, but each silent
    // stretch stays under it thanks to the two extensions.
    let model = ScriptedModel::new(["```\ncall slow []\nsleep 200\nprint ok\n```", "FINAL(\"ok\")"]);
    let session = worker_session_with(RlmConfig::default(), sandbox_config, model, tools);
    let mut events = session.subscribe();

    let answer = session.complete("q", "").await.unwrap();
    assert_eq!(answer, "ok");

    let output = drain_events(&mut events)
        .iter()
        .find_map(|e| match e {
            RlmEvent::CodeExecutionCompleted { output, .. } => Some(output.clone()),
            _ => None,
        })
        .expect("execution output");
    assert!(output.contains("slow done"));
    assert!(output.ends_with("ok"));

    session.shutdown().await;
}

#[tokio::test]
async fn a_silent_guest_trips_the_watchdog_and_fails_the_call() {
    let mut sandbox_config = worker_sandbox_config();
    sandbox_config.execute_timeout = Duration::from_millis(100);

    let model = ScriptedModel::new(["```\nsleep 1000\n```"]);
    let session = worker_session_with(
        RlmConfig::default(),
        sandbox_config,
        model,
        ToolRegistry::new(),
    );

    let err = session.complete("q", "").await.unwrap_err();
    match err {
        RlmError::Sandbox { message } => assert!(message.contains("timed out")),
        other => panic!("expected a sandbox fault, got {other}"),
    }

    session.shutdown().await;
}
