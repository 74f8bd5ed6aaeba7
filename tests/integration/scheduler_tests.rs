//! End-to-end scheduler behavior over the worker transport.

use assert_matches::assert_matches;
use rlm_common::{
    BudgetResource, CallId, QueueRejection, RlmCommand, RlmConfig, RlmError, RlmEvent, WarningCode,
};
use rlm_core::{GenerateRequest, Session, ToolRegistry};
use rlm_tests::{
    drain_events, text_response, wait_for_event, worker_session, ClosureModel, HangingFactory,
    ScriptedModel,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn finalizes_on_submit_directive() {
    let model = ScriptedModel::new(["FINAL(\"4\")"]);
    let session = worker_session(RlmConfig::default(), model.clone());
    let mut events = session.subscribe();

    let answer = session.complete("what is 2+2?", "").await.unwrap();
    assert_eq!(answer, "4");
    assert_eq!(model.calls(), 1);

    let events = drain_events(&mut events);
    let tags: Vec<&str> = events.iter().map(|e| e.tag()).collect();
    assert!(tags.contains(&"CallStarted"));
    assert!(tags.contains(&"IterationStarted"));
    assert!(tags.contains(&"ModelResponse"));
    assert!(tags.contains(&"CallFinalized"));

    session.shutdown().await;
}

#[tokio::test]
async fn code_runs_before_the_final_answer() {
    let model = ScriptedModel::new(["```\nprint hello\n```", "FINAL(\"done\")"]);
    let session = worker_session(RlmConfig::default(), model.clone());
    let mut events = session.subscribe();

    let answer = session.complete("say hello", "").await.unwrap();
    assert_eq!(answer, "done");
    assert_eq!(model.calls(), 2);

    let events = drain_events(&mut events);
    let output = events
        .iter()
        .find_map(|e| match e {
            RlmEvent::CodeExecutionCompleted { output, .. } => Some(output.clone()),
            _ => None,
        })
        .expect("code execution completed");
    assert_eq!(output, "hello");

    // Execution happened between the two iterations.
    let iterations: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            RlmEvent::IterationStarted { iteration, .. } => Some(*iteration),
            _ => None,
        })
        .collect();
    assert_eq!(iterations, vec![1, 2]);

    session.shutdown().await;
}

#[tokio::test]
async fn guest_errors_feed_back_and_the_call_continues() {
    let model = ScriptedModel::new(["```\nerror boom\n```", "FINAL(\"recovered\")"]);
    let session = worker_session(RlmConfig::default(), model.clone());
    let mut events = session.subscribe();

    let answer = session.complete("q", "").await.unwrap();
    assert_eq!(answer, "recovered");

    let events = drain_events(&mut events);
    let error_output_at = events
        .iter()
        .position(|e| {
            matches!(
                e,
                RlmEvent::CodeExecutionCompleted { output, .. } if output == "Error: boom"
            )
        })
        .expect("error output event");
    // A further generate step followed the failed execution.
    assert!(events[error_output_at..]
        .iter()
        .any(|e| matches!(e, RlmEvent::IterationStarted { iteration: 2, .. })));

    session.shutdown().await;
}

#[tokio::test]
async fn iteration_exhaustion_takes_one_extract_call() {
    let config = RlmConfig {
        max_iterations: 2,
        ..RlmConfig::default()
    };
    let model = ScriptedModel::new([
        "```\nprint a\n```",
        "```\nprint b\n```",
        "FINAL(\"42\")",
    ]);
    let session = worker_session(config, model.clone());

    let answer = session.complete("q", "").await.unwrap();
    assert_eq!(answer, "42");
    // Two iterations plus exactly one extract call.
    assert_eq!(model.calls(), 3);

    session.shutdown().await;
}

#[tokio::test]
async fn failed_extract_surfaces_no_final_answer() {
    let config = RlmConfig {
        max_iterations: 1,
        ..RlmConfig::default()
    };
    // One scripted response; the extract call runs off the end of the
    // script and fails.
    let model = ScriptedModel::new(["```\nprint a\n```"]);
    let session = worker_session(config, model.clone());
    let mut events = session.subscribe();

    let err = session.complete("q", "").await.unwrap_err();
    assert_matches!(err, RlmError::NoFinalAnswer { max_iterations: 1, .. });
    assert_eq!(model.calls(), 2);
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, RlmEvent::CallFailed { .. })));

    session.shutdown().await;
}

#[tokio::test]
async fn extract_fallback_answers_from_the_recorded_work() {
    let config = RlmConfig {
        max_iterations: 1,
        ..RlmConfig::default()
    };
    // The fallback prompt must carry the transcript captured when the
    // iteration budget ran out, execution output included.
    let model = Arc::new(ClosureModel(|request: &GenerateRequest| {
        let extracting = request
            .messages
            .iter()
            .any(|m| m.content.contains("Submit your answer now"));
        if !extracting {
            return text_response("```\nprint partial work\n```");
        }
        let saw_work = request
            .messages
            .iter()
            .any(|m| m.content.contains("[Execution Output]\npartial work"));
        if saw_work {
            text_response("FINAL(\"salvaged\")")
        } else {
            text_response("FINAL(\"lost the transcript\")")
        }
    }));
    let session = worker_session(config, model);

    let answer = session.complete("q", "").await.unwrap();
    assert_eq!(answer, "salvaged");

    session.shutdown().await;
}

#[tokio::test]
async fn stale_commands_warn_without_hurting_the_root_call() {
    let model = ScriptedModel::new(["FINAL(\"ok\")"]);
    let session = worker_session(RlmConfig::default(), model);
    let mut events = session.subscribe();

    session
        .runtime()
        .enqueue(RlmCommand::GenerateStep {
            call_id: CallId::new(),
        })
        .unwrap();

    let answer = session.complete("q", "").await.unwrap();
    assert_eq!(answer, "ok");

    let warning = wait_for_event(&mut events, Duration::from_secs(2), |e| {
        matches!(
            e,
            RlmEvent::SchedulerWarning {
                code: WarningCode::StaleCommandDropped,
                ..
            }
        )
    })
    .await;
    assert_matches!(
        warning,
        RlmEvent::SchedulerWarning {
            command_tag: Some(tag),
            ..
        } if tag == "GenerateStep"
    );

    session.shutdown().await;
}

#[tokio::test]
async fn interruption_mid_execute_drains_all_state() {
    let model = ScriptedModel::new(["```\nnever returns\n```"]);
    let session = Session::new(
        RlmConfig::default(),
        model,
        |_bridge| Arc::new(HangingFactory),
        ToolRegistry::new(),
        None,
    );
    let runtime = Arc::clone(session.runtime());
    let mut events = session.subscribe();

    let pending = tokio::spawn(async move { session.complete("q", "").await });

    wait_for_event(&mut events, Duration::from_secs(2), |e| {
        matches!(e, RlmEvent::CodeExecutionStarted { .. })
    })
    .await;
    assert_eq!(runtime.live_calls(), 1);

    // Recover the session handle to shut down: the spawned task only
    // borrowed the runtime, so close through the runtime directly.
    runtime.begin_close();
    runtime.teardown().await;

    assert_eq!(runtime.live_calls(), 0);
    assert_eq!(runtime.pending_bridge_calls(), 0);
    let offer = runtime
        .enqueue(RlmCommand::GenerateStep {
            call_id: CallId::new(),
        })
        .unwrap_err();
    assert_matches!(
        offer,
        RlmError::SchedulerQueue {
            reason: QueueRejection::Closed,
            ..
        }
    );

    let outcome = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("complete() must return after teardown")
        .unwrap();
    assert!(outcome.is_err());
}

#[tokio::test]
async fn sub_calls_resolve_the_parent_bridge_future() {
    let model = Arc::new(ClosureModel(|request: &GenerateRequest| {
        if request.is_sub_call {
            return text_response("FINAL(\"sub answer\")");
        }
        let seen_output = request
            .messages
            .iter()
            .any(|m| m.content.contains("sub answer"));
        if seen_output {
            text_response("FINAL(\"parent done\")")
        } else {
            text_response("```\ncall llm_query [\"what is the sub answer?\"]\n```")
        }
    }));
    let session = worker_session(RlmConfig::default(), model);
    let mut events = session.subscribe();

    let answer = session.complete("q", "").await.unwrap();
    assert_eq!(answer, "parent done");

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, RlmEvent::CallStarted { depth: 1, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        RlmEvent::BridgeCallReceived { method, .. } if method == "llm_query"
    )));

    session.shutdown().await;
}

#[tokio::test]
async fn recursion_depth_is_capped() {
    let config = RlmConfig {
        max_depth: 0,
        ..RlmConfig::default()
    };
    let model = ScriptedModel::new([
        "```\ncall llm_query [\"too deep\"]\n```",
        "FINAL(\"gave up\")",
    ]);
    let session = worker_session(config, model);
    let mut events = session.subscribe();

    let answer = session.complete("q", "").await.unwrap();
    assert_eq!(answer, "gave up");

    // The depth rejection came back as execution output, not a crash.
    assert!(drain_events(&mut events).iter().any(|e| matches!(
        e,
        RlmEvent::CodeExecutionCompleted { output, .. } if output.contains("depth limit")
    )));

    session.shutdown().await;
}

#[tokio::test]
async fn budget_polls_answer_from_the_shared_cell() {
    let model = ScriptedModel::new(["```\ncall budget []\n```", "FINAL(\"ok\")"]);
    let session = worker_session(RlmConfig::default(), model);
    let mut events = session.subscribe();

    let answer = session.complete("q", "").await.unwrap();
    assert_eq!(answer, "ok");

    let output = drain_events(&mut events)
        .iter()
        .find_map(|e| match e {
            RlmEvent::CodeExecutionCompleted { output, .. } => Some(output.clone()),
            _ => None,
        })
        .expect("budget output");
    assert!(output.contains("llmCallsRemaining"));

    session.shutdown().await;
}

#[tokio::test]
async fn model_errors_fail_the_call_without_fallback() {
    // Empty script: the very first generate step gets a model error.
    let model = ScriptedModel::new(Vec::<String>::new());
    let session = worker_session(RlmConfig::default(), model.clone());

    let err = session.complete("q", "").await.unwrap_err();
    assert_matches!(err, RlmError::ModelCall { .. });
    // Model errors are not exhaustion: no extract call happened.
    assert_eq!(model.calls(), 1);

    session.shutdown().await;
}

#[tokio::test]
async fn llm_call_budget_gates_before_the_model_is_invoked() {
    let config = RlmConfig {
        max_llm_calls: 0,
        ..RlmConfig::default()
    };
    let model = ScriptedModel::new(["FINAL(\"never\")"]);
    let session = worker_session(config, model.clone());

    let err = session.complete("q", "").await.unwrap_err();
    assert_matches!(
        err,
        RlmError::BudgetExhausted {
            resource: BudgetResource::LlmCalls,
            ..
        }
    );
    // Neither the step nor the extract fallback could afford a call.
    assert_eq!(model.calls(), 0);

    session.shutdown().await;
}
