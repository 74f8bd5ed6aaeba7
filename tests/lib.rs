//! Shared fakes and helpers for the integration tests: scripted model
//! services, a hanging sandbox for interruption tests, and session
//! wiring over the worker transport.

use async_trait::async_trait;
use rlm_common::{RlmConfig, RlmError, RlmEvent, SandboxConfig, SandboxTransport};
use rlm_core::{
    GenerateRequest, ModelResponse, ModelService, Session, Tool, ToolRegistry,
};
use rlm_sandbox::protocol::VariableMetadata;
use rlm_sandbox::{
    BridgeDispatch, CallHandle, SandboxFactory, SandboxInstance, TransportSandboxFactory,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Plays back a fixed list of model responses in order. A call past
/// the end of the script is a model error.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    tokens_per_call: Option<u64>,
}

impl ScriptedModel {
    pub fn new<I, S>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            calls: AtomicUsize::new(0),
            tokens_per_call: Some(10),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn generate_text(&self, _request: GenerateRequest) -> Result<ModelResponse, RlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(text) => Ok(ModelResponse {
                text,
                total_tokens: self.tokens_per_call,
            }),
            None => Err(RlmError::ModelCall {
                provider: "fake".to_string(),
                model: "scripted".to_string(),
                operation: "generateText".to_string(),
                retryable: false,
                message: "script exhausted".to_string(),
            }),
        }
    }
}

/// Model driven by a closure, for tests that route on depth or
/// transcript shape.
pub struct ClosureModel<F>(pub F);

#[async_trait]
impl<F> ModelService for ClosureModel<F>
where
    F: Fn(&GenerateRequest) -> Result<ModelResponse, RlmError> + Send + Sync,
{
    async fn generate_text(&self, request: GenerateRequest) -> Result<ModelResponse, RlmError> {
        (self.0)(&request)
    }
}

pub fn text_response(text: &str) -> Result<ModelResponse, RlmError> {
    Ok(ModelResponse {
        text: text.to_string(),
        total_tokens: Some(10),
    })
}

/// Sandbox whose `execute` never returns until shutdown. For
/// interruption tests.
pub struct HangingSandbox {
    cancel: CancellationToken,
}

#[async_trait]
impl SandboxInstance for HangingSandbox {
    async fn execute(&self, _code: &str) -> Result<String, RlmError> {
        self.cancel.cancelled().await;
        Err(RlmError::sandbox("Sandbox is dead"))
    }

    async fn set_variable(&self, _name: &str, _value: serde_json::Value) -> Result<(), RlmError> {
        Ok(())
    }

    async fn get_variable(&self, _name: &str) -> Result<serde_json::Value, RlmError> {
        Ok(serde_json::Value::Null)
    }

    async fn list_variables(&self) -> Result<Vec<VariableMetadata>, RlmError> {
        Ok(Vec::new())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
pub struct HangingFactory;

#[async_trait]
impl SandboxFactory for HangingFactory {
    async fn create(&self, _handle: CallHandle) -> Result<Box<dyn SandboxInstance>, RlmError> {
        Ok(Box::new(HangingSandbox {
            cancel: CancellationToken::new(),
        }))
    }
}

/// Tool that sleeps before answering, for bridge concurrency and
/// watchdog tests.
pub struct SlowTool {
    pub delay: Duration,
    pub result: serde_json::Value,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "sleeps, then answers"
    }
    fn parameter_names(&self) -> Vec<String> {
        Vec::new()
    }
    async fn call(&self, _args: Vec<serde_json::Value>) -> Result<serde_json::Value, RlmError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.result.clone())
    }
}

pub fn worker_sandbox_config() -> SandboxConfig {
    SandboxConfig {
        transport: SandboxTransport::Worker,
        ..SandboxConfig::default()
    }
}

/// Session over the worker transport with an echo-interpreter guest.
pub fn worker_session(config: RlmConfig, model: Arc<dyn ModelService>) -> Session {
    worker_session_with(config, worker_sandbox_config(), model, ToolRegistry::new())
}

pub fn worker_session_with(
    config: RlmConfig,
    sandbox_config: SandboxConfig,
    model: Arc<dyn ModelService>,
    tools: ToolRegistry,
) -> Session {
    Session::new(
        config,
        model,
        move |bridge: Arc<dyn BridgeDispatch>| {
            Arc::new(TransportSandboxFactory::new(sandbox_config, bridge))
        },
        tools,
        None,
    )
}

/// Drain everything already published to a subscription.
pub fn drain_events(events: &mut broadcast::Receiver<RlmEvent>) -> Vec<RlmEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Await a specific event, failing the test after `timeout`.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<RlmEvent>,
    timeout: Duration,
    mut matches: F,
) -> RlmEvent
where
    F: FnMut(&RlmEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
