//! Guest-side frame loop.
//!
//! The same loop backs both transports: the worker transport runs it as
//! an in-process task over channels, and the `rlm-guest` binary runs it
//! over stdio lines. The loop owns the guest's pending bridge requests
//! and delegates code execution to a pluggable interpreter.

use crate::protocol::{FrameRequestId, GuestFrame, HostFrame, ToolDescriptor, VariableMetadata};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type BridgeWaiter = oneshot::Sender<Result<serde_json::Value, String>>;

/// Host facilities available to an interpreter while it runs code:
/// issuing bridge calls and emitting log frames.
#[derive(Clone)]
pub struct GuestApi {
    outgoing: mpsc::Sender<GuestFrame>,
    bridge_waiters: Arc<Mutex<HashMap<FrameRequestId, BridgeWaiter>>>,
    pub tools: Arc<Vec<ToolDescriptor>>,
}

impl GuestApi {
    /// Issue a bridge call and await the host's verdict. Errors are the
    /// host's failure message, to be surfaced as execution output.
    pub async fn bridge_call(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, String> {
        let request_id = FrameRequestId::new();
        let (tx, rx) = oneshot::channel();
        self.bridge_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, tx);

        let frame = GuestFrame::BridgeCall {
            request_id,
            method: method.to_string(),
            args,
        };
        if self.outgoing.send(frame).await.is_err() {
            self.bridge_waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
            return Err("host connection closed".to_string());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err("host connection closed".to_string()),
        }
    }

    pub async fn log(&self, level: crate::protocol::GuestLogLevel, message: impl Into<String>) {
        let _ = self
            .outgoing
            .send(GuestFrame::GuestLog {
                level,
                message: message.into(),
            })
            .await;
    }

    fn resolve_bridge(&self, request_id: FrameRequestId, result: Result<serde_json::Value, String>) {
        let waiter = self
            .bridge_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(request_id = %request_id, "bridge reply for unknown request, ignoring"),
        }
    }
}

/// Executes code and owns the guest's variable store. Implementations
/// must tolerate concurrent variable access while `execute` runs.
#[async_trait]
pub trait GuestInterpreter: Send + Sync {
    /// Run one snippet to completion. `Err` is a recoverable execution
    /// error, reported to the host as an `ExecError` frame.
    async fn execute(&self, code: &str, api: &GuestApi) -> Result<String, String>;

    async fn set_variable(&self, name: &str, value: serde_json::Value) -> Result<(), String>;
    async fn get_variable(&self, name: &str) -> Result<serde_json::Value, String>;
    async fn list_variables(&self) -> Vec<VariableMetadata>;
}

/// Line-oriented interpreter with a JSON variable store. Stands in for
/// a real language runtime behind the same frame protocol; the worker
/// transport uses it unless a caller installs its own interpreter.
///
/// Each line of the snippet is one statement:
///   `print <text>`          append text to the output
///   `get <name>`            append the variable's JSON to the output
///   `set <name> <json>`     store a variable
///   `call <method> <json-args>`  bridge call; append the result
///   `error <text>`          fail the snippet with a recoverable error
///   `sleep <ms>`            pause, for exercising execute deadlines
/// Unrecognized lines echo back verbatim.
pub struct EchoInterpreter {
    variables: Mutex<HashMap<String, serde_json::Value>>,
}

impl EchoInterpreter {
    pub fn new() -> Self {
        Self {
            variables: Mutex::new(HashMap::new()),
        }
    }

    fn kind_of(value: &serde_json::Value) -> &'static str {
        match value {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "boolean",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::Object(_) => "object",
        }
    }
}

impl Default for EchoInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GuestInterpreter for EchoInterpreter {
    async fn execute(&self, code: &str, api: &GuestApi) -> Result<String, String> {
        let mut output = Vec::new();
        for line in code.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(text) = line.strip_prefix("print ") {
                output.push(text.to_string());
            } else if let Some(name) = line.strip_prefix("get ") {
                let value = self.get_variable(name.trim()).await?;
                output.push(value.to_string());
            } else if let Some(rest) = line.strip_prefix("set ") {
                let (name, json) = rest
                    .split_once(' ')
                    .ok_or_else(|| format!("set needs a name and a value: {line}"))?;
                let value: serde_json::Value =
                    serde_json::from_str(json.trim()).map_err(|e| format!("bad json: {e}"))?;
                self.set_variable(name.trim(), value).await?;
            } else if let Some(rest) = line.strip_prefix("call ") {
                let (method, json) = rest.split_once(' ').unwrap_or((rest, "[]"));
                let args: Vec<serde_json::Value> =
                    serde_json::from_str(json.trim()).map_err(|e| format!("bad args: {e}"))?;
                let result = api.bridge_call(method.trim(), args).await?;
                output.push(result.to_string());
            } else if let Some(ms) = line.strip_prefix("sleep ") {
                let ms: u64 = ms.trim().parse().map_err(|e| format!("bad duration: {e}"))?;
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            } else if let Some(text) = line.strip_prefix("error ") {
                return Err(text.to_string());
            } else {
                output.push(line.to_string());
            }
        }
        Ok(output.join("\n"))
    }

    async fn set_variable(&self, name: &str, value: serde_json::Value) -> Result<(), String> {
        self.variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value);
        Ok(())
    }

    async fn get_variable(&self, name: &str) -> Result<serde_json::Value, String> {
        self.variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| format!("no variable named {name}"))
    }

    async fn list_variables(&self) -> Vec<VariableMetadata> {
        let mut variables: Vec<VariableMetadata> = self
            .variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, value)| VariableMetadata {
                name: name.clone(),
                kind: Self::kind_of(value).to_string(),
                size_chars: value.to_string().chars().count(),
            })
            .collect();
        variables.sort_by(|a, b| a.name.cmp(&b.name));
        variables
    }
}

/// Drive the guest loop until a `Shutdown` frame, channel closure, or
/// cancellation. Execution requests run in their own tasks so bridge
/// replies keep flowing while code awaits the host.
pub async fn run_guest(
    interpreter: Arc<dyn GuestInterpreter>,
    mut incoming: mpsc::Receiver<HostFrame>,
    outgoing: mpsc::Sender<GuestFrame>,
    cancel: CancellationToken,
) {
    let mut api = GuestApi {
        outgoing: outgoing.clone(),
        bridge_waiters: Arc::new(Mutex::new(HashMap::new())),
        tools: Arc::new(Vec::new()),
    };
    let mut executions: JoinSet<()> = JoinSet::new();

    loop {
        let frame = tokio::select! {
            frame = incoming.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        match frame {
            HostFrame::Init { tools, .. } => {
                api.tools = Arc::new(tools);
            }
            HostFrame::ExecRequest { request_id, code } => {
                let interpreter = Arc::clone(&interpreter);
                let api = api.clone();
                let outgoing = outgoing.clone();
                executions.spawn(async move {
                    let frame = match interpreter.execute(&code, &api).await {
                        Ok(output) => GuestFrame::ExecResult { request_id, output },
                        Err(message) => GuestFrame::ExecError {
                            request_id,
                            message,
                        },
                    };
                    let _ = outgoing.send(frame).await;
                });
                while executions.try_join_next().is_some() {}
            }
            HostFrame::SetVar {
                request_id,
                name,
                value,
            } => {
                let frame = match interpreter.set_variable(&name, value).await {
                    Ok(()) => GuestFrame::SetVarAck { request_id },
                    Err(message) => GuestFrame::SetVarError {
                        request_id,
                        message,
                    },
                };
                let _ = outgoing.send(frame).await;
            }
            HostFrame::GetVarRequest { request_id, name } => {
                let frame = match interpreter.get_variable(&name).await {
                    Ok(value) => GuestFrame::GetVarResult { request_id, value },
                    Err(message) => GuestFrame::GetVarError {
                        request_id,
                        message,
                    },
                };
                let _ = outgoing.send(frame).await;
            }
            HostFrame::ListVarsRequest { request_id } => {
                let variables = interpreter.list_variables().await;
                let _ = outgoing
                    .send(GuestFrame::ListVarsResult {
                        request_id,
                        variables,
                    })
                    .await;
            }
            HostFrame::BridgeResult { request_id, result } => {
                api.resolve_bridge(request_id, Ok(result));
            }
            HostFrame::BridgeFailed {
                request_id,
                message,
            } => {
                api.resolve_bridge(request_id, Err(message));
            }
            HostFrame::Shutdown => break,
        }
    }

    executions.abort_all();
}
