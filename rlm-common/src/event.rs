//! Externally observable event stream.

use crate::ids::CallId;
use serde::{Deserialize, Serialize};

/// Codes attached to `RlmEvent::SchedulerWarning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    StaleCommandDropped,
    QueueClosed,
    CallScopeCleanup,
    MixedSubmitAndCode,
    VariableSyncFailed,
}

/// Events published once per occurrence, never mutated afterwards.
/// Subscribers see publish order per subscription; events from
/// different calls interleave. Late subscribers miss prior events —
/// the bus keeps no replay buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RlmEvent {
    CallStarted {
        call_id: CallId,
        depth: u32,
        query: String,
    },
    IterationStarted {
        call_id: CallId,
        iteration: u32,
    },
    ModelResponse {
        call_id: CallId,
        text: String,
        total_tokens: Option<u64>,
    },
    CodeExecutionStarted {
        call_id: CallId,
        code: String,
    },
    CodeExecutionCompleted {
        call_id: CallId,
        output: String,
    },
    BridgeCallReceived {
        call_id: CallId,
        method: String,
    },
    CallFinalized {
        call_id: CallId,
        answer: String,
    },
    CallFailed {
        call_id: CallId,
        error: String,
    },
    SchedulerWarning {
        code: WarningCode,
        message: String,
        call_id: Option<CallId>,
        command_tag: Option<String>,
    },
}

impl RlmEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            RlmEvent::CallStarted { .. } => "CallStarted",
            RlmEvent::IterationStarted { .. } => "IterationStarted",
            RlmEvent::ModelResponse { .. } => "ModelResponse",
            RlmEvent::CodeExecutionStarted { .. } => "CodeExecutionStarted",
            RlmEvent::CodeExecutionCompleted { .. } => "CodeExecutionCompleted",
            RlmEvent::BridgeCallReceived { .. } => "BridgeCallReceived",
            RlmEvent::CallFinalized { .. } => "CallFinalized",
            RlmEvent::CallFailed { .. } => "CallFailed",
            RlmEvent::SchedulerWarning { .. } => "SchedulerWarning",
        }
    }
}
