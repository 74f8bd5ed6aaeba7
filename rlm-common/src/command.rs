//! Scheduler command vocabulary.

use crate::error::RlmError;
use crate::ids::{BridgeRequestId, CallId};
use tokio::sync::oneshot;

/// The scheduler's sole unit of work. Ordering is significant per
/// `call_id` (a call's next command is only enqueued once the previous
/// one finished processing); commands for different calls interleave
/// freely.
#[derive(Debug)]
pub enum RlmCommand {
    StartCall {
        call_id: CallId,
        depth: u32,
        query: String,
        context: String,
        /// Resolved with the call's final answer or error. `None` for
        /// fire-and-forget injection in tests.
        reply: Option<oneshot::Sender<Result<String, RlmError>>>,
    },
    GenerateStep {
        call_id: CallId,
    },
    ExecuteCode {
        call_id: CallId,
        code: String,
    },
    HandleBridgeCall {
        call_id: CallId,
        bridge_request_id: BridgeRequestId,
        method: String,
        args: Vec<serde_json::Value>,
    },
    Finalize {
        call_id: CallId,
        payload: String,
    },
    FailCall {
        call_id: CallId,
        error: RlmError,
    },
}

impl RlmCommand {
    pub fn call_id(&self) -> CallId {
        match self {
            RlmCommand::StartCall { call_id, .. }
            | RlmCommand::GenerateStep { call_id }
            | RlmCommand::ExecuteCode { call_id, .. }
            | RlmCommand::HandleBridgeCall { call_id, .. }
            | RlmCommand::Finalize { call_id, .. }
            | RlmCommand::FailCall { call_id, .. } => *call_id,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            RlmCommand::StartCall { .. } => "StartCall",
            RlmCommand::GenerateStep { .. } => "GenerateStep",
            RlmCommand::ExecuteCode { .. } => "ExecuteCode",
            RlmCommand::HandleBridgeCall { .. } => "HandleBridgeCall",
            RlmCommand::Finalize { .. } => "Finalize",
            RlmCommand::FailCall { .. } => "FailCall",
        }
    }
}
