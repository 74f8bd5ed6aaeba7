//! Error taxonomy for the completion engine.

use crate::budget::BudgetResource;
use crate::ids::CallId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a command queue offer was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueRejection {
    /// Shutdown in progress; no further work is accepted.
    Closed,
    /// Queue at capacity; the offer failed fast rather than blocking.
    Overloaded,
}

impl std::fmt::Display for QueueRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueRejection::Closed => f.write_str("closed"),
            QueueRejection::Overloaded => f.write_str("overloaded"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RlmError {
    #[error("budget exhausted: {resource} (call {call_id}, {remaining} remaining)")]
    BudgetExhausted {
        resource: BudgetResource,
        call_id: CallId,
        remaining: u32,
    },

    #[error("no final answer after {max_iterations} iterations (call {call_id})")]
    NoFinalAnswer { call_id: CallId, max_iterations: u32 },

    #[error("no state for call {call_id}")]
    CallStateMissing { call_id: CallId },

    #[error("sandbox error: {message}")]
    Sandbox { message: String },

    /// Guest code raised. Recoverable: the scheduler feeds the message
    /// back to the model instead of failing the call.
    #[error("execution error: {message}")]
    ExecutionFailed { message: String },

    #[error("scheduler queue {reason} while offering {command_tag} (call {call_id})")]
    SchedulerQueue {
        call_id: CallId,
        command_tag: &'static str,
        reason: QueueRejection,
    },

    #[error("{provider}/{model} {operation} failed (retryable: {retryable}): {message}")]
    ModelCall {
        provider: String,
        model: String,
        operation: String,
        retryable: bool,
        message: String,
    },

    #[error("output validation failed: {message}")]
    OutputValidation { message: String, raw: String },
}

impl RlmError {
    pub fn sandbox(message: impl Into<String>) -> Self {
        RlmError::Sandbox {
            message: message.into(),
        }
    }

    /// Budget and iteration exhaustion are the only errors eligible for
    /// the extract fallback.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            RlmError::BudgetExhausted { .. } | RlmError::NoFinalAnswer { .. }
        )
    }
}
