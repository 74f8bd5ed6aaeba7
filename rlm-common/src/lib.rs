//! Shared data types for the rlm workspace.
//!
//! Pure data plus the atomic budget cell: identifiers, the command and
//! event vocabularies the scheduler speaks, the error taxonomy, and
//! configuration. No orchestration behavior lives here.

mod budget;
mod command;
mod config;
mod error;
mod event;
mod ids;

pub use budget::{BudgetCell, BudgetResource, BudgetSnapshot, PartialReason, PartialResult};
pub use command::RlmCommand;
pub use config::{RlmConfig, SandboxConfig, SandboxMode, SandboxTransport};
pub use error::{QueueRejection, RlmError};
pub use event::{RlmEvent, WarningCode};
pub use ids::{BridgeRequestId, CallId};

/// One entry of a call's transcript: an assistant turn and, when the
/// turn contained a code block, the output its execution produced.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TranscriptEntry {
    pub assistant_response: String,
    pub execution_output: Option<String>,
}
