//! Capability traits at the sandbox seam.

use crate::protocol::{ToolDescriptor, VariableMetadata};
use async_trait::async_trait;
use rlm_common::{CallId, RlmError};

/// One live sandbox, backed by exactly one guest process or worker.
/// Owned exclusively by its call; the owner must call `shutdown` on
/// scope exit, including under cancellation.
#[async_trait]
pub trait SandboxInstance: Send + Sync {
    async fn execute(&self, code: &str) -> Result<String, RlmError>;
    async fn set_variable(&self, name: &str, value: serde_json::Value) -> Result<(), RlmError>;
    async fn get_variable(&self, name: &str) -> Result<serde_json::Value, RlmError>;
    async fn list_variables(&self) -> Result<Vec<VariableMetadata>, RlmError>;

    /// Graceful-then-forced termination: shutdown frame, grace wait,
    /// kill, grace wait. Idempotent.
    async fn shutdown(&self);
}

impl std::fmt::Debug for dyn SandboxInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SandboxInstance")
    }
}

/// Identity and tool surface of the call a sandbox is created for.
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub call_id: CallId,
    pub depth: u32,
    pub tools: Vec<ToolDescriptor>,
}

/// Creates sandbox instances, one per call.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, handle: CallHandle) -> Result<Box<dyn SandboxInstance>, RlmError>;
}

/// Host-side callback target for guest bridge calls. Implemented by
/// the engine's bridge handler; injected into the transport at factory
/// construction so no mutable state is shared across the process
/// boundary.
#[async_trait]
pub trait BridgeDispatch: Send + Sync {
    async fn dispatch(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
        caller: CallId,
    ) -> Result<serde_json::Value, RlmError>;
}
