//! Bridge routing between sandbox callbacks and the scheduler.

use crate::runtime::RlmRuntime;
use async_trait::async_trait;
use rlm_common::{BridgeRequestId, CallId, RlmCommand, RlmError};
use rlm_sandbox::BridgeDispatch;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Routes every sandbox callback except `"budget"` into the scheduler
/// as a `HandleBridgeCall` command and awaits the result under the
/// bridge timeout. `"budget"` is answered directly from the shared
/// budget cell: iteration-aware guest code polls it frequently and a
/// scheduler round trip per poll would be pure overhead.
pub struct BridgeHandler {
    runtime: Arc<RlmRuntime>,
}

impl BridgeHandler {
    pub fn new(runtime: Arc<RlmRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl BridgeDispatch for BridgeHandler {
    async fn dispatch(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
        caller: CallId,
    ) -> Result<serde_json::Value, RlmError> {
        if method == "budget" {
            let snapshot = self.runtime.budget.snapshot();
            return serde_json::to_value(snapshot)
                .map_err(|e| RlmError::sandbox(format!("failed to encode budget: {e}")));
        }

        let bridge_request_id = BridgeRequestId::new();
        let (tx, rx) = oneshot::channel();
        self.runtime.register_bridge(bridge_request_id, tx);

        let command = RlmCommand::HandleBridgeCall {
            call_id: caller,
            bridge_request_id,
            method: method.to_string(),
            args,
        };
        if let Err(err) = self.runtime.enqueue(command) {
            self.runtime.deregister_bridge(bridge_request_id);
            return Err(err);
        }

        let outcome = match tokio::time::timeout(self.runtime.config.bridge_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RlmError::sandbox("scheduler stopped")),
            Err(_) => {
                debug!(%bridge_request_id, method, "bridge call timed out");
                Err(RlmError::sandbox(format!("bridge call {method} timed out")))
            }
        };
        // Entry may already be gone (resolved or torn down); removing
        // again is harmless and guarantees no leak on the timeout path.
        self.runtime.deregister_bridge(bridge_request_id);
        outcome
    }
}
