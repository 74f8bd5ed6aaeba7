//! Per-call mutable state. Only the scheduler touches this.

use rlm_common::{RlmError, TranscriptEntry};
use rlm_sandbox::SandboxInstance;
use std::sync::Arc;
use tokio::sync::oneshot;

pub(crate) struct CallState {
    pub depth: u32,
    pub query: String,
    pub context: String,
    /// 1-based count of generate steps taken by this call.
    pub iteration: u32,
    pub transcript: Vec<TranscriptEntry>,
    pub sandbox: Arc<dyn SandboxInstance>,
    /// Resolved exactly once with the call's outcome: the top-level
    /// answer for the root, the bridge response for a sub-call.
    pub reply: Option<oneshot::Sender<Result<String, RlmError>>>,
    /// The extract fallback runs at most once per call.
    pub extract_attempted: bool,
}

impl CallState {
    pub fn new(
        depth: u32,
        query: String,
        context: String,
        sandbox: Arc<dyn SandboxInstance>,
        reply: Option<oneshot::Sender<Result<String, RlmError>>>,
    ) -> Self {
        Self {
            depth,
            query,
            context,
            iteration: 0,
            transcript: Vec::new(),
            sandbox,
            reply,
            extract_attempted: false,
        }
    }
}
