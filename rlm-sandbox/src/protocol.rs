//! Wire protocol between host and guest.
//!
//! Every message is a discriminated frame, encoded as one JSON object
//! (one frame per line on the spawn transport). Every frame, inbound
//! or outbound, must pass `check_frame_size` before being accepted or
//! sent; an oversized or malformed inbound frame is fatal to the
//! sandbox instance, never dropped silently.

use rlm_common::{CallId, SandboxMode};
use serde::{Deserialize, Serialize};

/// Correlates one request frame with its response frame. Scoped to a
/// single sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameRequestId(pub uuid::Uuid);

impl FrameRequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for FrameRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FrameRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tool surface advertised to the guest at init time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub parameter_names: Vec<String>,
    pub description: String,
}

/// Metadata for one guest variable, as reported by `ListVarsRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableMetadata {
    pub name: String,
    pub kind: String,
    pub size_chars: usize,
}

/// Log severity relayed from the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Frames sent from host to guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostFrame {
    Init {
        call_id: CallId,
        depth: u32,
        mode: SandboxMode,
        max_frame_bytes: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<ToolDescriptor>,
    },
    ExecRequest {
        request_id: FrameRequestId,
        code: String,
    },
    SetVar {
        request_id: FrameRequestId,
        name: String,
        value: serde_json::Value,
    },
    GetVarRequest {
        request_id: FrameRequestId,
        name: String,
    },
    ListVarsRequest {
        request_id: FrameRequestId,
    },
    BridgeResult {
        request_id: FrameRequestId,
        result: serde_json::Value,
    },
    BridgeFailed {
        request_id: FrameRequestId,
        message: String,
    },
    Shutdown,
}

/// Frames sent from guest to host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GuestFrame {
    ExecResult {
        request_id: FrameRequestId,
        output: String,
    },
    ExecError {
        request_id: FrameRequestId,
        message: String,
    },
    SetVarAck {
        request_id: FrameRequestId,
    },
    SetVarError {
        request_id: FrameRequestId,
        message: String,
    },
    GetVarResult {
        request_id: FrameRequestId,
        value: serde_json::Value,
    },
    GetVarError {
        request_id: FrameRequestId,
        message: String,
    },
    ListVarsResult {
        request_id: FrameRequestId,
        variables: Vec<VariableMetadata>,
    },
    BridgeCall {
        request_id: FrameRequestId,
        method: String,
        args: Vec<serde_json::Value>,
    },
    GuestLog {
        level: GuestLogLevel,
        message: String,
    },
}

/// True iff the UTF-8 byte length of the frame's JSON encoding is at
/// most `max_bytes`. Unencodable frames fail the check. Monotonic
/// non-decreasing in `max_bytes`.
pub fn check_frame_size<T: Serialize>(frame: &T, max_bytes: usize) -> bool {
    match serde_json::to_vec(frame) {
        Ok(encoded) => encoded.len() <= max_bytes,
        Err(_) => false,
    }
}
