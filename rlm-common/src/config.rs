//! Configuration for the completion engine and sandbox transport.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which transport backs a call's sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxTransport {
    /// Separate OS process supervised over stdio frames.
    Spawn,
    /// In-process guest task over channels.
    Worker,
    /// Prefer worker; fall back to spawn if worker startup fails.
    Auto,
}

/// How much the guest is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Permissive,
    /// Forces the spawn transport with a scratch working directory and
    /// an empty environment, and rejects all bridge calls.
    Strict,
}

/// Engine-level configuration: budgets, queue sizes, concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RlmConfig {
    pub max_iterations: u32,
    pub max_depth: u32,
    pub max_llm_calls: u32,
    pub max_total_tokens: Option<u64>,
    /// Wall-clock ceiling for the whole completion.
    #[serde(with = "option_duration_ms")]
    pub max_time: Option<Duration>,
    pub command_queue_capacity: usize,
    pub event_buffer_capacity: usize,
    /// Bound on concurrent model calls across the whole call tree.
    pub llm_concurrency: usize,
    /// Bound on one bridge round trip, dispatch to resolution.
    #[serde(with = "duration_ms")]
    pub bridge_timeout: Duration,
    /// Execution output beyond this many characters is truncated with
    /// a marker before entering the transcript.
    pub max_execution_output_chars: usize,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_depth: 1,
            max_llm_calls: 20,
            max_total_tokens: None,
            max_time: None,
            command_queue_capacity: 8_192,
            event_buffer_capacity: 4_096,
            llm_concurrency: 4,
            bridge_timeout: Duration::from_secs(300),
            max_execution_output_chars: 8_000,
        }
    }
}

/// Transport-level configuration, applied per sandbox instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub transport: SandboxTransport,
    pub mode: SandboxMode,
    /// Every inbound and outbound frame is checked against this byte
    /// ceiling; violations are fatal to the instance.
    pub max_frame_bytes: usize,
    #[serde(with = "duration_ms")]
    pub execute_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub set_var_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub get_var_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub list_var_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    pub incoming_frame_queue_capacity: usize,
    /// Bound on concurrent bridge dispatch per instance, independent of
    /// the model-call semaphore.
    pub max_bridge_concurrency: usize,
    /// Guest program for the spawn transport. `None` means the bundled
    /// `rlm-guest` binary next to the host executable.
    pub guest_program: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            transport: SandboxTransport::Auto,
            mode: SandboxMode::Permissive,
            max_frame_bytes: 1024 * 1024,
            execute_timeout: Duration::from_secs(120),
            set_var_timeout: Duration::from_secs(10),
            get_var_timeout: Duration::from_secs(10),
            list_var_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(1_500),
            incoming_frame_queue_capacity: 256,
            max_bridge_concurrency: 8,
            guest_program: None,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
