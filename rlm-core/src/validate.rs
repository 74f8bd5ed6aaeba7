//! Optional validation of finalized payloads.

use rlm_common::RlmError;

/// Checked against every `Finalize` payload when installed. A failure
/// converts the finalize into a call failure with the raw payload
/// preserved for the caller.
pub trait OutputValidator: Send + Sync {
    fn validate(&self, payload: &str) -> Result<(), RlmError>;
}
