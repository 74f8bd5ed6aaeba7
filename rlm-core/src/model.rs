//! Model service seam. Provider implementations live outside this
//! crate; the scheduler only consumes this trait.

use crate::prompt::ChatMessage;
use async_trait::async_trait;
use rlm_common::RlmError;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    /// Recursion depth of the requesting call; providers may route
    /// sub-calls to cheaper models.
    pub depth: u32,
    pub is_sub_call: bool,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub total_tokens: Option<u64>,
}

#[async_trait]
pub trait ModelService: Send + Sync {
    async fn generate_text(&self, request: GenerateRequest) -> Result<ModelResponse, RlmError>;
}
