//! Shared budget accounting for a completion request.
//!
//! One `BudgetCell` is created per completion and shared by every call
//! in the recursion tree. All mutation goes through check-and-decrement
//! under a single lock, so a reservation never observes a stale value
//! and no counter can go negative: a reservation that would cross zero
//! is rejected outright.

use crate::error::RlmError;
use crate::ids::CallId;
use crate::TranscriptEntry;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The budget resources a call tree draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BudgetResource {
    Iterations,
    LlmCalls,
    Tokens,
    Time,
}

impl std::fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BudgetResource::Iterations => "iterations",
            BudgetResource::LlmCalls => "llmCalls",
            BudgetResource::Tokens => "tokens",
            BudgetResource::Time => "time",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the shared budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSnapshot {
    pub iterations_remaining: u32,
    pub llm_calls_remaining: u32,
    pub token_budget_remaining: Option<u64>,
    pub total_tokens_used: u64,
    pub elapsed_ms: u64,
    pub max_time_ms: Option<u64>,
}

#[derive(Debug)]
struct BudgetInner {
    iterations_remaining: u32,
    llm_calls_remaining: u32,
    token_budget_remaining: Option<u64>,
    total_tokens_used: u64,
}

/// Atomically-updated budget cell shared across the call tree.
#[derive(Debug)]
pub struct BudgetCell {
    inner: Mutex<BudgetInner>,
    started_at: Instant,
    max_time: Option<Duration>,
}

impl BudgetCell {
    pub fn new(
        max_iterations: u32,
        max_llm_calls: u32,
        max_total_tokens: Option<u64>,
        max_time: Option<Duration>,
    ) -> Self {
        Self {
            inner: Mutex::new(BudgetInner {
                iterations_remaining: max_iterations,
                llm_calls_remaining: max_llm_calls,
                token_budget_remaining: max_total_tokens,
                total_tokens_used: 0,
            }),
            started_at: Instant::now(),
            max_time,
        }
    }

    /// Reserve one unit of a resource. For the countable resources
    /// this is an atomic check-and-decrement that fails with
    /// `BudgetExhausted` when nothing remains and never drives a
    /// counter below zero; tokens and time are check-only.
    pub fn try_reserve(&self, resource: BudgetResource, call_id: CallId) -> Result<(), RlmError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let counter = match resource {
            BudgetResource::Iterations => &mut inner.iterations_remaining,
            BudgetResource::LlmCalls => &mut inner.llm_calls_remaining,
            BudgetResource::Tokens => {
                drop(inner);
                return self.check_tokens(call_id);
            }
            BudgetResource::Time => {
                drop(inner);
                return self.check_time(call_id);
            }
        };
        if *counter == 0 {
            return Err(RlmError::BudgetExhausted {
                resource,
                call_id,
                remaining: 0,
            });
        }
        *counter -= 1;
        Ok(())
    }

    /// Return one previously reserved unit, e.g. when a reservation was
    /// made but the guarded operation never ran.
    pub fn release(&self, resource: BudgetResource) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match resource {
            BudgetResource::Iterations => inner.iterations_remaining += 1,
            BudgetResource::LlmCalls => inner.llm_calls_remaining += 1,
            BudgetResource::Tokens | BudgetResource::Time => {}
        }
    }

    /// Record token usage reported by the model provider. Saturates the
    /// remaining token budget at zero; exhaustion is detected by the
    /// next `check_tokens`.
    pub fn record_tokens(&self, tokens: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total_tokens_used += tokens;
        if let Some(remaining) = inner.token_budget_remaining.as_mut() {
            *remaining = remaining.saturating_sub(tokens);
        }
    }

    /// Reject when the token budget is configured and spent.
    pub fn check_tokens(&self, call_id: CallId) -> Result<(), RlmError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.token_budget_remaining == Some(0) {
            return Err(RlmError::BudgetExhausted {
                resource: BudgetResource::Tokens,
                call_id,
                remaining: 0,
            });
        }
        Ok(())
    }

    /// Reject when wall-clock time for the completion has run out.
    pub fn check_time(&self, call_id: CallId) -> Result<(), RlmError> {
        if let Some(max) = self.max_time {
            if self.started_at.elapsed() >= max {
                return Err(RlmError::BudgetExhausted {
                    resource: BudgetResource::Time,
                    call_id,
                    remaining: 0,
                });
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        BudgetSnapshot {
            iterations_remaining: inner.iterations_remaining,
            llm_calls_remaining: inner.llm_calls_remaining,
            token_budget_remaining: inner.token_budget_remaining,
            total_tokens_used: inner.total_tokens_used,
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
            max_time_ms: self.max_time.map(|d| d.as_millis() as u64),
        }
    }
}

/// Why a call stopped iterating before a submit directive arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartialReason {
    Iterations,
    LlmCalls,
    Tokens,
    Time,
}

impl From<BudgetResource> for PartialReason {
    fn from(resource: BudgetResource) -> Self {
        match resource {
            BudgetResource::Iterations => PartialReason::Iterations,
            BudgetResource::LlmCalls => PartialReason::LlmCalls,
            BudgetResource::Tokens => PartialReason::Tokens,
            BudgetResource::Time => PartialReason::Time,
        }
    }
}

/// Best-effort snapshot retained when a call runs out of budget, so
/// the extract fallback can still see what the model produced.
#[derive(Debug, Clone)]
pub struct PartialResult {
    pub reason: PartialReason,
    pub transcript: Vec<TranscriptEntry>,
}
