//! Per-completion shared state: command queue, event bus, budget,
//! concurrency limiters, call-state and bridge-pending tables.

use crate::call::CallState;
use rlm_common::{
    BridgeRequestId, BudgetCell, CallId, PartialResult, QueueRejection, RlmCommand, RlmConfig,
    RlmError, RlmEvent, WarningCode,
};
use rlm_sandbox::SandboxInstance;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BridgeWaiter = oneshot::Sender<Result<serde_json::Value, RlmError>>;

pub struct RlmRuntime {
    pub config: RlmConfig,
    pub budget: Arc<BudgetCell>,
    pub llm_semaphore: Arc<Semaphore>,
    commands: mpsc::Sender<RlmCommand>,
    events: broadcast::Sender<RlmEvent>,
    closed: AtomicBool,
    torn_down: AtomicBool,
    cancel: CancellationToken,
    pub(crate) call_states: Mutex<HashMap<CallId, CallState>>,
    pub(crate) bridge_pending: Mutex<HashMap<BridgeRequestId, BridgeWaiter>>,
    pub(crate) partial_results: Mutex<HashMap<CallId, PartialResult>>,
}

impl RlmRuntime {
    pub fn new(config: RlmConfig) -> (Arc<Self>, mpsc::Receiver<RlmCommand>) {
        let (commands, commands_rx) = mpsc::channel(config.command_queue_capacity.max(1));
        let (events, _) = broadcast::channel(config.event_buffer_capacity.max(1));
        let budget = Arc::new(BudgetCell::new(
            config.max_iterations,
            config.max_llm_calls,
            config.max_total_tokens,
            config.max_time,
        ));
        let llm_semaphore = Arc::new(Semaphore::new(config.llm_concurrency.max(1)));
        let runtime = Arc::new(Self {
            config,
            budget,
            llm_semaphore,
            commands,
            events,
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            call_states: Mutex::new(HashMap::new()),
            bridge_pending: Mutex::new(HashMap::new()),
            partial_results: Mutex::new(HashMap::new()),
        });
        (runtime, commands_rx)
    }

    /// Offer a command to the scheduler. Fails fast, never blocks:
    /// `Closed` once teardown began, `Overloaded` when the queue is at
    /// capacity.
    pub fn enqueue(&self, command: RlmCommand) -> Result<(), RlmError> {
        let call_id = command.call_id();
        let command_tag = command.tag();
        if self.closed.load(Ordering::Acquire) {
            return Err(RlmError::SchedulerQueue {
                call_id,
                command_tag,
                reason: QueueRejection::Closed,
            });
        }
        self.commands.try_send(command).map_err(|err| {
            let reason = match err {
                TrySendError::Full(_) => QueueRejection::Overloaded,
                TrySendError::Closed(_) => QueueRejection::Closed,
            };
            RlmError::SchedulerQueue {
                call_id,
                command_tag,
                reason,
            }
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RlmEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Lagging or absent subscribers never block the
    /// scheduler.
    pub fn emit(&self, event: RlmEvent) {
        debug!(event = event.tag(), "emit");
        let _ = self.events.send(event);
    }

    pub fn warn(
        &self,
        code: WarningCode,
        message: impl Into<String>,
        call_id: Option<CallId>,
        command_tag: Option<&str>,
    ) {
        let message = message.into();
        warn!(?code, %message, "scheduler warning");
        self.emit(RlmEvent::SchedulerWarning {
            code,
            message,
            call_id,
            command_tag: command_tag.map(str::to_string),
        });
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn register_bridge(&self, request_id: BridgeRequestId, waiter: BridgeWaiter) {
        self.bridge_pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, waiter);
    }

    pub(crate) fn deregister_bridge(&self, request_id: BridgeRequestId) {
        self.bridge_pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
    }

    /// Resolve a pending bridge future. Late resolution after timeout
    /// finds no entry and is a no-op.
    pub(crate) fn resolve_bridge(
        &self,
        request_id: BridgeRequestId,
        result: Result<serde_json::Value, RlmError>,
    ) {
        let waiter = self
            .bridge_pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(request_id = %request_id, "bridge result for unknown request, ignoring"),
        }
    }

    /// Refuse further queue offers and cancel the scheduler loop. Does
    /// not drain the tables; callers join the scheduler first so no
    /// in-flight handler can repopulate them, then call `teardown`.
    pub fn begin_close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Stop the completion: refuse further queue offers, cancel the
    /// scheduler, fail every pending bridge future, tear down every
    /// live sandbox, and leave all tables empty.
    pub async fn teardown(&self) {
        self.begin_close();
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("runtime teardown");

        let waiters: Vec<BridgeWaiter> = {
            let mut pending = self
                .bridge_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(RlmError::sandbox("scheduler stopped")));
        }

        let states: Vec<(CallId, CallState)> = {
            let mut call_states = self.call_states.lock().unwrap_or_else(|e| e.into_inner());
            call_states.drain().collect()
        };
        for (call_id, mut state) in states {
            self.warn(
                WarningCode::CallScopeCleanup,
                "closing call scope during teardown",
                Some(call_id),
                None,
            );
            if let Some(reply) = state.reply.take() {
                let _ = reply.send(Err(RlmError::sandbox("scheduler stopped")));
            }
            state.sandbox.shutdown().await;
        }

        self.partial_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Remove a call's state, closing its scope. The caller owns the
    /// returned state and is responsible for sandbox shutdown.
    pub(crate) fn take_call(&self, call_id: CallId) -> Option<CallState> {
        self.call_states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&call_id)
    }

    pub(crate) fn insert_call(&self, call_id: CallId, state: CallState) {
        self.call_states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(call_id, state);
    }

    /// Shared handle to a live call's sandbox, if the call is open.
    pub(crate) fn sandbox_of(&self, call_id: CallId) -> Option<Arc<dyn SandboxInstance>> {
        self.call_states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&call_id)
            .map(|state| Arc::clone(&state.sandbox))
    }

    pub fn live_calls(&self) -> usize {
        self.call_states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn pending_bridge_calls(&self) -> usize {
        self.bridge_pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn partial_result(&self, call_id: CallId) -> Option<PartialResult> {
        self.partial_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&call_id)
            .cloned()
    }

    /// Claim the partial recorded at exhaustion; the extract fallback
    /// consumes it so a closed call leaves no entry behind.
    pub(crate) fn take_partial(&self, call_id: CallId) -> Option<PartialResult> {
        self.partial_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&call_id)
    }

    pub(crate) fn record_partial(&self, call_id: CallId, partial: PartialResult) {
        self.partial_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(call_id, partial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_rejects_overloaded_without_blocking() {
        let config = RlmConfig {
            command_queue_capacity: 2,
            ..RlmConfig::default()
        };
        let (runtime, _rx) = RlmRuntime::new(config);
        let call_id = CallId::new();

        runtime
            .enqueue(RlmCommand::GenerateStep { call_id })
            .unwrap();
        runtime
            .enqueue(RlmCommand::GenerateStep { call_id })
            .unwrap();
        let err = runtime
            .enqueue(RlmCommand::GenerateStep { call_id })
            .unwrap_err();
        assert!(matches!(
            err,
            RlmError::SchedulerQueue {
                reason: QueueRejection::Overloaded,
                command_tag: "GenerateStep",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn teardown_closes_the_queue_and_fails_pending_bridges() {
        let (runtime, _rx) = RlmRuntime::new(RlmConfig::default());
        let request_id = BridgeRequestId::new();
        let (tx, rx) = oneshot::channel();
        runtime.register_bridge(request_id, tx);

        runtime.teardown().await;

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("scheduler stopped"));
        assert_eq!(runtime.pending_bridge_calls(), 0);
        assert_eq!(runtime.live_calls(), 0);

        let offer = runtime
            .enqueue(RlmCommand::GenerateStep {
                call_id: CallId::new(),
            })
            .unwrap_err();
        assert!(matches!(
            offer,
            RlmError::SchedulerQueue {
                reason: QueueRejection::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn events_have_no_replay() {
        let (runtime, _rx) = RlmRuntime::new(RlmConfig::default());
        runtime.emit(RlmEvent::IterationStarted {
            call_id: CallId::new(),
            iteration: 1,
        });
        // Subscribing after the fact sees nothing.
        let mut events = runtime.subscribe();
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn late_bridge_resolution_is_a_noop() {
        let (runtime, _rx) = RlmRuntime::new(RlmConfig::default());
        let request_id = BridgeRequestId::new();
        // Never registered: must not panic or error.
        runtime.resolve_bridge(request_id, Ok(serde_json::json!(1)));
    }
}
