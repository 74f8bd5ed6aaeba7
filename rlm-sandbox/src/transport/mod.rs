//! Machinery shared by the spawn and worker transports.
//!
//! Both transports supervise a guest through the same pieces: a health
//! state machine (`alive → shuttingDown → dead`), a pending-request
//! map of single-resolution futures, an extendable execute deadline,
//! and a frame dispatcher that routes guest frames to their pending
//! requests or forks bridge calls into independent tasks.

pub mod spawn;
pub mod worker;

use crate::instance::BridgeDispatch;
use crate::protocol::{
    check_frame_size, FrameRequestId, GuestFrame, GuestLogLevel, HostFrame, VariableMetadata,
};
use async_trait::async_trait;
use rlm_common::{CallId, RlmError, SandboxConfig, SandboxMode};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Health {
    Alive,
    ShuttingDown,
    Dead,
}

/// Typed response payload delivered to a pending request.
#[derive(Debug)]
pub(crate) enum Reply {
    Exec(String),
    Unit,
    Value(serde_json::Value),
    Vars(Vec<VariableMetadata>),
}

type PendingSender = oneshot::Sender<Result<Reply, RlmError>>;

/// Transport-neutral guest handle: how to push a frame at it, how to
/// kill it, and how to wait for it to be gone.
#[async_trait]
pub(crate) trait GuestLink: Send + Sync {
    async fn send_frame(&self, frame: &HostFrame) -> Result<(), RlmError>;
    async fn kill(&self);
    /// Returns true when the guest exited within `grace`.
    async fn wait_exit(&self, grace: Duration) -> bool;
}

/// State shared between the instance surface, the frame dispatcher,
/// and the watchdog of one sandbox.
pub(crate) struct Shared {
    pub call_id: CallId,
    pub config: SandboxConfig,
    health: Mutex<Health>,
    pending: Mutex<HashMap<FrameRequestId, PendingSender>>,
    execute_deadline: Mutex<Option<Instant>>,
}

impl Shared {
    pub fn new(call_id: CallId, config: SandboxConfig) -> Self {
        Self {
            call_id,
            config,
            health: Mutex::new(Health::Alive),
            pending: Mutex::new(HashMap::new()),
            execute_deadline: Mutex::new(None),
        }
    }

    pub fn is_alive(&self) -> bool {
        *self.health.lock().unwrap_or_else(|e| e.into_inner()) == Health::Alive
    }

    /// `alive → shuttingDown`. Returns false when the instance already
    /// left the alive state, in which case shutdown has nothing to do.
    pub fn begin_shutdown(&self) -> bool {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if *health == Health::Alive {
            *health = Health::ShuttingDown;
            true
        } else {
            false
        }
    }

    /// Transition to `dead` and fail every pending request. Idempotent.
    pub fn mark_dead(&self, reason: &str) {
        {
            let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
            if *health == Health::Dead {
                return;
            }
            *health = Health::Dead;
        }
        info!(call_id = %self.call_id, reason, "sandbox marked dead");
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(RlmError::sandbox(reason)));
        }
    }

    pub fn register(&self, request_id: FrameRequestId) -> oneshot::Receiver<Result<Reply, RlmError>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, tx);
        rx
    }

    pub fn remove(&self, request_id: FrameRequestId) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
    }

    /// Resolve a pending request. A response for an unknown id (already
    /// resolved or timed out) is logged and ignored, never an error.
    pub fn resolve(&self, request_id: FrameRequestId, result: Result<Reply, RlmError>, tag: &str) {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
        match sender {
            Some(tx) => {
                // A dropped receiver means the caller gave up; that is
                // equivalent to a stale response.
                let _ = tx.send(result);
            }
            None => {
                debug!(
                    call_id = %self.call_id,
                    request_id = %request_id,
                    tag,
                    "stale response for unknown request, ignoring"
                );
            }
        }
    }

    pub fn arm_execute_deadline(&self) {
        let deadline = Instant::now() + self.config.execute_timeout;
        *self
            .execute_deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(deadline);
    }

    /// Push the deadline out by a fresh execute-timeout window. Called
    /// when the guest issues a bridge call and again when the bridge
    /// response is delivered back, so long host round trips do not trip
    /// the watchdog while a silent guest still does.
    pub fn extend_execute_deadline(&self) {
        let mut slot = self
            .execute_deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            *slot = Some(Instant::now() + self.config.execute_timeout);
        }
    }

    pub fn execute_deadline(&self) -> Option<Instant> {
        *self
            .execute_deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn clear_execute_deadline(&self) {
        *self
            .execute_deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Send one request frame and await its typed reply under a fixed
/// per-operation timeout. A timeout is fatal to the instance.
pub(crate) async fn send_request(
    shared: &Shared,
    link: &dyn GuestLink,
    frame: HostFrame,
    request_id: FrameRequestId,
    timeout: Duration,
) -> Result<Reply, RlmError> {
    if !shared.is_alive() {
        return Err(RlmError::sandbox("Sandbox is dead"));
    }
    if !check_frame_size(&frame, shared.config.max_frame_bytes) {
        return Err(RlmError::sandbox("Request exceeds max frame size"));
    }

    let rx = shared.register(request_id);
    let result = async {
        link.send_frame(&frame).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RlmError::sandbox("Sandbox closed while awaiting response")),
            Err(_) => {
                shared.mark_dead("Sandbox killed after timeout");
                link.kill().await;
                Err(RlmError::sandbox(format!("Request {request_id} timed out")))
            }
        }
    }
    .await;
    shared.remove(request_id);
    result
}

/// Send an `ExecRequest` and await its result under the extendable
/// execute deadline. Deadline expiry fails the request and
/// force-terminates the guest.
pub(crate) async fn execute_request(
    shared: &Shared,
    link: &dyn GuestLink,
    frame: HostFrame,
    request_id: FrameRequestId,
) -> Result<String, RlmError> {
    if !shared.is_alive() {
        return Err(RlmError::sandbox("Sandbox is dead"));
    }
    if !check_frame_size(&frame, shared.config.max_frame_bytes) {
        return Err(RlmError::sandbox("Request exceeds max frame size"));
    }

    let mut rx = shared.register(request_id);
    if let Err(err) = link.send_frame(&frame).await {
        shared.remove(request_id);
        return Err(err);
    }
    shared.arm_execute_deadline();

    let result = loop {
        let deadline = shared
            .execute_deadline()
            .unwrap_or_else(|| Instant::now() + shared.config.execute_timeout);
        tokio::select! {
            reply = &mut rx => {
                break match reply {
                    Ok(inner) => inner,
                    Err(_) => Err(RlmError::sandbox("Sandbox closed while executing")),
                };
            }
            _ = tokio::time::sleep_until(deadline) => {
                // A bridge round trip may have pushed the deadline out
                // while we slept; only expire if it is still in the past.
                match shared.execute_deadline() {
                    Some(current) if current > Instant::now() => continue,
                    _ => {
                        shared.mark_dead("Sandbox killed after execute deadline");
                        link.kill().await;
                        break Err(RlmError::sandbox(format!(
                            "Request {request_id} timed out"
                        )));
                    }
                }
            }
        }
    };

    shared.clear_execute_deadline();
    shared.remove(request_id);
    match result {
        Ok(Reply::Exec(output)) => Ok(output),
        Ok(other) => Err(RlmError::sandbox(format!(
            "Unexpected reply to execute: {other:?}"
        ))),
        Err(err) => Err(err),
    }
}

/// Graceful-then-forced termination: shutdown frame, grace wait, kill,
/// grace wait. Safe to call from any health state.
pub(crate) async fn shutdown_sequence(shared: &Shared, link: &dyn GuestLink) {
    if !shared.begin_shutdown() {
        return;
    }
    let _ = link.send_frame(&HostFrame::Shutdown).await;
    if !link.wait_exit(shared.config.shutdown_grace).await {
        link.kill().await;
        link.wait_exit(shared.config.shutdown_grace).await;
    }
    shared.mark_dead("Sandbox shut down");
}

/// Consume guest frames until the channel closes or a fatal frame
/// arrives. Bridge frames fork into independent tasks bounded by the
/// bridge semaphore so one slow tool call never blocks dispatch for
/// unrelated pending requests.
pub(crate) async fn run_dispatcher(
    shared: std::sync::Arc<Shared>,
    link: std::sync::Arc<dyn GuestLink>,
    mut frames: mpsc::Receiver<GuestFrame>,
    bridge: std::sync::Arc<dyn BridgeDispatch>,
) {
    let semaphore = std::sync::Arc::new(Semaphore::new(shared.config.max_bridge_concurrency.max(1)));
    let mut bridge_tasks: JoinSet<()> = JoinSet::new();

    while let Some(frame) = frames.recv().await {
        if !check_frame_size(&frame, shared.config.max_frame_bytes) {
            error!(call_id = %shared.call_id, "fatal: oversized frame from guest");
            shared.mark_dead("Guest sent oversized frame");
            link.kill().await;
            break;
        }

        match frame {
            GuestFrame::ExecResult { request_id, output } => {
                shared.resolve(request_id, Ok(Reply::Exec(output)), "ExecResult");
            }
            GuestFrame::ExecError { request_id, message } => {
                shared.resolve(
                    request_id,
                    Err(RlmError::ExecutionFailed { message }),
                    "ExecError",
                );
            }
            GuestFrame::SetVarAck { request_id } => {
                shared.resolve(request_id, Ok(Reply::Unit), "SetVarAck");
            }
            GuestFrame::SetVarError { request_id, message } => {
                shared.resolve(request_id, Err(RlmError::sandbox(message)), "SetVarError");
            }
            GuestFrame::GetVarResult { request_id, value } => {
                shared.resolve(request_id, Ok(Reply::Value(value)), "GetVarResult");
            }
            GuestFrame::GetVarError { request_id, message } => {
                shared.resolve(request_id, Err(RlmError::sandbox(message)), "GetVarError");
            }
            GuestFrame::ListVarsResult {
                request_id,
                variables,
            } => {
                shared.resolve(request_id, Ok(Reply::Vars(variables)), "ListVarsResult");
            }
            GuestFrame::BridgeCall {
                request_id,
                method,
                args,
            } => {
                if shared.config.mode == SandboxMode::Strict {
                    let _ = link
                        .send_frame(&HostFrame::BridgeFailed {
                            request_id,
                            message: "Bridge disabled in strict sandbox mode".into(),
                        })
                        .await;
                    continue;
                }

                // The guest is alive and waiting on host work.
                shared.extend_execute_deadline();

                let shared = std::sync::Arc::clone(&shared);
                let link = std::sync::Arc::clone(&link);
                let bridge = std::sync::Arc::clone(&bridge);
                let semaphore = std::sync::Arc::clone(&semaphore);
                bridge_tasks.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let response = match bridge.dispatch(&method, args, shared.call_id).await {
                        Ok(result) => {
                            let frame = HostFrame::BridgeResult { request_id, result };
                            if check_frame_size(&frame, shared.config.max_frame_bytes) {
                                frame
                            } else {
                                HostFrame::BridgeFailed {
                                    request_id,
                                    message: "Result exceeds max frame size".into(),
                                }
                            }
                        }
                        Err(err) => HostFrame::BridgeFailed {
                            request_id,
                            message: err.to_string(),
                        },
                    };
                    if let Err(err) = link.send_frame(&response).await {
                        warn!(call_id = %shared.call_id, %err, "failed to deliver bridge response");
                    }
                    // The guest is about to resume running code.
                    shared.extend_execute_deadline();
                });
                // Reap finished bridge tasks without blocking dispatch.
                while bridge_tasks.try_join_next().is_some() {}
            }
            GuestFrame::GuestLog { level, message } => match level {
                GuestLogLevel::Debug => debug!(call_id = %shared.call_id, "guest: {message}"),
                GuestLogLevel::Info => info!(call_id = %shared.call_id, "guest: {message}"),
                GuestLogLevel::Warn => warn!(call_id = %shared.call_id, "guest: {message}"),
                GuestLogLevel::Error => error!(call_id = %shared.call_id, "guest: {message}"),
            },
        }
    }

    bridge_tasks.abort_all();
}
