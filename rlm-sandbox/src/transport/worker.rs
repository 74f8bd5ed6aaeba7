//! Worker transport: the guest loop runs as an in-process task, with
//! channels standing in for the process pipes. Same frames, same health
//! machine, no process boundary.

use crate::guest::{run_guest, EchoInterpreter, GuestInterpreter};
use crate::instance::{BridgeDispatch, CallHandle, SandboxInstance};
use crate::protocol::{check_frame_size, FrameRequestId, HostFrame, VariableMetadata};
use crate::transport::{
    execute_request, run_dispatcher, send_request, shutdown_sequence, GuestLink, Reply, Shared,
};
use async_trait::async_trait;
use rlm_common::{RlmError, SandboxConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

struct WorkerLink {
    to_guest: mpsc::Sender<HostFrame>,
    cancel: CancellationToken,
    exited: watch::Receiver<bool>,
}

#[async_trait]
impl GuestLink for WorkerLink {
    async fn send_frame(&self, frame: &HostFrame) -> Result<(), RlmError> {
        self.to_guest
            .send(frame.clone())
            .await
            .map_err(|_| RlmError::sandbox("guest task gone"))
    }

    async fn kill(&self) {
        self.cancel.cancel();
    }

    async fn wait_exit(&self, grace: Duration) -> bool {
        let mut exited = self.exited.clone();
        if *exited.borrow() {
            return true;
        }
        tokio::time::timeout(grace, async {
            while exited.changed().await.is_ok() {
                if *exited.borrow() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

/// Sandbox backed by an in-process guest task.
pub struct WorkerSandbox {
    shared: Arc<Shared>,
    link: Arc<WorkerLink>,
}

impl WorkerSandbox {
    pub async fn create(
        config: SandboxConfig,
        handle: CallHandle,
        bridge: Arc<dyn BridgeDispatch>,
    ) -> Result<Self, RlmError> {
        Self::create_with_interpreter(config, handle, bridge, Arc::new(EchoInterpreter::new()))
            .await
    }

    pub async fn create_with_interpreter(
        config: SandboxConfig,
        handle: CallHandle,
        bridge: Arc<dyn BridgeDispatch>,
        interpreter: Arc<dyn GuestInterpreter>,
    ) -> Result<Self, RlmError> {
        let capacity = config.incoming_frame_queue_capacity.max(1);
        let (host_tx, host_rx) = mpsc::channel(capacity);
        let (guest_tx, guest_rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(false);

        let shared = Arc::new(Shared::new(handle.call_id, config.clone()));
        let link = Arc::new(WorkerLink {
            to_guest: host_tx,
            cancel: cancel.clone(),
            exited: exit_rx,
        });

        {
            let interpreter = Arc::clone(&interpreter);
            tokio::spawn(async move {
                run_guest(interpreter, host_rx, guest_tx, cancel).await;
                let _ = exit_tx.send(true);
            });
        }
        tokio::spawn(run_dispatcher(
            Arc::clone(&shared),
            Arc::clone(&link) as Arc<dyn GuestLink>,
            guest_rx,
            bridge,
        ));

        let sandbox = Self { shared, link };
        sandbox
            .link
            .send_frame(&HostFrame::Init {
                call_id: handle.call_id,
                depth: handle.depth,
                mode: config.mode,
                max_frame_bytes: config.max_frame_bytes,
                tools: handle.tools,
            })
            .await?;
        Ok(sandbox)
    }
}

#[async_trait]
impl SandboxInstance for WorkerSandbox {
    async fn execute(&self, code: &str) -> Result<String, RlmError> {
        let request_id = FrameRequestId::new();
        let frame = HostFrame::ExecRequest {
            request_id,
            code: code.to_string(),
        };
        execute_request(&self.shared, self.link.as_ref(), frame, request_id).await
    }

    async fn set_variable(&self, name: &str, value: serde_json::Value) -> Result<(), RlmError> {
        let request_id = FrameRequestId::new();
        let frame = HostFrame::SetVar {
            request_id,
            name: name.to_string(),
            value,
        };
        if !check_frame_size(&frame, self.shared.config.max_frame_bytes) {
            return Err(RlmError::sandbox(format!(
                "Variable {name} exceeds max frame size"
            )));
        }
        match send_request(
            &self.shared,
            self.link.as_ref(),
            frame,
            request_id,
            self.shared.config.set_var_timeout,
        )
        .await?
        {
            Reply::Unit => Ok(()),
            other => Err(RlmError::sandbox(format!(
                "Unexpected reply to setVar: {other:?}"
            ))),
        }
    }

    async fn get_variable(&self, name: &str) -> Result<serde_json::Value, RlmError> {
        let request_id = FrameRequestId::new();
        let frame = HostFrame::GetVarRequest {
            request_id,
            name: name.to_string(),
        };
        match send_request(
            &self.shared,
            self.link.as_ref(),
            frame,
            request_id,
            self.shared.config.get_var_timeout,
        )
        .await?
        {
            Reply::Value(value) => Ok(value),
            other => Err(RlmError::sandbox(format!(
                "Unexpected reply to getVar: {other:?}"
            ))),
        }
    }

    async fn list_variables(&self) -> Result<Vec<VariableMetadata>, RlmError> {
        let request_id = FrameRequestId::new();
        let frame = HostFrame::ListVarsRequest { request_id };
        match send_request(
            &self.shared,
            self.link.as_ref(),
            frame,
            request_id,
            self.shared.config.list_var_timeout,
        )
        .await?
        {
            Reply::Vars(variables) => Ok(variables),
            other => Err(RlmError::sandbox(format!(
                "Unexpected reply to listVars: {other:?}"
            ))),
        }
    }

    async fn shutdown(&self) {
        shutdown_sequence(&self.shared, self.link.as_ref()).await;
    }
}
