//! Spawn transport: one guest OS process per call, supervised over
//! newline-delimited JSON frames on stdin/stdout.

use crate::instance::{BridgeDispatch, CallHandle, SandboxInstance};
use crate::protocol::{check_frame_size, FrameRequestId, GuestFrame, HostFrame, VariableMetadata};
use crate::transport::{
    execute_request, run_dispatcher, send_request, shutdown_sequence, GuestLink, Reply, Shared,
};
use async_trait::async_trait;
use futures::StreamExt;
use rlm_common::{RlmError, SandboxConfig, SandboxMode};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{info, warn};

struct ProcessLink {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
}

#[async_trait]
impl GuestLink for ProcessLink {
    async fn send_frame(&self, frame: &HostFrame) -> Result<(), RlmError> {
        let mut line = serde_json::to_string(frame)
            .map_err(|e| RlmError::sandbox(format!("failed to encode frame: {e}")))?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| RlmError::sandbox("guest stdin closed"))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RlmError::sandbox(format!("failed to write frame: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| RlmError::sandbox(format!("failed to flush frame: {e}")))
    }

    async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(err) = child.kill().await {
            warn!(%err, "failed to kill guest process");
        }
    }

    async fn wait_exit(&self, grace: Duration) -> bool {
        let mut child = self.child.lock().await;
        tokio::time::timeout(grace, child.wait()).await.is_ok()
    }
}

/// Sandbox backed by a separate guest process. The guest program is
/// either configured explicitly or the bundled `rlm-guest` binary next
/// to the host executable.
pub struct SpawnSandbox {
    shared: Arc<Shared>,
    link: Arc<ProcessLink>,
    /// Strict-mode working directory, removed again at shutdown.
    scratch: Option<PathBuf>,
}

impl std::fmt::Debug for SpawnSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnSandbox")
            .field("scratch", &self.scratch)
            .finish_non_exhaustive()
    }
}

impl SpawnSandbox {
    pub async fn create(
        config: SandboxConfig,
        handle: CallHandle,
        bridge: Arc<dyn BridgeDispatch>,
    ) -> Result<Self, RlmError> {
        let program = resolve_guest_program(&config)?;
        let mut command = Command::new(&program);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let scratch = if config.mode == SandboxMode::Strict {
            let scratch = scratch_dir(handle.call_id);
            std::fs::create_dir_all(&scratch)
                .map_err(|e| RlmError::sandbox(format!("failed to create scratch dir: {e}")))?;
            command.env_clear().current_dir(&scratch);
            Some(scratch)
        } else {
            None
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(dir) = &scratch {
                    let _ = std::fs::remove_dir_all(dir);
                }
                return Err(RlmError::sandbox(format!(
                    "failed to spawn {}: {e}",
                    program.display()
                )));
            }
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RlmError::sandbox("guest stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RlmError::sandbox("guest stdout unavailable"))?;

        info!(call_id = %handle.call_id, program = %program.display(), "spawned guest process");

        let shared = Arc::new(Shared::new(handle.call_id, config.clone()));
        let link = Arc::new(ProcessLink {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(child),
        });

        let (frame_tx, frame_rx) = mpsc::channel(config.incoming_frame_queue_capacity.max(1));
        tokio::spawn(read_frames(
            Arc::clone(&shared),
            Arc::clone(&link) as Arc<dyn GuestLink>,
            stdout,
            frame_tx,
        ));
        tokio::spawn(run_dispatcher(
            Arc::clone(&shared),
            Arc::clone(&link) as Arc<dyn GuestLink>,
            frame_rx,
            bridge,
        ));

        let sandbox = Self {
            shared,
            link,
            scratch,
        };
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

fn scratch_dir(call_id: rlm_common::CallId) -> PathBuf {
    std::env::temp_dir().join(format!("rlm-guest-{call_id}"))
}

fn resolve_guest_program(config: &SandboxConfig) -> Result<PathBuf, RlmError> {
    if let Some(program) = &config.guest_program {
        return Ok(program.clone());
    }
    let exe = std::env::current_exe()
        .map_err(|e| RlmError::sandbox(format!("cannot locate host executable: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| RlmError::sandbox("host executable has no parent directory"))?;
    Ok(dir.join("rlm-guest"))
}

/// Read stdout lines into guest frames until EOF or a protocol fault.
/// The line codec enforces the frame byte ceiling on the way in; a line
/// that exceeds it, or one that fails to parse, kills the instance.
async fn read_frames(
    shared: Arc<Shared>,
    link: Arc<dyn GuestLink>,
    stdout: tokio::process::ChildStdout,
    frames: mpsc::Sender<GuestFrame>,
) {
    let codec = LinesCodec::new_with_max_length(shared.config.max_frame_bytes);
    let mut lines = FramedRead::new(stdout, codec);

    while let Some(item) = lines.next().await {
        let line = match item {
            Ok(line) => line,
            Err(err) => {
                shared.mark_dead(&format!("Guest sent oversized or unreadable frame: {err}"));
                link.kill().await;
                return;
            }
        };
        let frame: GuestFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(err) => {
                shared.mark_dead(&format!("Guest sent malformed frame: {err}"));
                link.kill().await;
                return;
            }
        };
        if frames.send(frame).await.is_err() {
            return;
        }
    }

    // EOF while alive means the guest died under us.
    if shared.is_alive() {
        shared.mark_dead("Guest process exited unexpectedly");
    }
}

#[async_trait]
impl SandboxInstance for SpawnSandbox {
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
        if let Some(dir) = &self.scratch {
            if let Err(err) = tokio::fs::remove_dir_all(dir).await {
                warn!(dir = %dir.display(), %err, "failed to remove scratch dir");
            }
        }
    }
}
