//! Transport selection policy.

use crate::guest::{EchoInterpreter, GuestInterpreter};
use crate::instance::{BridgeDispatch, CallHandle, SandboxFactory, SandboxInstance};
use crate::transport::spawn::SpawnSandbox;
use crate::transport::worker::WorkerSandbox;
use async_trait::async_trait;
use rlm_common::{RlmError, SandboxConfig, SandboxMode, SandboxTransport};
use std::sync::Arc;
use tracing::warn;

/// Creates one sandbox per call according to the configured transport.
///
/// Strict mode always uses the spawn transport, whatever the transport
/// setting says: isolation claims only hold across a process boundary.
/// `Auto` prefers the worker and falls back to spawn when worker
/// startup fails; failures after a successful startup never migrate an
/// instance between transports.
pub struct TransportSandboxFactory {
    config: SandboxConfig,
    bridge: Arc<dyn BridgeDispatch>,
    interpreter: Arc<dyn GuestInterpreter>,
}

impl TransportSandboxFactory {
    pub fn new(config: SandboxConfig, bridge: Arc<dyn BridgeDispatch>) -> Self {
        Self::with_interpreter(config, bridge, Arc::new(EchoInterpreter::new()))
    }

    /// Use a caller-supplied interpreter for worker-transport guests.
    /// The spawn transport ignores it; its guest program brings its own.
    pub fn with_interpreter(
        config: SandboxConfig,
        bridge: Arc<dyn BridgeDispatch>,
        interpreter: Arc<dyn GuestInterpreter>,
    ) -> Self {
        Self {
            config,
            bridge,
            interpreter,
        }
    }

    async fn create_worker(&self, handle: CallHandle) -> Result<Box<dyn SandboxInstance>, RlmError> {
        let sandbox = WorkerSandbox::create_with_interpreter(
            self.config.clone(),
            handle,
            Arc::clone(&self.bridge),
            Arc::clone(&self.interpreter),
        )
        .await?;
        Ok(Box::new(sandbox))
    }

    async fn create_spawn(&self, handle: CallHandle) -> Result<Box<dyn SandboxInstance>, RlmError> {
        let sandbox =
            SpawnSandbox::create(self.config.clone(), handle, Arc::clone(&self.bridge)).await?;
        Ok(Box::new(sandbox))
    }
}

#[async_trait]
impl SandboxFactory for TransportSandboxFactory {
    async fn create(&self, handle: CallHandle) -> Result<Box<dyn SandboxInstance>, RlmError> {
        if self.config.mode == SandboxMode::Strict {
            return self.create_spawn(handle).await;
        }
        match self.config.transport {
            SandboxTransport::Spawn => self.create_spawn(handle).await,
            SandboxTransport::Worker => self.create_worker(handle).await,
            SandboxTransport::Auto => match self.create_worker(handle.clone()).await {
                Ok(sandbox) => Ok(sandbox),
                Err(err) => {
                    warn!(call_id = %handle.call_id, %err, "worker startup failed, falling back to spawn");
                    self.create_spawn(handle).await
                }
            },
        }
    }
}
