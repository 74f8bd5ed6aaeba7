//! Orchestration for the recursive completion engine.
//!
//! A [`Session`] hosts one completion request: the shared runtime (the
//! command queue, event bus, and budget), the scheduler consuming that
//! queue, and the bridge handler that routes sandbox callbacks back in.
//! Code execution is delegated to an injected [`SandboxFactory`]; model
//! calls to an injected [`ModelService`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use rlm_core::{Session, ToolRegistry};
//! # use rlm_common::{RlmConfig, SandboxConfig};
//! # async fn example(model: Arc<dyn rlm_core::ModelService>) -> Result<(), rlm_common::RlmError> {
//! let session = Session::new(
//!     RlmConfig::default(),
//!     model,
//!     |bridge| Arc::new(rlm_sandbox::TransportSandboxFactory::new(SandboxConfig::default(), bridge)),
//!     ToolRegistry::new(),
//!     None,
//! );
//! let answer = session.complete("what is 2+2?", "").await?;
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod bridge;
mod call;
pub mod extract;
mod model;
pub mod prompt;
mod runtime;
mod scheduler;
mod tools;
mod validate;

pub use bridge::BridgeHandler;
pub use model::{GenerateRequest, ModelResponse, ModelService};
pub use runtime::RlmRuntime;
pub use scheduler::Scheduler;
pub use tools::{Tool, ToolRegistry};
pub use validate::OutputValidator;

use rlm_common::{CallId, RlmCommand, RlmConfig, RlmError, RlmEvent};
use rlm_sandbox::{BridgeDispatch, SandboxFactory};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// One completion request's engine: runtime plus a running scheduler.
pub struct Session {
    runtime: Arc<RlmRuntime>,
    scheduler: JoinHandle<()>,
}

impl Session {
    /// Wire up a session. The sandbox factory is built through a
    /// closure because it needs the bridge handler, which needs the
    /// runtime, which this constructor creates.
    pub fn new<F>(
        config: RlmConfig,
        model: Arc<dyn ModelService>,
        make_factory: F,
        tools: ToolRegistry,
        validator: Option<Arc<dyn OutputValidator>>,
    ) -> Self
    where
        F: FnOnce(Arc<dyn BridgeDispatch>) -> Arc<dyn SandboxFactory>,
    {
        let (runtime, commands) = RlmRuntime::new(config);
        let bridge: Arc<dyn BridgeDispatch> = Arc::new(BridgeHandler::new(Arc::clone(&runtime)));
        let factory = make_factory(bridge);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&runtime),
            model,
            factory,
            Arc::new(tools),
            validator,
        ));
        let handle = tokio::spawn(scheduler.run(commands));
        Self {
            runtime,
            scheduler: handle,
        }
    }

    /// Run one root call to completion and return its answer.
    pub async fn complete(&self, query: &str, context: &str) -> Result<String, RlmError> {
        let (tx, rx) = oneshot::channel();
        self.runtime.enqueue(RlmCommand::StartCall {
            call_id: CallId::new(),
            depth: 0,
            query: query.to_string(),
            context: context.to_string(),
            reply: Some(tx),
        })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RlmError::sandbox("scheduler stopped")),
        }
    }

    /// Live event stream. No replay: subscribe before `complete` to
    /// see a call's full lifecycle.
    pub fn subscribe(&self) -> broadcast::Receiver<RlmEvent> {
        self.runtime.subscribe()
    }

    pub fn runtime(&self) -> &Arc<RlmRuntime> {
        &self.runtime
    }

    /// Stop accepting work, join the scheduler, then drain every table
    /// and tear down every live sandbox. Safe to call mid-completion;
    /// pending callers get a "scheduler stopped" error.
    pub async fn shutdown(self) {
        self.runtime.begin_close();
        let _ = self.scheduler.await;
        self.runtime.teardown().await;
    }
}
