//! Sandbox transport for the rlm engine.
//!
//! Supervises one untrusted guest per call over a framed, bidirectional
//! protocol. Two interchangeable transports implement the same
//! capability set: `spawn` (separate OS process over stdio frames) and
//! `worker` (in-process guest task over channels). Both share the
//! health state machine, the execute-deadline watchdog, and the bridge
//! dispatch path back into host tools.

pub mod guest;
mod instance;
pub mod protocol;
mod select;
mod transport;

pub use guest::{EchoInterpreter, GuestApi, GuestInterpreter};
pub use instance::{BridgeDispatch, CallHandle, SandboxFactory, SandboxInstance};
pub use select::TransportSandboxFactory;
pub use transport::spawn::SpawnSandbox;
pub use transport::worker::WorkerSandbox;
