//! Scriptflow invocation orchestrator.
//!
//! Wires the flow store, secret resolver, script executor, action
//! dispatcher and log sink into the webhook pipeline. All collaborators are
//! injected through [`OrchestratorDeps`].

mod logger;
mod orchestrator;
mod response;

pub use logger::ExecutionLogger;
pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use response::{Classification, InvocationResponse};
