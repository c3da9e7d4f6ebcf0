//! Sandbox abstraction for flow scripts.
//!
//! This crate defines what a sandbox runtime receives and returns, without
//! depending on any particular script engine:
//!
//! - [`ScriptRequest`] and [`SandboxLimits`]: the input and resource bounds
//! - [`BindingTable`]: the explicit allow-list of names a script can see
//! - [`ExecutionOutcome`]: the classified result, produced exactly once
//! - [`ScriptExecutor`]: the trait the orchestrator drives
//!
//! The Lua implementation lives in `scriptflow-sandbox-lua`.

pub mod bindings;
mod executor;
mod outcome;
mod secrets;

pub use bindings::{Binding, BindingTable};
pub use executor::{SandboxLimits, ScriptExecutor, ScriptRequest};
pub use outcome::{ExecutionOutcome, FailureKind, ScriptFailure, TIMEOUT_MESSAGE};
pub use secrets::{FLOW_ID_KEY, ResolvedSecrets};
