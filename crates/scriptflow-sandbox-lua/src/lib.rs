//! Lua 5.4 runtime for flow scripts.
//!
//! [`LuaSandbox`] implements [`scriptflow_sandbox::ScriptExecutor`]. Scripts
//! see `payload`, `env`, `log`, `http`, `json`, `sleep` and a restricted set
//! of builtins; `io`, `os`, `require`, `load` and friends are denied.

mod capabilities;
mod classify;
mod convert;
mod environment;
mod pattern;
mod sandbox;

pub use classify::SandboxInterrupt;
pub use sandbox::LuaSandbox;
