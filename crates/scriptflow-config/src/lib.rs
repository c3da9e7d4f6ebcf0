//! Scriptflow Config
//!
//! Runtime configuration for the scriptflow service. Configuration is read
//! from an optional JSON file, then selected values are overridden from the
//! environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `SCRIPTFLOW_BIND` | `server.bind` |
//! | `SCRIPTFLOW_DATABASE_URL` | `database.url` |
//! | `SCRIPTFLOW_ACTION_HANDLER_URL` | `dispatch.action_handler_url` |
//! | `SCRIPTFLOW_QUEUE_URL` | `dispatch.queue_url` |
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration for local use.

mod error;
mod sections;
mod service;

pub use error::ConfigError;
pub use sections::{
  DatabaseSection, DispatchMode, DispatchSection, HttpSection, LogSection, SandboxSection,
  SecretsSection, ServerSection,
};
pub use service::ServiceConfig;
