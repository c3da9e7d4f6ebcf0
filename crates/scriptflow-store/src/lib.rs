//! Scriptflow Store
//!
//! Persistence for flow definitions and execution logs. Two traits are
//! defined because the orchestrator uses them as separate collaborators:
//!
//! - [`FlowStore`] reads and registers flow definitions
//! - [`LogSink`] appends and lists execution log entries
//!
//! [`SqliteStore`] implements both on SQLite; [`InMemoryStore`] keeps
//! everything in process for tests and local runs.

mod memory;
mod sqlite;
mod types;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use sqlx::types::Json;
pub use types::{ExecutionLogEntry, FlowDefinition, LogStatus};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Source of flow definitions.
#[async_trait]
pub trait FlowStore: Send + Sync {
  /// Load an active flow. Missing and inactive flows are both `None`.
  async fn load_flow(&self, flow_id: &str) -> Result<Option<FlowDefinition>, StoreError>;

  /// Get a flow regardless of its active flag.
  async fn get_flow(&self, flow_id: &str) -> Result<FlowDefinition, StoreError>;

  /// Insert or replace a flow definition.
  async fn put_flow(&self, flow: &FlowDefinition) -> Result<(), StoreError>;
}

/// Durable destination for execution log entries.
#[async_trait]
pub trait LogSink: Send + Sync {
  async fn append(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError>;

  /// Entries for a flow, newest first.
  async fn list_logs(&self, flow_id: &str) -> Result<Vec<ExecutionLogEntry>, StoreError>;
}
