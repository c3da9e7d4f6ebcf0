use std::str::FromStr;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::{ExecutionLogEntry, FlowDefinition, FlowStore, LogSink, StoreError};

/// SQLite-based store implementation.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database at `url` and apply migrations.
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    info!(database_url = %url, "store ready");
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }
}

#[async_trait]
impl FlowStore for SqliteStore {
  async fn load_flow(&self, flow_id: &str) -> Result<Option<FlowDefinition>, StoreError> {
    let flow = sqlx::query_as(
      r#"
            SELECT flow_id, user_id, is_active, user_code, secret_references, action_url, created_at, updated_at
            FROM flows
            WHERE flow_id = ? AND is_active = 1
            "#,
    )
    .bind(flow_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(flow)
  }

  async fn get_flow(&self, flow_id: &str) -> Result<FlowDefinition, StoreError> {
    sqlx::query_as(
      r#"
            SELECT flow_id, user_id, is_active, user_code, secret_references, action_url, created_at, updated_at
            FROM flows
            WHERE flow_id = ?
            "#,
    )
    .bind(flow_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("flow {flow_id}")))
  }

  async fn put_flow(&self, flow: &FlowDefinition) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO flows (flow_id, user_id, is_active, user_code, secret_references, action_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(flow_id) DO UPDATE SET
                user_id = excluded.user_id,
                is_active = excluded.is_active,
                user_code = excluded.user_code,
                secret_references = excluded.secret_references,
                action_url = excluded.action_url,
                updated_at = excluded.updated_at
            "#,
    )
    .bind(&flow.flow_id)
    .bind(&flow.user_id)
    .bind(flow.is_active)
    .bind(&flow.user_code)
    .bind(&flow.secret_references)
    .bind(&flow.action_url)
    .bind(flow.created_at)
    .bind(flow.updated_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }
}

#[async_trait]
impl LogSink for SqliteStore {
  async fn append(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO execution_logs (log_id, invocation_id, flow_id, user_id, status, error_kind, duration_ms, payload, result, error, action_status, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&entry.log_id)
    .bind(&entry.invocation_id)
    .bind(&entry.flow_id)
    .bind(&entry.user_id)
    .bind(entry.status)
    .bind(&entry.error_kind)
    .bind(entry.duration_ms)
    .bind(&entry.payload)
    .bind(&entry.result)
    .bind(&entry.error)
    .bind(entry.action_status)
    .bind(entry.timestamp)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_logs(&self, flow_id: &str) -> Result<Vec<ExecutionLogEntry>, StoreError> {
    let entries = sqlx::query_as(
      r#"
            SELECT log_id, invocation_id, flow_id, user_id, status, error_kind, duration_ms, payload, result, error, action_status, timestamp
            FROM execution_logs
            WHERE flow_id = ?
            ORDER BY timestamp DESC
            "#,
    )
    .bind(flow_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(entries)
  }
}
