use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// A registered flow as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FlowDefinition {
  pub flow_id: String,
  pub user_id: String,
  pub is_active: bool,
  /// Lua source run on every invocation.
  pub user_code: String,
  /// Secret name → reference understood by a secret resolver. Never a value.
  #[serde(default)]
  pub secret_references: Json<HashMap<String, String>>,
  /// Where the action handler delivers the script result.
  pub action_url: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl FlowDefinition {
  /// An active flow with no secret references, timestamped now.
  pub fn new(
    flow_id: impl Into<String>,
    user_id: impl Into<String>,
    user_code: impl Into<String>,
    action_url: impl Into<String>,
  ) -> Self {
    let now = Utc::now();
    Self {
      flow_id: flow_id.into(),
      user_id: user_id.into(),
      is_active: true,
      user_code: user_code.into(),
      secret_references: Json(HashMap::new()),
      action_url: action_url.into(),
      created_at: now,
      updated_at: now,
    }
  }

  pub fn with_secret(mut self, name: impl Into<String>, reference: impl Into<String>) -> Self {
    self.secret_references.0.insert(name.into(), reference.into());
    self
  }

  pub fn inactive(mut self) -> Self {
    self.is_active = false;
    self
  }
}

/// Terminal status recorded for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
  Success,
  Fail,
  ActionFail,
  Timeout,
}

impl fmt::Display for LogStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      LogStatus::Success => "SUCCESS",
      LogStatus::Fail => "FAIL",
      LogStatus::ActionFail => "ACTION_FAIL",
      LogStatus::Timeout => "TIMEOUT",
    };
    f.write_str(name)
  }
}

/// One durable record per invocation. Never contains secret values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExecutionLogEntry {
  pub log_id: String,
  pub invocation_id: String,
  pub flow_id: String,
  /// `"unknown"` when the flow could not be loaded.
  pub user_id: String,
  pub status: LogStatus,
  /// Failure classification, e.g. `script_error`.
  pub error_kind: Option<String>,
  pub duration_ms: i64,
  pub payload: Json<serde_json::Value>,
  pub result: Option<Json<serde_json::Value>>,
  pub error: Option<String>,
  /// 202 when the action was queued, 500 when queueing failed.
  pub action_status: Option<i32>,
  pub timestamp: DateTime<Utc>,
}
