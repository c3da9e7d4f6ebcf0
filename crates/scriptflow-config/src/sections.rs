use std::path::PathBuf;

use scriptflow_host_http::HttpPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
  /// Socket address the webhook server listens on.
  pub bind: String,
}

impl Default for ServerSection {
  fn default() -> Self {
    Self {
      bind: "0.0.0.0:8080".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSection {
  /// SQLite connection URL; the file is created when missing.
  pub url: String,
}

impl Default for DatabaseSection {
  fn default() -> Self {
    Self {
      url: "sqlite://scriptflow.db".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxSection {
  /// Wall-clock deadline for one script run.
  pub timeout_ms: u64,
  pub memory_limit_bytes: usize,
  /// Script runs allowed to hold a worker thread at once.
  pub max_workers: usize,
}

impl Default for SandboxSection {
  fn default() -> Self {
    Self {
      timeout_ms: 5000,
      memory_limit_bytes: 64 * 1024 * 1024,
      max_workers: 32,
    }
  }
}

/// Limits for the HTTP capability given to scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSection {
  /// Default and maximum per-request timeout.
  pub timeout_ms: u64,
  pub max_response_bytes: usize,
  /// Requests allowed per invocation.
  pub max_requests: u32,
  pub denied_hosts: Vec<String>,
}

impl Default for HttpSection {
  fn default() -> Self {
    let policy = HttpPolicy::default();
    Self {
      timeout_ms: policy.max_timeout.as_millis() as u64,
      max_response_bytes: policy.max_response_bytes,
      max_requests: policy.max_requests,
      denied_hosts: policy.denied_hosts,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
  /// Lines a script may log per invocation.
  pub max_lines: usize,
  pub max_message_bytes: usize,
}

impl Default for LogSection {
  fn default() -> Self {
    Self {
      max_lines: 1000,
      max_message_bytes: 8 * 1024,
    }
  }
}

/// How successful results are handed to the action stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
  /// In-process bounded queue drained by a delivery worker.
  #[default]
  Queue,
  /// POST each task to an external task-queue endpoint.
  Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSection {
  pub mode: DispatchMode,
  /// Capacity of the in-process queue (queue mode).
  pub queue_capacity: usize,
  /// Receiver of action tasks. Required in http mode; in queue mode the
  /// flow's own `action_url` is used when unset.
  pub action_handler_url: Option<String>,
  /// Task-queue endpoint (http mode).
  pub queue_url: Option<String>,
  /// Timeout for one delivery or enqueue request.
  pub timeout_ms: u64,
}

impl Default for DispatchSection {
  fn default() -> Self {
    Self {
      mode: DispatchMode::Queue,
      queue_capacity: 1024,
      action_handler_url: None,
      queue_url: None,
      timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretsSection {
  /// JSON object mapping secret references to values.
  pub file: Option<PathBuf>,
  /// Resolve `env:NAME` references from the process environment.
  pub allow_env: bool,
}

impl Default for SecretsSection {
  fn default() -> Self {
    Self {
      file: None,
      allow_env: true,
    }
  }
}
