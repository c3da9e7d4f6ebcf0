//! The executor seam between the orchestrator and a sandbox runtime.

use std::time::Duration;

use async_trait::async_trait;

use crate::outcome::ExecutionOutcome;
use crate::secrets::ResolvedSecrets;

/// Everything a sandbox needs to run one script.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
  /// Unique id of this invocation, used to tag logs.
  pub invocation_id: String,
  pub flow_id: String,
  /// Script source text.
  pub source: String,
  /// Decoded webhook payload.
  pub payload: serde_json::Value,
  /// Resolved secrets, including the synthesized `FLOW_ID`.
  pub secrets: ResolvedSecrets,
}

/// Resource limits applied to every script run.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
  /// Hard wall-clock deadline for the whole run, async waits included.
  pub deadline: Duration,
  /// Memory the script's heap may use.
  pub memory_limit_bytes: usize,
  /// Extra time granted to a worker to report back after the deadline
  /// before the host stops waiting for it.
  pub watchdog_grace: Duration,
  /// Runs allowed to occupy a worker thread at once. A run that cannot get
  /// a worker before its deadline is a timeout.
  pub max_workers: usize,
}

impl Default for SandboxLimits {
  fn default() -> Self {
    Self {
      deadline: Duration::from_millis(5000),
      memory_limit_bytes: 64 * 1024 * 1024,
      watchdog_grace: Duration::from_millis(250),
      max_workers: 32,
    }
  }
}

/// Runs untrusted scripts.
///
/// Implementations must build a fresh, isolated context for every call and
/// must always return an [`ExecutionOutcome`]: no error or panic from the
/// script may cross this boundary.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
  async fn execute(&self, request: ScriptRequest) -> ExecutionOutcome;
}
