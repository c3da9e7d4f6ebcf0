//! Classified result of one sandboxed script run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Message reported when the wall-clock deadline fires.
pub const TIMEOUT_MESSAGE: &str = "Script execution timed out";

/// Why a script run did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  /// User code fault: syntax error, runtime error, bad return value.
  ScriptError,
  /// The wall-clock deadline was exceeded.
  Timeout,
  /// The script reached for a capability it was not given.
  SecurityViolation,
  /// Secrets could not be resolved; no user code ran.
  SecretResolutionError,
}

impl fmt::Display for FailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      FailureKind::ScriptError => "script_error",
      FailureKind::Timeout => "timeout",
      FailureKind::SecurityViolation => "security_violation",
      FailureKind::SecretResolutionError => "secret_resolution_error",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFailure {
  pub kind: FailureKind,
  pub message: String,
}

/// Exactly one of these is produced per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum ExecutionOutcome {
  Success(serde_json::Value),
  Failure(ScriptFailure),
}

impl ExecutionOutcome {
  pub fn success(value: serde_json::Value) -> Self {
    ExecutionOutcome::Success(value)
  }

  pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
    ExecutionOutcome::Failure(ScriptFailure {
      kind,
      message: message.into(),
    })
  }

  pub fn timeout() -> Self {
    Self::failure(FailureKind::Timeout, TIMEOUT_MESSAGE)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, ExecutionOutcome::Success(_))
  }

  /// Failure kind, or `None` on success.
  pub fn failure_kind(&self) -> Option<FailureKind> {
    match self {
      ExecutionOutcome::Success(_) => None,
      ExecutionOutcome::Failure(failure) => Some(failure.kind),
    }
  }

  /// Failure message, or `None` on success.
  pub fn error_message(&self) -> Option<&str> {
    match self {
      ExecutionOutcome::Success(_) => None,
      ExecutionOutcome::Failure(failure) => Some(&failure.message),
    }
  }
}
