//! Mapping Lua errors onto [`ExecutionOutcome`] failures.

use std::error::Error as StdError;
use std::sync::{Arc, OnceLock};

use scriptflow_host_http::HttpError;
use scriptflow_sandbox::{ExecutionOutcome, FailureKind, TIMEOUT_MESSAGE};
use thiserror::Error;

/// Errors the host raises into running Lua code to stop it.
#[derive(Debug, Error)]
pub enum SandboxInterrupt {
  #[error("{}", TIMEOUT_MESSAGE)]
  DeadlineExceeded,

  /// The script referenced a global that is deliberately not provided.
  #[error("Access denied to {name}")]
  CapabilityDenied { name: String },
}

/// The first capability refusal of one invocation.
///
/// Refusals are recorded before the error is raised, so the run ends as a
/// security violation even if the script catches the error.
#[derive(Debug, Clone, Default)]
pub(crate) struct Violation(Arc<OnceLock<String>>);

impl Violation {
  pub(crate) fn record(&self, message: String) {
    let _ = self.0.set(message);
  }

  pub(crate) fn is_recorded(&self) -> bool {
    self.0.get().is_some()
  }

  pub(crate) fn outcome(&self) -> Option<ExecutionOutcome> {
    self
      .0
      .get()
      .map(|message| ExecutionOutcome::failure(FailureKind::SecurityViolation, message.as_str()))
  }
}

/// Outcome message for a refused HTTP call.
pub(crate) fn http_denied(err: &HttpError) -> String {
  format!("Access denied: {err}")
}

/// Classify an error raised while preparing or running a script.
///
/// `deadline_passed` turns any error observed after the deadline into a
/// timeout, so a script cannot mask the interruption by rethrowing
/// something else.
pub(crate) fn classify(err: &mlua::Error, deadline_passed: bool) -> ExecutionOutcome {
  if let Some(interrupt) = find_external::<SandboxInterrupt>(err) {
    return match interrupt {
      SandboxInterrupt::DeadlineExceeded => ExecutionOutcome::timeout(),
      SandboxInterrupt::CapabilityDenied { .. } => {
        ExecutionOutcome::failure(FailureKind::SecurityViolation, interrupt.to_string())
      }
    };
  }

  if deadline_passed {
    return ExecutionOutcome::timeout();
  }

  if let Some(http) = find_external::<HttpError>(err)
    && http.is_policy_violation()
  {
    return ExecutionOutcome::failure(FailureKind::SecurityViolation, http_denied(http));
  }

  ExecutionOutcome::failure(FailureKind::ScriptError, describe(err))
}

/// Human-readable message for a script error, without the Lua traceback.
pub(crate) fn describe(err: &mlua::Error) -> String {
  match err {
    mlua::Error::SyntaxError { message, .. } => {
      format!("SyntaxError: {}", strip_traceback(message))
    }
    mlua::Error::RuntimeError(message) => format!("RuntimeError: {}", strip_traceback(message)),
    mlua::Error::MemoryError(message) => format!("MemoryError: {message}"),
    mlua::Error::CallbackError { cause, .. } => describe(cause),
    mlua::Error::WithContext { cause, .. } => describe(cause),
    mlua::Error::ExternalError(inner) => format!("Error: {inner}"),
    other => format!("Error: {}", strip_traceback(&other.to_string())),
  }
}

/// Message handed to a script that caught an error raised by the host.
pub(crate) fn script_message(err: &mlua::Error) -> String {
  match err {
    mlua::Error::CallbackError { cause, .. } => script_message(cause),
    mlua::Error::WithContext { cause, .. } => script_message(cause),
    mlua::Error::RuntimeError(message) => strip_traceback(message).to_string(),
    mlua::Error::ExternalError(inner) => inner.to_string(),
    other => strip_traceback(&other.to_string()).to_string(),
  }
}

/// Walk through mlua's wrapper variants looking for an external error of type `T`.
fn find_external<T: StdError + 'static>(err: &mlua::Error) -> Option<&T> {
  match err {
    mlua::Error::CallbackError { cause, .. } => find_external(cause),
    mlua::Error::WithContext { cause, .. } => find_external(cause),
    mlua::Error::BadArgument { cause, .. } => find_external(cause),
    mlua::Error::ExternalError(inner) => inner.downcast_ref::<T>(),
    _ => None,
  }
}

pub(crate) fn strip_traceback(message: &str) -> &str {
  match message.find("\nstack traceback:") {
    Some(index) => &message[..index],
    None => message,
  }
}
