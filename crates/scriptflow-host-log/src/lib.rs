//! Logging capability for sandboxed flow scripts.
//!
//! A [`ScriptLog`] is created fresh for every invocation. Scripts see it as
//! `log.info/warn/error`; each call is forwarded to the host's `tracing`
//! subscriber with an `origin = "user_code"` field so operators can tell user
//! output apart from host output. The script cannot touch the subscriber
//! itself, only push lines through this handle, and the handle enforces a
//! per-invocation line quota and a message size cap.
//!
//! The other capability shims record their own activity through
//! [`ScriptLog::capability_call`] and [`ScriptLog::capability_failure`],
//! which are tagged `origin = "sandbox_capability"` and do not count against
//! the user quota.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{error, info, warn};

const USER_ORIGIN: &str = "user_code";
const CAPABILITY_ORIGIN: &str = "sandbox_capability";

/// Severity of a line emitted by user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
  Info,
  Warn,
  Error,
}

impl fmt::Display for LogLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LogLevel::Info => f.write_str("info"),
      LogLevel::Warn => f.write_str("warn"),
      LogLevel::Error => f.write_str("error"),
    }
  }
}

/// Limits applied to user logging within one invocation.
#[derive(Debug, Clone)]
pub struct LogPolicy {
  /// Maximum number of lines a script may emit.
  pub max_lines: usize,
  /// Maximum size of a single message in bytes; longer messages are truncated.
  pub max_message_bytes: usize,
}

impl Default for LogPolicy {
  fn default() -> Self {
    Self {
      max_lines: 1000,
      max_message_bytes: 8 * 1024,
    }
  }
}

struct Inner {
  flow_id: String,
  invocation_id: String,
  policy: LogPolicy,
  emitted: AtomicUsize,
  suppressed: AtomicBool,
}

/// Per-invocation logging handle.
///
/// Cloning is cheap and clones share the same quota.
#[derive(Clone)]
pub struct ScriptLog {
  inner: Arc<Inner>,
}

impl fmt::Debug for ScriptLog {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ScriptLog")
      .field("flow_id", &self.inner.flow_id)
      .field("invocation_id", &self.inner.invocation_id)
      .field("emitted", &self.emitted())
      .finish()
  }
}

impl ScriptLog {
  /// Create a logging handle for one invocation of a flow.
  pub fn new(
    flow_id: impl Into<String>,
    invocation_id: impl Into<String>,
    policy: LogPolicy,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        flow_id: flow_id.into(),
        invocation_id: invocation_id.into(),
        policy,
        emitted: AtomicUsize::new(0),
        suppressed: AtomicBool::new(false),
      }),
    }
  }

  pub fn flow_id(&self) -> &str {
    &self.inner.flow_id
  }

  pub fn invocation_id(&self) -> &str {
    &self.inner.invocation_id
  }

  /// Number of user lines forwarded to the host so far.
  pub fn emitted(&self) -> usize {
    self
      .inner
      .emitted
      .load(Ordering::Relaxed)
      .min(self.inner.policy.max_lines)
  }

  /// Whether the line quota has been exhausted.
  pub fn is_suppressed(&self) -> bool {
    self.inner.suppressed.load(Ordering::Relaxed)
  }

  pub fn info(&self, message: &str) -> bool {
    self.log(LogLevel::Info, message)
  }

  pub fn warn(&self, message: &str) -> bool {
    self.log(LogLevel::Warn, message)
  }

  pub fn error(&self, message: &str) -> bool {
    self.log(LogLevel::Error, message)
  }

  /// Forward a user line to the host logger.
  ///
  /// Returns `false` when the line was dropped because the quota is used up.
  pub fn log(&self, level: LogLevel, message: &str) -> bool {
    let seq = self.inner.emitted.fetch_add(1, Ordering::Relaxed);
    if seq >= self.inner.policy.max_lines {
      if !self.inner.suppressed.swap(true, Ordering::Relaxed) {
        warn!(
          origin = CAPABILITY_ORIGIN,
          flow_id = %self.inner.flow_id,
          invocation_id = %self.inner.invocation_id,
          max_lines = self.inner.policy.max_lines,
          "user log quota exhausted, further lines suppressed"
        );
      }
      return false;
    }

    let message = truncate(message, self.inner.policy.max_message_bytes);
    let flow_id = self.inner.flow_id.as_str();
    let invocation_id = self.inner.invocation_id.as_str();

    match level {
      LogLevel::Info => info!(origin = USER_ORIGIN, flow_id, invocation_id, "{}", message),
      LogLevel::Warn => warn!(origin = USER_ORIGIN, flow_id, invocation_id, "{}", message),
      LogLevel::Error => error!(origin = USER_ORIGIN, flow_id, invocation_id, "{}", message),
    }

    true
  }

  /// Record a capability call before it is dispatched.
  pub fn capability_call(&self, capability: &str, method: &str, target: &str, timeout_ms: u64) {
    info!(
      origin = CAPABILITY_ORIGIN,
      flow_id = %self.inner.flow_id,
      invocation_id = %self.inner.invocation_id,
      capability,
      method,
      target,
      timeout_ms,
      "capability call"
    );
  }

  /// Record a failed capability call.
  pub fn capability_failure(&self, capability: &str, method: &str, target: &str, reason: &str) {
    error!(
      origin = CAPABILITY_ORIGIN,
      flow_id = %self.inner.flow_id,
      invocation_id = %self.inner.invocation_id,
      capability,
      method,
      target,
      reason,
      "capability call failed"
    );
  }
}

/// Truncate to at most `max_bytes`, backing off to a char boundary.
fn truncate(message: &str, max_bytes: usize) -> &str {
  if message.len() <= max_bytes {
    return message;
  }
  let mut end = max_bytes;
  while !message.is_char_boundary(end) {
    end -= 1;
  }
  &message[..end]
}
