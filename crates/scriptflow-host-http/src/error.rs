use thiserror::Error;

/// Errors raised by the sandbox HTTP capability.
#[derive(Debug, Error)]
pub enum HttpError {
  #[error("invalid url '{url}': {message}")]
  InvalidUrl { url: String, message: String },

  /// The URL scheme is not on the allow-list (e.g. `file://`).
  #[error("scheme '{scheme}' is not allowed")]
  SchemeNotAllowed { scheme: String },

  /// The target host is on the deny-list.
  #[error("host '{host}' is not allowed")]
  HostDenied { host: String },

  /// The per-invocation request quota is used up.
  #[error("request quota exceeded (max {limit} requests per invocation)")]
  QuotaExceeded { limit: u32 },

  #[error("request timed out after {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },

  #[error("response body exceeds {limit} bytes")]
  ResponseTooLarge { limit: usize },

  /// Non-2xx response while `raise_for_status` is on.
  #[error("request failed with status {status}")]
  Status { status: u16 },

  #[error("transport error: {0}")]
  Transport(String),
}

impl HttpError {
  /// Whether this error is a refused capability (as opposed to a failed request).
  pub fn is_policy_violation(&self) -> bool {
    matches!(
      self,
      HttpError::SchemeNotAllowed { .. }
        | HttpError::HostDenied { .. }
        | HttpError::QuotaExceeded { .. }
    )
  }

  pub(crate) fn from_reqwest(err: reqwest::Error, timeout_ms: u64) -> Self {
    if err.is_timeout() {
      return HttpError::Timeout { timeout_ms };
    }

    // A refusal from the resolver arrives wrapped in connect errors.
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
      if let Some(denied) = cause.downcast_ref::<DeniedAddress>() {
        return HttpError::HostDenied {
          host: denied.host.clone(),
        };
      }
      source = cause.source();
    }

    HttpError::Transport(err.to_string())
  }
}

/// Raised by the resolver when every address of a host is denied.
#[derive(Debug, Error)]
#[error("host '{host}' resolves only to denied addresses")]
pub(crate) struct DeniedAddress {
  pub(crate) host: String,
}
