use thiserror::Error;

/// Errors constructing a dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
  /// A required setting is absent.
  #[error("dispatch configuration is incomplete: missing {0}")]
  MissingConfig(&'static str),

  #[error("invalid {name} '{value}': {message}")]
  InvalidUrl {
    name: &'static str,
    value: String,
    message: String,
  },

  #[error("failed to build http client: {0}")]
  Client(#[from] reqwest::Error),
}
