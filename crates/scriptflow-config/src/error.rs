use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid config value for {field}: {message}")]
  Invalid {
    field: &'static str,
    message: String,
  },
}

impl ConfigError {
  pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
    ConfigError::Invalid {
      field,
      message: message.into(),
    }
  }
}
