use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use scriptflow_host_http::HttpPolicy;
use scriptflow_host_log::LogPolicy;
use scriptflow_sandbox::SandboxLimits;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::sections::{
  DatabaseSection, DispatchMode, DispatchSection, HttpSection, LogSection, SandboxSection,
  SecretsSection, ServerSection,
};

pub const ENV_BIND: &str = "SCRIPTFLOW_BIND";
pub const ENV_DATABASE_URL: &str = "SCRIPTFLOW_DATABASE_URL";
pub const ENV_ACTION_HANDLER_URL: &str = "SCRIPTFLOW_ACTION_HANDLER_URL";
pub const ENV_QUEUE_URL: &str = "SCRIPTFLOW_QUEUE_URL";

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
  pub server: ServerSection,
  pub database: DatabaseSection,
  pub sandbox: SandboxSection,
  pub http: HttpSection,
  pub log: LogSection,
  pub dispatch: DispatchSection,
  pub secrets: SecretsSection,
}

impl ServiceConfig {
  /// Load the file (if any), apply environment overrides and validate.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config = match path {
      Some(path) => Self::from_file(path)?,
      None => Self::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
  }

  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&contents).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_json::from_str(contents)
  }

  /// Override fields from variables returned by `lookup`. Empty values are
  /// ignored.
  pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
    let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

    if let Some(bind) = get(ENV_BIND) {
      debug!(variable = ENV_BIND, "config override");
      self.server.bind = bind;
    }
    if let Some(url) = get(ENV_DATABASE_URL) {
      debug!(variable = ENV_DATABASE_URL, "config override");
      self.database.url = url;
    }
    if let Some(url) = get(ENV_ACTION_HANDLER_URL) {
      debug!(variable = ENV_ACTION_HANDLER_URL, "config override");
      self.dispatch.action_handler_url = Some(url);
    }
    if let Some(url) = get(ENV_QUEUE_URL) {
      debug!(variable = ENV_QUEUE_URL, "config override");
      self.dispatch.queue_url = Some(url);
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    self.bind_addr()?;

    if self.database.url.trim().is_empty() {
      return Err(ConfigError::invalid("database.url", "must not be empty"));
    }
    if self.sandbox.timeout_ms == 0 {
      return Err(ConfigError::invalid("sandbox.timeout_ms", "must be greater than zero"));
    }
    if self.sandbox.memory_limit_bytes == 0 {
      return Err(ConfigError::invalid(
        "sandbox.memory_limit_bytes",
        "must be greater than zero",
      ));
    }
    if self.sandbox.max_workers == 0 {
      return Err(ConfigError::invalid("sandbox.max_workers", "must be greater than zero"));
    }
    if self.http.timeout_ms == 0 {
      return Err(ConfigError::invalid("http.timeout_ms", "must be greater than zero"));
    }
    if self.http.max_response_bytes == 0 {
      return Err(ConfigError::invalid(
        "http.max_response_bytes",
        "must be greater than zero",
      ));
    }
    if self.dispatch.timeout_ms == 0 {
      return Err(ConfigError::invalid("dispatch.timeout_ms", "must be greater than zero"));
    }

    match self.dispatch.mode {
      DispatchMode::Queue if self.dispatch.queue_capacity == 0 => Err(ConfigError::invalid(
        "dispatch.queue_capacity",
        "must be greater than zero",
      )),
      DispatchMode::Http if is_blank(&self.dispatch.queue_url) => Err(ConfigError::invalid(
        "dispatch.queue_url",
        "required when dispatch.mode is http",
      )),
      DispatchMode::Http if is_blank(&self.dispatch.action_handler_url) => {
        Err(ConfigError::invalid(
          "dispatch.action_handler_url",
          "required when dispatch.mode is http",
        ))
      }
      _ => Ok(()),
    }
  }

  pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
    self
      .server
      .bind
      .parse()
      .map_err(|e: std::net::AddrParseError| ConfigError::invalid("server.bind", e.to_string()))
  }

  pub fn sandbox_limits(&self) -> SandboxLimits {
    SandboxLimits {
      deadline: Duration::from_millis(self.sandbox.timeout_ms),
      memory_limit_bytes: self.sandbox.memory_limit_bytes,
      max_workers: self.sandbox.max_workers,
      ..SandboxLimits::default()
    }
  }

  pub fn http_policy(&self) -> HttpPolicy {
    let timeout = Duration::from_millis(self.http.timeout_ms);
    HttpPolicy {
      default_timeout: timeout,
      max_timeout: timeout,
      default_max_response_bytes: self.http.max_response_bytes,
      max_response_bytes: self.http.max_response_bytes,
      max_requests: self.http.max_requests,
      denied_hosts: self.http.denied_hosts.clone(),
      ..HttpPolicy::default()
    }
  }

  pub fn log_policy(&self) -> LogPolicy {
    LogPolicy {
      max_lines: self.log.max_lines,
      max_message_bytes: self.log.max_message_bytes,
    }
  }

  pub fn dispatch_timeout(&self) -> Duration {
    Duration::from_millis(self.dispatch.timeout_ms)
  }
}

fn is_blank(value: &Option<String>) -> bool {
  value.as_deref().is_none_or(|v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;
  use std::io::Write;

  use super::*;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |name| vars.get(name).cloned()
  }

  #[test]
  fn test_defaults_are_valid() {
    let config = ServiceConfig::default();
    config.validate().unwrap();
    assert_eq!(config.dispatch.mode, DispatchMode::Queue);
    assert_eq!(config.sandbox_limits().deadline, Duration::from_millis(5000));
    assert_eq!(config.http_policy().max_requests, 20);
    assert!(config.secrets.allow_env);
  }

  #[test]
  fn test_partial_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
      file,
      r#"{{"sandbox": {{"timeout_ms": 200}}, "dispatch": {{"mode": "http", "queue_url": "http://queue/tasks", "action_handler_url": "http://handler/run"}}}}"#
    )
    .unwrap();

    let config = ServiceConfig::from_file(file.path()).unwrap();
    assert_eq!(config.sandbox.timeout_ms, 200);
    assert_eq!(config.sandbox.memory_limit_bytes, 64 * 1024 * 1024);
    assert_eq!(config.sandbox_limits().max_workers, 32);
    assert_eq!(config.dispatch.mode, DispatchMode::Http);
    assert_eq!(config.server.bind, "0.0.0.0:8080");
    config.validate().unwrap();
  }

  #[test]
  fn test_empty_file_is_default() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let config = ServiceConfig::from_file(file.path()).unwrap();
    assert_eq!(config, ServiceConfig::default());
  }

  #[test]
  fn test_unknown_field_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"sandbox": {{"timeout": 200}}}}"#).unwrap();
    let err = ServiceConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
  }

  #[test]
  fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = ServiceConfig::from_file(&dir.path().join("nope.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
  }

  #[test]
  fn test_environment_overrides() {
    let mut config = ServiceConfig::default();
    config.apply_overrides(lookup(&[
      (ENV_BIND, "127.0.0.1:9000"),
      (ENV_DATABASE_URL, "sqlite::memory:"),
      (ENV_ACTION_HANDLER_URL, "http://handler/run"),
      (ENV_QUEUE_URL, ""),
    ]));

    assert_eq!(config.server.bind, "127.0.0.1:9000");
    assert_eq!(config.database.url, "sqlite::memory:");
    assert_eq!(
      config.dispatch.action_handler_url.as_deref(),
      Some("http://handler/run")
    );
    assert_eq!(config.dispatch.queue_url, None);
    assert_eq!(config.bind_addr().unwrap().port(), 9000);
  }

  #[test]
  fn test_validation_failures() {
    let mut config = ServiceConfig::default();
    config.sandbox.timeout_ms = 0;
    assert!(matches!(
      config.validate(),
      Err(ConfigError::Invalid { field: "sandbox.timeout_ms", .. })
    ));

    let mut config = ServiceConfig::default();
    config.sandbox.max_workers = 0;
    assert!(matches!(
      config.validate(),
      Err(ConfigError::Invalid { field: "sandbox.max_workers", .. })
    ));

    let mut config = ServiceConfig::default();
    config.server.bind = "not an address".to_string();
    assert!(matches!(
      config.validate(),
      Err(ConfigError::Invalid { field: "server.bind", .. })
    ));

    let mut config = ServiceConfig::default();
    config.dispatch.mode = DispatchMode::Http;
    config.dispatch.action_handler_url = Some("http://handler/run".to_string());
    assert!(matches!(
      config.validate(),
      Err(ConfigError::Invalid { field: "dispatch.queue_url", .. })
    ));
  }

  #[test]
  fn test_policies_follow_config() {
    let mut config = ServiceConfig::default();
    config.http.timeout_ms = 1500;
    config.http.denied_hosts = vec!["internal.example".to_string()];
    config.log.max_lines = 3;

    let http = config.http_policy();
    assert_eq!(http.default_timeout, Duration::from_millis(1500));
    assert_eq!(http.max_timeout, Duration::from_millis(1500));
    assert_eq!(http.denied_hosts, vec!["internal.example".to_string()]);
    assert_eq!(http.allowed_schemes, HttpPolicy::default().allowed_schemes);
    assert_eq!(config.log_policy().max_lines, 3);
  }
}
