//! Secret resolution.
//!
//! A flow stores secret *references* (`name → reference`). A
//! [`SecretResolver`] turns the whole set into plaintext
//! [`ResolvedSecrets`] for one invocation, or fails as a unit.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use scriptflow_sandbox::ResolvedSecrets;
use tracing::debug;

/// Prefix of references read from the host environment.
pub const ENV_PREFIX: &str = "env:";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
  /// No resolver knows this reference. Carries the secret name, not the reference.
  #[error("secret '{name}' could not be resolved")]
  Unresolved { name: String },

  #[error("failed to read secrets file {path}: {message}")]
  File { path: String, message: String },
}

/// Turns secret references into values.
#[async_trait]
pub trait SecretResolver: Send + Sync {
  /// Resolve every reference. Fails if any single one cannot be resolved.
  async fn resolve(
    &self,
    references: &HashMap<String, String>,
  ) -> Result<ResolvedSecrets, SecretError> {
    let mut resolved = ResolvedSecrets::new();
    for (name, reference) in references {
      match self.lookup(reference).await? {
        Some(value) => resolved.insert(name.clone(), value),
        None => return Err(SecretError::Unresolved { name: name.clone() }),
      }
    }
    debug!(names = ?resolved.names(), "secrets resolved");
    Ok(resolved)
  }

  /// Look up a single reference; `None` when this resolver does not know it.
  async fn lookup(&self, reference: &str) -> Result<Option<String>, SecretError>;
}

/// Resolves references from a fixed map.
#[derive(Default, Clone)]
pub struct StaticSecretResolver {
  values: HashMap<String, String>,
}

impl std::fmt::Debug for StaticSecretResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StaticSecretResolver")
      .field("references", &self.values.len())
      .finish()
  }
}

impl StaticSecretResolver {
  pub fn new(values: HashMap<String, String>) -> Self {
    Self { values }
  }

  /// Load a flat JSON object of `reference → value`.
  pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SecretError> {
    let path = path.as_ref();
    let file_error = |message: String| SecretError::File {
      path: path.display().to_string(),
      message,
    };

    let contents = tokio::fs::read_to_string(path)
      .await
      .map_err(|e| file_error(e.to_string()))?;
    let values: HashMap<String, String> =
      serde_json::from_str(&contents).map_err(|e| file_error(e.to_string()))?;
    Ok(Self::new(values))
  }

  pub fn insert(&mut self, reference: impl Into<String>, value: impl Into<String>) {
    self.values.insert(reference.into(), value.into());
  }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
  async fn lookup(&self, reference: &str) -> Result<Option<String>, SecretError> {
    Ok(self.values.get(reference).cloned())
  }
}

/// Resolves `env:NAME` references from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretResolver;

#[async_trait]
impl SecretResolver for EnvSecretResolver {
  async fn lookup(&self, reference: &str) -> Result<Option<String>, SecretError> {
    Ok(
      reference
        .strip_prefix(ENV_PREFIX)
        .and_then(|name| std::env::var(name).ok()),
    )
  }
}

/// Asks each resolver in turn; the first one that knows a reference wins.
#[derive(Default)]
pub struct ChainSecretResolver {
  resolvers: Vec<Box<dyn SecretResolver>>,
}

impl ChainSecretResolver {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, resolver: impl SecretResolver + 'static) -> Self {
    self.resolvers.push(Box::new(resolver));
    self
  }

  pub fn len(&self) -> usize {
    self.resolvers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.resolvers.is_empty()
  }
}

#[async_trait]
impl SecretResolver for ChainSecretResolver {
  async fn lookup(&self, reference: &str) -> Result<Option<String>, SecretError> {
    for resolver in &self.resolvers {
      if let Some(value) = resolver.lookup(reference).await? {
        return Ok(Some(value));
      }
    }
    Ok(None)
  }
}
