//! Plaintext secrets for a single invocation.

use std::collections::BTreeMap;
use std::fmt;

/// Name of the synthesized entry identifying the running flow.
pub const FLOW_ID_KEY: &str = "FLOW_ID";

/// Secret name → plaintext value, scoped to one invocation.
///
/// `Debug` prints names only. Not serializable.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolvedSecrets {
  values: BTreeMap<String, String>,
}

impl ResolvedSecrets {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.values.insert(name.into(), value.into());
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.values.get(name).map(String::as_str)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.values.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Secret names, sorted. Safe to log.
  pub fn names(&self) -> Vec<&str> {
    self.values.keys().map(String::as_str).collect()
  }

  /// Add the synthesized `FLOW_ID` entry, replacing any user-supplied one.
  pub fn with_flow_id(mut self, flow_id: &str) -> Self {
    self.values.insert(FLOW_ID_KEY.to_string(), flow_id.to_string());
    self
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

impl FromIterator<(String, String)> for ResolvedSecrets {
  fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
    Self {
      values: iter.into_iter().collect(),
    }
  }
}

impl fmt::Debug for ResolvedSecrets {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResolvedSecrets")
      .field("names", &self.names())
      .finish()
  }
}
