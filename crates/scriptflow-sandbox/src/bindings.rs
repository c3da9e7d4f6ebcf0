//! Declarative table of everything a script can see.
//!
//! A runtime installs exactly the entries of a [`BindingTable`] into a fresh
//! script environment and nothing else. Tables are built per invocation and
//! never shared.

use scriptflow_host_http::HttpShim;
use scriptflow_host_log::ScriptLog;

use crate::executor::ScriptRequest;
use crate::secrets::ResolvedSecrets;

pub const PAYLOAD: &str = "payload";
pub const ENV: &str = "env";
pub const LOG: &str = "log";
pub const HTTP: &str = "http";
pub const JSON: &str = "json";
pub const SLEEP: &str = "sleep";

/// A single capability or data binding.
#[derive(Debug, Clone)]
pub enum Binding {
  /// Structured data the script may read but not modify.
  ReadOnlyData(serde_json::Value),
  /// Flat secrets copy the script may read and modify; changes stay local.
  Secrets(ResolvedSecrets),
  /// Logger capability.
  Log(ScriptLog),
  /// HTTP capability.
  Http(HttpShim),
  /// Pure JSON encode/decode helpers.
  Json,
  /// Asynchronous sleep, counted against the deadline.
  Sleep,
}

/// Ordered name → binding table.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
  entries: Vec<(String, Binding)>,
}

impl BindingTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// The standard set of bindings for one flow invocation.
  pub fn for_invocation(request: &ScriptRequest, log: ScriptLog, http: HttpShim) -> Self {
    let mut table = Self::new();
    table.insert(PAYLOAD, Binding::ReadOnlyData(request.payload.clone()));
    table.insert(ENV, Binding::Secrets(request.secrets.clone()));
    table.insert(LOG, Binding::Log(log));
    table.insert(HTTP, Binding::Http(http));
    table.insert(JSON, Binding::Json);
    table.insert(SLEEP, Binding::Sleep);
    table
  }

  /// Insert a binding, replacing any existing entry with the same name.
  pub fn insert(&mut self, name: impl Into<String>, binding: Binding) {
    let name = name.into();
    match self.entries.iter_mut().find(|(n, _)| *n == name) {
      Some(entry) => entry.1 = binding,
      None => self.entries.push((name, binding)),
    }
  }

  pub fn remove(&mut self, name: &str) -> Option<Binding> {
    let index = self.entries.iter().position(|(n, _)| n == name)?;
    Some(self.entries.remove(index).1)
  }

  pub fn get(&self, name: &str) -> Option<&Binding> {
    self
      .entries
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, binding)| binding)
  }

  pub fn names(&self) -> Vec<&str> {
    self.entries.iter().map(|(n, _)| n.as_str()).collect()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
    self.entries.iter().map(|(n, b)| (n.as_str(), b))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
