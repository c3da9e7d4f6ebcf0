use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{ExecutionLogEntry, FlowDefinition, FlowStore, LogSink, StoreError};

/// Process-local store for tests and one-off script runs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
  flows: RwLock<HashMap<String, FlowDefinition>>,
  logs: RwLock<Vec<ExecutionLogEntry>>,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_flows(flows: impl IntoIterator<Item = FlowDefinition>) -> Self {
    let flows = flows
      .into_iter()
      .map(|flow| (flow.flow_id.clone(), flow))
      .collect();
    Self {
      flows: RwLock::new(flows),
      logs: RwLock::default(),
    }
  }

  /// Every entry appended so far, in append order.
  pub async fn logs(&self) -> Vec<ExecutionLogEntry> {
    self.logs.read().await.clone()
  }
}

#[async_trait]
impl FlowStore for InMemoryStore {
  async fn load_flow(&self, flow_id: &str) -> Result<Option<FlowDefinition>, StoreError> {
    let flows = self.flows.read().await;
    Ok(flows.get(flow_id).filter(|flow| flow.is_active).cloned())
  }

  async fn get_flow(&self, flow_id: &str) -> Result<FlowDefinition, StoreError> {
    let flows = self.flows.read().await;
    flows
      .get(flow_id)
      .cloned()
      .ok_or_else(|| StoreError::NotFound(format!("flow {flow_id}")))
  }

  async fn put_flow(&self, flow: &FlowDefinition) -> Result<(), StoreError> {
    let mut flows = self.flows.write().await;
    flows.insert(flow.flow_id.clone(), flow.clone());
    Ok(())
  }
}

#[async_trait]
impl LogSink for InMemoryStore {
  async fn append(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
    self.logs.write().await.push(entry.clone());
    Ok(())
  }

  async fn list_logs(&self, flow_id: &str) -> Result<Vec<ExecutionLogEntry>, StoreError> {
    let logs = self.logs.read().await;
    Ok(
      logs
        .iter()
        .rev()
        .filter(|entry| entry.flow_id == flow_id)
        .cloned()
        .collect(),
    )
  }
}
