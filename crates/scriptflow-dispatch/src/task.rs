use scriptflow_store::FlowDefinition;
use serde::{Deserialize, Serialize};

/// Unit of work handed to the action handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionTask {
  pub task_id: String,
  pub flow_id: String,
  pub action_url: String,
  pub user_id: String,
  /// Value returned by the script.
  pub result: serde_json::Value,
}

impl ActionTask {
  pub fn for_flow(flow: &FlowDefinition, result: &serde_json::Value) -> Self {
    Self {
      task_id: uuid::Uuid::new_v4().to_string(),
      flow_id: flow.flow_id.clone(),
      action_url: flow.action_url.clone(),
      user_id: flow.user_id.clone(),
      result: result.clone(),
    }
  }
}

/// Whether a task was accepted for delivery. Says nothing about delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
  pub accepted: bool,
  pub error: Option<String>,
  pub task_id: Option<String>,
}

impl DispatchOutcome {
  pub fn accepted(task_id: impl Into<String>) -> Self {
    Self {
      accepted: true,
      error: None,
      task_id: Some(task_id.into()),
    }
  }

  pub fn rejected(error: impl Into<String>) -> Self {
    Self {
      accepted: false,
      error: Some(error.into()),
      task_id: None,
    }
  }
}
