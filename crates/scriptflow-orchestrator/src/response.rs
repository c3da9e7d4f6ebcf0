use serde::Serialize;

/// Terminal classification reported to the webhook caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
  /// Flow missing, inactive, or the store could not be read.
  Rejected,
  /// Secrets could not be resolved or the script failed.
  Failed,
  /// The script succeeded but its result was not accepted for dispatch.
  DispatchFailed,
  CompletedAndDispatched,
}

impl Classification {
  pub fn status_code(self) -> u16 {
    match self {
      Classification::Rejected => 404,
      Classification::Failed | Classification::DispatchFailed => 500,
      Classification::CompletedAndDispatched => 202,
    }
  }
}

/// Response body for one webhook invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
  #[serde(rename = "status")]
  pub classification: Classification,
  #[serde(skip)]
  pub status_code: u16,
  pub flow_id: String,
  pub invocation_id: String,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<serde_json::Value>,
}

impl InvocationResponse {
  pub(crate) fn new(
    classification: Classification,
    flow_id: &str,
    invocation_id: &str,
    message: impl Into<String>,
    result: Option<serde_json::Value>,
  ) -> Self {
    Self {
      classification,
      status_code: classification.status_code(),
      flow_id: flow_id.to_string(),
      invocation_id: invocation_id.to_string(),
      message: message.into(),
      result,
    }
  }
}
