use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scriptflow_store::FlowDefinition;
use serde::Serialize;
use tracing::{error, info};
use url::Url;

use crate::error::DispatchError;
use crate::task::{ActionTask, DispatchOutcome};
use crate::ActionDispatcher;

/// Request body sent to the task queue: deliver `body` to `target_url` later.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedRequest<'a> {
  target_url: &'a str,
  http_method: &'static str,
  body: &'a ActionTask,
}

/// Dispatcher that hands tasks to an external HTTP task queue.
///
/// A 2xx from the queue means accepted. Both URLs are checked when the
/// dispatcher is built so misconfiguration shows up at startup, not on the
/// first invocation.
#[derive(Debug, Clone)]
pub struct HttpTaskDispatcher {
  client: Client,
  queue_url: Url,
  handler_url: Url,
  timeout: Duration,
}

impl HttpTaskDispatcher {
  pub fn new(
    queue_url: Option<&str>,
    handler_url: Option<&str>,
    timeout: Duration,
  ) -> Result<Self, DispatchError> {
    let queue_url = parse_required("queue_url", queue_url)?;
    let handler_url = parse_required("action_handler_url", handler_url)?;

    Ok(Self {
      client: Client::builder().build()?,
      queue_url,
      handler_url,
      timeout,
    })
  }

  pub fn queue_url(&self) -> &Url {
    &self.queue_url
  }
}

fn parse_required(name: &'static str, value: Option<&str>) -> Result<Url, DispatchError> {
  let value = value
    .filter(|v| !v.trim().is_empty())
    .ok_or(DispatchError::MissingConfig(name))?;
  Url::parse(value).map_err(|e| DispatchError::InvalidUrl {
    name,
    value: value.to_string(),
    message: e.to_string(),
  })
}

#[async_trait]
impl ActionDispatcher for HttpTaskDispatcher {
  async fn enqueue(&self, flow: &FlowDefinition, result: &serde_json::Value) -> DispatchOutcome {
    let task = ActionTask::for_flow(flow, result);
    let request = QueuedRequest {
      target_url: self.handler_url.as_str(),
      http_method: "POST",
      body: &task,
    };

    let response = self
      .client
      .post(self.queue_url.clone())
      .timeout(self.timeout)
      .json(&request)
      .send()
      .await;

    match response {
      Ok(response) if response.status().is_success() => {
        info!(flow_id = %flow.flow_id, task_id = %task.task_id, "action queued");
        DispatchOutcome::accepted(task.task_id)
      }
      Ok(response) => {
        let status = response.status().as_u16();
        error!(flow_id = %flow.flow_id, status, "task queue refused the action");
        DispatchOutcome::rejected(format!(
          "Failed to queue task: task queue responded with status {status}"
        ))
      }
      Err(e) => {
        error!(flow_id = %flow.flow_id, error = %e, "task queue unreachable");
        DispatchOutcome::rejected(format!("Failed to queue task: {e}"))
      }
    }
  }
}
