use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scriptflow_store::FlowDefinition;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::error::DispatchError;
use crate::task::{ActionTask, DispatchOutcome};
use crate::ActionDispatcher;

/// Dispatcher backed by a bounded in-process queue.
///
/// `enqueue` never blocks: a full or closed queue is reported as not
/// accepted.
#[derive(Debug, Clone)]
pub struct QueueDispatcher {
  sender: mpsc::Sender<ActionTask>,
}

impl QueueDispatcher {
  /// Create the dispatcher and the receiving end for an [`ActionDeliveryWorker`].
  pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ActionTask>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (Self { sender }, receiver)
  }
}

#[async_trait]
impl ActionDispatcher for QueueDispatcher {
  async fn enqueue(&self, flow: &FlowDefinition, result: &serde_json::Value) -> DispatchOutcome {
    let task = ActionTask::for_flow(flow, result);
    let task_id = task.task_id.clone();

    match self.sender.try_send(task) {
      Ok(()) => {
        info!(flow_id = %flow.flow_id, task_id = %task_id, "action queued");
        DispatchOutcome::accepted(task_id)
      }
      Err(TrySendError::Full(_)) => {
        warn!(flow_id = %flow.flow_id, "action queue is full");
        DispatchOutcome::rejected("action queue is full")
      }
      Err(TrySendError::Closed(_)) => {
        error!(flow_id = %flow.flow_id, "action queue is closed");
        DispatchOutcome::rejected("action queue is closed")
      }
    }
  }
}

/// Counters reported when a delivery worker stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
  pub delivered: u64,
  pub failed: u64,
}

/// Drains a [`QueueDispatcher`] queue and POSTs each task as JSON.
///
/// Tasks go to the configured action handler when one is set, otherwise
/// straight to the flow's `action_url`. Failed deliveries are logged and
/// dropped.
pub struct ActionDeliveryWorker {
  receiver: mpsc::Receiver<ActionTask>,
  client: Client,
  handler_url: Option<Url>,
  timeout: Duration,
}

impl ActionDeliveryWorker {
  pub fn new(
    receiver: mpsc::Receiver<ActionTask>,
    handler_url: Option<&str>,
    timeout: Duration,
  ) -> Result<Self, DispatchError> {
    let handler_url = handler_url
      .map(|value| {
        Url::parse(value).map_err(|e| DispatchError::InvalidUrl {
          name: "action_handler_url",
          value: value.to_string(),
          message: e.to_string(),
        })
      })
      .transpose()?;

    Ok(Self {
      receiver,
      client: Client::builder().build()?,
      handler_url,
      timeout,
    })
  }

  /// Deliver tasks until `cancel` fires or every dispatcher is dropped.
  pub async fn run(mut self, cancel: CancellationToken) -> DeliveryStats {
    let mut stats = DeliveryStats::default();

    loop {
      let task = tokio::select! {
        _ = cancel.cancelled() => break,
        task = self.receiver.recv() => match task {
          Some(task) => task,
          None => break,
        },
      };

      match self.deliver(&task).await {
        Ok(()) => stats.delivered += 1,
        Err(_) => stats.failed += 1,
      }
    }

    info!(
      delivered = stats.delivered,
      failed = stats.failed,
      "delivery worker stopped"
    );
    stats
  }

  #[instrument(
    name = "action_deliver",
    skip(self, task),
    fields(task_id = %task.task_id, flow_id = %task.flow_id)
  )]
  async fn deliver(&self, task: &ActionTask) -> Result<(), String> {
    let target = match &self.handler_url {
      Some(url) => url.as_str(),
      None => task.action_url.as_str(),
    };

    let response = self
      .client
      .post(target)
      .timeout(self.timeout)
      .json(task)
      .send()
      .await;

    match response {
      Ok(response) if response.status().is_success() => {
        info!(status = response.status().as_u16(), "action delivered");
        Ok(())
      }
      Ok(response) => {
        let status = response.status().as_u16();
        warn!(status, "action target rejected delivery");
        Err(format!("action target responded with status {status}"))
      }
      Err(e) => {
        warn!(error = %e, "action delivery failed");
        Err(e.to_string())
      }
    }
  }
}
