//! Action dispatch.
//!
//! After a script succeeds its result is handed to an [`ActionDispatcher`],
//! which only has to accept the task for later delivery. Whether the action
//! target was reached is reported separately by whatever drains the queue.
//!
//! - [`QueueDispatcher`] + [`ActionDeliveryWorker`]: in-process bounded queue
//! - [`HttpTaskDispatcher`]: hands tasks to an external task-queue endpoint

mod error;
mod http;
mod queue;
mod task;

pub use error::DispatchError;
pub use http::HttpTaskDispatcher;
pub use queue::{ActionDeliveryWorker, DeliveryStats, QueueDispatcher};
pub use task::{ActionTask, DispatchOutcome};

use async_trait::async_trait;
use scriptflow_store::FlowDefinition;

/// Accepts script results for asynchronous delivery.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
  /// Queue `result` for delivery to the flow's action. Never waits on the
  /// action target itself.
  async fn enqueue(&self, flow: &FlowDefinition, result: &serde_json::Value) -> DispatchOutcome;
}
