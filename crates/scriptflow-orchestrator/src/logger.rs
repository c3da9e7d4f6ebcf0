use std::sync::Arc;

use scriptflow_store::{ExecutionLogEntry, LogSink};
use tracing::{error, info};

/// Writes the single log entry of an invocation.
///
/// The entry is echoed as an `execution_log` tracing event and then
/// appended to the sink. A failing sink is reported through `tracing` and
/// never affects the invocation.
#[derive(Clone)]
pub struct ExecutionLogger {
  sink: Arc<dyn LogSink>,
}

impl ExecutionLogger {
  pub fn new(sink: Arc<dyn LogSink>) -> Self {
    Self { sink }
  }

  pub async fn record(&self, entry: &ExecutionLogEntry) {
    match serde_json::to_string(entry) {
      Ok(json) => info!(
        log_id = %entry.log_id,
        flow_id = %entry.flow_id,
        status = %entry.status,
        entry = %json,
        "execution_log"
      ),
      Err(e) => error!(
        log_id = %entry.log_id,
        error = %e,
        "execution log entry is not serializable"
      ),
    }

    if let Err(e) = self.sink.append(entry).await {
      error!(
        log_id = %entry.log_id,
        flow_id = %entry.flow_id,
        error = %e,
        "failed to persist execution log"
      );
    }
  }
}
