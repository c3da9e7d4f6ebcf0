use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use scriptflow_dispatch::ActionDispatcher;
use scriptflow_sandbox::{
  ExecutionOutcome, FailureKind, ResolvedSecrets, ScriptExecutor, ScriptFailure, ScriptRequest,
};
use scriptflow_secrets::SecretResolver;
use scriptflow_store::{ExecutionLogEntry, FlowDefinition, FlowStore, Json, LogSink, LogStatus};
use tracing::{Span, error, info, instrument, warn};

use crate::logger::ExecutionLogger;
use crate::response::{Classification, InvocationResponse};

/// Recorded as the user when the flow could not be loaded.
const UNKNOWN_USER: &str = "unknown";

/// Collaborators of the orchestrator, constructed by the caller.
#[derive(Clone)]
pub struct OrchestratorDeps {
  pub flows: Arc<dyn FlowStore>,
  pub secrets: Arc<dyn SecretResolver>,
  pub executor: Arc<dyn ScriptExecutor>,
  pub dispatcher: Arc<dyn ActionDispatcher>,
  pub logs: Arc<dyn LogSink>,
}

/// Runs one webhook invocation end to end.
///
/// Stages run in order with no retries: parse, load, resolve secrets,
/// execute, dispatch. Every path ends in exactly one [`InvocationResponse`]
/// and exactly one execution log entry.
pub struct Orchestrator {
  flows: Arc<dyn FlowStore>,
  secrets: Arc<dyn SecretResolver>,
  executor: Arc<dyn ScriptExecutor>,
  dispatcher: Arc<dyn ActionDispatcher>,
  logger: ExecutionLogger,
}

/// Per-invocation state shared by every terminal branch.
struct Invocation {
  invocation_id: String,
  flow_id: String,
  user_id: String,
  payload: serde_json::Value,
  parse_error: Option<String>,
  started: Instant,
}

impl Invocation {
  fn entry(&self, status: LogStatus) -> ExecutionLogEntry {
    ExecutionLogEntry {
      log_id: uuid::Uuid::new_v4().to_string(),
      invocation_id: self.invocation_id.clone(),
      flow_id: self.flow_id.clone(),
      user_id: self.user_id.clone(),
      status,
      error_kind: None,
      duration_ms: self.started.elapsed().as_millis() as i64,
      payload: Json(self.payload.clone()),
      result: None,
      error: None,
      action_status: None,
      timestamp: Utc::now(),
    }
  }

  fn response(
    &self,
    classification: Classification,
    message: impl Into<String>,
    result: Option<serde_json::Value>,
  ) -> InvocationResponse {
    InvocationResponse::new(
      classification,
      &self.flow_id,
      &self.invocation_id,
      message,
      result,
    )
  }
}

impl Orchestrator {
  pub fn new(deps: OrchestratorDeps) -> Self {
    Self {
      flows: deps.flows,
      secrets: deps.secrets,
      executor: deps.executor,
      dispatcher: deps.dispatcher,
      logger: ExecutionLogger::new(deps.logs),
    }
  }

  /// Handle a webhook call for `flow_id` with the raw request `body`.
  #[instrument(
    name = "invoke",
    skip(self, body),
    fields(flow_id = %flow_id, invocation_id = tracing::field::Empty)
  )]
  pub async fn invoke(&self, flow_id: &str, body: &[u8]) -> InvocationResponse {
    let started = Instant::now();
    let invocation_id = uuid::Uuid::new_v4().to_string();
    Span::current().record("invocation_id", invocation_id.as_str());

    let (payload, parse_error) = parse_payload(body);
    if let Some(e) = &parse_error {
      warn!(error = %e, "request body is not valid JSON, continuing with an empty payload");
    }

    let mut invocation = Invocation {
      invocation_id,
      flow_id: flow_id.to_string(),
      user_id: UNKNOWN_USER.to_string(),
      payload,
      parse_error,
      started,
    };

    let flow = match self.flows.load_flow(flow_id).await {
      Ok(Some(flow)) => flow,
      Ok(None) => return self.reject(&invocation, None).await,
      Err(e) => {
        error!(error = %e, "flow store lookup failed");
        return self.reject(&invocation, Some(e.to_string())).await;
      }
    };
    invocation.user_id = flow.user_id.clone();
    info!(user_id = %flow.user_id, "flow loaded");

    let secrets = match self.secrets.resolve(&flow.secret_references).await {
      Ok(secrets) => secrets.with_flow_id(&flow.flow_id),
      Err(e) => {
        error!(error = %e, "secret resolution failed");
        let failure = ScriptFailure {
          kind: FailureKind::SecretResolutionError,
          message: format!("Secret resolution failed: {e}"),
        };
        return self.fail(&invocation, failure).await;
      }
    };
    info!(secret_names = ?secrets.names(), "secrets resolved");

    match self.execute(&invocation, &flow, secrets).await {
      ExecutionOutcome::Success(result) => self.dispatch(&invocation, &flow, result).await,
      ExecutionOutcome::Failure(failure) => self.fail(&invocation, failure).await,
    }
  }

  async fn execute(
    &self,
    invocation: &Invocation,
    flow: &FlowDefinition,
    secrets: ResolvedSecrets,
  ) -> ExecutionOutcome {
    let request = ScriptRequest {
      invocation_id: invocation.invocation_id.clone(),
      flow_id: flow.flow_id.clone(),
      source: flow.user_code.clone(),
      payload: invocation.payload.clone(),
      secrets,
    };
    self.executor.execute(request).await
  }

  async fn reject(&self, invocation: &Invocation, cause: Option<String>) -> InvocationResponse {
    let message = format!(
      "Flow {} not found, inactive, or DB connection failed.",
      invocation.flow_id
    );
    warn!("flow rejected");

    let mut error = match cause {
      Some(cause) => format!("{message} ({cause})"),
      None => message.clone(),
    };
    if let Some(parse_error) = &invocation.parse_error {
      error.push_str(&format!(" Request body was not valid JSON: {parse_error}"));
    }

    let mut entry = invocation.entry(LogStatus::Fail);
    entry.error = Some(error);
    self.logger.record(&entry).await;

    invocation.response(Classification::Rejected, message, None)
  }

  async fn fail(&self, invocation: &Invocation, failure: ScriptFailure) -> InvocationResponse {
    let status = if is_timeout(&failure) {
      LogStatus::Timeout
    } else {
      LogStatus::Fail
    };
    error!(kind = %failure.kind, error = %failure.message, "execution failed");

    let mut entry = invocation.entry(status);
    entry.error_kind = Some(failure.kind.to_string());
    entry.error = Some(failure.message.clone());
    self.logger.record(&entry).await;

    let message = match failure.kind {
      FailureKind::SecretResolutionError => failure.message,
      _ => format!("Execution Error: {}", failure.message),
    };
    invocation.response(Classification::Failed, message, None)
  }

  async fn dispatch(
    &self,
    invocation: &Invocation,
    flow: &FlowDefinition,
    result: serde_json::Value,
  ) -> InvocationResponse {
    let outcome = self.dispatcher.enqueue(flow, &result).await;

    if outcome.accepted {
      info!(task_id = ?outcome.task_id, "script succeeded, action dispatched");
      let mut entry = invocation.entry(LogStatus::Success);
      entry.result = Some(Json(result.clone()));
      entry.action_status = Some(202);
      self.logger.record(&entry).await;

      return invocation.response(
        Classification::CompletedAndDispatched,
        "Script executed successfully. Action dispatched to task queue.",
        Some(result),
      );
    }

    let dispatch_error = outcome
      .error
      .unwrap_or_else(|| "dispatcher did not accept the action".to_string());
    error!(error = %dispatch_error, "action dispatch failed");

    let mut entry = invocation.entry(LogStatus::ActionFail);
    entry.result = Some(Json(result));
    entry.error = Some(format!("Action Dispatch Error: {dispatch_error}"));
    entry.action_status = Some(500);
    self.logger.record(&entry).await;

    invocation.response(
      Classification::DispatchFailed,
      format!("Failed to queue action: {dispatch_error}"),
      None,
    )
  }
}

/// Empty body is `{}`; malformed JSON is `{}` plus the parse error.
fn parse_payload(body: &[u8]) -> (serde_json::Value, Option<String>) {
  if body.iter().all(u8::is_ascii_whitespace) {
    return (serde_json::json!({}), None);
  }
  match serde_json::from_slice(body) {
    Ok(value) => (value, None),
    Err(e) => (serde_json::json!({}), Some(e.to_string())),
  }
}

fn is_timeout(failure: &ScriptFailure) -> bool {
  if failure.kind == FailureKind::Timeout {
    return true;
  }
  let message = failure.message.to_lowercase();
  message.contains("timeout") || message.contains("timed out")
}
