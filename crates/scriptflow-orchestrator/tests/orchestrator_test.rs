use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scriptflow_dispatch::{ActionDispatcher, DispatchOutcome};
use scriptflow_orchestrator::{Classification, Orchestrator, OrchestratorDeps};
use scriptflow_sandbox::{ExecutionOutcome, FailureKind, ScriptExecutor, ScriptRequest};
use scriptflow_sandbox_lua::LuaSandbox;
use scriptflow_secrets::StaticSecretResolver;
use scriptflow_store::{
  ExecutionLogEntry, FlowDefinition, InMemoryStore, LogSink, LogStatus, StoreError,
};
use serde_json::json;

/// Returns a fixed outcome and remembers every request.
struct FakeExecutor {
  outcome: ExecutionOutcome,
  requests: Mutex<Vec<ScriptRequest>>,
}

impl FakeExecutor {
  fn returning(outcome: ExecutionOutcome) -> Arc<Self> {
    Arc::new(Self {
      outcome,
      requests: Mutex::new(Vec::new()),
    })
  }

  fn requests(&self) -> Vec<ScriptRequest> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl ScriptExecutor for FakeExecutor {
  async fn execute(&self, request: ScriptRequest) -> ExecutionOutcome {
    self.requests.lock().unwrap().push(request);
    self.outcome.clone()
  }
}

/// Returns a fixed dispatch outcome and remembers every result.
struct FakeDispatcher {
  outcome: DispatchOutcome,
  results: Mutex<Vec<serde_json::Value>>,
}

impl FakeDispatcher {
  fn returning(outcome: DispatchOutcome) -> Arc<Self> {
    Arc::new(Self {
      outcome,
      results: Mutex::new(Vec::new()),
    })
  }

  fn results(&self) -> Vec<serde_json::Value> {
    self.results.lock().unwrap().clone()
  }
}

#[async_trait]
impl ActionDispatcher for FakeDispatcher {
  async fn enqueue(&self, _flow: &FlowDefinition, result: &serde_json::Value) -> DispatchOutcome {
    self.results.lock().unwrap().push(result.clone());
    self.outcome.clone()
  }
}

struct FailingSink;

#[async_trait]
impl LogSink for FailingSink {
  async fn append(&self, _entry: &ExecutionLogEntry) -> Result<(), StoreError> {
    Err(StoreError::NotFound("log table".to_string()))
  }

  async fn list_logs(&self, _flow_id: &str) -> Result<Vec<ExecutionLogEntry>, StoreError> {
    Ok(Vec::new())
  }
}

struct Harness {
  store: Arc<InMemoryStore>,
  executor: Arc<FakeExecutor>,
  dispatcher: Arc<FakeDispatcher>,
  orchestrator: Orchestrator,
}

fn flow() -> FlowDefinition {
  FlowDefinition::new(
    "flow-1",
    "user-1",
    "return tostring(payload.value) .. env.SECRET_KEY",
    "https://example.com/action",
  )
  .with_secret("SECRET_KEY", "vault/secret-key")
}

fn resolver() -> StaticSecretResolver {
  let mut resolver = StaticSecretResolver::default();
  resolver.insert("vault/secret-key", "abc");
  resolver.insert("vault/token", "tok-quiet-sunrise");
  resolver
}

fn harness(
  flows: Vec<FlowDefinition>,
  outcome: ExecutionOutcome,
  dispatch: DispatchOutcome,
) -> Harness {
  let store = Arc::new(InMemoryStore::with_flows(flows));
  let executor = FakeExecutor::returning(outcome);
  let dispatcher = FakeDispatcher::returning(dispatch);
  let orchestrator = Orchestrator::new(OrchestratorDeps {
    flows: store.clone(),
    secrets: Arc::new(resolver()),
    executor: executor.clone(),
    dispatcher: dispatcher.clone(),
    logs: store.clone(),
  });
  Harness {
    store,
    executor,
    dispatcher,
    orchestrator,
  }
}

async fn only_log(store: &InMemoryStore) -> ExecutionLogEntry {
  let logs = store.logs().await;
  assert_eq!(logs.len(), 1, "expected exactly one log entry: {:?}", logs);
  logs.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_success_is_dispatched_and_logged() {
  let h = harness(
    vec![flow()],
    ExecutionOutcome::success(json!("10abc")),
    DispatchOutcome::accepted("task-1"),
  );

  let response = h.orchestrator.invoke("flow-1", br#"{"value": 10}"#).await;
  assert_eq!(response.classification, Classification::CompletedAndDispatched);
  assert_eq!(response.status_code, 202);
  assert_eq!(response.result, Some(json!("10abc")));

  let requests = h.executor.requests();
  assert_eq!(requests.len(), 1);
  assert_eq!(requests[0].payload, json!({"value": 10}));
  assert_eq!(requests[0].secrets.get("SECRET_KEY"), Some("abc"));
  assert_eq!(requests[0].secrets.get("FLOW_ID"), Some("flow-1"));
  assert_eq!(requests[0].invocation_id, response.invocation_id);

  assert_eq!(h.dispatcher.results(), vec![json!("10abc")]);

  let log = only_log(&h.store).await;
  assert_eq!(log.status, LogStatus::Success);
  assert_eq!(log.user_id, "user-1");
  assert_eq!(log.action_status, Some(202));
  assert_eq!(log.result.map(|r| r.0), Some(json!("10abc")));
  assert_eq!(log.invocation_id, response.invocation_id);
}

#[tokio::test]
async fn test_missing_flow_is_rejected_without_running() {
  let h = harness(
    vec![],
    ExecutionOutcome::success(json!(1)),
    DispatchOutcome::accepted("task-1"),
  );

  let response = h.orchestrator.invoke("nope", br#"{}"#).await;
  assert_eq!(response.classification, Classification::Rejected);
  assert_eq!(response.status_code, 404);
  assert!(response.message.contains("nope"));

  assert!(h.executor.requests().is_empty());
  assert!(h.dispatcher.results().is_empty());

  let log = only_log(&h.store).await;
  assert_eq!(log.status, LogStatus::Fail);
  assert_eq!(log.user_id, "unknown");
  assert!(log.error.is_some());
}

#[tokio::test]
async fn test_inactive_flow_is_rejected() {
  let h = harness(
    vec![flow().inactive()],
    ExecutionOutcome::success(json!(1)),
    DispatchOutcome::accepted("task-1"),
  );

  let response = h.orchestrator.invoke("flow-1", b"{}").await;
  assert_eq!(response.classification, Classification::Rejected);
  assert!(h.executor.requests().is_empty());
}

#[tokio::test]
async fn test_dispatch_failure_keeps_result_in_log() {
  let h = harness(
    vec![flow()],
    ExecutionOutcome::success(json!({"ok": true})),
    DispatchOutcome::rejected("queue unavailable"),
  );

  let response = h.orchestrator.invoke("flow-1", b"{}").await;
  assert_eq!(response.classification, Classification::DispatchFailed);
  assert_eq!(response.status_code, 500);
  assert!(response.message.contains("queue unavailable"));

  let log = only_log(&h.store).await;
  assert_eq!(log.status, LogStatus::ActionFail);
  assert_eq!(log.action_status, Some(500));
  assert_eq!(log.result.map(|r| r.0), Some(json!({"ok": true})));
  assert_eq!(
    log.error.as_deref(),
    Some("Action Dispatch Error: queue unavailable")
  );
}

#[tokio::test]
async fn test_timeout_is_logged_as_timeout() {
  let h = harness(
    vec![flow()],
    ExecutionOutcome::timeout(),
    DispatchOutcome::accepted("task-1"),
  );

  let response = h.orchestrator.invoke("flow-1", b"{}").await;
  assert_eq!(response.classification, Classification::Failed);
  assert_eq!(response.status_code, 500);
  assert!(response.message.starts_with("Execution Error:"));
  assert!(h.dispatcher.results().is_empty());

  let log = only_log(&h.store).await;
  assert_eq!(log.status, LogStatus::Timeout);
  assert_eq!(log.error_kind.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_script_error_is_logged_as_fail() {
  let h = harness(
    vec![flow()],
    ExecutionOutcome::failure(FailureKind::ScriptError, "SyntaxError: flow:1: unexpected symbol"),
    DispatchOutcome::accepted("task-1"),
  );

  let response = h.orchestrator.invoke("flow-1", b"{}").await;
  assert_eq!(response.classification, Classification::Failed);

  let log = only_log(&h.store).await;
  assert_eq!(log.status, LogStatus::Fail);
  assert_eq!(log.error_kind.as_deref(), Some("script_error"));
  assert!(log.error.unwrap_or_default().contains("SyntaxError"));
}

#[tokio::test]
async fn test_unresolvable_secret_fails_before_execution() {
  let flow = flow().with_secret("OTHER", "vault/unknown");
  let h = harness(
    vec![flow],
    ExecutionOutcome::success(json!(1)),
    DispatchOutcome::accepted("task-1"),
  );

  let response = h.orchestrator.invoke("flow-1", b"{}").await;
  assert_eq!(response.classification, Classification::Failed);
  assert!(response.message.starts_with("Secret resolution failed"));
  assert!(h.executor.requests().is_empty());

  let log = only_log(&h.store).await;
  assert_eq!(log.status, LogStatus::Fail);
  assert_eq!(log.error_kind.as_deref(), Some("secret_resolution_error"));
}

#[tokio::test]
async fn test_malformed_body_degrades_to_empty_payload() {
  let h = harness(
    vec![flow()],
    ExecutionOutcome::success(json!(1)),
    DispatchOutcome::accepted("task-1"),
  );

  let response = h.orchestrator.invoke("flow-1", b"{not json").await;
  assert_eq!(response.classification, Classification::CompletedAndDispatched);
  assert_eq!(h.executor.requests()[0].payload, json!({}));

  let response = h.orchestrator.invoke("flow-1", b"").await;
  assert_eq!(response.classification, Classification::CompletedAndDispatched);
  assert_eq!(h.executor.requests()[1].payload, json!({}));
}

#[tokio::test]
async fn test_parse_error_is_reported_when_rejected() {
  let h = harness(
    vec![],
    ExecutionOutcome::success(json!(1)),
    DispatchOutcome::accepted("task-1"),
  );

  h.orchestrator.invoke("missing", b"{not json").await;
  let log = only_log(&h.store).await;
  assert!(log.error.unwrap_or_default().contains("not valid JSON"));
  assert_eq!(log.payload.0, json!({}));
}

#[tokio::test]
async fn test_secret_values_never_reach_the_log() {
  let h = harness(
    vec![flow().with_secret("TOKEN", "vault/token")],
    ExecutionOutcome::failure(FailureKind::ScriptError, "RuntimeError: boom"),
    DispatchOutcome::accepted("task-1"),
  );

  h.orchestrator.invoke("flow-1", br#"{"value": 1}"#).await;
  assert_eq!(
    h.executor.requests()[0].secrets.get("TOKEN"),
    Some("tok-quiet-sunrise")
  );
  let log = only_log(&h.store).await;
  let serialized = serde_json::to_string(&log).unwrap();
  assert!(!serialized.contains("tok-quiet-sunrise"));
}

#[tokio::test]
async fn test_failing_log_sink_does_not_change_the_response() {
  let store = Arc::new(InMemoryStore::with_flows([flow()]));
  let orchestrator = Orchestrator::new(OrchestratorDeps {
    flows: store,
    secrets: Arc::new(resolver()),
    executor: FakeExecutor::returning(ExecutionOutcome::success(json!(1))),
    dispatcher: FakeDispatcher::returning(DispatchOutcome::accepted("task-1")),
    logs: Arc::new(FailingSink),
  });

  let response = orchestrator.invoke("flow-1", b"{}").await;
  assert_eq!(response.classification, Classification::CompletedAndDispatched);
}

#[tokio::test]
async fn test_end_to_end_with_lua_sandbox() {
  let store = Arc::new(InMemoryStore::with_flows([flow()]));
  let dispatcher = FakeDispatcher::returning(DispatchOutcome::accepted("task-1"));
  let orchestrator = Orchestrator::new(OrchestratorDeps {
    flows: store.clone(),
    secrets: Arc::new(resolver()),
    executor: Arc::new(LuaSandbox::default()),
    dispatcher: dispatcher.clone(),
    logs: store.clone(),
  });

  let response = orchestrator.invoke("flow-1", br#"{"value": 10}"#).await;
  assert_eq!(response.classification, Classification::CompletedAndDispatched);
  assert_eq!(response.result, Some(json!("10abc")));
  assert_eq!(dispatcher.results(), vec![json!("10abc")]);
  assert_eq!(only_log(&store).await.status, LogStatus::Success);
}
