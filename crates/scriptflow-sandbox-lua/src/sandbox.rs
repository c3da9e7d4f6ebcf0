use std::sync::Arc;
use std::thread;
use std::time::Instant;

use async_trait::async_trait;
use mlua::{ChunkMode, Function, HookTriggers, Lua, LuaOptions, StdLib, Value as LuaValue, VmState};
use scriptflow_host_http::{HttpPolicy, HttpShim};
use scriptflow_host_log::{LogPolicy, ScriptLog};
use scriptflow_sandbox::{
  BindingTable, ExecutionOutcome, FailureKind, SandboxLimits, ScriptExecutor, ScriptRequest,
};
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, error, instrument, warn};

use crate::classify::{SandboxInterrupt, classify, describe};
use crate::environment::{self, ScriptEnvironment};

/// VM instructions between deadline checks.
const INSTRUCTION_CHECK_INTERVAL: u32 = 1000;

/// Runs flow scripts in Lua 5.4.
///
/// Every call gets a brand-new Lua state on a dedicated thread, so nothing a
/// script does survives into the next invocation. CPU-bound code is stopped
/// by an instruction hook that checks the deadline; pending awaits are
/// dropped by a timeout around the call. If a worker still fails to report
/// within `watchdog_grace` after the deadline, the host returns a timeout
/// and abandons the thread.
///
/// Clones share one pool of `max_workers` worker slots. A slot is held until
/// its thread exits, so abandoned threads still count against the pool.
#[derive(Debug, Clone)]
pub struct LuaSandbox {
  limits: SandboxLimits,
  http_policy: HttpPolicy,
  log_policy: LogPolicy,
  workers: Arc<Semaphore>,
}

impl Default for LuaSandbox {
  fn default() -> Self {
    Self::new(
      SandboxLimits::default(),
      HttpPolicy::default(),
      LogPolicy::default(),
    )
  }
}

impl LuaSandbox {
  pub fn new(limits: SandboxLimits, http_policy: HttpPolicy, log_policy: LogPolicy) -> Self {
    let workers = Arc::new(Semaphore::new(limits.max_workers.max(1)));
    Self {
      limits,
      http_policy,
      log_policy,
      workers,
    }
  }

  pub fn limits(&self) -> &SandboxLimits {
    &self.limits
  }
}

#[async_trait]
impl ScriptExecutor for LuaSandbox {
  #[instrument(
    name = "sandbox_execute",
    skip(self, request),
    fields(flow_id = %request.flow_id, invocation_id = %request.invocation_id)
  )]
  async fn execute(&self, request: ScriptRequest) -> ExecutionOutcome {
    let started = Instant::now();
    let deadline = started + self.limits.deadline;

    let slot = self.workers.clone().acquire_owned();
    let permit = match tokio::time::timeout(self.limits.deadline, slot).await {
      Ok(Ok(permit)) => permit,
      Ok(Err(_)) | Err(_) => {
        warn!(
          max_workers = self.limits.max_workers,
          "no sandbox worker became free before the deadline"
        );
        return ExecutionOutcome::timeout();
      }
    };

    let sandbox = self.clone();
    let (tx, rx) = oneshot::channel();

    let spawned = thread::Builder::new()
      .name("scriptflow-sandbox".to_string())
      .spawn(move || {
        let _ = tx.send(sandbox.run_isolated(request, deadline));
        drop(permit);
      });
    if let Err(e) = spawned {
      error!(error = %e, "failed to spawn sandbox worker");
      return ExecutionOutcome::failure(
        FailureKind::ScriptError,
        format!("failed to start sandbox: {e}"),
      );
    }

    let watchdog = self.limits.deadline + self.limits.watchdog_grace;
    let outcome = match tokio::time::timeout(watchdog, rx).await {
      Ok(Ok(outcome)) => outcome,
      Ok(Err(_)) => {
        error!("sandbox worker exited without reporting an outcome");
        ExecutionOutcome::failure(FailureKind::ScriptError, "sandbox worker crashed")
      }
      Err(_) => {
        warn!(
          watchdog_ms = watchdog.as_millis() as u64,
          "sandbox worker missed the deadline, abandoning it"
        );
        ExecutionOutcome::timeout()
      }
    };

    debug!(
      elapsed_ms = started.elapsed().as_millis() as u64,
      success = outcome.is_success(),
      failure_kind = ?outcome.failure_kind(),
      "sandbox run finished"
    );
    outcome
  }
}

impl LuaSandbox {
  /// Body of the worker thread: a private runtime driving one script.
  fn run_isolated(&self, request: ScriptRequest, deadline: Instant) -> ExecutionOutcome {
    let runtime = match tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
    {
      Ok(runtime) => runtime,
      Err(e) => {
        return ExecutionOutcome::failure(
          FailureKind::ScriptError,
          format!("failed to start sandbox runtime: {e}"),
        );
      }
    };
    runtime.block_on(self.run_script(request, deadline))
  }

  async fn run_script(&self, request: ScriptRequest, deadline: Instant) -> ExecutionOutcome {
    let log = ScriptLog::new(
      &request.flow_id,
      &request.invocation_id,
      self.log_policy.clone(),
    );
    let client = match HttpShim::build_client(&self.http_policy) {
      Ok(client) => client,
      Err(e) => {
        return ExecutionOutcome::failure(
          FailureKind::ScriptError,
          format!("failed to prepare http capability: {e}"),
        );
      }
    };
    let http = HttpShim::new(client, self.http_policy.clone(), log.clone());
    let bindings = BindingTable::for_invocation(&request, log, http);

    let lua = match new_state(self.limits.memory_limit_bytes, deadline) {
      Ok(lua) => lua,
      Err(e) => return classify(&e, Instant::now() >= deadline),
    };

    let (function, env) = match prepare(&lua, &request.source, &bindings, deadline) {
      Ok(prepared) => prepared,
      Err(e) => return classify(&e, Instant::now() >= deadline),
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    let call = function.call_async(());
    let result: Result<mlua::Result<LuaValue>, _> = tokio::time::timeout(remaining, call).await;

    // A refused capability decides the outcome even if the script caught it.
    if result.is_ok()
      && let Some(outcome) = env.violation.outcome()
    {
      return outcome;
    }

    match result {
      Err(_) => ExecutionOutcome::timeout(),
      Ok(Err(e)) => classify(&e, Instant::now() >= deadline),
      Ok(Ok(value)) => match env.converter.to_json(&value) {
        Ok(json) => ExecutionOutcome::success(json),
        Err(e) if Instant::now() >= deadline => {
          debug!(error = %e, "result conversion interrupted by deadline");
          ExecutionOutcome::timeout()
        }
        Err(e) => ExecutionOutcome::failure(
          FailureKind::ScriptError,
          format!("invalid return value: {}", describe(&e)),
        ),
      },
    }
  }
}

/// A Lua state with the safe standard libraries, a memory cap and the
/// deadline hook installed.
fn new_state(memory_limit_bytes: usize, deadline: Instant) -> mlua::Result<Lua> {
  let libs = StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8;
  let lua = Lua::new_with(libs, LuaOptions::default())?;
  lua.set_memory_limit(memory_limit_bytes)?;

  // Must be installed before any thread is created so coroutines inherit it.
  lua.set_hook(
    HookTriggers::new().every_nth_instruction(INSTRUCTION_CHECK_INTERVAL),
    move |_, _| {
      if Instant::now() >= deadline {
        Err(mlua::Error::external(SandboxInterrupt::DeadlineExceeded))
      } else {
        Ok(VmState::Continue)
      }
    },
  );

  Ok(lua)
}

/// Install the environment and compile the user source into a function.
fn prepare(
  lua: &Lua,
  source: &str,
  bindings: &BindingTable,
  deadline: Instant,
) -> mlua::Result<(Function, ScriptEnvironment)> {
  let env = environment::build(lua, bindings, deadline)?;
  let function = lua
    .load(source)
    .set_name("=flow")
    .set_mode(ChunkMode::Text)
    .set_environment(env.table.clone())
    .into_function()?;
  Ok((function, env))
}
