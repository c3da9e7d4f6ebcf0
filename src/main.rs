use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scriptflow_config::{DispatchMode, ServiceConfig};
use scriptflow_dispatch::{
  ActionDeliveryWorker, ActionDispatcher, HttpTaskDispatcher, QueueDispatcher,
};
use scriptflow_orchestrator::{Orchestrator, OrchestratorDeps};
use scriptflow_sandbox::{ExecutionOutcome, ResolvedSecrets, ScriptExecutor, ScriptRequest};
use scriptflow_sandbox_lua::LuaSandbox;
use scriptflow_secrets::{ChainSecretResolver, EnvSecretResolver, StaticSecretResolver};
use scriptflow_server::AppState;
use scriptflow_store::{FlowDefinition, FlowStore, LogSink, SqliteStore};

/// How long queued actions may keep draining after the server stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Scriptflow - run user scripts in response to webhooks
#[derive(Parser)]
#[command(name = "scriptflow")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the config file (default: ~/.scriptflow/config.json if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
  log_format: LogFormat,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
  Text,
  Json,
}

#[derive(Subcommand)]
enum Commands {
  /// Serve the webhook endpoint
  Serve,

  /// Run a script once against a payload read from stdin
  Run {
    /// Path to the Lua script
    script: PathBuf,

    /// Secret made available as env.NAME
    #[arg(long = "secret", value_name = "NAME=VALUE")]
    secrets: Vec<String>,

    /// Flow id reported to the script as env.FLOW_ID
    #[arg(long, default_value = "local")]
    flow_id: String,
  },

  /// Manage stored flows
  Flow {
    #[command(subcommand)]
    target: FlowTarget,
  },
}

#[derive(Subcommand)]
enum FlowTarget {
  /// Insert or replace a flow from a JSON file
  Put {
    flow_file: PathBuf,
  },

  /// Print a stored flow
  Get {
    flow_id: String,
  },

  /// Print the execution log of a flow, newest first
  Logs {
    flow_id: String,

    #[arg(long, default_value_t = 20)]
    limit: usize,
  },
}

/// Flow file accepted by `flow put`.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FlowFile {
  flow_id: String,
  user_id: String,
  /// Inline source; mutually exclusive with `user_code_file`.
  user_code: Option<String>,
  /// Source path, relative to the flow file.
  user_code_file: Option<PathBuf>,
  action_url: String,
  #[serde(default)]
  secret_references: HashMap<String, String>,
  #[serde(default = "default_active")]
  is_active: bool,
}

fn default_active() -> bool {
  true
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.log_format);

  match cli.command {
    Some(Commands::Serve) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(serve(cli.config))?;
    }
    Some(Commands::Run {
      script,
      secrets,
      flow_id,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_script(cli.config, script, secrets, flow_id))?;
    }
    Some(Commands::Flow { target }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(manage_flow(cli.config, target))?;
    }
    None => {
      println!("scriptflow - use --help to see available commands");
    }
  }

  Ok(())
}

fn init_tracing(format: LogFormat) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(io::stderr);

  match format {
    LogFormat::Json => builder.json().init(),
    LogFormat::Text => builder.init(),
  }
}

fn load_config(path: Option<PathBuf>) -> Result<ServiceConfig> {
  let path = path.or_else(|| {
    dirs::home_dir()
      .map(|home| home.join(".scriptflow").join("config.json"))
      .filter(|p| p.exists())
  });
  if let Some(path) = &path {
    info!(path = %path.display(), "loading config");
  }
  ServiceConfig::load(path.as_deref()).context("invalid configuration")
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
  let config = load_config(config_path)?;
  let addr = config.bind_addr()?;

  let store = Arc::new(
    SqliteStore::connect(&config.database.url)
      .await
      .with_context(|| format!("failed to open database {}", config.database.url))?,
  );
  let secrets = build_resolver(&config).await?;
  let sandbox = LuaSandbox::new(
    config.sandbox_limits(),
    config.http_policy(),
    config.log_policy(),
  );

  let worker_cancel = CancellationToken::new();
  let (dispatcher, worker) = match config.dispatch.mode {
    DispatchMode::Queue => {
      let (dispatcher, receiver) = QueueDispatcher::channel(config.dispatch.queue_capacity);
      let worker = ActionDeliveryWorker::new(
        receiver,
        config.dispatch.action_handler_url.as_deref(),
        config.dispatch_timeout(),
      )
      .context("failed to create delivery worker")?;
      let handle = tokio::spawn(worker.run(worker_cancel.clone()));
      let dispatcher: Arc<dyn ActionDispatcher> = Arc::new(dispatcher);
      (dispatcher, Some(handle))
    }
    DispatchMode::Http => {
      let dispatcher = HttpTaskDispatcher::new(
        config.dispatch.queue_url.as_deref(),
        config.dispatch.action_handler_url.as_deref(),
        config.dispatch_timeout(),
      )
      .context("failed to create task queue dispatcher")?;
      info!(queue_url = %dispatcher.queue_url(), "dispatching actions to task queue");
      let dispatcher: Arc<dyn ActionDispatcher> = Arc::new(dispatcher);
      (dispatcher, None)
    }
  };

  let orchestrator = Orchestrator::new(OrchestratorDeps {
    flows: store.clone(),
    secrets: Arc::new(secrets),
    executor: Arc::new(sandbox),
    dispatcher,
    logs: store,
  });
  let router = scriptflow_server::router(AppState::new(Arc::new(orchestrator)));

  let shutdown = CancellationToken::new();
  let signal = shutdown.clone();
  tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => info!("shutdown requested"),
      Err(e) => {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
      }
    }
    signal.cancel();
  });

  scriptflow_server::serve(addr, router, shutdown).await?;

  // The router owned the last dispatcher, so the worker drains and exits.
  if let Some(mut handle) = worker {
    let stats = match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
      Ok(stats) => stats?,
      Err(_) => {
        warn!("action queue did not drain in time, stopping delivery worker");
        worker_cancel.cancel();
        handle.await?
      }
    };
    info!(delivered = stats.delivered, failed = stats.failed, "action delivery finished");
  }

  Ok(())
}

async fn build_resolver(config: &ServiceConfig) -> Result<ChainSecretResolver> {
  let mut chain = ChainSecretResolver::new();
  if let Some(path) = &config.secrets.file {
    let resolver = StaticSecretResolver::from_file(path)
      .await
      .with_context(|| format!("failed to load secrets file: {}", path.display()))?;
    chain = chain.with(resolver);
  }
  if config.secrets.allow_env {
    chain = chain.with(EnvSecretResolver);
  }
  if chain.is_empty() {
    warn!("no secret sources configured, flows with secret references will fail");
  }
  Ok(chain)
}

async fn run_script(
  config_path: Option<PathBuf>,
  script: PathBuf,
  secret_args: Vec<String>,
  flow_id: String,
) -> Result<()> {
  let config = load_config(config_path)?;

  let source = tokio::fs::read_to_string(&script)
    .await
    .with_context(|| format!("failed to read script file: {}", script.display()))?;

  let mut secrets = ResolvedSecrets::new();
  for arg in &secret_args {
    let (name, value) = arg
      .split_once('=')
      .with_context(|| format!("secret must be NAME=VALUE, got '{}'", arg))?;
    secrets.insert(name, value);
  }

  let payload = read_payload_from_stdin()?;

  let sandbox = LuaSandbox::new(
    config.sandbox_limits(),
    config.http_policy(),
    config.log_policy(),
  );
  let request = ScriptRequest {
    invocation_id: format!("run-{}", std::process::id()),
    flow_id: flow_id.clone(),
    source,
    payload,
    secrets: secrets.with_flow_id(&flow_id),
  };

  let outcome = sandbox.execute(request).await;
  println!("{}", serde_json::to_string_pretty(&outcome)?);

  match outcome {
    ExecutionOutcome::Success(_) => Ok(()),
    ExecutionOutcome::Failure(failure) => bail!("script failed ({})", failure.kind),
  }
}

async fn manage_flow(config_path: Option<PathBuf>, target: FlowTarget) -> Result<()> {
  let config = load_config(config_path)?;
  let store = SqliteStore::connect(&config.database.url)
    .await
    .with_context(|| format!("failed to open database {}", config.database.url))?;

  match target {
    FlowTarget::Put { flow_file } => {
      let flow = read_flow_file(&flow_file).await?;
      store.put_flow(&flow).await.context("failed to store flow")?;
      eprintln!("Stored flow: {}", flow.flow_id);
    }
    FlowTarget::Get { flow_id } => {
      let flow = store
        .get_flow(&flow_id)
        .await
        .with_context(|| format!("failed to load flow '{}'", flow_id))?;
      println!("{}", serde_json::to_string_pretty(&flow)?);
    }
    FlowTarget::Logs { flow_id, limit } => {
      let logs = store
        .list_logs(&flow_id)
        .await
        .with_context(|| format!("failed to list logs for flow '{}'", flow_id))?;
      let logs: Vec<_> = logs.into_iter().take(limit).collect();
      println!("{}", serde_json::to_string_pretty(&logs)?);
    }
  }

  Ok(())
}

async fn read_flow_file(path: &Path) -> Result<FlowDefinition> {
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read flow file: {}", path.display()))?;
  let file: FlowFile = serde_json::from_str(&content)
    .with_context(|| format!("failed to parse flow file: {}", path.display()))?;

  let user_code = match (file.user_code, file.user_code_file) {
    (Some(code), None) => code,
    (None, Some(code_file)) => {
      let code_path = path
        .parent()
        .map(|dir| dir.join(&code_file))
        .unwrap_or(code_file);
      tokio::fs::read_to_string(&code_path)
        .await
        .with_context(|| format!("failed to read script file: {}", code_path.display()))?
    }
    _ => bail!("flow file must set exactly one of user_code and user_code_file"),
  };

  let mut flow = FlowDefinition::new(file.flow_id, file.user_id, user_code, file.action_url);
  for (name, reference) in file.secret_references {
    flow = flow.with_secret(name, reference);
  }
  if !file.is_active {
    flow = flow.inactive();
  }
  Ok(flow)
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    Ok(serde_json::json!({}))
  } else {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read payload from stdin")?;

    if input.trim().is_empty() {
      Ok(serde_json::json!({}))
    } else {
      serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
    }
  }
}
