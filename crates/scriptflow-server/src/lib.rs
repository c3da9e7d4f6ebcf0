//! Webhook HTTP surface for scriptflow.
//!
//! Two routes:
//!
//! - `POST /api/webhook/{flow_id}` runs one invocation and answers with the
//!   orchestrator's status code and JSON body
//! - `GET /health` answers `OK`

mod error;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use scriptflow_orchestrator::Orchestrator;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ServerError;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
  pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
  pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
    Self { orchestrator }
  }
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/api/webhook/{flow_id}", post(routes::webhook))
    .route("/health", get(routes::health))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Serve `router` on `addr` until `shutdown` is cancelled.
pub async fn serve(
  addr: SocketAddr,
  router: Router,
  shutdown: CancellationToken,
) -> Result<(), ServerError> {
  let listener = TcpListener::bind(addr)
    .await
    .map_err(|source| ServerError::Bind { addr, source })?;
  info!(%addr, "webhook server listening");

  axum::serve(listener, router)
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(ServerError::Serve)?;

  info!("webhook server stopped");
  Ok(())
}
