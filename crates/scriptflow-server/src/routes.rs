use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::AppState;

/// `POST /api/webhook/{flow_id}`: run the flow against the raw body.
///
/// The body is passed through untouched; the orchestrator decides how to
/// treat empty or malformed JSON.
pub async fn webhook(
  State(state): State<AppState>,
  Path(flow_id): Path<String>,
  body: Bytes,
) -> Response {
  let response = state.orchestrator.invoke(&flow_id, &body).await;
  let status =
    StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  (status, Json(response)).into_response()
}

pub async fn health() -> &'static str {
  "OK"
}
