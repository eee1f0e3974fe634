//! HTTP server implementation using Axum.

use std::future::Future;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::InstanceError;
use crate::executor::ExecOutput;
use crate::state::{AppState, FlagCheck, InstanceStatus};
use crate::validator;

// Request/Response types
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceResponse {
    id: String,
    url: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
struct SubmitFlagRequest {
    #[serde(default, deserialize_with = "string_or_empty")]
    flag: String,
}

#[derive(Deserialize, Default)]
struct RunCommandRequest {
    #[serde(default, deserialize_with = "string_or_empty")]
    command: String,
}

/// Non-string JSON values count as empty text.
fn string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        _ => String::new(),
    })
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/instances", post(create_instance))
        .route(
            "/api/instances/:id",
            get(instance_status).delete(delete_instance),
        )
        .route("/api/instances/:id/submit", post(submit_flag))
        .route("/api/instances/:id/command", post(run_command))
        .route("/instance/:id", get(instance_page))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn create_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CreateInstanceResponse>, InstanceError> {
    let status = state.create_instance().await?;
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");

    Ok(Json(CreateInstanceResponse {
        url: format!("http://{}/instance/{}", host, status.id),
        id: status.id,
        expires_at: status.expires_at,
    }))
}

async fn instance_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceStatus>, InstanceError> {
    Ok(Json(state.instance_status(&id).await?))
}

async fn delete_instance(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.store.delete(&id).await;
    StatusCode::NO_CONTENT
}

async fn submit_flag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<SubmitFlagRequest>>,
) -> Result<Json<FlagCheck>, InstanceError> {
    let Json(req) = body.unwrap_or_default();
    Ok(Json(state.submit_flag(&id, &req.flag).await?))
}

async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RunCommandRequest>>,
) -> Result<Json<ExecOutput>, InstanceError> {
    let Json(req) = body.unwrap_or_default();
    Ok(Json(state.run_command(&id, &req.command).await?))
}

async fn instance_page(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get(&id).await {
        Ok(instance) => Html(render_page(
            instance.id(),
            instance.flag(),
            instance.expires_at(),
        ))
        .into_response(),
        Err(e) => (e.status_code(), e.to_string()).into_response(),
    }
}

/// The flag is left in an HTML comment on purpose: finding it in the page
/// source is the exercise.
fn render_page(id: &str, flag: &str, expires_at: DateTime<Utc>) -> String {
    let allowed = validator::allowed_programs().collect::<Vec<_>>().join(", ");
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <title>Practice Instance</title>
  </head>
  <body>
    <h1>Welcome to your instance</h1>
    <p>There is a hidden flag somewhere in this page. Happy hunting.</p>
    <p id="timer" data-expires-at="{expires_ms}">Instance expires at {expires}</p>
    <p>Restricted terminal. Allowed: {allowed}</p>
    <p>Submit flags to <code>/api/instances/{id}/submit</code>, run commands via <code>/api/instances/{id}/command</code>.</p>
    <!-- {flag} -->
  </body>
</html>
"#,
        id = id,
        flag = flag,
        allowed = allowed,
        expires = expires_at.to_rfc3339(),
        expires_ms = expires_at.timestamp_millis(),
    )
}
