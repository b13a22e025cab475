use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::AppState;
use crate::core::control::{ControlError, WarmupStatus};
use crate::core::model::{AccountId, MailLogEntry, SessionId, WarmupSession};

const DEFAULT_LOG_LIMIT: u32 = 50;

/// Runs the control API until the shutdown token fires.
pub async fn run_http_server(listen: &str, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let router = Router::new()
        .route("/warmup/start", post(start))
        .route("/warmup/pause", post(pause))
        .route("/warmup/resume", post(resume))
        .route("/warmup/stop", post(stop))
        .route("/warmup/status/{domain_account_id}", get(status))
        .route("/warmup/sessions", get(sessions))
        .route("/warmup/sessions/{session_id}/logs", get(session_logs))
        .route("/warmup/logs", get(recent_logs))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind http listener on {listen}"))?;
    info!("control api listening: listen={}", listen);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope { success: true, data: Some(data), error: None, message: None })
}

fn ok_with_message<T: Serialize>(
    data: T,
    message: &str,
) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
        message: Some(message.to_string()),
    })
}

struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::DomainNotFound(_)
            | ControlError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };

        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
            message: None,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct DomainAccountBody {
    domain_account_id: AccountId,
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    domain_account_id: Option<AccountId>,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<u32>,
}

async fn start(
    State(state): State<AppState>,
    Json(body): Json<DomainAccountBody>,
) -> Result<Json<Envelope<WarmupSession>>, ApiError> {
    let session = state.control.start(body.domain_account_id).await?;
    Ok(ok_with_message(session, "warm-up started"))
}

async fn pause(
    State(state): State<AppState>,
    Json(body): Json<DomainAccountBody>,
) -> Result<Json<Envelope<WarmupSession>>, ApiError> {
    let session = state.control.pause(body.domain_account_id).await?;
    Ok(ok_with_message(session, "warm-up paused"))
}

async fn resume(
    State(state): State<AppState>,
    Json(body): Json<DomainAccountBody>,
) -> Result<Json<Envelope<WarmupSession>>, ApiError> {
    let session = state.control.resume(body.domain_account_id).await?;
    Ok(ok_with_message(session, "warm-up resumed"))
}

async fn stop(
    State(state): State<AppState>,
    Json(body): Json<DomainAccountBody>,
) -> Result<Json<Envelope<Option<WarmupSession>>>, ApiError> {
    let stopped = state.control.stop(body.domain_account_id).await?;
    let message =
        if stopped.is_some() { "warm-up stopped" } else { "nothing to stop" };
    Ok(ok_with_message(stopped, message))
}

async fn status(
    State(state): State<AppState>,
    Path(domain_account_id): Path<AccountId>,
) -> Result<Json<Envelope<WarmupStatus>>, ApiError> {
    let status = state.control.status(domain_account_id).await?;
    Ok(ok(status))
}

async fn sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Envelope<Vec<WarmupSession>>>, ApiError> {
    let sessions = state.control.sessions(query.domain_account_id).await?;
    Ok(ok(sessions))
}

async fn session_logs(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Envelope<Vec<MailLogEntry>>>, ApiError> {
    let logs = state.control.session_logs(session_id).await?;
    Ok(ok(logs))
}

async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Envelope<Vec<MailLogEntry>>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let logs = state.control.recent_logs(limit).await?;
    Ok(ok(logs))
}
