// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Worker task api.
//!
//! ```text
//! GET  /api/v1/worker/task/{instance_id}      200 task | 204 none yet | 404
//! POST /api/v1/worker/response/{instance_id}  200 | 404 | 409
//! GET  /api/v1/state                          pool snapshot
//! ```

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use protocol::WorkerTaskResponse;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::PushError;
use crate::runner::{Runner, RESPONSE_PATH, TASK_PATH};

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        let status = match &self {
            PushError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            PushError::UnexpectedTask { .. } | PushError::NotPulled(_) => StatusCode::CONFLICT,
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(runner: Runner) -> Router {
    Router::new()
        .route(&format!("{TASK_PATH}/:instance_id"), get(pull_task))
        .route(&format!("{RESPONSE_PATH}/:instance_id"), post(push_response))
        .route("/api/v1/state", get(state))
        .with_state(runner)
}

async fn pull_task(
    State(runner): State<Runner>,
    Path(instance_id): Path<String>,
) -> Result<Response, PushError> {
    let wait = runner.settings().pull_wait;
    match runner.pull_task(&instance_id, wait).await? {
        Some(task) => {
            debug!(%instance_id, task_id = %task.task_id, "handing task to backend");
            Ok(Json(task).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn push_response(
    State(runner): State<Runner>,
    Path(instance_id): Path<String>,
    Json(response): Json<WorkerTaskResponse>,
) -> Result<StatusCode, PushError> {
    runner
        .push_response(&instance_id, response)
        .await
        .map_err(|e| {
            warn!(%instance_id, "rejected backend response: {e}");
            e
        })?;
    Ok(StatusCode::OK)
}

async fn state(State(runner): State<Runner>) -> impl IntoResponse {
    Json(runner.snapshot().await)
}

/// Bind `addr` and serve the worker api until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, runner: Runner, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind worker api on {addr}"))?;
    serve_on(listener, runner, shutdown).await
}

/// Serve the worker api on an already bound listener.
pub async fn serve_on<F>(listener: TcpListener, runner: Runner, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("worker api listening on {}", addr);

    axum::serve(listener, router(runner).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("worker api server failed")
}
