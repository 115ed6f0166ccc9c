use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use sandbox::{ResourceLimits, SandboxConfig};
use sandbox_proto::{
    CALL_TIMESTAMPS_PATH, Call, CallRecord, CommandResponse, Empty, HEALTH_PATH, HealthResponse,
    PROCESS_PATH, seconds,
};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::batch;
use crate::error::{ServerError, ServerResult};
use crate::lifecycle::Lifecycle;
use crate::timeline::{CallTimeline, unix_now};

/// Shared handler state. Clone is a pair of Arc refcount bumps.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<Lifecycle>,
    pub timeline: Arc<CallTimeline>,
    /// Limits for `start_container` calls that omit them.
    pub defaults: ResourceLimits,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(PROCESS_PATH, post(process))
        .route(CALL_TIMESTAMPS_PATH, get(call_timestamps))
        .route(HEALTH_PATH, get(health))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

async fn process(
    Extension(state): Extension<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ServerResult<Response> {
    let Json(body) = body.map_err(|e| ServerError::InvalidRequest(e.body_text()))?;
    let call: Call =
        serde_json::from_value(body).map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
    if call.container_name().is_empty() {
        return Err(ServerError::InvalidRequest("container_name is empty".into()));
    }

    let function = call.function();
    debug!(function, sandbox_id = %call.container_name(), "rpc");
    let start = unix_now();
    let result = dispatch(&state, call).await;
    state.timeline.record(function, start, unix_now()).await;
    result
}

async fn dispatch(state: &AppState, call: Call) -> ServerResult<Response> {
    let lifecycle = &state.lifecycle;
    match call {
        Call::StartContainer {
            container_name,
            init_command,
            memory_gb,
            cpus,
        } => {
            let config = SandboxConfig {
                id: container_name,
                init_command,
                resources: ResourceLimits {
                    memory_gb: memory_gb.unwrap_or(state.defaults.memory_gb),
                    cpus: cpus.unwrap_or(state.defaults.cpus),
                },
            };
            lifecycle.start_provisioning(config).await?;
            Ok(Json(Empty {}).into_response())
        }
        Call::RunCommand {
            container_name,
            command,
            timeout_seconds,
        } => {
            let timeout = seconds("timeout_seconds", timeout_seconds)?;
            let result = lifecycle.execute(&container_name, &command, timeout).await?;
            Ok(Json(CommandResponse::from(result)).into_response())
        }
        Call::RunCommandsSequentially {
            container_name,
            commands,
            total_timeout_seconds,
            per_command_timeout_seconds,
        } => {
            let total = seconds("total_timeout_seconds", total_timeout_seconds)?;
            let per_command = seconds("per_command_timeout_seconds", per_command_timeout_seconds)?;
            let results =
                batch::run_sequentially(lifecycle, &container_name, &commands, total, per_command)
                    .await?;
            let body: Vec<CommandResponse> = results.into_iter().map(Into::into).collect();
            Ok(Json(body).into_response())
        }
        Call::StopContainer { container_name } => {
            lifecycle.stop(&container_name).await?;
            Ok(Json(Empty {}).into_response())
        }
    }
}

async fn call_timestamps(Extension(state): Extension<AppState>) -> Json<Vec<CallRecord>> {
    Json(state.timeline.snapshot().await)
}

async fn health(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        sandboxes: state.lifecycle.len().await,
    })
}
