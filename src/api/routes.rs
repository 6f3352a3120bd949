//! HTTP route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::error::DiagError;
use crate::session::{SessionScheduler, SessionSummary};
use crate::system_info::SystemInfo;

use super::stream;
use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub scheduler: Arc<SessionScheduler>,
}

pub(super) type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Map scheduler errors onto HTTP statuses.
pub(super) fn error_response(err: DiagError) -> (StatusCode, String) {
    let status = match &err {
        DiagError::UnknownTaskIds(_) | DiagError::DuplicateTaskIds(_) | DiagError::NoTasksSelected => {
            StatusCode::BAD_REQUEST
        }
        DiagError::ElevationRequired(_) => StatusCode::FORBIDDEN,
        DiagError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        DiagError::SessionNotTerminal { .. } | DiagError::SessionBusy(_) | DiagError::AlreadyStarted { .. } => {
            StatusCode::CONFLICT
        }
        DiagError::Packaging(_) | DiagError::Io(_) => {
            tracing::error!("Request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

/// Build the router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/system", get(system_info))
        .route("/api/tasks", get(list_tasks))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/:id/cancel", post(cancel_session))
        .route("/api/sessions/:id/results", get(get_results))
        .route("/api/sessions/:id/events", get(stream::session_events))
        .route("/api/sessions/:id/ws", get(stream::session_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config, scheduler: Arc<SessionScheduler>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState { config, scheduler });

    Arc::clone(&state.scheduler).start_cleanup_task();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

/// Wait for a shutdown signal, then cancel every session still running so
/// no helper process outlives the server.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling running sessions...");
    let cancelled = state.scheduler.cancel_all().await;
    if cancelled == 0 {
        tracing::info!("No running sessions to cancel");
    } else {
        tracing::info!("Cancelled {} sessions", cancelled);
    }
    tracing::info!("Graceful shutdown complete");
}

/// Cancel `id` if it is still running after `timeout`.
fn spawn_session_timeout(scheduler: Arc<SessionScheduler>, id: Uuid, timeout: Duration) {
    tokio::spawn(async move {
        if tokio::time::timeout(timeout, scheduler.wait_terminal(id)).await.is_ok() {
            return;
        }
        tracing::warn!(session_id = %id, "Session exceeded {:?}, cancelling", timeout);
        if let Err(e) = scheduler.cancel(id).await {
            tracing::debug!(session_id = %id, "Timeout cancel skipped: {}", e);
        }
    });
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn system_info(State(state): State<Arc<AppState>>) -> Json<SystemInfo> {
    Json(SystemInfo::gather_async(state.scheduler.is_elevated()).await)
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<TaskListResponse> {
    Json(TaskListResponse {
        is_elevated: state.scheduler.is_elevated(),
        tasks: state.scheduler.catalog().infos(),
    })
}

/// Create a session and start it right away.
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionDetailResponse>)> {
    let format = req.output_format.unwrap_or_default();
    let session = state
        .scheduler
        .create_and_start(req.selected_tasks, format)
        .await
        .map_err(error_response)?;

    if let Some(timeout) = state.config.session_timeout {
        spawn_session_timeout(Arc::clone(&state.scheduler), session.id, timeout);
    }

    Ok((StatusCode::CREATED, Json(SessionDetailResponse::from(&session))))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    Json(state.scheduler.list_sessions().await)
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SessionDetailResponse>> {
    let session = state.scheduler.session(id).await.map_err(error_response)?;
    Ok(Json(SessionDetailResponse::from(&session)))
}

async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    let status = state.scheduler.cancel(id).await.map_err(error_response)?;
    Ok(Json(CancelResponse { id, status }))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.scheduler.remove(id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Download the packaged results of a terminal session.
async fn get_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<Response> {
    let packaged = state
        .scheduler
        .package(id, query.format)
        .await
        .map_err(error_response)?;

    let disposition = format!("attachment; filename=\"{}\"", packaged.file_name);
    Ok((
        [
            (header::CONTENT_TYPE, packaged.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        packaged.bytes,
    )
        .into_response())
}
