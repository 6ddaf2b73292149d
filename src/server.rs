//! HTTP boundary for driving the supervisor.
//!
//! Three routes, one resource:
//! - `POST /gateway/ensure`  - make the gateway usable
//! - `POST /gateway/restart` - force a teardown and fresh start
//! - `GET  /gateway/state`   - cached state, no side effects
//!
//! Handlers hold no logic beyond translating supervisor results into
//! status codes and JSON bodies. Every failure body has the same shape,
//! `{"ok": false, "error": "..."}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::state::StateSnapshot;
use crate::supervisor::GatewaySupervisor;

/// Body returned by successful ensure/restart calls.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResponse {
    pub ok: bool,
    pub ready: bool,
    pub process_id: Option<String>,
}

impl From<StateSnapshot> for LifecycleResponse {
    fn from(snapshot: StateSnapshot) -> Self {
        Self {
            ok: true,
            ready: snapshot.ready,
            process_id: snapshot.process_id,
        }
    }
}

/// Body returned by any failing call.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

/// Build the supervisor router.
pub fn router(supervisor: Arc<GatewaySupervisor>) -> Router {
    Router::new()
        .route("/gateway/ensure", post(ensure_gateway))
        .route("/gateway/restart", post(restart_gateway))
        .route("/gateway/state", get(gateway_state))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// Bind `addr` and serve the supervisor API until interrupted.
pub async fn serve(addr: SocketAddr, supervisor: Arc<GatewaySupervisor>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Supervisor API listening on {addr}");
    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}

async fn ensure_gateway(
    State(supervisor): State<Arc<GatewaySupervisor>>,
) -> Result<Json<LifecycleResponse>, HandlerError> {
    match supervisor.ensure().await {
        Ok(snapshot) => Ok(Json(snapshot.into())),
        Err(ensure_error) => {
            error!(%ensure_error, "Ensure request failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(ensure_error.to_string())),
            ))
        }
    }
}

async fn restart_gateway(
    State(supervisor): State<Arc<GatewaySupervisor>>,
) -> Result<Json<LifecycleResponse>, HandlerError> {
    match supervisor.restart().await {
        Ok(snapshot) => Ok(Json(snapshot.into())),
        Err(restart_error) => {
            error!(%restart_error, "Restart request failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(restart_error.to_string())),
            ))
        }
    }
}

async fn gateway_state(
    State(supervisor): State<Arc<GatewaySupervisor>>,
) -> Json<StateSnapshot> {
    Json(supervisor.state().await)
}

async fn not_found() -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("not found")),
    )
}
