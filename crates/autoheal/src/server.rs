//! HTTP surfaces.
//!
//! - Orchestrator: receives alerts, exposes in-flight remediations and the
//!   audit trail.
//! - Node agent: runs one attempt per `POST /api/v1/execute` through the
//!   local [`NodeExecutor`].

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatch::{DispatchCoordinator, FinalStatus};
use crate::executor::NodeExecutor;
use crate::types::ExecuteRequest;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the orchestrator router.
pub fn orchestrator_router(coordinator: Arc<DispatchCoordinator>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/v1/alerts", post(alert_handler))
        .route("/api/v1/remediations", get(remediations_handler))
        .route("/api/v1/audit", get(audit_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(coordinator)
}

/// Build the node agent router.
pub fn agent_router(executor: Arc<NodeExecutor>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/v1/execute", post(execute_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(executor)
}

/// Serve `app` on `addr` until the process is stopped.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(app: Router, addr: &str, name: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("autoheal {name} listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Response to an inbound alert.
#[derive(Debug, Serialize, Deserialize)]
pub struct AlertResponse {
    pub status: ResponseStatus,
    pub node_id: Option<String>,
    /// Id of the decided action
    pub action_id: Option<Uuid>,
    pub action: Option<String>,
    pub rationale: Option<String>,
    /// Reason the alert was rejected
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// Decision recorded, remediation running in the background
    Accepted,
    /// Alert could not be normalized
    Rejected,
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    node_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Decide synchronously, remediate in the background.
async fn alert_handler(
    State(coordinator): State<Arc<DispatchCoordinator>>,
    body: String,
) -> impl IntoResponse {
    let (alert, action) = match coordinator.intake(&body).await {
        Ok(decision) => decision,
        Err(e) => {
            warn!("Rejected alert: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(AlertResponse {
                    status: ResponseStatus::Rejected,
                    node_id: None,
                    action_id: None,
                    action: None,
                    rationale: None,
                    reason: Some(e.to_string()),
                }),
            );
        }
    };

    let response = AlertResponse {
        status: ResponseStatus::Accepted,
        node_id: Some(alert.node_id.clone()),
        action_id: Some(action.id),
        action: Some(action.kind.to_string()),
        rationale: Some(action.rationale.clone()),
        reason: None,
    };

    let node_id = alert.node_id;
    tokio::spawn(async move {
        let outcome = coordinator.remediate(&node_id, action).await;
        match &outcome.final_status {
            FinalStatus::Fatal => error!(node_id = %node_id, "Remediation ended fatal"),
            status => info!(node_id = %node_id, final_status = ?status, "Remediation ended"),
        }
    });

    (StatusCode::ACCEPTED, Json(response))
}

async fn remediations_handler(
    State(coordinator): State<Arc<DispatchCoordinator>>,
) -> impl IntoResponse {
    Json(coordinator.in_flight())
}

async fn audit_handler(
    State(coordinator): State<Arc<DispatchCoordinator>>,
    Query(query): Query<AuditQuery>,
) -> axum::response::Response {
    let records = match &query.node_id {
        Some(node_id) => coordinator.audit_for(node_id).await,
        None => coordinator.audit().await,
    };
    match records {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            error!("Failed to read audit trail: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn execute_handler(
    State(executor): State<Arc<NodeExecutor>>,
    Json(request): Json<ExecuteRequest>,
) -> axum::response::Response {
    if request.node_id != executor.node_id() {
        warn!(
            requested = %request.node_id,
            local = %executor.node_id(),
            "Execute request addressed to another node"
        );
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!(
                    "agent runs on {}, not {}",
                    executor.node_id(),
                    request.node_id
                ),
            }),
        )
            .into_response();
    }

    Json(executor.execute(&request).await).into_response()
}
