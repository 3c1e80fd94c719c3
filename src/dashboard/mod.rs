//! Status HTTP endpoint
//!
//! Small read-only surface next to the UI socket:
//! - `GET /api/status` for the panel indicator
//! - `GET /api/tools` for the registry catalog
//! - `GET /metrics` in Prometheus text format

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::agent::{AgentController, AgentStatus};
use crate::metrics::{self, TRANSPORT_REQUESTS};
use crate::tools::SideEffect;

/// Dashboard application state
#[derive(Clone)]
pub struct DashboardState {
    pub controller: Arc<AgentController>,
}

/// Agent status response
#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub status: AgentStatus,
    pub model: String,
    pub turns_in_flight: usize,
    pub version: &'static str,
}

/// One catalog entry
#[derive(Debug, Serialize)]
pub struct ToolEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub side_effect: SideEffect,
    pub parameters: Value,
}

/// Create the dashboard router
pub fn create_router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/status", get(agent_status))
        .route("/api/tools", get(tool_catalog))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

async fn agent_status(State(state): State<DashboardState>) -> impl IntoResponse {
    TRANSPORT_REQUESTS.with_label_values(&["http", "status"]).inc();
    Json(StatusBody {
        status: state.controller.status(),
        model: state.controller.model_name().to_string(),
        turns_in_flight: state.controller.turns_in_flight(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn tool_catalog(State(state): State<DashboardState>) -> impl IntoResponse {
    TRANSPORT_REQUESTS.with_label_values(&["http", "tools"]).inc();
    let tools: Vec<ToolEntry> = state
        .controller
        .registry()
        .kinds()
        .iter()
        .map(|&kind| ToolEntry {
            name: kind.name(),
            description: kind.description(),
            side_effect: kind.side_effect(),
            parameters: kind.parameters(),
        })
        .collect();
    Json(tools)
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

/// Serve the status endpoint until `shutdown` resolves
pub async fn serve(
    controller: Arc<AgentController>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Status endpoint listening");
    axum::serve(listener, create_router(DashboardState { controller }))
        .with_graceful_shutdown(shutdown)
        .await
}
