//! HTTP status/metrics server (component L): the `write_html` status page
//! plus basic liveness and metrics endpoints. CSS/branding of the status
//! page is explicitly out of scope (§6) — this module only wires the
//! manager's byte-writing method to an HTTP response.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Router, extract::State};
use tower_http::trace::TraceLayer;
use tracing::info;

use fleet_manager::Manager;

#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
}

pub async fn run(addr: SocketAddr, manager: Arc<Manager>) -> anyhow::Result<()> {
    let state = AppState { manager };

    let app = Router::new()
        .route("/", get(status_page))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(address = %addr, "starting http status/metrics server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status_page(State(state): State<AppState>) -> impl IntoResponse {
    let mut buf = Vec::new();
    if state.manager.write_html(&mut buf).await.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, Html(String::new()));
    }
    let body = String::from_utf8_lossy(&buf).into_owned();
    (StatusCode::OK, Html(body))
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let topology = state.manager.get_topology().await;
    let hypervisor_count = topology.machines().count();
    let body = format!(
        "# HELP fleet_hypervisors_declared Number of hypervisors declared in the current topology.\n\
         # TYPE fleet_hypervisors_declared gauge\n\
         fleet_hypervisors_declared {hypervisor_count}\n"
    );
    (StatusCode::OK, body)
}
