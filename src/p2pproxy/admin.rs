use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::p2pproxy::{
    telemetry,
    tunnel::{netserver::NetServer, server::P2pServer, table::ConnTable},
};

/// What the admin endpoints can see. The server role fills `p2p` and `net`;
/// the client role fills `backends`.
#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub p2p: Option<Arc<P2pServer>>,
    pub net: Option<Arc<NetServer>>,
    pub backends: Option<Arc<ConnTable>>,
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");
    serve_listener(listener, state, shutdown).await
}

pub(crate) async fn serve_listener(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;
    Ok(())
}

fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .route("/control", get(control))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = match (&st.net, &st.backends) {
        (Some(net), _) => net.snapshot(),
        (None, Some(b)) => b.snapshot(),
        (None, None) => Vec::new(),
    };
    (StatusCode::OK, Json(snap))
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    connected: bool,
}

async fn control(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let connected = st.p2p.as_ref().is_some_and(|p| p.is_connected());
    (StatusCode::OK, Json(ControlResponse { connected }))
}
