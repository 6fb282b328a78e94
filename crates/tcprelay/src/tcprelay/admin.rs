use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get},
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::tcprelay::{
    telemetry,
    tunnel::registry::{ListenerRegistry, ListenerSnapshot},
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub sessions: telemetry::SharedSessions,
    /// One registry per configured relay.
    pub registries: Vec<Arc<ListenerRegistry>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .route("/listeners", get(listeners))
        .route("/listeners/{addr}", delete(evict_listener))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("admin: bind {addr}"))?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await
        .context("admin: serve")?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    sessions: usize,
    listeners: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let listeners = st.registries.iter().map(|r| r.len()).sum();
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            sessions: st.sessions.len(),
            listeners,
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.sessions.snapshot()))
}

async fn listeners(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap: Vec<ListenerSnapshot> = st.registries.iter().flat_map(|r| r.snapshot()).collect();
    (StatusCode::OK, Json(snap))
}

/// Drops a waiting public listener; its tunnel connection is closed by the holder.
async fn evict_listener(
    State(st): State<Arc<AdminState>>,
    Path(addr): Path<String>,
) -> impl IntoResponse {
    let Ok(addr) = addr.parse::<SocketAddr>() else {
        return StatusCode::BAD_REQUEST;
    };
    let mut found = false;
    for r in &st.registries {
        found |= r.release_addr(addr);
    }
    if found {
        tracing::info!(addr = %addr, "admin: listener evicted");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
