//! HTTP API.
//!
//! Exposes hierarchy resolution, per-node reconciliation, the estate report
//! and lookup logging over JSON.

mod handlers;

use crate::config::ServerConfig;
use crate::service::Auditor;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub use handlers::{ApiError, RecordLookupRequest};

/// Shared state of the API handlers.
#[derive(Clone)]
pub struct ApiState {
    auditor: Arc<Auditor>,
}

impl ApiState {
    pub fn new(auditor: Arc<Auditor>) -> Self {
        Self { auditor }
    }

    pub fn auditor(&self) -> &Arc<Auditor> {
        &self.auditor
    }
}

/// Build the router with all routes.
pub fn build_router(state: ApiState, cors: bool) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/hierarchy", get(handlers::hierarchy))
        .route("/v1/hierarchy/{certname}", get(handlers::hierarchy_for))
        .route("/v1/clean/{certname}", get(handlers::clean))
        .route("/v1/clean-all", get(handlers::clean_all))
        .route("/v1/clean-all/refresh", post(handlers::clean_all_refresh))
        .route(
            "/v1/logging",
            get(handlers::all_logs).post(handlers::record_lookup),
        )
        .route("/v1/logging/{certname}", get(handlers::logged_keys))
        .route("/v1/lookup/{certname}/{key}", get(handlers::lookup))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    }
}

/// Serve the API until Ctrl-C.
pub async fn serve(auditor: Arc<Auditor>, config: &ServerConfig) -> anyhow::Result<()> {
    let app = build_router(ApiState::new(auditor), config.cors);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("hiera-audit listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
