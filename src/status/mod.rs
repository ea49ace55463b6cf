//! Status API.
//!
//! # Endpoints
//! ```text
//! GET    /status          version, circuit snapshot, retry_after_ms
//! POST   /status/retry    reset the circuit ("retry now")
//! GET    /cache/{key}     envelope metadata for one cache entry
//! DELETE /cache?prefix=   remove cache entries by key prefix
//! ```
//!
//! # Design Decisions
//! - Read endpoints are always open; mutating ones honour `status.api_key`
//! - Handlers only read or reset shared components, they own no state

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use self::auth::require_api_key;
use self::handlers::*;
use crate::context::AppContext;
use crate::lifecycle::StopSignal;

/// State injected into status handlers.
#[derive(Clone)]
pub struct StatusState {
    pub context: Arc<AppContext>,
}

pub fn status_router(context: Arc<AppContext>) -> Router {
    let state = StatusState { context };

    let protected = Router::new()
        .route("/status/retry", post(retry_now))
        .route("/cache", delete(clear_cache))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/status", get(get_status))
        .route("/cache/{*key}", get(get_cache_entry))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the status API until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    context: Arc<AppContext>,
    mut shutdown: StopSignal,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Status API listening");

    axum::serve(listener, status_router(context))
        .with_graceful_shutdown(async move {
            shutdown.stopped().await;
        })
        .await?;

    tracing::info!("Status API stopped");
    Ok(())
}
