use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::cache::EntryInfo;
use crate::resilience::CircuitState;
use crate::status::StatusState;

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub circuit: CircuitState,
    /// Present while the circuit is open.
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PrefixQuery {
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedResponse {
    pub removed: usize,
}

fn snapshot(state: &StatusState) -> StatusResponse {
    let breaker = state.context.breaker();
    let circuit = breaker.state();
    let retry_after_ms = circuit.retry_after_ms(breaker.now_ms());
    StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        circuit,
        retry_after_ms,
    }
}

pub async fn get_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    Json(snapshot(&state))
}

/// "Retry now": close the circuit regardless of the cooldown.
pub async fn retry_now(State(state): State<StatusState>) -> Json<StatusResponse> {
    tracing::info!("Circuit reset requested");
    state.context.breaker().reset();
    Json(snapshot(&state))
}

pub async fn get_cache_entry(
    State(state): State<StatusState>,
    Path(key): Path<String>,
) -> Result<Json<EntryInfo>, StatusCode> {
    state
        .context
        .cache()
        .inspect(&key)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn clear_cache(
    State(state): State<StatusState>,
    Query(query): Query<PrefixQuery>,
) -> Json<RemovedResponse> {
    let removed = state.context.cache().remove_by_prefix(&query.prefix);
    tracing::info!(prefix = %query.prefix, removed, "Cache entries removed");
    Json(RemovedResponse { removed })
}
