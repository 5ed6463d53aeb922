use axum::{extract::State, response::IntoResponse, Json};

use crate::{api_state::ApiState, error::ApiError};

/// Chunk count plus connection-gate usage.
pub async fn store_stats(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(stats))
}

/// Journal depth by state plus dead-letter and duplicate totals.
pub async fn queue_stats(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.queue.stats().await?;
    Ok(Json(stats))
}

/// Rerank cache hit/miss counters and degradation count.
pub async fn rerank_cache_stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.rerank.stats().await)
}
