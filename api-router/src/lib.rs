#![allow(clippy::missing_docs_in_private_items)]

use axum::{
    extract::FromRef,
    routing::{get, post},
    Router,
};
use routes::{
    ingest::ingest_resource,
    liveness::live,
    readiness::ready,
    retrieve,
    stats::{queue_stats, rerank_cache_stats, store_stats},
};

pub mod api_state;
pub mod error;
mod routes;

use api_state::ApiState;

/// Router covering ingestion, retrieval, observability and probes.
pub fn api_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/ingest", post(ingest_resource))
        .route("/retrieve/dense", post(retrieve::dense))
        .route("/retrieve/sparse", post(retrieve::sparse))
        .route("/retrieve/hybrid", post(retrieve::hybrid))
        .route("/retrieve/timeline", post(retrieve::timeline))
        .route("/retrieve/rerank", post(retrieve::rerank))
        .route("/stats/store", get(store_stats))
        .route("/stats/queue", get(queue_stats))
        .route("/stats/rerank-cache", get(rerank_cache_stats))
}
