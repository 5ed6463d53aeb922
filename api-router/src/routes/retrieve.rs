use axum::{extract::State, response::IntoResponse, Json};
use common::storage::types::chunk::{ChunkMetadata, MetadataFilter};
use retrieval_pipeline::{FusionWeights, RetrievedChunk};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub k: usize,
    #[serde(default)]
    pub filter: Option<MetadataFilter>,
}

#[derive(Debug, Deserialize)]
pub struct HybridRequest {
    pub query: String,
    pub k: usize,
    #[serde(default)]
    pub filter: Option<MetadataFilter>,
    #[serde(default)]
    pub weights: Option<WeightsRequest>,
}

#[derive(Debug, Deserialize)]
pub struct WeightsRequest {
    pub sparse: f32,
    pub dense: f32,
}

#[derive(Debug, Deserialize)]
pub struct TimelineRequest {
    pub patient_id: String,
    pub k: usize,
    #[serde(default)]
    pub resource_types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RerankRequest {
    pub query: String,
    #[serde(default)]
    pub k_retrieve: Option<usize>,
    #[serde(default)]
    pub k_return: Option<usize>,
    #[serde(default)]
    pub filter: Option<MetadataFilter>,
}

#[derive(Debug, Serialize)]
pub struct ScoredResult {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

impl From<RetrievedChunk> for ScoredResult {
    fn from(retrieved: RetrievedChunk) -> Self {
        Self {
            id: retrieved.chunk.id,
            content: retrieved.chunk.content,
            metadata: retrieved.chunk.metadata,
            score: retrieved.score,
        }
    }
}

fn scored_response(results: Vec<RetrievedChunk>) -> Json<serde_json::Value> {
    let results: Vec<ScoredResult> = results.into_iter().map(ScoredResult::from).collect();
    Json(json!({ "results": results }))
}

pub async fn dense(
    State(state): State<ApiState>,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = request.filter.unwrap_or_default();
    let results = state
        .retrieval
        .dense(&request.query, request.k, &filter)
        .await?;
    Ok(scored_response(results))
}

pub async fn sparse(
    State(state): State<ApiState>,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = request.filter.unwrap_or_default();
    let results = state
        .retrieval
        .sparse(&request.query, request.k, &filter)
        .await?;
    Ok(scored_response(results))
}

pub async fn hybrid(
    State(state): State<ApiState>,
    Json(request): Json<HybridRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = request.filter.unwrap_or_default();
    let weights = request.weights.map(|w| FusionWeights {
        sparse: w.sparse,
        dense: w.dense,
    });
    let results = state
        .retrieval
        .hybrid(&request.query, request.k, &filter, weights)
        .await?;
    Ok(scored_response(results))
}

pub async fn timeline(
    State(state): State<ApiState>,
    Json(request): Json<TimelineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let chunks = state
        .retrieval
        .patient_timeline(&request.patient_id, request.k, request.resource_types)
        .await?;

    #[derive(Serialize)]
    struct PlainResult {
        id: String,
        content: String,
        metadata: ChunkMetadata,
    }

    let results: Vec<PlainResult> = chunks
        .into_iter()
        .map(|chunk| PlainResult {
            id: chunk.id,
            content: chunk.content,
            metadata: chunk.metadata,
        })
        .collect();
    Ok(Json(json!({ "results": results })))
}

pub async fn rerank(
    State(state): State<ApiState>,
    Json(request): Json<RerankRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let k_retrieve = request
        .k_retrieve
        .unwrap_or(state.config.hybrid_k_retrieve);
    let k_return = request.k_return.unwrap_or(10);
    let filter = request.filter.unwrap_or_default();

    let results = state
        .rerank
        .rerank(&request.query, k_retrieve, k_return, &filter)
        .await?;
    Ok(scored_response(results))
}
