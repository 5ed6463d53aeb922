use std::sync::Arc;

use common::{
    storage::{db::SurrealDbClient, vector_store::VectorStore},
    utils::config::AppConfig,
};
use ingestion_pipeline::IngestionQueue;
use retrieval_pipeline::{reranking::RerankPipeline, RetrievalEngine};

/// Shared handles for every API handler.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub store: Arc<VectorStore>,
    pub queue: Arc<IngestionQueue>,
    pub retrieval: Arc<RetrievalEngine>,
    pub rerank: Arc<RerankPipeline>,
    pub config: AppConfig,
}
