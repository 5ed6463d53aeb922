use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        types::{chunk::ChunkRecord, submission::ResourceSubmission},
        vector_store::VectorStore,
    },
    utils::embedding::EmbeddingProvider,
};
use serde_json::Value;
use tracing::debug;

use crate::{chunker::Chunker, metadata::extract_chunk_metadata};

/// External collaborators of the per-item pipeline, seam for tests and fault
/// injection. Production wires the vector store and embedding provider.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
    async fn upsert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), AppError>;
    async fn existing_chunk_count(&self, resource_id: &str) -> Result<usize, AppError>;
}

pub struct DefaultPipelineServices {
    store: Arc<VectorStore>,
    embedder: Arc<EmbeddingProvider>,
}

impl DefaultPipelineServices {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<EmbeddingProvider>) -> Arc<Self> {
        Arc::new(Self { store, embedder })
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.embedder.embed(text).await
    }

    async fn upsert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), AppError> {
        self.store.upsert_batch(chunks).await
    }

    async fn existing_chunk_count(&self, resource_id: &str) -> Result<usize, AppError> {
        self.store.chunk_count_for_resource(resource_id).await
    }
}

/// Outcome of one successfully processed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReport {
    pub chunk_count: usize,
    /// True when chunks for this resource were already present; the upsert
    /// overwrote them in place.
    pub overwrote_existing: bool,
}

/// One worker unit: parse, chunk, enrich, embed, commit as a single batch.
/// The batch commit is the only write, so a resource is either fully present
/// or absent regardless of where processing fails.
pub struct IngestionPipeline {
    chunker: Chunker,
    services: Arc<dyn PipelineServices>,
}

impl IngestionPipeline {
    pub fn new(chunker: Chunker, services: Arc<dyn PipelineServices>) -> Self {
        Self { chunker, services }
    }

    #[tracing::instrument(skip_all, fields(resource_id = %submission.resource_id))]
    pub async fn process(
        &self,
        submission: &ResourceSubmission,
    ) -> Result<ProcessReport, AppError> {
        let resource: Value = serde_json::from_str(&submission.resource_json)
            .map_err(|e| AppError::Validation(format!("resource_json is not valid JSON: {e}")))?;

        let chunk_texts = self
            .chunker
            .chunk_resource(&submission.resource_json, &submission.content)?;
        if chunk_texts.iter().all(|text| text.trim().is_empty()) {
            return Err(AppError::Validation(
                "chunking produced no non-empty chunks".to_string(),
            ));
        }

        let existing = self
            .services
            .existing_chunk_count(&submission.resource_id)
            .await?;

        let total_chunks = chunk_texts.len();
        let mut records = Vec::with_capacity(total_chunks);
        for (index, text) in chunk_texts.into_iter().enumerate() {
            let metadata =
                extract_chunk_metadata(submission, &resource, index, total_chunks, &text);
            let embedding = self.services.embed(&text).await?;
            records.push(ChunkRecord::new(text, embedding, metadata));
        }

        // Commit point: all chunks of the resource land atomically.
        self.services.upsert_chunks(&records).await?;

        debug!(
            chunks = total_chunks,
            overwrote = existing > 0,
            "submission committed"
        );

        Ok(ProcessReport {
            chunk_count: total_chunks,
            overwrote_existing: existing > 0,
        })
    }
}
