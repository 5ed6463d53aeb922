#![allow(clippy::missing_docs_in_private_items)]

pub mod detect;
pub mod fusion;
pub mod reranking;

use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        types::chunk::{ChunkRecord, MetadataFilter},
        vector_store::VectorStore,
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use tracing::{debug, instrument};

pub use fusion::FusionWeights;

/// A chunk plus the score of the retrieval stage that produced it.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: ChunkRecord,
    pub score: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalTuning {
    /// Candidate pool fetched per side before fusion/truncation.
    pub k_retrieve: usize,
    pub weights: FusionWeights,
    /// Keyword-based resource-type detection on dense/hybrid queries.
    pub auto_detect: bool,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            k_retrieve: 50,
            weights: FusionWeights::default(),
            auto_detect: true,
        }
    }
}

impl RetrievalTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            k_retrieve: config.hybrid_k_retrieve.max(1),
            weights: FusionWeights {
                sparse: config.hybrid_weight_sparse,
                dense: config.hybrid_weight_dense,
            },
            auto_detect: true,
        }
    }
}

/// Query-side engine over the chunk store: dense ANN, sparse BM25, their
/// weighted fusion, and the patient timeline scan.
pub struct RetrievalEngine {
    store: Arc<VectorStore>,
    embedder: Arc<EmbeddingProvider>,
    tuning: RetrievalTuning,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<EmbeddingProvider>,
        tuning: RetrievalTuning,
    ) -> Self {
        Self {
            store,
            embedder,
            tuning,
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    #[instrument(skip_all, fields(k))]
    pub async fn dense(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        let filter = self.resolve_filter(query, filter);
        let embedding = self.embedder.embed(query).await?;

        let k_retrieve = k.max(self.tuning.k_retrieve);
        let mut hits = self.store.dense_search(embedding, k_retrieve, &filter).await?;
        hits.truncate(k);

        Ok(hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                chunk: hit.chunk,
                score: hit.score,
            })
            .collect())
    }

    #[instrument(skip_all, fields(k))]
    pub async fn sparse(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        let k_retrieve = k.max(self.tuning.k_retrieve);
        let mut hits = self.store.sparse_search(query, k_retrieve, filter).await?;
        hits.truncate(k);

        Ok(hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                chunk: hit.chunk,
                score: hit.score,
            })
            .collect())
    }

    /// Dense and sparse legs run concurrently, then fuse per the configured
    /// weights. Deterministic for fixed store state.
    #[instrument(skip_all, fields(k))]
    pub async fn hybrid(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
        weights: Option<FusionWeights>,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        let filter = self.resolve_filter(query, filter);
        let embedding = self.embedder.embed(query).await?;

        let k_retrieve = self.tuning.k_retrieve.max(k);
        let (dense, sparse) = tokio::join!(
            self.store.dense_search(embedding, k_retrieve, &filter),
            self.store.sparse_search(query, k_retrieve, &filter),
        );

        let weights = weights.unwrap_or(self.tuning.weights);
        let mut fused = fusion::fuse(dense?, sparse?, weights);
        fused.truncate(k);
        Ok(fused)
    }

    /// Chronological, patient-scoped lookup. Exact equality on the patient id;
    /// no similarity scoring is involved.
    #[instrument(skip_all, fields(patient_id, k))]
    pub async fn patient_timeline(
        &self,
        patient_id: &str,
        k: usize,
        resource_types: Option<Vec<String>>,
    ) -> Result<Vec<ChunkRecord>, AppError> {
        self.store
            .filtered_scan(
                &MetadataFilter::for_patient(patient_id),
                resource_types,
                "effective_date",
                k,
            )
            .await
    }

    fn resolve_filter(&self, query: &str, filter: &MetadataFilter) -> MetadataFilter {
        if !self.tuning.auto_detect || filter.resource_type.is_some() {
            return filter.clone();
        }
        match detect::detect_resource_type(query) {
            Some(resource_type) => {
                debug!(resource_type, "auto-detected resource type filter");
                filter.clone().with_resource_type(resource_type)
            }
            None => filter.clone(),
        }
    }
}
