pub mod cache;

use std::{
    cmp::Ordering as CmpOrdering,
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
    time::Duration,
};

use async_trait::async_trait;
use common::{error::AppError, storage::types::chunk::MetadataFilter, utils::config::AppConfig};
use fastembed::{RerankInitOptions, TextRerank};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{RetrievalEngine, RetrievedChunk};

use self::cache::{RerankCache, RerankCacheStats};

/// Second-stage scorer: (query, documents) to one score per document, in
/// input order.
#[async_trait]
pub trait RerankBackend: Send + Sync {
    async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError>;

    fn backend_label(&self) -> &'static str {
        "unknown"
    }
}

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

/// Cross-encoder rerank backend: a fixed pool of fastembed engines behind a
/// semaphore. Checkout enforces backpressure; each engine is exclusively
/// locked while scoring.
pub struct FastembedReranker {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
}

impl FastembedReranker {
    pub fn new(pool_size: usize) -> Result<Arc<Self>, AppError> {
        Self::new_with_options(pool_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranking pool size must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for n in 0..pool_size {
            debug!("creating reranking engine: {n}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::Rerank(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
        }))
    }

    /// Build the pool from configuration; None when reranking is disabled.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranking_enabled {
            return Ok(None);
        }

        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);

        let mut options = RerankInitOptions::default();
        if let Some(dir) = &config.fastembed_cache_dir {
            options.cache_dir = PathBuf::from(dir);
        }

        Self::new_with_options(pool_size, options).map(Some)
    }

    async fn checkout(&self) -> Result<RerankerLease, AppError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AppError::Rerank("reranker pool closed".to_string()))?;

        let idx = pick_engine_index(self.engines.len());
        let engine = self
            .engines
            .get(idx)
            .cloned()
            .ok_or_else(|| AppError::Rerank("reranker pool is empty".to_string()))?;

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

/// Active lease on a single rerank engine; releases its permit on drop.
struct RerankerLease {
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

#[async_trait]
impl RerankBackend for FastembedReranker {
    async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        let total = documents.len();
        let lease = self.checkout().await?;

        let mut guard = lease.engine.lock().await;
        let results = guard
            .rerank(query.to_owned(), documents, false, None)
            .map_err(|e| AppError::Rerank(e.to_string()))?;

        // fastembed returns results ranked by score; restore input order.
        let mut scores = vec![0.0f32; total];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }

    fn backend_label(&self) -> &'static str {
        "fastembed"
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct RerankStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Calls that fell back to hybrid order because the backend failed or is
    /// disabled.
    pub degraded: u64,
}

/// Two-stage retrieval: hybrid candidates, then cross-encoder scores with a
/// fingerprint-keyed cache. Backend failure degrades to hybrid order rather
/// than surfacing an error.
pub struct RerankPipeline {
    engine: Arc<RetrievalEngine>,
    backend: Option<Arc<dyn RerankBackend>>,
    cache: RerankCache,
    provider_timeout: Duration,
    degraded: AtomicU64,
}

impl RerankPipeline {
    pub fn new(
        engine: Arc<RetrievalEngine>,
        backend: Option<Arc<dyn RerankBackend>>,
        cache_max_entries: usize,
        cache_ttl: Duration,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            backend,
            cache: RerankCache::new(cache_max_entries, cache_ttl),
            provider_timeout,
            degraded: AtomicU64::new(0),
        }
    }

    #[tracing::instrument(skip_all, fields(k_retrieve, k_return))]
    pub async fn rerank(
        &self,
        query: &str,
        k_retrieve: usize,
        k_return: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        let mut candidates = self
            .engine
            .hybrid(query, k_retrieve, filter, None)
            .await?;
        if candidates.is_empty() || k_return == 0 {
            candidates.truncate(k_return);
            return Ok(candidates);
        }

        let ids: Vec<String> = candidates.iter().map(|c| c.chunk.id.clone()).collect();
        let fingerprint = RerankCache::fingerprint(query, &ids);

        let scores = if let Some(cached) = self.cache.get(&fingerprint).await {
            cached
        } else {
            match self.score_candidates(query, &candidates).await {
                Ok(scores) => {
                    self.cache.insert(fingerprint, scores.clone()).await;
                    scores
                }
                Err(err) => {
                    warn!(error = %err, "rerank degraded to hybrid order");
                    self.degraded.fetch_add(1, Ordering::Relaxed);
                    candidates.truncate(k_return);
                    return Ok(candidates);
                }
            }
        };

        candidates.sort_by(|a, b| {
            let score_a = scores.get(&a.chunk.id).copied().unwrap_or(f32::NEG_INFINITY);
            let score_b = scores.get(&b.chunk.id).copied().unwrap_or(f32::NEG_INFINITY);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        for candidate in &mut candidates {
            if let Some(score) = scores.get(&candidate.chunk.id) {
                candidate.score = *score;
            }
        }

        candidates.truncate(k_return);
        Ok(candidates)
    }

    async fn score_candidates(
        &self,
        query: &str,
        candidates: &[RetrievedChunk],
    ) -> Result<HashMap<String, f32>, AppError> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| AppError::Rerank("no rerank backend configured".to_string()))?;

        let documents: Vec<String> = candidates
            .iter()
            .map(|c| c.chunk.content.clone())
            .collect();

        let scores = tokio::time::timeout(
            self.provider_timeout,
            backend.score(query, documents),
        )
        .await
        .map_err(|_| AppError::Timeout("rerank request".to_string()))??;

        if scores.len() != candidates.len() {
            return Err(AppError::Rerank(format!(
                "backend returned {} scores for {} documents",
                scores.len(),
                candidates.len()
            )));
        }

        Ok(candidates
            .iter()
            .zip(scores)
            .map(|(candidate, score)| (candidate.chunk.id.clone(), score))
            .collect())
    }

    pub async fn stats(&self) -> RerankStats {
        let RerankCacheStats {
            entries,
            hits,
            misses,
            hit_rate,
        } = self.cache.stats().await;

        RerankStats {
            entries,
            hits,
            misses,
            hit_rate,
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetrievalTuning;
    use common::{
        storage::{
            db::SurrealDbClient,
            indexes::ensure_runtime_indexes,
            pool::StoreGate,
            types::chunk::{chunk_id_for, ChunkMetadata, ChunkRecord},
            vector_store::VectorStore,
        },
        utils::embedding::EmbeddingProvider,
    };
    use std::sync::atomic::AtomicU32;
    use uuid::Uuid;

    const DIM: usize = 32;

    /// Scores documents by a fixed per-content table; counts invocations.
    struct ScriptedBackend {
        table: HashMap<String, f32>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(pairs: &[(&str, f32)]) -> Arc<Self> {
            Arc::new(Self {
                table: pairs
                    .iter()
                    .map(|(content, score)| ((*content).to_string(), *score))
                    .collect(),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RerankBackend for ScriptedBackend {
        async fn score(&self, _query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(documents
                .iter()
                .map(|doc| self.table.get(doc).copied().unwrap_or(0.0))
                .collect())
        }

        fn backend_label(&self) -> &'static str {
            "scripted"
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl RerankBackend for FailingBackend {
        async fn score(&self, _query: &str, _documents: Vec<String>) -> Result<Vec<f32>, AppError> {
            Err(AppError::Rerank("model unreachable".to_string()))
        }
    }

    async fn seeded_engine() -> Arc<RetrievalEngine> {
        let db = Arc::new(
            SurrealDbClient::memory("rerank_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        ensure_runtime_indexes(&db, DIM)
            .await
            .expect("failed to build runtime indexes");

        let gate = StoreGate::new(4, 2, Duration::from_secs(5));
        let store = Arc::new(VectorStore::new(db, gate, Duration::from_secs(10)));
        let embedder = Arc::new(EmbeddingProvider::new_hashed(DIM));

        let contents = [
            ("obs-1", "cholesterol reading one"),
            ("obs-2", "cholesterol reading two"),
            ("obs-3", "cholesterol reading three"),
        ];
        for (resource_id, content) in contents {
            let embedding = embedder.embed(content).await.expect("embed");
            let metadata = ChunkMetadata {
                patient_id: Some("p-1".to_string()),
                resource_id: resource_id.to_string(),
                resource_type: "Observation".to_string(),
                full_url: format!("urn:uuid:{resource_id}"),
                chunk_id: chunk_id_for(resource_id, 0),
                chunk_index: 0,
                total_chunks: 1,
                chunk_size: content.chars().count(),
                ..ChunkMetadata::default()
            };
            store
                .upsert_batch(&[ChunkRecord::new(content.to_string(), embedding, metadata)])
                .await
                .expect("seed");
        }

        Arc::new(RetrievalEngine::new(
            store,
            embedder,
            RetrievalTuning::default(),
        ))
    }

    #[tokio::test]
    async fn rerank_orders_by_backend_scores() {
        let engine = seeded_engine().await;
        let backend = ScriptedBackend::new(&[
            ("cholesterol reading one", 0.1),
            ("cholesterol reading two", 0.9),
            ("cholesterol reading three", 0.5),
        ]);
        let pipeline = RerankPipeline::new(
            engine,
            Some(backend),
            100,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let results = pipeline
            .rerank("cholesterol reading", 50, 3, &MetadataFilter::default())
            .await
            .expect("rerank");

        let ids: Vec<_> = results
            .iter()
            .map(|r| r.chunk.metadata.resource_id.as_str())
            .collect();
        assert_eq!(ids, vec!["obs-2", "obs-3", "obs-1"]);
        assert!((results[0].score - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn second_identical_call_is_served_from_cache() {
        let engine = seeded_engine().await;
        let backend = ScriptedBackend::new(&[
            ("cholesterol reading one", 0.3),
            ("cholesterol reading two", 0.8),
            ("cholesterol reading three", 0.6),
        ]);
        let pipeline = RerankPipeline::new(
            engine,
            Some(Arc::clone(&backend) as Arc<dyn RerankBackend>),
            100,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let first = pipeline
            .rerank("cholesterol reading", 50, 10, &MetadataFilter::default())
            .await
            .expect("first rerank");
        let stats = pipeline.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);

        let second = pipeline
            .rerank("cholesterol reading", 50, 10, &MetadataFilter::default())
            .await
            .expect("second rerank");
        let stats = pipeline.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);

        let order = |results: &[RetrievedChunk]| {
            results
                .iter()
                .map(|r| r.chunk.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(order(&first), order(&second));
        assert_eq!(
            backend.calls.load(Ordering::SeqCst),
            1,
            "cache hit must skip the backend"
        );
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_hybrid_order() {
        let engine = seeded_engine().await;

        let hybrid_order: Vec<String> = engine
            .hybrid("cholesterol reading", 50, &MetadataFilter::default(), None)
            .await
            .expect("hybrid")
            .iter()
            .map(|r| r.chunk.id.clone())
            .collect();

        let pipeline = RerankPipeline::new(
            engine,
            Some(Arc::new(FailingBackend)),
            100,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let results = pipeline
            .rerank("cholesterol reading", 50, 10, &MetadataFilter::default())
            .await
            .expect("degraded rerank must not error");

        let ids: Vec<String> = results.iter().map(|r| r.chunk.id.clone()).collect();
        assert_eq!(ids, hybrid_order);
        assert_eq!(pipeline.stats().await.degraded, 1);
    }

    #[tokio::test]
    async fn missing_backend_counts_as_degraded() {
        let engine = seeded_engine().await;
        let pipeline = RerankPipeline::new(
            engine,
            None,
            100,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let results = pipeline
            .rerank("cholesterol reading", 50, 2, &MetadataFilter::default())
            .await
            .expect("rerank without backend");

        assert_eq!(results.len(), 2);
        assert_eq!(pipeline.stats().await.degraded, 1);
    }
}
