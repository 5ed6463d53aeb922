use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// OpenAI-compatible HTTP endpoint.
    OpenAi,
    /// Deterministic token-hash vectors; offline and test deployments.
    Hashed,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::OpenAi
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    // Chunker limits, measured in characters.
    #[serde(default = "default_chunk_min_size")]
    pub chunk_min_size: usize,
    #[serde(default = "default_chunk_max_size")]
    pub chunk_max_size: usize,
    #[serde(default = "default_chunker_overlap")]
    pub chunker_overlap: usize,

    // Ingestion queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_s")]
    pub retry_base_delay_s: u64,
    #[serde(default = "default_retry_max_delay_s")]
    pub retry_max_delay_s: u64,
    #[serde(default = "default_drain_timeout_s")]
    pub drain_timeout_s: u64,
    #[serde(default)]
    pub submit_wait_ms: u64,

    // Store connection gate.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_pool_overflow")]
    pub pool_overflow: usize,
    #[serde(default = "default_pool_acquire_timeout_s")]
    pub pool_acquire_timeout_s: u64,

    // Retrieval.
    #[serde(default = "default_hybrid_k_retrieve")]
    pub hybrid_k_retrieve: usize,
    #[serde(default = "default_hybrid_weight")]
    pub hybrid_weight_sparse: f32,
    #[serde(default = "default_hybrid_weight")]
    pub hybrid_weight_dense: f32,
    #[serde(default = "default_provider_timeout_s")]
    pub provider_timeout_s: u64,

    // Rerank stage.
    #[serde(default)]
    pub reranking_enabled: bool,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_cache_ttl_s")]
    pub cache_ttl_s: u64,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

const fn default_embedding_dimensions() -> usize {
    1024
}

const fn default_chunk_min_size() -> usize {
    500
}

const fn default_chunk_max_size() -> usize {
    1000
}

const fn default_chunker_overlap() -> usize {
    200
}

const fn default_queue_capacity() -> usize {
    1000
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(2)
        .max(2)
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_retry_base_delay_s() -> u64 {
    1
}

const fn default_retry_max_delay_s() -> u64 {
    60
}

const fn default_drain_timeout_s() -> u64 {
    30
}

const fn default_pool_size() -> usize {
    10
}

const fn default_pool_overflow() -> usize {
    5
}

const fn default_pool_acquire_timeout_s() -> u64 {
    30
}

const fn default_hybrid_k_retrieve() -> usize {
    50
}

const fn default_hybrid_weight() -> f32 {
    0.5
}

const fn default_provider_timeout_s() -> u64 {
    30
}

const fn default_cache_max_entries() -> usize {
    10_000
}

const fn default_cache_ttl_s() -> u64 {
    3600
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "test".to_string(),
            surrealdb_database: "test".to_string(),
            http_port: 0,
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            embedding_backend: EmbeddingBackend::Hashed,
            embedding_model: default_embedding_model(),
            embedding_dimensions: 64,
            chunk_min_size: default_chunk_min_size(),
            chunk_max_size: default_chunk_max_size(),
            chunker_overlap: default_chunker_overlap(),
            queue_capacity: default_queue_capacity(),
            worker_count: 2,
            max_retries: default_max_retries(),
            retry_base_delay_s: default_retry_base_delay_s(),
            retry_max_delay_s: default_retry_max_delay_s(),
            drain_timeout_s: default_drain_timeout_s(),
            submit_wait_ms: 0,
            pool_size: default_pool_size(),
            pool_overflow: default_pool_overflow(),
            pool_acquire_timeout_s: default_pool_acquire_timeout_s(),
            hybrid_k_retrieve: default_hybrid_k_retrieve(),
            hybrid_weight_sparse: default_hybrid_weight(),
            hybrid_weight_dense: default_hybrid_weight(),
            provider_timeout_s: default_provider_timeout_s(),
            reranking_enabled: false,
            reranking_pool_size: None,
            cache_max_entries: default_cache_max_entries(),
            cache_ttl_s: default_cache_ttl_s(),
            fastembed_cache_dir: None,
        }
    }
}
