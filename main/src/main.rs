use std::{sync::Arc, time::Duration};

use api_router::{api_routes, api_state::ApiState};
use common::{
    storage::{db::SurrealDbClient, indexes::ensure_runtime_indexes, pool::StoreGate,
        vector_store::VectorStore},
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use ingestion_pipeline::{ChunkLimits, Chunker, DefaultPipelineServices, IngestionPipeline,
    IngestionQueue, QueueTuning};
use retrieval_pipeline::{
    reranking::{FastembedReranker, RerankBackend, RerankPipeline},
    RetrievalEngine, RetrievalTuning,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    ensure_runtime_indexes(&db, config.embedding_dimensions).await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));
    let embedder = Arc::new(EmbeddingProvider::from_config(
        &config,
        Some(openai_client),
    )?);
    info!(
        embedding_backend = embedder.backend_label(),
        embedding_dimension = embedder.dimension(),
        "Embedding provider initialized"
    );

    let gate = StoreGate::new(
        config.pool_size,
        config.pool_overflow,
        Duration::from_secs(config.pool_acquire_timeout_s),
    );
    let store = Arc::new(VectorStore::new(
        Arc::clone(&db),
        gate,
        Duration::from_secs(config.provider_timeout_s),
    ));

    let services = DefaultPipelineServices::new(Arc::clone(&store), Arc::clone(&embedder));
    let pipeline = Arc::new(IngestionPipeline::new(
        Chunker::new(ChunkLimits::from_config(&config)),
        services,
    ));
    let queue = IngestionQueue::new(
        Arc::clone(&db),
        pipeline,
        QueueTuning::from_config(&config),
    );
    queue.start().await;
    let recovered = queue.recover().await?;
    if recovered > 0 {
        info!(items = recovered, "requeued journaled work from previous run");
    }

    let rerank_backend = FastembedReranker::maybe_from_config(&config)?
        .map(|pool| pool as Arc<dyn RerankBackend>);
    let retrieval = Arc::new(RetrievalEngine::new(
        Arc::clone(&store),
        Arc::clone(&embedder),
        RetrievalTuning::from_config(&config),
    ));
    let rerank = Arc::new(RerankPipeline::new(
        Arc::clone(&retrieval),
        rerank_backend,
        config.cache_max_entries,
        Duration::from_secs(config.cache_ttl_s),
        Duration::from_secs(config.provider_timeout_s),
    ));

    let api_state = ApiState {
        db,
        store,
        queue: Arc::clone(&queue),
        retrieval,
        rerank,
        config: config.clone(),
    };

    let app = api_routes().with_state(api_state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped; draining ingestion queue");
    queue.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .unwrap_or_else(|e| tracing::error!("failed to listen for shutdown signal: {e}"));
}
