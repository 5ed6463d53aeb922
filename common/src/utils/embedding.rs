use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use tracing::debug;

use crate::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackend},
};

/// Text-to-vector provider. Deterministic for identical input within one
/// model version; every call is bounded by the provider timeout.
#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
    timeout: Duration,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAi {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: usize,
    },
    Hashed {
        dimension: usize,
    },
}

impl EmbeddingProvider {
    pub fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        let timeout = Duration::from_secs(config.provider_timeout_s);
        match config.embedding_backend {
            EmbeddingBackend::Hashed => Ok(Self::new_hashed_with_timeout(
                config.embedding_dimensions,
                timeout,
            )),
            EmbeddingBackend::OpenAi => {
                let client = openai_client.ok_or_else(|| {
                    AppError::Validation(
                        "openai embedding backend requires a configured client".to_string(),
                    )
                })?;
                Ok(Self {
                    inner: EmbeddingInner::OpenAi {
                        client,
                        model: config.embedding_model.clone(),
                        dimensions: config.embedding_dimensions,
                    },
                    timeout,
                })
            }
        }
    }

    /// Deterministic token-hash vectors; used in tests and offline setups.
    pub fn new_hashed(dimension: usize) -> Self {
        Self::new_hashed_with_timeout(dimension, Duration::from_secs(30))
    }

    fn new_hashed_with_timeout(dimension: usize, timeout: Duration) -> Self {
        Self {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
            timeout,
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::OpenAi { .. } => "openai",
            EmbeddingInner::Hashed { .. } => "hashed",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::OpenAi { dimensions, .. } => *dimensions,
            EmbeddingInner::Hashed { dimension } => *dimension,
        }
    }

    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(hashed_embedding(input, *dimension)),
            EmbeddingInner::OpenAi {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model)
                    .dimensions(*dimensions as u32)
                    .input([input])
                    .build()?;

                let response =
                    tokio::time::timeout(self.timeout, client.embeddings().create(request))
                        .await
                        .map_err(|_| AppError::Timeout("embedding request".to_string()))??;

                let embedding = response
                    .data
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        AppError::InternalError("no embedding data received".to_string())
                    })?
                    .embedding;

                debug!(dimensions = embedding.len(), "embedding created");

                Ok(embedding)
            }
        }
    }

    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut out = Vec::with_capacity(inputs.len());
        for input in inputs {
            out.push(self.embed(input).await?);
        }
        Ok(out)
    }
}

fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    for token in tokens(text) {
        let idx = bucket(&token, dim);
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}
