use async_openai::error::OpenAIError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Embedding provider error: {0}")]
    Embedding(#[from] OpenAIError),
    #[error("Rerank provider error: {0}")]
    Rerank(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Work queue is full")]
    QueueFull,
    #[error("Store pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

/// Closed classification of ingestion failures. Every error raised while
/// processing a work item maps to exactly one of these at the driver boundary;
/// the queue decides retry/terminal handling from the class alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Retryable,
    Duplicate,
    Fatal,
    MaxRetries,
    QueueFull,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Validation => "validation",
            Self::Retryable => "retryable",
            Self::Duplicate => "duplicate",
            Self::Fatal => "fatal",
            Self::MaxRetries => "max_retries",
            Self::QueueFull => "queue_full",
        };
        f.write_str(label)
    }
}

impl AppError {
    /// Map an error to its ingestion class. Inspects structured driver errors
    /// rather than message text so the mapping survives driver upgrades.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::Validation,
            Self::QueueFull => ErrorClass::QueueFull,
            Self::Timeout(_) | Self::PoolExhausted(_) | Self::Io(_) => ErrorClass::Retryable,
            Self::Database(err) => classify_store_error(err),
            Self::Embedding(err) => classify_provider_error(err),
            Self::Rerank(_) => ErrorClass::Retryable,
            Self::NotFound(_) | Self::Join(_) | Self::InternalError(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Retryable)
    }
}

fn classify_store_error(err: &surrealdb::Error) -> ErrorClass {
    match err {
        // Unique-key conflict: the record is already there, which idempotent
        // ingestion treats as success.
        surrealdb::Error::Db(surrealdb::error::Db::RecordExists { .. }) => ErrorClass::Duplicate,
        // Read/write conflicts resolve on replay.
        surrealdb::Error::Db(surrealdb::error::Db::TxRetryable) => ErrorClass::Retryable,
        // Client/transport layer failures (connection drops, protocol errors)
        // are transient by nature; schema and query errors are not.
        surrealdb::Error::Api(_) => ErrorClass::Retryable,
        #[allow(unreachable_patterns)]
        _ => ErrorClass::Fatal,
    }
}

fn classify_provider_error(err: &OpenAIError) -> ErrorClass {
    match err {
        // Transport-level failures are transient; malformed requests and
        // undecodable responses are not.
        OpenAIError::Reqwest(e) => {
            if reqwest_is_permanent(e) {
                ErrorClass::Fatal
            } else {
                ErrorClass::Retryable
            }
        }
        OpenAIError::ApiError(api) if api.code.as_deref() == Some("rate_limit_exceeded") => {
            ErrorClass::Retryable
        }
        _ => ErrorClass::Fatal,
    }
}

fn reqwest_is_permanent(err: &reqwest::Error) -> bool {
    err.is_builder() || err.is_decode()
}
