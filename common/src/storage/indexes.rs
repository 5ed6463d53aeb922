use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{error::AppError, storage::db::SurrealDbClient};

const FTS_ANALYZER_NAME: &str = "chunk_fts_analyzer";
const HNSW_INDEX_NAME: &str = "idx_chunk_embedding";
const CHUNK_TABLE: &str = "chunk";

/// Equality indexes over the metadata keys the retrieval filters use.
const METADATA_INDEXES: [(&str, &str); 5] = [
    ("idx_chunk_patient", "metadata.patient_id"),
    ("idx_chunk_resource", "metadata.resource_id"),
    ("idx_chunk_resource_type", "metadata.resource_type"),
    ("idx_chunk_source_file", "metadata.source_file"),
    ("idx_chunk_effective_date", "metadata.effective_date"),
];

/// Build the runtime Surreal indexes (FTS, HNSW, metadata equality).
/// Idempotent: safe to call on every startup, and overwrites the HNSW
/// definition when the embedding dimension changes.
pub async fn ensure_runtime_indexes(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<(), AppError> {
    ensure_runtime_indexes_inner(db, embedding_dimension)
        .await
        .map_err(|err| AppError::InternalError(err.to_string()))
}

async fn ensure_runtime_indexes_inner(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<()> {
    create_fts_analyzer(db).await?;

    let fts_definition = format!(
        "DEFINE INDEX IF NOT EXISTS idx_chunk_content_fts ON TABLE {CHUNK_TABLE} \
         FIELDS content SEARCH ANALYZER {FTS_ANALYZER_NAME} BM25;"
    );
    db.client
        .query(fts_definition)
        .await
        .context("creating chunk FTS index")?
        .check()
        .context("chunk FTS index definition failed")?;

    for (index_name, field) in METADATA_INDEXES {
        let definition = format!(
            "DEFINE INDEX IF NOT EXISTS {index_name} ON TABLE {CHUNK_TABLE} FIELDS {field};"
        );
        db.client
            .query(definition)
            .await
            .with_context(|| format!("creating metadata index {index_name}"))?
            .check()
            .with_context(|| format!("metadata index {index_name} definition failed"))?;
    }

    ensure_hnsw_index(db, embedding_dimension).await
}

async fn ensure_hnsw_index(db: &SurrealDbClient, dimension: usize) -> Result<()> {
    let definition = match existing_hnsw_dimension(db).await? {
        Some(existing) if existing == dimension => return Ok(()),
        Some(existing) => {
            info!(
                existing_dimension = existing,
                target_dimension = dimension,
                "Overwriting HNSW index to match new embedding dimension"
            );
            format!(
                "DEFINE INDEX OVERWRITE {HNSW_INDEX_NAME} ON TABLE {CHUNK_TABLE} \
                 FIELDS embedding HNSW DIMENSION {dimension} DIST COSINE TYPE F32 EFC 100 M 8;"
            )
        }
        None => format!(
            "DEFINE INDEX IF NOT EXISTS {HNSW_INDEX_NAME} ON TABLE {CHUNK_TABLE} \
             FIELDS embedding HNSW DIMENSION {dimension} DIST COSINE TYPE F32 EFC 100 M 8;"
        ),
    };

    db.client
        .query(definition)
        .await
        .context("creating HNSW index")?
        .check()
        .context("HNSW index definition failed")?;

    Ok(())
}

async fn create_fts_analyzer(db: &SurrealDbClient) -> Result<()> {
    // Prefer snowball stemming when the running Surreal build supports it,
    // falling back to a lowercase+ascii analyzer otherwise.
    let snowball_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME}
            TOKENIZERS class
            FILTERS lowercase, ascii, snowball(english);"
    );

    match db.client.query(snowball_query).await {
        Ok(res) => {
            if res.check().is_ok() {
                return Ok(());
            }
            warn!(
                analyzer = FTS_ANALYZER_NAME,
                "Snowball analyzer check failed; attempting ascii fallback definition"
            );
        }
        Err(err) => {
            warn!(
                error = %err,
                "Snowball analyzer creation errored; attempting ascii fallback definition"
            );
        }
    }

    let fallback_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME}
            TOKENIZERS class
            FILTERS lowercase, ascii;"
    );

    db.client
        .query(fallback_query)
        .await
        .context("creating fallback FTS analyzer")?
        .check()
        .context("failed to create fallback FTS analyzer")?;

    Ok(())
}

async fn existing_hnsw_dimension(db: &SurrealDbClient) -> Result<Option<usize>> {
    let Some(indexes) = table_index_definitions(db, CHUNK_TABLE).await? else {
        return Ok(None);
    };

    let Some(definition) = indexes
        .get(HNSW_INDEX_NAME)
        .and_then(|details| details.get("Strand"))
        .and_then(|v| v.as_str())
    else {
        return Ok(None);
    };

    Ok(extract_dimension(definition).and_then(|d| usize::try_from(d).ok()))
}

fn extract_dimension(definition: &str) -> Option<u64> {
    definition
        .split("DIMENSION")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.trim_end_matches(';').parse::<u64>().ok())
}

async fn table_index_definitions(
    db: &SurrealDbClient,
    table: &str,
) -> Result<Option<Map<String, Value>>> {
    let info_query = format!("INFO FOR TABLE {table};");
    let mut response = db
        .client
        .query(info_query)
        .await
        .with_context(|| format!("fetching table info for {table}"))?;

    let info: surrealdb::Value = response
        .take(0)
        .context("failed to take table info response")?;

    let info_json: Value =
        serde_json::to_value(info).context("serializing table info to JSON for parsing")?;

    Ok(info_json
        .get("Object")
        .and_then(|o| o.get("indexes"))
        .and_then(|i| i.get("Object"))
        .and_then(|i| i.as_object())
        .cloned())
}
