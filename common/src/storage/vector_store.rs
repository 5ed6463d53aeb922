use std::{future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppError;

use super::{
    db::SurrealDbClient,
    pool::{GateStats, StoreGate},
    types::chunk::{
        deserialize_datetime, deserialize_flexible_id, ChunkMetadata, ChunkRecord, MetadataFilter,
    },
    types::StoredObject,
};

/// Candidate count handed to the HNSW search per query.
const KNN_EF: usize = 100;

/// Metadata keys `filtered_scan` may order by.
const ORDERABLE_KEYS: [&str; 2] = ["effective_date", "last_updated"];

/// Durable chunk storage over SurrealDB: idempotent batch upserts, ANN and
/// BM25 lookups, and equality-filtered scans. Every operation checks out a
/// gate permit and is bounded by the operation timeout.
pub struct VectorStore {
    db: Arc<SurrealDbClient>,
    gate: Arc<StoreGate>,
    op_timeout: Duration,
}

/// A chunk together with its retrieval score (cosine similarity or BM25).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: ChunkRecord,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub pool_size: usize,
    pub pool_checked_out: usize,
    pub pool_overflow: usize,
}

#[derive(Deserialize)]
struct ScoredRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    #[serde(deserialize_with = "deserialize_datetime")]
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(deserialize_with = "deserialize_datetime")]
    updated_at: chrono::DateTime<chrono::Utc>,
    content: String,
    embedding: Vec<f32>,
    metadata: ChunkMetadata,
    score: f32,
}

impl From<ScoredRow> for ScoredChunk {
    fn from(row: ScoredRow) -> Self {
        Self {
            chunk: ChunkRecord {
                id: row.id,
                created_at: row.created_at,
                updated_at: row.updated_at,
                content: row.content,
                embedding: row.embedding,
                metadata: row.metadata,
            },
            score: row.score,
        }
    }
}

#[derive(Deserialize)]
struct CountRow {
    count: usize,
}

impl VectorStore {
    pub fn new(db: Arc<SurrealDbClient>, gate: Arc<StoreGate>, op_timeout: Duration) -> Self {
        Self {
            db,
            gate,
            op_timeout,
        }
    }

    async fn bounded<T, F>(&self, label: &'static str, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| AppError::Timeout(format!("store operation `{label}`")))?
    }

    /// Commit a set of chunks as one transaction, keyed on chunk id. Either
    /// every chunk lands or none do; replaying the same batch is a no-op
    /// beyond refreshing `updated_at`.
    pub async fn upsert_batch(&self, chunks: &[ChunkRecord]) -> Result<(), AppError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let _lease = self.gate.checkout(&self.db).await?;

        self.bounded("upsert_batch", async {
            let mut request = self.db.client.query("BEGIN TRANSACTION;");
            for (n, chunk) in chunks.iter().enumerate() {
                request = request
                    .query(format!(
                        "UPSERT type::thing('{table}', $id_{n}) CONTENT $chunk_{n};",
                        table = ChunkRecord::table_name(),
                    ))
                    .bind((format!("id_{n}"), chunk.id.clone()))
                    .bind((format!("chunk_{n}"), chunk.clone()));
            }
            let response = request.query("COMMIT TRANSACTION;").await?;
            response.check()?;
            Ok(())
        })
        .await?;

        debug!(chunks = chunks.len(), "committed chunk batch");
        Ok(())
    }

    /// Cosine ANN search, equality filters pushed into the WHERE clause.
    /// Higher score is better.
    pub async fn dense_search(
        &self,
        embedding: Vec<f32>,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let _lease = self.gate.checkout(&self.db).await?;

        let filter_clause = filter_fragment(filter);
        let sql = format!(
            "SELECT *, vector::similarity::cosine(embedding, $embedding) AS score \
             FROM {table} \
             WHERE embedding <|{k},{ef}|> $embedding{filter_clause} \
             ORDER BY score DESC \
             LIMIT {k}",
            table = ChunkRecord::table_name(),
            ef = KNN_EF,
        );

        self.bounded("dense_search", async {
            let mut request = self.db.query(sql).bind(("embedding", embedding));
            for (_, name, value) in filter.conditions() {
                request = request.bind((name, value));
            }

            let mut response = request.await?;
            let rows: Vec<ScoredRow> = response.take(0)?;
            Ok(rows.into_iter().map(ScoredChunk::from).collect())
        })
        .await
    }

    /// BM25 full-text search over chunk content. Scores are non-negative;
    /// a query with no indexed token yields an empty result.
    pub async fn sparse_search(
        &self,
        query_text: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        if k == 0 || query_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let _lease = self.gate.checkout(&self.db).await?;

        let filter_clause = filter_fragment(filter);
        let sql = format!(
            "SELECT *, IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score \
             FROM {table} \
             WHERE content @0@ $terms{filter_clause} \
             ORDER BY score DESC \
             LIMIT $limit",
            table = ChunkRecord::table_name(),
        );

        let terms = query_text.to_owned();
        self.bounded("sparse_search", async {
            let mut request = self
                .db
                .query(sql)
                .bind(("terms", terms))
                .bind(("limit", k as i64));
            for (_, name, value) in filter.conditions() {
                request = request.bind((name, value));
            }

            let mut response = request.await?;
            let rows: Vec<ScoredRow> = response.take(0)?;
            Ok(rows.into_iter().map(ScoredChunk::from).collect())
        })
        .await
    }

    /// Exact-equality scan ordered by a metadata key, descending, records
    /// missing the key last. Deterministic tie-break on chunk id.
    pub async fn filtered_scan(
        &self,
        filter: &MetadataFilter,
        resource_types: Option<Vec<String>>,
        order_by: &str,
        k: usize,
    ) -> Result<Vec<ChunkRecord>, AppError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if !ORDERABLE_KEYS.contains(&order_by) {
            return Err(AppError::Validation(format!(
                "cannot order a scan by metadata key `{order_by}`"
            )));
        }

        let _lease = self.gate.checkout(&self.db).await?;

        let mut clauses = filter_fragment(filter);
        if resource_types.is_some() {
            clauses.push_str(" AND metadata.resource_type IN $types");
        }

        let dated_sql = format!(
            "SELECT * FROM {table} \
             WHERE metadata.{order_by} != NONE{clauses} \
             ORDER BY metadata.{order_by} DESC, id ASC \
             LIMIT $limit",
            table = ChunkRecord::table_name(),
        );
        let undated_sql = format!(
            "SELECT * FROM {table} \
             WHERE metadata.{order_by} = NONE{clauses} \
             ORDER BY id ASC \
             LIMIT $limit",
            table = ChunkRecord::table_name(),
        );

        self.bounded("filtered_scan", async {
            let mut request = self.db.query(dated_sql).bind(("limit", k as i64));
            for (_, name, value) in filter.conditions() {
                request = request.bind((name, value.clone()));
            }
            if let Some(types) = resource_types.clone() {
                request = request.bind(("types", types));
            }
            let mut response = request.await?;
            let mut chunks: Vec<ChunkRecord> = response.take(0)?;

            if chunks.len() < k {
                let remaining = k - chunks.len();
                let mut request = self
                    .db
                    .query(undated_sql)
                    .bind(("limit", remaining as i64));
                for (_, name, value) in filter.conditions() {
                    request = request.bind((name, value.clone()));
                }
                if let Some(types) = resource_types {
                    request = request.bind(("types", types));
                }
                let mut response = request.await?;
                let undated: Vec<ChunkRecord> = response.take(0)?;
                chunks.extend(undated);
            }

            Ok(chunks)
        })
        .await
    }

    /// Number of persisted chunks for one resource id.
    pub async fn chunk_count_for_resource(&self, resource_id: &str) -> Result<usize, AppError> {
        let _lease = self.gate.checkout(&self.db).await?;

        let resource_id = resource_id.to_owned();
        self.bounded("chunk_count_for_resource", async {
            let mut response = self
                .db
                .query(format!(
                    "SELECT count() AS count FROM {table} \
                     WHERE metadata.resource_id = $resource_id GROUP ALL",
                    table = ChunkRecord::table_name(),
                ))
                .bind(("resource_id", resource_id))
                .await?;
            let row: Option<CountRow> = response.take(0)?;
            Ok(row.map_or(0, |r| r.count))
        })
        .await
    }

    pub async fn chunk_count(&self) -> Result<usize, AppError> {
        let _lease = self.gate.checkout(&self.db).await?;

        self.bounded("chunk_count", async {
            let mut response = self
                .db
                .query(format!(
                    "SELECT count() AS count FROM {table} GROUP ALL",
                    table = ChunkRecord::table_name(),
                ))
                .await?;
            let row: Option<CountRow> = response.take(0)?;
            Ok(row.map_or(0, |r| r.count))
        })
        .await
    }

    pub async fn stats(&self) -> Result<StoreStats, AppError> {
        let chunk_count = self.chunk_count().await?;
        let GateStats {
            pool_size,
            pool_checked_out,
            pool_overflow,
        } = self.gate.stats();

        Ok(StoreStats {
            chunk_count,
            pool_size,
            pool_checked_out,
            pool_overflow,
        })
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }
}

fn filter_fragment(filter: &MetadataFilter) -> String {
    let mut fragment = String::new();
    for (path, name, _) in filter.conditions() {
        fragment.push_str(" AND ");
        fragment.push_str(path);
        fragment.push_str(" = $");
        fragment.push_str(name);
    }
    fragment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::indexes::ensure_runtime_indexes;
    use crate::storage::types::chunk::chunk_id_for;
    use uuid::Uuid;

    const DIM: usize = 4;

    async fn test_store() -> VectorStore {
        let db = Arc::new(
            SurrealDbClient::memory("vector_store_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        ensure_runtime_indexes(&db, DIM)
            .await
            .expect("failed to build runtime indexes");

        let gate = StoreGate::new(4, 2, Duration::from_secs(5));
        VectorStore::new(db, gate, Duration::from_secs(10))
    }

    fn chunk(resource_id: &str, index: usize, content: &str, embedding: Vec<f32>) -> ChunkRecord {
        let metadata = ChunkMetadata {
            patient_id: Some("p-1".to_string()),
            resource_id: resource_id.to_string(),
            resource_type: "Observation".to_string(),
            full_url: format!("urn:uuid:{resource_id}"),
            chunk_id: chunk_id_for(resource_id, index),
            chunk_index: index,
            total_chunks: 1,
            chunk_size: content.chars().count(),
            effective_date: Some("2024-01-15".to_string()),
            ..ChunkMetadata::default()
        };
        ChunkRecord::new(content.to_string(), embedding, metadata)
    }

    #[tokio::test]
    async fn upsert_batch_is_idempotent() {
        let store = test_store().await;
        let batch = vec![
            chunk("obs-1", 0, "cholesterol total 195", vec![1.0, 0.0, 0.0, 0.0]),
            chunk("obs-1", 1, "ldl 120 mg/dL", vec![0.0, 1.0, 0.0, 0.0]),
        ];

        store.upsert_batch(&batch).await.expect("first upsert");
        store.upsert_batch(&batch).await.expect("second upsert");

        assert_eq!(
            store.chunk_count().await.expect("count"),
            2,
            "replaying a batch must not grow the store"
        );
        assert_eq!(
            store
                .chunk_count_for_resource("obs-1")
                .await
                .expect("per-resource count"),
            2
        );
    }

    #[tokio::test]
    async fn dense_search_orders_by_similarity() {
        let store = test_store().await;
        store
            .upsert_batch(&[
                chunk("a", 0, "alpha", vec![1.0, 0.0, 0.0, 0.0]),
                chunk("b", 0, "beta", vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .expect("upsert");

        let results = store
            .dense_search(vec![0.0, 1.0, 0.0, 0.0], 2, &MetadataFilter::default())
            .await
            .expect("dense search");

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.metadata.resource_id, "b");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn dense_search_applies_equality_filter() {
        let store = test_store().await;
        let mut other = chunk("c", 0, "gamma", vec![1.0, 0.0, 0.0, 0.0]);
        other.metadata.patient_id = Some("p-2".to_string());

        store
            .upsert_batch(&[
                chunk("a", 0, "alpha", vec![1.0, 0.0, 0.0, 0.0]),
                other,
            ])
            .await
            .expect("upsert");

        let filter = MetadataFilter::for_patient("p-2");
        let results = store
            .dense_search(vec![1.0, 0.0, 0.0, 0.0], 5, &filter)
            .await
            .expect("dense search");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.metadata.patient_id.as_deref(), Some("p-2"));
    }

    #[tokio::test]
    async fn sparse_search_matches_tokens_and_misses_cleanly() {
        let store = test_store().await;
        store
            .upsert_batch(&[
                chunk(
                    "obs-1",
                    0,
                    "Cholesterol total 195 mg/dL on 2024-01-15",
                    vec![1.0, 0.0, 0.0, 0.0],
                ),
                chunk("cond-1", 0, "essential hypertension", vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .expect("upsert");

        let hits = store
            .sparse_search("cholesterol", 5, &MetadataFilter::default())
            .await
            .expect("sparse search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.metadata.resource_id, "obs-1");
        assert!(hits[0].score > 0.0);

        let misses = store
            .sparse_search("zygomatic", 5, &MetadataFilter::default())
            .await
            .expect("sparse search with unknown token");
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn filtered_scan_orders_dates_descending_with_missing_last() {
        let store = test_store().await;

        let mut old = chunk("obs-old", 0, "older reading", vec![1.0, 0.0, 0.0, 0.0]);
        old.metadata.effective_date = Some("2023-03-01".to_string());
        let mut new = chunk("obs-new", 0, "newer reading", vec![0.0, 1.0, 0.0, 0.0]);
        new.metadata.effective_date = Some("2024-06-01".to_string());
        let mut undated = chunk("obs-undated", 0, "no date", vec![0.0, 0.0, 1.0, 0.0]);
        undated.metadata.effective_date = None;

        store
            .upsert_batch(&[old, new, undated])
            .await
            .expect("upsert");

        let results = store
            .filtered_scan(
                &MetadataFilter::for_patient("p-1"),
                None,
                "effective_date",
                10,
            )
            .await
            .expect("scan");

        let ids: Vec<_> = results
            .iter()
            .map(|c| c.metadata.resource_id.as_str())
            .collect();
        assert_eq!(ids, vec!["obs-new", "obs-old", "obs-undated"]);
    }

    #[tokio::test]
    async fn filtered_scan_restricts_resource_types() {
        let store = test_store().await;

        let mut observation = chunk("obs-1", 0, "bp 120/80", vec![1.0, 0.0, 0.0, 0.0]);
        observation.metadata.resource_type = "Observation".to_string();
        let mut condition = chunk("cond-1", 0, "hypertension", vec![0.0, 1.0, 0.0, 0.0]);
        condition.metadata.resource_type = "Condition".to_string();

        store
            .upsert_batch(&[observation, condition])
            .await
            .expect("upsert");

        let results = store
            .filtered_scan(
                &MetadataFilter::for_patient("p-1"),
                Some(vec!["Condition".to_string()]),
                "effective_date",
                10,
            )
            .await
            .expect("scan");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.resource_type, "Condition");
    }

    #[tokio::test]
    async fn scan_rejects_unknown_order_key() {
        let store = test_store().await;
        let err = store
            .filtered_scan(&MetadataFilter::default(), None, "content", 5)
            .await
            .expect_err("order key must be whitelisted");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn stats_reports_count_and_gate() {
        let store = test_store().await;
        store
            .upsert_batch(&[chunk("a", 0, "alpha", vec![1.0, 0.0, 0.0, 0.0])])
            .await
            .expect("upsert");

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.pool_size, 4);
        assert_eq!(stats.pool_checked_out, 0);
    }
}
