use std::cmp::Ordering;
use std::collections::HashMap;

use common::storage::vector_store::ScoredChunk;
use serde::{Deserialize, Serialize};

use crate::RetrievedChunk;

/// Weights for the linear fusion of the two retrieval signals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FusionWeights {
    pub sparse: f32,
    pub dense: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            sparse: 0.5,
            dense: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
struct Fused {
    chunk: common::storage::types::chunk::ChunkRecord,
    sparse_norm: f32,
    dense_norm: f32,
}

/// Merge dense and sparse result lists into one ranking.
///
/// Dense scores are normalized by rank (`1 - i/n`), which is robust against
/// similarity-scale drift between embedding model versions. Sparse scores are
/// divided by the set maximum. A chunk present on only one side contributes
/// zero on the other. Ordering is fully deterministic: combined score, then
/// sparse-normalized score, then chunk id.
pub fn fuse(
    dense: Vec<ScoredChunk>,
    sparse: Vec<ScoredChunk>,
    weights: FusionWeights,
) -> Vec<RetrievedChunk> {
    let mut merged: HashMap<String, Fused> = HashMap::new();

    let mut dense = dense;
    dense.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    let n = dense.len();
    for (rank, hit) in dense.into_iter().enumerate() {
        let dense_norm = 1.0 - (rank as f32) / (n as f32);
        merged.insert(
            hit.chunk.id.clone(),
            Fused {
                chunk: hit.chunk,
                sparse_norm: 0.0,
                dense_norm,
            },
        );
    }

    let max_sparse = sparse
        .iter()
        .map(|hit| hit.score)
        .fold(0.0f32, f32::max);
    for hit in sparse {
        let sparse_norm = if max_sparse > 0.0 {
            (hit.score / max_sparse).clamp(0.0, 1.0)
        } else {
            0.0
        };
        merged
            .entry(hit.chunk.id.clone())
            .and_modify(|entry| entry.sparse_norm = sparse_norm)
            .or_insert(Fused {
                chunk: hit.chunk,
                sparse_norm,
                dense_norm: 0.0,
            });
    }

    let mut results: Vec<(Fused, f32)> = merged
        .into_values()
        .map(|entry| {
            let combined = weights.sparse * entry.sparse_norm + weights.dense * entry.dense_norm;
            (entry, combined)
        })
        .collect();

    results.sort_by(|(a, score_a), (b, score_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.sparse_norm
                    .partial_cmp(&a.sparse_norm)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });

    results
        .into_iter()
        .map(|(entry, combined)| RetrievedChunk {
            chunk: entry.chunk,
            score: combined,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::{chunk_id_for, ChunkMetadata, ChunkRecord};

    fn scored(resource_id: &str, score: f32) -> ScoredChunk {
        let metadata = ChunkMetadata {
            resource_id: resource_id.to_string(),
            resource_type: "Observation".to_string(),
            full_url: format!("urn:uuid:{resource_id}"),
            chunk_id: chunk_id_for(resource_id, 0),
            chunk_index: 0,
            total_chunks: 1,
            chunk_size: 4,
            ..ChunkMetadata::default()
        };
        ScoredChunk {
            chunk: ChunkRecord::new("text".to_string(), vec![0.0; 4], metadata),
            score,
        }
    }

    #[test]
    fn dense_normalization_is_rank_based() {
        let dense = vec![scored("a", 0.99), scored("b", 0.42), scored("c", 0.41)];
        let results = fuse(dense, Vec::new(), FusionWeights::default());

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].chunk.metadata.resource_id, "a");
        // Top rank gets 1.0 regardless of the raw similarity scale.
        assert!((results[0].score - 0.5).abs() < 1e-6);
        assert!((results[1].score - 0.5 * (1.0 - 1.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn sparse_scores_divide_by_max() {
        let sparse = vec![scored("a", 8.0), scored("b", 4.0)];
        let results = fuse(Vec::new(), sparse, FusionWeights::default());

        assert!((results[0].score - 0.5).abs() < 1e-6);
        assert!((results[1].score - 0.25).abs() < 1e-6);
    }

    #[test]
    fn zero_max_sparse_contributes_nothing() {
        let sparse = vec![scored("a", 0.0), scored("b", 0.0)];
        let results = fuse(Vec::new(), sparse, FusionWeights::default());
        assert!(results.iter().all(|r| r.score == 0.0));
    }

    #[test]
    fn chunks_on_both_sides_accumulate_both_signals() {
        let dense = vec![scored("shared", 0.9), scored("dense-only", 0.5)];
        let sparse = vec![scored("shared", 6.0), scored("sparse-only", 3.0)];

        let results = fuse(dense, sparse, FusionWeights::default());

        assert_eq!(results[0].chunk.metadata.resource_id, "shared");
        // dense_norm 1.0 and sparse_norm 1.0 at equal weights.
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_sparse_side_yields_dense_only_ranking() {
        let dense = vec![scored("a", 0.8), scored("b", 0.7)];
        let results = fuse(dense, Vec::new(), FusionWeights::default());

        let ids: Vec<_> = results
            .iter()
            .map(|r| r.chunk.metadata.resource_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn ties_break_on_sparse_then_chunk_id() {
        // Both get combined 0.5: one purely dense (top rank), one purely sparse (max).
        let dense = vec![scored("zz-dense", 0.9)];
        let sparse = vec![scored("aa-sparse", 5.0)];

        let results = fuse(dense, sparse, FusionWeights::default());
        assert_eq!(results[0].chunk.metadata.resource_id, "aa-sparse");
        assert_eq!(results[1].chunk.metadata.resource_id, "zz-dense");
    }

    #[test]
    fn fusion_is_deterministic() {
        let dense = vec![scored("a", 0.9), scored("b", 0.8), scored("c", 0.7)];
        let sparse = vec![scored("b", 4.0), scored("d", 2.0)];

        let first = fuse(dense.clone(), sparse.clone(), FusionWeights::default());
        let second = fuse(dense, sparse, FusionWeights::default());

        let order = |results: &[RetrievedChunk]| {
            results
                .iter()
                .map(|r| r.chunk.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(order(&first), order(&second));
    }

    #[test]
    fn custom_weights_shift_the_ranking() {
        let dense = vec![scored("dense-top", 0.9)];
        let sparse = vec![scored("sparse-top", 5.0)];

        let dense_heavy = fuse(
            dense.clone(),
            sparse.clone(),
            FusionWeights {
                sparse: 0.1,
                dense: 0.9,
            },
        );
        assert_eq!(dense_heavy[0].chunk.metadata.resource_id, "dense-top");

        let sparse_heavy = fuse(
            dense,
            sparse,
            FusionWeights {
                sparse: 0.9,
                dense: 0.1,
            },
        );
        assert_eq!(sparse_heavy[0].chunk.metadata.resource_id, "sparse-top");
    }
}
