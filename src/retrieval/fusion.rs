//! Weighted score fusion of dense and sparse candidate pools

use crate::retrieval::Candidate;
use ahash::{HashMap, HashMapExt};

/// Default weight on dense distance
pub const DEFAULT_ALPHA: f32 = 0.5;

/// Distance assumed for a chunk the dense search did not return
const DENSE_MISS_DIST: f32 = 1.0;

/// Combined score of one chunk, lower is better
///
/// A dense miss counts as maximally dissimilar and a sparse miss as zero
/// lexical relevance. BM25 is clamped to 1.0 before inversion.
pub fn hybrid_score(dist: Option<f32>, bm25: Option<f32>, alpha: f32) -> f32 {
    let d = dist.unwrap_or(DENSE_MISS_DIST);
    let b = bm25.map(|b| b.min(1.0)).unwrap_or(0.0);
    alpha * d + (1.0 - alpha) * (1.0 - b)
}

/// Merge two candidate pools into one ranked pool
///
/// # Arguments
/// * `dense` - Candidates carrying `dist`
/// * `sparse` - Candidates carrying `bm25`
/// * `alpha` - Weight on dense distance; 1.0 ranks by distance only, 0.0 by BM25 only
/// * `n` - Maximum pool size
///
/// # Returns
/// Candidates with `hybrid_score` set, ascending by it, ties broken by chunk id
pub fn fuse(dense: &[Candidate], sparse: &[Candidate], alpha: f32, n: usize) -> Vec<Candidate> {
    let mut merged: HashMap<i64, Candidate> = HashMap::with_capacity(dense.len() + sparse.len());

    for candidate in dense.iter().chain(sparse.iter()) {
        let entry = merged
            .entry(candidate.chunk_id)
            .or_insert_with(|| Candidate {
                chunk_id: candidate.chunk_id,
                ..Default::default()
            });

        // A repeated id keeps its best value from each signal
        entry.dist = match (entry.dist, candidate.dist) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        entry.bm25 = match (entry.bm25, candidate.bm25) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    let mut fused: Vec<Candidate> = merged
        .into_values()
        .map(|mut candidate| {
            candidate.hybrid_score = Some(hybrid_score(candidate.dist, candidate.bm25, alpha));
            candidate
        })
        .collect();

    fused.sort_by(|a, b| {
        let sa = a.hybrid_score.unwrap_or(f32::INFINITY);
        let sb = b.hybrid_score.unwrap_or(f32::INFINITY);
        sa.total_cmp(&sb).then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused.truncate(n);

    fused
}
