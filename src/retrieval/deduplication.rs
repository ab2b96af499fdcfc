//! Collapse results to one chunk per logical document

use crate::retrieval::ScoredChunk;
use ahash::{HashMap, HashMapExt};

/// Keep the best-scoring chunk of each document
///
/// Chunks whose source is not in `allowed_sources` (when non-empty) and chunks
/// without a `document_id` (absent or empty) are dropped. The winner of each document is the
/// chunk with the lowest [`ScoredChunk::comparison_score`]; on equal scores the
/// earlier chunk wins.
///
/// # Returns
/// Winners ascending by comparison score; equal scores keep upstream order
pub fn deduplicate_chunks(
    chunks: Vec<ScoredChunk>,
    allowed_sources: Option<&[String]>,
) -> Vec<ScoredChunk> {
    // document_id -> (score, position in `kept`)
    let mut best: HashMap<String, (f32, usize)> = HashMap::new();
    let mut kept: Vec<Option<ScoredChunk>> = Vec::new();

    let allowed_sources = allowed_sources.filter(|s| !s.is_empty());

    for chunk in chunks {
        if let Some(allowed) = allowed_sources {
            if !allowed.iter().any(|s| *s == chunk.chunk.source) {
                continue;
            }
        }
        let Some(document_id) = chunk.chunk.document_id.clone().filter(|d| !d.is_empty()) else {
            continue;
        };

        let score = chunk.comparison_score();
        match best.get_mut(&document_id) {
            Some((best_score, slot)) => {
                if score < *best_score {
                    *best_score = score;
                    kept[*slot] = Some(chunk);
                }
            }
            None => {
                best.insert(document_id, (score, kept.len()));
                kept.push(Some(chunk));
            }
        }
    }

    let mut winners: Vec<ScoredChunk> = kept.into_iter().flatten().collect();
    winners.sort_by(|a, b| a.comparison_score().total_cmp(&b.comparison_score()));
    winners
}
