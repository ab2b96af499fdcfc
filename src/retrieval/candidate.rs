//! Per-query candidate records and hydrated results

use crate::storage::Chunk;
use serde::{Deserialize, Serialize};

/// A chunk id with whichever ranking signals found it
///
/// Lives for one retrieval call. `dist` is lower-is-better, `bm25` and
/// `rerank_score` are higher-is-better, `hybrid_score` is lower-is-better.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub chunk_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bm25: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hybrid_score: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl Candidate {
    /// Candidate found by vector search
    pub fn dense(chunk_id: i64, dist: f32) -> Self {
        Self {
            chunk_id,
            dist: Some(dist),
            ..Default::default()
        }
    }

    /// Candidate found by keyword search
    pub fn sparse(chunk_id: i64, bm25: f32) -> Self {
        Self {
            chunk_id,
            bm25: Some(bm25),
            ..Default::default()
        }
    }
}

/// A candidate joined with its stored chunk; the record callers receive
///
/// Only the score fields set by the stages that ran are serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: Chunk,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bm25: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hybrid_score: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl ScoredChunk {
    /// Attach a candidate's scores to its chunk
    pub fn new(chunk: Chunk, candidate: &Candidate) -> Self {
        Self {
            chunk,
            dist: candidate.dist,
            bm25: candidate.bm25,
            hybrid_score: candidate.hybrid_score,
            rerank_score: candidate.rerank_score,
        }
    }

    pub fn chunk_id(&self) -> i64 {
        self.chunk.id
    }

    /// Lower-is-better score used to pick one chunk per document:
    /// negated rerank score, else distance, else `1 - bm25`
    pub fn comparison_score(&self) -> f32 {
        if let Some(rerank) = self.rerank_score {
            -rerank
        } else if let Some(dist) = self.dist {
            dist
        } else {
            1.0 - self.bm25.unwrap_or(0.0)
        }
    }

    /// Get a short preview of the content (first N characters)
    pub fn preview(&self, max_chars: usize) -> String {
        match self.chunk.content.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}...", &self.chunk.content[..idx]),
            None => self.chunk.content.clone(),
        }
    }
}
