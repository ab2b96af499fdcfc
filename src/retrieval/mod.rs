//! Hybrid Retrieval & Reranking
//!
//! Dense (HNSW) and sparse (BM25) search over the chunk store, weighted score
//! fusion, one-chunk-per-document deduplication and optional reranking by a
//! local cross-encoder or a hosted API.

mod candidate;
mod deduplication;
mod fusion;
mod hybrid;
mod index_manager;
mod reranker;

pub use candidate::{Candidate, ScoredChunk};
pub use deduplication::deduplicate_chunks;
pub use fusion::{fuse, hybrid_score, DEFAULT_ALPHA};
pub use hybrid::{HybridSearcher, SearchError};
pub use index_manager::{IndexKind, IndexManager, InitGuard};
pub use reranker::{
    truncate_chars, CredentialRef, CrossEncoder, CrossEncoderLoader, FastEmbedLoader,
    RerankError, RerankStatus, RerankStrategy, Reranker,
};

use crate::config::RetrievalConfig;
use serde::{Deserialize, Serialize};

/// One retrieval call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveRequest {
    /// Query text; may be empty
    pub query: String,

    /// Maximum number of results
    pub top_k: usize,

    /// Weight on dense distance in fusion (0..=1)
    pub alpha: f32,

    /// Also run keyword search and fuse
    pub use_sparse: bool,

    /// Candidate pool size for each search path
    pub pool_n: usize,

    pub rerank: bool,

    /// Reranker model; the configured default when unset
    pub rerank_model: Option<String>,

    /// Keep only chunks from these sources
    pub sources: Option<Vec<String>>,

    /// Keep one chunk per document
    pub dedup: bool,
}

impl RetrieveRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: 20,
            alpha: DEFAULT_ALPHA,
            use_sparse: false,
            pool_n: 200,
            rerank: false,
            rerank_model: None,
            sources: None,
            dedup: true,
        }
    }

    /// A request using the `[retrieval]` defaults
    pub fn from_config(query: impl Into<String>, config: &RetrievalConfig) -> Self {
        Self {
            query: query.into(),
            top_k: config.top_k,
            alpha: config.alpha,
            use_sparse: config.use_sparse,
            pool_n: config.pool_n,
            rerank: config.rerank,
            rerank_model: None,
            sources: None,
            dedup: config.dedup,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_sparse(mut self, use_sparse: bool) -> Self {
        self.use_sparse = use_sparse;
        self
    }

    pub fn with_pool(mut self, pool_n: usize) -> Self {
        self.pool_n = pool_n;
        self
    }

    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }

    /// Enable reranking with a specific model
    pub fn with_rerank_model(mut self, model: impl Into<String>) -> Self {
        self.rerank = true;
        self.rerank_model = Some(model.into());
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    /// Reject parameters the pipeline cannot honor
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.top_k == 0 {
            return Err(SearchError::InvalidRequest(
                "top_k must be greater than 0".to_string(),
            ));
        }
        if self.pool_n == 0 {
            return Err(SearchError::InvalidRequest(
                "pool_n must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(SearchError::InvalidRequest(format!(
                "alpha must be between 0 and 1, got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

/// Result of a retrieval call
#[derive(Debug, Clone, Serialize)]
pub struct RetrieveOutcome {
    pub hits: Vec<ScoredChunk>,
    pub rerank: RerankStatus,
}
