//! Hybrid search combining semantic and keyword search

use crate::config::{Config, RerankerConfig, RetrievalConfig};
use crate::embedding::{EmbeddingError, EmbeddingProvider, KeywordIndexError, VectorIndexError};
use crate::error::MarketRagError;
use crate::retrieval::{
    deduplicate_chunks, fuse, Candidate, IndexKind, IndexManager, RerankError, RerankStatus,
    RerankStrategy, Reranker, RetrieveOutcome, RetrieveRequest, ScoredChunk,
};
use crate::storage::{Chunk, Database, StorageManager};
use ahash::{HashMap, HashMapExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(#[source] EmbeddingError),

    #[error("{kind} index unavailable: {reason}")]
    IndexUnavailable { kind: IndexKind, reason: String },

    #[error("Vector search failed: {0}")]
    VectorSearch(#[from] VectorIndexError),

    #[error("Keyword search failed: {0}")]
    KeywordSearch(#[from] KeywordIndexError),

    #[error("Chunk store error: {0}")]
    Store(String),

    #[error(transparent)]
    Rerank(#[from] RerankError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Hybrid searcher combining semantic and keyword search
///
/// Holds no per-query state; share it behind an `Arc` and call
/// [`retrieve`](Self::retrieve) from any number of tasks.
pub struct HybridSearcher {
    embedding_provider: Arc<dyn EmbeddingProvider>,
    database: Database,
    indexes: IndexManager,
    reranker: Reranker,
    defaults: RetrievalConfig,
    reranker_config: RerankerConfig,
    default_strategy: RerankStrategy,
    dimension: usize,
    ef_search: usize,
    embedding_timeout: Option<Duration>,
}

impl HybridSearcher {
    /// Create a new hybrid searcher over `storage`
    ///
    /// Fails if the provider's dimension differs from `embedding.dimension`.
    pub fn new(
        embedding_provider: Arc<dyn EmbeddingProvider>,
        storage: &StorageManager,
        config: &Config,
    ) -> crate::Result<Self> {
        let dimension = config.embedding.dimension;
        if embedding_provider.dimension() != dimension {
            return Err(MarketRagError::Embedding(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: embedding_provider.dimension(),
            }));
        }

        let indexes = IndexManager::new(
            storage.database.clone(),
            storage.keyword_index_dir(),
            dimension,
            config.indexing.clone(),
        );

        Ok(Self {
            embedding_provider,
            database: storage.database.clone(),
            indexes,
            reranker: Reranker::new(&config.reranker),
            defaults: config.retrieval.clone(),
            reranker_config: config.reranker.clone(),
            default_strategy: RerankStrategy::resolve(
                &config.retrieval.rerank_model,
                &config.reranker,
            ),
            dimension,
            ef_search: config.indexing.hnsw_ef_search,
            embedding_timeout: config.retrieval.embedding_timeout_ms.map(Duration::from_millis),
        })
    }

    /// Replace the reranker, e.g. one with a custom cross-encoder loader
    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// A request for `query` with the configured defaults
    pub fn request(&self, query: impl Into<String>) -> RetrieveRequest {
        RetrieveRequest::from_config(query, &self.defaults)
    }

    /// Run the full pipeline: search, fuse, hydrate, dedup, rerank
    pub async fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveOutcome, SearchError> {
        request.validate()?;

        let pool = if request.use_sparse {
            let (dense, sparse) = tokio::join!(
                self.search_dense(&request.query, request.pool_n),
                self.search_sparse(&request.query, request.pool_n)
            );
            let (dense, sparse) = (dense?, sparse?);
            debug!(
                "Fusing {} dense and {} sparse candidates (alpha {})",
                dense.len(),
                sparse.len(),
                request.alpha
            );
            fuse(&dense, &sparse, request.alpha, request.pool_n)
        } else {
            self.search_dense(&request.query, request.pool_n).await?
        };

        if pool.is_empty() {
            let rerank = if request.rerank {
                RerankStatus::Skipped
            } else {
                RerankStatus::NotRequested
            };
            return Ok(RetrieveOutcome {
                hits: Vec::new(),
                rerank,
            });
        }

        let mut hits = self.hydrate(pool)?;

        let sources = request.sources.as_deref().filter(|s| !s.is_empty());
        if request.dedup || sources.is_some() {
            hits = deduplicate_chunks(hits, sources);
        }

        if !request.rerank {
            hits.truncate(request.top_k);
            return Ok(RetrieveOutcome {
                hits,
                rerank: RerankStatus::NotRequested,
            });
        }

        let requested;
        let strategy = match &request.rerank_model {
            Some(name) => {
                requested = RerankStrategy::resolve(name, &self.reranker_config);
                &requested
            }
            None => &self.default_strategy,
        };

        debug!("Reranking {} chunks with {}", hits.len(), strategy.label());
        let (hits, rerank) = self
            .reranker
            .rerank(&request.query, hits, strategy, request.top_k)
            .await?;

        Ok(RetrieveOutcome { hits, rerank })
    }

    /// Nearest chunks to the query embedding, ascending by distance
    pub async fn search_dense(&self, query: &str, n: usize) -> Result<Vec<Candidate>, SearchError> {
        let (index, embedding) =
            tokio::join!(self.indexes.ensure_dense_index(), self.embed_query(query));
        let (index, embedding) = (index?, embedding?);

        let results = index.search(&embedding, n, self.ef_search.max(n))?;

        Ok(results
            .into_iter()
            .map(|r| Candidate::dense(r.id, r.distance))
            .collect())
    }

    /// BM25 matches for the query, descending by score
    pub async fn search_sparse(&self, query: &str, n: usize) -> Result<Vec<Candidate>, SearchError> {
        let index = self.indexes.ensure_sparse_index().await?;
        let results = index.search(query, n)?;

        Ok(results
            .into_iter()
            .map(|r| Candidate::sparse(r.id, r.score))
            .collect())
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, SearchError> {
        let provider = self.embedding_provider.clone();
        let text = query.to_string();
        let task = tokio::task::spawn_blocking(move || provider.embed(&text));

        let joined = match self.embedding_timeout {
            Some(limit) => tokio::time::timeout(limit, task).await.map_err(|_| {
                SearchError::EmbeddingUnavailable(EmbeddingError::Timeout(limit.as_millis() as u64))
            })?,
            None => task.await,
        };

        let embedding = joined
            .map_err(|e| {
                SearchError::EmbeddingUnavailable(EmbeddingError::GenerationError(format!(
                    "Embedding task failed: {}",
                    e
                )))
            })?
            .map_err(SearchError::EmbeddingUnavailable)?;

        if embedding.len() != self.dimension {
            return Err(SearchError::EmbeddingUnavailable(
                EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                },
            ));
        }

        Ok(embedding)
    }

    /// Join candidates with their stored chunks, keeping pool order
    fn hydrate(&self, pool: Vec<Candidate>) -> Result<Vec<ScoredChunk>, SearchError> {
        let ids: Vec<i64> = pool.iter().map(|c| c.chunk_id).collect();
        let chunks = self
            .database
            .get_chunks(&ids)
            .map_err(|e| SearchError::Store(format!("Failed to get chunks: {}", e)))?;

        let mut by_id: HashMap<i64, Chunk> = HashMap::with_capacity(chunks.len());
        for chunk in chunks {
            by_id.insert(chunk.id, chunk);
        }

        let mut hits = Vec::with_capacity(pool.len());
        for candidate in pool {
            match by_id.remove(&candidate.chunk_id) {
                Some(chunk) => hits.push(ScoredChunk::new(chunk, &candidate)),
                None => warn!("Chunk {} is indexed but missing from the store", candidate.chunk_id),
            }
        }

        Ok(hits)
    }
}
