//! Embedding & Indexing
//!
//! - EmbeddingProvider trait for abstraction, FastEmbedProvider for local
//!   embedding (all-MiniLM-L6-v2, 384-dim)
//! - HNSW for vector similarity search
//! - Tantivy for BM25 keyword search
//! - Batch backfill of missing embeddings

mod batch;
mod keyword_index;
mod provider;
mod vector_index;

pub use batch::{BatchProcessor, BatchResult};
pub use keyword_index::{KeywordIndex, KeywordIndexError, KeywordSearchResult};
pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider};
pub use vector_index::{SearchResult, VectorIndex, VectorIndexError};
