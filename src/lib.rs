//! marketrag - Hybrid retrieval over financial text chunks
//!
//! Fuses approximate-nearest-neighbor search over chunk embeddings with BM25
//! keyword ranking, keeps one chunk per source document and optionally
//! reranks the pool with a cross-encoder or a hosted rerank API.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod retrieval;
pub mod storage;

pub use error::{MarketRagError, Result};
