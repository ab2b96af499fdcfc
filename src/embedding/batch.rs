/// Batch embedding of stored chunks that arrived without a vector
use super::{EmbeddingError, EmbeddingProvider};
use crate::error::Result;
use crate::storage::Database;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of batch processing
#[derive(Debug, Default)]
pub struct BatchResult {
    pub processed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Fills missing embeddings in the chunk store
///
/// Walks the store by ascending id in batches of `batch_size`, so a batch the
/// provider rejects is counted as failed and skipped rather than retried
/// forever.
pub struct BatchProcessor {
    provider: Arc<dyn EmbeddingProvider>,
    database: Database,
    batch_size: usize,
}

impl BatchProcessor {
    /// Create a new batch processor
    ///
    /// # Arguments
    /// * `provider` - Embedding provider
    /// * `database` - Chunk store to read from and write back to
    /// * `batch_size` - Number of texts to embed in one call
    pub fn new(provider: Arc<dyn EmbeddingProvider>, database: Database, batch_size: usize) -> Self {
        Self {
            provider,
            database,
            batch_size: batch_size.max(1),
        }
    }

    /// Embed every chunk that has no embedding yet
    pub async fn process(&self) -> Result<BatchResult> {
        let start = std::time::Instant::now();
        let mut result = BatchResult::default();
        let mut cursor = 0i64;

        loop {
            let pending = self.database.missing_embeddings(cursor, self.batch_size)?;
            let Some((last_id, _)) = pending.last() else {
                break;
            };
            cursor = *last_id;

            let count = pending.len();
            match self.process_chunk(pending).await {
                Ok(()) => {
                    result.processed += count;
                    debug!("Embedded batch of {} chunks (up to id {})", count, cursor);
                }
                Err(e) => {
                    warn!("Failed to embed batch ending at chunk {}: {}", cursor, e);
                    result.failed += count;
                }
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Embedding backfill complete: {} processed, {} failed, {}ms",
            result.processed, result.failed, result.duration_ms
        );

        Ok(result)
    }

    async fn process_chunk(&self, pending: Vec<(i64, String)>) -> Result<()> {
        let provider = self.provider.clone();
        let database = self.database.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let texts: Vec<String> = pending.iter().map(|(_, text)| text.clone()).collect();
            let embeddings = provider.embed_batch(&texts)?;

            if embeddings.len() != pending.len() {
                return Err(EmbeddingError::GenerationError(format!(
                    "Embedding count mismatch: expected {}, got {}",
                    pending.len(),
                    embeddings.len()
                ))
                .into());
            }

            let items: Vec<(i64, Vec<f32>)> = pending
                .into_iter()
                .map(|(id, _)| id)
                .zip(embeddings)
                .collect();
            database.set_embeddings(&items)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Embedding task failed: {}", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewChunk;
    use tempfile::TempDir;

    /// Embeds text as [len, 1.0]; fails on texts containing "poison"
    struct LengthEmbedder;

    impl EmbeddingProvider for LengthEmbedder {
        fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            if text.contains("poison") {
                return Err(EmbeddingError::InvalidInput(text.to_string()));
            }
            Ok(vec![text.len() as f32, 1.0])
        }

        fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
            texts.iter().map(|t| self.embed(t)).collect()
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "length"
        }
    }

    #[tokio::test]
    async fn test_backfill_fills_missing() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("db.sqlite")).unwrap();
        db.insert_chunks(&[
            NewChunk::new("sec", "abc").with_document("d", 0),
            NewChunk::new("sec", "abcd")
                .with_document("d", 1)
                .with_embedding(vec![9.0, 9.0]),
            NewChunk::new("sec", "ab").with_document("d", 2),
        ])
        .unwrap();

        let processor = BatchProcessor::new(Arc::new(LengthEmbedder), db.clone(), 1);
        let result = processor.process().await.unwrap();

        assert_eq!(result.processed, 2);
        assert_eq!(result.failed, 0);
        assert_eq!(db.get_chunk(1).unwrap().unwrap().embedding, Some(vec![3.0, 1.0]));
        assert_eq!(db.get_chunk(2).unwrap().unwrap().embedding, Some(vec![9.0, 9.0]));
        assert_eq!(db.get_chunk(3).unwrap().unwrap().embedding, Some(vec![2.0, 1.0]));
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("db.sqlite")).unwrap();
        db.insert_chunks(&[
            NewChunk::new("sec", "poison pill").with_document("d", 0),
            NewChunk::new("sec", "fine").with_document("d", 1),
        ])
        .unwrap();

        let processor = BatchProcessor::new(Arc::new(LengthEmbedder), db.clone(), 1);
        let result = processor.process().await.unwrap();

        assert_eq!(result.processed, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(db.missing_embeddings(0, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("db.sqlite")).unwrap();

        let processor = BatchProcessor::new(Arc::new(LengthEmbedder), db, 8);
        let result = processor.process().await.unwrap();
        assert_eq!(result.processed, 0);
    }
}
