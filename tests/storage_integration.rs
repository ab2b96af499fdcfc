use marketrag::config::Config;
use marketrag::embedding::{BatchProcessor, EmbeddingError, EmbeddingProvider};
use marketrag::retrieval::{HybridSearcher, IndexManager, RetrieveRequest};
use marketrag::storage::StorageManager;
use rusqlite::params;
use std::sync::Arc;
use tempfile::TempDir;

/// Embeds text as [count("guidance"), count("tariff"), 0.1]
struct KeywordEmbedder;

impl EmbeddingProvider for KeywordEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let lower = text.to_lowercase();
        Ok(vec![
            lower.matches("guidance").count() as f32,
            lower.matches("tariff").count() as f32,
            0.1,
        ])
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize {
        3
    }

    fn model_name(&self) -> &str {
        "keyword"
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.embedding.dimension = 3;
    config.indexing.keyword_writer_heap = 15_000_000;
    config
}

fn write_jsonl(path: &std::path::Path, lines: &[&str]) {
    std::fs::write(path, lines.join("\n")).unwrap();
}

#[tokio::test]
async fn test_import_backfill_and_search() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("data");
    let file = temp.path().join("batch1.jsonl");
    write_jsonl(
        &file,
        &[
            r#"{"source":"sec","symbol":"MSFT","document_id":"MSFT-Q3","chunk_index":0,"content":"Management raised full-year guidance"}"#,
            r#"{"source":"sec","symbol":"MSFT","document_id":"MSFT-Q3","chunk_index":1,"content":"Tariff exposure remains limited","embedding":[0.0,1.0,0.1]}"#,
            r#"{"source":"news","symbol":"F","document_id":"F-NEWS","chunk_index":0,"content":"Automakers warn tariff costs will hit margins"}"#,
        ],
    );

    let storage = StorageManager::new(data_dir.clone()).unwrap();
    let stats = storage.import_jsonl(&file, 3).unwrap();
    assert_eq!(stats.inserted, 3);

    let provider = Arc::new(KeywordEmbedder);
    let result = BatchProcessor::new(provider.clone(), storage.database.clone(), 2)
        .process()
        .await
        .unwrap();
    assert_eq!(result.processed, 2);
    assert_eq!(result.failed, 0);

    let db_stats = storage.database.stats().unwrap();
    assert_eq!(db_stats.chunk_count, 3);
    assert_eq!(db_stats.embedded_count, 3);
    assert_eq!(db_stats.document_count, 2);

    let searcher = HybridSearcher::new(provider, &storage, &config()).unwrap();
    let outcome = searcher
        .retrieve(&RetrieveRequest::new("tariff").with_sparse(true))
        .await
        .unwrap();

    assert_eq!(outcome.hits.len(), 2);
    let first = &outcome.hits[0];
    assert!(first.chunk.content.to_lowercase().contains("tariff"));
    assert!(first.chunk.embedding.is_none());
}

#[tokio::test]
async fn test_keyword_index_survives_restart() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("data");

    let first = temp.path().join("first.jsonl");
    write_jsonl(
        &first,
        &[r#"{"source":"news","document_id":"A","content":"Guidance cut on weak demand","embedding":[1.0,0.0,0.1]}"#],
    );
    let second = temp.path().join("second.jsonl");
    write_jsonl(
        &second,
        &[r#"{"source":"news","document_id":"B","content":"Guidance reaffirmed despite tariff noise","embedding":[1.0,1.0,0.1]}"#],
    );

    {
        let storage = StorageManager::new(data_dir.clone()).unwrap();
        storage.import_jsonl(&first, 3).unwrap();
        let indexes = IndexManager::new(
            storage.database.clone(),
            storage.keyword_index_dir(),
            3,
            config().indexing,
        );
        assert_eq!(indexes.ensure_sparse_index().await.unwrap().len(), 1);
    }

    let storage = StorageManager::new(data_dir.clone()).unwrap();
    storage.import_jsonl(&second, 3).unwrap();
    // Re-importing the first batch adds nothing
    assert_eq!(storage.import_jsonl(&first, 3).unwrap().inserted, 0);

    let indexes = IndexManager::new(
        storage.database.clone(),
        storage.keyword_index_dir(),
        3,
        config().indexing,
    );
    let sparse = indexes.ensure_sparse_index().await.unwrap();
    assert_eq!(sparse.len(), 2);
    assert_eq!(sparse.search("guidance", 10).unwrap().len(), 2);
}

#[test]
fn test_migrations_apply_once() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("data");

    drop(StorageManager::new(data_dir.clone()).unwrap());
    let storage = StorageManager::new(data_dir).unwrap();

    let conn = storage.database.get_conn().unwrap();
    let applied: i64 = conn
        .query_row("SELECT COUNT(*) FROM _migrations", params![], |row| row.get(0))
        .unwrap();
    assert_eq!(applied, 1);
}
