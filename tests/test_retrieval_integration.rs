//! Integration tests: hybrid retrieval pipeline
//!
//! Uses a deterministic topic-count embedder and mock cross-encoders so no
//! model download is needed.

use marketrag::config::Config;
use marketrag::embedding::{EmbeddingError, EmbeddingProvider, FastEmbedProvider};
use marketrag::retrieval::{
    CrossEncoder, CrossEncoderLoader, HybridSearcher, RerankError, RerankStatus, Reranker,
    RetrieveRequest, SearchError,
};
use marketrag::storage::{NewChunk, StorageManager};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

const TOPICS: [&str; 4] = ["rate", "earnings", "oil", "bitcoin"];

/// Embeds text as per-topic term counts plus a constant bias component
struct TopicEmbedder;

impl EmbeddingProvider for TopicEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let lower = text.to_lowercase();
        let mut vector: Vec<f32> = TOPICS
            .iter()
            .map(|t| lower.matches(t).count() as f32)
            .collect();
        vector.push(0.1);
        Ok(vector)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize {
        TOPICS.len() + 1
    }

    fn model_name(&self) -> &str {
        "topic-count"
    }
}

struct FailingEmbedder;

impl EmbeddingProvider for FailingEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::GenerationError("service down".to_string()))
    }

    fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::GenerationError("service down".to_string()))
    }

    fn dimension(&self) -> usize {
        TOPICS.len() + 1
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

/// Scores passages by how often they mention "cut"
struct CutCounter(String);

impl CrossEncoder for CutCounter {
    fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError> {
        Ok(documents
            .iter()
            .map(|d| d.to_lowercase().matches("cut").count() as f32)
            .collect())
    }

    fn model_name(&self) -> &str {
        &self.0
    }
}

/// Loads `CutCounter` for any model not starting with "broken"
struct MockLoader;

impl CrossEncoderLoader for MockLoader {
    fn load(&self, model: &str) -> Result<Arc<dyn CrossEncoder>, RerankError> {
        if model.starts_with("broken") {
            return Err(RerankError::InitializationError(format!("no weights for {}", model)));
        }
        Ok(Arc::new(CutCounter(model.to_string())))
    }
}

const CORPUS: &[(&str, Option<&str>, i64, &str)] = &[
    ("sec", Some("AAPL-10K"), 0, "Apple earnings beat estimates and earnings guidance was raised"),
    ("sec", Some("AAPL-10K"), 1, "Services earnings grew while hardware slowed"),
    ("news", Some("FED-1"), 0, "The Fed held the policy rate steady; rate cuts expected later"),
    ("news", Some("FED-1"), 1, "Markets price two cuts after the rate decision, rate path unclear"),
    ("news", Some("OIL-1"), 0, "Oil prices jump as supply tightens"),
    ("macro", Some("FED-2"), 0, "Treasury yields fall on rate cut bets"),
    ("news", Some("BTC-1"), 0, "Bitcoin rallies past resistance"),
    ("news", None, 0, "Rate rumor without a document"),
];

fn test_config() -> Config {
    let mut config = Config::default();
    config.embedding.dimension = TOPICS.len() + 1;
    config.indexing.keyword_writer_heap = 15_000_000;
    config.reranker.api_key_env = "MARKETRAG_IT_UNSET_RERANK_KEY".to_string();
    config
}

fn seed(storage: &StorageManager) {
    let embedder = TopicEmbedder;
    let chunks: Vec<NewChunk> = CORPUS
        .iter()
        .map(|(source, document, index, content)| {
            let mut chunk = NewChunk::new(*source, *content)
                .with_embedding(embedder.embed(content).unwrap());
            if let Some(document) = document {
                chunk = chunk.with_document(*document, *index);
            }
            chunk
        })
        .collect();
    storage.database.insert_chunks(&chunks).unwrap();
}

fn setup_with(config: &Config) -> (TempDir, HybridSearcher) {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::new(temp.path().to_path_buf()).unwrap();
    seed(&storage);

    let searcher = HybridSearcher::new(Arc::new(TopicEmbedder), &storage, config)
        .unwrap()
        .with_reranker(Reranker::with_loader(&config.reranker, Arc::new(MockLoader)));
    (temp, searcher)
}

fn setup() -> (TempDir, HybridSearcher) {
    setup_with(&test_config())
}

fn ids(outcome: &marketrag::retrieval::RetrieveOutcome) -> Vec<i64> {
    outcome.hits.iter().map(|h| h.chunk.id).collect()
}

#[tokio::test]
async fn test_dense_search_ordering() {
    let (_temp, searcher) = setup();

    let hits = searcher.search_dense("rate", 10).await.unwrap();

    assert_eq!(hits.len(), CORPUS.len());
    assert!(hits.iter().all(|c| c.bm25.is_none()));
    for pair in hits.windows(2) {
        assert!(pair[0].dist.unwrap() <= pair[1].dist.unwrap());
    }

    let top: HashSet<i64> = hits.iter().take(4).map(|c| c.chunk_id).collect();
    assert_eq!(top, HashSet::from([3, 4, 6, 8]));
}

#[tokio::test]
async fn test_sparse_search_ordering() {
    let (_temp, searcher) = setup();

    let hits = searcher.search_sparse("rate", 10).await.unwrap();

    assert!(!hits.is_empty());
    assert!(hits.iter().all(|c| c.dist.is_none()));
    for pair in hits.windows(2) {
        assert!(pair[0].bm25.unwrap() >= pair[1].bm25.unwrap());
    }
    let found: HashSet<i64> = hits.iter().map(|c| c.chunk_id).collect();
    assert_eq!(found, HashSet::from([3, 4, 6, 8]));

    // Implicit AND
    let both = searcher.search_sparse("rate cut", 10).await.unwrap();
    let found: HashSet<i64> = both.iter().map(|c| c.chunk_id).collect();
    assert_eq!(found, HashSet::from([6]));
}

#[tokio::test]
async fn test_empty_query() {
    let (_temp, searcher) = setup();

    assert!(searcher.search_sparse("", 10).await.unwrap().is_empty());
    assert!(!searcher.search_dense("", 10).await.unwrap().is_empty());

    let outcome = searcher
        .retrieve(&RetrieveRequest::new("").with_sparse(true))
        .await
        .unwrap();
    assert!(!outcome.hits.is_empty());
    assert!(outcome.hits.iter().all(|h| h.bm25.is_none()));
}

#[tokio::test]
async fn test_dedup_keeps_one_chunk_per_document() {
    let (_temp, searcher) = setup();

    let outcome = searcher.retrieve(&RetrieveRequest::new("rate")).await.unwrap();

    let documents: Vec<&str> = outcome
        .hits
        .iter()
        .map(|h| h.chunk.document_id.as_deref().unwrap())
        .collect();
    let unique: HashSet<&str> = documents.iter().copied().collect();
    assert_eq!(documents.len(), unique.len());
    // The document-less chunk is dropped
    assert!(!ids(&outcome).contains(&8));
    let top: HashSet<&str> = documents.iter().take(2).copied().collect();
    assert_eq!(top, HashSet::from(["FED-1", "FED-2"]));

    for pair in outcome.hits.windows(2) {
        assert!(pair[0].dist.unwrap() <= pair[1].dist.unwrap());
    }
}

#[tokio::test]
async fn test_dedup_disabled_keeps_every_chunk() {
    let (_temp, searcher) = setup();

    let outcome = searcher
        .retrieve(&RetrieveRequest::new("rate").with_dedup(false))
        .await
        .unwrap();

    assert_eq!(outcome.hits.len(), CORPUS.len());
    assert!(ids(&outcome).contains(&8));
}

#[tokio::test]
async fn test_source_filter() {
    let (_temp, searcher) = setup();

    let outcome = searcher
        .retrieve(
            &RetrieveRequest::new("rate")
                .with_dedup(false)
                .with_sources(vec!["macro".to_string()]),
        )
        .await
        .unwrap();

    assert_eq!(ids(&outcome), vec![6]);
}

#[tokio::test]
async fn test_empty_source_list_is_no_filter() {
    let (_temp, searcher) = setup();

    let outcome = searcher
        .retrieve(
            &RetrieveRequest::new("rate")
                .with_dedup(false)
                .with_sources(Vec::new()),
        )
        .await
        .unwrap();

    // No filter and no dedup: every chunk, including the one without a document
    assert_eq!(outcome.hits.len(), CORPUS.len());
    assert!(ids(&outcome).contains(&8));
}

#[tokio::test]
async fn test_top_k_contract() {
    let (_temp, searcher) = setup();

    let three = searcher
        .retrieve(&RetrieveRequest::new("earnings").with_top_k(3).with_dedup(false))
        .await
        .unwrap();
    assert_eq!(three.hits.len(), 3);

    let all = searcher
        .retrieve(&RetrieveRequest::new("earnings").with_top_k(100).with_dedup(false))
        .await
        .unwrap();
    assert_eq!(all.hits.len(), CORPUS.len());

    let small_pool = searcher
        .retrieve(&RetrieveRequest::new("earnings").with_pool(2).with_dedup(false))
        .await
        .unwrap();
    assert_eq!(small_pool.hits.len(), 2);
}

#[tokio::test]
async fn test_hybrid_fusion_scores() {
    let (_temp, searcher) = setup();

    let outcome = searcher
        .retrieve(
            &RetrieveRequest::new("oil")
                .with_sparse(true)
                .with_alpha(0.5)
                .with_dedup(false),
        )
        .await
        .unwrap();

    assert_eq!(outcome.hits[0].chunk.id, 5);
    assert!(outcome.hits[0].bm25.is_some());
    for pair in outcome.hits.windows(2) {
        assert!(pair[0].hybrid_score.unwrap() <= pair[1].hybrid_score.unwrap());
    }
    for hit in &outcome.hits {
        let score = hit.hybrid_score.unwrap();
        assert!((0.0..=1.0 + 1e-6).contains(&score));
    }
}

#[tokio::test]
async fn test_hosted_rerank_without_key_degrades() {
    let (_temp, searcher) = setup();
    let base = RetrieveRequest::new("rate").with_top_k(2);

    let plain = searcher.retrieve(&base).await.unwrap();
    let hosted = searcher
        .retrieve(&base.clone().with_rerank_model("cohere"))
        .await
        .unwrap();

    assert_eq!(ids(&hosted), ids(&plain));
    assert!(hosted.hits.iter().all(|h| h.rerank_score.is_none()));
    assert!(matches!(hosted.rerank, RerankStatus::Degraded { .. }));
    assert_eq!(plain.rerank, RerankStatus::NotRequested);
}

#[tokio::test]
async fn test_cross_encoder_rerank() {
    let (_temp, searcher) = setup();

    let outcome = searcher
        .retrieve(
            &RetrieveRequest::new("rate")
                .with_dedup(false)
                .with_top_k(3)
                .with_rerank_model("mock-ce"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.hits.len(), 3);
    assert_eq!(
        outcome.rerank,
        RerankStatus::Applied {
            model: "mock-ce".to_string()
        }
    );
    for pair in outcome.hits.windows(2) {
        assert!(pair[0].rerank_score.unwrap() >= pair[1].rerank_score.unwrap());
    }
    assert_eq!(outcome.hits[0].rerank_score, Some(1.0));
}

#[tokio::test]
async fn test_cross_encoder_fallback_and_failure() {
    let (_temp, searcher) = setup();

    let fallback = searcher
        .retrieve(&RetrieveRequest::new("rate").with_rerank_model("broken-large"))
        .await
        .unwrap();
    assert_eq!(
        fallback.rerank,
        RerankStatus::Applied {
            model: "jinaai/jina-reranker-v1-turbo-en".to_string()
        }
    );

    let mut config = test_config();
    config.reranker.fallback_model = "broken-light".to_string();
    let (_temp, searcher) = setup_with(&config);

    let err = searcher
        .retrieve(&RetrieveRequest::new("rate").with_rerank_model("broken-large"))
        .await
        .unwrap_err();
    match err {
        SearchError::Rerank(RerankError::AllModelsFailed { failures }) => {
            assert_eq!(failures.len(), 2)
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_retrieve() {
    let (_temp, searcher) = setup();
    let searcher = Arc::new(searcher);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let searcher = searcher.clone();
        handles.push(tokio::spawn(async move {
            searcher
                .retrieve(&RetrieveRequest::new("rate cut").with_sparse(true))
                .await
                .map(|o| o.hits.iter().map(|h| h.chunk.id).collect::<Vec<_>>())
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    assert!(results.iter().all(|r| *r == results[0]));
    assert_eq!(searcher.indexes().status(), (true, true));
}

#[tokio::test]
async fn test_empty_corpus() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::new(temp.path().to_path_buf()).unwrap();
    let searcher =
        HybridSearcher::new(Arc::new(TopicEmbedder), &storage, &test_config()).unwrap();

    let outcome = searcher
        .retrieve(&RetrieveRequest::new("rate").with_sparse(true).with_rerank(true))
        .await
        .unwrap();
    assert!(outcome.hits.is_empty());
    assert_eq!(outcome.rerank, RerankStatus::Skipped);
}

#[tokio::test]
async fn test_errors_are_fatal_to_the_call() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::new(temp.path().to_path_buf()).unwrap();
    seed(&storage);
    let config = test_config();

    let searcher = HybridSearcher::new(Arc::new(FailingEmbedder), &storage, &config).unwrap();
    let err = searcher
        .retrieve(&RetrieveRequest::new("rate").with_sparse(true))
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::EmbeddingUnavailable(_)));

    let err = searcher
        .retrieve(&RetrieveRequest::new("rate").with_top_k(0))
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::InvalidRequest(_)));

    let mut wrong_dim = test_config();
    wrong_dim.embedding.dimension = 384;
    assert!(HybridSearcher::new(Arc::new(TopicEmbedder), &storage, &wrong_dim).is_err());
}

#[tokio::test]
#[ignore] // Requires model download
async fn test_fastembed_end_to_end() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::new(temp.path().to_path_buf()).unwrap();
    let provider = Arc::new(FastEmbedProvider::with_default_model().unwrap());

    let texts = [
        ("FOMC", "The Federal Reserve left its benchmark interest rate unchanged."),
        ("NVDA", "Nvidia reported record data center revenue for the quarter."),
        ("WTI", "Crude oil futures climbed after OPEC announced output cuts."),
    ];
    let contents: Vec<String> = texts.iter().map(|(_, t)| t.to_string()).collect();
    let embeddings = provider.embed_batch(&contents).unwrap();
    let chunks: Vec<NewChunk> = texts
        .iter()
        .zip(embeddings)
        .map(|((doc, text), embedding)| {
            NewChunk::new("news", *text)
                .with_document(*doc, 0)
                .with_embedding(embedding)
        })
        .collect();
    storage.database.insert_chunks(&chunks).unwrap();

    let searcher = HybridSearcher::new(provider, &storage, &Config::default()).unwrap();
    let outcome = searcher
        .retrieve(&RetrieveRequest::new("central bank policy decision").with_top_k(1))
        .await
        .unwrap();

    assert_eq!(outcome.hits[0].chunk.document_id.as_deref(), Some("FOMC"));
}
