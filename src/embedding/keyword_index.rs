/// Tantivy keyword index for BM25 full-text search
use std::cmp::Reverse;
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, FAST, INDEXED, STORED, TEXT};
use tantivy::{
    doc, DocId, Index, IndexReader, IndexWriter, ReloadPolicy, Score, SegmentReader,
    TantivyDocument, TantivyError,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeywordIndexError {
    #[error("Index initialization failed: {0}")]
    InitializationError(String),

    #[error("Insert failed: {0}")]
    InsertError(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("Tantivy error: {0}")]
    TantivyError(#[from] TantivyError),
}

/// Search result with ID and relevance score
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordSearchResult {
    /// Chunk id
    pub id: i64,
    /// BM25 relevance score (higher is more relevant)
    pub score: f32,
}

/// Tantivy keyword index wrapper
///
/// Opening is "create if not exists". After `sync` the index is only read, so
/// searches need no locking.
pub struct KeywordIndex {
    index: Index,
    reader: IndexReader,
    id_field: Field,
    content_field: Field,
}

impl KeywordIndex {
    /// Open the index in `index_path`, creating it if absent
    pub fn open_or_create(index_path: &Path) -> Result<Self, KeywordIndexError> {
        std::fs::create_dir_all(index_path)
            .map_err(|e| KeywordIndexError::InitializationError(e.to_string()))?;

        let directory = MmapDirectory::open(index_path)
            .map_err(|e| KeywordIndexError::InitializationError(e.to_string()))?;

        let index = Index::open_or_create(directory, Self::schema())?;
        let schema = index.schema();

        let id_field = schema.get_field("id").map_err(|_| {
            KeywordIndexError::InitializationError("Missing 'id' field in schema".to_string())
        })?;
        let content_field = schema.get_field("content").map_err(|_| {
            KeywordIndexError::InitializationError("Missing 'content' field in schema".to_string())
        })?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            id_field,
            content_field,
        })
    }

    fn schema() -> Schema {
        let mut schema_builder = Schema::builder();
        schema_builder.add_u64_field("id", INDEXED | STORED | FAST);
        schema_builder.add_text_field("content", TEXT);
        schema_builder.build()
    }

    /// Highest chunk id recorded by the last commit, 0 for a fresh index
    pub fn last_indexed_id(&self) -> Result<i64, KeywordIndexError> {
        let metas = self.index.load_metas()?;
        Ok(metas
            .payload
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0))
    }

    /// Add `(id, content)` rows and commit, recording the highest id
    ///
    /// Rows must be ascending by id and newer than `last_indexed_id`.
    pub fn sync(&self, rows: &[(i64, String)], writer_heap: usize) -> Result<usize, KeywordIndexError> {
        let Some((max_id, _)) = rows.last() else {
            return Ok(0);
        };

        let mut writer: IndexWriter = self.index.writer(writer_heap)?;

        for (id, content) in rows {
            let id = u64::try_from(*id)
                .map_err(|_| KeywordIndexError::InsertError(format!("Invalid id: {}", id)))?;
            writer
                .add_document(doc!(
                    self.id_field => id,
                    self.content_field => content.as_str(),
                ))
                .map_err(|e| KeywordIndexError::InsertError(e.to_string()))?;
        }

        let mut prepared = writer.prepare_commit()?;
        prepared.set_payload(&max_id.to_string());
        prepared.commit()?;

        self.reader.reload()?;

        Ok(rows.len())
    }

    /// Search the index
    ///
    /// Quoted phrases are honored and bare terms are combined with AND. Parse
    /// errors are ignored: whatever part of the query is usable is run, and a
    /// query with nothing usable matches nothing.
    ///
    /// # Returns
    /// Hits descending by score, ties broken by id ascending
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<KeywordSearchResult>, KeywordIndexError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();

        let mut query_parser = QueryParser::for_index(&self.index, vec![self.content_field]);
        query_parser.set_conjunction_by_default();
        let (query, errors) = query_parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!("Ignored {} query parse errors", errors.len());
        }

        // Rank on (score, lowest id) so the cut at `limit` already honors the
        // id tie-break across segments
        let collector = TopDocs::with_limit(limit).tweak_score(|segment_reader: &SegmentReader| {
            let ids = segment_reader.fast_fields().u64("id").ok();
            move |doc: DocId, score: Score| {
                let id = ids.as_ref().and_then(|c| c.first(doc)).unwrap_or(u64::MAX);
                (score, Reverse(id))
            }
        });

        let top_docs = searcher
            .search(&query, &collector)
            .map_err(|e| KeywordIndexError::SearchError(e.to_string()))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for ((score, _), doc_address) in top_docs {
            let retrieved_doc: TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| KeywordIndexError::SearchError(e.to_string()))?;

            let id = retrieved_doc
                .get_first(self.id_field)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| {
                    KeywordIndexError::SearchError("Missing or invalid ID field".to_string())
                })?;

            results.push(KeywordSearchResult {
                id: id as i64,
                score,
            });
        }

        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

        Ok(results)
    }

    /// Get the number of documents in the index
    pub fn len(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Check if index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
