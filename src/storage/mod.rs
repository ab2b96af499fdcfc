//! Storage layer for marketrag
//!
//! Owns the on-disk layout: the SQLite chunk store and the directory the
//! keyword index lives in.

pub mod chunk;
pub mod database;

use crate::error::{MarketRagError, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};

pub use chunk::{Chunk, NewChunk};
pub use database::{Database, DbPool, DbStats, InsertStats};

/// Chunks inserted per transaction during import
const IMPORT_BATCH: usize = 1000;

/// Storage manager that coordinates the chunk database and index directories
pub struct StorageManager {
    pub database: Database,
    base_path: PathBuf,
}

impl StorageManager {
    /// Create a new storage manager rooted at `base_path`
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let store = base_path.join("store");

        for dir in [store.clone(), store.join("keywords")] {
            std::fs::create_dir_all(&dir).map_err(|e| MarketRagError::Io {
                source: e,
                context: format!("Failed to create directory: {}", dir.display()),
            })?;
        }

        let database = Database::new(&store.join("chunks.sqlite"))?;

        Ok(Self {
            database,
            base_path,
        })
    }

    /// Directory holding rebuildable machine data
    pub fn store_dir(&self) -> PathBuf {
        self.base_path.join("store")
    }

    /// Directory of the tantivy keyword index
    pub fn keyword_index_dir(&self) -> PathBuf {
        self.store_dir().join("keywords")
    }

    /// Import chunks from a JSON-lines file (one `NewChunk` per line)
    ///
    /// Blank lines are ignored. Embeddings whose length differs from
    /// `dimension` are rejected with the offending line number.
    pub fn import_jsonl(&self, path: &Path, dimension: usize) -> Result<InsertStats> {
        let file = std::fs::File::open(path).map_err(|e| MarketRagError::Io {
            source: e,
            context: format!("Failed to open import file: {}", path.display()),
        })?;
        let reader = std::io::BufReader::new(file);

        let mut total = InsertStats::default();
        let mut batch = Vec::with_capacity(IMPORT_BATCH);

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|e| MarketRagError::Io {
                source: e,
                context: format!("Failed to read line {} of {}", line_no, path.display()),
            })?;
            if line.trim().is_empty() {
                continue;
            }

            let chunk: NewChunk =
                serde_json::from_str(&line).map_err(|e| MarketRagError::Json {
                    source: e,
                    context: format!("Line {} of {}", line_no, path.display()),
                })?;

            if let Some(embedding) = &chunk.embedding {
                if embedding.len() != dimension {
                    return Err(MarketRagError::InvalidChunk {
                        line: line_no,
                        message: format!(
                            "embedding has {} dimensions, expected {}",
                            embedding.len(),
                            dimension
                        ),
                    });
                }
            }

            batch.push(chunk);
            if batch.len() == IMPORT_BATCH {
                let stats = self.database.insert_chunks(&batch)?;
                total.inserted += stats.inserted;
                total.skipped += stats.skipped;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            let stats = self.database.insert_chunks(&batch)?;
            total.inserted += stats.inserted;
            total.skipped += stats.skipped;
        }

        tracing::info!(
            "Imported {} chunks from {} ({} already present)",
            total.inserted,
            path.display(),
            total.skipped
        );

        Ok(total)
    }
}
