//! SQLite chunk store with migrations
//!
//! Holds the `text_chunks` rows the retrieval engine reads. Schema creation is
//! "create if not exists" so concurrent first openers do not conflict.

use crate::error::{MarketRagError, Result};
use crate::storage::chunk::{decode_embedding, encode_embedding, Chunk, NewChunk};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::path::Path;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Ids per `IN (...)` lookup
const LOOKUP_BATCH: usize = 500;

const CHUNK_COLUMNS: &str = "id, source, symbol, document_id, chunk_index, content";

/// Database manager with migration support
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

/// Outcome of inserting a batch of chunks
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InsertStats {
    pub inserted: usize,
    /// Rows whose (document_id, chunk_index) already existed
    pub skipped: usize,
}

impl Database {
    /// Open (or create) the database at `db_path`
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MarketRagError::Io {
                source: e,
                context: format!("Failed to create database directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder().max_size(16).build(manager)?;

        let db = Self { pool };
        db.migrate()?;

        Ok(db)
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying migration {}", version);

                conn.execute_batch(migration)?;

                conn.execute(
                    "INSERT OR IGNORE INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    /// Insert chunks in one transaction, skipping rows that collide on
    /// `(document_id, chunk_index)`
    pub fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<InsertStats> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut stats = InsertStats::default();
        let now = chrono::Utc::now().timestamp();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO text_chunks
                    (source, symbol, document_id, chunk_index, content, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(document_id, chunk_index) DO NOTHING",
            )?;

            for chunk in chunks {
                let blob = chunk.embedding.as_deref().map(encode_embedding);
                let changed = stmt.execute(params![
                    chunk.source,
                    chunk.symbol,
                    chunk.document_id,
                    chunk.chunk_index,
                    chunk.content,
                    blob,
                    now,
                ])?;
                if changed == 0 {
                    stats.skipped += 1;
                } else {
                    stats.inserted += 1;
                }
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    /// Fetch chunks by id, without embeddings. Missing ids are omitted and the
    /// result order is unspecified.
    pub fn get_chunks(&self, ids: &[i64]) -> Result<Vec<Chunk>> {
        let conn = self.get_conn()?;
        let mut chunks = Vec::with_capacity(ids.len());

        for batch in ids.chunks(LOOKUP_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM text_chunks WHERE id IN ({})",
                CHUNK_COLUMNS, placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(batch.iter()), row_to_chunk)?;
            for row in rows {
                chunks.push(row?);
            }
        }

        Ok(chunks)
    }

    /// Fetch a single chunk, including its embedding
    pub fn get_chunk(&self, id: i64) -> Result<Option<Chunk>> {
        let conn = self.get_conn()?;
        let chunk = conn
            .query_row(
                &format!("SELECT {}, embedding FROM text_chunks WHERE id = ?1", CHUNK_COLUMNS),
                params![id],
                |row| {
                    let mut chunk = row_to_chunk(row)?;
                    let blob: Option<Vec<u8>> = row.get(6)?;
                    chunk.embedding = blob.as_deref().and_then(decode_embedding);
                    Ok(chunk)
                },
            )
            .optional()?;
        Ok(chunk)
    }

    /// All stored embeddings as `(id, vector)`, ascending by id
    pub fn embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, embedding FROM text_chunks WHERE embedding IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            match decode_embedding(&blob) {
                Some(vector) => out.push((id, vector)),
                None => tracing::warn!("Chunk {} has a malformed embedding blob", id),
            }
        }
        Ok(out)
    }

    /// `(id, content)` of chunks with id greater than `after_id`, ascending
    pub fn contents_after(&self, after_id: i64) -> Result<Vec<(i64, String)>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT id, content FROM text_chunks WHERE id > ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![after_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Up to `limit` chunks lacking an embedding with id greater than `after_id`
    pub fn missing_embeddings(&self, after_id: i64, limit: usize) -> Result<Vec<(i64, String)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content FROM text_chunks
             WHERE embedding IS NULL AND id > ?1
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Store embeddings for existing chunks
    pub fn set_embeddings(&self, items: &[(i64, Vec<f32>)]) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE text_chunks SET embedding = ?1 WHERE id = ?2")?;
            for (id, vector) in items {
                stmt.execute(params![encode_embedding(vector), id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        let conn = self.get_conn()?;

        let chunk_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM text_chunks", [], |row| row.get(0))?;

        let embedded_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM text_chunks WHERE embedding IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        let document_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT document_id) FROM text_chunks",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT source, COUNT(*) FROM text_chunks GROUP BY source ORDER BY source",
        )?;
        let rows = stmt.query_map([], |row| {
            let source: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((source, count as usize))
        })?;
        let mut sources = Vec::new();
        for row in rows {
            sources.push(row?);
        }

        Ok(DbStats {
            chunk_count: chunk_count as usize,
            embedded_count: embedded_count as usize,
            document_count: document_count as usize,
            sources,
        })
    }
}

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        source: row.get(1)?,
        symbol: row.get(2)?,
        document_id: row.get(3)?,
        chunk_index: row.get(4)?,
        content: row.get(5)?,
        embedding: None,
    })
}

/// Database statistics
#[derive(Debug)]
pub struct DbStats {
    pub chunk_count: usize,
    pub embedded_count: usize,
    pub document_count: usize,
    /// Chunk count per source
    pub sources: Vec<(String, usize)>,
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    CREATE TABLE IF NOT EXISTS text_chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        symbol TEXT,
        document_id TEXT,
        chunk_index INTEGER NOT NULL DEFAULT 0,
        content TEXT NOT NULL,
        embedding BLOB,
        created_at INTEGER NOT NULL,
        UNIQUE (document_id, chunk_index)
    );

    CREATE INDEX IF NOT EXISTS idx_text_chunks_source ON text_chunks(source);
    CREATE INDEX IF NOT EXISTS idx_text_chunks_document ON text_chunks(document_id);
    CREATE INDEX IF NOT EXISTS idx_text_chunks_symbol ON text_chunks(symbol);
    "#,
];
