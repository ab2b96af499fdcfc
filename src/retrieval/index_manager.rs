//! Once-per-process index preparation
//!
//! Both search paths need an index over the chunk store before the first
//! query. [`IndexManager`] builds each at most once per process, lets
//! concurrent callers share one build and retries on the next call when a
//! build fails or its caller goes away.

use crate::config::IndexingConfig;
use crate::embedding::{KeywordIndex, VectorIndex};
use crate::retrieval::SearchError;
use crate::storage::Database;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Which index an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Dense,
    Sparse,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Dense => write!(f, "dense"),
            IndexKind::Sparse => write!(f, "sparse"),
        }
    }
}

enum InitState<T> {
    Uninitialized,
    InProgress,
    Ready(Arc<T>),
}

/// Async one-time initialization that is retried after failure
///
/// Unlike a plain once-cell, a failed or cancelled initializer leaves the
/// guard uninitialized, and one of the waiting callers takes over.
pub struct InitGuard<T> {
    state: Mutex<InitState<T>>,
    notify: Notify,
}

impl<T> Default for InitGuard<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InitGuard<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InitState::Uninitialized),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InitState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The value, if initialization has completed
    pub fn get(&self) -> Option<Arc<T>> {
        match &*self.lock() {
            InitState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Return the value, running `init` first if no caller has succeeded yet
    ///
    /// At most one `init` runs at a time. Callers arriving while it runs wait
    /// for its outcome instead of starting their own.
    pub async fn get_or_try_init<F, Fut, E>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            // Registered before the state check so a wakeup between the
            // check and the await is not lost
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                match &*state {
                    InitState::Ready(value) => return Ok(value.clone()),
                    InitState::InProgress => {}
                    InitState::Uninitialized => {
                        *state = InitState::InProgress;
                        break;
                    }
                }
            }
            notified.await;
        }

        let mut reset = ResetOnDrop {
            guard: self,
            armed: true,
        };

        let value = Arc::new(init().await?);

        reset.armed = false;
        *self.lock() = InitState::Ready(value.clone());
        self.notify.notify_waiters();

        Ok(value)
    }
}

/// Puts the guard back to `Uninitialized` unless disarmed
struct ResetOnDrop<'a, T> {
    guard: &'a InitGuard<T>,
    armed: bool,
}

impl<T> Drop for ResetOnDrop<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            *self.guard.lock() = InitState::Uninitialized;
            self.guard.notify.notify_waiters();
        }
    }
}

/// Lazily prepared dense and sparse indexes over one chunk store
pub struct IndexManager {
    database: Database,
    keyword_dir: PathBuf,
    dimension: usize,
    indexing: IndexingConfig,
    dense: InitGuard<VectorIndex>,
    sparse: InitGuard<KeywordIndex>,
}

impl IndexManager {
    /// # Arguments
    /// * `database` - Chunk store the indexes are built from
    /// * `keyword_dir` - Directory of the on-disk keyword index
    /// * `dimension` - Embedding dimension of the corpus
    /// * `indexing` - HNSW and writer parameters
    pub fn new(
        database: Database,
        keyword_dir: PathBuf,
        dimension: usize,
        indexing: IndexingConfig,
    ) -> Self {
        Self {
            database,
            keyword_dir,
            dimension,
            indexing,
            dense: InitGuard::new(),
            sparse: InitGuard::new(),
        }
    }

    /// Build the vector index from stored embeddings on first use
    pub async fn ensure_dense_index(&self) -> Result<Arc<VectorIndex>, SearchError> {
        self.dense
            .get_or_try_init(|| async {
                let database = self.database.clone();
                let dimension = self.dimension;
                let m = self.indexing.hnsw_m;
                let ef_construction = self.indexing.hnsw_ef_construction;

                let index = tokio::task::spawn_blocking(move || -> Result<VectorIndex, String> {
                    let rows = database.embeddings().map_err(|e| e.to_string())?;
                    debug!("Building vector index over {} embeddings", rows.len());
                    Ok(VectorIndex::build(dimension, m, ef_construction, &rows))
                })
                .await
                .map_err(|e| format!("index build task failed: {}", e))??;

                info!("Vector index ready ({} chunks)", index.len());
                Ok::<_, String>(index)
            })
            .await
            .map_err(|reason| SearchError::IndexUnavailable {
                kind: IndexKind::Dense,
                reason,
            })
    }

    /// Open the keyword index and add any chunks stored since its last commit
    pub async fn ensure_sparse_index(&self) -> Result<Arc<KeywordIndex>, SearchError> {
        self.sparse
            .get_or_try_init(|| async {
                let database = self.database.clone();
                let keyword_dir = self.keyword_dir.clone();
                let writer_heap = self.indexing.keyword_writer_heap;

                let index = tokio::task::spawn_blocking(move || -> Result<KeywordIndex, String> {
                    let index =
                        KeywordIndex::open_or_create(&keyword_dir).map_err(|e| e.to_string())?;
                    let last_id = index.last_indexed_id().map_err(|e| e.to_string())?;
                    let rows = database.contents_after(last_id).map_err(|e| e.to_string())?;
                    if !rows.is_empty() {
                        let added = index.sync(&rows, writer_heap).map_err(|e| e.to_string())?;
                        debug!("Added {} chunks to keyword index", added);
                    }
                    Ok(index)
                })
                .await
                .map_err(|e| format!("index build task failed: {}", e))??;

                info!("Keyword index ready ({} chunks)", index.len());
                Ok::<_, String>(index)
            })
            .await
            .map_err(|reason| SearchError::IndexUnavailable {
                kind: IndexKind::Sparse,
                reason,
            })
    }

    /// Whether each index has been prepared in this process
    pub fn status(&self) -> (bool, bool) {
        (self.dense.get().is_some(), self.sparse.get().is_some())
    }
}
