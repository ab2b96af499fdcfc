/// HNSW vector index for approximate nearest neighbor search
use hnsw_rs::prelude::*;
use thiserror::Error;

/// Upper bound on HNSW layers
const MAX_LAYER: usize = 16;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Invalid id: {0}")]
    InvalidId(i64),
}

/// Nearest-neighbor hit
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Chunk id
    pub id: i64,
    /// Cosine distance (0.0 = identical direction, lower is more similar)
    pub distance: f32,
}

/// HNSW vector index wrapper
///
/// Built once from the stored embeddings and read-only afterwards, so it can be
/// shared across concurrent searches without locking.
pub struct VectorIndex {
    index: Hnsw<'static, f32, DistCosine>,
    dimension: usize,
    count: usize,
}

impl VectorIndex {
    /// Create an empty index sized for `capacity` vectors
    ///
    /// # Arguments
    /// * `dimension` - Vector dimension (must match embedding dimension)
    /// * `m` - HNSW M parameter (number of connections per layer)
    /// * `ef_construction` - HNSW construction parameter
    /// * `capacity` - Expected number of vectors
    pub fn new(dimension: usize, m: usize, ef_construction: usize, capacity: usize) -> Self {
        let index = Hnsw::<f32, DistCosine>::new(
            m,
            capacity.max(1),
            MAX_LAYER,
            ef_construction,
            DistCosine,
        );

        Self {
            index,
            dimension,
            count: 0,
        }
    }

    /// Build an index from `(id, vector)` pairs
    ///
    /// Vectors of the wrong dimension are skipped with a warning rather than
    /// failing the whole build.
    pub fn build(
        dimension: usize,
        m: usize,
        ef_construction: usize,
        items: &[(i64, Vec<f32>)],
    ) -> Self {
        let mut index = Self::new(dimension, m, ef_construction, items.len());
        for (id, vector) in items {
            if let Err(e) = index.insert(*id, vector) {
                tracing::warn!("Skipping chunk {} in vector index: {}", id, e);
            }
        }
        index
    }

    /// Insert a vector into the index
    pub fn insert(&mut self, id: i64, vector: &[f32]) -> Result<(), VectorIndexError> {
        if vector.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let data_id = usize::try_from(id).map_err(|_| VectorIndexError::InvalidId(id))?;

        self.index.insert_slice((vector, data_id));
        self.count += 1;

        Ok(())
    }

    /// Search for the `k` nearest neighbors
    ///
    /// # Returns
    /// Hits ascending by distance, ties broken by id ascending
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<SearchResult>, VectorIndexError> {
        if query.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        if k == 0 || self.count == 0 {
            return Ok(Vec::new());
        }

        let mut results: Vec<SearchResult> = self
            .index
            .search(query, k, ef_search.max(k))
            .into_iter()
            .map(|neighbor| SearchResult {
                id: neighbor.d_id as i64,
                distance: neighbor.distance,
            })
            .collect();

        results.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(k);

        Ok(results)
    }

    /// Get the number of vectors in the index
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if index is empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Get vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}
