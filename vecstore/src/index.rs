use crate::error::VecError;

/// Neighbor is a single result from a vector similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// Identifier of the matched vector.
    pub id: String,

    /// `1 - cosine similarity` between the query and the matched vector.
    /// Lower values indicate higher similarity.
    pub distance: f32,
}

impl Neighbor {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// AnnIndex is the interface for nearest-neighbor search over unit vectors.
///
/// Vectors are normalized on the way in, so callers may pass raw
/// embeddings. All implementations use interior locking and are safe to
/// share across threads; searches may run concurrently with one writer.
pub trait AnnIndex: Send + Sync {
    /// Add a vector, replacing any previous vector stored under `id`.
    fn insert(&self, id: &str, vector: &[f32]) -> Result<(), VecError>;

    /// Remove a vector. Returns whether `id` was present.
    fn remove(&self, id: &str) -> Result<bool, VecError>;

    /// Return up to `k` nearest vectors in ascending distance.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VecError>;

    /// Return up to `limit` vectors within `max_distance`, ascending.
    fn search_within(
        &self,
        query: &[f32],
        max_distance: f32,
        limit: usize,
    ) -> Result<Vec<Neighbor>, VecError>;

    fn contains(&self, id: &str) -> bool;

    /// Number of vectors in the index.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All ids currently indexed, in no particular order.
    fn ids(&self) -> Vec<String>;

    /// Drop every vector.
    fn clear(&self);

    /// Vector dimension accepted by this index.
    fn dim(&self) -> usize;
}
