use std::collections::HashMap;

use parking_lot::RwLock;

use crate::distance::{l2_normalize, unit_distance};
use crate::error::VecError;
use crate::index::{AnnIndex, Neighbor};

/// FlatIndex is an exact [`AnnIndex`] using brute-force scans.
/// Intended for tests and small sets (a few thousand vectors).
pub struct FlatIndex {
    dim: usize,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: RwLock::new(HashMap::new()),
        }
    }

    fn unit(&self, id: &str, v: &[f32]) -> Result<Vec<f32>, VecError> {
        if v.len() != self.dim {
            return Err(VecError::DimensionMismatch {
                got: v.len(),
                want: self.dim,
            });
        }
        let mut out = v.to_vec();
        if !l2_normalize(&mut out) {
            return Err(VecError::ZeroVector(id.to_string()));
        }
        Ok(out)
    }

    fn ranked(&self, q: &[f32]) -> Vec<Neighbor> {
        let vecs = self.vectors.read();
        let mut out: Vec<Neighbor> = vecs
            .iter()
            .map(|(id, v)| Neighbor {
                id: id.clone(),
                distance: unit_distance(q, v),
            })
            .collect();
        out.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

impl AnnIndex for FlatIndex {
    fn insert(&self, id: &str, vector: &[f32]) -> Result<(), VecError> {
        let v = self.unit(id, vector)?;
        self.vectors.write().insert(id.to_string(), v);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool, VecError> {
        Ok(self.vectors.write().remove(id).is_some())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VecError> {
        let q = self.unit("<query>", query)?;
        let mut out = self.ranked(&q);
        out.truncate(k);
        Ok(out)
    }

    fn search_within(
        &self,
        query: &[f32],
        max_distance: f32,
        limit: usize,
    ) -> Result<Vec<Neighbor>, VecError> {
        let q = self.unit("<query>", query)?;
        Ok(self
            .ranked(&q)
            .into_iter()
            .take_while(|n| n.distance <= max_distance)
            .take(limit)
            .collect())
    }

    fn contains(&self, id: &str) -> bool {
        self.vectors.read().contains_key(id)
    }

    fn len(&self) -> usize {
        self.vectors.read().len()
    }

    fn ids(&self) -> Vec<String> {
        self.vectors.read().keys().cloned().collect()
    }

    fn clear(&self) {
        self.vectors.write().clear();
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_exact_order() {
        let idx = FlatIndex::new(2);
        idx.insert("east", &[1.0, 0.0]).unwrap();
        idx.insert("north", &[0.0, 3.0]).unwrap();
        idx.insert("ne", &[1.0, 1.0]).unwrap();

        let hits = idx.search(&[2.0, 0.1], 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["east", "ne", "north"]);
    }

    #[test]
    fn test_flat_within_and_remove() {
        let idx = FlatIndex::new(2);
        idx.insert("a", &[1.0, 0.0]).unwrap();
        idx.insert("b", &[0.0, 1.0]).unwrap();
        assert_eq!(idx.search_within(&[1.0, 0.0], 0.5, 10).unwrap().len(), 1);

        assert!(idx.remove("a").unwrap());
        assert!(!idx.contains("a"));
        assert!(idx.search_within(&[1.0, 0.0], 0.5, 10).unwrap().is_empty());
    }

    #[test]
    fn test_flat_rejects_bad_input() {
        let idx = FlatIndex::new(3);
        assert!(idx.insert("a", &[1.0]).is_err());
        assert!(idx.insert("z", &[0.0, 0.0, 0.0]).is_err());
    }
}
