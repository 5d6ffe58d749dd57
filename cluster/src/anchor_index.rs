use std::collections::{HashMap, HashSet};
use std::path::Path;

use parking_lot::RwLock;
use tracing::{info, warn};

use facegroup_faceprint::PoseCategory;
use facegroup_vecstore::{AnnIndex, HnswConfig, HnswIndex, LoadOutcome, open_or_empty, save_file};

use crate::config::IntegrityConfig;
use crate::error::Result;
use crate::types::Anchor;

/// One anchor returned by a lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorHit {
    pub anchor_id: String,
    pub cluster_id: String,
    pub similarity: f32,
    pub pose: PoseCategory,
    pub quality: f32,
}

#[derive(Debug, Clone)]
struct AnchorMeta {
    cluster_id: String,
    pose: PoseCategory,
    quality: f32,
}

/// Result of comparing the index with the authoritative active anchors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrityReport {
    pub expected: usize,
    pub indexed: usize,
    /// Active anchors absent from the graph.
    pub missing: Vec<String>,
    /// Indexed ids that are not active anchors.
    pub orphaned: Vec<String>,
    /// Indexed anchors mapped to the wrong cluster.
    pub stale: Vec<String>,
    pub needs_rebuild: bool,
}

impl IntegrityReport {
    pub fn drift(&self) -> usize {
        self.missing.len() + self.orphaned.len()
    }

    pub fn is_clean(&self) -> bool {
        self.drift() == 0 && self.stale.is_empty()
    }
}

/// AnchorIndex specializes the ANN graph to active anchors, remembering
/// each anchor's cluster, pose and quality.
///
/// The graph holds only anchor ids; a hit whose id has no cluster mapping
/// is stale and never returned.
pub struct AnchorIndex {
    ann: HnswIndex,
    meta: RwLock<HashMap<String, AnchorMeta>>,
}

impl AnchorIndex {
    pub fn new(cfg: HnswConfig) -> Self {
        Self {
            ann: HnswIndex::new(cfg),
            meta: RwLock::new(HashMap::new()),
        }
    }

    /// Load a persisted graph. Cluster mappings must be attached from the
    /// store with [`AnchorIndex::attach`] before use.
    pub fn open(path: &Path, cfg: HnswConfig) -> (Self, LoadOutcome) {
        let (ann, outcome) = open_or_empty(path, cfg);
        (
            Self {
                ann,
                meta: RwLock::new(HashMap::new()),
            },
            outcome,
        )
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_file(&self.ann, path)?;
        Ok(())
    }

    /// Set cluster mappings for already-indexed anchors.
    pub fn attach(&self, anchors: &[Anchor]) {
        let mut meta = self.meta.write();
        meta.clear();
        for a in anchors.iter().filter(|a| a.active) {
            meta.insert(a.id.clone(), meta_of(a));
        }
    }

    /// Replace the whole index with the given active anchors.
    pub fn rebuild(&self, anchors: &[Anchor]) -> Result<usize> {
        self.ann.clear();
        self.meta.write().clear();
        let mut n = 0;
        for a in anchors.iter().filter(|a| a.active) {
            self.add(a)?;
            n += 1;
        }
        info!(anchors = n, "cluster: anchor index rebuilt");
        Ok(n)
    }

    pub fn add(&self, anchor: &Anchor) -> Result<()> {
        self.ann.insert(&anchor.id, &anchor.embedding)?;
        self.meta.write().insert(anchor.id.clone(), meta_of(anchor));
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        self.meta.write().remove(id);
        Ok(self.ann.remove(id)?)
    }

    /// Point an indexed anchor at another cluster without re-inserting it.
    pub fn reassign(&self, id: &str, cluster_id: &str) {
        if let Some(m) = self.meta.write().get_mut(id) {
            m.cluster_id = cluster_id.to_string();
        }
    }

    pub fn len(&self) -> usize {
        self.ann.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ann.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ann.contains(id)
    }

    fn hits(&self, found: Vec<facegroup_vecstore::Neighbor>) -> Vec<AnchorHit> {
        let meta = self.meta.read();
        found
            .into_iter()
            .filter_map(|n| {
                meta.get(&n.id).map(|m| AnchorHit {
                    similarity: n.similarity(),
                    anchor_id: n.id,
                    cluster_id: m.cluster_id.clone(),
                    pose: m.pose,
                    quality: m.quality,
                })
            })
            .collect()
    }

    /// Up to `k` nearest anchors, most similar first.
    pub fn find_nearest(&self, embedding: &[f32], k: usize) -> Result<Vec<AnchorHit>> {
        if self.ann.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.hits(self.ann.search(embedding, k)?))
    }

    /// Anchors with similarity at least `min_similarity`, most similar first.
    pub fn find_matching(
        &self,
        embedding: &[f32],
        min_similarity: f32,
        max_results: usize,
    ) -> Result<Vec<AnchorHit>> {
        if self.ann.is_empty() {
            return Ok(Vec::new());
        }
        let found = self.ann.search_within(embedding, 1.0 - min_similarity, max_results)?;
        Ok(self.hits(found))
    }

    /// Compare indexed ids with the authoritative active anchor set.
    pub fn check_integrity(&self, active: &[Anchor], cfg: &IntegrityConfig) -> IntegrityReport {
        let expected: HashMap<&str, &Anchor> = active
            .iter()
            .filter(|a| a.active)
            .map(|a| (a.id.as_str(), a))
            .collect();
        let indexed: HashSet<String> = self.ann.ids().into_iter().collect();
        let meta = self.meta.read();

        let mut missing: Vec<String> = expected
            .keys()
            .filter(|id| !indexed.contains(**id))
            .map(|id| id.to_string())
            .collect();
        let mut orphaned: Vec<String> = indexed
            .iter()
            .filter(|id| !expected.contains_key(id.as_str()))
            .cloned()
            .collect();
        let mut stale: Vec<String> = expected
            .iter()
            .filter(|(id, a)| {
                indexed.contains(**id) && meta.get(**id).is_none_or(|m| m.cluster_id != a.cluster_id)
            })
            .map(|(id, _)| id.to_string())
            .collect();
        missing.sort();
        orphaned.sort();
        stale.sort();

        let drift = missing.len() + orphaned.len();
        let needs_rebuild =
            drift > cfg.absolute || (drift > 0 && drift as f32 > cfg.relative * expected.len() as f32);
        if needs_rebuild {
            warn!(
                missing = missing.len(),
                orphaned = orphaned.len(),
                expected = expected.len(),
                "cluster: anchor index drift requires rebuild"
            );
        }
        IntegrityReport {
            expected: expected.len(),
            indexed: indexed.len(),
            missing,
            orphaned,
            stale,
            needs_rebuild,
        }
    }
}

fn meta_of(a: &Anchor) -> AnchorMeta {
    AnchorMeta {
        cluster_id: a.cluster_id.clone(),
        pose: a.pose,
        quality: a.quality,
    }
}
