//! Read-only views for browsing. These read committed state and never take
//! the writer lock.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::engine::Engine;
use crate::error::Result;
use crate::types::{
    Cluster, ClusterStatistics, Constraint, FaceObservation, HistoryEntry, Identity, StagedFace,
    StagedStatus,
};

impl Engine {
    pub fn cluster(&self, id: &str) -> Result<Option<Cluster>> {
        Ok(self.store.cluster(id)?.filter(|c| c.is_active()))
    }

    /// Active clusters, largest first, then by id.
    pub fn clusters(&self) -> Result<Vec<Cluster>> {
        let mut out: Vec<Cluster> = self.store.clusters()?.into_iter().filter(|c| c.is_active()).collect();
        out.sort_by(|a, b| b.face_count.cmp(&a.face_count).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Active faces of a cluster, best representative first.
    pub fn faces_for_cluster(&self, cluster_id: &str) -> Result<Vec<FaceObservation>> {
        let mut out = Vec::new();
        for id in self.store.member_ids(cluster_id)? {
            if let Some(f) = self.store.face(&id)?.filter(|f| f.is_active()) {
                out.push(f);
            }
        }
        out.sort_by(|a, b| {
            b.representative_score()
                .total_cmp(&a.representative_score())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    pub fn face(&self, id: &str) -> Result<Option<FaceObservation>> {
        self.store.face(id)
    }

    pub fn clusters_for_identity(&self, identity_id: &str) -> Result<Vec<Cluster>> {
        Ok(self
            .clusters()?
            .into_iter()
            .filter(|c| c.identity_id.as_deref() == Some(identity_id))
            .collect())
    }

    /// Photos in which every requested identity appears, sorted.
    pub fn photos_containing_identities(&self, identity_ids: &[&str]) -> Result<Vec<String>> {
        if identity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut result: Option<BTreeSet<String>> = None;
        for iid in identity_ids {
            let mut photos = BTreeSet::new();
            for c in self.clusters_for_identity(iid)? {
                for fid in self.store.member_ids(&c.id)? {
                    if let Some(f) = self.store.face(&fid)?.filter(|f| f.is_active()) {
                        photos.insert(f.photo_id);
                    }
                }
            }
            let next = match result {
                None => photos,
                Some(acc) => acc.intersection(&photos).cloned().collect(),
            };
            if next.is_empty() {
                return Ok(Vec::new());
            }
            result = Some(next);
        }
        Ok(result.unwrap_or_default().into_iter().collect())
    }

    pub fn statistics(&self, cluster_id: &str) -> Result<Option<ClusterStatistics>> {
        self.store.stats(cluster_id)
    }

    /// Staged faces left unresolved as CONFLICT.
    pub fn conflicts(&self) -> Result<Vec<StagedFace>> {
        Ok(self
            .store
            .staged()?
            .into_iter()
            .filter(|s| s.status == StagedStatus::Conflict)
            .collect())
    }

    /// Active clusters flagged for review by split detection.
    pub fn split_candidates(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters()?.into_iter().filter(|c| c.needs_review).collect())
    }

    /// The newest `limit` history entries, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut all = self.store.history()?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }

    pub fn identities(&self) -> Result<Vec<Identity>> {
        Ok(self.store.identities()?.into_iter().filter(|i| i.is_active()).collect())
    }

    pub fn constraints(&self) -> Vec<Constraint> {
        self.constraints.read().all().to_vec()
    }

    /// Counts of active faces per cluster, from the member index.
    pub fn membership(&self) -> Result<BTreeMap<String, usize>> {
        let active: HashSet<String> = self.clusters()?.into_iter().map(|c| c.id).collect();
        let mut out = BTreeMap::new();
        for (c, _) in self.store.member_entries()? {
            if active.contains(&c) {
                *out.entry(c).or_insert(0) += 1;
            }
        }
        Ok(out)
    }
}
