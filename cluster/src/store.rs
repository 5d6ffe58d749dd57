//! Typed access to the clustering entities on top of a [`KvStore`].
//!
//! Reads go straight to the store. Writes are collected in a [`Txn`], which
//! also answers reads through its pending writes, and land in the store as
//! one atomic batch on [`Store::commit`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use facegroup_kv::{Batch, KvStore};

use crate::engine::IndexOp;
use crate::error::{ClusterError, Result};
use crate::keys::*;
use crate::types::{
    Anchor, Cluster, ClusterStatistics, Constraint, FaceObservation, HistoryEntry, Identity,
    StagedFace,
};

pub(crate) fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(v).map_err(|e| ClusterError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| ClusterError::Serialization(e.to_string()))
}

/// Store wraps a shared [`KvStore`] with typed entity access.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KvStore>,
}

impl Store {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn begin(&self) -> Txn<'_> {
        Txn::new(self)
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(data) => Ok(Some(decode(&data)?)),
            None => Ok(None),
        }
    }

    fn scan_values<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.kv
            .scan(prefix)?
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect()
    }

    pub fn face(&self, id: &str) -> Result<Option<FaceObservation>> {
        self.get(&face_key(id))
    }

    pub fn faces(&self) -> Result<Vec<FaceObservation>> {
        self.scan_values(FACE_PREFIX)
    }

    /// Ids of the active faces assigned to `cluster_id`, from the member index.
    pub fn member_ids(&self, cluster_id: &str) -> Result<Vec<String>> {
        let prefix = member_prefix(cluster_id);
        Ok(self
            .kv
            .scan_keys(&prefix)?
            .into_iter()
            .map(|k| k[prefix.len()..].to_string())
            .collect())
    }

    /// Every member-index entry as `(cluster_id, face_id)`.
    pub fn member_entries(&self) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for key in self.kv.scan_keys(MEMBER_PREFIX)? {
            let rest = &key[MEMBER_PREFIX.len()..];
            // Cluster ids never contain ':'; face ids may.
            if let Some((c, f)) = rest.split_once(':') {
                out.push((c.to_string(), f.to_string()));
            }
        }
        Ok(out)
    }

    pub fn cluster(&self, id: &str) -> Result<Option<Cluster>> {
        self.get(&cluster_key(id))
    }

    pub fn clusters(&self) -> Result<Vec<Cluster>> {
        self.scan_values(CLUSTER_PREFIX)
    }

    pub fn anchor(&self, cluster_id: &str, id: &str) -> Result<Option<Anchor>> {
        self.get(&anchor_key(cluster_id, id))
    }

    pub fn anchors_of(&self, cluster_id: &str) -> Result<Vec<Anchor>> {
        self.scan_values(&anchor_prefix(cluster_id))
    }

    pub fn anchors(&self) -> Result<Vec<Anchor>> {
        self.scan_values(ANCHOR_PREFIX)
    }

    pub fn active_anchors(&self) -> Result<Vec<Anchor>> {
        Ok(self.anchors()?.into_iter().filter(|a| a.active).collect())
    }

    pub fn stats(&self, cluster_id: &str) -> Result<Option<ClusterStatistics>> {
        self.get(&stats_key(cluster_id))
    }

    pub fn all_stats(&self) -> Result<Vec<ClusterStatistics>> {
        self.scan_values(STATS_PREFIX)
    }

    pub fn staged(&self) -> Result<Vec<StagedFace>> {
        self.scan_values(STAGED_PREFIX)
    }

    pub fn staged_face(&self, face_id: &str) -> Result<Option<StagedFace>> {
        self.get(&staged_key(face_id))
    }

    pub fn constraints(&self) -> Result<Vec<Constraint>> {
        self.scan_values(CONSTRAINT_PREFIX)
    }

    pub fn history_entry(&self, id: &str) -> Result<Option<HistoryEntry>> {
        self.get(&history_key(id))
    }

    /// History in creation order.
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.scan_values(HISTORY_PREFIX)
    }

    pub fn identity(&self, id: &str) -> Result<Option<Identity>> {
        self.get(&identity_key(id))
    }

    pub fn identities(&self) -> Result<Vec<Identity>> {
        self.scan_values(IDENTITY_PREFIX)
    }

    /// Read a JSON metadata value.
    pub fn meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| ClusterError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Materialize and atomically apply a transaction.
    pub fn commit(&self, txn: Txn<'_>) -> Result<()> {
        let batch = txn.into_batch()?;
        if batch.is_empty() {
            return Ok(());
        }
        self.kv.commit(batch)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Txn
// ---------------------------------------------------------------------------

/// Pending writes. `None` marks a delete.
type Pending<K, T> = BTreeMap<K, Option<T>>;

/// Txn accumulates typed writes for one atomic commit.
///
/// Reads through a `Txn` see its own pending writes first, so multi-step
/// operations (a flush resolving many faces, a merge moving many anchors)
/// can build on their earlier steps before anything is committed.
pub struct Txn<'a> {
    store: &'a Store,
    faces: Pending<String, FaceObservation>,
    clusters: Pending<String, Cluster>,
    anchors: Pending<(String, String), Anchor>,
    stats: Pending<String, ClusterStatistics>,
    staged: Pending<String, StagedFace>,
    constraints: Pending<(String, String), Constraint>,
    history: Pending<String, HistoryEntry>,
    identities: Pending<String, Identity>,
    raw: Pending<String, Vec<u8>>,
    /// Anchor index changes to apply once this txn commits.
    index_ops: Vec<IndexOp>,
}

fn through<K: Ord, T: Clone>(
    pending: &Pending<K, T>,
    key: &K,
    load: impl FnOnce() -> Result<Option<T>>,
) -> Result<Option<T>> {
    match pending.get(key) {
        Some(v) => Ok(v.clone()),
        None => load(),
    }
}

impl<'a> Txn<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self {
            store,
            faces: BTreeMap::new(),
            clusters: BTreeMap::new(),
            anchors: BTreeMap::new(),
            stats: BTreeMap::new(),
            staged: BTreeMap::new(),
            constraints: BTreeMap::new(),
            history: BTreeMap::new(),
            identities: BTreeMap::new(),
            raw: BTreeMap::new(),
            index_ops: Vec::new(),
        }
    }

    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
            && self.clusters.is_empty()
            && self.anchors.is_empty()
            && self.stats.is_empty()
            && self.staged.is_empty()
            && self.constraints.is_empty()
            && self.history.is_empty()
            && self.identities.is_empty()
            && self.raw.is_empty()
    }

    pub(crate) fn push_index_op(&mut self, op: IndexOp) {
        self.index_ops.push(op);
    }

    pub(crate) fn take_index_ops(&mut self) -> Vec<IndexOp> {
        std::mem::take(&mut self.index_ops)
    }

    // -- faces --

    pub fn face(&self, id: &str) -> Result<Option<FaceObservation>> {
        through(&self.faces, &id.to_string(), || self.store.face(id))
    }

    pub fn put_face(&mut self, face: FaceObservation) {
        self.faces.insert(face.id.clone(), Some(face));
    }

    pub fn delete_face(&mut self, id: &str) {
        self.faces.insert(id.to_string(), None);
    }

    /// Active member face ids of a cluster, sorted.
    pub fn member_ids(&self, cluster_id: &str) -> Result<Vec<String>> {
        let mut ids: BTreeSet<String> = self.store.member_ids(cluster_id)?.into_iter().collect();
        for (id, f) in &self.faces {
            let member = f
                .as_ref()
                .is_some_and(|f| f.is_active() && f.cluster_id.as_deref() == Some(cluster_id));
            if member {
                ids.insert(id.clone());
            } else {
                ids.remove(id);
            }
        }
        Ok(ids.into_iter().collect())
    }

    pub fn members(&self, cluster_id: &str) -> Result<Vec<FaceObservation>> {
        let mut out = Vec::new();
        for id in self.member_ids(cluster_id)? {
            if let Some(f) = self.face(&id)? {
                out.push(f);
            }
        }
        Ok(out)
    }

    // -- clusters --

    pub fn cluster(&self, id: &str) -> Result<Option<Cluster>> {
        through(&self.clusters, &id.to_string(), || self.store.cluster(id))
    }

    pub fn require_cluster(&self, id: &str) -> Result<Cluster> {
        match self.cluster(id)? {
            Some(c) if c.is_active() => Ok(c),
            _ => Err(ClusterError::not_found("cluster", id)),
        }
    }

    pub fn put_cluster(&mut self, cluster: Cluster) {
        self.clusters.insert(cluster.id.clone(), Some(cluster));
    }

    pub fn delete_cluster(&mut self, id: &str) {
        self.clusters.insert(id.to_string(), None);
    }

    // -- anchors --

    pub fn anchor(&self, cluster_id: &str, id: &str) -> Result<Option<Anchor>> {
        through(&self.anchors, &(cluster_id.to_string(), id.to_string()), || {
            self.store.anchor(cluster_id, id)
        })
    }

    /// Every anchor record (active or not) of a cluster, sorted by id.
    pub fn anchors_of(&self, cluster_id: &str) -> Result<Vec<Anchor>> {
        let mut by_id: BTreeMap<String, Anchor> = self
            .store
            .anchors_of(cluster_id)?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        for ((c, id), a) in &self.anchors {
            if c != cluster_id {
                continue;
            }
            match a {
                Some(a) => {
                    by_id.insert(id.clone(), a.clone());
                }
                None => {
                    by_id.remove(id);
                }
            }
        }
        Ok(by_id.into_values().collect())
    }

    pub fn active_anchors_of(&self, cluster_id: &str) -> Result<Vec<Anchor>> {
        Ok(self.anchors_of(cluster_id)?.into_iter().filter(|a| a.active).collect())
    }

    pub fn put_anchor(&mut self, anchor: Anchor) {
        self.anchors
            .insert((anchor.cluster_id.clone(), anchor.id.clone()), Some(anchor));
    }

    pub fn delete_anchor(&mut self, cluster_id: &str, id: &str) {
        self.anchors.insert((cluster_id.to_string(), id.to_string()), None);
    }

    // -- statistics --

    pub fn stats(&self, cluster_id: &str) -> Result<Option<ClusterStatistics>> {
        through(&self.stats, &cluster_id.to_string(), || self.store.stats(cluster_id))
    }

    pub fn put_stats(&mut self, stats: ClusterStatistics) {
        self.stats.insert(stats.cluster_id.clone(), Some(stats));
    }

    pub fn delete_stats(&mut self, cluster_id: &str) {
        self.stats.insert(cluster_id.to_string(), None);
    }

    // -- staging --

    pub fn staged(&self, face_id: &str) -> Result<Option<StagedFace>> {
        through(&self.staged, &face_id.to_string(), || self.store.staged_face(face_id))
    }

    pub fn put_staged(&mut self, staged: StagedFace) {
        self.staged.insert(staged.face_id.clone(), Some(staged));
    }

    pub fn delete_staged(&mut self, face_id: &str) {
        self.staged.insert(face_id.to_string(), None);
    }

    // -- constraints, history, identities --

    pub fn put_constraint(&mut self, c: Constraint) {
        self.constraints.insert((c.a.clone(), c.b.clone()), Some(c));
    }

    pub fn delete_constraint(&mut self, a: &str, b: &str) {
        self.constraints.insert((a.to_string(), b.to_string()), None);
    }

    pub fn history_entry(&self, id: &str) -> Result<Option<HistoryEntry>> {
        through(&self.history, &id.to_string(), || self.store.history_entry(id))
    }

    pub fn put_history(&mut self, entry: HistoryEntry) {
        self.history.insert(entry.id.clone(), Some(entry));
    }

    pub fn delete_history(&mut self, id: &str) {
        self.history.insert(id.to_string(), None);
    }

    pub fn identity(&self, id: &str) -> Result<Option<Identity>> {
        through(&self.identities, &id.to_string(), || self.store.identity(id))
    }

    pub fn put_identity(&mut self, identity: Identity) {
        self.identities.insert(identity.id.clone(), Some(identity));
    }

    pub fn delete_identity(&mut self, id: &str) {
        self.identities.insert(id.to_string(), None);
    }

    // -- raw keys (metadata, scan bookkeeping) --

    pub fn raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        through(&self.raw, &key.to_string(), || Ok(self.store.kv.get(key)?))
    }

    pub fn put_raw(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.raw.insert(key.into(), Some(value));
    }

    pub fn delete_raw(&mut self, key: impl Into<String>) {
        self.raw.insert(key.into(), None);
    }

    pub fn meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.raw(key)? {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| ClusterError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn put_meta<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value).map_err(|e| ClusterError::Serialization(e.to_string()))?;
        self.put_raw(key, data);
        Ok(())
    }

    /// Increment and return a persisted counter.
    pub fn next_seq(&mut self, key: &str) -> Result<u64> {
        let next = self.meta::<u64>(key)?.unwrap_or(0) + 1;
        self.put_meta(key, &next)?;
        Ok(next)
    }

    pub fn next_cluster_id(&mut self) -> Result<String> {
        Ok(cluster_id(self.next_seq(META_CLUSTER_SEQ)?))
    }

    pub fn next_history_id(&mut self) -> Result<String> {
        Ok(history_id(self.next_seq(META_HISTORY_SEQ)?))
    }

    /// Convert pending writes into one kv batch, maintaining the member index.
    fn into_batch(self) -> Result<Batch> {
        let mut b = Batch::new();

        for (id, face) in &self.faces {
            let before = self.store.face(id)?;
            let old_member = before
                .as_ref()
                .filter(|f| f.is_active())
                .and_then(|f| f.cluster_id.clone());
            let new_member = face
                .as_ref()
                .filter(|f| f.is_active())
                .and_then(|f| f.cluster_id.clone());
            if let Some(c) = &old_member {
                if old_member != new_member {
                    b.delete(member_key(c, id));
                }
            }
            if let Some(c) = &new_member {
                b.put(member_key(c, id), Vec::new());
            }
            match face {
                Some(f) => b.put(face_key(id), encode(f)?),
                None => b.delete(face_key(id)),
            };
        }
        for (id, c) in &self.clusters {
            match c {
                Some(c) => b.put(cluster_key(id), encode(c)?),
                None => b.delete(cluster_key(id)),
            };
        }
        for ((c, id), a) in &self.anchors {
            match a {
                Some(a) => b.put(anchor_key(c, id), encode(a)?),
                None => b.delete(anchor_key(c, id)),
            };
        }
        for (id, s) in &self.stats {
            match s {
                Some(s) => b.put(stats_key(id), encode(s)?),
                None => b.delete(stats_key(id)),
            };
        }
        for (id, s) in &self.staged {
            match s {
                Some(s) => b.put(staged_key(id), encode(s)?),
                None => b.delete(staged_key(id)),
            };
        }
        for ((x, y), c) in &self.constraints {
            match c {
                Some(c) => b.put(constraint_key(x, y), encode(c)?),
                None => b.delete(constraint_key(x, y)),
            };
        }
        for (id, h) in &self.history {
            match h {
                Some(h) => b.put(history_key(id), encode(h)?),
                None => b.delete(history_key(id)),
            };
        }
        for (id, i) in &self.identities {
            match i {
                Some(i) => b.put(identity_key(id), encode(i)?),
                None => b.delete(identity_key(id)),
            };
        }
        for (k, v) in self.raw {
            match v {
                Some(v) => b.put(k, v),
                None => b.delete(k),
            };
        }
        Ok(b)
    }
}
