use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use facegroup_kv::KvStore;
use facegroup_vecstore::normalized;

use crate::anchor_index::{AnchorIndex, IntegrityReport};
use crate::config::EngineConfig;
use crate::constraint::ConstraintSet;
use crate::error::{ClusterError, Result};
use crate::keys::META_EMBED;
use crate::migrate::{MigrationReport, migrate};
use crate::stats;
use crate::store::{Store, Txn};
use crate::types::{Anchor, Cluster, FaceObservation, Lifecycle};

#[derive(Serialize, Deserialize)]
struct EmbedMeta {
    dim: usize,
}

/// Anchor index change applied once the store commit succeeded.
#[derive(Debug, Clone)]
pub(crate) enum IndexOp {
    Add(Anchor),
    Remove(String),
    Reassign { id: String, cluster_id: String },
}

/// Result of offering a face as an anchor.
#[derive(Debug, Default)]
pub(crate) struct Promotion {
    pub added: Option<Anchor>,
    /// Anchor deactivated to make room.
    pub replaced: Option<Anchor>,
}

/// Engine owns the clustering state of one library.
///
/// The store is authoritative; the anchor index is a rebuildable cache.
/// Staging flushes, refinement and user actions serialize on one writer
/// lock. Queries read the store directly and take no writer lock.
pub struct Engine {
    pub(crate) store: Store,
    pub(crate) index: AnchorIndex,
    pub(crate) cfg: EngineConfig,
    pub(crate) constraints: RwLock<ConstraintSet>,
    writer: Mutex<()>,
    index_path: Option<PathBuf>,
    migration: MigrationReport,
}

impl Engine {
    /// Open the engine over `kv`: run migrations, check the embedding
    /// dimension, then load the anchor index from `index_path` (or rebuild
    /// it from the store when absent, corrupt or drifted).
    pub fn open(kv: Arc<dyn KvStore>, cfg: EngineConfig, index_path: Option<PathBuf>) -> Result<Self> {
        let cfg = cfg.with_defaults();
        let migration = migrate(kv.as_ref(), cfg.allow_destructive_migration)?;
        let store = Store::new(kv);
        check_embed_meta(&store, cfg.dim)?;

        let constraints = ConstraintSet::new(store.constraints()?);
        let anchors = store.active_anchors()?;
        let index = match &index_path {
            Some(path) => {
                let (index, outcome) = AnchorIndex::open(path, cfg.hnsw());
                if outcome.needs_rebuild() {
                    if !anchors.is_empty() {
                        warn!(path = %path.display(), ?outcome, "cluster: rebuilding anchor index from store");
                    }
                    index.rebuild(&anchors)?;
                } else {
                    index.attach(&anchors);
                }
                index
            }
            None => {
                let index = AnchorIndex::new(cfg.hnsw());
                index.rebuild(&anchors)?;
                index
            }
        };

        let engine = Self {
            store,
            index,
            cfg,
            constraints: RwLock::new(constraints),
            writer: Mutex::new(()),
            index_path,
            migration,
        };
        engine.resync_index()?;
        info!(
            anchors = engine.index.len(),
            schema_from = engine.migration.from,
            schema_to = engine.migration.to,
            "cluster: engine opened"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn anchor_index(&self) -> &AnchorIndex {
        &self.index
    }

    /// Migrations run when this engine was opened.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    /// Start a transaction. Pair with [`Engine::commit`].
    pub fn begin(&self) -> Txn<'_> {
        self.store.begin()
    }

    /// Commit a caller-built transaction under the writer lock, then apply
    /// the anchor index changes it carries.
    pub fn commit(&self, mut txn: Txn<'_>) -> Result<()> {
        let _w = self.lock_writer();
        let ops = txn.take_index_ops();
        self.store.commit(txn)?;
        self.apply_index(ops);
        Ok(())
    }

    /// Persist the anchor index next to the store, if a path was configured.
    pub fn save_index(&self) -> Result<()> {
        if let Some(path) = &self.index_path {
            self.index.save(path)?;
            debug!(path = %path.display(), anchors = self.index.len(), "cluster: anchor index saved");
        }
        Ok(())
    }

    pub fn index_path(&self) -> Option<&Path> {
        self.index_path.as_deref()
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }

    pub(crate) fn constraint_set(&self) -> ConstraintSet {
        self.constraints.read().clone()
    }

    pub(crate) fn reload_constraints(&self) -> Result<()> {
        let set = ConstraintSet::new(self.store.constraints()?);
        *self.constraints.write() = set;
        Ok(())
    }

    /// Apply index changes after a successful commit. The store is already
    /// correct, so failures only leave drift for the next resync.
    pub(crate) fn apply_index(&self, ops: Vec<IndexOp>) {
        for op in ops {
            let res = match &op {
                IndexOp::Add(a) => self.index.add(a),
                IndexOp::Remove(id) => self.index.remove(id).map(|_| ()),
                IndexOp::Reassign { id, cluster_id } => {
                    self.index.reassign(id, cluster_id);
                    Ok(())
                }
            };
            if let Err(e) = res {
                warn!(?op, error = %e, "cluster: anchor index update failed");
            }
        }
    }

    /// Bring the index in line with the active anchors in the store:
    /// small drift is patched, large drift forces a rebuild.
    pub(crate) fn resync_index(&self) -> Result<IntegrityReport> {
        let anchors = self.store.active_anchors()?;
        let report = self.index.check_integrity(&anchors, &self.cfg.integrity);
        if report.needs_rebuild {
            self.index.rebuild(&anchors)?;
        } else if !report.is_clean() {
            let by_id: HashMap<&str, &Anchor> = anchors.iter().map(|a| (a.id.as_str(), a)).collect();
            for id in report.missing.iter().chain(&report.stale) {
                if let Some(a) = by_id.get(id.as_str()) {
                    self.index.add(a)?;
                }
            }
            for id in &report.orphaned {
                self.index.remove(id)?;
            }
            debug!(
                missing = report.missing.len(),
                orphaned = report.orphaned.len(),
                stale = report.stale.len(),
                "cluster: anchor index patched"
            );
        }
        Ok(report)
    }

    // -- anchors --

    /// Offer `face` as an anchor of `cluster_id`.
    ///
    /// A cluster without active anchors always takes the face. Otherwise the
    /// face must reach `min_quality`, and it is added while both the cluster
    /// and the face's pose bucket have room. With `replace`, a full cluster
    /// swaps out a weaker anchor of the same pose, or the weakest anchor of
    /// the most crowded bucket when the face brings a new pose.
    pub(crate) fn promote(
        &self,
        txn: &mut Txn<'_>,
        face: &FaceObservation,
        cluster_id: &str,
        replace: bool,
        now: DateTime<Utc>,
    ) -> Result<Promotion> {
        let policy = &self.cfg.anchors;
        let active = txn.active_anchors_of(cluster_id)?;
        if active.iter().any(|a| a.id == face.id) {
            return Ok(Promotion::default());
        }
        let cand = Anchor::from_face(face, cluster_id, now);
        if !active.is_empty() && cand.quality < policy.min_quality {
            return Ok(Promotion::default());
        }

        let same_pose: Vec<&Anchor> = active.iter().filter(|a| a.pose == cand.pose).collect();
        if active.len() < policy.max_anchors && same_pose.len() < policy.max_per_pose {
            txn.put_anchor(cand.clone());
            return Ok(Promotion {
                added: Some(cand),
                replaced: None,
            });
        }
        if !replace {
            return Ok(Promotion::default());
        }

        let victim = if same_pose.is_empty() {
            let mut buckets: HashMap<_, Vec<&Anchor>> = HashMap::new();
            for a in &active {
                buckets.entry(a.pose).or_default().push(a);
            }
            buckets
                .into_values()
                .filter(|b| b.len() > 1)
                .max_by(|x, y| x.len().cmp(&y.len()).then_with(|| pose_key(y).cmp(&pose_key(x))))
                .and_then(|b| weakest(&b))
        } else {
            weakest(&same_pose).filter(|w| w.quality < cand.quality)
        };
        let Some(victim) = victim else {
            return Ok(Promotion::default());
        };

        let mut retired = victim.clone();
        retired.active = false;
        txn.put_anchor(retired.clone());
        txn.put_anchor(cand.clone());
        Ok(Promotion {
            added: Some(cand),
            replaced: Some(retired),
        })
    }

    /// Promote the best member of a cluster that has members but no active
    /// anchor. Returns the promoted anchor.
    pub(crate) fn backfill_anchor(
        &self,
        txn: &mut Txn<'_>,
        cluster_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Anchor>> {
        if !txn.active_anchors_of(cluster_id)?.is_empty() {
            return Ok(None);
        }
        let members = txn.members(cluster_id)?;
        let Some(best) = representative(&members) else {
            return Ok(None);
        };
        let anchor = Anchor::from_face(best, cluster_id, now);
        txn.put_anchor(anchor.clone());
        Ok(Some(anchor))
    }

    // -- clusters --

    /// Create an active, empty cluster with a fresh id.
    pub(crate) fn new_cluster(&self, txn: &mut Txn<'_>, now: DateTime<Utc>) -> Result<Cluster> {
        let cluster = Cluster::new(txn.next_cluster_id()?, now);
        txn.put_cluster(cluster.clone());
        Ok(cluster)
    }

    /// Recompute a cluster's statistics and cached aggregates from the
    /// transaction view. An empty active cluster is soft-deleted.
    pub(crate) fn refresh_cluster(&self, txn: &mut Txn<'_>, cluster_id: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(mut cluster) = txn.cluster(cluster_id)? else {
            return Ok(());
        };
        let members = txn.members(cluster_id)?;
        if members.is_empty() {
            if cluster.is_active() {
                cluster.lifecycle = Lifecycle::SoftDeleted;
                cluster.deleted_at = Some(now);
                cluster.face_count = 0;
                cluster.representative_face = None;
                cluster.updated_at = now;
                txn.put_cluster(cluster);
            }
            txn.delete_stats(cluster_id);
            return Ok(());
        }

        let anchors = txn.anchors_of(cluster_id)?;
        let fresh = stats::compute(cluster_id, &anchors, &members, &self.cfg.threshold, now);
        let unchanged = txn.stats(cluster_id)?.is_some_and(|s| s.same_values(&fresh));
        if !unchanged {
            txn.put_stats(fresh);
        }

        let aggregates = Aggregates::of(&members);
        if !aggregates.matches(&cluster) {
            aggregates.apply(&mut cluster);
            cluster.updated_at = now;
            txn.put_cluster(cluster);
        }
        Ok(())
    }

    /// Bring a soft-deleted cluster back for an undo.
    pub(crate) fn revive_cluster(&self, txn: &mut Txn<'_>, cluster_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut cluster = txn
            .cluster(cluster_id)?
            .ok_or_else(|| ClusterError::not_found("cluster", cluster_id))?;
        if !cluster.is_active() {
            cluster.lifecycle = Lifecycle::Active;
            cluster.deleted_at = None;
            cluster.merged_into = None;
            cluster.updated_at = now;
            txn.put_cluster(cluster);
        }
        Ok(())
    }
}

/// Cached per-cluster values derived from its members.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Aggregates {
    pub face_count: usize,
    pub representative_face: Option<String>,
    pub centroid: Option<Vec<f32>>,
}

impl Aggregates {
    pub(crate) fn of(members: &[FaceObservation]) -> Self {
        Self {
            face_count: members.len(),
            representative_face: representative(members).map(|f| f.id.clone()),
            centroid: centroid(members),
        }
    }

    pub(crate) fn matches(&self, c: &Cluster) -> bool {
        let centroid_same = match (&self.centroid, &c.centroid) {
            (None, None) => true,
            (Some(a), Some(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1e-5),
            _ => false,
        };
        self.face_count == c.face_count && self.representative_face == c.representative_face && centroid_same
    }

    pub(crate) fn apply(self, c: &mut Cluster) {
        c.face_count = self.face_count;
        c.representative_face = self.representative_face;
        c.centroid = self.centroid;
    }
}

/// Best face for display: quality, open eyes, frontal pose. Ties go to the
/// smaller id.
pub(crate) fn representative(members: &[FaceObservation]) -> Option<&FaceObservation> {
    members.iter().max_by(|a, b| {
        a.representative_score()
            .total_cmp(&b.representative_score())
            .then_with(|| b.id.cmp(&a.id))
    })
}

fn centroid(members: &[FaceObservation]) -> Option<Vec<f32>> {
    let first = members.first()?;
    let mut sum = vec![0.0f32; first.embedding.len()];
    for f in members {
        for (s, x) in sum.iter_mut().zip(&f.embedding) {
            *s += x;
        }
    }
    normalized(&sum)
}

fn weakest<'a>(anchors: &[&'a Anchor]) -> Option<&'a Anchor> {
    anchors
        .iter()
        .copied()
        .min_by(|a, b| a.quality.total_cmp(&b.quality).then_with(|| b.id.cmp(&a.id)))
}

fn pose_key(bucket: &[&Anchor]) -> &'static str {
    bucket.first().map(|a| a.pose.as_str()).unwrap_or("")
}

fn check_embed_meta(store: &Store, dim: usize) -> Result<()> {
    match store.meta::<EmbedMeta>(META_EMBED)? {
        Some(meta) if meta.dim != dim => Err(ClusterError::EmbedDimensionMismatch {
            stored: meta.dim,
            current: dim,
        }),
        Some(_) => Ok(()),
        None => {
            let mut txn = store.begin();
            txn.put_meta(META_EMBED, &EmbedMeta { dim })?;
            store.commit(txn)
        }
    }
}
