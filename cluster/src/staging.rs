//! Stage-then-commit admission of new faces.
//!
//! Staging records a face with its current best and runner-up candidate
//! clusters. A flush then resolves every pending face in one transaction:
//! constraints first, then the adaptive thresholds, with ambiguous faces
//! left as conflicts for review.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use facegroup_faceprint::FaceEmbedding;
use facegroup_vecstore::dot;

use crate::constraint::ConstraintSet;
use crate::engine::{Engine, IndexOp};
use crate::error::{ClusterError, Result};
use crate::stats::threshold_of;
use crate::store::Txn;
use crate::types::{
    Anchor, Candidate, Confidence, FaceObservation, Lifecycle, StagedFace, StagedStatus,
};

/// Outcome counts of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Pending faces considered.
    pub staged: usize,
    /// Joined an existing cluster on similarity.
    pub assigned: usize,
    /// Started a new singleton cluster.
    pub created: usize,
    /// Left unresolved as CONFLICT.
    pub conflicts: usize,
    /// Placed by a MUST_LINK partner.
    pub constrained: usize,
    /// Became anchors.
    pub promoted: usize,
    /// Stale staged records dropped.
    pub skipped: usize,
}

impl FlushReport {
    pub fn resolved(&self) -> usize {
        self.assigned + self.created + self.constrained
    }
}

/// Best anchor of one cluster for a query vector.
#[derive(Debug, Clone)]
struct Scored {
    cluster_id: String,
    anchor_id: String,
    similarity: f32,
}

/// Working state of a flush beyond the transaction itself.
#[derive(Default)]
struct FlushState {
    /// Anchors created in this flush, not yet in the index.
    overlay: Vec<Anchor>,
    /// Anchors deactivated in this flush, still in the index.
    retired: HashSet<String>,
    touched: BTreeSet<String>,
    ops: Vec<IndexOp>,
    report: FlushReport,
}

impl Engine {
    /// Record `face` for the next flush in the caller's transaction.
    ///
    /// Returns false when the face is already known with the same embedding;
    /// staging the same face twice has no effect. A known face whose
    /// embedding changed (its photo was edited) leaves its cluster and is
    /// staged again.
    pub fn stage(&self, txn: &mut Txn<'_>, mut face: FaceObservation) -> Result<bool> {
        if face.embedding.len() != self.cfg.dim {
            return Err(ClusterError::Vector(facegroup_vecstore::VecError::DimensionMismatch {
                got: face.embedding.len(),
                want: self.cfg.dim,
            }));
        }
        let previous = txn.face(&face.id)?;
        if previous.as_ref().is_some_and(|p| p.embedding == face.embedding) {
            return Ok(false);
        }
        let candidates = self.lookup(txn, &face.embedding, &FlushState::default())?;
        face.cluster_id = None;
        face.confidence = Confidence::Unassigned;
        let staged = StagedFace {
            face_id: face.id.clone(),
            embedding: face.embedding.clone(),
            best: candidates.first().map(candidate),
            runner_up: candidates.get(1).map(candidate),
            status: StagedStatus::Pending,
            staged_at: face.created_at,
        };
        let now = face.created_at;
        txn.put_face(face);
        txn.put_staged(staged);
        if let Some(old) = previous {
            debug!(face = %old.id, cluster = ?old.cluster_id, "cluster: face re-extracted, restaging");
            self.detach(txn, &old, now)?;
        }
        Ok(true)
    }

    /// Stage every embedding of one photo. Returns how many were new.
    ///
    /// Faces of an earlier extraction beyond `faces.len()` are soft-deleted.
    pub fn stage_embeddings(
        &self,
        txn: &mut Txn<'_>,
        photo_id: &str,
        faces: &[FaceEmbedding],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut n = 0;
        for (i, f) in faces.iter().enumerate() {
            let obs = FaceObservation {
                id: FaceObservation::face_id(photo_id, i),
                photo_id: photo_id.to_string(),
                embedding: f.vector.clone(),
                quality: f.quality,
                pose: f.pose,
                bbox: f.bbox,
                cluster_id: None,
                confidence: Confidence::Unassigned,
                lifecycle: Lifecycle::Active,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            };
            if self.stage(txn, obs)? {
                n += 1;
            }
        }

        let mut i = faces.len();
        while let Some(old) = txn.face(&FaceObservation::face_id(photo_id, i))? {
            i += 1;
            if !old.is_active() {
                continue;
            }
            let mut gone = old.clone();
            gone.lifecycle = Lifecycle::SoftDeleted;
            gone.deleted_at = Some(now);
            gone.updated_at = now;
            txn.put_face(gone);
            txn.delete_staged(&old.id);
            self.detach(txn, &old, now)?;
            debug!(face = %old.id, "cluster: face no longer in photo");
        }
        Ok(n)
    }

    /// Drop what `old` left in its cluster once its record was replaced:
    /// its anchor goes, and the cluster backfills and refreshes.
    fn detach(&self, txn: &mut Txn<'_>, old: &FaceObservation, now: DateTime<Utc>) -> Result<()> {
        let Some(cluster_id) = old.cluster_id.as_deref().filter(|_| old.is_active()) else {
            return Ok(());
        };
        if let Some(a) = txn.anchor(cluster_id, &old.id)? {
            txn.delete_anchor(cluster_id, &old.id);
            if a.active {
                txn.push_index_op(IndexOp::Remove(old.id.clone()));
            }
        }
        if let Some(a) = self.backfill_anchor(txn, cluster_id, now)? {
            txn.push_index_op(IndexOp::Add(a));
        }
        self.refresh_cluster(txn, cluster_id, now)
    }

    /// Number of faces awaiting a flush.
    pub fn staged_count(&self) -> Result<usize> {
        Ok(self
            .store
            .staged()?
            .iter()
            .filter(|s| s.status == StagedStatus::Pending)
            .count())
    }

    pub fn flush(&self) -> Result<FlushReport> {
        self.flush_at(Utc::now())
    }

    /// Resolve every pending staged face in one atomic commit.
    ///
    /// A face whose MUST_LINK partner is pending in the same flush waits for
    /// the partner. When only waiting faces remain (a MUST_LINK cycle), the
    /// earliest is resolved on its own and the rest follow it, into its
    /// cluster or into CONFLICT alongside it.
    pub fn flush_at(&self, now: DateTime<Utc>) -> Result<FlushReport> {
        let _w = self.lock_writer();
        let mut staged: Vec<StagedFace> = self
            .store
            .staged()?
            .into_iter()
            .filter(|s| s.status == StagedStatus::Pending)
            .collect();
        if staged.is_empty() {
            return Ok(FlushReport::default());
        }
        staged.sort_by(|a, b| a.staged_at.cmp(&b.staged_at).then_with(|| a.face_id.cmp(&b.face_id)));

        let constraints = self.constraint_set();
        let mut txn = self.store.begin();
        let mut st = FlushState::default();
        st.report.staged = staged.len();

        let mut pending: HashSet<String> = staged.iter().map(|s| s.face_id.clone()).collect();
        let mut queue = staged;
        while !queue.is_empty() {
            let mut waiting = Vec::new();
            for s in queue {
                let blocked = constraints
                    .must_partners(&s.face_id)
                    .any(|p| p != s.face_id && pending.contains(p));
                if blocked {
                    waiting.push(s);
                    continue;
                }
                pending.remove(&s.face_id);
                self.resolve(&mut txn, &mut st, &constraints, s, now)?;
            }
            if !waiting.is_empty() && waiting.len() == pending.len() {
                let first = waiting.remove(0);
                pending.remove(&first.face_id);
                self.resolve(&mut txn, &mut st, &constraints, first, now)?;
            }
            queue = waiting;
        }

        for id in std::mem::take(&mut st.touched) {
            self.refresh_cluster(&mut txn, &id, now)?;
        }

        self.store.commit(txn)?;
        self.apply_index(std::mem::take(&mut st.ops));
        let r = st.report;
        info!(
            staged = r.staged,
            assigned = r.assigned,
            created = r.created,
            conflicts = r.conflicts,
            constrained = r.constrained,
            promoted = r.promoted,
            "cluster: staging flushed"
        );
        Ok(r)
    }

    fn resolve(
        &self,
        txn: &mut Txn<'_>,
        st: &mut FlushState,
        constraints: &ConstraintSet,
        mut staged: StagedFace,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let face = match txn.face(&staged.face_id)? {
            Some(f) if f.is_active() && f.cluster_id.is_none() => f,
            _ => {
                txn.delete_staged(&staged.face_id);
                st.report.skipped += 1;
                return Ok(());
            }
        };

        // MUST_LINK partner already placed.
        if let Some(target) = self.must_link_target(txn, constraints, &face.id)? {
            if constraints.cluster_forbids(txn, &face.id, &target)? {
                staged.best = Some(Candidate {
                    cluster_id: target,
                    similarity: 0.0,
                });
                staged.runner_up = None;
                return self.mark_conflict(txn, st, staged);
            }
            self.place(txn, st, face, &target, Confidence::Constrained, None, now)?;
            st.report.constrained += 1;
            return Ok(());
        }

        // MUST_LINK partner held for review.
        if let Some(partner) = self.must_link_conflict(txn, constraints, &face.id)? {
            staged.best = partner.best;
            staged.runner_up = partner.runner_up;
            return self.mark_conflict(txn, st, staged);
        }

        // Candidates that clear their own cluster's threshold, most similar first.
        let mut clearing = Vec::new();
        for c in self.lookup(txn, &face.embedding, st)? {
            if constraints.cluster_forbids(txn, &face.id, &c.cluster_id)? {
                continue;
            }
            let t = threshold_of(txn.stats(&c.cluster_id)?.as_ref(), &self.cfg.threshold);
            if c.similarity >= t {
                clearing.push((c, t));
            }
        }
        staged.best = clearing.first().map(|(c, _)| candidate(c));
        staged.runner_up = clearing.get(1).map(|(c, _)| candidate(c));

        if let Some((best, t_best)) = clearing.first() {
            let ambiguous = clearing
                .get(1)
                .is_some_and(|(second, _)| best.similarity - second.similarity < self.cfg.staging.ambiguity_margin);
            if ambiguous {
                return self.mark_conflict(txn, st, staged);
            }
            let tier = Confidence::from_margin(best.similarity - *t_best);
            let (cluster_id, anchor_id) = (best.cluster_id.clone(), best.anchor_id.clone());
            self.place(txn, st, face, &cluster_id, tier, Some(&anchor_id), now)?;
            st.report.assigned += 1;
            return Ok(());
        }

        let cluster = self.new_cluster(txn, now)?;
        self.place(txn, st, face, &cluster.id, Confidence::High, None, now)?;
        st.report.created += 1;
        Ok(())
    }

    /// Cluster of the first placed MUST_LINK partner, in partner id order.
    fn must_link_target(&self, txn: &Txn<'_>, constraints: &ConstraintSet, face_id: &str) -> Result<Option<String>> {
        for p in constraints.must_partners(face_id) {
            let Some(partner) = txn.face(p)?.filter(|f| f.is_active()) else {
                continue;
            };
            let Some(cid) = partner.cluster_id else { continue };
            if txn.cluster(&cid)?.is_some_and(|c| c.is_active()) {
                return Ok(Some(cid));
            }
        }
        Ok(None)
    }

    /// Staged record of an unplaced MUST_LINK partner left in CONFLICT.
    fn must_link_conflict(
        &self,
        txn: &Txn<'_>,
        constraints: &ConstraintSet,
        face_id: &str,
    ) -> Result<Option<StagedFace>> {
        for p in constraints.must_partners(face_id) {
            let unplaced = txn.face(p)?.is_some_and(|f| f.is_active() && f.cluster_id.is_none());
            if !unplaced {
                continue;
            }
            if let Some(s) = txn.staged(p)?.filter(|s| s.status == StagedStatus::Conflict) {
                return Ok(Some(s));
            }
        }
        Ok(None)
    }

    fn mark_conflict(&self, txn: &mut Txn<'_>, st: &mut FlushState, mut staged: StagedFace) -> Result<()> {
        debug!(face = %staged.face_id, best = ?staged.best, runner_up = ?staged.runner_up, "cluster: staged face in conflict");
        staged.status = StagedStatus::Conflict;
        txn.put_staged(staged);
        st.report.conflicts += 1;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn place(
        &self,
        txn: &mut Txn<'_>,
        st: &mut FlushState,
        mut face: FaceObservation,
        cluster_id: &str,
        confidence: Confidence,
        matched_anchor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        face.cluster_id = Some(cluster_id.to_string());
        face.confidence = confidence;
        face.updated_at = now;
        txn.put_face(face.clone());
        txn.delete_staged(&face.id);

        if let Some(id) = matched_anchor {
            if let Some(mut a) = txn.anchor(cluster_id, id)? {
                a.match_count += 1;
                a.last_matched = Some(now);
                txn.put_anchor(a);
            }
        }

        let p = self.promote(txn, &face, cluster_id, true, now)?;
        if let Some(old) = p.replaced {
            st.overlay.retain(|a| a.id != old.id);
            st.retired.insert(old.id.clone());
            st.ops.push(IndexOp::Remove(old.id));
        }
        if let Some(a) = p.added {
            st.retired.remove(&a.id);
            st.overlay.push(a.clone());
            st.ops.push(IndexOp::Add(a));
            st.report.promoted += 1;
        }
        st.touched.insert(cluster_id.to_string());
        Ok(())
    }

    /// Candidate clusters for `embedding`, one per cluster at its best
    /// anchor, most similar first. Merges index hits with anchors created
    /// earlier in the flush and skips retired anchors and inactive clusters.
    fn lookup(&self, txn: &Txn<'_>, embedding: &[f32], st: &FlushState) -> Result<Vec<Scored>> {
        let mut best: HashMap<String, Scored> = HashMap::new();
        let mut offer = |cluster_id: &str, anchor_id: &str, similarity: f32| {
            let better = best.get(cluster_id).is_none_or(|s| similarity > s.similarity);
            if better {
                best.insert(
                    cluster_id.to_string(),
                    Scored {
                        cluster_id: cluster_id.to_string(),
                        anchor_id: anchor_id.to_string(),
                        similarity,
                    },
                );
            }
        };
        for hit in self.index.find_nearest(embedding, self.cfg.staging.fanout)? {
            if !st.retired.contains(&hit.anchor_id) {
                offer(&hit.cluster_id, &hit.anchor_id, hit.similarity);
            }
        }
        for a in &st.overlay {
            offer(&a.cluster_id, &a.id, dot(&a.embedding, embedding));
        }

        let mut out = Vec::with_capacity(best.len());
        for s in best.into_values() {
            if txn.cluster(&s.cluster_id)?.is_some_and(|c| c.is_active()) {
                out.push(s);
            }
        }
        out.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.cluster_id.cmp(&b.cluster_id))
        });
        Ok(out)
    }
}

fn candidate(s: &Scored) -> Candidate {
    Candidate {
        cluster_id: s.cluster_id.clone(),
        similarity: s.similarity,
    }
}
