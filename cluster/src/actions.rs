//! User-triggered edits. Each runs under the writer lock as one
//! transaction, and every destructive edit appends an undoable
//! [`HistoryEntry`](crate::types::HistoryEntry).

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;
use uuid::Uuid;

use crate::constraint::ConstraintSet;
use crate::engine::{Engine, IndexOp};
use crate::error::{ClusterError, Result};
use crate::history;
use crate::store::Txn;
use crate::types::{
    Confidence, Constraint, ConstraintKind, FaceMove, HistoryOp, Identity, Lifecycle, Reversal, StagedStatus,
};

impl Engine {
    /// Run `f` as one writer transaction and apply its index changes after
    /// the commit.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut Txn<'_>, &mut Vec<IndexOp>) -> Result<T>) -> Result<T> {
        let _w = self.lock_writer();
        self.transact(f)
    }

    /// [`Engine::write`] for callers already holding the writer lock.
    pub(crate) fn transact<T>(&self, f: impl FnOnce(&mut Txn<'_>, &mut Vec<IndexOp>) -> Result<T>) -> Result<T> {
        let mut txn = self.store.begin();
        let mut ops = Vec::new();
        let out = f(&mut txn, &mut ops)?;
        ops.extend(txn.take_index_ops());
        self.store.commit(txn)?;
        self.apply_index(ops);
        Ok(out)
    }

    /// Merge `source` into `target`. Returns the history id.
    pub fn merge_clusters(&self, target: &str, source: &str) -> Result<String> {
        let now = Utc::now();
        let constraints = self.constraint_set();
        let id = self.write(|txn, ops| {
            let reversal = self.merge_in(txn, &constraints, target, source, now, ops)?;
            history::record(
                txn,
                HistoryOp::Merge,
                vec![target.to_string(), source.to_string()],
                reversal,
                now,
                self.cfg.retention(),
            )
        })?;
        info!(survivor = target, merged = source, history = %id, "cluster: clusters merged");
        Ok(id)
    }

    /// Move every face, anchor and the identity of `source` into `target`
    /// and soft-delete `source`. Anchors beyond the target's caps are kept
    /// but deactivated.
    pub(crate) fn merge_in(
        &self,
        txn: &mut Txn<'_>,
        constraints: &ConstraintSet,
        target: &str,
        source: &str,
        now: DateTime<Utc>,
        ops: &mut Vec<IndexOp>,
    ) -> Result<Reversal> {
        if target == source {
            return Err(ClusterError::Invalid(format!("cannot merge {target} into itself")));
        }
        let mut t = txn.require_cluster(target)?;
        let s = txn.require_cluster(source)?;
        if constraints.clusters_conflict(txn, target, source)? {
            return Err(ClusterError::ConstraintViolation(format!(
                "{source} and {target} hold a cannot-link pair"
            )));
        }
        let target_before = t.clone();
        let source_stats = txn.stats(source)?;

        let mut moved_faces = Vec::new();
        for mut f in txn.members(source)? {
            f.cluster_id = Some(target.to_string());
            f.updated_at = now;
            moved_faces.push(f.id.clone());
            txn.put_face(f);
        }

        let policy = &self.cfg.anchors;
        let mut kept = txn.active_anchors_of(target)?;
        let mut moved_anchors = txn.anchors_of(source)?;
        moved_anchors.sort_by(|a, b| {
            b.active
                .cmp(&a.active)
                .then_with(|| b.quality.total_cmp(&a.quality))
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut deactivated = Vec::new();
        for a in &moved_anchors {
            txn.delete_anchor(source, &a.id);
            let mut moved = a.clone();
            moved.cluster_id = target.to_string();
            if a.active {
                let same_pose = kept.iter().filter(|k| k.pose == a.pose).count();
                if kept.len() < policy.max_anchors && same_pose < policy.max_per_pose {
                    kept.push(moved.clone());
                    ops.push(IndexOp::Reassign {
                        id: a.id.clone(),
                        cluster_id: target.to_string(),
                    });
                } else {
                    moved.active = false;
                    deactivated.push(a.id.clone());
                    ops.push(IndexOp::Remove(a.id.clone()));
                }
            }
            txn.put_anchor(moved);
        }
        moved_anchors.sort_by(|a, b| a.id.cmp(&b.id));

        if t.identity_id.is_none() && s.identity_id.is_some() {
            t.identity_id = s.identity_id.clone();
            t.updated_at = now;
            txn.put_cluster(t);
        }

        let mut gone = s.clone();
        gone.lifecycle = Lifecycle::SoftDeleted;
        gone.deleted_at = Some(now);
        gone.merged_into = Some(target.to_string());
        gone.face_count = 0;
        gone.representative_face = None;
        gone.updated_at = now;
        txn.put_cluster(gone);
        txn.delete_stats(source);
        self.refresh_cluster(txn, target, now)?;

        Ok(Reversal::Merge {
            target_before,
            source_before: s,
            source_stats,
            moved_faces,
            moved_anchors,
            deactivated,
        })
    }

    /// Move `faces` out of `cluster` into a new cluster.
    /// Returns `(new_cluster_id, history_id)`.
    pub fn split_cluster(&self, cluster: &str, faces: &[String]) -> Result<(String, String)> {
        let now = Utc::now();
        let out = self.write(|txn, ops| {
            let (created, reversal) = self.split_in(txn, cluster, faces, now, ops)?;
            let hid = history::record(
                txn,
                HistoryOp::Split,
                vec![cluster.to_string(), created.clone()],
                reversal,
                now,
                self.cfg.retention(),
            )?;
            Ok((created, hid))
        })?;
        info!(cluster, created = %out.0, faces = faces.len(), "cluster: cluster split");
        Ok(out)
    }

    fn split_in(
        &self,
        txn: &mut Txn<'_>,
        cluster: &str,
        faces: &[String],
        now: DateTime<Utc>,
        ops: &mut Vec<IndexOp>,
    ) -> Result<(String, Reversal)> {
        txn.require_cluster(cluster)?;
        let wanted: BTreeSet<&String> = faces.iter().collect();
        if wanted.is_empty() {
            return Err(ClusterError::Invalid("split needs at least one face".into()));
        }
        let members: BTreeSet<String> = txn.member_ids(cluster)?.into_iter().collect();
        if let Some(f) = wanted.iter().find(|f| !members.contains(f.as_str())) {
            return Err(ClusterError::Invalid(format!("face {f} is not in {cluster}")));
        }
        if wanted.len() == members.len() {
            return Err(ClusterError::Invalid(format!("split would leave {cluster} empty")));
        }

        let created = self.new_cluster(txn, now)?.id;
        for fid in &wanted {
            if let Some(mut f) = txn.face(fid)? {
                f.cluster_id = Some(created.clone());
                f.updated_at = now;
                txn.put_face(f);
            }
            if let Some(mut a) = txn.anchor(cluster, fid)? {
                txn.delete_anchor(cluster, fid);
                a.cluster_id = created.clone();
                if a.active {
                    ops.push(IndexOp::Reassign {
                        id: a.id.clone(),
                        cluster_id: created.clone(),
                    });
                }
                txn.put_anchor(a);
            }
        }

        let mut promoted = Vec::new();
        for c in [cluster, created.as_str()] {
            if let Some(a) = self.backfill_anchor(txn, c, now)? {
                promoted.push(a.id.clone());
                ops.push(IndexOp::Add(a));
            }
            self.refresh_cluster(txn, c, now)?;
        }

        Ok((
            created.clone(),
            Reversal::Split {
                source: cluster.to_string(),
                created,
                faces: wanted.into_iter().cloned().collect(),
                promoted,
            },
        ))
    }

    /// Move one face into another cluster. Returns the history id.
    pub fn move_face(&self, face_id: &str, cluster: &str) -> Result<String> {
        let now = Utc::now();
        let constraints = self.constraint_set();
        self.write(|txn, ops| {
            let m = self.move_face_in(txn, &constraints, face_id, cluster, Confidence::UserConfirmed, now, ops)?;
            let clusters = m.from.iter().cloned().chain([m.to.clone()]).collect();
            history::record(txn, HistoryOp::MoveFace, clusters, Reversal::MoveFace(m), now, self.cfg.retention())
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn move_face_in(
        &self,
        txn: &mut Txn<'_>,
        constraints: &ConstraintSet,
        face_id: &str,
        to: &str,
        confidence: Confidence,
        now: DateTime<Utc>,
        ops: &mut Vec<IndexOp>,
    ) -> Result<FaceMove> {
        let mut face = txn
            .face(face_id)?
            .filter(|f| f.is_active())
            .ok_or_else(|| ClusterError::not_found("face", face_id))?;
        txn.require_cluster(to)?;
        if face.cluster_id.as_deref() == Some(to) {
            return Err(ClusterError::Invalid(format!("face {face_id} is already in {to}")));
        }
        if constraints.cluster_forbids(txn, face_id, to)? {
            return Err(ClusterError::ConstraintViolation(format!(
                "{face_id} has a cannot-link partner in {to}"
            )));
        }

        let from = face.cluster_id.clone();
        let from_confidence = face.confidence;
        let old_anchor = match &from {
            Some(c) => txn.anchor(c, face_id)?,
            None => None,
        };
        if let Some(a) = &old_anchor {
            txn.delete_anchor(&a.cluster_id, face_id);
            if a.active {
                ops.push(IndexOp::Remove(face_id.to_string()));
            }
        }

        face.cluster_id = Some(to.to_string());
        face.confidence = confidence;
        face.updated_at = now;
        txn.put_face(face.clone());
        txn.delete_staged(face_id);

        let promoted = match self.promote(txn, &face, to, false, now)?.added {
            Some(a) => {
                ops.push(IndexOp::Add(a));
                true
            }
            None => false,
        };
        let mut backfilled = None;
        if let Some(c) = &from {
            if let Some(a) = self.backfill_anchor(txn, c, now)? {
                backfilled = Some(a.id.clone());
                ops.push(IndexOp::Add(a));
            }
            self.refresh_cluster(txn, c, now)?;
        }
        self.refresh_cluster(txn, to, now)?;

        Ok(FaceMove {
            face_id: face_id.to_string(),
            from,
            from_confidence,
            to: to.to_string(),
            old_anchor,
            promoted,
            backfilled,
        })
    }

    /// Soft-delete a face. Returns the history id.
    pub fn remove_face(&self, face_id: &str) -> Result<String> {
        let now = Utc::now();
        self.write(|txn, ops| {
            let mut face = txn
                .face(face_id)?
                .filter(|f| f.is_active())
                .ok_or_else(|| ClusterError::not_found("face", face_id))?;
            let face_before = face.clone();
            let anchor = match &face.cluster_id {
                Some(c) => txn.anchor(c, face_id)?,
                None => None,
            };
            if let Some(a) = &anchor {
                txn.delete_anchor(&a.cluster_id, face_id);
                if a.active {
                    ops.push(IndexOp::Remove(face_id.to_string()));
                }
            }
            face.lifecycle = Lifecycle::SoftDeleted;
            face.deleted_at = Some(now);
            face.updated_at = now;
            let cluster = face.cluster_id.clone();
            txn.put_face(face);
            txn.delete_staged(face_id);

            let mut promoted = None;
            if let Some(c) = &cluster {
                if let Some(a) = self.backfill_anchor(txn, c, now)? {
                    promoted = Some(a.id.clone());
                    ops.push(IndexOp::Add(a));
                }
                self.refresh_cluster(txn, c, now)?;
            }
            history::record(
                txn,
                HistoryOp::RemoveFace,
                cluster.into_iter().collect(),
                Reversal::RemoveFace {
                    face_before,
                    anchor,
                    promoted,
                },
                now,
                self.cfg.retention(),
            )
        })
    }

    /// Name the person of a cluster, creating its identity on first use.
    /// Returns the history id.
    pub fn rename_cluster(&self, cluster: &str, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClusterError::Invalid("name must not be empty".into()));
        }
        let now = Utc::now();
        self.write(|txn, _| {
            let mut c = txn.require_cluster(cluster)?;
            let existing = match &c.identity_id {
                Some(iid) => txn.identity(iid)?.filter(|i| i.is_active()),
                None => None,
            };
            let reversal = match existing {
                Some(mut ident) => {
                    let before = std::mem::replace(&mut ident.name, name.to_string());
                    let identity_id = ident.id.clone();
                    txn.put_identity(ident);
                    Reversal::Rename {
                        cluster_id: cluster.to_string(),
                        identity_id,
                        created: false,
                        name_before: Some(before),
                    }
                }
                None => {
                    let ident = Identity {
                        id: Uuid::new_v4().to_string(),
                        name: name.to_string(),
                        birthday: None,
                        display_number: None,
                        lifecycle: Lifecycle::Active,
                        deleted_at: None,
                        created_at: now,
                    };
                    let identity_id = ident.id.clone();
                    txn.put_identity(ident);
                    c.identity_id = Some(identity_id.clone());
                    c.updated_at = now;
                    txn.put_cluster(c);
                    Reversal::Rename {
                        cluster_id: cluster.to_string(),
                        identity_id,
                        created: true,
                        name_before: None,
                    }
                }
            };
            history::record(txn, HistoryOp::Rename, vec![cluster.to_string()], reversal, now, self.cfg.retention())
        })
    }

    /// Create a standalone identity that clusters can be assigned to.
    pub fn create_identity(
        &self,
        name: &str,
        birthday: Option<NaiveDate>,
        display_number: Option<u32>,
    ) -> Result<Identity> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClusterError::Invalid("name must not be empty".into()));
        }
        let ident = Identity {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            birthday,
            display_number,
            lifecycle: Lifecycle::Active,
            deleted_at: None,
            created_at: Utc::now(),
        };
        self.write(|txn, _| {
            txn.put_identity(ident.clone());
            Ok(())
        })?;
        Ok(ident)
    }

    /// Bind (or with `None`, unbind) a cluster's identity. Returns the
    /// history id.
    pub fn assign_identity(&self, cluster: &str, identity: Option<&str>) -> Result<String> {
        let now = Utc::now();
        self.write(|txn, _| {
            let mut c = txn.require_cluster(cluster)?;
            if let Some(iid) = identity {
                txn.identity(iid)?
                    .filter(|i| i.is_active())
                    .ok_or_else(|| ClusterError::not_found("identity", iid))?;
            }
            if c.identity_id.as_deref() == identity {
                return Err(ClusterError::Invalid(format!("{cluster} already has that identity")));
            }
            let before = std::mem::replace(&mut c.identity_id, identity.map(String::from));
            c.updated_at = now;
            txn.put_cluster(c);
            history::record(
                txn,
                HistoryOp::AssignIdentity,
                vec![cluster.to_string()],
                Reversal::AssignIdentity {
                    cluster_id: cluster.to_string(),
                    before,
                },
                now,
                self.cfg.retention(),
            )
        })
    }

    /// Settle a CONFLICT staged face: into `cluster`, or into a new cluster
    /// with `None`. Returns the cluster id.
    pub fn resolve_conflict(&self, face_id: &str, cluster: Option<&str>) -> Result<String> {
        let now = Utc::now();
        let constraints = self.constraint_set();
        self.write(|txn, ops| {
            txn.staged(face_id)?
                .ok_or_else(|| ClusterError::not_found("staged face", face_id))?;
            let placed = txn.face(face_id)?.is_some_and(|f| f.cluster_id.is_some());
            if placed {
                return Err(ClusterError::Invalid(format!("face {face_id} is already placed")));
            }
            let target = match cluster {
                Some(c) => c.to_string(),
                None => self.new_cluster(txn, now)?.id,
            };
            self.move_face_in(txn, &constraints, face_id, &target, Confidence::UserConfirmed, now, ops)?;
            // MUST_LINK partners held in CONFLICT with this face follow it.
            for p in constraints.must_partners(face_id) {
                let held = txn.staged(p)?.is_some_and(|s| s.status == StagedStatus::Conflict)
                    && txn.face(p)?.is_some_and(|f| f.is_active() && f.cluster_id.is_none());
                if held && !constraints.cluster_forbids(txn, p, &target)? {
                    self.move_face_in(txn, &constraints, p, &target, Confidence::Constrained, now, ops)?;
                }
            }
            Ok(target)
        })
    }

    /// Record a pair constraint and reconcile current placement: MUST_LINK
    /// pulls `x` into `y`'s cluster, CANNOT_LINK moves `x` out into a new
    /// singleton. Returns the history id.
    pub fn add_constraint(&self, x: &str, y: &str, kind: ConstraintKind) -> Result<String> {
        let now = Utc::now();
        let constraint = Constraint::new(x, y, kind, now)
            .ok_or_else(|| ClusterError::Invalid(format!("face {x} cannot be constrained with itself")))?;
        let constraints = self.constraint_set();
        match constraints.get(x, y) {
            Some(k) if k == kind => {
                return Err(ClusterError::Invalid(format!("{x} and {y} already have this constraint")));
            }
            Some(_) => {
                return Err(ClusterError::ConstraintViolation(format!(
                    "{x} and {y} already have the opposite constraint"
                )));
            }
            None => {}
        }

        let id = self.write(|txn, ops| {
            let fx = txn
                .face(x)?
                .filter(|f| f.is_active())
                .ok_or_else(|| ClusterError::not_found("face", x))?;
            let fy = txn
                .face(y)?
                .filter(|f| f.is_active())
                .ok_or_else(|| ClusterError::not_found("face", y))?;
            txn.put_constraint(constraint.clone());

            let (moved, created) = match (kind, fx.cluster_id, fy.cluster_id) {
                (ConstraintKind::MustLink, cx, Some(cy)) if cx.as_deref() != Some(cy.as_str()) => {
                    let m = self.move_face_in(txn, &constraints, x, &cy, Confidence::Constrained, now, ops)?;
                    (Some(m), None)
                }
                (ConstraintKind::CannotLink, Some(cx), Some(cy)) if cx == cy => {
                    let fresh = self.new_cluster(txn, now)?.id;
                    let m = self.move_face_in(txn, &constraints, x, &fresh, Confidence::UserConfirmed, now, ops)?;
                    (Some(m), Some(fresh))
                }
                _ => (None, None),
            };
            let clusters: Vec<String> = moved
                .iter()
                .flat_map(|m| m.from.iter().cloned().chain([m.to.clone()]))
                .collect();
            history::record(
                txn,
                HistoryOp::AddConstraint,
                clusters,
                Reversal::AddConstraint {
                    constraint: constraint.clone(),
                    moved,
                    created,
                },
                now,
                self.cfg.retention(),
            )
        })?;
        self.reload_constraints()?;
        info!(x, y, ?kind, history = %id, "cluster: constraint added");
        Ok(id)
    }

    /// Drop a constraint. Returns false when the pair had none.
    pub fn remove_constraint(&self, x: &str, y: &str) -> Result<bool> {
        if self.constraint_set().get(x, y).is_none() {
            return Ok(false);
        }
        let (a, b) = if x < y { (x, y) } else { (y, x) };
        self.write(|txn, _| {
            txn.delete_constraint(a, b);
            Ok(())
        })?;
        self.reload_constraints()?;
        Ok(true)
    }
}
