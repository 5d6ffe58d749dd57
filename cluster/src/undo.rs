use chrono::{DateTime, Utc};
use tracing::info;

use crate::engine::{Engine, IndexOp};
use crate::error::{ClusterError, Result};
use crate::store::Txn;
use crate::types::{FaceMove, Lifecycle, Reversal, StagedFace, StagedStatus};

fn conflict(id: &str, reason: impl Into<String>) -> ClusterError {
    ClusterError::UndoConflict {
        id: id.to_string(),
        reason: reason.into(),
    }
}

impl Engine {
    pub fn undo(&self, history_id: &str) -> Result<()> {
        self.undo_at(history_id, Utc::now())
    }

    /// Reverse one history entry. Fails when the entry expired, was already
    /// undone, or later edits make the reversal inapplicable.
    pub fn undo_at(&self, history_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut reload = false;
        self.write(|txn, ops| {
            let mut entry = txn
                .history_entry(history_id)?
                .ok_or_else(|| ClusterError::not_found("history entry", history_id))?;
            if entry.undone {
                return Err(ClusterError::HistoryUndone(history_id.to_string()));
            }
            if now >= entry.expires_at {
                return Err(ClusterError::HistoryExpired(history_id.to_string()));
            }

            match &entry.reversal {
                Reversal::Merge {
                    target_before,
                    source_before,
                    source_stats,
                    moved_faces,
                    moved_anchors,
                    ..
                } => {
                    let target = &target_before.id;
                    let source = &source_before.id;
                    let mut t = txn
                        .require_cluster(target)
                        .map_err(|_| conflict(history_id, format!("{target} is gone")))?;
                    let merged_here = txn
                        .cluster(source)?
                        .is_some_and(|s| !s.is_active() && s.merged_into.as_deref() == Some(target.as_str()));
                    if !merged_here {
                        return Err(conflict(history_id, format!("{source} is no longer merged into {target}")));
                    }

                    let mut returned = Vec::new();
                    for fid in moved_faces {
                        let Some(mut f) = txn.face(fid)? else { continue };
                        if f.is_active() && f.cluster_id.as_deref() == Some(target.as_str()) {
                            f.cluster_id = Some(source.clone());
                            f.updated_at = now;
                            txn.put_face(f);
                            returned.push(fid.as_str());
                        }
                    }
                    for a in moved_anchors {
                        if let Some(cur) = txn.anchor(target, &a.id)? {
                            txn.delete_anchor(target, &a.id);
                            if cur.active {
                                ops.push(IndexOp::Remove(a.id.clone()));
                            }
                        }
                        if returned.contains(&a.id.as_str()) {
                            txn.put_anchor(a.clone());
                            if a.active {
                                ops.push(IndexOp::Add(a.clone()));
                            }
                        }
                    }

                    let mut restored = source_before.clone();
                    restored.updated_at = now;
                    txn.put_cluster(restored);
                    if let Some(s) = source_stats {
                        txn.put_stats(s.clone());
                    }
                    t.identity_id = target_before.identity_id.clone();
                    t.updated_at = now;
                    txn.put_cluster(t);
                    backfill(self, txn, target, now, ops)?;
                    backfill(self, txn, source, now, ops)?;
                    self.refresh_cluster(txn, target, now)?;
                    self.refresh_cluster(txn, source, now)?;
                }

                Reversal::Split {
                    source,
                    created,
                    faces,
                    promoted,
                } => {
                    txn.require_cluster(created)
                        .map_err(|_| conflict(history_id, format!("{created} is gone")))?;
                    self.revive_cluster(txn, source, now)
                        .map_err(|_| conflict(history_id, format!("{source} is gone")))?;
                    for fid in faces {
                        let Some(mut f) = txn.face(fid)? else { continue };
                        if !(f.is_active() && f.cluster_id.as_deref() == Some(created.as_str())) {
                            continue;
                        }
                        f.cluster_id = Some(source.clone());
                        f.updated_at = now;
                        txn.put_face(f);
                        if let Some(mut a) = txn.anchor(created, fid)? {
                            txn.delete_anchor(created, fid);
                            a.cluster_id = source.clone();
                            if a.active {
                                ops.push(IndexOp::Reassign {
                                    id: a.id.clone(),
                                    cluster_id: source.clone(),
                                });
                            }
                            txn.put_anchor(a);
                        }
                    }
                    for pid in promoted {
                        retire_anchor(txn, source, pid, ops)?;
                    }
                    backfill(self, txn, source, now, ops)?;
                    self.refresh_cluster(txn, source, now)?;
                    self.refresh_cluster(txn, created, now)?;
                }

                Reversal::MoveFace(m) => self.undo_move(txn, history_id, m, now, ops)?,

                Reversal::RemoveFace {
                    face_before,
                    anchor,
                    promoted,
                } => {
                    let deleted = txn.face(&face_before.id)?.is_some_and(|f| !f.is_active());
                    if !deleted {
                        return Err(conflict(history_id, format!("face {} is not removed", face_before.id)));
                    }
                    if let Some(c) = &face_before.cluster_id {
                        self.revive_cluster(txn, c, now)
                            .map_err(|_| conflict(history_id, format!("{c} is gone")))?;
                    }
                    let mut face = face_before.clone();
                    face.updated_at = now;
                    txn.put_face(face);
                    if let Some(a) = anchor {
                        txn.put_anchor(a.clone());
                        if a.active {
                            ops.push(IndexOp::Add(a.clone()));
                        }
                    }
                    match &face_before.cluster_id {
                        Some(c) => {
                            if let Some(pid) = promoted {
                                retire_anchor(txn, c, pid, ops)?;
                            }
                            backfill(self, txn, c, now, ops)?;
                            self.refresh_cluster(txn, c, now)?;
                        }
                        None => restage(txn, face_before.id.clone(), face_before.embedding.clone(), now),
                    }
                }

                Reversal::Rename {
                    cluster_id,
                    identity_id,
                    created,
                    name_before,
                } => {
                    let mut ident = txn
                        .identity(identity_id)?
                        .ok_or_else(|| conflict(history_id, format!("identity {identity_id} is gone")))?;
                    if *created {
                        if let Some(mut c) = txn.cluster(cluster_id)? {
                            if c.identity_id.as_deref() == Some(identity_id.as_str()) {
                                c.identity_id = None;
                                c.updated_at = now;
                                txn.put_cluster(c);
                            }
                        }
                        let shared = self
                            .store
                            .clusters()?
                            .iter()
                            .any(|c| c.id != *cluster_id && c.is_active() && c.identity_id.as_ref() == Some(identity_id));
                        if !shared {
                            ident.lifecycle = Lifecycle::SoftDeleted;
                            ident.deleted_at = Some(now);
                            txn.put_identity(ident);
                        }
                    } else if let Some(name) = name_before {
                        ident.name = name.clone();
                        txn.put_identity(ident);
                    }
                }

                Reversal::AssignIdentity { cluster_id, before } => {
                    let mut c = txn
                        .require_cluster(cluster_id)
                        .map_err(|_| conflict(history_id, format!("{cluster_id} is gone")))?;
                    c.identity_id = before.clone();
                    c.updated_at = now;
                    txn.put_cluster(c);
                }

                Reversal::AddConstraint { constraint, moved, .. } => {
                    txn.delete_constraint(&constraint.a, &constraint.b);
                    if let Some(m) = moved {
                        self.undo_move(txn, history_id, m, now, ops)?;
                    }
                    reload = true;
                }
            }

            entry.undone = true;
            txn.put_history(entry);
            Ok(())
        })?;
        if reload {
            self.reload_constraints()?;
        }
        info!(history = history_id, "cluster: operation undone");
        Ok(())
    }

    fn undo_move(
        &self,
        txn: &mut Txn<'_>,
        history_id: &str,
        m: &FaceMove,
        now: DateTime<Utc>,
        ops: &mut Vec<IndexOp>,
    ) -> Result<()> {
        let mut face = txn
            .face(&m.face_id)?
            .filter(|f| f.is_active() && f.cluster_id.as_deref() == Some(m.to.as_str()))
            .ok_or_else(|| conflict(history_id, format!("face {} is no longer in {}", m.face_id, m.to)))?;
        if let Some(c) = &m.from {
            self.revive_cluster(txn, c, now)
                .map_err(|_| conflict(history_id, format!("{c} is gone")))?;
        }

        if let Some(a) = txn.anchor(&m.to, &m.face_id)? {
            txn.delete_anchor(&m.to, &m.face_id);
            if a.active {
                ops.push(IndexOp::Remove(m.face_id.clone()));
            }
        }
        face.cluster_id = m.from.clone();
        face.confidence = m.from_confidence;
        face.updated_at = now;
        let embedding = face.embedding.clone();
        txn.put_face(face);
        if let Some(a) = &m.old_anchor {
            txn.put_anchor(a.clone());
            if a.active {
                ops.push(IndexOp::Add(a.clone()));
            }
        }

        match &m.from {
            Some(c) => {
                if let Some(b) = &m.backfilled {
                    retire_anchor(txn, c, b, ops)?;
                }
                self.refresh_cluster(txn, c, now)?;
            }
            None => restage(txn, m.face_id.clone(), embedding, now),
        }
        backfill(self, txn, &m.to, now, ops)?;
        self.refresh_cluster(txn, &m.to, now)
    }
}

fn backfill(engine: &Engine, txn: &mut Txn<'_>, cluster_id: &str, now: DateTime<Utc>, ops: &mut Vec<IndexOp>) -> Result<()> {
    if let Some(a) = engine.backfill_anchor(txn, cluster_id, now)? {
        ops.push(IndexOp::Add(a));
    }
    Ok(())
}

/// Deactivate an anchor an edit had promoted.
fn retire_anchor(txn: &mut Txn<'_>, cluster_id: &str, id: &str, ops: &mut Vec<IndexOp>) -> Result<()> {
    if let Some(mut a) = txn.anchor(cluster_id, id)? {
        if a.active {
            a.active = false;
            txn.put_anchor(a);
            ops.push(IndexOp::Remove(id.to_string()));
        }
    }
    Ok(())
}

/// Queue an unassigned face for the next flush again.
fn restage(txn: &mut Txn<'_>, face_id: String, embedding: Vec<f32>, now: DateTime<Utc>) {
    txn.put_staged(StagedFace {
        face_id,
        embedding,
        best: None,
        runner_up: None,
        status: StagedStatus::Pending,
        staged_at: now,
    });
}
