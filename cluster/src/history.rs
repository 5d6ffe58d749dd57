//! Append-only operation log for undo, and the retention sweep.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::engine::Engine;
use crate::error::Result;
use crate::store::Txn;
use crate::types::{HistoryEntry, HistoryOp, Reversal};

/// Append a history entry to `txn` and return its id.
pub(crate) fn record(
    txn: &mut Txn<'_>,
    op: HistoryOp,
    clusters: Vec<String>,
    reversal: Reversal,
    now: DateTime<Utc>,
    retention: Duration,
) -> Result<String> {
    let id = txn.next_history_id()?;
    txn.put_history(HistoryEntry {
        id: id.clone(),
        op,
        clusters,
        reversal,
        created_at: now,
        expires_at: now + retention,
        undone: false,
    });
    Ok(id)
}

/// What a retention sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_history: usize,
    pub purged_faces: usize,
    pub purged_clusters: usize,
    pub purged_identities: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.expired_history + self.purged_faces + self.purged_clusters + self.purged_identities
    }
}

impl Engine {
    pub fn cleanup_history(&self) -> Result<CleanupReport> {
        self.cleanup_history_at(Utc::now())
    }

    /// Delete expired history entries, then purge soft-deleted faces,
    /// clusters and identities whose deletion predates the retention window.
    pub fn cleanup_history_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let _w = self.lock_writer();
        let cutoff = now - self.cfg.retention();
        let mut report = CleanupReport::default();
        let mut txn = self.store.begin();
        let expired = |at: Option<DateTime<Utc>>| at.is_some_and(|t| t <= cutoff);

        for entry in self.store.history()? {
            if entry.expires_at <= now {
                txn.delete_history(&entry.id);
                report.expired_history += 1;
            }
        }

        let mut purged_faces = Vec::new();
        for face in self.store.faces()? {
            if !face.is_active() && expired(face.deleted_at) {
                txn.delete_face(&face.id);
                txn.delete_staged(&face.id);
                purged_faces.push(face.id);
            }
        }
        if !purged_faces.is_empty() {
            for a in self.store.anchors()? {
                if purged_faces.contains(&a.id) {
                    txn.delete_anchor(&a.cluster_id, &a.id);
                }
            }
        }
        report.purged_faces = purged_faces.len();

        for cluster in self.store.clusters()? {
            if !cluster.is_active() && expired(cluster.deleted_at) {
                for a in self.store.anchors_of(&cluster.id)? {
                    txn.delete_anchor(&cluster.id, &a.id);
                }
                txn.delete_stats(&cluster.id);
                txn.delete_cluster(&cluster.id);
                report.purged_clusters += 1;
            }
        }

        for identity in self.store.identities()? {
            if !identity.is_active() && expired(identity.deleted_at) {
                txn.delete_identity(&identity.id);
                report.purged_identities += 1;
            }
        }

        self.store.commit(txn)?;
        if report.total() > 0 {
            info!(
                history = report.expired_history,
                faces = report.purged_faces,
                clusters = report.purged_clusters,
                identities = report.purged_identities,
                "cluster: retention sweep"
            );
        }
        Ok(report)
    }
}
