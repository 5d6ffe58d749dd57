use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use facegroup_cluster::Txn;
use facegroup_kv::KvStore;

use crate::error::{Result, ScanError};

pub const CHECKPOINT_KEY: &str = "scan:checkpoint";

/// Lifecycle of a scan run: `Idle -> Scanning -> {Paused, Failed, Complete}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
    Paused,
    Failed,
    Complete,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Scanning => "scanning",
            ScanState::Paused => "paused",
            ScanState::Failed => "failed",
            ScanState::Complete => "complete",
        }
    }

    /// A run left in this state can be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(self, ScanState::Scanning | ScanState::Paused | ScanState::Failed)
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options a run was started with; kept in the checkpoint so a resumed
/// run continues under the same terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanParams {
    /// Requeue photos that are already done or failed.
    pub force_rescan: bool,
    /// Continue a paused, failed or interrupted run instead of starting over.
    pub resume: bool,
}

/// Restart point of a scan run, persisted at `scan:checkpoint`.
///
/// Counters cover the whole work queue: `processed` photos are done,
/// `failed` are permanently failed, `skipped` were already done and
/// unchanged when this run enumerated the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    pub run_id: String,
    pub state: ScanState,
    #[serde(default)]
    pub params: ScanParams,
    pub total: usize,
    pub processed: usize,
    /// Faces staged from processed photos.
    pub found: usize,
    pub failed: usize,
    pub skipped: usize,
    pub last_item: Option<String>,
    /// Catalog enumeration time; later runs only ask for newer photos.
    pub last_enumerated: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanCheckpoint {
    pub fn new(run_id: String, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            state: ScanState::Idle,
            params: ScanParams::default(),
            total: 0,
            processed: 0,
            found: 0,
            failed: 0,
            skipped: 0,
            last_item: None,
            last_enumerated: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Photos neither done nor permanently failed.
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed + self.failed)
    }

    pub fn load(kv: &dyn KvStore) -> Result<Option<Self>> {
        match kv.get(CHECKPOINT_KEY)? {
            Some(data) => rmp_serde::from_slice(&data)
                .map(Some)
                .map_err(|e| ScanError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Write into `txn` so it commits with the work it describes.
    pub fn stage(&self, txn: &mut Txn<'_>) -> Result<()> {
        let data = rmp_serde::to_vec_named(self).map_err(|e| ScanError::Serialization(e.to_string()))?;
        txn.put_raw(CHECKPOINT_KEY, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use facegroup_cluster::{Engine, EngineConfig};
    use facegroup_kv::MemoryStore;

    #[test]
    fn test_checkpoint_persists_through_txn() {
        let kv = MemoryStore::new();
        let engine = Engine::open(Arc::new(kv.clone()), EngineConfig::with_dim(8), None).unwrap();
        assert!(ScanCheckpoint::load(&kv).unwrap().is_none());

        let mut cp = ScanCheckpoint::new("run-1".into(), Utc::now());
        cp.state = ScanState::Paused;
        cp.total = 10;
        cp.processed = 4;
        cp.failed = 1;
        cp.last_item = Some("p3".into());
        let mut txn = engine.begin();
        cp.stage(&mut txn).unwrap();
        engine.commit(txn).unwrap();

        let back = ScanCheckpoint::load(&kv).unwrap().unwrap();
        assert_eq!(back, cp);
        assert_eq!(back.remaining(), 5);
        assert!(back.state.is_resumable());
        assert!(!ScanState::Complete.is_resumable());
    }
}
