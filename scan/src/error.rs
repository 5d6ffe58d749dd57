use thiserror::Error;

use facegroup_cluster::ClusterError;
use facegroup_kv::KvError;

use crate::checkpoint::ScanCheckpoint;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scan: cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("scan: kv error: {0}")]
    Storage(#[from] KvError),

    #[error("scan: serialization error: {0}")]
    Serialization(String),

    #[error("scan: catalog error: {0}")]
    Catalog(String),

    #[error("scan: resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("scan: worker task failed: {0}")]
    Join(String),

    /// A run stopped on an error. Carries the counters of its last checkpoint.
    #[error(
        "scan: run {} failed after {} processed, {} failed: {reason}",
        checkpoint.run_id,
        checkpoint.processed,
        checkpoint.failed
    )]
    Failed {
        reason: String,
        checkpoint: Box<ScanCheckpoint>,
    },
}

impl ScanError {
    pub fn catalog(e: impl std::fmt::Display) -> Self {
        ScanError::Catalog(e.to_string())
    }

    /// Checkpoint counters of a failed run.
    pub fn checkpoint(&self) -> Option<&ScanCheckpoint> {
        match self {
            ScanError::Failed { checkpoint, .. } => Some(checkpoint),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
