use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cluster: kv error: {0}")]
    Storage(#[from] facegroup_kv::KvError),

    #[error("cluster: vector index error: {0}")]
    Vector(#[from] facegroup_vecstore::VecError),

    #[error("cluster: serialization error: {0}")]
    Serialization(String),

    #[error("cluster: {kind} {id:?} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("cluster: invalid request: {0}")]
    Invalid(String),

    #[error("cluster: constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("cluster: history entry {0} has expired")]
    HistoryExpired(String),

    #[error("cluster: history entry {0} was already undone")]
    HistoryUndone(String),

    #[error("cluster: cannot undo {id}: {reason}")]
    UndoConflict { id: String, reason: String },

    #[error("cluster: embed dimension mismatch: stored {stored}, current {current}")]
    EmbedDimensionMismatch { stored: usize, current: usize },

    #[error("cluster: schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("cluster: migration to v{version} failed: {reason}")]
    Migration { version: u32, reason: String },
}

impl ClusterError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ClusterError::NotFound { kind, id: id.into() }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
