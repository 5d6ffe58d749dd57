//! Incremental face clustering over a key-value store.
//!
//! Faces are staged and resolved in batches against per-cluster anchors
//! with adaptive thresholds. User edits are recorded for undo, pair
//! constraints are honored at every placement, and a refinement pass
//! merges, rechecks and repairs the library in the background.

pub mod actions;
pub mod anchor_index;
pub mod config;
pub mod constraint;
pub mod engine;
pub mod error;
pub mod history;
pub mod keys;
pub mod migrate;
pub mod query;
pub mod refine;
pub mod staging;
pub mod stats;
pub mod store;
pub mod types;
pub mod undo;

pub use anchor_index::{AnchorHit, AnchorIndex, IntegrityReport};
pub use config::{
    AnchorPolicy, EngineConfig, IndexConfig, IntegrityConfig, RefinementConfig, StagingConfig,
    ThresholdPolicy,
};
pub use constraint::ConstraintSet;
pub use engine::Engine;
pub use error::{ClusterError, Result};
pub use history::CleanupReport;
pub use migrate::{MigrationReport, SCHEMA_VERSION};
pub use refine::{RefineStep, RefinementReport, StepReport};
pub use staging::FlushReport;
pub use store::{Store, Txn};
pub use types::{
    Anchor, Candidate, Cluster, ClusterStatistics, Confidence, Constraint, ConstraintKind,
    FaceMove, FaceObservation, HistoryEntry, HistoryOp, Identity, Lifecycle, PoseHistogram,
    Reversal, StagedFace, StagedStatus,
};

#[cfg(test)]
mod tests;
