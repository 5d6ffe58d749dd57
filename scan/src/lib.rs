//! Background photo scanning for face clustering.
//!
//! A scan enumerates a [`PhotoCatalog`], extracts faces in batches sized
//! to the current memory and battery pressure, stages them into the
//! clustering [`Engine`](facegroup_cluster::Engine) and flushes them in
//! groups. Progress survives restarts through a persisted work queue and
//! checkpoint; a drained queue ends with a refinement pass.

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod resource;
pub mod scheduler;

pub use catalog::{DirCatalog, FaceExtractor, PhotoCatalog, PhotoRef};
pub use checkpoint::{CHECKPOINT_KEY, ScanCheckpoint, ScanParams, ScanState};
pub use config::ScanConfig;
pub use error::{Result, ScanError};
pub use orchestrator::{Orchestrator, RunControl, ScanOutcome};
pub use progress::ScanProgress;
pub use queue::{Enqueued, Failure, ItemState, QueueCounts, WorkItem, WorkQueue};
pub use resource::{BatchPlan, BatchPlanner, BatteryState, Pressure, ResourceMonitor, ResourceSample, SystemMonitor};
pub use scheduler::{LocalScheduler, RunFailure, RunHandle, ScanScheduler};

#[cfg(test)]
mod tests;
