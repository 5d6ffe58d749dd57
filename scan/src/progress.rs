use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{ScanCheckpoint, ScanState};
use crate::resource::Pressure;

/// Snapshot published while a scan runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub run_id: Option<String>,
    pub state: ScanState,
    pub total: usize,
    pub processed: usize,
    pub found: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Photos per second over this run.
    pub throughput: f64,
    pub eta_secs: Option<f64>,
    pub pressure: Pressure,
}

impl ScanProgress {
    /// Progress from a checkpoint, `done_this_run` photos finished in
    /// `elapsed` since this run started.
    pub fn from_checkpoint(cp: &ScanCheckpoint, done_this_run: usize, elapsed: Duration, pressure: Pressure) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 { done_this_run as f64 / secs } else { 0.0 };
        let remaining = cp.remaining();
        let eta_secs = match (remaining, throughput > 0.0) {
            (0, _) => Some(0.0),
            (n, true) => Some(n as f64 / throughput),
            (_, false) => None,
        };
        Self {
            run_id: Some(cp.run_id.clone()),
            state: cp.state,
            total: cp.total,
            processed: cp.processed,
            found: cp.found,
            failed: cp.failed,
            skipped: cp.skipped,
            throughput,
            eta_secs,
            pressure,
        }
    }

    /// Fraction of the queue settled, done or failed.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.processed + self.failed) as f64 / self.total as f64
    }
}
