//! The scan command.

use std::sync::Arc;

use clap::Args;
use serde::Serialize;

use facegroup_faceprint::{EmbeddingGenerator, WholeImageDetector};
use facegroup_scan::{
    DirCatalog, LocalScheduler, Orchestrator, ScanOutcome, ScanParams, ScanScheduler, ScanState, SystemMonitor,
};

use super::{open_library, output_result, print_success, print_verbose};
use crate::Cli;

/// Scan a photo directory.
///
/// New and changed photos are queued, faces are extracted in batches and
/// clustered. Ctrl-C pauses after the current batch; run again with
/// `--resume` to continue.
#[derive(Args)]
pub struct ScanCommand {
    /// Photo directory
    dir: String,

    /// Re-extract photos that are already done or failed
    #[arg(long)]
    force: bool,

    /// Continue the last paused, failed or interrupted run
    #[arg(long)]
    resume: bool,
}

#[derive(Serialize)]
struct ScanSummary {
    run_id: String,
    state: ScanState,
    total: usize,
    processed: usize,
    faces: usize,
    failed: usize,
    skipped: usize,
    flushes: usize,
    merges: usize,
    split_flags: usize,
    purged: usize,
}

impl From<&ScanOutcome> for ScanSummary {
    fn from(out: &ScanOutcome) -> Self {
        let cp = &out.checkpoint;
        Self {
            run_id: cp.run_id.clone(),
            state: out.state,
            total: cp.total,
            processed: cp.processed,
            faces: cp.found,
            failed: cp.failed,
            skipped: cp.skipped,
            flushes: out.flushes.len(),
            merges: out.refinement.as_ref().map_or(0, |r| r.merges.len()),
            split_flags: out
                .refinement
                .as_ref()
                .map_or(0, |r| r.count(facegroup_cluster::RefineStep::SplitDetection)),
            purged: out.cleanup.as_ref().map_or(0, |c| c.total()),
        }
    }
}

impl ScanCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let lib = open_library(cli)?;

        let mut catalog = DirCatalog::new(&self.dir);
        if !lib.config.extensions.is_empty() {
            let exts: Vec<&str> = lib.config.extensions.iter().map(String::as_str).collect();
            catalog = catalog.with_extensions(&exts);
        }
        let dim = lib.engine.config().dim;
        let extractor = EmbeddingGenerator::fallback_only(Arc::new(WholeImageDetector), dim, lib.config.generator.clone());
        let orchestrator = Orchestrator::new(
            lib.engine.clone(),
            Arc::new(catalog),
            Arc::new(extractor),
            Arc::new(SystemMonitor::new()),
            lib.config.scan.clone(),
        );
        let scheduler = LocalScheduler::new(Arc::new(orchestrator));

        print_verbose(cli, &format!("Scanning {}", self.dir));
        let handle = scheduler.start(ScanParams {
            force_rescan: self.force,
            resume: self.resume,
        });
        let mut progress = scheduler.progress();
        let wait = handle.wait();
        tokio::pin!(wait);

        let mut pausing = false;
        let outcome = loop {
            tokio::select! {
                res = &mut wait => break res?,
                changed = progress.changed() => {
                    if changed.is_ok() {
                        let p = progress.borrow_and_update().clone();
                        print_verbose(cli, &format!(
                            "{}/{} photos, {} faces, {} failed ({:.1}/s)",
                            p.processed, p.total, p.found, p.failed, p.throughput
                        ));
                    }
                }
                _ = tokio::signal::ctrl_c(), if !pausing => {
                    pausing = true;
                    eprintln!("Pausing after the current batch...");
                    scheduler.pause();
                }
            }
        };

        match outcome.state {
            ScanState::Complete => print_success(&format!(
                "Scanned {} photos, {} faces",
                outcome.checkpoint.processed, outcome.checkpoint.found
            )),
            ScanState::Paused => print_success("Scan paused; continue with --resume"),
            _ => {}
        }
        output_result(&ScanSummary::from(&outcome), cli.json)
    }
}
