//! Commands that read or edit the clustered library.

use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use facegroup_cluster::HistoryOp;
use facegroup_scan::{ScanCheckpoint, WorkQueue};

use super::{open_library, output_result, print_success};
use crate::Cli;

/// Show the last scan checkpoint and queue totals.
#[derive(Args)]
pub struct StatusCommand {}

#[derive(Serialize)]
struct Status {
    library: String,
    checkpoint: Option<ScanCheckpoint>,
    pending: usize,
    done: usize,
    failed: usize,
    clusters: usize,
    conflicts: usize,
    needs_review: usize,
    failures: Vec<FailureRow>,
}

#[derive(Serialize)]
struct FailureRow {
    photo: String,
    error: Option<String>,
}

impl StatusCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let lib = open_library(cli)?;
        let kv = lib.engine.store().kv().clone();
        let checkpoint = ScanCheckpoint::load(kv.as_ref())?;
        let queue = WorkQueue::new(kv);
        let counts = queue.counts()?;
        let status = Status {
            library: lib.data_dir.display().to_string(),
            checkpoint,
            pending: counts.pending,
            done: counts.done,
            failed: counts.failed,
            clusters: lib.engine.clusters()?.len(),
            conflicts: lib.engine.conflicts()?.len(),
            needs_review: lib.engine.split_candidates()?.len(),
            failures: queue
                .failures()?
                .into_iter()
                .map(|(photo, error)| FailureRow { photo, error })
                .collect(),
        };
        output_result(&status, cli.json)
    }
}

/// Run every refinement step once and save the anchor index.
#[derive(Args)]
pub struct RefineCommand {}

#[derive(Serialize)]
struct StepRow {
    step: String,
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RefineCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let lib = open_library(cli)?;
        let engine = lib.engine.clone();
        let report = tokio::task::spawn_blocking(move || {
            let report = engine.refine();
            engine.save_index().map(|_| report)
        })
        .await??;
        let rows: Vec<StepRow> = report
            .steps
            .iter()
            .map(|s| StepRow {
                step: s.step.to_string(),
                count: s.count,
                error: s.error.clone(),
            })
            .collect();
        if report.is_ok() {
            print_success(&format!("Refined, {} merges", report.merges.len()));
        }
        output_result(&rows, cli.json)
    }
}

/// List active clusters, largest first.
#[derive(Args)]
pub struct ClustersCommand {
    /// Show at most this many clusters
    #[arg(short = 'n', long, default_value_t = 50)]
    limit: usize,

    /// Only clusters flagged for review
    #[arg(long)]
    review: bool,
}

#[derive(Serialize)]
struct ClusterRow {
    id: String,
    faces: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    representative: Option<String>,
    needs_review: bool,
}

impl ClustersCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let lib = open_library(cli)?;
        let clusters = if self.review {
            lib.engine.split_candidates()?
        } else {
            lib.engine.clusters()?
        };
        let rows: Vec<ClusterRow> = clusters
            .into_iter()
            .take(self.limit)
            .map(|c| ClusterRow {
                id: c.id,
                faces: c.face_count,
                identity: c.identity_id,
                representative: c.representative_face,
                needs_review: c.needs_review,
            })
            .collect();
        output_result(&rows, cli.json)
    }
}

/// Merge SOURCE into TARGET.
#[derive(Args)]
pub struct MergeCommand {
    target: String,
    source: String,
}

impl MergeCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let lib = open_library(cli)?;
        let history_id = lib.engine.merge_clusters(&self.target, &self.source)?;
        lib.engine.save_index()?;
        print_success(&format!("Merged {} into {} (undo with {})", self.source, self.target, history_id));
        Ok(())
    }
}

/// Show recent edits, newest first.
#[derive(Args)]
pub struct HistoryCommand {
    #[arg(short = 'n', long, default_value_t = 20)]
    limit: usize,
}

#[derive(Serialize)]
struct HistoryRow {
    id: String,
    op: HistoryOp,
    clusters: Vec<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    undone: bool,
}

impl HistoryCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let lib = open_library(cli)?;
        let rows: Vec<HistoryRow> = lib
            .engine
            .history(self.limit)?
            .into_iter()
            .map(|h| HistoryRow {
                id: h.id,
                op: h.op,
                clusters: h.clusters,
                created_at: h.created_at,
                expires_at: h.expires_at,
                undone: h.undone,
            })
            .collect();
        output_result(&rows, cli.json)
    }
}

/// Revert one edit.
#[derive(Args)]
pub struct UndoCommand {
    /// History id, as shown by `facescan history`
    id: String,
}

impl UndoCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let lib = open_library(cli)?;
        lib.engine.undo(&self.id)?;
        lib.engine.save_index()?;
        print_success(&format!("Undid {}", self.id));
        Ok(())
    }
}
