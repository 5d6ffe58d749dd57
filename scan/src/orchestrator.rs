//! The scan loop: enumerate, extract in adaptive batches, stage, flush,
//! then refine once the queue drains.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use facegroup_cluster::{CleanupReport, Engine, FlushReport, RefinementReport};
use facegroup_faceprint::FaceEmbedding;

use crate::catalog::{FaceExtractor, PhotoCatalog, PhotoRef};
use crate::checkpoint::{ScanCheckpoint, ScanParams, ScanState};
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::progress::ScanProgress;
use crate::queue::{Failure, WorkItem, WorkQueue};
use crate::resource::{BatchPlan, BatchPlanner, Pressure, ResourceMonitor};

/// Signals shared between a running scan and whoever drives it.
#[derive(Clone)]
pub struct RunControl {
    /// Stop at the next batch boundary and leave the run idle.
    pub cancel: CancellationToken,
    /// Stop at the next batch boundary and leave the run resumable.
    pub pause: CancellationToken,
    pub progress: Arc<watch::Sender<ScanProgress>>,
}

impl RunControl {
    pub fn new() -> (Self, watch::Receiver<ScanProgress>) {
        let (tx, rx) = watch::channel(ScanProgress::default());
        let ctl = Self {
            cancel: CancellationToken::new(),
            pause: CancellationToken::new(),
            progress: Arc::new(tx),
        };
        (ctl, rx)
    }

    fn stopping(&self) -> Option<ScanState> {
        if self.cancel.is_cancelled() {
            Some(ScanState::Idle)
        } else if self.pause.is_cancelled() {
            Some(ScanState::Paused)
        } else {
            None
        }
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub state: ScanState,
    pub checkpoint: ScanCheckpoint,
    pub flushes: Vec<FlushReport>,
    /// Set once the queue drained and refinement ran.
    pub refinement: Option<RefinementReport>,
    pub cleanup: Option<CleanupReport>,
}

type ItemResult = std::result::Result<Vec<FaceEmbedding>, String>;

struct Run {
    cp: ScanCheckpoint,
    started: Instant,
    done_this_run: usize,
    since_checkpoint: usize,
    last_checkpoint: Instant,
    staged_since_flush: usize,
    last_flush: Instant,
    flushes: Vec<FlushReport>,
    pressure: Pressure,
}

impl Run {
    fn new(cp: ScanCheckpoint) -> Self {
        let now = Instant::now();
        Self {
            cp,
            started: now,
            done_this_run: 0,
            since_checkpoint: 0,
            last_checkpoint: now,
            staged_since_flush: 0,
            last_flush: now,
            flushes: Vec::new(),
            pressure: Pressure::Normal,
        }
    }

    fn progress(&self) -> ScanProgress {
        ScanProgress::from_checkpoint(&self.cp, self.done_this_run, self.started.elapsed(), self.pressure)
    }

    fn outcome(&mut self, refinement: Option<RefinementReport>, cleanup: Option<CleanupReport>) -> ScanOutcome {
        ScanOutcome {
            state: self.cp.state,
            checkpoint: self.cp.clone(),
            flushes: std::mem::take(&mut self.flushes),
            refinement,
            cleanup,
        }
    }
}

/// Drives photos from a catalog through face extraction into the
/// clustering engine.
pub struct Orchestrator {
    engine: Arc<Engine>,
    catalog: Arc<dyn PhotoCatalog>,
    extractor: Arc<dyn FaceExtractor>,
    monitor: Arc<dyn ResourceMonitor>,
    queue: WorkQueue,
    planner: BatchPlanner,
    cfg: ScanConfig,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<Engine>,
        catalog: Arc<dyn PhotoCatalog>,
        extractor: Arc<dyn FaceExtractor>,
        monitor: Arc<dyn ResourceMonitor>,
        cfg: ScanConfig,
    ) -> Self {
        let cfg = cfg.with_defaults();
        let queue = WorkQueue::new(engine.store().kv().clone());
        Self {
            engine,
            catalog,
            extractor,
            monitor,
            queue,
            planner: BatchPlanner::new(cfg.clone()),
            cfg,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn config(&self) -> &ScanConfig {
        &self.cfg
    }

    /// The last persisted checkpoint.
    pub fn checkpoint(&self) -> Result<Option<ScanCheckpoint>> {
        ScanCheckpoint::load(self.engine.store().kv().as_ref())
    }

    /// Run until the queue drains, the run is paused or cancelled, or an
    /// error stops it. Errors come back as [`ScanError::Failed`] carrying
    /// the checkpoint the run was left at.
    pub async fn run(&self, params: ScanParams, ctl: &RunControl) -> Result<ScanOutcome> {
        let mut run = Run::new(self.prepare(params)?);
        match self.drive(&mut run, ctl).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                run.cp.state = ScanState::Failed;
                if let Err(pe) = self.persist(&mut run.cp) {
                    warn!(run = %run.cp.run_id, error = %pe, "scan: failed to save checkpoint");
                }
                ctl.progress.send_replace(run.progress());
                error!(
                    run = %run.cp.run_id,
                    processed = run.cp.processed,
                    failed = run.cp.failed,
                    error = %e,
                    "scan: run failed"
                );
                Err(ScanError::Failed {
                    reason: e.to_string(),
                    checkpoint: Box::new(run.cp),
                })
            }
        }
    }

    /// Pick up a resumable checkpoint or start a fresh one.
    fn prepare(&self, params: ScanParams) -> Result<ScanCheckpoint> {
        let now = Utc::now();
        let previous = self.checkpoint()?;
        if params.resume {
            match &previous {
                Some(cp) if cp.state.is_resumable() => {
                    info!(run = %cp.run_id, state = %cp.state, processed = cp.processed, "scan: resuming run");
                    let mut cp = cp.clone();
                    cp.params.resume = true;
                    return Ok(cp);
                }
                _ => debug!("scan: nothing to resume, starting a new run"),
            }
        }
        let mut cp = ScanCheckpoint::new(uuid::Uuid::new_v4().to_string(), now);
        cp.params = ScanParams {
            resume: false,
            ..params
        };
        cp.last_enumerated = previous.and_then(|p| p.last_enumerated);
        Ok(cp)
    }

    async fn drive(&self, run: &mut Run, ctl: &RunControl) -> Result<ScanOutcome> {
        self.enumerate(run).await?;
        run.cp.state = ScanState::Scanning;
        self.persist(&mut run.cp)?;
        ctl.progress.send_replace(run.progress());

        loop {
            if let Some(state) = ctl.stopping() {
                return self.halt(run, ctl, state).await;
            }
            let plan = self.plan(run)?;
            let now = Utc::now();
            let items = self.queue.due(now, plan.batch_size)?;
            if items.is_empty() {
                let Some(at) = self.queue.next_retry(now)? else {
                    break;
                };
                self.maybe_flush(run).await?;
                let wait = (at - now).to_std().unwrap_or_default();
                debug!(retry_at = %at, "scan: waiting for retries");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = ctl.cancel.cancelled() => {}
                    _ = ctl.pause.cancelled() => {}
                }
                continue;
            }

            let results = self.process_batch(items, plan.parallelism).await;
            self.commit_batch(run, results)?;
            ctl.progress.send_replace(run.progress());
            self.maybe_flush(run).await?;
            tokio::task::yield_now().await;
        }

        self.finish(run, ctl).await
    }

    /// Enqueue catalog photos newer than the last enumeration, or all of
    /// them on a forced rescan.
    async fn enumerate(&self, run: &mut Run) -> Result<()> {
        let resumed = run.cp.params.resume;
        let force = run.cp.params.force_rescan && !resumed;
        let since = if force { None } else { run.cp.last_enumerated };
        let at = Utc::now();
        let photos = self.catalog.enumerate(since).await?;
        let enq = self.queue.enqueue(&photos, force)?;

        let counts = self.queue.counts()?;
        run.cp.total = counts.total();
        run.cp.processed = counts.done;
        run.cp.failed = counts.failed;
        run.cp.found = counts.faces;
        run.cp.skipped = if resumed { run.cp.skipped + enq.skipped } else { enq.skipped };
        run.cp.last_enumerated = Some(at);
        info!(
            run = %run.cp.run_id,
            resumed,
            force,
            enumerated = photos.len(),
            queued = enq.queued,
            skipped = enq.skipped,
            pending = counts.pending,
            "scan: catalog enumerated"
        );
        Ok(())
    }

    fn plan(&self, run: &mut Run) -> Result<BatchPlan> {
        let mut plan = self.planner.plan(&self.monitor.sample());
        if plan.pressure == Pressure::Critical {
            warn!("scan: critical resource pressure, reclaiming");
            self.monitor.reclaim();
            plan = self.planner.plan(&self.monitor.sample());
            if plan.pressure == Pressure::Critical {
                return Err(ScanError::ResourceExhausted(
                    "memory or battery still critical after reclaim".into(),
                ));
            }
        }
        if plan.pressure != run.pressure {
            info!(
                from = %run.pressure,
                to = %plan.pressure,
                batch = plan.batch_size,
                workers = plan.parallelism,
                "scan: resource pressure changed"
            );
            run.pressure = plan.pressure;
        }
        Ok(plan)
    }

    /// Extract every item with at most `parallelism` in flight. Results
    /// come back sorted by photo id.
    async fn process_batch(&self, items: Vec<WorkItem>, parallelism: usize) -> Vec<(WorkItem, ItemResult)> {
        let mut results: Vec<(WorkItem, ItemResult)> = futures::stream::iter(items)
            .map(|item| async move {
                let res = self.process_item(&item).await;
                (item, res)
            })
            .buffer_unordered(parallelism.max(1))
            .collect()
            .await;
        results.sort_by(|a, b| a.0.photo_id.cmp(&b.0.photo_id));
        results
    }

    async fn process_item(&self, item: &WorkItem) -> ItemResult {
        let photo = PhotoRef {
            id: item.photo_id.clone(),
            modified: item.modified,
        };
        let work = async {
            let data = self.catalog.load(&photo).await.map_err(|e| e.to_string())?;
            let extractor = self.extractor.clone();
            tokio::task::spawn_blocking(move || extractor.extract(&photo, &data))
                .await
                .map_err(|e| format!("extraction task: {e}"))?
                .map_err(|e| e.to_string())
        };
        match tokio::time::timeout(self.cfg.item_timeout(), work).await {
            Ok(res) => res,
            Err(_) => Err(format!("timed out after {} ms", self.cfg.item_timeout_ms)),
        }
    }

    /// Stage faces and item states of one batch in a single commit,
    /// together with the checkpoint when one is due.
    fn commit_batch(&self, run: &mut Run, results: Vec<(WorkItem, ItemResult)>) -> Result<()> {
        let now = Utc::now();
        let mut cp = run.cp.clone();
        let mut staged = 0;
        let mut done = 0;
        let settled = results.len();

        let mut txn = self.engine.begin();
        for (item, res) in results {
            cp.last_item = Some(item.photo_id.clone());
            match res {
                Ok(faces) => {
                    let photo = item.photo_id.clone();
                    staged += self.engine.stage_embeddings(&mut txn, &photo, &faces, now)?;
                    self.queue.complete(&mut txn, item, faces.len())?;
                    cp.processed += 1;
                    cp.found += faces.len();
                    done += 1;
                    debug!(photo = %photo, faces = faces.len(), "scan: photo done");
                }
                Err(reason) => {
                    let photo = item.photo_id.clone();
                    let attempt = item.attempts + 1;
                    match self.queue.fail(&mut txn, item, &reason, &self.cfg, now)? {
                        Failure::Retry(at) => {
                            debug!(photo = %photo, attempt, error = %reason, retry_at = %at, "scan: photo failed, will retry");
                        }
                        Failure::Permanent => {
                            warn!(photo = %photo, attempts = attempt, error = %reason, "scan: photo failed permanently");
                            cp.failed += 1;
                        }
                    }
                }
            }
        }

        let checkpoint_due = run.since_checkpoint + settled >= self.cfg.checkpoint_items
            || run.last_checkpoint.elapsed() >= self.cfg.checkpoint_interval();
        cp.updated_at = now;
        if checkpoint_due {
            cp.stage(&mut txn)?;
        }
        self.engine.commit(txn)?;

        run.cp = cp;
        run.done_this_run += done;
        run.staged_since_flush += staged;
        if checkpoint_due {
            run.since_checkpoint = 0;
            run.last_checkpoint = Instant::now();
            debug!(run = %run.cp.run_id, processed = run.cp.processed, "scan: checkpoint saved");
        } else {
            run.since_checkpoint += settled;
        }
        Ok(())
    }

    async fn maybe_flush(&self, run: &mut Run) -> Result<()> {
        let staging = &self.engine.config().staging;
        if run.staged_since_flush == 0 {
            return Ok(());
        }
        if run.staged_since_flush < staging.flush_items && run.last_flush.elapsed() < staging.flush_interval() {
            return Ok(());
        }
        self.flush(run).await
    }

    async fn flush(&self, run: &mut Run) -> Result<()> {
        let report = self.blocking(|e| e.flush()).await?;
        run.staged_since_flush = 0;
        run.last_flush = Instant::now();
        if report.staged > 0 {
            run.flushes.push(report);
        }
        Ok(())
    }

    /// Leave the run paused or idle with everything staged so far flushed.
    async fn halt(&self, run: &mut Run, ctl: &RunControl, state: ScanState) -> Result<ScanOutcome> {
        if run.staged_since_flush > 0 {
            self.flush(run).await?;
        }
        run.cp.state = state;
        self.persist(&mut run.cp)?;
        ctl.progress.send_replace(run.progress());
        info!(run = %run.cp.run_id, state = %state, processed = run.cp.processed, remaining = run.cp.remaining(), "scan: run stopped");
        Ok(run.outcome(None, None))
    }

    /// Drain: flush, refine, recompute aggregates, purge history, save
    /// the anchor index.
    async fn finish(&self, run: &mut Run, ctl: &RunControl) -> Result<ScanOutcome> {
        self.flush(run).await?;
        let refinement = self.blocking(|e| Ok(e.refine())).await?;
        let recomputed = self.blocking(|e| e.recompute_aggregates()).await?;
        let cleanup = self.blocking(|e| e.cleanup_history()).await?;
        if let Err(e) = self.blocking(|e| e.save_index()).await {
            warn!(error = %e, "scan: failed to save anchor index");
        }

        let counts = self.queue.counts()?;
        run.cp.total = counts.total();
        run.cp.processed = counts.done;
        run.cp.failed = counts.failed;
        run.cp.found = counts.faces;
        run.cp.state = ScanState::Complete;
        self.persist(&mut run.cp)?;
        ctl.progress.send_replace(run.progress());
        info!(
            run = %run.cp.run_id,
            processed = run.cp.processed,
            found = run.cp.found,
            failed = run.cp.failed,
            skipped = run.cp.skipped,
            flushes = run.flushes.len(),
            merges = refinement.merges.len(),
            recomputed,
            elapsed_ms = run.started.elapsed().as_millis() as u64,
            "scan: run complete"
        );
        Ok(run.outcome(Some(refinement), Some(cleanup)))
    }

    fn persist(&self, cp: &mut ScanCheckpoint) -> Result<()> {
        cp.updated_at = Utc::now();
        let mut txn = self.engine.begin();
        cp.stage(&mut txn)?;
        self.engine.commit(txn)?;
        debug!(run = %cp.run_id, state = %cp.state, processed = cp.processed, "scan: checkpoint saved");
        Ok(())
    }

    /// Run an engine call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> facegroup_cluster::Result<T> + Send + 'static,
    {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| ScanError::Join(e.to_string()))?
            .map_err(ScanError::from)
    }
}
