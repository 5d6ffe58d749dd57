//! Background scheduling of scan runs, one at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::checkpoint::{ScanCheckpoint, ScanParams, ScanState};
use crate::error::{Result, ScanError};
use crate::orchestrator::{Orchestrator, RunControl, ScanOutcome};
use crate::progress::ScanProgress;

/// Why a scheduled run ended without an outcome.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub reason: String,
    pub checkpoint: Option<ScanCheckpoint>,
}

impl RunFailure {
    fn into_error(self) -> ScanError {
        match self.checkpoint {
            Some(cp) => ScanError::Failed {
                reason: self.reason,
                checkpoint: Box::new(cp),
            },
            None => ScanError::Join(self.reason),
        }
    }
}

impl From<ScanError> for RunFailure {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Failed { reason, checkpoint } => RunFailure {
                reason,
                checkpoint: Some(*checkpoint),
            },
            other => RunFailure {
                reason: other.to_string(),
                checkpoint: None,
            },
        }
    }
}

type RunResult = std::result::Result<ScanOutcome, RunFailure>;

/// A started run. Clones observe the same run.
#[derive(Clone)]
pub struct RunHandle {
    id: u64,
    result: watch::Receiver<Option<RunResult>>,
}

impl RunHandle {
    /// Scheduler-local run number.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Wait for the run to end.
    pub async fn wait(mut self) -> Result<ScanOutcome> {
        loop {
            if let Some(res) = self.result.borrow_and_update().clone() {
                return res.map_err(RunFailure::into_error);
            }
            if self.result.changed().await.is_err() {
                let last = self.result.borrow().clone();
                return match last {
                    Some(res) => res.map_err(RunFailure::into_error),
                    None => Err(ScanError::Join("scan task ended without a result".into())),
                };
            }
        }
    }
}

pub trait ScanScheduler: Send + Sync {
    /// Start a run, or return the handle of the one already active.
    fn start(&self, params: ScanParams) -> RunHandle;

    /// Ask the active run to stop resumably. False when nothing runs.
    fn pause(&self) -> bool;

    /// Ask the active run to stop and leave the queue as is.
    fn cancel(&self) -> bool;

    /// Continue the last paused, failed or interrupted run.
    fn resume(&self) -> RunHandle {
        self.start(ScanParams {
            force_rescan: false,
            resume: true,
        })
    }

    fn progress(&self) -> watch::Receiver<ScanProgress>;

    fn is_running(&self) -> bool;
}

struct Active {
    handle: RunHandle,
    cancel: CancellationToken,
    pause: CancellationToken,
}

struct Inner {
    orchestrator: Arc<Orchestrator>,
    active: Mutex<Option<Active>>,
    progress: Arc<watch::Sender<ScanProgress>>,
    next_id: AtomicU64,
}

/// Runs scans on the current tokio runtime.
#[derive(Clone)]
pub struct LocalScheduler {
    inner: Arc<Inner>,
}

impl LocalScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let (tx, _) = watch::channel(ScanProgress::default());
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                active: Mutex::new(None),
                progress: Arc::new(tx),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    /// Resume a run that was still scanning when the process stopped.
    /// Paused and failed runs wait for an explicit [`ScanScheduler::resume`].
    pub fn recover(&self) -> Result<Option<RunHandle>> {
        match self.inner.orchestrator.checkpoint()? {
            Some(cp) if cp.state == ScanState::Scanning => {
                info!(run = %cp.run_id, processed = cp.processed, "scan: recovering interrupted run");
                Ok(Some(self.resume()))
            }
            _ => Ok(None),
        }
    }
}

impl ScanScheduler for LocalScheduler {
    fn start(&self, params: ScanParams) -> RunHandle {
        let mut active = self.inner.active.lock();
        if let Some(a) = active.as_ref().filter(|a| !a.handle.is_finished()) {
            debug!(id = a.handle.id, "scan: run already active");
            return a.handle.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(None);
        let ctl = RunControl {
            cancel: CancellationToken::new(),
            pause: CancellationToken::new(),
            progress: self.inner.progress.clone(),
        };
        let handle = RunHandle { id, result: rx };
        *active = Some(Active {
            handle: handle.clone(),
            cancel: ctl.cancel.clone(),
            pause: ctl.pause.clone(),
        });
        drop(active);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let res = inner.orchestrator.run(params, &ctl).await.map_err(RunFailure::from);
            tx.send_replace(Some(res));
            let mut active = inner.active.lock();
            if active.as_ref().is_some_and(|a| a.handle.id == id) {
                *active = None;
            }
        });
        debug!(id, force = params.force_rescan, resume = params.resume, "scan: run scheduled");
        handle
    }

    fn pause(&self) -> bool {
        match self.inner.active.lock().as_ref() {
            Some(a) => {
                a.pause.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel(&self) -> bool {
        match self.inner.active.lock().as_ref() {
            Some(a) => {
                a.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn progress(&self) -> watch::Receiver<ScanProgress> {
        self.inner.progress.subscribe()
    }

    fn is_running(&self) -> bool {
        self.inner
            .active
            .lock()
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished())
    }
}
