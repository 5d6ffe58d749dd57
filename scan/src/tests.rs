use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use facegroup_cluster::{Engine, EngineConfig};
use facegroup_faceprint::{BoundingBox, FaceEmbedding, FaceprintError, PoseAngles, QualityScores};
use facegroup_kv::MemoryStore;
use facegroup_vecstore::normalized;

use crate::{
    FaceExtractor, ItemState, LocalScheduler, Orchestrator, PhotoCatalog, PhotoRef, ResourceMonitor, ResourceSample,
    Result, RunControl, ScanConfig, ScanError, ScanParams, ScanScheduler, ScanState,
};

const DIM: usize = 64;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn vector(parts: &[(usize, f32)]) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for &(i, w) in parts {
        v[i] += w;
    }
    normalized(&v).unwrap()
}

fn embedding(base: &[(usize, f32)], axis: usize) -> FaceEmbedding {
    let mut parts = base.to_vec();
    parts.push((axis, 0.2));
    FaceEmbedding {
        bbox: BoundingBox::full(),
        confidence: 0.9,
        pose: PoseAngles::default(),
        quality: QualityScores::uniform(0.8),
        vector: vector(&parts),
        fallback: false,
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

/// In-memory catalog; the photo bytes are the photo id.
#[derive(Default)]
struct FakeCatalog {
    photos: Mutex<Vec<PhotoRef>>,
}

impl FakeCatalog {
    fn add(&self, id: &str, modified: DateTime<Utc>) {
        self.photos.lock().push(PhotoRef {
            id: id.into(),
            modified,
        });
    }

    fn touch(&self, id: &str, modified: DateTime<Utc>) {
        for p in self.photos.lock().iter_mut().filter(|p| p.id == id) {
            p.modified = modified;
        }
    }
}

#[async_trait]
impl PhotoCatalog for FakeCatalog {
    async fn enumerate(&self, since: Option<DateTime<Utc>>) -> Result<Vec<PhotoRef>> {
        Ok(self
            .photos
            .lock()
            .iter()
            .filter(|p| since.is_none_or(|s| p.modified > s))
            .cloned()
            .collect())
    }

    async fn load(&self, photo: &PhotoRef) -> Result<Vec<u8>> {
        Ok(photo.id.as_bytes().to_vec())
    }
}

/// Returns fixed faces per photo, with scripted failures and stalls.
#[derive(Default)]
struct FakeExtractor {
    faces: Mutex<HashMap<String, Vec<FaceEmbedding>>>,
    /// Photo id to the number of leading attempts that fail.
    failing: HashMap<String, usize>,
    slow: Option<(String, Duration)>,
    /// Cancel the token once this many photos were extracted.
    stop_after: Option<(usize, CancellationToken)>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl FakeExtractor {
    fn calls(&self, photo: &str) -> usize {
        self.calls.lock().get(photo).copied().unwrap_or(0)
    }
}

impl FaceExtractor for FakeExtractor {
    fn extract(&self, photo: &PhotoRef, data: &[u8]) -> std::result::Result<Vec<FaceEmbedding>, FaceprintError> {
        assert_eq!(data, photo.id.as_bytes());
        let attempt = {
            let mut calls = self.calls.lock();
            let n = calls.entry(photo.id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, token)) = &self.stop_after {
            if total >= *n {
                token.cancel();
            }
        }
        if let Some((id, d)) = &self.slow {
            if id == &photo.id {
                std::thread::sleep(*d);
            }
        }
        if self.failing.get(&photo.id).is_some_and(|n| attempt <= *n) {
            return Err(FaceprintError::Decode(format!("corrupt {}", photo.id)));
        }
        Ok(self.faces.lock().get(&photo.id).cloned().unwrap_or_default())
    }
}

struct FixedMonitor {
    sample: ResourceSample,
    reclaims: AtomicUsize,
}

impl FixedMonitor {
    fn healthy() -> Self {
        Self::with_available(80)
    }

    fn with_available(available: u64) -> Self {
        Self {
            sample: ResourceSample {
                memory_total: 100,
                memory_available: available,
                battery: None,
            },
            reclaims: AtomicUsize::new(0),
        }
    }
}

impl ResourceMonitor for FixedMonitor {
    fn sample(&self) -> ResourceSample {
        self.sample
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

const BASE_A: &[(usize, f32)] = &[(0, 1.0)];
const BASE_B: &[(usize, f32)] = &[(1, 1.0)];

/// Ten photos with one face each: two groups of three and four strangers.
fn library() -> (FakeCatalog, FakeExtractor) {
    let catalog = FakeCatalog::default();
    let mut extractor = FakeExtractor::default();
    for i in 0..3 {
        let a = format!("a{i}.jpg");
        let b = format!("b{i}.jpg");
        catalog.add(&a, at(1_700_000_000));
        catalog.add(&b, at(1_700_000_000));
        extractor.faces.get_mut().insert(a, vec![embedding(BASE_A, 10 + i)]);
        extractor.faces.get_mut().insert(b, vec![embedding(BASE_B, 20 + i)]);
    }
    for i in 0..4 {
        let s = format!("s{i}.jpg");
        catalog.add(&s, at(1_700_000_000));
        extractor.faces.get_mut().insert(s, vec![embedding(&[(2 + i, 1.0)], 30 + i)]);
    }
    (catalog, extractor)
}

fn scan_config() -> ScanConfig {
    ScanConfig {
        batch_size: 4,
        parallelism: 2,
        retry_backoff_ms: 10,
        retry_backoff_max_ms: 40,
        ..ScanConfig::default()
    }
}

fn orchestrator(
    catalog: Arc<FakeCatalog>,
    extractor: Arc<FakeExtractor>,
    monitor: Arc<FixedMonitor>,
    cfg: ScanConfig,
) -> (MemoryStore, Arc<Engine>, Orchestrator) {
    let kv = MemoryStore::new();
    let engine = Arc::new(Engine::open(Arc::new(kv.clone()), EngineConfig::with_dim(DIM), None).unwrap());
    let orch = Orchestrator::new(engine.clone(), catalog, extractor, monitor, cfg);
    (kv, engine, orch)
}

fn sizes(e: &Engine) -> Vec<usize> {
    e.clusters().unwrap().iter().map(|c| c.face_count).collect()
}

fn partition(e: &Engine) -> BTreeSet<BTreeSet<String>> {
    let mut by_cluster: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for f in e.store().faces().unwrap() {
        if let Some(c) = f.cluster_id {
            by_cluster.entry(c).or_default().insert(f.id);
        }
    }
    by_cluster.into_values().collect()
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scan_clusters_library() {
    let (catalog, extractor) = library();
    let (_, engine, orch) = orchestrator(
        Arc::new(catalog),
        Arc::new(extractor),
        Arc::new(FixedMonitor::healthy()),
        scan_config(),
    );
    let (ctl, progress) = RunControl::new();
    let out = orch.run(ScanParams::default(), &ctl).await.unwrap();

    assert_eq!(out.state, ScanState::Complete);
    assert_eq!(out.checkpoint.total, 10);
    assert_eq!(out.checkpoint.processed, 10);
    assert_eq!(out.checkpoint.found, 10);
    assert_eq!(out.checkpoint.failed, 0);
    assert_eq!(out.flushes.iter().map(|f| f.staged).sum::<usize>(), 10);
    let refinement = out.refinement.unwrap();
    assert!(refinement.is_ok());
    assert!(refinement.merges.is_empty());
    assert!(out.cleanup.is_some());

    assert_eq!(sizes(&engine), vec![3, 3, 1, 1, 1, 1]);
    assert!(engine.split_candidates().unwrap().is_empty());

    let p = progress.borrow().clone();
    assert_eq!(p.state, ScanState::Complete);
    assert_eq!(p.processed, 10);
    assert_eq!(p.fraction(), 1.0);
    assert_eq!(orch.checkpoint().unwrap().unwrap().state, ScanState::Complete);
}

#[tokio::test]
async fn test_rescan_only_picks_up_new_photos() {
    let (catalog, extractor) = library();
    let catalog = Arc::new(catalog);
    let extractor = Arc::new(extractor);
    let (_, engine, orch) = orchestrator(
        catalog.clone(),
        extractor.clone(),
        Arc::new(FixedMonitor::healthy()),
        scan_config(),
    );
    let (ctl, _) = RunControl::new();
    let first = orch.run(ScanParams::default(), &ctl).await.unwrap();
    assert_eq!(extractor.total.load(Ordering::SeqCst), 10);

    catalog.add("late.jpg", Utc::now() + chrono::Duration::seconds(5));
    let second = orch.run(ScanParams::default(), &ctl).await.unwrap();
    assert_ne!(second.checkpoint.run_id, first.checkpoint.run_id);
    assert_eq!(second.checkpoint.total, 11);
    assert_eq!(second.checkpoint.processed, 11);
    assert_eq!(extractor.total.load(Ordering::SeqCst), 11);
    // The new photo has no faces.
    assert_eq!(second.checkpoint.found, 10);
    assert_eq!(sizes(&engine), vec![3, 3, 1, 1, 1, 1]);
}

#[tokio::test]
async fn test_edited_photo_replaces_its_faces() {
    let (catalog, extractor) = library();
    let catalog = Arc::new(catalog);
    let extractor = Arc::new(extractor);
    let (_, engine, orch) = orchestrator(
        catalog.clone(),
        extractor.clone(),
        Arc::new(FixedMonitor::healthy()),
        scan_config(),
    );
    let (ctl, _) = RunControl::new();
    orch.run(ScanParams::default(), &ctl).await.unwrap();
    let b = engine.face("b0.jpg#0").unwrap().unwrap().cluster_id;
    assert!(b.is_some());

    // a0.jpg now shows the person of the b photos.
    extractor
        .faces
        .lock()
        .insert("a0.jpg".into(), vec![embedding(BASE_B, 23)]);
    catalog.touch("a0.jpg", Utc::now() + chrono::Duration::seconds(5));
    let out = orch.run(ScanParams::default(), &ctl).await.unwrap();

    assert_eq!(extractor.calls("a0.jpg"), 2);
    assert_eq!(out.checkpoint.processed, 10);
    assert_eq!(out.checkpoint.found, 10);
    assert_eq!(engine.face("a0.jpg#0").unwrap().unwrap().cluster_id, b);
    assert_eq!(sizes(&engine), vec![4, 2, 1, 1, 1, 1]);
    assert_eq!(
        engine.anchor_index().len(),
        engine.store().active_anchors().unwrap().len()
    );
}

#[tokio::test]
async fn test_forced_rescan_does_not_duplicate_faces() {
    let (catalog, extractor) = library();
    let extractor = Arc::new(extractor);
    let (_, engine, orch) = orchestrator(
        Arc::new(catalog),
        extractor.clone(),
        Arc::new(FixedMonitor::healthy()),
        scan_config(),
    );
    let (ctl, _) = RunControl::new();
    orch.run(ScanParams::default(), &ctl).await.unwrap();
    let before = partition(&engine);

    let forced = ScanParams {
        force_rescan: true,
        resume: false,
    };
    let out = orch.run(forced, &ctl).await.unwrap();
    assert_eq!(extractor.calls("a0.jpg"), 2);
    assert!(out.flushes.is_empty());
    assert_eq!(out.checkpoint.processed, 10);
    assert!(out.checkpoint.params.force_rescan);
    assert_eq!(partition(&engine), before);
}

#[tokio::test]
async fn test_pause_and_resume_matches_uninterrupted_run() {
    let (catalog, extractor) = library();
    let (_, reference, orch) = orchestrator(
        Arc::new(catalog),
        Arc::new(extractor),
        Arc::new(FixedMonitor::healthy()),
        scan_config(),
    );
    let (ctl, _) = RunControl::new();
    orch.run(ScanParams::default(), &ctl).await.unwrap();

    let (catalog, mut extractor) = library();
    let (ctl, _) = RunControl::new();
    extractor.stop_after = Some((3, ctl.pause.clone()));
    let extractor = Arc::new(extractor);
    let cfg = ScanConfig {
        parallelism: 1,
        ..scan_config()
    };
    let (kv, engine, orch) = orchestrator(
        Arc::new(catalog),
        extractor.clone(),
        Arc::new(FixedMonitor::healthy()),
        cfg,
    );

    let paused = orch.run(ScanParams::default(), &ctl).await.unwrap();
    assert_eq!(paused.state, ScanState::Paused);
    assert_eq!(paused.checkpoint.processed, 4);
    assert_eq!(paused.checkpoint.remaining(), 6);
    assert!(paused.refinement.is_none());
    let saved = crate::ScanCheckpoint::load(&kv).unwrap().unwrap();
    assert_eq!(saved.state, ScanState::Paused);
    assert_eq!(saved.processed, 4);

    let (ctl, _) = RunControl::new();
    let resume = ScanParams {
        force_rescan: false,
        resume: true,
    };
    let done = orch.run(resume, &ctl).await.unwrap();
    assert_eq!(done.state, ScanState::Complete);
    assert_eq!(done.checkpoint.run_id, paused.checkpoint.run_id);
    assert_eq!(done.checkpoint.processed, 10);
    // Every photo extracted exactly once across both runs.
    assert_eq!(extractor.total.load(Ordering::SeqCst), 10);
    assert_eq!(partition(&engine), partition(&reference));
    assert_eq!(sizes(&engine), vec![3, 3, 1, 1, 1, 1]);
}

#[tokio::test]
async fn test_cancel_leaves_queue_pending() {
    let (catalog, mut extractor) = library();
    let (ctl, _) = RunControl::new();
    extractor.stop_after = Some((1, ctl.cancel.clone()));
    let (_, _, orch) = orchestrator(
        Arc::new(catalog),
        Arc::new(extractor),
        Arc::new(FixedMonitor::healthy()),
        scan_config(),
    );
    let out = orch.run(ScanParams::default(), &ctl).await.unwrap();
    assert_eq!(out.state, ScanState::Idle);
    assert_eq!(out.checkpoint.processed, 4);
    assert_eq!(orch.queue().counts().unwrap().pending, 6);
}

#[tokio::test]
async fn test_failed_photo_retries_then_gives_up() {
    let (catalog, mut extractor) = library();
    extractor.failing.insert("a1.jpg".into(), 1);
    extractor.failing.insert("s0.jpg".into(), usize::MAX);
    let extractor = Arc::new(extractor);
    let cfg = ScanConfig {
        max_attempts: 3,
        ..scan_config()
    };
    let (_, engine, orch) = orchestrator(
        Arc::new(catalog),
        extractor.clone(),
        Arc::new(FixedMonitor::healthy()),
        cfg,
    );
    let (ctl, _) = RunControl::new();
    let out = orch.run(ScanParams::default(), &ctl).await.unwrap();

    assert_eq!(out.state, ScanState::Complete);
    assert_eq!(out.checkpoint.processed, 9);
    assert_eq!(out.checkpoint.failed, 1);
    assert_eq!(extractor.calls("a1.jpg"), 2);
    assert_eq!(extractor.calls("s0.jpg"), 3);

    let failures = orch.queue().failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "s0.jpg");
    assert!(failures[0].1.as_deref().unwrap().contains("corrupt s0.jpg"));
    assert_eq!(orch.queue().get("a1.jpg").unwrap().unwrap().state, ItemState::Done);
    assert_eq!(sizes(&engine), vec![3, 3, 1, 1, 1]);
}

#[tokio::test]
async fn test_slow_photo_times_out() {
    let (catalog, mut extractor) = library();
    extractor.slow = Some(("b2.jpg".into(), Duration::from_millis(400)));
    let cfg = ScanConfig {
        item_timeout_ms: 50,
        max_attempts: 1,
        ..scan_config()
    };
    let (_, _, orch) = orchestrator(
        Arc::new(catalog),
        Arc::new(extractor),
        Arc::new(FixedMonitor::healthy()),
        cfg,
    );
    let (ctl, _) = RunControl::new();
    let out = orch.run(ScanParams::default(), &ctl).await.unwrap();
    assert_eq!(out.checkpoint.failed, 1);
    assert_eq!(out.checkpoint.processed, 9);
    let item = orch.queue().get("b2.jpg").unwrap().unwrap();
    assert_eq!(item.state, ItemState::Failed);
    assert!(item.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_critical_pressure_fails_with_checkpoint() {
    let (catalog, extractor) = library();
    let monitor = Arc::new(FixedMonitor::with_available(2));
    let extractor = Arc::new(extractor);
    let (kv, _, orch) = orchestrator(Arc::new(catalog), extractor.clone(), monitor.clone(), scan_config());
    let (ctl, progress) = RunControl::new();

    let err = orch.run(ScanParams::default(), &ctl).await.unwrap_err();
    let cp = err.checkpoint().unwrap();
    assert_eq!(cp.state, ScanState::Failed);
    assert_eq!(cp.total, 10);
    assert_eq!(cp.processed, 0);
    assert!(matches!(err, ScanError::Failed { ref reason, .. } if reason.contains("resources exhausted")));
    assert_eq!(monitor.reclaims.load(Ordering::SeqCst), 1);
    assert_eq!(extractor.total.load(Ordering::SeqCst), 0);
    assert_eq!(progress.borrow().state, ScanState::Failed);
    assert_eq!(crate::ScanCheckpoint::load(&kv).unwrap().unwrap().state, ScanState::Failed);
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scheduler_runs_one_scan_at_a_time() {
    let (catalog, extractor) = library();
    let (_, engine, orch) = orchestrator(
        Arc::new(catalog),
        Arc::new(extractor),
        Arc::new(FixedMonitor::healthy()),
        scan_config(),
    );
    let sched = LocalScheduler::new(Arc::new(orch));
    let progress = sched.progress();

    let first = sched.start(ScanParams::default());
    let first_id = first.id();
    let second = sched.start(ScanParams::default());
    assert_eq!(first.id(), second.id());
    assert!(sched.is_running());

    let out = second.wait().await.unwrap();
    assert_eq!(out.state, ScanState::Complete);
    assert_eq!(first.wait().await.unwrap().checkpoint.run_id, out.checkpoint.run_id);
    assert!(!sched.is_running());
    assert_eq!(progress.borrow().state, ScanState::Complete);
    assert_eq!(progress.borrow().processed, 10);
    assert_eq!(sizes(&engine), vec![3, 3, 1, 1, 1, 1]);

    let next = sched.start(ScanParams::default());
    assert_eq!(next.id(), first_id + 1);
    next.wait().await.unwrap();
    assert!(sched.recover().unwrap().is_none());
}

#[tokio::test]
async fn test_scheduler_reports_failure() {
    let (catalog, extractor) = library();
    let (_, _, orch) = orchestrator(
        Arc::new(catalog),
        Arc::new(extractor),
        Arc::new(FixedMonitor::with_available(1)),
        scan_config(),
    );
    let sched = LocalScheduler::new(Arc::new(orch));
    let err = sched.start(ScanParams::default()).wait().await.unwrap_err();
    assert_eq!(err.checkpoint().unwrap().state, ScanState::Failed);
    assert!(!sched.is_running());
}
