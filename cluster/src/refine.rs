//! Post-scan maintenance.
//!
//! Steps run in a fixed order, each in its own transaction. A failing step
//! is logged and reported; the remaining steps still run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use facegroup_vecstore::dot;

use crate::engine::{Engine, IndexOp};
use crate::error::Result;
use crate::history;
use crate::keys::member_key;
use crate::store::Txn;
use crate::types::{Anchor, Cluster, Confidence, HistoryOp, StagedFace, StagedStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefineStep {
    AutoMerge,
    ConflictRecheck,
    SplitDetection,
    IndexResync,
    OrphanRepair,
    AggregateRecompute,
}

impl RefineStep {
    pub const ALL: [RefineStep; 6] = [
        RefineStep::AutoMerge,
        RefineStep::ConflictRecheck,
        RefineStep::SplitDetection,
        RefineStep::IndexResync,
        RefineStep::OrphanRepair,
        RefineStep::AggregateRecompute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RefineStep::AutoMerge => "auto_merge",
            RefineStep::ConflictRecheck => "conflict_recheck",
            RefineStep::SplitDetection => "split_detection",
            RefineStep::IndexResync => "index_resync",
            RefineStep::OrphanRepair => "orphan_repair",
            RefineStep::AggregateRecompute => "aggregate_recompute",
        }
    }
}

impl fmt::Display for RefineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: RefineStep,
    /// Merges, commits, flags, fixes or rewrites, depending on the step.
    pub count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefinementReport {
    pub steps: Vec<StepReport>,
    /// History ids of the auto-merges.
    pub merges: Vec<String>,
}

impl RefinementReport {
    pub fn count(&self, step: RefineStep) -> usize {
        self.steps.iter().find(|s| s.step == step).map(|s| s.count).unwrap_or(0)
    }

    pub fn is_ok(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }

    pub fn errors(&self) -> impl Iterator<Item = (RefineStep, &str)> {
        self.steps
            .iter()
            .filter_map(|s| s.error.as_deref().map(|e| (s.step, e)))
    }
}

impl Engine {
    pub fn refine(&self) -> RefinementReport {
        self.refine_at(Utc::now())
    }

    /// Run every refinement step under the writer lock.
    pub fn refine_at(&self, now: DateTime<Utc>) -> RefinementReport {
        let _w = self.lock_writer();
        let mut report = RefinementReport::default();
        for step in RefineStep::ALL {
            let res = match step {
                RefineStep::AutoMerge => self.auto_merge(now).map(|ids| {
                    let n = ids.len();
                    report.merges = ids;
                    n
                }),
                RefineStep::ConflictRecheck => self.conflict_recheck(now),
                RefineStep::SplitDetection => self.split_detection(now),
                RefineStep::IndexResync => self.resync_index().map(|r| r.drift() + r.stale.len()),
                RefineStep::OrphanRepair => self.orphan_repair(now),
                RefineStep::AggregateRecompute => self.aggregate_recompute(now),
            };
            let entry = match res {
                Ok(count) => {
                    info!(step = %step, count, "cluster: refinement step done");
                    StepReport {
                        step,
                        count,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(step = %step, error = %e, "cluster: refinement step failed");
                    StepReport {
                        step,
                        count: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.steps.push(entry);
        }
        report
    }

    /// Refresh every active cluster's cached aggregates and statistics.
    /// Returns how many clusters changed.
    pub fn recompute_aggregates(&self) -> Result<usize> {
        let _w = self.lock_writer();
        self.aggregate_recompute(Utc::now())
    }

    // -- auto_merge --

    /// Merge cluster pairs whose mean cross-anchor similarity reaches the
    /// merge threshold, best pair first, until a pass merges nothing.
    fn auto_merge(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut merged = Vec::new();
        for _ in 0..self.cfg.refinement.max_merge_passes {
            let pairs = self.merge_candidates()?;
            let mut used: HashSet<String> = HashSet::new();
            let mut progressed = false;
            for (score, x, y) in pairs {
                if used.contains(&x) || used.contains(&y) {
                    continue;
                }
                let constraints = self.constraint_set();
                let hid = self.transact(|txn, ops| {
                    let cx = txn.require_cluster(&x)?;
                    let cy = txn.require_cluster(&y)?;
                    if let (Some(ix), Some(iy)) = (&cx.identity_id, &cy.identity_id) {
                        if ix != iy {
                            return Ok(None);
                        }
                    }
                    if constraints.clusters_conflict(txn, &x, &y)? {
                        return Ok(None);
                    }
                    let (target, source) = survivor(&cx, &cy);
                    let reversal = self.merge_in(txn, &constraints, target, source, now, ops)?;
                    let hid = history::record(
                        txn,
                        HistoryOp::AutoMerge,
                        vec![target.to_string(), source.to_string()],
                        reversal,
                        now,
                        self.cfg.retention(),
                    )?;
                    info!(survivor = target, merged = source, score, "cluster: auto-merged");
                    Ok(Some(hid))
                })?;
                if let Some(hid) = hid {
                    used.insert(x);
                    used.insert(y);
                    merged.push(hid);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(merged)
    }

    /// Cluster pairs proposed by anchor lookups and scored by mean
    /// cross-anchor similarity, best first.
    fn merge_candidates(&self) -> Result<Vec<(f32, String, String)>> {
        let threshold = self.cfg.refinement.merge_threshold;
        let mut by_cluster: BTreeMap<String, Vec<Anchor>> = BTreeMap::new();
        for a in self.store.active_anchors()? {
            by_cluster.entry(a.cluster_id.clone()).or_default().push(a);
        }

        let mut proposed: HashSet<(String, String)> = HashSet::new();
        for (cid, anchors) in &by_cluster {
            for a in anchors {
                for hit in self.index.find_matching(&a.embedding, threshold, self.cfg.staging.fanout)? {
                    if hit.cluster_id != *cid && by_cluster.contains_key(&hit.cluster_id) {
                        proposed.insert(ordered(cid, &hit.cluster_id));
                    }
                }
            }
        }

        let mut scored = Vec::new();
        for (x, y) in proposed {
            if !self.store.cluster(&x)?.is_some_and(|c| c.is_active())
                || !self.store.cluster(&y)?.is_some_and(|c| c.is_active())
            {
                continue;
            }
            let score = mean_cross(&by_cluster[&x], &by_cluster[&y]);
            if score >= threshold {
                scored.push((score, x, y));
            }
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| (&a.1, &a.2).cmp(&(&b.1, &b.2))));
        Ok(scored)
    }

    // -- conflict_recheck --

    /// Commit CONFLICT faces whose candidates now resolve to one surviving
    /// cluster; requeue those whose candidates are all gone.
    fn conflict_recheck(&self, now: DateTime<Utc>) -> Result<usize> {
        let constraints = self.constraint_set();
        self.transact(|txn, ops| {
            let mut n = 0;
            for mut s in self.store.staged()? {
                if s.status != StagedStatus::Conflict {
                    continue;
                }
                let best = match &s.best {
                    Some(c) => survivor_of(txn, &c.cluster_id)?,
                    None => None,
                };
                let runner_up = match &s.runner_up {
                    Some(c) => survivor_of(txn, &c.cluster_id)?,
                    None => None,
                };
                match (best, runner_up) {
                    (Some(b), Some(r)) if b == r => {
                        if constraints.cluster_forbids(txn, &s.face_id, &b)? {
                            continue;
                        }
                        self.move_face_in(txn, &constraints, &s.face_id, &b, Confidence::Medium, now, ops)?;
                        n += 1;
                    }
                    (None, None) => {
                        s.status = StagedStatus::Pending;
                        s.best = None;
                        s.runner_up = None;
                        txn.put_staged(s);
                        n += 1;
                    }
                    _ => {}
                }
            }
            Ok(n)
        })
    }

    // -- split_detection --

    /// Flag clusters whose similarity spread suggests two people. Returns
    /// the number of flagged clusters.
    fn split_detection(&self, now: DateTime<Utc>) -> Result<usize> {
        let cfg = &self.cfg.refinement;
        self.transact(|txn, _| {
            let mut flagged = 0;
            for mut c in self.store.clusters()?.into_iter().filter(|c| c.is_active()) {
                let suspicious = c.face_count >= cfg.min_faces_for_split
                    && self.store.stats(&c.id)?.is_some_and(|s| {
                        s.variance >= cfg.split_variance
                            || (s.bimodality >= cfg.split_bimodality && s.variance >= cfg.split_variance / 4.0)
                    });
                if suspicious {
                    flagged += 1;
                }
                if suspicious != c.needs_review {
                    c.needs_review = suspicious;
                    c.updated_at = now;
                    txn.put_cluster(c);
                }
            }
            Ok(flagged)
        })
    }

    // -- orphan_repair --

    /// Fix dangling references: identities, face clusters, member index
    /// entries, anchors and staged records. Returns the number of fixes.
    fn orphan_repair(&self, now: DateTime<Utc>) -> Result<usize> {
        self.transact(|txn, ops| {
            let mut fixes = 0;
            let clusters: HashMap<String, Cluster> =
                self.store.clusters()?.into_iter().map(|c| (c.id.clone(), c)).collect();
            let identities: HashSet<String> = self
                .store
                .identities()?
                .into_iter()
                .filter(|i| i.is_active())
                .map(|i| i.id)
                .collect();
            let mut touched = Vec::new();

            for c in clusters.values().filter(|c| c.is_active()) {
                if c.identity_id.as_ref().is_some_and(|i| !identities.contains(i)) {
                    let mut c = c.clone();
                    c.identity_id = None;
                    c.updated_at = now;
                    txn.put_cluster(c);
                    fixes += 1;
                }
            }

            let staged: HashSet<String> = self.store.staged()?.into_iter().map(|s| s.face_id).collect();
            let mut handled = HashSet::new();
            for mut f in self.store.faces()?.into_iter().filter(|f| f.is_active()) {
                match f.cluster_id.clone() {
                    Some(cid) if clusters.get(&cid).is_some_and(|c| c.is_active()) => continue,
                    Some(cid) => {
                        handled.insert(f.id.clone());
                        match follow_merges(&clusters, &cid) {
                            Some(survivor) => {
                                f.cluster_id = Some(survivor.clone());
                                touched.push(survivor);
                            }
                            None => {
                                f.cluster_id = None;
                                f.confidence = Confidence::Unassigned;
                                requeue(txn, f.id.clone(), f.embedding.clone(), now);
                            }
                        }
                        f.updated_at = now;
                        txn.put_face(f);
                        fixes += 1;
                    }
                    None if !staged.contains(&f.id) => {
                        requeue(txn, f.id.clone(), f.embedding.clone(), now);
                        fixes += 1;
                    }
                    None => {}
                }
            }

            for (cid, fid) in self.store.member_entries()? {
                if handled.contains(&fid) {
                    continue;
                }
                let live = self
                    .store
                    .face(&fid)?
                    .is_some_and(|f| f.is_active() && f.cluster_id.as_deref() == Some(cid.as_str()));
                if !live {
                    txn.delete_raw(member_key(&cid, &fid));
                    fixes += 1;
                }
            }

            for a in self.store.anchors()? {
                let cluster_ok = clusters.get(&a.cluster_id).is_some_and(|c| c.is_active());
                let face_ok = txn
                    .face(&a.id)?
                    .is_some_and(|f| f.is_active() && f.cluster_id.as_deref() == Some(a.cluster_id.as_str()));
                if !(cluster_ok && face_ok) {
                    txn.delete_anchor(&a.cluster_id, &a.id);
                    if a.active {
                        ops.push(IndexOp::Remove(a.id.clone()));
                    }
                    fixes += 1;
                }
            }

            for s in self.store.staged()? {
                if !self.store.face(&s.face_id)?.is_some_and(|f| f.is_active()) {
                    txn.delete_staged(&s.face_id);
                    fixes += 1;
                }
            }

            touched.sort();
            touched.dedup();
            for cid in touched {
                if let Some(a) = self.backfill_anchor(txn, &cid, now)? {
                    ops.push(IndexOp::Add(a));
                }
                self.refresh_cluster(txn, &cid, now)?;
            }
            Ok(fixes)
        })
    }

    // -- aggregate_recompute --

    fn aggregate_recompute(&self, now: DateTime<Utc>) -> Result<usize> {
        self.transact(|txn, _| {
            let mut changed = 0;
            for c in self.store.clusters()?.into_iter().filter(|c| c.is_active()) {
                self.refresh_cluster(txn, &c.id, now)?;
                let after = txn.cluster(&c.id)?;
                if after.as_ref() != Some(&c) {
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }
}

/// Merge direction: the smaller cluster goes into the larger; on equal
/// size the smaller id survives.
fn survivor<'a>(x: &'a Cluster, y: &'a Cluster) -> (&'a str, &'a str) {
    let x_wins = x.face_count > y.face_count || (x.face_count == y.face_count && x.id < y.id);
    if x_wins { (&x.id, &y.id) } else { (&y.id, &x.id) }
}

fn ordered(a: &str, b: &str) -> (String, String) {
    if a < b { (a.to_string(), b.to_string()) } else { (b.to_string(), a.to_string()) }
}

fn mean_cross(xs: &[Anchor], ys: &[Anchor]) -> f32 {
    let mut sum = 0.0f64;
    let mut n = 0usize;
    for a in xs {
        for b in ys {
            sum += dot(&a.embedding, &b.embedding) as f64;
            n += 1;
        }
    }
    if n == 0 { 0.0 } else { (sum / n as f64) as f32 }
}

/// Follow `merged_into` links from a deleted cluster to an active one.
fn follow_merges(clusters: &HashMap<String, Cluster>, id: &str) -> Option<String> {
    let mut cur = clusters.get(id)?;
    for _ in 0..clusters.len() {
        if cur.is_active() {
            return Some(cur.id.clone());
        }
        cur = clusters.get(cur.merged_into.as_deref()?)?;
    }
    None
}

/// Active cluster a candidate now stands for, through merges.
fn survivor_of(txn: &Txn<'_>, id: &str) -> Result<Option<String>> {
    let mut cur = id.to_string();
    for _ in 0..64 {
        match txn.cluster(&cur)? {
            Some(c) if c.is_active() => return Ok(Some(c.id)),
            Some(c) => match c.merged_into {
                Some(next) => cur = next,
                None => return Ok(None),
            },
            None => return Ok(None),
        }
    }
    Ok(None)
}

fn requeue(txn: &mut Txn<'_>, face_id: String, embedding: Vec<f32>, now: DateTime<Utc>) {
    txn.put_staged(StagedFace {
        face_id,
        embedding,
        best: None,
        runner_up: None,
        status: StagedStatus::Pending,
        staged_at: now,
    });
}
