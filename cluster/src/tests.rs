use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use facegroup_faceprint::{BoundingBox, PoseAngles, QualityScores};
use facegroup_kv::MemoryStore;
use facegroup_vecstore::normalized;

use crate::{
    ClusterError, Confidence, ConstraintKind, Engine, EngineConfig, FaceObservation, HistoryOp,
    Lifecycle, RefineStep,
};

const DIM: usize = 64;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Unit vector from sparse `(axis, weight)` parts.
fn vector(parts: &[(usize, f32)]) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for &(i, w) in parts {
        v[i] += w;
    }
    normalized(&v).unwrap()
}

/// A face near `base`, pushed off it along its own private axis so that
/// every pair of faces sharing a base has the same similarity.
fn face(photo: &str, index: usize, base: &[(usize, f32)], axis: usize) -> FaceObservation {
    let now = Utc::now();
    let mut parts = base.to_vec();
    parts.push((axis, 0.2));
    FaceObservation {
        id: FaceObservation::face_id(photo, index),
        photo_id: photo.into(),
        embedding: vector(&parts),
        quality: QualityScores::uniform(0.8),
        pose: PoseAngles::default(),
        bbox: BoundingBox::full(),
        cluster_id: None,
        confidence: Confidence::Unassigned,
        lifecycle: Lifecycle::Active,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// `n` faces around `base`, one per photo `"{prefix}{i}"`, using private
/// axes starting at `first_axis`.
fn group(prefix: &str, n: usize, base: &[(usize, f32)], first_axis: usize) -> Vec<FaceObservation> {
    (0..n)
        .map(|i| face(&format!("{prefix}{i}"), 0, base, first_axis + i))
        .collect()
}

fn open() -> (MemoryStore, Engine) {
    let kv = MemoryStore::new();
    let e = Engine::open(Arc::new(kv.clone()), EngineConfig::with_dim(DIM), None).unwrap();
    (kv, e)
}

fn stage_all(e: &Engine, faces: &[FaceObservation]) {
    let mut txn = e.begin();
    for f in faces {
        e.stage(&mut txn, f.clone()).unwrap();
    }
    e.commit(txn).unwrap();
}

fn cluster_of(e: &Engine, face_id: &str) -> Option<String> {
    e.face(face_id).unwrap().and_then(|f| f.cluster_id)
}

/// Sizes of active clusters, largest first.
fn sizes(e: &Engine) -> Vec<usize> {
    e.clusters().unwrap().iter().map(|c| c.face_count).collect()
}

/// Partition of face ids by cluster, independent of cluster ids.
fn partition(e: &Engine) -> BTreeSet<BTreeSet<String>> {
    let mut by_cluster: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for f in e.store().faces().unwrap() {
        if let Some(c) = f.cluster_id {
            by_cluster.entry(c).or_default().insert(f.id);
        }
    }
    by_cluster.into_values().collect()
}

const BASE_A: &[(usize, f32)] = &[(0, 1.0)];
const BASE_B: &[(usize, f32)] = &[(1, 1.0)];
// 0.8 cosine to BASE_A.
const BASE_A_NEAR: &[(usize, f32)] = &[(0, 0.8), (1, 0.6)];

/// Two 5-face clusters kept apart by flushing but close enough to merge.
fn near_pair(e: &Engine) -> (String, String) {
    let xs = group("x", 5, BASE_A, 10);
    let ys = group("y", 5, BASE_A_NEAR, 20);
    stage_all(e, &xs);
    e.flush().unwrap();
    stage_all(e, &ys);
    e.flush().unwrap();
    let x = cluster_of(e, &xs[0].id).unwrap();
    let y = cluster_of(e, &ys[0].id).unwrap();
    (x, y)
}

/// Pin a cluster's adaptive threshold.
fn set_threshold(e: &Engine, cluster: &str, threshold: f32) {
    let mut stats = e.store().stats(cluster).unwrap().unwrap();
    stats.threshold = threshold;
    let mut txn = e.begin();
    txn.put_stats(stats);
    e.commit(txn).unwrap();
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

#[test]
fn test_flush_groups_and_singletons() {
    let (_, e) = open();
    let mut faces = group("a", 3, BASE_A, 10);
    faces.extend(group("b", 3, BASE_B, 20));
    for (i, axis) in (2..6).enumerate() {
        faces.push(face(&format!("s{i}"), 0, &[(axis, 1.0)], 30 + i));
    }
    stage_all(&e, &faces);
    assert_eq!(e.staged_count().unwrap(), 10);

    let r = e.flush().unwrap();
    assert_eq!(r.staged, 10);
    assert_eq!(r.created, 6);
    assert_eq!(r.assigned, 4);
    assert_eq!(r.conflicts, 0);
    assert_eq!(e.staged_count().unwrap(), 0);
    assert_eq!(sizes(&e), vec![3, 3, 1, 1, 1, 1]);

    let a = cluster_of(&e, "a0#0").unwrap();
    assert_eq!(cluster_of(&e, "a1#0").as_deref(), Some(a.as_str()));
    assert_eq!(cluster_of(&e, "a2#0").as_deref(), Some(a.as_str()));
    assert_ne!(cluster_of(&e, "b0#0").as_deref(), Some(a.as_str()));

    let report = e.refine();
    assert!(report.is_ok(), "{:?}", report.errors().collect::<Vec<_>>());
    assert!(report.merges.is_empty());
    assert_eq!(report.count(RefineStep::SplitDetection), 0);
    assert!(e.split_candidates().unwrap().is_empty());
    assert_eq!(sizes(&e), vec![3, 3, 1, 1, 1, 1]);
}

#[test]
fn test_stage_same_face_twice() {
    let (_, e) = open();
    let f = face("p", 0, BASE_A, 10);
    let mut txn = e.begin();
    assert!(e.stage(&mut txn, f.clone()).unwrap());
    assert!(!e.stage(&mut txn, f.clone()).unwrap());
    e.commit(txn).unwrap();
    e.flush().unwrap();

    let mut txn = e.begin();
    assert!(!e.stage(&mut txn, f).unwrap());
    e.commit(txn).unwrap();
    assert_eq!(e.flush().unwrap().staged, 0);
    assert_eq!(sizes(&e), vec![1]);
}

#[test]
fn test_stage_rejects_wrong_dimension() {
    let (_, e) = open();
    let mut f = face("p", 0, BASE_A, 10);
    f.embedding.truncate(8);
    let mut txn = e.begin();
    assert!(matches!(e.stage(&mut txn, f), Err(ClusterError::Vector(_))));
}

#[test]
fn test_partition_ignores_stage_order() {
    let mut faces = group("a", 4, BASE_A, 10);
    faces.extend(group("b", 4, BASE_B, 20));
    faces.extend(group("c", 3, &[(2, 1.0)], 30));

    let (_, ordered) = open();
    stage_all(&ordered, &faces);
    ordered.flush().unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut shuffled = faces.clone();
    shuffled.shuffle(&mut rng);
    let (_, e) = open();
    for chunk in shuffled.chunks(3) {
        stage_all(&e, chunk);
        e.flush().unwrap();
    }
    assert_eq!(partition(&e), partition(&ordered));
    assert_eq!(sizes(&e), vec![4, 4, 3]);
}

#[test]
fn test_ambiguous_face_is_conflict() {
    let (_, e) = open();
    stage_all(&e, &group("a", 2, BASE_A, 10));
    stage_all(&e, &group("b", 2, BASE_B, 20));
    e.flush().unwrap();
    let a = cluster_of(&e, "a0#0").unwrap();

    // Equally close to both clusters.
    stage_all(&e, &[face("z", 0, &[(0, 1.0), (1, 1.0)], 40)]);
    let r = e.flush().unwrap();
    assert_eq!(r.conflicts, 1);
    let conflicts = e.conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].best.is_some() && conflicts[0].runner_up.is_some());
    assert_eq!(cluster_of(&e, "z#0"), None);

    assert_eq!(e.resolve_conflict("z#0", Some(&a)).unwrap(), a);
    assert_eq!(cluster_of(&e, "z#0"), Some(a.clone()));
    assert_eq!(e.face("z#0").unwrap().unwrap().confidence, Confidence::UserConfirmed);
    assert!(e.conflicts().unwrap().is_empty());
    assert_eq!(e.cluster(&a).unwrap().unwrap().face_count, 3);
}

#[test]
fn test_runner_up_within_its_threshold_takes_face() {
    let (_, e) = open();
    stage_all(&e, &group("x", 2, BASE_A, 10));
    stage_all(&e, &group("y", 2, BASE_B, 20));
    e.flush().unwrap();
    let x = cluster_of(&e, "x0#0").unwrap();
    let y = cluster_of(&e, "y0#0").unwrap();
    set_threshold(&e, &x, 0.85);
    set_threshold(&e, &y, 0.50);

    // About 0.77 to the tight cluster, 0.58 to the diverse one.
    stage_all(&e, &[face("q", 0, BASE_A_NEAR, 40)]);
    let r = e.flush().unwrap();
    assert_eq!(r.assigned, 1);
    assert_eq!(r.created, 0);
    assert_eq!(r.conflicts, 0);
    assert_eq!(cluster_of(&e, "q#0"), Some(y));
    assert_eq!(sizes(&e), vec![3, 2]);
}

#[test]
fn test_face_below_every_threshold_starts_cluster() {
    let (_, e) = open();
    stage_all(&e, &group("x", 2, BASE_A, 10));
    stage_all(&e, &group("y", 2, BASE_B, 20));
    e.flush().unwrap();
    let x = cluster_of(&e, "x0#0").unwrap();
    let y = cluster_of(&e, "y0#0").unwrap();
    set_threshold(&e, &x, 0.85);
    set_threshold(&e, &y, 0.70);

    stage_all(&e, &[face("q", 0, BASE_A_NEAR, 40)]);
    let r = e.flush().unwrap();
    assert_eq!(r.created, 1);
    assert_eq!(sizes(&e), vec![2, 2, 1]);
}

#[test]
fn test_restaged_face_with_new_embedding_moves() {
    let (_, e) = open();
    stage_all(&e, &group("a", 3, BASE_A, 10));
    stage_all(&e, &group("b", 2, BASE_B, 20));
    e.flush().unwrap();
    let a = cluster_of(&e, "a0#0").unwrap();
    let b = cluster_of(&e, "b0#0").unwrap();
    assert!(e.anchor_index().contains("a0#0"));

    // The photo behind a0 was edited and now shows the person of b.
    let edited = face("a0", 0, BASE_B, 12);
    let mut txn = e.begin();
    assert!(e.stage(&mut txn, edited.clone()).unwrap());
    assert!(!e.stage(&mut txn, edited).unwrap());
    e.commit(txn).unwrap();
    assert_eq!(cluster_of(&e, "a0#0"), None);
    assert!(!e.anchor_index().contains("a0#0"));
    assert_eq!(e.cluster(&a).unwrap().unwrap().face_count, 2);

    e.flush().unwrap();
    assert_eq!(cluster_of(&e, "a0#0"), Some(b));
    assert_eq!(sizes(&e), vec![3, 2]);

    // Re-extracting a1's photo finds no faces any more.
    let mut txn = e.begin();
    assert_eq!(e.stage_embeddings(&mut txn, "a1", &[], Utc::now()).unwrap(), 0);
    e.commit(txn).unwrap();
    assert_eq!(e.face("a1#0").unwrap().unwrap().lifecycle, Lifecycle::SoftDeleted);
    assert_eq!(sizes(&e), vec![3, 1]);
    assert_eq!(e.anchor_index().len(), e.store().active_anchors().unwrap().len());
}

#[test]
fn test_failed_flush_leaves_store_untouched() {
    let (kv, e) = open();
    stage_all(&e, &group("a", 3, BASE_A, 10));
    kv.fail_next_commits(1);
    assert!(e.flush().is_err());
    assert_eq!(e.staged_count().unwrap(), 3);
    assert!(e.clusters().unwrap().is_empty());
    assert!(e.anchor_index().is_empty());

    let r = e.flush().unwrap();
    assert_eq!(r.resolved(), 3);
    assert_eq!(sizes(&e), vec![3]);
    assert_eq!(e.anchor_index().len(), 3);
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

#[test]
fn test_must_link_pulls_unrelated_faces_together() {
    let (_, e) = open();
    let m1 = face("m1", 0, BASE_A, 10);
    let m2 = face("m2", 0, BASE_B, 20);
    stage_all(&e, &[m1.clone(), m2.clone()]);
    e.add_constraint(&m1.id, &m2.id, ConstraintKind::MustLink).unwrap();

    let r = e.flush().unwrap();
    assert_eq!(r.created, 1);
    assert_eq!(r.constrained, 1);
    assert_eq!(cluster_of(&e, &m1.id), cluster_of(&e, &m2.id));
    assert_eq!(sizes(&e), vec![2]);
}

#[test]
fn test_must_link_partner_waits_with_conflicting_face() {
    let (_, e) = open();
    stage_all(&e, &group("a", 2, BASE_A, 10));
    stage_all(&e, &group("b", 2, BASE_B, 20));
    e.flush().unwrap();
    let a = cluster_of(&e, "a0#0").unwrap();

    // z is equally close to both clusters and is staged first; w is close
    // to neither.
    let z = face("z", 0, &[(0, 1.0), (1, 1.0)], 40);
    let mut w = face("w", 0, &[(5, 1.0)], 41);
    w.created_at = z.created_at + Duration::seconds(1);
    stage_all(&e, &[z.clone(), w.clone()]);
    e.add_constraint(&z.id, &w.id, ConstraintKind::MustLink).unwrap();

    let r = e.flush().unwrap();
    assert_eq!(r.conflicts, 2);
    assert_eq!(r.created, 0);
    assert_eq!(cluster_of(&e, &z.id), None);
    assert_eq!(cluster_of(&e, &w.id), None);
    assert_eq!(e.conflicts().unwrap().len(), 2);

    e.resolve_conflict(&z.id, Some(&a)).unwrap();
    assert_eq!(cluster_of(&e, &z.id), Some(a.clone()));
    assert_eq!(cluster_of(&e, &w.id), Some(a.clone()));
    assert_eq!(e.face(&w.id).unwrap().unwrap().confidence, Confidence::Constrained);
    assert!(e.conflicts().unwrap().is_empty());
    assert_eq!(sizes(&e), vec![4, 2]);
}

#[test]
fn test_must_link_moves_placed_face() {
    let (_, e) = open();
    stage_all(&e, &group("a", 2, BASE_A, 10));
    stage_all(&e, &group("b", 2, BASE_B, 20));
    e.flush().unwrap();
    let b = cluster_of(&e, "b0#0").unwrap();

    let hid = e.add_constraint("a0#0", "b0#0", ConstraintKind::MustLink).unwrap();
    assert_eq!(cluster_of(&e, "a0#0"), Some(b.clone()));
    assert_eq!(e.face("a0#0").unwrap().unwrap().confidence, Confidence::Constrained);
    assert_eq!(sizes(&e), vec![3, 1]);

    e.undo(&hid).unwrap();
    assert!(e.constraints().is_empty());
    assert_ne!(cluster_of(&e, "a0#0"), Some(b));
    assert_eq!(sizes(&e), vec![2, 2]);
}

#[test]
fn test_cannot_link_is_never_co_clustered() {
    let (_, e) = open();
    let c1 = face("c1", 0, BASE_A, 10);
    let c2 = face("c2", 0, BASE_A, 11);
    stage_all(&e, &[c1.clone(), c2.clone()]);
    e.add_constraint(&c1.id, &c2.id, ConstraintKind::CannotLink).unwrap();
    e.flush().unwrap();

    let x = cluster_of(&e, &c1.id).unwrap();
    let y = cluster_of(&e, &c2.id).unwrap();
    assert_ne!(x, y);
    assert!(matches!(e.merge_clusters(&x, &y), Err(ClusterError::ConstraintViolation(_))));
    assert!(matches!(e.move_face(&c2.id, &x), Err(ClusterError::ConstraintViolation(_))));

    let report = e.refine();
    assert!(report.merges.is_empty());
    assert_ne!(cluster_of(&e, &c1.id), cluster_of(&e, &c2.id));

    // Opposite and duplicate constraints are rejected.
    assert!(matches!(
        e.add_constraint(&c2.id, &c1.id, ConstraintKind::MustLink),
        Err(ClusterError::ConstraintViolation(_))
    ));
    assert!(matches!(
        e.add_constraint(&c1.id, &c2.id, ConstraintKind::CannotLink),
        Err(ClusterError::Invalid(_))
    ));
    assert!(e.remove_constraint(&c1.id, &c2.id).unwrap());
    assert!(!e.remove_constraint(&c1.id, &c2.id).unwrap());
}

#[test]
fn test_cannot_link_separates_co_clustered_pair() {
    let (_, e) = open();
    stage_all(&e, &group("a", 3, BASE_A, 10));
    e.flush().unwrap();
    e.add_constraint("a0#0", "a1#0", ConstraintKind::CannotLink).unwrap();
    assert_ne!(cluster_of(&e, "a0#0"), cluster_of(&e, "a1#0"));
    assert_eq!(sizes(&e), vec![2, 1]);
}

// ---------------------------------------------------------------------------
// Refinement
// ---------------------------------------------------------------------------

#[test]
fn test_refine_merges_near_clusters_and_undo_restores() {
    let (_, e) = open();
    let (x, y) = near_pair(&e);
    assert_ne!(x, y);
    assert_eq!(sizes(&e), vec![5, 5]);

    let report = e.refine();
    assert!(report.is_ok(), "{:?}", report.errors().collect::<Vec<_>>());
    assert_eq!(report.merges.len(), 1);
    assert_eq!(sizes(&e), vec![10]);
    assert_eq!(cluster_of(&e, "y0#0"), Some(x.clone()));

    let history = e.history(10).unwrap();
    let merges: Vec<_> = history.iter().filter(|h| h.op == HistoryOp::AutoMerge).collect();
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].id, report.merges[0]);

    e.undo(&report.merges[0]).unwrap();
    assert_eq!(sizes(&e), vec![5, 5]);
    assert_eq!(cluster_of(&e, "y0#0"), Some(y.clone()));
    assert_eq!(cluster_of(&e, "x0#0"), Some(x));
    assert_eq!(e.anchor_index().len(), e.store().active_anchors().unwrap().len());
}

#[test]
fn test_refine_is_idempotent() {
    let (_, e) = open();
    near_pair(&e);
    stage_all(&e, &group("b", 3, BASE_B, 40));
    e.flush().unwrap();
    e.refine();
    let clusters = e.clusters().unwrap();
    let stats: Vec<_> = clusters.iter().map(|c| e.statistics(&c.id).unwrap().unwrap()).collect();

    let again = e.refine();
    assert!(again.is_ok());
    assert!(again.merges.is_empty());
    assert_eq!(again.count(RefineStep::OrphanRepair), 0);
    assert_eq!(again.count(RefineStep::AggregateRecompute), 0);
    assert_eq!(again.count(RefineStep::IndexResync), 0);
    assert_eq!(e.clusters().unwrap(), clusters);
    for (c, before) in clusters.iter().zip(&stats) {
        assert!(e.statistics(&c.id).unwrap().unwrap().same_values(before));
    }
}

#[test]
fn test_orphan_repair_follows_merges() {
    let (_, e) = open();
    let (x, y) = near_pair(&e);
    e.merge_clusters(&x, &y).unwrap();

    // Point a face back at the merged-away cluster behind the engine's back.
    let mut f = e.face("y1#0").unwrap().unwrap();
    f.cluster_id = Some(y.clone());
    let mut txn = e.begin();
    txn.put_face(f);
    e.commit(txn).unwrap();

    let report = e.refine();
    assert!(report.count(RefineStep::OrphanRepair) >= 1);
    assert_eq!(cluster_of(&e, "y1#0"), Some(x.clone()));
    assert_eq!(e.membership().unwrap().get(&x), Some(&10));
}

// ---------------------------------------------------------------------------
// User actions and undo
// ---------------------------------------------------------------------------

#[test]
fn test_split_and_undo() {
    let (_, e) = open();
    stage_all(&e, &group("a", 4, BASE_A, 10));
    e.flush().unwrap();
    let a = cluster_of(&e, "a0#0").unwrap();

    let moved = vec!["a2#0".to_string(), "a3#0".to_string()];
    let (created, hid) = e.split_cluster(&a, &moved).unwrap();
    assert_eq!(sizes(&e), vec![2, 2]);
    assert_eq!(cluster_of(&e, "a3#0"), Some(created.clone()));
    assert!(e.store().active_anchors().unwrap().iter().any(|x| x.cluster_id == created));
    assert!(matches!(
        e.split_cluster(&a, &["a0#0".into(), "a1#0".into()]),
        Err(ClusterError::Invalid(_))
    ));

    e.undo(&hid).unwrap();
    assert_eq!(sizes(&e), vec![4]);
    assert_eq!(cluster_of(&e, "a3#0"), Some(a));
    assert!(e.cluster(&created).unwrap().is_none());
}

#[test]
fn test_move_and_remove_undo() {
    let (_, e) = open();
    stage_all(&e, &group("a", 3, BASE_A, 10));
    stage_all(&e, &group("b", 2, BASE_B, 20));
    e.flush().unwrap();
    let a = cluster_of(&e, "a0#0").unwrap();
    let b = cluster_of(&e, "b0#0").unwrap();

    let hid = e.move_face("a2#0", &b).unwrap();
    assert_eq!(cluster_of(&e, "a2#0"), Some(b.clone()));
    assert_eq!(sizes(&e), vec![3, 2]);
    e.undo(&hid).unwrap();
    assert_eq!(cluster_of(&e, "a2#0"), Some(a.clone()));
    assert_eq!(sizes(&e), vec![3, 2]);
    assert_eq!(e.cluster(&a).unwrap().unwrap().face_count, 3);

    let hid = e.remove_face("b1#0").unwrap();
    assert!(!e.face("b1#0").unwrap().unwrap().is_active());
    assert_eq!(sizes(&e), vec![3, 1]);
    e.undo(&hid).unwrap();
    assert!(e.face("b1#0").unwrap().unwrap().is_active());
    assert_eq!(sizes(&e), vec![3, 2]);
}

#[test]
fn test_undo_errors() {
    let (_, e) = open();
    stage_all(&e, &group("a", 2, BASE_A, 10));
    stage_all(&e, &group("b", 2, BASE_B, 20));
    e.flush().unwrap();
    let a = cluster_of(&e, "a0#0").unwrap();
    let b = cluster_of(&e, "b0#0").unwrap();

    let hid = e.merge_clusters(&a, &b).unwrap();
    assert!(matches!(
        e.undo_at(&hid, Utc::now() + Duration::days(31)),
        Err(ClusterError::HistoryExpired(_))
    ));
    e.undo(&hid).unwrap();
    assert!(matches!(e.undo(&hid), Err(ClusterError::HistoryUndone(_))));
    assert!(matches!(e.undo("h999999"), Err(ClusterError::NotFound { .. })));
    assert_eq!(sizes(&e), vec![2, 2]);
}

#[test]
fn test_identities_and_photo_query() {
    let (_, e) = open();
    // Photo p1 holds both people, p2 only A, p3 only B.
    let faces = vec![
        face("p1", 0, BASE_A, 10),
        face("p1", 1, BASE_B, 20),
        face("p2", 0, BASE_A, 11),
        face("p3", 0, BASE_B, 21),
    ];
    stage_all(&e, &faces);
    e.flush().unwrap();
    let a = cluster_of(&e, "p1#0").unwrap();
    let b = cluster_of(&e, "p1#1").unwrap();

    let created = e.rename_cluster(&a, "alice").unwrap();
    let alice = e.cluster(&a).unwrap().unwrap().identity_id.unwrap();
    let bob = e.create_identity("bob", None, Some(2)).unwrap().id;
    e.assign_identity(&b, Some(bob.as_str())).unwrap();

    assert_eq!(e.photos_containing_identities(&[alice.as_str()]).unwrap(), vec!["p1", "p2"]);
    assert_eq!(
        e.photos_containing_identities(&[alice.as_str(), bob.as_str()]).unwrap(),
        vec!["p1"]
    );
    assert!(e.photos_containing_identities(&[]).unwrap().is_empty());
    assert_eq!(e.clusters_for_identity(&bob).unwrap().len(), 1);

    // A second rename edits the same identity.
    let renamed = e.rename_cluster(&a, "alicia").unwrap();
    assert_eq!(e.cluster(&a).unwrap().unwrap().identity_id.as_deref(), Some(alice.as_str()));
    let name_of = |id: &str| e.identities().unwrap().into_iter().find(|i| i.id == id).map(|i| i.name);
    assert_eq!(name_of(&alice).as_deref(), Some("alicia"));
    e.undo(&renamed).unwrap();
    assert_eq!(name_of(&alice).as_deref(), Some("alice"));

    e.undo(&created).unwrap();
    assert_eq!(e.cluster(&a).unwrap().unwrap().identity_id, None);
    assert_eq!(name_of(&alice), None);
    assert!(e.photos_containing_identities(&[alice.as_str()]).unwrap().is_empty());
}

#[test]
fn test_cleanup_purges_after_retention() {
    let (_, e) = open();
    stage_all(&e, &group("a", 3, BASE_A, 10));
    e.flush().unwrap();
    e.remove_face("a2#0").unwrap();

    let early = e.cleanup_history().unwrap();
    assert_eq!(early.total(), 0);
    assert!(e.face("a2#0").unwrap().is_some());

    let later = e.cleanup_history_at(Utc::now() + Duration::days(31)).unwrap();
    assert_eq!(later.expired_history, 1);
    assert_eq!(later.purged_faces, 1);
    assert_eq!(later.purged_clusters, 0);
    assert!(e.face("a2#0").unwrap().is_none());
    assert!(e.history(10).unwrap().is_empty());
    assert_eq!(sizes(&e), vec![2]);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn test_reopen_with_saved_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anchors.idx");
    let kv = MemoryStore::new();
    let anchors = {
        let e = Engine::open(Arc::new(kv.clone()), EngineConfig::with_dim(DIM), Some(path.clone())).unwrap();
        stage_all(&e, &group("a", 3, BASE_A, 10));
        stage_all(&e, &group("b", 2, BASE_B, 20));
        e.flush().unwrap();
        e.save_index().unwrap();
        e.anchor_index().len()
    };
    assert!(path.exists());

    let e = Engine::open(Arc::new(kv.clone()), EngineConfig::with_dim(DIM), Some(path)).unwrap();
    assert_eq!(e.anchor_index().len(), anchors);
    assert!(e.anchor_index().contains("a0#0"));
    assert_eq!(sizes(&e), vec![3, 2]);

    // Without a saved file the index is rebuilt from the store.
    let e = Engine::open(Arc::new(kv), EngineConfig::with_dim(DIM), None).unwrap();
    assert_eq!(e.anchor_index().len(), anchors);
}

#[test]
fn test_reopen_with_truncated_index_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anchors.idx");
    let kv = MemoryStore::new();
    {
        let e = Engine::open(Arc::new(kv.clone()), EngineConfig::with_dim(DIM), Some(path.clone())).unwrap();
        stage_all(&e, &group("a", 3, BASE_A, 10));
        stage_all(&e, &group("b", 2, BASE_B, 20));
        e.flush().unwrap();
        e.save_index().unwrap();
    }
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let e = Engine::open(Arc::new(kv), EngineConfig::with_dim(DIM), Some(path)).unwrap();
    let active = e.store().active_anchors().unwrap();
    assert!(!active.is_empty());
    assert_eq!(e.anchor_index().len(), active.len());
    assert!(active.iter().all(|a| e.anchor_index().contains(&a.id)));

    // The rebuilt index serves lookups.
    stage_all(&e, &[face("a9", 0, BASE_A, 30)]);
    assert_eq!(e.flush().unwrap().assigned, 1);
    assert_eq!(sizes(&e), vec![4, 2]);
}
