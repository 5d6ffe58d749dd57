use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use facegroup_faceprint::{BoundingBox, PoseAngles, PoseCategory, QualityScores};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Per-entity lifecycle tag. Soft-deleted entities stay in the store until
/// the retention window passes so that undo can restore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Active,
    SoftDeleted,
}

/// How sure the engine is about a face's cluster assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Confidence {
    #[default]
    Unassigned,
    Low,
    Medium,
    High,
    /// Forced by a MUST_LINK constraint.
    Constrained,
    /// Placed by an explicit user action.
    UserConfirmed,
}

impl Confidence {
    /// Tier for an automatic assignment `margin` above the threshold.
    pub fn from_margin(margin: f32) -> Self {
        if margin >= 0.15 {
            Confidence::High
        } else if margin >= 0.05 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    /// `"{photo_id}#{index}"`.
    pub id: String,
    pub photo_id: String,
    pub embedding: Vec<f32>,
    pub quality: QualityScores,
    pub pose: PoseAngles,
    pub bbox: BoundingBox,
    pub cluster_id: Option<String>,
    pub confidence: Confidence,
    pub lifecycle: Lifecycle,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FaceObservation {
    pub fn face_id(photo_id: &str, index: usize) -> String {
        format!("{photo_id}#{index}")
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn pose_category(&self) -> PoseCategory {
        self.pose.category()
    }

    /// Ranking used to pick a cluster's representative face.
    pub fn representative_score(&self) -> f32 {
        let frontal = if self.pose_category() == PoseCategory::Frontal { 0.1 } else { 0.0 };
        self.quality.overall() + 0.1 * self.quality.eyes + frontal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub identity_id: Option<String>,
    pub face_count: usize,
    /// Mean member embedding, normalized. Display only, never matched.
    pub centroid: Option<Vec<f32>>,
    pub representative_face: Option<String>,
    /// Flagged by split detection for user review.
    pub needs_review: bool,
    pub lifecycle: Lifecycle,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Survivor when this cluster was merged away.
    pub merged_into: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            identity_id: None,
            face_count: 0,
            centroid: None,
            representative_face: None,
            needs_review: false,
            lifecycle: Lifecycle::Active,
            deleted_at: None,
            merged_into: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }
}

/// A real face kept as one of its cluster's matching representatives.
/// The anchor id is the face id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: String,
    pub cluster_id: String,
    pub embedding: Vec<f32>,
    pub quality: f32,
    pub pose: PoseCategory,
    pub active: bool,
    pub match_count: u64,
    pub last_matched: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Anchor {
    pub fn from_face(face: &FaceObservation, cluster_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: face.id.clone(),
            cluster_id: cluster_id.to_string(),
            embedding: face.embedding.clone(),
            quality: face.quality.overall(),
            pose: face.pose_category(),
            active: true,
            match_count: 0,
            last_matched: None,
            created_at: now,
        }
    }
}

/// Face counts per pose category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoseHistogram {
    pub frontal: usize,
    pub left: usize,
    pub right: usize,
    pub up: usize,
    pub down: usize,
}

impl PoseHistogram {
    pub fn add(&mut self, pose: PoseCategory) {
        *self.slot(pose) += 1;
    }

    pub fn get(&self, pose: PoseCategory) -> usize {
        match pose {
            PoseCategory::Frontal => self.frontal,
            PoseCategory::Left => self.left,
            PoseCategory::Right => self.right,
            PoseCategory::Up => self.up,
            PoseCategory::Down => self.down,
        }
    }

    fn slot(&mut self, pose: PoseCategory) -> &mut usize {
        match pose {
            PoseCategory::Frontal => &mut self.frontal,
            PoseCategory::Left => &mut self.left,
            PoseCategory::Right => &mut self.right,
            PoseCategory::Up => &mut self.up,
            PoseCategory::Down => &mut self.down,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatistics {
    pub cluster_id: String,
    pub mean: f32,
    pub variance: f32,
    pub std_dev: f32,
    pub min: f32,
    pub max: f32,
    /// Sarle's bimodality coefficient of the pairwise similarities.
    pub bimodality: f32,
    /// Derived acceptance threshold.
    pub threshold: f32,
    pub pair_count: usize,
    pub anchor_count: usize,
    pub face_count: usize,
    pub pose_histogram: PoseHistogram,
    pub updated_at: DateTime<Utc>,
}

impl ClusterStatistics {
    /// Same numbers, ignoring the timestamp.
    pub fn same_values(&self, other: &Self) -> bool {
        let close = |a: f32, b: f32| (a - b).abs() <= 1e-6;
        self.cluster_id == other.cluster_id
            && close(self.mean, other.mean)
            && close(self.variance, other.variance)
            && close(self.std_dev, other.std_dev)
            && close(self.min, other.min)
            && close(self.max, other.max)
            && close(self.bimodality, other.bimodality)
            && close(self.threshold, other.threshold)
            && self.pair_count == other.pair_count
            && self.anchor_count == other.anchor_count
            && self.face_count == other.face_count
            && self.pose_histogram == other.pose_histogram
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagedStatus {
    Pending,
    Accepted,
    Conflict,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub cluster_id: String,
    pub similarity: f32,
}

/// A face awaiting a clustering decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedFace {
    pub face_id: String,
    pub embedding: Vec<f32>,
    pub best: Option<Candidate>,
    pub runner_up: Option<Candidate>,
    pub status: StagedStatus,
    pub staged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    MustLink,
    CannotLink,
}

/// A user-authored pair constraint. `a < b` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub a: String,
    pub b: String,
    pub kind: ConstraintKind,
    pub created_at: DateTime<Utc>,
}

impl Constraint {
    /// Orders the pair. Returns None for a face paired with itself.
    pub fn new(x: &str, y: &str, kind: ConstraintKind, now: DateTime<Utc>) -> Option<Self> {
        if x == y {
            return None;
        }
        let (a, b) = if x < y { (x, y) } else { (y, x) };
        Some(Self {
            a: a.to_string(),
            b: b.to_string(),
            kind,
            created_at: now,
        })
    }

    pub fn other(&self, face: &str) -> Option<&str> {
        if self.a == face {
            Some(&self.b)
        } else if self.b == face {
            Some(&self.a)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub birthday: Option<NaiveDate>,
    pub display_number: Option<u32>,
    pub lifecycle: Lifecycle,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryOp {
    Merge,
    AutoMerge,
    Split,
    MoveFace,
    RemoveFace,
    Rename,
    AssignIdentity,
    AddConstraint,
}

/// A face relocation and the anchor bookkeeping that came with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMove {
    pub face_id: String,
    pub from: Option<String>,
    pub from_confidence: Confidence,
    pub to: String,
    /// The face's anchor record in `from`, if it had one.
    pub old_anchor: Option<Anchor>,
    /// Whether the face was promoted to an anchor in `to`.
    pub promoted: bool,
    /// Member of `from` promoted because the move left it without anchors.
    pub backfilled: Option<String>,
}

/// Everything needed to reverse one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reversal {
    Merge {
        target_before: Cluster,
        source_before: Cluster,
        source_stats: Option<ClusterStatistics>,
        moved_faces: Vec<String>,
        /// Source anchors as they were before the merge.
        moved_anchors: Vec<Anchor>,
        /// Anchor ids deactivated to respect the target's caps.
        deactivated: Vec<String>,
    },
    Split {
        source: String,
        created: String,
        faces: Vec<String>,
        /// Anchor ids promoted to keep both clusters matchable.
        promoted: Vec<String>,
    },
    MoveFace(FaceMove),
    RemoveFace {
        face_before: FaceObservation,
        anchor: Option<Anchor>,
        promoted: Option<String>,
    },
    Rename {
        cluster_id: String,
        identity_id: String,
        created: bool,
        name_before: Option<String>,
    },
    AssignIdentity {
        cluster_id: String,
        before: Option<String>,
    },
    AddConstraint {
        constraint: Constraint,
        moved: Option<FaceMove>,
        /// Singleton created for a CANNOT_LINK separation.
        created: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub op: HistoryOp,
    pub clusters: Vec<String>,
    pub reversal: Reversal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub undone: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_orders_pair() {
        let now = Utc::now();
        let c = Constraint::new("p2#0", "p1#0", ConstraintKind::CannotLink, now).unwrap();
        assert_eq!((c.a.as_str(), c.b.as_str()), ("p1#0", "p2#0"));
        assert_eq!(c.other("p1#0"), Some("p2#0"));
        assert_eq!(c.other("p3#0"), None);
        assert!(Constraint::new("x", "x", ConstraintKind::MustLink, now).is_none());
    }

    #[test]
    fn test_confidence_from_margin() {
        assert_eq!(Confidence::from_margin(0.2), Confidence::High);
        assert_eq!(Confidence::from_margin(0.07), Confidence::Medium);
        assert_eq!(Confidence::from_margin(0.0), Confidence::Low);
    }

    #[test]
    fn test_pose_histogram() {
        let mut h = PoseHistogram::default();
        h.add(PoseCategory::Left);
        h.add(PoseCategory::Left);
        h.add(PoseCategory::Frontal);
        assert_eq!(h.get(PoseCategory::Left), 2);
        assert_eq!(h.get(PoseCategory::Frontal), 1);
        assert_eq!(h.get(PoseCategory::Down), 0);
    }

    #[test]
    fn test_reversal_msgpack_roundtrip() {
        let now = Utc::now();
        let r = Reversal::AssignIdentity {
            cluster_id: "c000001".into(),
            before: None,
        };
        let bytes = rmp_serde::to_vec_named(&r).unwrap();
        let back: Reversal = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, r);
        let c = Cluster::new("c000002".into(), now);
        let bytes = rmp_serde::to_vec_named(&c).unwrap();
        let back: Cluster = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, c);
    }
}
