//! Intra-cluster similarity statistics and the adaptive threshold.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use facegroup_vecstore::dot;

use crate::config::ThresholdPolicy;
use crate::types::{Anchor, ClusterStatistics, FaceObservation, PoseHistogram};

/// Moments of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Moments {
    pub n: usize,
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    /// Sarle's bimodality coefficient `(skew^2 + 1) / kurtosis`.
    /// 0 when undefined (fewer than 4 values, or no spread).
    pub bimodality: f64,
}

pub fn moments(xs: &[f64]) -> Moments {
    let n = xs.len();
    if n == 0 {
        return Moments::default();
    }
    let nf = n as f64;
    let mean = xs.iter().sum::<f64>() / nf;
    let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &x in xs {
        let d = x - mean;
        m2 += d * d;
        m3 += d * d * d;
        m4 += d * d * d * d;
        min = min.min(x);
        max = max.max(x);
    }
    m2 /= nf;
    m3 /= nf;
    m4 /= nf;

    let bimodality = if n >= 4 && m2 > 1e-12 {
        let skew = m3 / m2.powf(1.5);
        let kurt = m4 / (m2 * m2);
        (skew * skew + 1.0) / kurt
    } else {
        0.0
    };

    Moments {
        n,
        mean,
        variance: m2,
        min,
        max,
        bimodality,
    }
}

/// Vectors sampled for pairwise statistics: active anchors first, then
/// the remaining members, each group in id order, capped at `limit`.
fn sample<'a>(anchors: &'a [Anchor], members: &'a [FaceObservation], limit: usize) -> Vec<&'a [f32]> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut active: Vec<&Anchor> = anchors.iter().filter(|a| a.active).collect();
    active.sort_by(|a, b| a.id.cmp(&b.id));
    for a in active {
        if out.len() >= limit {
            return out;
        }
        seen.insert(a.id.as_str());
        out.push(a.embedding.as_slice());
    }
    let mut rest: Vec<&FaceObservation> = members.iter().filter(|f| !seen.contains(f.id.as_str())).collect();
    rest.sort_by(|a, b| a.id.cmp(&b.id));
    for f in rest {
        if out.len() >= limit {
            break;
        }
        out.push(f.embedding.as_slice());
    }
    out
}

/// Pairwise dot-product similarities of the sampled vectors.
pub fn pairwise(vectors: &[&[f32]]) -> Vec<f64> {
    let mut out = Vec::with_capacity(vectors.len() * vectors.len().saturating_sub(1) / 2);
    for i in 0..vectors.len() {
        for j in i + 1..vectors.len() {
            out.push(dot(vectors[i], vectors[j]) as f64);
        }
    }
    out
}

/// Statistics for one cluster from its anchors and active members.
pub fn compute(
    cluster_id: &str,
    anchors: &[Anchor],
    members: &[FaceObservation],
    policy: &ThresholdPolicy,
    now: DateTime<Utc>,
) -> ClusterStatistics {
    let vectors = sample(anchors, members, policy.sample_limit);
    let sims = pairwise(&vectors);
    let m = moments(&sims);

    let mut pose_histogram = PoseHistogram::default();
    for f in members {
        pose_histogram.add(f.pose_category());
    }

    let std_dev = m.variance.sqrt();
    let (min, max) = if m.n == 0 { (0.0, 0.0) } else { (m.min, m.max) };
    ClusterStatistics {
        cluster_id: cluster_id.to_string(),
        mean: m.mean as f32,
        variance: m.variance as f32,
        std_dev: std_dev as f32,
        min: min as f32,
        max: max as f32,
        bimodality: m.bimodality as f32,
        threshold: policy.threshold(m.mean as f32, std_dev as f32, m.n),
        pair_count: m.n,
        anchor_count: anchors.iter().filter(|a| a.active).count(),
        face_count: members.len(),
        pose_histogram,
        updated_at: now,
    }
}

/// Threshold for a cluster without stored statistics.
pub fn threshold_of(stats: Option<&ClusterStatistics>, policy: &ThresholdPolicy) -> f32 {
    stats.map(|s| s.threshold).unwrap_or(policy.default)
}
