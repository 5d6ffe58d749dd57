use serde::{Deserialize, Serialize};

use facegroup_vecstore::HnswConfig;

/// EngineConfig holds every clustering tunable.
///
/// Zero or out-of-range values are replaced by defaults in
/// [`EngineConfig::with_defaults`], so a partially filled YAML section is
/// always usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Embedding dimension. Stamped into the store on first open.
    pub dim: usize,
    pub index: IndexConfig,
    pub threshold: ThresholdPolicy,
    pub staging: StagingConfig,
    pub anchors: AnchorPolicy,
    pub refinement: RefinementConfig,
    pub integrity: IntegrityConfig,
    /// Days an undoable operation (and a soft-deleted entity) is kept.
    pub history_retention_days: u32,
    /// Wipe the store when migrations cannot run. Development only.
    pub allow_destructive_migration: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dim: 512,
            index: IndexConfig::default(),
            threshold: ThresholdPolicy::default(),
            staging: StagingConfig::default(),
            anchors: AnchorPolicy::default(),
            refinement: RefinementConfig::default(),
            integrity: IntegrityConfig::default(),
            history_retention_days: 30,
            allow_destructive_migration: false,
        }
    }
}

impl EngineConfig {
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    pub fn with_defaults(mut self) -> Self {
        let d = Self::default();
        if self.dim == 0 {
            self.dim = d.dim;
        }
        if self.history_retention_days == 0 {
            self.history_retention_days = d.history_retention_days;
        }
        self.index.set_defaults();
        self.threshold.set_defaults();
        self.staging.set_defaults();
        self.anchors.set_defaults();
        self.refinement.set_defaults();
        self.integrity.set_defaults();
        self
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.history_retention_days as i64)
    }

    pub(crate) fn hnsw(&self) -> HnswConfig {
        HnswConfig {
            dim: self.dim,
            m: self.index.m,
            ef_construction: self.index.ef_construction,
            ef_search: self.index.ef_search,
            seed: self.index.seed,
        }
    }
}

/// Anchor graph parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: Option<u64>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            seed: None,
        }
    }
}

impl IndexConfig {
    fn set_defaults(&mut self) {
        let d = Self::default();
        if self.m < 2 {
            self.m = d.m;
        }
        if self.ef_construction == 0 {
            self.ef_construction = d.ef_construction;
        }
        if self.ef_search == 0 {
            self.ef_search = d.ef_search;
        }
    }
}

/// Adaptive acceptance threshold: `clamp(mean - k * std, floor, ceiling)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdPolicy {
    /// Used until a cluster has `min_pairs` similarity pairs.
    pub default: f32,
    /// Standard deviation multiplier.
    pub k: f32,
    pub floor: f32,
    pub ceiling: f32,
    pub min_pairs: usize,
    /// Max faces sampled for pairwise statistics.
    pub sample_limit: usize,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            default: 0.60,
            k: 2.0,
            floor: 0.50,
            ceiling: 0.85,
            min_pairs: 3,
            sample_limit: 64,
        }
    }
}

impl ThresholdPolicy {
    fn set_defaults(&mut self) {
        let d = Self::default();
        if !(self.floor > 0.0 && self.floor < 1.0) {
            self.floor = d.floor;
        }
        if !(self.ceiling > self.floor && self.ceiling <= 1.0) {
            self.ceiling = d.ceiling.max(self.floor);
        }
        if self.default <= 0.0 || self.default > 1.0 {
            self.default = d.default;
        }
        if self.k <= 0.0 {
            self.k = d.k;
        }
        if self.min_pairs == 0 {
            self.min_pairs = d.min_pairs;
        }
        if self.sample_limit < 2 {
            self.sample_limit = d.sample_limit;
        }
    }

    pub fn threshold(&self, mean: f32, std_dev: f32, pairs: usize) -> f32 {
        if pairs < self.min_pairs {
            return self.default;
        }
        (mean - self.k * std_dev).clamp(self.floor, self.ceiling)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Flush once this many faces are staged.
    pub flush_items: usize,
    /// Flush at least this often while faces are staged.
    pub flush_interval_secs: u64,
    /// Best and runner-up closer than this (both above threshold) is a conflict.
    pub ambiguity_margin: f32,
    /// Nearest anchors consulted per face.
    pub fanout: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            flush_items: 64,
            flush_interval_secs: 30,
            ambiguity_margin: 0.05,
            fanout: 16,
        }
    }
}

impl StagingConfig {
    fn set_defaults(&mut self) {
        let d = Self::default();
        if self.flush_items == 0 {
            self.flush_items = d.flush_items;
        }
        if self.flush_interval_secs == 0 {
            self.flush_interval_secs = d.flush_interval_secs;
        }
        if self.ambiguity_margin < 0.0 {
            self.ambiguity_margin = d.ambiguity_margin;
        }
        if self.fanout == 0 {
            self.fanout = d.fanout;
        }
    }

    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.flush_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorPolicy {
    pub max_anchors: usize,
    pub max_per_pose: usize,
    /// Faces below this overall quality are never promoted, except as the
    /// only anchor of a cluster.
    pub min_quality: f32,
}

impl Default for AnchorPolicy {
    fn default() -> Self {
        Self {
            max_anchors: 8,
            max_per_pose: 3,
            min_quality: 0.35,
        }
    }
}

impl AnchorPolicy {
    fn set_defaults(&mut self) {
        let d = Self::default();
        if self.max_anchors == 0 {
            self.max_anchors = d.max_anchors;
        }
        if self.max_per_pose == 0 {
            self.max_per_pose = d.max_per_pose;
        }
        self.max_per_pose = self.max_per_pose.min(self.max_anchors);
        if !(0.0..=1.0).contains(&self.min_quality) {
            self.min_quality = d.min_quality;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Mean cross-anchor similarity at which two clusters merge.
    pub merge_threshold: f32,
    /// Intra-cluster similarity variance that flags a split candidate.
    pub split_variance: f32,
    /// Sarle bimodality coefficient that flags a split candidate
    /// (together with at least a quarter of `split_variance`).
    pub split_bimodality: f32,
    pub min_faces_for_split: usize,
    pub max_merge_passes: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.75,
            split_variance: 0.02,
            split_bimodality: 0.555,
            min_faces_for_split: 6,
            max_merge_passes: 5,
        }
    }
}

impl RefinementConfig {
    fn set_defaults(&mut self) {
        let d = Self::default();
        if !(self.merge_threshold > 0.0 && self.merge_threshold <= 1.0) {
            self.merge_threshold = d.merge_threshold;
        }
        if self.split_variance <= 0.0 {
            self.split_variance = d.split_variance;
        }
        if self.split_bimodality <= 0.0 {
            self.split_bimodality = d.split_bimodality;
        }
        if self.min_faces_for_split < 4 {
            self.min_faces_for_split = d.min_faces_for_split;
        }
        if self.max_merge_passes == 0 {
            self.max_merge_passes = d.max_merge_passes;
        }
    }
}

/// Drift tolerated between the anchor index and the store before a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Fraction of the active anchor set.
    pub relative: f32,
    /// Absolute number of ids.
    pub absolute: usize,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            relative: 0.10,
            absolute: 10,
        }
    }
}

impl IntegrityConfig {
    fn set_defaults(&mut self) {
        let d = Self::default();
        if self.relative <= 0.0 {
            self.relative = d.relative;
        }
        if self.absolute == 0 {
            self.absolute = d.absolute;
        }
    }
}
