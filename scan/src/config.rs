use std::time::Duration;

use serde::{Deserialize, Serialize};

/// ScanConfig holds the scan orchestrator tunables.
///
/// Zero values are replaced by defaults in [`ScanConfig::with_defaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Photos per batch under normal conditions.
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Concurrent workers under normal conditions.
    pub parallelism: usize,
    pub min_parallelism: usize,
    pub max_parallelism: usize,
    /// Per-photo budget for loading, detection and embedding.
    pub item_timeout_ms: u64,
    /// Attempts before a photo is marked permanently failed.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Persist the checkpoint after this many photos...
    pub checkpoint_items: usize,
    /// ...or this many seconds, whichever comes first.
    pub checkpoint_secs: u64,
    /// Available/total memory below which pressure is elevated.
    pub memory_elevated: f32,
    /// Available/total memory below which pressure is critical.
    pub memory_critical: f32,
    /// Battery level (0..1) below which pressure is elevated when not charging.
    pub battery_low: f32,
    /// Battery level below which pressure is critical when not charging.
    pub battery_critical: f32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            min_batch_size: 2,
            max_batch_size: 64,
            parallelism: 2,
            min_parallelism: 1,
            max_parallelism: 4,
            item_timeout_ms: 30_000,
            max_attempts: 3,
            retry_backoff_ms: 2_000,
            retry_backoff_max_ms: 60_000,
            checkpoint_items: 32,
            checkpoint_secs: 10,
            memory_elevated: 0.20,
            memory_critical: 0.08,
            battery_low: 0.30,
            battery_critical: 0.10,
        }
    }
}

impl ScanConfig {
    pub fn with_defaults(mut self) -> Self {
        let d = Self::default();
        if self.min_batch_size == 0 {
            self.min_batch_size = d.min_batch_size;
        }
        if self.max_batch_size == 0 {
            self.max_batch_size = d.max_batch_size;
        }
        self.max_batch_size = self.max_batch_size.max(self.min_batch_size);
        if self.batch_size == 0 {
            self.batch_size = d.batch_size;
        }
        self.batch_size = self.batch_size.clamp(self.min_batch_size, self.max_batch_size);

        if self.min_parallelism == 0 {
            self.min_parallelism = d.min_parallelism;
        }
        if self.max_parallelism == 0 {
            self.max_parallelism = d.max_parallelism;
        }
        self.max_parallelism = self.max_parallelism.max(self.min_parallelism);
        if self.parallelism == 0 {
            self.parallelism = d.parallelism;
        }
        self.parallelism = self.parallelism.clamp(self.min_parallelism, self.max_parallelism);

        if self.item_timeout_ms == 0 {
            self.item_timeout_ms = d.item_timeout_ms;
        }
        if self.max_attempts == 0 {
            self.max_attempts = d.max_attempts;
        }
        if self.retry_backoff_ms == 0 {
            self.retry_backoff_ms = d.retry_backoff_ms;
        }
        if self.retry_backoff_max_ms < self.retry_backoff_ms {
            self.retry_backoff_max_ms = self.retry_backoff_ms.max(d.retry_backoff_max_ms);
        }
        if self.checkpoint_items == 0 {
            self.checkpoint_items = d.checkpoint_items;
        }
        if self.checkpoint_secs == 0 {
            self.checkpoint_secs = d.checkpoint_secs;
        }
        if !(self.memory_critical > 0.0 && self.memory_critical < 1.0) {
            self.memory_critical = d.memory_critical;
        }
        if !(self.memory_elevated >= self.memory_critical && self.memory_elevated < 1.0) {
            self.memory_elevated = d.memory_elevated.max(self.memory_critical);
        }
        if !(0.0..1.0).contains(&self.battery_critical) {
            self.battery_critical = d.battery_critical;
        }
        if !(self.battery_low >= self.battery_critical && self.battery_low <= 1.0) {
            self.battery_low = d.battery_low.max(self.battery_critical);
        }
        self
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_secs)
    }

    /// Delay before attempt `attempts + 1`, after `attempts` failures.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(20);
        let ms = self.retry_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.retry_backoff_max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_defaults_clamps() {
        let cfg = ScanConfig {
            batch_size: 500,
            max_batch_size: 32,
            parallelism: 0,
            max_attempts: 0,
            ..ScanConfig::default()
        }
        .with_defaults();
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.parallelism, 2);
        assert_eq!(cfg.max_attempts, 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cfg = ScanConfig {
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 350,
            ..ScanConfig::default()
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(350));
        assert_eq!(cfg.backoff(40), Duration::from_millis(350));
    }
}
