//! Resource sampling and adaptive batch planning.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

use crate::config::ScanConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Charge level in `[0, 1]`.
    pub level: f32,
    pub charging: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    pub memory_total: u64,
    pub memory_available: u64,
    /// None on mains-powered machines.
    pub battery: Option<BatteryState>,
}

impl ResourceSample {
    /// Available over total memory; 1.0 when unknown.
    pub fn memory_headroom(&self) -> f32 {
        if self.memory_total == 0 {
            return 1.0;
        }
        (self.memory_available as f64 / self.memory_total as f64) as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    #[default]
    Normal,
    Elevated,
    Critical,
}

impl std::fmt::Display for Pressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Pressure::Normal => "normal",
            Pressure::Elevated => "elevated",
            Pressure::Critical => "critical",
        })
    }
}

pub trait ResourceMonitor: Send + Sync {
    fn sample(&self) -> ResourceSample;

    /// Try to free memory before the next sample.
    fn reclaim(&self) {}
}

type ReclaimHook = Box<dyn Fn() + Send + Sync>;

/// Memory from `sysinfo`; battery state is supplied by the host platform.
pub struct SystemMonitor {
    sys: Mutex<System>,
    battery: RwLock<Option<BatteryState>>,
    hooks: RwLock<Vec<ReclaimHook>>,
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
            battery: RwLock::new(None),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn set_battery(&self, battery: Option<BatteryState>) {
        *self.battery.write() = battery;
    }

    /// Register a cache drop to run on [`ResourceMonitor::reclaim`].
    pub fn on_reclaim(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().push(Box::new(hook));
    }
}

impl ResourceMonitor for SystemMonitor {
    fn sample(&self) -> ResourceSample {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        ResourceSample {
            memory_total: sys.total_memory(),
            memory_available: sys.available_memory(),
            battery: *self.battery.read(),
        }
    }

    fn reclaim(&self) {
        let hooks = self.hooks.read();
        debug!(hooks = hooks.len(), "scan: reclaiming memory");
        for hook in hooks.iter() {
            hook();
        }
    }
}

/// Batch shape for the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: usize,
    pub parallelism: usize,
    pub pressure: Pressure,
}

/// Derives batch size and parallelism from a resource sample: minimum
/// under critical pressure, halved under elevated pressure, maximum while
/// charging, configured values otherwise.
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    cfg: ScanConfig,
}

impl BatchPlanner {
    pub fn new(cfg: ScanConfig) -> Self {
        Self { cfg }
    }

    pub fn pressure(&self, s: &ResourceSample) -> Pressure {
        let headroom = s.memory_headroom();
        let memory = if headroom < self.cfg.memory_critical {
            Pressure::Critical
        } else if headroom < self.cfg.memory_elevated {
            Pressure::Elevated
        } else {
            Pressure::Normal
        };
        let battery = match s.battery {
            Some(b) if !b.charging && b.level < self.cfg.battery_critical => Pressure::Critical,
            Some(b) if !b.charging && b.level < self.cfg.battery_low => Pressure::Elevated,
            _ => Pressure::Normal,
        };
        memory.max(battery)
    }

    pub fn plan(&self, s: &ResourceSample) -> BatchPlan {
        let c = &self.cfg;
        let pressure = self.pressure(s);
        let (batch_size, parallelism) = match pressure {
            Pressure::Critical => (c.min_batch_size, c.min_parallelism),
            Pressure::Elevated => (
                (c.batch_size / 2).max(c.min_batch_size),
                (c.parallelism / 2).max(c.min_parallelism),
            ),
            Pressure::Normal if s.battery.is_some_and(|b| b.charging) => (c.max_batch_size, c.max_parallelism),
            Pressure::Normal => (c.batch_size, c.parallelism),
        };
        BatchPlan {
            batch_size,
            parallelism,
            pressure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(avail: u64, battery: Option<(f32, bool)>) -> ResourceSample {
        ResourceSample {
            memory_total: 100,
            memory_available: avail,
            battery: battery.map(|(level, charging)| BatteryState { level, charging }),
        }
    }

    #[test]
    fn test_plan_scales_with_pressure() {
        let p = BatchPlanner::new(ScanConfig::default().with_defaults());
        let normal = p.plan(&sample(60, None));
        assert_eq!((normal.batch_size, normal.parallelism, normal.pressure), (16, 2, Pressure::Normal));

        let charging = p.plan(&sample(60, Some((0.5, true))));
        assert_eq!((charging.batch_size, charging.parallelism), (64, 4));

        let low_mem = p.plan(&sample(15, Some((0.9, true))));
        assert_eq!((low_mem.batch_size, low_mem.parallelism, low_mem.pressure), (8, 1, Pressure::Elevated));

        let low_battery = p.plan(&sample(60, Some((0.2, false))));
        assert_eq!(low_battery.pressure, Pressure::Elevated);

        let critical = p.plan(&sample(60, Some((0.05, false))));
        assert_eq!((critical.batch_size, critical.parallelism, critical.pressure), (2, 1, Pressure::Critical));
        assert_eq!(p.pressure(&sample(5, None)), Pressure::Critical);
        // A low battery on the charger is fine.
        assert_eq!(p.pressure(&sample(60, Some((0.05, true)))), Pressure::Normal);
    }

    #[test]
    fn test_unknown_memory_is_headroom() {
        assert_eq!(ResourceSample::default().memory_headroom(), 1.0);
    }

    #[test]
    fn test_system_monitor_samples_memory() {
        let m = SystemMonitor::new();
        m.set_battery(Some(BatteryState { level: 0.5, charging: false }));
        let s = m.sample();
        assert!(s.memory_total >= s.memory_available);
        assert_eq!(s.battery.map(|b| b.level), Some(0.5));

        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let h = hits.clone();
        m.on_reclaim(move || {
            h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        m.reclaim();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
