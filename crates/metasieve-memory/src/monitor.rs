//! Process memory monitoring and strategy selection.

use chrono::Utc;
use metasieve_core::{MemorySnapshot, PressureLevel, Strategy};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Pressure classification thresholds, as percent of total system memory in
/// use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryThresholds {
    /// Used percent at or above which pressure is `Warn`
    pub warn_percent: u8,
    /// Used percent at or above which pressure is `Critical`
    pub critical_percent: u8,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warn_percent: 75,
            critical_percent: 90,
        }
    }
}

impl MemoryThresholds {
    /// Classify pressure from total and available bytes.
    #[must_use]
    pub fn classify(&self, total_bytes: u64, available_bytes: u64) -> PressureLevel {
        if total_bytes == 0 {
            return PressureLevel::Healthy;
        }
        let used = total_bytes.saturating_sub(available_bytes);
        let used_percent = used * 100 / total_bytes;
        if used_percent >= u64::from(self.critical_percent) {
            PressureLevel::Critical
        } else if used_percent >= u64::from(self.warn_percent) {
            PressureLevel::Warn
        } else {
            PressureLevel::Healthy
        }
    }
}

/// Monitors process memory and selects per-job execution strategies.
///
/// Snapshots are recomputed on every call rather than cached, so strategy
/// decisions never act on stale pressure readings.
pub struct MemoryManager {
    thresholds: MemoryThresholds,
    system: Mutex<System>,
    pid: Option<sysinfo::Pid>,
}

impl MemoryManager {
    /// Create a manager with the given thresholds.
    #[must_use]
    pub fn new(thresholds: MemoryThresholds) -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!("cannot resolve own pid, resident readings disabled: {e}"))
            .ok();
        Self {
            thresholds,
            system: Mutex::new(System::new()),
            pid,
        }
    }

    /// Cheap point-in-time read of process and system memory.
    #[must_use]
    pub fn snapshot(&self) -> MemorySnapshot {
        let mut system = self.system.lock().expect("memory monitor lock poisoned");
        system.refresh_memory();

        let resident_bytes = match self.pid {
            Some(pid) => {
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    false,
                    ProcessRefreshKind::nothing().with_memory(),
                );
                system.process(pid).map_or(0, |p| p.memory())
            }
            None => 0,
        };

        let total = system.total_memory();
        let available = system.available_memory();
        let pressure = self.thresholds.classify(total, available);

        MemorySnapshot {
            timestamp: Utc::now(),
            resident_bytes,
            available_bytes: available,
            pressure,
        }
    }

    /// Deterministic strategy selection for one job.
    ///
    /// At least 3x the file size available selects Aggressive, between 1x and
    /// 3x Balanced, anything less Conservative. Critical pressure forces
    /// Conservative regardless of file size.
    #[must_use]
    pub fn select_strategy(&self, file_size: u64, snapshot: &MemorySnapshot) -> Strategy {
        if snapshot.pressure == PressureLevel::Critical {
            debug!(file_size, "critical memory pressure, forcing conservative strategy");
            return Strategy::Conservative;
        }

        let available = snapshot.available_bytes;
        if available >= file_size.saturating_mul(3) {
            Strategy::Aggressive
        } else if available >= file_size {
            Strategy::Balanced
        } else {
            Strategy::Conservative
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemoryThresholds::default())
    }
}
