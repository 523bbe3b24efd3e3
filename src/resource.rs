//! Host resource sampling and token budget tracking.
//!
//! `ResourceMonitor::snapshot` is a cheap sampling call: it reads host load
//! from procfs where available and falls back to the last known snapshot
//! (flagged stale) on any read failure. It never raises and never blocks on
//! anything slower than a small file read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::warn;

/// Immutable point-in-time sample. Each call produces a new value; snapshots
/// are freely shared across paths.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    /// 1-minute load average normalized by core count, clamped to [0, 1].
    pub cpu_load: f32,
    /// Fraction of memory in use, in [0, 1].
    pub memory_load: f32,
    /// Tokens still available to the run.
    pub remaining_budget: u64,
    /// True when the host read failed and cpu/memory carry the last known
    /// values rather than a fresh sample.
    pub stale: bool,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    fn initial(remaining_budget: u64) -> Self {
        Self {
            cpu_load: 0.0,
            memory_load: 0.0,
            remaining_budget,
            stale: false,
            sampled_at: Utc::now(),
        }
    }
}

/// Shared token-spend counter for one run.
///
/// Saturating on both ends: spend past the budget drives `remaining` to zero
/// rather than wrapping.
#[derive(Debug)]
pub struct BudgetTracker {
    budget: u64,
    spent: AtomicU64,
}

impl BudgetTracker {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            spent: AtomicU64::new(0),
        }
    }

    pub fn record_spend(&self, tokens: u64) {
        self.spent.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn spent(&self) -> u64 {
        self.spent.load(Ordering::Relaxed)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.spent())
    }

    pub fn remaining_fraction(&self) -> f32 {
        if self.budget == 0 {
            return 0.0;
        }
        self.remaining() as f32 / self.budget as f32
    }
}

/// Samples process/host load and budget headroom on demand.
pub struct ResourceMonitor {
    budget: Arc<BudgetTracker>,
    last: RwLock<ResourceSnapshot>,
}

impl ResourceMonitor {
    pub fn new(budget: Arc<BudgetTracker>) -> Self {
        let initial = ResourceSnapshot::initial(budget.remaining());
        Self {
            budget,
            last: RwLock::new(initial),
        }
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    /// Take a fresh snapshot. On host read failure the cpu/memory values of
    /// the previous snapshot are reused with `stale = true`; budget headroom
    /// is always current.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let remaining_budget = self.budget.remaining();
        let snapshot = match read_host_load() {
            Some((cpu_load, memory_load)) => ResourceSnapshot {
                cpu_load,
                memory_load,
                remaining_budget,
                stale: false,
                sampled_at: Utc::now(),
            },
            None => {
                let last = self.last.read().clone();
                if !last.stale {
                    warn!("Host load read failed, serving last-known snapshot");
                }
                ResourceSnapshot {
                    remaining_budget,
                    stale: true,
                    sampled_at: Utc::now(),
                    ..last
                }
            }
        };
        *self.last.write() = snapshot.clone();
        snapshot
    }
}

#[cfg(target_os = "linux")]
fn read_host_load() -> Option<(f32, f32)> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let one_minute: f32 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f32;
    let cpu_load = (one_minute / cores).clamp(0.0, 1.0);

    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
        }
    }
    if total_kb == 0 {
        return None;
    }
    let memory_load = (1.0 - available_kb as f32 / total_kb as f32).clamp(0.0, 1.0);
    Some((cpu_load, memory_load))
}

#[cfg(not(target_os = "linux"))]
fn read_host_load() -> Option<(f32, f32)> {
    // No portable cheap sampler on other hosts; the monitor degrades to
    // stale snapshots and budget-only pressure signals.
    None
}
