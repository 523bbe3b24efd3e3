//! Resource-aware backend routing.
//!
//! A stateless reordering of a specialist's declared backend preference list:
//! under host or budget pressure, local/cheap backends move ahead of remote
//! ones; under normal load the declared order passes through untouched.

use std::sync::Arc;

use tracing::debug;

use crate::backend::BackendRegistry;
use crate::config::RouterConfig;
use crate::resource::ResourceSnapshot;
use crate::specialist::Specialist;

pub struct ResourceAwareRouter {
    registry: Arc<BackendRegistry>,
    config: RouterConfig,
}

impl ResourceAwareRouter {
    pub fn new(registry: Arc<BackendRegistry>, config: RouterConfig) -> Self {
        Self { registry, config }
    }

    fn under_pressure(&self, snapshot: &ResourceSnapshot, remaining_fraction: f32) -> bool {
        snapshot.cpu_load > self.config.cpu_pressure
            || snapshot.memory_load > self.config.memory_pressure
            || remaining_fraction < self.config.low_budget_fraction
    }

    /// Rank a specialist's backends for the next step.
    ///
    /// The reorder is a stable partition: cheap backends keep their declared
    /// relative order, as do expensive ones. Backends without a registered
    /// profile are treated as expensive.
    pub fn rank(
        &self,
        specialist: &Specialist,
        snapshot: &ResourceSnapshot,
        remaining_fraction: f32,
    ) -> Vec<String> {
        let declared = specialist.preferred_backends.clone();
        if !self.under_pressure(snapshot, remaining_fraction) {
            return declared;
        }

        let (cheap, expensive): (Vec<String>, Vec<String>) =
            declared.into_iter().partition(|id| {
                self.registry
                    .profile(id)
                    .map(|p| p.is_cheap())
                    .unwrap_or(false)
            });

        debug!(
            specialist = %specialist.id,
            cpu = snapshot.cpu_load,
            memory = snapshot.memory_load,
            budget_fraction = remaining_fraction,
            promoted = cheap.len(),
            "Promoting cheap backends under resource pressure"
        );

        cheap.into_iter().chain(expensive).collect()
    }
}
