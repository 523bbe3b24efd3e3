//! Configuration types and loading.
//!
//! Every tuned constant in the scoring, memory, and routing logic lives here
//! with a serde-deserializable override path. Nothing in the crate reads a
//! similarity threshold or retry bound from a literal at a call site.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ParallaxError, Result};

/// Embedding parameters for the candidate embedder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Fixed output dimension. Changing this invalidates persisted memory
    /// records, so it is part of the memory store's compatibility contract.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { dimension: 256 }
    }
}

/// Path memory (dead-end dedup) parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Cosine similarity at or above which a candidate is treated as a
    /// duplicate of a recorded dead end.
    pub dedup_similarity: f32,
    /// Optional JSONL file backing the store. In-process only when unset.
    pub store_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dedup_similarity: 0.85,
            store_path: None,
        }
    }
}

/// Pruning evaluator and decision policy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    /// Paths with novelty below this floor are candidates for prune/merge.
    pub novelty_epsilon: f32,
    /// Sibling similarity at or above which two paths are merged.
    pub merge_similarity: f32,
    /// Most recent outputs per path considered when computing novelty.
    pub novelty_window: usize,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            novelty_epsilon: 0.1,
            merge_similarity: 0.95,
            novelty_window: 3,
        }
    }
}

/// Retry and timeout bounds for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Timeout applied to each individual attempt.
    pub step_timeout_ms: u64,
    /// Transient failures are retried up to this many times, so a step
    /// issues at most `max_retries + 1` attempts.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 60_000,
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
        }
    }
}

/// Resource-pressure thresholds for backend routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Normalized CPU load above which the host counts as under pressure.
    pub cpu_pressure: f32,
    /// Normalized memory load above which the host counts as under pressure.
    pub memory_pressure: f32,
    /// Fraction of the token budget below which cheap backends are promoted.
    pub low_budget_fraction: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cpu_pressure: 0.85,
            memory_pressure: 0.9,
            low_budget_fraction: 0.2,
        }
    }
}

/// Default bid scoring weights for the auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctionConfig {
    /// Weight of budget headroom (cost efficiency) in the default bid.
    pub efficiency_weight: f64,
    /// Weight of the specialist's declared confidence in the default bid.
    pub confidence_weight: f64,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            efficiency_weight: 0.4,
            confidence_weight: 0.6,
        }
    }
}

/// Run-level scheduling bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently executing steps within a round.
    pub max_concurrent_steps: usize,
    /// Steps a path must complete before it counts as finished.
    pub steps_per_path: u32,
    /// Rounds allowed when the caller does not supply a round budget.
    pub default_round_budget: u32,
    /// When the round budget expires, close still-active paths that produced
    /// at least one successful step as finished candidates instead of
    /// marking them dead ends.
    pub close_unfinished_on_budget: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 8,
            steps_per_path: 2,
            default_round_budget: 6,
            close_unfinished_on_budget: true,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallaxConfig {
    pub embedding: EmbeddingConfig,
    pub memory: MemoryConfig,
    pub pruning: PruningConfig,
    pub retry: RetryConfig,
    pub router: RouterConfig,
    pub auction: AuctionConfig,
    pub scheduler: SchedulerConfig,
}

impl ParallaxConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any omitted section.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn unit_range(name: &str, value: f32) -> Result<()> {
            if !(0.0..=1.0).contains(&value) {
                return Err(ParallaxError::Config(format!(
                    "{} must be in [0, 1], got {}",
                    name, value
                )));
            }
            Ok(())
        }

        unit_range("memory.dedup_similarity", self.memory.dedup_similarity)?;
        unit_range("pruning.novelty_epsilon", self.pruning.novelty_epsilon)?;
        unit_range("pruning.merge_similarity", self.pruning.merge_similarity)?;
        unit_range("router.cpu_pressure", self.router.cpu_pressure)?;
        unit_range("router.memory_pressure", self.router.memory_pressure)?;
        unit_range("router.low_budget_fraction", self.router.low_budget_fraction)?;

        if self.embedding.dimension == 0 {
            return Err(ParallaxError::Config(
                "embedding.dimension must be positive".into(),
            ));
        }
        if self.pruning.novelty_window == 0 {
            return Err(ParallaxError::Config(
                "pruning.novelty_window must be positive".into(),
            ));
        }
        if self.scheduler.max_concurrent_steps == 0 {
            return Err(ParallaxError::Config(
                "scheduler.max_concurrent_steps must be positive".into(),
            ));
        }
        if self.scheduler.steps_per_path == 0 {
            return Err(ParallaxError::Config(
                "scheduler.steps_per_path must be positive".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ParallaxError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ParallaxConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_similarity() {
        let mut config = ParallaxConfig::default();
        config.memory.dedup_similarity = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_dimension() {
        let mut config = ParallaxConfig::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let raw = r#"
            [pruning]
            novelty_epsilon = 0.2
        "#;
        let config: ParallaxConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.pruning.novelty_epsilon, 0.2);
        assert_eq!(config.pruning.novelty_window, 3);
        assert_eq!(config.memory.dedup_similarity, 0.85);
    }
}
