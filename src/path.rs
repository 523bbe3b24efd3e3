//! Exploration paths, step results, and path signatures.
//!
//! A path ("team") is one strategy branch pursuing the objective. Its state
//! transitions are one-directional: once a path leaves `Active` it never
//! returns, and only the orchestrator performs transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ParallaxError, Result};

/// Stable digest identifying an attempt, computed from the ordered set of
/// specialist ids, backend ids, and declared dependencies. Two paths with
/// equal signatures are the same attempt regardless of literal output text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSignature(String);

impl PathSignature {
    pub fn compute(specialists: &[String], backends: &[String], dependencies: &[String]) -> Self {
        let mut hasher = Sha256::new();
        // Section tags keep ["a","b"]+[] distinct from ["a"]+["b"].
        for (tag, items) in [
            ("specialists", specialists),
            ("backends", backends),
            ("dependencies", dependencies),
        ] {
            hasher.update(tag.as_bytes());
            hasher.update([0u8]);
            for item in items {
                hasher.update(item.as_bytes());
                hasher.update([0u8]);
            }
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PathSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// Terminal status of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Timeout,
    Error,
}

/// One attempt within a step, including failed ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub number: u32,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

/// One executed unit of work. Immutable once finalized; owned by the
/// orchestrator that created it and appended to the run's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub specialist_id: String,
    pub backend_id: String,
    pub input: String,
    /// Empty on failure.
    pub output: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub retries: u32,
    pub attempts: Vec<AttemptRecord>,
    /// Estimated tokens spent across all attempts.
    pub tokens_spent: u64,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Ok
    }

    pub fn latency_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Lifecycle of an exploration path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathState {
    Active,
    Pruned,
    MergedInto { canonical: String },
    DeadEnd,
    Finished,
}

impl PathState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pruned => "pruned",
            Self::MergedInto { .. } => "merged",
            Self::DeadEnd => "dead_end",
            Self::Finished => "finished",
        }
    }
}

/// One exploration branch: an ordered sequence of step results plus the
/// derived signature and lifecycle state.
#[derive(Debug, Clone)]
pub struct ExplorationPath {
    pub id: String,
    pub specialist_id: String,
    pub backend_ids: Vec<String>,
    pub dependencies: Vec<String>,
    pub signature: PathSignature,
    pub state: PathState,
    pub steps: Vec<StepResult>,
    /// Cumulative token/time spend deltas per round, for growth scoring.
    pub cost_deltas: Vec<f64>,
    pub created_at: DateTime<Utc>,
}

impl ExplorationPath {
    pub fn new(
        specialist_id: impl Into<String>,
        backend_ids: Vec<String>,
        dependencies: Vec<String>,
    ) -> Self {
        let specialist_id = specialist_id.into();
        let signature = PathSignature::compute(
            std::slice::from_ref(&specialist_id),
            &backend_ids,
            &dependencies,
        );
        Self {
            id: format!("path-{}", Uuid::new_v4()),
            specialist_id,
            backend_ids,
            dependencies,
            signature,
            state: PathState::Active,
            steps: Vec::new(),
            cost_deltas: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == PathState::Active
    }

    /// Latest successful output, if any.
    pub fn latest_output(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.succeeded())
            .map(|s| s.output.as_str())
    }

    /// Most recent successful outputs, newest first, capped at `window`.
    pub fn recent_outputs(&self, window: usize) -> Vec<&str> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.succeeded())
            .take(window)
            .map(|s| s.output.as_str())
            .collect()
    }

    pub fn completed_steps(&self) -> u32 {
        self.steps.iter().filter(|s| s.succeeded()).count() as u32
    }

    pub fn tokens_spent(&self) -> u64 {
        self.steps.iter().map(|s| s.tokens_spent).sum()
    }

    pub fn record_step(&mut self, step: StepResult) {
        self.cost_deltas.push(step.tokens_spent as f64);
        self.steps.push(step);
    }

    /// One-directional transition out of `Active`. Transitioning a path that
    /// already reached a terminal state is a bug in the caller.
    pub fn transition(&mut self, next: PathState) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ParallaxError::InvalidPathTransition {
                from: self.state.label().to_string(),
                to: next.label().to_string(),
            });
        }
        if next == PathState::Active {
            return Err(ParallaxError::InvalidPathTransition {
                from: self.state.label().to_string(),
                to: "active".to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// A finished path's terminal output, eligible for the final auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub path_id: String,
    pub specialist_id: String,
    pub output: String,
    pub tokens_spent: u64,
    /// Estimated utility; set by the caller's scorer or the default
    /// heuristic before the auction runs.
    pub bid: f64,
}
