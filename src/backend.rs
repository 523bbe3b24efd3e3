//! Backend boundary: the narrow request/response interface to language
//! generation providers.
//!
//! Backends are external collaborators. The orchestrator only ever sees this
//! trait plus a per-backend profile used for resource-aware routing; provider
//! internals (HTTP clients, local processes) live behind implementations
//! supplied by the caller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, ParallaxError, Result};

/// Response to a single generation request.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    /// Estimated tokens consumed by the request, for budget accounting.
    pub tokens_spent: u64,
}

/// A language-generation backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
    ) -> std::result::Result<Generation, BackendError>;

    /// Provider-facing batch surface. The orchestrator coalesces identical
    /// step requests upstream and issues one `generate` per distinct prompt,
    /// so this exists for callers driving a backend directly and for
    /// providers with a native batch endpoint, which should override the
    /// sequential default.
    async fn generate_batch(
        &self,
        model_id: &str,
        prompts: &[String],
    ) -> std::result::Result<Vec<Generation>, BackendError> {
        let mut results = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            results.push(self.generate(model_id, prompt).await?);
        }
        Ok(results)
    }
}

/// Cost class used by the resource-aware router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    /// In-process or on-host; cheap to call, preferred under pressure.
    Local,
    /// Remote API; higher cost and latency.
    Remote,
}

/// Static routing metadata for a registered backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendProfile {
    pub id: String,
    pub tier: BackendTier,
    /// Default model invoked when a specialist does not pin one.
    pub default_model: String,
    /// Relative cost weight; used only for ordering within a tier.
    pub cost_weight: f32,
}

impl BackendProfile {
    pub fn new(id: impl Into<String>, tier: BackendTier, default_model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier,
            default_model: default_model.into(),
            cost_weight: match tier {
                BackendTier::Local => 1.0,
                BackendTier::Remote => 10.0,
            },
        }
    }

    pub fn with_cost_weight(mut self, weight: f32) -> Self {
        self.cost_weight = weight;
        self
    }

    pub fn is_cheap(&self) -> bool {
        self.tier == BackendTier::Local
    }
}

struct Registered {
    profile: BackendProfile,
    handle: Arc<dyn Backend>,
}

/// Registry mapping backend ids to handles and routing profiles.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Registered>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, profile: BackendProfile, handle: Arc<dyn Backend>) {
        let id = profile.id.clone();
        let replaced = self
            .backends
            .write()
            .insert(id.clone(), Registered { profile, handle })
            .is_some();
        if replaced {
            tracing::warn!(backend = %id, "Backend re-registered, replacing previous handle");
        } else {
            tracing::debug!(backend = %id, "Backend registered");
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .read()
            .get(id)
            .map(|r| Arc::clone(&r.handle))
            .ok_or_else(|| ParallaxError::UnknownBackend(id.to_string()))
    }

    pub fn profile(&self, id: &str) -> Option<BackendProfile> {
        self.backends.read().get(id).map(|r| r.profile.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }
}
