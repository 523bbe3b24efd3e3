//! Specialist registry and objective matching.
//!
//! Specialists are configuration data: a named capability variant with an
//! ordered backend preference list and declared strengths. The set is closed
//! but extensible — new specialists register at startup and the orchestrator
//! dispatches purely by capability tag and id, never by concrete kind.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ParallaxError, Result};

/// A named capability variant, immutable at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specialist {
    pub id: String,
    /// Capability tags used for dispatch (e.g. "review", "security").
    pub capabilities: Vec<String>,
    /// Declared strengths matched against the objective text.
    pub strengths: Vec<String>,
    /// Ordered list of acceptable backend ids, most preferred first.
    pub preferred_backends: Vec<String>,
    /// Declared confidence in [0, 1], feeding the default auction bid.
    pub confidence: f64,
}

impl Specialist {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
            strengths: Vec::new(),
            preferred_backends: Vec::new(),
            confidence: 0.5,
        }
    }

    pub fn with_capabilities(mut self, tags: &[&str]) -> Self {
        self.capabilities = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_strengths(mut self, strengths: &[&str]) -> Self {
        self.strengths = strengths.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_backends(mut self, backends: &[&str]) -> Self {
        self.preferred_backends = backends.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }

    /// Keyword-overlap score against the objective text.
    fn match_score(&self, objective: &str) -> usize {
        let lowered = objective.to_lowercase();
        self.strengths
            .iter()
            .chain(self.capabilities.iter())
            .filter(|term| lowered.contains(&term.to_lowercase()))
            .count()
    }
}

/// Registry of specialists, loaded once at startup.
#[derive(Default)]
pub struct SpecialistRegistry {
    specialists: RwLock<HashMap<String, Arc<Specialist>>>,
}

impl SpecialistRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, specialist: Specialist) -> Result<()> {
        if specialist.preferred_backends.is_empty() {
            return Err(ParallaxError::Config(format!(
                "specialist '{}' declares no backends",
                specialist.id
            )));
        }
        let id = specialist.id.clone();
        self.specialists
            .write()
            .insert(id.clone(), Arc::new(specialist));
        debug!(specialist = %id, "Specialist registered");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<Specialist>> {
        self.specialists
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ParallaxError::UnknownSpecialist(id.to_string()))
    }

    pub fn by_capability(&self, tag: &str) -> Vec<Arc<Specialist>> {
        let mut matched: Vec<_> = self
            .specialists
            .read()
            .values()
            .filter(|s| s.has_capability(tag))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    pub fn len(&self) -> usize {
        self.specialists.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.specialists.read().is_empty()
    }

    /// Select specialists for an objective. Explicit hints win; otherwise
    /// every specialist whose declared strengths overlap the objective is
    /// chosen, best match first, falling back to all registered specialists
    /// when nothing overlaps.
    pub fn match_objective(
        &self,
        objective: &str,
        hints: Option<&[String]>,
    ) -> Result<Vec<Arc<Specialist>>> {
        if let Some(hints) = hints {
            if !hints.is_empty() {
                return hints.iter().map(|id| self.get(id)).collect();
            }
        }

        let specialists = self.specialists.read();
        if specialists.is_empty() {
            return Err(ParallaxError::NoSpecialistMatch(objective.to_string()));
        }

        let mut scored: Vec<(usize, Arc<Specialist>)> = specialists
            .values()
            .map(|s| (s.match_score(objective), Arc::clone(s)))
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| a.id.cmp(&b.id)));

        let any_overlap = scored.first().is_some_and(|(score, _)| *score > 0);
        let selected: Vec<_> = if any_overlap {
            scored
                .into_iter()
                .filter(|(score, _)| *score > 0)
                .map(|(_, s)| s)
                .collect()
        } else {
            // No strength overlap: fan out to everyone rather than guessing.
            scored.into_iter().map(|(_, s)| s).collect()
        };

        debug!(
            count = selected.len(),
            matched = any_overlap,
            "Specialists selected for objective"
        );
        Ok(selected)
    }
}
