//! Append-only audit trail for one run.
//!
//! Every step execution, pruning decision, merge, and dead-end mark lands
//! here exactly once, in append order. The event-type set is closed: it is
//! part of the external response contract, and failure detail (retry counts,
//! error classes, degraded-mode flags) rides inside payloads instead of
//! widening it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    StepExecuted,
    PruneSuggested,
    TeamMerged,
    PathMarkedDeadEnd,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepExecuted => "step.executed",
            Self::PruneSuggested => "prune.suggested",
            Self::TeamMerged => "team.merged",
            Self::PathMarkedDeadEnd => "path.dead_end",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Single-writer append log. Concurrent paths append through one mutex so
/// event order matches wall-clock append order.
#[derive(Default)]
pub struct AuditTrail {
    events: Mutex<Vec<AuditEvent>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event_type: AuditEventType, payload: Value) {
        self.events.lock().push(AuditEvent {
            event_type,
            timestamp: Utc::now(),
            payload,
        });
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn count_of(&self, event_type: AuditEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}
