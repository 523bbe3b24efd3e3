//! Path memory: similarity-guided dead-end deduplication.
//!
//! Stores a signature-keyed record for every path the orchestrator has seen
//! finish or die, and blocks new paths that are near-duplicates of recorded
//! dead ends. Records are append-only; the newest record per signature wins.
//!
//! Failure mode is fail-open: a broken store degrades `check` to "allow" with
//! a warning, because blocking exploration on a memory outage costs more than
//! occasionally repeating a dead end.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::embedding::Embedding;
use crate::path::PathSignature;

/// Outcome label for a recorded path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Positive,
    Negative,
}

/// One remembered path attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMemoryRecord {
    pub signature: PathSignature,
    pub embedding: Embedding,
    pub outcome: Outcome,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

/// Result of a pre-start memory check.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCheck {
    pub allow: bool,
    /// Highest cosine similarity against any negative record, if one exists.
    pub nearest_negative_similarity: Option<f32>,
    /// True when the backing store failed and the check fell back to the
    /// in-process view only.
    pub degraded: bool,
}

pub struct PathMemory {
    records: DashMap<String, PathMemoryRecord>,
    dedup_similarity: f32,
    store_path: Option<PathBuf>,
    degraded: AtomicBool,
}

impl PathMemory {
    /// Open the memory store. When a store path is configured, existing
    /// records are loaded; unreadable files or corrupt lines degrade the
    /// store rather than failing the caller.
    pub async fn open(config: &MemoryConfig) -> Self {
        let memory = Self {
            records: DashMap::new(),
            dedup_similarity: config.dedup_similarity,
            store_path: config.store_path.clone(),
            degraded: AtomicBool::new(false),
        };

        if let Some(path) = &memory.store_path {
            match fs::read_to_string(path).await {
                Ok(raw) => {
                    let mut loaded = 0usize;
                    let mut skipped = 0usize;
                    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                        match serde_json::from_str::<PathMemoryRecord>(line) {
                            Ok(record) => {
                                // File order is append order, so the last
                                // occurrence per signature wins.
                                memory
                                    .records
                                    .insert(record.signature.as_str().to_string(), record);
                                loaded += 1;
                            }
                            Err(e) => {
                                skipped += 1;
                                debug!(error = %e, "Skipping corrupt memory record");
                            }
                        }
                    }
                    if skipped > 0 {
                        warn!(loaded, skipped, "Memory store loaded with corrupt lines");
                    } else {
                        debug!(loaded, "Memory store loaded");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Memory store does not exist yet");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Memory store unreadable, running degraded");
                    memory.degraded.store(true, Ordering::Relaxed);
                }
            }
        }

        memory
    }

    /// In-process store with no persistence, used by tests and callers that
    /// do not need cross-run memory.
    pub fn ephemeral(dedup_similarity: f32) -> Self {
        Self {
            records: DashMap::new(),
            dedup_similarity,
            store_path: None,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, signature: &PathSignature) -> Option<PathMemoryRecord> {
        self.records.get(signature.as_str()).map(|r| r.clone())
    }

    /// Pure read: decide whether a candidate attempt may start.
    ///
    /// Denies when the signature exactly matches a negative record, or when
    /// any negative record's embedding is within the dedup similarity
    /// threshold of the candidate embedding.
    pub fn check(&self, signature: &PathSignature, embedding: &Embedding) -> MemoryCheck {
        let degraded = self.is_degraded();

        if let Some(record) = self.records.get(signature.as_str()) {
            if record.outcome == Outcome::Negative {
                return MemoryCheck {
                    allow: false,
                    nearest_negative_similarity: Some(1.0),
                    degraded,
                };
            }
        }

        let mut nearest: Option<f32> = None;
        for record in self.records.iter() {
            if record.outcome != Outcome::Negative {
                continue;
            }
            let similarity = embedding.cosine_similarity(&record.embedding);
            if nearest.map_or(true, |n| similarity > n) {
                nearest = Some(similarity);
            }
        }

        let allow = nearest.map_or(true, |n| n < self.dedup_similarity);
        MemoryCheck {
            allow,
            nearest_negative_similarity: nearest,
            degraded,
        }
    }

    /// Append or supersede the record for a signature. Concurrent recorders
    /// for distinct signatures never contend; recorders for the same
    /// signature serialize on the map entry, last write winning.
    pub async fn record(
        &self,
        signature: PathSignature,
        embedding: Embedding,
        outcome: Outcome,
        metadata: HashMap<String, String>,
    ) {
        let record = PathMemoryRecord {
            signature: signature.clone(),
            embedding,
            outcome,
            metadata,
            recorded_at: Utc::now(),
        };

        self.records
            .insert(signature.as_str().to_string(), record.clone());

        if let Some(path) = &self.store_path {
            if let Err(e) = append_record(path, &record).await {
                warn!(path = %path.display(), error = %e, "Memory store append failed, running degraded");
                self.degraded.store(true, Ordering::Relaxed);
            }
        }

        debug!(signature = %signature, outcome = ?outcome, "Path outcome recorded");
    }
}

async fn append_record(path: &PathBuf, record: &PathMemoryRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}
