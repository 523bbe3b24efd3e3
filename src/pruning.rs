//! Pruning scores and the continue/merge/prune decision policy.
//!
//! Scoring and policy are deliberately separate: the evaluator produces
//! numbers from path outputs, the policy turns numbers into a decision, and
//! each is testable without the other. The orchestrator owns applying the
//! decision to path state.

use serde::Serialize;

use crate::config::PruningConfig;
use crate::embedding::CandidateEmbedder;

/// Per-path, per-round scores. Ephemeral: recomputed each round and persisted
/// only inside audit event payloads.
#[derive(Debug, Clone, Serialize)]
pub struct PruningScores {
    /// 1 − max cosine similarity against sibling outputs, clamped to [0, 1].
    pub novelty: f32,
    /// Mean first difference of the path's cost deltas; positive means the
    /// path is spending more per round, negative means it is winding down.
    pub growth: f64,
    /// Budget headroom: token budget minus cumulative spend. Negative when
    /// the path is already over budget.
    pub cost_gain: f64,
}

/// The sibling whose latest output is most similar to this path's.
#[derive(Debug, Clone, Serialize)]
pub struct SiblingSimilarity {
    pub path_id: String,
    pub similarity: f32,
}

/// Scores plus the evidence needed for a merge decision.
#[derive(Debug, Clone, Serialize)]
pub struct PathEvaluation {
    pub scores: PruningScores,
    pub nearest_sibling: Option<SiblingSimilarity>,
}

/// Outputs of one sibling path, newest first.
pub struct SiblingOutputs<'a> {
    pub path_id: &'a str,
    pub outputs: Vec<&'a str>,
}

pub struct PruningEvaluator {
    embedder: CandidateEmbedder,
    window: usize,
}

impl PruningEvaluator {
    pub fn new(embedder: CandidateEmbedder, config: &PruningConfig) -> Self {
        Self {
            embedder,
            window: config.novelty_window,
        }
    }

    /// Score one path against its active siblings.
    ///
    /// Novelty compares the path's latest output against each sibling's most
    /// recent `window` outputs. A path with no output yet is maximally novel.
    pub fn score(
        &self,
        this_outputs: &[&str],
        siblings: &[SiblingOutputs<'_>],
        cost_deltas: &[f64],
        token_budget: u64,
        tokens_spent: u64,
    ) -> PathEvaluation {
        let latest = this_outputs.first().copied().unwrap_or("");
        let latest_embedding = self.embedder.embed(latest);

        let mut nearest: Option<SiblingSimilarity> = None;
        if !latest.is_empty() {
            for sibling in siblings {
                for output in sibling.outputs.iter().take(self.window) {
                    let similarity = latest_embedding
                        .cosine_similarity(&self.embedder.embed(output));
                    if nearest.as_ref().map_or(true, |n| similarity > n.similarity) {
                        nearest = Some(SiblingSimilarity {
                            path_id: sibling.path_id.to_string(),
                            similarity,
                        });
                    }
                }
            }
        }

        let max_similarity = nearest.as_ref().map_or(0.0, |n| n.similarity);
        let novelty = (1.0 - max_similarity).clamp(0.0, 1.0);
        let growth = mean_first_difference(cost_deltas);
        let cost_gain = token_budget as f64 - tokens_spent as f64;

        PathEvaluation {
            scores: PruningScores {
                novelty,
                growth,
                cost_gain,
            },
            nearest_sibling: nearest,
        }
    }
}

/// Slope proxy: mean of consecutive differences. Empty or single-element
/// histories have no trend and score 0.
fn mean_first_difference(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let total: f64 = values.windows(2).map(|w| w[1] - w[0]).sum();
    total / (values.len() - 1) as f64
}

/// What the orchestrator should do with a path this round.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Continue,
    Prune,
    MergeInto { canonical: String },
}

/// Threshold policy over pruning scores.
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    novelty_epsilon: f32,
    merge_similarity: f32,
}

impl DecisionPolicy {
    pub fn new(config: &PruningConfig) -> Self {
        Self {
            novelty_epsilon: config.novelty_epsilon,
            merge_similarity: config.merge_similarity,
        }
    }

    pub fn decide(&self, evaluation: &PathEvaluation) -> Decision {
        let scores = &evaluation.scores;
        if scores.novelty >= self.novelty_epsilon {
            return Decision::Continue;
        }

        // Nearly identical to a sibling: fold into it rather than discard.
        if let Some(sibling) = &evaluation.nearest_sibling {
            if sibling.similarity >= self.merge_similarity {
                return Decision::MergeInto {
                    canonical: sibling.path_id.clone(),
                };
            }
        }

        if scores.growth <= 0.0 {
            return Decision::Prune;
        }

        Decision::Continue
    }
}
