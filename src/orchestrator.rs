//! Run orchestration: fan-out across specialist paths, round-barrier
//! pruning, dead-end memory, and auction convergence.
//!
//! A run moves through `planning -> exploring -> converging -> done`. The
//! unit of concurrency is the path: within a round every active path takes
//! exactly one step, identical (backend, specialist, prompt) calls are
//! coalesced into one backend invocation, and the round barrier guarantees
//! pruning decisions always compare complete sibling outputs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType, AuditTrail};
use crate::auction::{AuctionSynthesizer, Bid, BidScorer};
use crate::backend::BackendRegistry;
use crate::config::ParallaxConfig;
use crate::embedding::CandidateEmbedder;
use crate::error::Result;
use crate::executor::StepExecutor;
use crate::memory::{MemoryCheck, Outcome, PathMemory};
use crate::path::{Candidate, ExplorationPath, PathState, StepResult};
use crate::pruning::{Decision, DecisionPolicy, PruningEvaluator, SiblingOutputs};
use crate::resource::{BudgetTracker, ResourceMonitor};
use crate::router::ResourceAwareRouter;
use crate::specialist::{Specialist, SpecialistRegistry};

/// How planned paths relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPattern {
    /// Independent paths run concurrently, no ordering between them.
    #[default]
    Parallel,
    /// Each path's final output feeds the next path's input.
    Sequential,
    /// Subordinate paths run in parallel; a coordinating path consumes
    /// their outputs once all subordinates are terminal.
    Hierarchical,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub objective: String,
    pub context: HashMap<String, String>,
    pub specialist_hints: Option<Vec<String>>,
    pub token_budget: u64,
    /// Falls back to the scheduler default when unset.
    pub round_budget: Option<u32>,
    pub pattern: ExecutionPattern,
}

impl RunRequest {
    pub fn new(objective: impl Into<String>, token_budget: u64) -> Self {
        Self {
            objective: objective.into(),
            context: HashMap::new(),
            specialist_hints: None,
            token_budget,
            round_budget: None,
            pattern: ExecutionPattern::Parallel,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.specialist_hints = Some(hints);
        self
    }

    pub fn with_round_budget(mut self, rounds: u32) -> Self {
        self.round_budget = Some(rounds);
        self
    }

    pub fn with_pattern(mut self, pattern: ExecutionPattern) -> Self {
        self.pattern = pattern;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    NoViableResult,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub status: RunStatus,
    /// Present only when the run completed.
    pub winning_output: Option<String>,
    pub clearing_price: f64,
    /// All auction bids, highest first. Empty when no candidate finished.
    pub bids: Vec<Bid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub audit_trail: Vec<AuditEvent>,
}

/// Deterministic first-step prompt for a path. Exposed so callers seeding
/// path memory can compute the same embedding the orchestrator will check.
pub fn seed_prompt(request: &RunRequest, specialist: &Specialist) -> String {
    build_prompt(request, specialist, None)
}

fn build_prompt(request: &RunRequest, specialist: &Specialist, prior: Option<&str>) -> String {
    let mut prompt = format!("Objective: {}\n", request.objective);
    let mut keys: Vec<_> = request.context.keys().collect();
    keys.sort();
    for key in keys {
        prompt.push_str(&format!("Context {}: {}\n", key, request.context[key]));
    }
    prompt.push_str(&format!(
        "Specialist: {} ({})\n",
        specialist.id,
        specialist.strengths.join(", ")
    ));
    if let Some(prior) = prior {
        prompt.push_str(&format!("Prior output:\n{}\n", prior));
    }
    prompt
}

/// Per-run mutable state threaded through the phases.
struct Run {
    id: String,
    request: RunRequest,
    paths: Vec<ExplorationPath>,
    /// Backends that already failed per path; excluded from future rounds.
    failed_backends: HashMap<String, HashSet<String>>,
    budget: Arc<BudgetTracker>,
    monitor: ResourceMonitor,
    trail: AuditTrail,
    rounds_used: u32,
    round_budget: u32,
    /// Set when the round budget expired with paths still active.
    forced_convergence: bool,
}

pub struct Orchestrator {
    config: ParallaxConfig,
    specialists: Arc<SpecialistRegistry>,
    backends: Arc<BackendRegistry>,
    memory: Arc<PathMemory>,
    embedder: CandidateEmbedder,
    bid_scorer: Option<Box<BidScorer>>,
}

impl Orchestrator {
    pub fn new(
        config: ParallaxConfig,
        specialists: Arc<SpecialistRegistry>,
        backends: Arc<BackendRegistry>,
        memory: Arc<PathMemory>,
    ) -> Self {
        let embedder = CandidateEmbedder::new(config.embedding.dimension);
        Self {
            config,
            specialists,
            backends,
            memory,
            embedder,
            bid_scorer: None,
        }
    }

    /// Install a caller-supplied utility estimator for auction bids.
    pub fn with_bid_scorer(mut self, scorer: Box<BidScorer>) -> Self {
        self.bid_scorer = Some(scorer);
        self
    }

    /// Execute one full run. A single path failing never fails the run; the
    /// run degrades to `no_viable_result` only when zero paths finish.
    pub async fn run(&self, request: RunRequest) -> Result<RunResponse> {
        let budget = Arc::new(BudgetTracker::new(request.token_budget));
        let round_budget = request
            .round_budget
            .unwrap_or(self.config.scheduler.default_round_budget);
        let mut run = Run {
            id: format!("run-{}", Uuid::new_v4()),
            paths: Vec::new(),
            failed_backends: HashMap::new(),
            monitor: ResourceMonitor::new(Arc::clone(&budget)),
            budget,
            trail: AuditTrail::new(),
            rounds_used: 0,
            round_budget,
            forced_convergence: false,
            request,
        };

        info!(run = %run.id, pattern = ?run.request.pattern, "Run planning");
        let specialists = self.plan(&mut run)?;

        info!(run = %run.id, paths = run.paths.len(), "Run exploring");
        match run.request.pattern {
            ExecutionPattern::Parallel => self.explore_parallel(&mut run, &specialists).await?,
            ExecutionPattern::Sequential => self.explore_sequential(&mut run, &specialists).await?,
            ExecutionPattern::Hierarchical => {
                self.explore_hierarchical(&mut run, &specialists).await?
            }
        }

        info!(run = %run.id, "Run converging");
        let candidates = self.converge(&mut run, &specialists).await;

        let response = self.settle(&run, candidates);
        info!(run = %run.id, status = ?response.status, "Run done");
        Ok(response)
    }

    /// Decompose the objective into one path per matched specialist, then
    /// short-circuit any path the memory recognizes as a known dead end
    /// before a single step is spent on it.
    fn plan(&self, run: &mut Run) -> Result<Vec<Arc<Specialist>>> {
        let specialists = self.specialists.match_objective(
            &run.request.objective,
            run.request.specialist_hints.as_deref(),
        )?;

        for (index, specialist) in specialists.iter().enumerate() {
            let dependencies = match run.request.pattern {
                ExecutionPattern::Parallel => Vec::new(),
                ExecutionPattern::Sequential => {
                    // Each path depends on its predecessor's output.
                    specialists[..index].iter().map(|s| s.id.clone()).collect()
                }
                ExecutionPattern::Hierarchical => {
                    if index == 0 && specialists.len() > 1 {
                        // Coordinator consumes every subordinate.
                        specialists[1..].iter().map(|s| s.id.clone()).collect()
                    } else {
                        Vec::new()
                    }
                }
            };
            let mut path = ExplorationPath::new(
                specialist.id.clone(),
                specialist.preferred_backends.clone(),
                dependencies,
            );

            let seed = seed_prompt(&run.request, specialist);
            let check = self.memory.check(&path.signature, &self.embedder.embed(&seed));
            if !self.admit(run, &mut path, &check) {
                run.paths.push(path);
                continue;
            }

            debug!(path = %path.id, specialist = %specialist.id, "Path admitted");
            run.paths.push(path);
        }

        Ok(specialists)
    }

    /// Apply a memory check to a not-yet-started path. Returns false when
    /// the path was short-circuited as a dead end.
    fn admit(&self, run: &Run, path: &mut ExplorationPath, check: &MemoryCheck) -> bool {
        if check.degraded {
            warn!(path = %path.id, "Memory check degraded, allowing path");
        }
        if check.allow {
            return true;
        }

        // Known dead end: never spend execution budget on it.
        let _ = path.transition(PathState::DeadEnd);
        run.trail.append(
            AuditEventType::PathMarkedDeadEnd,
            json!({
                "path_id": path.id,
                "specialist_id": path.specialist_id,
                "reason": "memory_duplicate",
                "nearest_negative_similarity": check.nearest_negative_similarity,
                "memory_degraded": check.degraded,
            }),
        );
        info!(
            path = %path.id,
            similarity = ?check.nearest_negative_similarity,
            "Path short-circuited by dead-end memory"
        );
        false
    }

    async fn explore_parallel(
        &self,
        run: &mut Run,
        specialists: &[Arc<Specialist>],
    ) -> Result<()> {
        let evaluator = PruningEvaluator::new(self.embedder.clone(), &self.config.pruning);
        let policy = DecisionPolicy::new(&self.config.pruning);

        while run.rounds_used < run.round_budget && run.paths.iter().any(|p| p.is_active()) {
            run.rounds_used += 1;
            debug!(round = run.rounds_used, "Round start");

            self.execute_round(run, specialists, None).await?;
            self.finish_completed_paths(run);
            self.apply_round_decisions(run, &evaluator, &policy);
        }

        self.force_convergence(run);
        Ok(())
    }

    /// Paths run one at a time, each receiving the previous path's final
    /// output as input. Pruning against siblings does not apply — there is
    /// never more than one path exploring at once.
    async fn explore_sequential(
        &self,
        run: &mut Run,
        specialists: &[Arc<Specialist>],
    ) -> Result<()> {
        let mut carried: Option<String> = None;

        for index in 0..run.paths.len() {
            let path_id = run.paths[index].id.clone();
            while run.rounds_used < run.round_budget
                && run.paths[index].is_active()
            {
                run.rounds_used += 1;
                self.execute_round(run, specialists, Some((&path_id, carried.as_deref())))
                    .await?;
                self.finish_completed_paths(run);
            }
            if let Some(output) = run.paths[index].latest_output() {
                carried = Some(output.to_string());
            }
        }

        self.force_convergence(run);
        Ok(())
    }

    /// Subordinates explore in parallel first; the coordinator then runs
    /// with every subordinate's final output folded into its input.
    async fn explore_hierarchical(
        &self,
        run: &mut Run,
        specialists: &[Arc<Specialist>],
    ) -> Result<()> {
        if run.paths.len() < 2 {
            return self.explore_parallel(run, specialists).await;
        }

        let evaluator = PruningEvaluator::new(self.embedder.clone(), &self.config.pruning);
        let policy = DecisionPolicy::new(&self.config.pruning);
        let coordinator_id = run.paths[0].id.clone();

        // Phase 1: subordinates only.
        while run.rounds_used < run.round_budget
            && run.paths.iter().skip(1).any(|p| p.is_active())
        {
            run.rounds_used += 1;
            self.execute_round(run, specialists, Some(("!subordinates", None)))
                .await?;
            self.finish_completed_paths(run);
            self.apply_round_decisions(run, &evaluator, &policy);
        }

        // Phase 2: coordinator consumes subordinate outputs.
        let gathered: Vec<String> = run
            .paths
            .iter()
            .skip(1)
            .filter(|p| p.state == PathState::Finished)
            .filter_map(|p| p.latest_output().map(|o| format!("[{}] {}", p.specialist_id, o)))
            .collect();
        let digest = gathered.join("\n");

        while run.rounds_used < run.round_budget && run.paths[0].is_active() {
            run.rounds_used += 1;
            self.execute_round(run, specialists, Some((&coordinator_id, Some(&digest))))
                .await?;
            self.finish_completed_paths(run);
        }

        self.force_convergence(run);
        Ok(())
    }

    /// Execute one step for every eligible active path, coalescing identical
    /// (backend, specialist, prompt) triples into a single backend call.
    ///
    /// `focus` restricts the round: `Some((path_id, carried))` runs only that
    /// path with `carried` folded into its prompt, and the sentinel
    /// `"!subordinates"` runs every path except the first.
    async fn execute_round(
        &self,
        run: &mut Run,
        specialists: &[Arc<Specialist>],
        focus: Option<(&str, Option<&str>)>,
    ) -> Result<()> {
        let executor = StepExecutor::new(Arc::clone(&self.backends), Arc::clone(&run.budget));
        let router = ResourceAwareRouter::new(Arc::clone(&self.backends), self.config.router.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.scheduler.max_concurrent_steps));
        let snapshot = run.monitor.snapshot();
        let remaining_fraction = run.budget.remaining_fraction();

        // Plan work for this round.
        struct Work {
            path_index: usize,
            specialist_id: String,
            backend_id: String,
            prompt: String,
        }
        let mut work: Vec<Work> = Vec::new();
        let mut dead: Vec<usize> = Vec::new();

        for (path_index, path) in run.paths.iter().enumerate() {
            if !path.is_active() {
                continue;
            }
            let carried = match focus {
                Some(("!subordinates", _)) if path_index == 0 => continue,
                Some(("!subordinates", _)) => None,
                Some((id, carried)) if id == path.id => carried,
                Some(_) => continue,
                None => None,
            };

            let specialist = match specialists.iter().find(|s| s.id == path.specialist_id) {
                Some(s) => Arc::clone(s),
                None => continue,
            };

            let failed = run.failed_backends.entry(path.id.clone()).or_default();
            let ranked: Vec<String> = router
                .rank(&specialist, &snapshot, remaining_fraction)
                .into_iter()
                .filter(|b| self.backends.contains(b) && !failed.contains(b))
                .collect();

            let Some(backend_id) = ranked.first().cloned() else {
                dead.push(path_index);
                continue;
            };

            // Later steps consume the path's own earlier outputs; carried
            // context only seeds the first step.
            let prior = path.latest_output().or(carried);
            let prompt = build_prompt(&run.request, &specialist, prior);
            work.push(Work {
                path_index,
                specialist_id: specialist.id.clone(),
                backend_id,
                prompt,
            });
        }

        for path_index in dead {
            let path = &mut run.paths[path_index];
            let _ = path.transition(PathState::DeadEnd);
            run.trail.append(
                AuditEventType::PathMarkedDeadEnd,
                json!({
                    "path_id": path.id,
                    "specialist_id": path.specialist_id,
                    "reason": "no_usable_backend",
                }),
            );
        }

        // Coalesce identical calls: one backend invocation per distinct
        // (backend, specialist, prompt) triple.
        let mut groups: HashMap<(String, String, String), Vec<usize>> = HashMap::new();
        for (work_index, item) in work.iter().enumerate() {
            groups
                .entry((
                    item.backend_id.clone(),
                    item.specialist_id.clone(),
                    item.prompt.clone(),
                ))
                .or_default()
                .push(work_index);
        }

        let futures: Vec<_> = groups
            .into_iter()
            .map(|((backend_id, specialist_id, prompt), members)| {
                let executor = &executor;
                let semaphore = Arc::clone(&semaphore);
                let retry = &self.config.retry;
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");
                    let step = executor
                        .execute(&specialist_id, &backend_id, &prompt, retry)
                        .await;
                    (members, step)
                }
            })
            .collect();

        let outcomes = join_all(futures).await;

        for (members, step) in outcomes {
            let batched = members.len() > 1;
            for member in members {
                let path_index = work[member].path_index;
                let step = match &step {
                    Ok(step) => {
                        // Each requesting path owns an independent copy of a
                        // coalesced result; only the id is re-minted.
                        let mut copy = step.clone();
                        if batched {
                            copy.step_id = format!("step-{}", Uuid::new_v4());
                        }
                        copy
                    }
                    Err(e) => {
                        // Configuration-level failure (unknown backend):
                        // treat as a failed backend for this path.
                        warn!(error = %e, "Step dispatch failed");
                        continue;
                    }
                };
                self.record_step(run, path_index, step, batched);
            }
        }

        Ok(())
    }

    fn record_step(&self, run: &mut Run, path_index: usize, step: StepResult, batched: bool) {
        let path = &mut run.paths[path_index];
        run.trail.append(
            AuditEventType::StepExecuted,
            json!({
                "path_id": path.id,
                "step_id": step.step_id,
                "specialist_id": step.specialist_id,
                "backend_id": step.backend_id,
                "status": step.status,
                "retries": step.retries,
                "attempts": step.attempts,
                "latency_ms": step.latency_ms(),
                "tokens_spent": step.tokens_spent,
                "batched": batched,
            }),
        );

        let succeeded = step.succeeded();
        let backend_id = step.backend_id.clone();
        path.record_step(step);

        if !succeeded {
            let failed = run
                .failed_backends
                .entry(path.id.clone())
                .or_default();
            failed.insert(backend_id);

            // Path-fatal only when no alternative backend remains.
            let has_alternative = path
                .backend_ids
                .iter()
                .any(|b| self.backends.contains(b) && !failed.contains(b));
            if !has_alternative {
                let _ = path.transition(PathState::DeadEnd);
                run.trail.append(
                    AuditEventType::PathMarkedDeadEnd,
                    json!({
                        "path_id": path.id,
                        "specialist_id": path.specialist_id,
                        "reason": "retries_exhausted",
                    }),
                );
            }
        }
    }

    fn finish_completed_paths(&self, run: &mut Run) {
        let target = self.config.scheduler.steps_per_path;
        for path in run.paths.iter_mut().filter(|p| p.is_active()) {
            if path.completed_steps() >= target {
                let _ = path.transition(PathState::Finished);
                debug!(path = %path.id, "Path finished");
            }
        }
    }

    /// Round barrier: score every still-active path against its siblings and
    /// apply the continue/merge/prune policy.
    fn apply_round_decisions(
        &self,
        run: &mut Run,
        evaluator: &PruningEvaluator,
        policy: &DecisionPolicy,
    ) {
        let window = self.config.pruning.novelty_window;
        let snapshot: Vec<(String, Vec<String>, Vec<f64>, u64)> = run
            .paths
            .iter()
            .filter(|p| p.is_active())
            .map(|p| {
                (
                    p.id.clone(),
                    p.recent_outputs(window)
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                    p.cost_deltas.clone(),
                    p.tokens_spent(),
                )
            })
            .collect();

        if snapshot.len() < 2 {
            return;
        }

        for (index, (path_id, outputs, cost_deltas, spent)) in snapshot.iter().enumerate() {
            // A decision earlier this barrier may already have retired it.
            if !run
                .paths
                .iter()
                .any(|p| p.id == *path_id && p.is_active())
            {
                continue;
            }

            let this_outputs: Vec<&str> = outputs.iter().map(String::as_str).collect();
            let siblings: Vec<SiblingOutputs<'_>> = snapshot
                .iter()
                .enumerate()
                .filter(|(other, (id, ..))| {
                    *other != index
                        && run.paths.iter().any(|p| p.id == *id && p.is_active())
                })
                .map(|(_, (id, outputs, ..))| SiblingOutputs {
                    path_id: id,
                    outputs: outputs.iter().map(String::as_str).collect(),
                })
                .collect();

            let evaluation = evaluator.score(
                &this_outputs,
                &siblings,
                cost_deltas,
                run.request.token_budget,
                *spent,
            );

            match policy.decide(&evaluation) {
                Decision::Continue => {}
                Decision::Prune => {
                    let Some(path) = run.paths.iter_mut().find(|p| p.id == *path_id) else {
                        continue;
                    };
                    let _ = path.transition(PathState::Pruned);
                    let specialist_id = path.specialist_id.clone();
                    run.trail.append(
                        AuditEventType::PruneSuggested,
                        json!({
                            "path_id": path_id,
                            "scores": evaluation.scores,
                            "round": run.rounds_used,
                        }),
                    );
                    // The suggestion carries the scores; the dead-end mark
                    // records that it was applied.
                    run.trail.append(
                        AuditEventType::PathMarkedDeadEnd,
                        json!({
                            "path_id": path_id,
                            "specialist_id": specialist_id,
                            "reason": "pruned",
                        }),
                    );
                    info!(path = %path_id, "Path pruned");
                }
                Decision::MergeInto { canonical } => {
                    self.merge_paths(run, path_id, &canonical, &evaluation);
                }
            }
        }
    }

    /// Fold two near-identical paths together, keeping the cheaper history
    /// as canonical.
    fn merge_paths(
        &self,
        run: &mut Run,
        path_id: &str,
        sibling_id: &str,
        evaluation: &crate::pruning::PathEvaluation,
    ) {
        let this_cost = run
            .paths
            .iter()
            .find(|p| p.id == path_id)
            .map(|p| p.tokens_spent())
            .unwrap_or(u64::MAX);
        let sibling_cost = run
            .paths
            .iter()
            .find(|p| p.id == sibling_id)
            .map(|p| p.tokens_spent())
            .unwrap_or(u64::MAX);

        let (merged_id, canonical_id) = if sibling_cost <= this_cost {
            (path_id.to_string(), sibling_id.to_string())
        } else {
            (sibling_id.to_string(), path_id.to_string())
        };

        let Some(merged) = run
            .paths
            .iter_mut()
            .find(|p| p.id == merged_id && p.is_active())
        else {
            return;
        };
        let _ = merged.transition(PathState::MergedInto {
            canonical: canonical_id.clone(),
        });

        run.trail.append(
            AuditEventType::TeamMerged,
            json!({
                "merged_path_id": merged_id,
                "canonical_path_id": canonical_id,
                "scores": evaluation.scores,
                "similarity": evaluation.nearest_sibling.as_ref().map(|s| s.similarity),
                "round": run.rounds_used,
            }),
        );
        info!(merged = %merged_id, canonical = %canonical_id, "Paths merged");
    }

    /// Round budget expired: close out whatever is still active.
    fn force_convergence(&self, run: &mut Run) {
        let close_as_finished = self.config.scheduler.close_unfinished_on_budget;
        for path in run.paths.iter_mut().filter(|p| p.is_active()) {
            run.forced_convergence = true;
            if close_as_finished && path.completed_steps() > 0 {
                let _ = path.transition(PathState::Finished);
                debug!(path = %path.id, "Path closed as finished at budget expiry");
            } else {
                let _ = path.transition(PathState::DeadEnd);
                run.trail.append(
                    AuditEventType::PathMarkedDeadEnd,
                    json!({
                        "path_id": path.id,
                        "specialist_id": path.specialist_id,
                        "reason": "round_budget_exhausted",
                    }),
                );
            }
        }
    }

    /// Record every terminal path into memory and collect candidates.
    async fn converge(&self, run: &mut Run, specialists: &[Arc<Specialist>]) -> Vec<Candidate> {
        let synthesizer = AuctionSynthesizer::new(self.config.auction.clone());
        let mut candidates = Vec::new();

        for path in &run.paths {
            let representative = path
                .latest_output()
                .map(str::to_string)
                .unwrap_or_else(|| {
                    specialists
                        .iter()
                        .find(|s| s.id == path.specialist_id)
                        .map(|s| seed_prompt(&run.request, s))
                        .unwrap_or_else(|| run.request.objective.clone())
                });
            let embedding = self.embedder.embed(&representative);

            let outcome = match &path.state {
                PathState::Finished => Some(Outcome::Positive),
                PathState::Pruned | PathState::DeadEnd => Some(Outcome::Negative),
                // Merged histories live on through their canonical path.
                PathState::MergedInto { .. } | PathState::Active => None,
            };
            if let Some(outcome) = outcome {
                let metadata = HashMap::from([
                    ("specialist".to_string(), path.specialist_id.clone()),
                    ("state".to_string(), path.state.label().to_string()),
                ]);
                self.memory
                    .record(path.signature.clone(), embedding, outcome, metadata)
                    .await;
            }

            if path.state == PathState::Finished {
                let output = path.latest_output().unwrap_or_default().to_string();
                let mut candidate = Candidate {
                    path_id: path.id.clone(),
                    specialist_id: path.specialist_id.clone(),
                    output,
                    tokens_spent: path.tokens_spent(),
                    bid: 0.0,
                };
                candidate.bid = match &self.bid_scorer {
                    Some(scorer) => scorer(&candidate),
                    None => {
                        let confidence = specialists
                            .iter()
                            .find(|s| s.id == path.specialist_id)
                            .map(|s| s.confidence)
                            .unwrap_or(0.5);
                        synthesizer.default_bid(&candidate, confidence, &run.budget)
                    }
                };
                candidates.push(candidate);
            }
        }

        candidates
    }

    fn settle(&self, run: &Run, candidates: Vec<Candidate>) -> RunResponse {
        // Auction over whatever finished; an empty candidate set is a
        // degraded outcome, not an error.
        let synthesizer = AuctionSynthesizer::new(self.config.auction.clone());
        match synthesizer.run(&candidates) {
            Some(auction) => {
                let winning_output = candidates
                    .iter()
                    .find(|c| c.path_id == auction.winner_id)
                    .map(|c| c.output.clone());
                RunResponse {
                    status: RunStatus::Completed,
                    winning_output,
                    clearing_price: auction.clearing_price,
                    bids: auction.bids,
                    rationale: Some(auction.rationale),
                    audit_trail: run.trail.events(),
                }
            }
            None => RunResponse {
                status: if run.forced_convergence {
                    RunStatus::TimedOut
                } else {
                    RunStatus::NoViableResult
                },
                winning_output: None,
                clearing_price: 0.0,
                bids: Vec::new(),
                rationale: None,
                audit_trail: run.trail.events(),
            },
        }
    }
}
