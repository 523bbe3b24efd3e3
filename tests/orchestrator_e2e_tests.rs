//! End-to-end orchestrator runs against scripted in-process backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parallax::{
    seed_prompt, AuditEventType, Backend, BackendError, BackendProfile, BackendRegistry,
    BackendTier, Generation, Orchestrator, Outcome, ParallaxConfig, PathMemory, PathSignature,
    RunRequest, RunStatus, Specialist, SpecialistRegistry,
};

/// Replies with the first response whose needle appears in the prompt, and
/// records every prompt it sees.
struct ScriptedBackend {
    responses: Vec<(&'static str, &'static str)>,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(responses: Vec<(&'static str, &'static str)>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn generate(
        &self,
        _model_id: &str,
        prompt: &str,
    ) -> Result<Generation, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        for (needle, response) in &self.responses {
            if prompt.contains(needle) {
                return Ok(Generation {
                    text: response.to_string(),
                    tokens_spent: 10,
                });
            }
        }
        Ok(Generation {
            text: "no scripted response".to_string(),
            tokens_spent: 10,
        })
    }
}

/// Sleeps past any reasonable per-attempt timeout.
struct StallingBackend {
    calls: AtomicU32,
}

#[async_trait]
impl Backend for StallingBackend {
    async fn generate(
        &self,
        _model_id: &str,
        _prompt: &str,
    ) -> Result<Generation, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("stalling backend never completes");
    }
}

fn fast_config() -> ParallaxConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let mut config = ParallaxConfig::default();
    config.retry.step_timeout_ms = 200;
    config.retry.max_retries = 1;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config
}

fn specialist_for_event(events: &[parallax::AuditEvent], path_id: &str) -> String {
    events
        .iter()
        .filter(|e| e.event_type == AuditEventType::StepExecuted)
        .find(|e| e.payload["path_id"] == path_id)
        .map(|e| e.payload["specialist_id"].as_str().unwrap().to_string())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_near_identical_paths_merge_once_and_two_candidates_bid() {
    let backend = ScriptedBackend::new(vec![
        (
            "Specialist: alpha",
            "use an lru cache with ttl eviction for the session store",
        ),
        (
            "Specialist: beta",
            "use an lru cache with ttl eviction for the session store",
        ),
        (
            "Specialist: gamma",
            "rewrite the hot loop as a streaming pipeline with backpressure",
        ),
    ]);
    let backends = Arc::new(BackendRegistry::new());
    backends.register(
        BackendProfile::new("local", BackendTier::Local, "test-model"),
        backend,
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    for id in ["alpha", "beta", "gamma"] {
        specialists
            .register(
                Specialist::new(id)
                    .with_backends(&["local"])
                    .with_confidence(0.7),
            )
            .unwrap();
    }

    let memory = Arc::new(PathMemory::ephemeral(0.85));
    let orchestrator = Orchestrator::new(
        fast_config(),
        specialists,
        backends,
        Arc::clone(&memory),
    );

    let request = RunRequest::new("improve session cache performance", 10_000).with_hints(vec![
        "alpha".to_string(),
        "beta".to_string(),
        "gamma".to_string(),
    ]);
    let response = orchestrator.run(request).await.unwrap();

    assert_eq!(response.status, RunStatus::Completed);

    // Exactly one merge, between the two identical-output paths.
    let merges: Vec<_> = response
        .audit_trail
        .iter()
        .filter(|e| e.event_type == AuditEventType::TeamMerged)
        .collect();
    assert_eq!(merges.len(), 1);
    let merged = merges[0].payload["merged_path_id"].as_str().unwrap();
    let canonical = merges[0].payload["canonical_path_id"].as_str().unwrap();
    let mut pair = [
        specialist_for_event(&response.audit_trail, merged),
        specialist_for_event(&response.audit_trail, canonical),
    ];
    pair.sort();
    assert_eq!(pair, ["alpha".to_string(), "beta".to_string()]);

    // Surviving identical path plus the distinct path reach the auction.
    assert_eq!(response.bids.len(), 2);
    assert!(response.winning_output.is_some());
    assert_eq!(response.clearing_price, response.bids[1].bid);

    // Merged path is not recorded; the two finished paths are.
    assert_eq!(memory.len(), 2);
}

#[tokio::test]
async fn test_remembered_dead_end_blocks_path_before_any_step() {
    let backend = ScriptedBackend::new(vec![]);
    let counter = Arc::clone(&backend);
    let backends = Arc::new(BackendRegistry::new());
    backends.register(
        BackendProfile::new("local", BackendTier::Local, "test-model"),
        backend,
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    let specialist = Specialist::new("solo").with_backends(&["local"]);
    specialists.register(specialist.clone()).unwrap();

    let request = RunRequest::new("retry the approach that already failed", 1_000)
        .with_hints(vec!["solo".to_string()]);

    // Seed a negative record whose embedding matches the path's first
    // prompt, under a different signature so the similarity scan decides.
    let config = fast_config();
    let memory = Arc::new(PathMemory::ephemeral(config.memory.dedup_similarity));
    let embedder = parallax::CandidateEmbedder::new(config.embedding.dimension);
    memory
        .record(
            PathSignature::compute(&["older-attempt".to_string()], &["local".to_string()], &[]),
            embedder.embed(&seed_prompt(&request, &specialist)),
            Outcome::Negative,
            HashMap::new(),
        )
        .await;

    let orchestrator = Orchestrator::new(config, specialists, backends, memory);
    let response = orchestrator.run(request).await.unwrap();

    assert_eq!(response.status, RunStatus::NoViableResult);
    assert!(response.winning_output.is_none());
    assert!(response.bids.is_empty());

    // The path never executed a step: no backend call, no step event.
    assert_eq!(counter.calls(), 0);
    let steps = response
        .audit_trail
        .iter()
        .filter(|e| e.event_type == AuditEventType::StepExecuted)
        .count();
    assert_eq!(steps, 0);

    let dead_ends: Vec<_> = response
        .audit_trail
        .iter()
        .filter(|e| e.event_type == AuditEventType::PathMarkedDeadEnd)
        .collect();
    assert_eq!(dead_ends.len(), 1);
    assert_eq!(dead_ends[0].payload["reason"], "memory_duplicate");
    assert!(dead_ends[0].payload["nearest_negative_similarity"].as_f64().unwrap() >= 0.85);
}

#[tokio::test]
async fn test_timeout_path_dead_ends_without_failing_the_run() {
    let backends = Arc::new(BackendRegistry::new());
    let stalling = Arc::new(StallingBackend {
        calls: AtomicU32::new(0),
    });
    let stall_counter = Arc::clone(&stalling);
    backends.register(
        BackendProfile::new("stall", BackendTier::Remote, "test-model"),
        stalling,
    );
    backends.register(
        BackendProfile::new("quick", BackendTier::Local, "test-model"),
        ScriptedBackend::new(vec![("Specialist: fast", "a workable answer")]),
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    specialists
        .register(Specialist::new("slow").with_backends(&["stall"]))
        .unwrap();
    specialists
        .register(Specialist::new("fast").with_backends(&["quick"]))
        .unwrap();

    let memory = Arc::new(PathMemory::ephemeral(0.85));
    let orchestrator = Orchestrator::new(
        fast_config(),
        specialists,
        backends,
        Arc::clone(&memory),
    );

    let request = RunRequest::new("find any viable answer", 10_000)
        .with_hints(vec!["slow".to_string(), "fast".to_string()]);
    let response = orchestrator.run(request).await.unwrap();

    // The healthy path still wins the run.
    assert_eq!(response.status, RunStatus::Completed);
    assert_eq!(response.winning_output.as_deref(), Some("a workable answer"));
    assert_eq!(response.bids.len(), 1);

    // The stalling backend was attempted max_retries + 1 times, then the
    // path dead-ended.
    assert_eq!(stall_counter.calls.load(Ordering::SeqCst), 2);
    let dead_ends: Vec<_> = response
        .audit_trail
        .iter()
        .filter(|e| e.event_type == AuditEventType::PathMarkedDeadEnd)
        .collect();
    assert_eq!(dead_ends.len(), 1);
    assert_eq!(dead_ends[0].payload["reason"], "retries_exhausted");

    // The timed-out step itself is still in the trail.
    assert!(response
        .audit_trail
        .iter()
        .filter(|e| e.event_type == AuditEventType::StepExecuted)
        .any(|e| e.payload["status"] == "timeout"));
}

#[tokio::test]
async fn test_identical_sibling_steps_coalesce_into_one_backend_call() {
    let backend = ScriptedBackend::new(vec![("Specialist: dup", "the one shared answer")]);
    let counter = Arc::clone(&backend);
    let backends = Arc::new(BackendRegistry::new());
    backends.register(
        BackendProfile::new("local", BackendTier::Local, "test-model"),
        backend,
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    specialists
        .register(Specialist::new("dup").with_backends(&["local"]))
        .unwrap();

    let orchestrator = Orchestrator::new(
        fast_config(),
        specialists,
        backends,
        Arc::new(PathMemory::ephemeral(0.85)),
    );

    // Two paths on the same specialist issue the same first step.
    let request = RunRequest::new("answer once, share twice", 10_000)
        .with_hints(vec!["dup".to_string(), "dup".to_string()]);
    let response = orchestrator.run(request).await.unwrap();

    assert_eq!(response.status, RunStatus::Completed);

    // Round 1 coalesces the twin steps into one call; the identical twins
    // then merge, so round 2 is a single call for the canonical path.
    assert_eq!(counter.calls(), 2);

    let round_one_steps: Vec<_> = response
        .audit_trail
        .iter()
        .filter(|e| e.event_type == AuditEventType::StepExecuted)
        .take(2)
        .collect();
    assert_eq!(round_one_steps.len(), 2);
    assert!(round_one_steps.iter().all(|e| e.payload["batched"] == true));
    // Fanned-out copies carry distinct step ids.
    assert_ne!(
        round_one_steps[0].payload["step_id"],
        round_one_steps[1].payload["step_id"]
    );

    assert_eq!(
        response
            .audit_trail
            .iter()
            .filter(|e| e.event_type == AuditEventType::TeamMerged)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_sequential_pattern_chains_outputs() {
    let backend = ScriptedBackend::new(vec![
        ("Specialist: draft", "the first draft"),
        ("Specialist: polish", "the polished result"),
    ]);
    let prompts = Arc::clone(&backend);
    let backends = Arc::new(BackendRegistry::new());
    backends.register(
        BackendProfile::new("local", BackendTier::Local, "test-model"),
        backend,
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    specialists
        .register(Specialist::new("draft").with_backends(&["local"]))
        .unwrap();
    specialists
        .register(Specialist::new("polish").with_backends(&["local"]))
        .unwrap();

    let orchestrator = Orchestrator::new(
        fast_config(),
        specialists,
        backends,
        Arc::new(PathMemory::ephemeral(0.85)),
    );

    let request = RunRequest::new("write then refine", 10_000)
        .with_hints(vec!["draft".to_string(), "polish".to_string()])
        .with_pattern(parallax::ExecutionPattern::Sequential);
    let response = orchestrator.run(request).await.unwrap();

    assert_eq!(response.status, RunStatus::Completed);

    let seen = prompts.prompts.lock();
    let polish_prompts: Vec<&String> = seen
        .iter()
        .filter(|p| p.contains("Specialist: polish"))
        .collect();
    assert_eq!(polish_prompts.len(), 2);

    // The second specialist's first step consumes the first one's final
    // output; its later step consumes its own earlier output.
    assert!(polish_prompts[0].contains("the first draft"));
    assert!(polish_prompts[1].contains("the polished result"));
    assert!(!polish_prompts[1].contains("the first draft"));
}

#[tokio::test]
async fn test_later_steps_consume_own_earlier_outputs() {
    let backend = ScriptedBackend::new(vec![("Specialist: only", "step output text")]);
    let prompts = Arc::clone(&backend);
    let backends = Arc::new(BackendRegistry::new());
    backends.register(
        BackendProfile::new("local", BackendTier::Local, "test-model"),
        backend,
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    specialists
        .register(Specialist::new("only").with_backends(&["local"]))
        .unwrap();

    let orchestrator = Orchestrator::new(
        fast_config(),
        specialists,
        backends,
        Arc::new(PathMemory::ephemeral(0.85)),
    );

    let request = RunRequest::new("two steps in sequence", 10_000)
        .with_hints(vec!["only".to_string()]);
    let response = orchestrator.run(request).await.unwrap();
    assert_eq!(response.status, RunStatus::Completed);

    // First round has no prior output; the second feeds on the first.
    let seen = prompts.prompts.lock();
    assert_eq!(seen.len(), 2);
    assert!(!seen[0].contains("Prior output"));
    assert!(seen[1].contains("Prior output:\nstep output text"));
}

#[tokio::test]
async fn test_stalled_low_novelty_path_is_pruned_with_both_events() {
    let backend = ScriptedBackend::new(vec![
        (
            "Specialist: alpha",
            "cache every response in a shared lru map keyed by normalized request path and query parameters",
        ),
        (
            "Specialist: beta",
            "cache every response in a shared lru map keyed by normalized request path and header parameters",
        ),
    ]);
    let backends = Arc::new(BackendRegistry::new());
    backends.register(
        BackendProfile::new("local", BackendTier::Local, "test-model"),
        backend,
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    for id in ["alpha", "beta"] {
        specialists
            .register(Specialist::new(id).with_backends(&["local"]))
            .unwrap();
    }

    // Outputs differ by one word: similar enough to kill novelty, but not
    // identical, so with the merge bar at 1.0 the stalled path is pruned.
    let mut config = fast_config();
    config.pruning.novelty_epsilon = 0.5;
    config.pruning.merge_similarity = 1.0;

    let orchestrator = Orchestrator::new(
        config,
        specialists,
        backends,
        Arc::new(PathMemory::ephemeral(0.85)),
    );

    let request = RunRequest::new("add a response cache", 10_000)
        .with_hints(vec!["alpha".to_string(), "beta".to_string()]);
    let response = orchestrator.run(request).await.unwrap();

    assert_eq!(response.status, RunStatus::Completed);
    assert_eq!(response.bids.len(), 1);

    // The applied prune leaves both the scored suggestion and the mark.
    let prunes: Vec<_> = response
        .audit_trail
        .iter()
        .filter(|e| e.event_type == AuditEventType::PruneSuggested)
        .collect();
    assert_eq!(prunes.len(), 1);
    assert!(prunes[0].payload["scores"]["novelty"].as_f64().unwrap() < 0.5);

    let dead_ends: Vec<_> = response
        .audit_trail
        .iter()
        .filter(|e| e.event_type == AuditEventType::PathMarkedDeadEnd)
        .collect();
    assert_eq!(dead_ends.len(), 1);
    assert_eq!(dead_ends[0].payload["reason"], "pruned");
    assert_eq!(
        dead_ends[0].payload["path_id"],
        prunes[0].payload["path_id"]
    );
}

#[tokio::test]
async fn test_round_budget_closes_partial_paths_as_candidates() {
    let backend = ScriptedBackend::new(vec![("Specialist: only", "partial progress")]);
    let backends = Arc::new(BackendRegistry::new());
    backends.register(
        BackendProfile::new("local", BackendTier::Local, "test-model"),
        backend,
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    specialists
        .register(Specialist::new("only").with_backends(&["local"]))
        .unwrap();

    let orchestrator = Orchestrator::new(
        fast_config(),
        specialists,
        backends,
        Arc::new(PathMemory::ephemeral(0.85)),
    );

    // One round is not enough for steps_per_path = 2, but the path has made
    // progress, so budget expiry closes it as a finished candidate.
    let request = RunRequest::new("whatever fits in one round", 10_000)
        .with_hints(vec!["only".to_string()])
        .with_round_budget(1);
    let response = orchestrator.run(request).await.unwrap();

    assert_eq!(response.status, RunStatus::Completed);
    assert_eq!(response.winning_output.as_deref(), Some("partial progress"));
}

#[tokio::test]
async fn test_zero_rounds_times_out() {
    let backends = Arc::new(BackendRegistry::new());
    backends.register(
        BackendProfile::new("local", BackendTier::Local, "test-model"),
        ScriptedBackend::new(vec![]),
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    specialists
        .register(Specialist::new("only").with_backends(&["local"]))
        .unwrap();

    let orchestrator = Orchestrator::new(
        fast_config(),
        specialists,
        backends,
        Arc::new(PathMemory::ephemeral(0.85)),
    );

    let request = RunRequest::new("no time to do anything", 1_000)
        .with_hints(vec!["only".to_string()])
        .with_round_budget(0);
    let response = orchestrator.run(request).await.unwrap();

    assert_eq!(response.status, RunStatus::TimedOut);
    assert!(response.bids.is_empty());
}

#[tokio::test]
async fn test_every_retired_path_leaves_an_audit_event() {
    let backend = ScriptedBackend::new(vec![
        ("Specialist: alpha", "identical answer text"),
        ("Specialist: beta", "identical answer text"),
        ("Specialist: gamma", "a different answer entirely"),
    ]);
    let backends = Arc::new(BackendRegistry::new());
    backends.register(
        BackendProfile::new("local", BackendTier::Local, "test-model"),
        backend,
    );

    let specialists = Arc::new(SpecialistRegistry::new());
    for id in ["alpha", "beta", "gamma"] {
        specialists
            .register(Specialist::new(id).with_backends(&["local"]))
            .unwrap();
    }

    let orchestrator = Orchestrator::new(
        fast_config(),
        specialists,
        backends,
        Arc::new(PathMemory::ephemeral(0.85)),
    );

    let request = RunRequest::new("audit everything", 10_000).with_hints(vec![
        "alpha".to_string(),
        "beta".to_string(),
        "gamma".to_string(),
    ]);
    let response = orchestrator.run(request).await.unwrap();

    // Three paths started, two finished: the retired one is visible in the
    // trail as exactly one merge/prune/dead-end event.
    let retirements = response
        .audit_trail
        .iter()
        .filter(|e| {
            matches!(
                e.event_type,
                AuditEventType::TeamMerged
                    | AuditEventType::PruneSuggested
                    | AuditEventType::PathMarkedDeadEnd
            )
        })
        .count();
    assert_eq!(retirements, 1);
    assert_eq!(response.bids.len(), 2);
}
