//! Parallax: a multi-path exploration orchestrator.
//!
//! Given an objective, Parallax fans out concurrent exploration paths across
//! registered specialists, executes their steps against pluggable backends
//! with timeout and retry, prunes or merges paths that stop contributing,
//! remembers dead ends across runs, and settles the surviving candidates
//! with a sealed-bid second-price auction.
//!
//! ```no_run
//! use std::sync::Arc;
//! use parallax::{
//!     BackendRegistry, Orchestrator, ParallaxConfig, PathMemory, RunRequest,
//!     Specialist, SpecialistRegistry,
//! };
//!
//! # async fn example() -> parallax::Result<()> {
//! let config = ParallaxConfig::default();
//! let specialists = Arc::new(SpecialistRegistry::new());
//! specialists.register(
//!     Specialist::new("code_review")
//!         .with_strengths(&["review", "refactor"])
//!         .with_backends(&["local"]),
//! )?;
//! let backends = Arc::new(BackendRegistry::new());
//! let memory = Arc::new(PathMemory::open(&config.memory).await);
//!
//! let orchestrator = Orchestrator::new(config, specialists, backends, memory);
//! let response = orchestrator
//!     .run(RunRequest::new("review the session cache", 10_000))
//!     .await?;
//! println!("{:?}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod auction;
pub mod audit;
pub mod backend;
pub mod config;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod memory;
pub mod orchestrator;
pub mod path;
pub mod pruning;
pub mod resource;
pub mod router;
pub mod specialist;

pub use auction::{AuctionResult, AuctionSynthesizer, Bid, BidScorer};
pub use audit::{AuditEvent, AuditEventType, AuditTrail};
pub use backend::{Backend, BackendProfile, BackendRegistry, BackendTier, Generation};
pub use config::ParallaxConfig;
pub use embedding::{CandidateEmbedder, Embedding};
pub use error::{BackendError, ParallaxError, Result};
pub use executor::StepExecutor;
pub use memory::{MemoryCheck, Outcome, PathMemory, PathMemoryRecord};
pub use orchestrator::{
    seed_prompt, ExecutionPattern, Orchestrator, RunRequest, RunResponse, RunStatus,
};
pub use path::{Candidate, ExplorationPath, PathSignature, PathState, StepResult, StepStatus};
pub use pruning::{Decision, DecisionPolicy, PathEvaluation, PruningEvaluator, PruningScores};
pub use resource::{BudgetTracker, ResourceMonitor, ResourceSnapshot};
pub use router::ResourceAwareRouter;
pub use specialist::{Specialist, SpecialistRegistry};
