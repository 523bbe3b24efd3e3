//! Sealed-bid second-price auction over finished candidates.
//!
//! Winner pays (is attributed) the second-highest bid, which keeps each
//! candidate's dominant strategy an honest utility estimate. The full bid
//! list is always returned — the audit trail is a primary consumer and
//! losing bids must never disappear.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AuctionConfig;
use crate::path::Candidate;
use crate::resource::BudgetTracker;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub candidate_id: String,
    pub bid: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionResult {
    pub winner_id: String,
    /// Second-highest bid, or the winning bid itself for a single candidate.
    pub clearing_price: f64,
    /// All bids, highest first; ties ordered by candidate id.
    pub bids: Vec<Bid>,
    pub rationale: String,
}

/// Caller-supplied utility estimator. When absent, the default heuristic
/// combines cost efficiency with specialist confidence.
pub type BidScorer = dyn Fn(&Candidate) -> f64 + Send + Sync;

pub struct AuctionSynthesizer {
    config: AuctionConfig,
}

impl AuctionSynthesizer {
    pub fn new(config: AuctionConfig) -> Self {
        Self { config }
    }

    /// Default bid: weighted blend of budget headroom left by the path and
    /// the specialist's declared confidence.
    pub fn default_bid(
        &self,
        candidate: &Candidate,
        confidence: f64,
        budget: &BudgetTracker,
    ) -> f64 {
        let efficiency = if budget.budget() == 0 {
            0.0
        } else {
            1.0 - (candidate.tokens_spent as f64 / budget.budget() as f64).min(1.0)
        };
        self.config.efficiency_weight * efficiency + self.config.confidence_weight * confidence
    }

    /// Run the auction. Returns `None` when there are no candidates — the
    /// orchestrator reports that as `no_viable_result` rather than a fault.
    pub fn run(&self, candidates: &[Candidate]) -> Option<AuctionResult> {
        if candidates.is_empty() {
            return None;
        }

        let mut bids: Vec<Bid> = candidates
            .iter()
            .map(|c| Bid {
                candidate_id: c.path_id.clone(),
                bid: c.bid,
            })
            .collect();

        // Highest bid first; lexicographically smallest id wins ties.
        bids.sort_by(|a, b| {
            b.bid
                .partial_cmp(&a.bid)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });

        let winner = bids[0].clone();
        let clearing_price = bids.get(1).map_or(winner.bid, |second| second.bid);

        let rationale = if bids.len() == 1 {
            format!(
                "single candidate {} wins at its own bid {:.4}",
                winner.candidate_id, winner.bid
            )
        } else {
            format!(
                "{} wins with bid {:.4} over {} competitors; clearing at second price {:.4}",
                winner.candidate_id,
                winner.bid,
                bids.len() - 1,
                clearing_price
            )
        };

        debug!(
            winner = %winner.candidate_id,
            clearing_price,
            bidders = bids.len(),
            "Auction settled"
        );

        Some(AuctionResult {
            winner_id: winner.candidate_id,
            clearing_price,
            bids,
            rationale,
        })
    }
}
