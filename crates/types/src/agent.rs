//! In-memory orchestrator models: agents, contracts, and markets.
//!
//! These are a lossy cache of on-chain truth. Cross-references between
//! entities are identifiers only (`fiberId` strings, addresses); ownership
//! stays with the maps that hold them, so the graph is acyclic by
//! construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lifecycle of an agent identity fiber.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// No identity fiber exists yet.
    Unregistered,
    /// Identity fiber created, not yet activated.
    Registered,
    /// Fully active participant.
    Active,
    /// Challenged by another participant; must respond.
    Challenged,
    /// Temporarily barred from acting.
    Suspended,
    /// Reinstated under observation.
    Probation,
    /// Permanently retired. Retained for historical references.
    Withdrawn,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unregistered => "UNREGISTERED",
            Self::Registered => "REGISTERED",
            Self::Active => "ACTIVE",
            Self::Challenged => "CHALLENGED",
            Self::Suspended => "SUSPENDED",
            Self::Probation => "PROBATION",
            Self::Withdrawn => "WITHDRAWN",
        };
        f.write_str(s)
    }
}

/// Fitness components, each normalized to `[0, 1]`, plus the weighted total.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct Fitness {
    /// Reputation relative to the highest reputation seen so far.
    pub reputation: f64,
    /// Completed / (completed + failed); neutral 0.5 for newcomers.
    pub completion_rate: f64,
    /// Vouch connectivity, saturating at 10 edges.
    pub network_effect: f64,
    /// Generations lived, normalized.
    pub age: f64,
    /// Weighted sum of the above.
    pub total: f64,
}

impl Default for Fitness {
    fn default() -> Self {
        Self {
            reputation: 0.0,
            completion_rate: 0.5,
            network_effect: 0.0,
            age: 0.0,
            total: 0.0,
        }
    }
}

/// Bookkeeping attached to an agent beyond its on-chain state.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AgentMeta {
    /// Generation this agent was born in.
    pub birth_generation: u64,
    /// Display name carried into the identity fiber.
    pub display_name: String,
    /// Originating platform label (e.g. `"generated"`).
    pub platform: String,
    /// Addresses this agent has vouched for.
    #[serde(default)]
    pub vouched_for: BTreeSet<String>,
    /// Addresses that vouched for this agent.
    #[serde(default)]
    pub received_vouches: BTreeSet<String>,
    /// Fiber ids of contracts this agent participates in.
    #[serde(default)]
    pub active_contracts: BTreeSet<String>,
    /// Fiber ids of markets this agent participates in.
    #[serde(default)]
    pub active_markets: BTreeSet<String>,
    /// Count of contracts completed successfully.
    pub completed_contracts: u32,
    /// Count of contracts that failed or were disputed against this agent.
    pub failed_contracts: u32,
    /// Appetite for risky choices, in `[0, 1]`.
    pub risk_tolerance: f64,
    /// Whether this agent may act as a market oracle.
    pub is_oracle: bool,
}

/// An agent tracked by the orchestrator.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Derived address, the agent's stable identifier.
    pub address: String,
    /// Hex-encoded 32-byte secret scalar. Only ever used locally for signing.
    pub private_key: String,
    /// The agent's identity fiber, once registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiber_id: Option<String>,
    /// Current lifecycle state.
    pub state: AgentState,
    /// Current fitness snapshot.
    pub fitness: Fitness,
    /// Auxiliary bookkeeping.
    pub meta: AgentMeta,
}

impl Agent {
    /// Reputation score backing `fitness.reputation` (raw, unnormalized).
    /// Completions earn more than vouches; failures cost double.
    pub fn raw_reputation(&self) -> f64 {
        let completed = f64::from(self.meta.completed_contracts);
        let failed = f64::from(self.meta.failed_contracts);
        let vouches = self.meta.received_vouches.len() as f64;
        (completed * 3.0 + vouches - failed * 6.0).max(0.0)
    }

    /// Whether the agent can be sampled as an actor this tick.
    pub fn can_act(&self) -> bool {
        matches!(
            self.state,
            AgentState::Active | AgentState::Challenged | AgentState::Probation
        )
    }
}

/// Lifecycle of a bilateral contract fiber.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractState {
    /// Proposed, awaiting the counterparty.
    Proposed,
    /// Accepted and in force.
    Active,
    /// Completed and finalized.
    Completed,
    /// Declined by the counterparty.
    Rejected,
    /// Escalated to dispute.
    Disputed,
}

impl ContractState {
    /// Whether this state terminates the contract.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Disputed)
    }
}

/// An in-memory contract row mirroring a Contract fiber.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    /// The backing fiber.
    pub fiber_id: String,
    /// Address of the proposing agent.
    pub proposer: String,
    /// Address of the counterparty.
    pub counterparty: String,
    /// Mirrored lifecycle state.
    pub state: ContractState,
    /// Free-form agreed terms.
    pub terms: Value,
    /// Generation the proposal was made in.
    pub created_generation: u64,
    /// Generation by which completion is expected.
    pub expected_completion: u64,
}

/// The four market flavors sharing one state machine.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// Binary-outcome prediction market resolved by oracles.
    Prediction,
    /// Highest-commitment-wins auction.
    Auction,
    /// All-or-nothing funding with a threshold.
    Crowdfund,
    /// Threshold-triggered collective purchase.
    GroupBuy,
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prediction => "prediction",
            Self::Auction => "auction",
            Self::Crowdfund => "crowdfund",
            Self::GroupBuy => "group_buy",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a market fiber.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketState {
    /// Created, not yet open for commitments.
    Proposed,
    /// Accepting commitments.
    Open,
    /// Closed to commitments, awaiting resolution.
    Closed,
    /// Collecting oracle resolutions.
    Resolving,
    /// Settled; claims may be made.
    Settled,
    /// Refunded below threshold; committers reclaim stakes.
    Refunded,
    /// Cancelled before opening.
    Cancelled,
}

impl MarketState {
    /// Whether this state terminates the market.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Refunded | Self::Cancelled)
    }
}

/// A participant's stake in a market.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MarketCommitment {
    /// Total committed amount.
    pub amount: u64,
    /// Event-specific data; for predictions, `{"outcome": "YES"|"NO"}`.
    pub data: Value,
    /// Millisecond epoch of the most recent commit.
    pub last_commit_at: u64,
}

impl MarketCommitment {
    /// The committed outcome, for markets that carry one.
    pub fn outcome(&self) -> Option<&str> {
        self.data.get("outcome").and_then(Value::as_str)
    }
}

/// One oracle's resolution submission.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MarketResolution {
    /// The submitting oracle's address.
    pub oracle: String,
    /// The resolved outcome.
    pub outcome: String,
    /// Optional supporting evidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Value>,
    /// Millisecond epoch of submission.
    pub submitted_at: u64,
}

/// A settled claim against a market.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MarketClaim {
    /// Millisecond epoch the claim was made.
    pub claimed_at: u64,
    /// Amount paid out (zero for losing positions).
    pub amount: u64,
}

/// The deterministic settlement computed when a market finalizes.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MarketSettlement {
    /// The winning outcome.
    pub outcome: String,
    /// Fee retained from the losing pool.
    pub fee: u64,
    /// Payout per winning address (stake returned plus share of the pot).
    pub payouts: BTreeMap<String, u64>,
}

/// An in-memory market row mirroring a Market fiber.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    /// The backing fiber.
    pub fiber_id: String,
    /// Market flavor.
    pub market_type: MarketType,
    /// Creator's address.
    pub creator: String,
    /// Addresses permitted to submit resolutions.
    #[serde(default)]
    pub oracles: BTreeSet<String>,
    /// Minimum count of distinct oracle resolutions required to finalize.
    pub quorum: u32,
    /// Millisecond-epoch deadline, when the market has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
    /// Funding threshold for crowdfund / group-buy flavors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,
    /// Mirrored lifecycle state.
    pub state: MarketState,
    /// Commitments keyed by committer address.
    #[serde(default)]
    pub commitments: BTreeMap<String, MarketCommitment>,
    /// Sum over all commitments.
    pub total_committed: u64,
    /// Oracle resolutions received so far.
    #[serde(default)]
    pub resolutions: Vec<MarketResolution>,
    /// Claims settled so far, keyed by claimant address.
    #[serde(default)]
    pub claims: BTreeMap<String, MarketClaim>,
    /// The finalized outcome, once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_outcome: Option<String>,
    /// The settlement computed at finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement: Option<MarketSettlement>,
}

impl Market {
    /// Whether the oracle quorum for finalization has been met.
    pub fn quorum_met(&self) -> bool {
        let distinct: BTreeSet<&str> = self.resolutions.iter().map(|r| r.oracle.as_str()).collect();
        distinct.len() as u32 >= self.quorum
    }

    /// Whether the named oracle has already submitted a resolution.
    pub fn has_resolved(&self, oracle: &str) -> bool {
        self.resolutions.iter().any(|r| r.oracle == oracle)
    }

    /// Whether the deadline has passed at `now_ms`.
    pub fn past_deadline(&self, now_ms: u64) -> bool {
        self.deadline.map(|d| now_ms >= d).unwrap_or(false)
    }
}
