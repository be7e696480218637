//! Client-side role/state availability tables.
//!
//! These mirror the on-chain guards so the orchestrator never submits an
//! event the metagraph would reject. The on-chain guard stays authoritative;
//! anything allowed here can still bounce and come back through the
//! rejection channel.

use loom_types::agent::{Agent, AgentState, Contract, ContractState, Market, MarketState};

/// Events the given agent may fire on a market in its current state.
pub fn available_market_events(market: &Market, agent: &str, now_ms: u64) -> Vec<&'static str> {
    let is_creator = market.creator == agent;
    let is_oracle = market.oracles.contains(agent);
    let is_committed = market.commitments.contains_key(agent);
    let mut events = Vec::new();

    match market.state {
        MarketState::Proposed => {
            if is_creator {
                events.push("open");
                events.push("cancel");
            }
        }
        MarketState::Open => {
            events.push("commit");
            if is_creator || market.past_deadline(now_ms) {
                events.push("close");
            }
            if shortfall(market, now_ms) {
                events.push("refund");
            }
        }
        MarketState::Closed => {
            if is_oracle && !market.has_resolved(agent) {
                events.push("submit_resolution");
            }
            if shortfall(market, now_ms) {
                events.push("refund");
            }
        }
        MarketState::Resolving => {
            if is_oracle && !market.has_resolved(agent) {
                events.push("submit_resolution");
            }
            if market.quorum_met() {
                events.push("finalize");
            }
        }
        MarketState::Settled | MarketState::Refunded => {
            if is_committed && !market.claims.contains_key(agent) {
                events.push("claim");
            }
        }
        MarketState::Cancelled => {}
    }
    events
}

fn shortfall(market: &Market, now_ms: u64) -> bool {
    match market.threshold {
        Some(threshold) => market.past_deadline(now_ms) && market.total_committed < threshold,
        None => false,
    }
}

/// Events the given agent may fire on a contract in its current state.
pub fn available_contract_events(contract: &Contract, agent: &str) -> Vec<&'static str> {
    let is_proposer = contract.proposer == agent;
    let is_counterparty = contract.counterparty == agent;
    let is_party = is_proposer || is_counterparty;
    let mut events = Vec::new();

    match contract.state {
        ContractState::Proposed => {
            if is_counterparty {
                events.push("accept");
                events.push("reject");
            }
        }
        ContractState::Active => {
            if is_party {
                events.push("complete");
                events.push("dispute");
            }
            if is_proposer {
                events.push("finalize");
            }
        }
        _ => {}
    }
    events
}

/// Identity events the agent may fire on its own fiber.
pub fn available_identity_events(agent: &Agent) -> Vec<&'static str> {
    match agent.state {
        AgentState::Registered => vec!["activate"],
        AgentState::Active => vec!["vouch", "withdraw"],
        AgentState::Challenged => vec!["respond"],
        AgentState::Probation => vec!["restore", "withdraw"],
        AgentState::Suspended | AgentState::Unregistered | AgentState::Withdrawn => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::agent::{MarketCommitment, MarketResolution, MarketType};
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn market(state: MarketState) -> Market {
        Market {
            fiber_id: "m-1".into(),
            market_type: MarketType::Prediction,
            creator: "creator".into(),
            oracles: BTreeSet::from(["oracle".to_string()]),
            quorum: 1,
            deadline: Some(2_000),
            threshold: None,
            state,
            commitments: BTreeMap::new(),
            total_committed: 0,
            resolutions: vec![],
            claims: BTreeMap::new(),
            final_outcome: None,
            settlement: None,
        }
    }

    #[test]
    fn only_the_creator_closes_before_deadline() {
        let m = market(MarketState::Open);
        assert!(available_market_events(&m, "creator", 1_000).contains(&"close"));
        assert!(!available_market_events(&m, "someone", 1_000).contains(&"close"));
        // Past deadline, anyone may close.
        assert!(available_market_events(&m, "someone", 3_000).contains(&"close"));
    }

    #[test]
    fn oracles_resolve_once() {
        let mut m = market(MarketState::Resolving);
        assert!(available_market_events(&m, "oracle", 1_000).contains(&"submit_resolution"));
        m.resolutions.push(MarketResolution {
            oracle: "oracle".into(),
            outcome: "YES".into(),
            proof: None,
            submitted_at: 1,
        });
        assert!(!available_market_events(&m, "oracle", 1_000).contains(&"submit_resolution"));
        // Quorum of one is now met: anyone may finalize.
        assert!(available_market_events(&m, "someone", 1_000).contains(&"finalize"));
    }

    #[test]
    fn refund_requires_shortfall_at_deadline() {
        let mut m = market(MarketState::Open);
        m.threshold = Some(500);
        m.total_committed = 120;
        assert!(!available_market_events(&m, "x", 1_000).contains(&"refund"));
        assert!(available_market_events(&m, "x", 2_000).contains(&"refund"));
        m.total_committed = 600;
        assert!(!available_market_events(&m, "x", 2_000).contains(&"refund"));
    }

    #[test]
    fn committers_claim_once_after_settlement() {
        let mut m = market(MarketState::Settled);
        m.commitments.insert(
            "p1".into(),
            MarketCommitment {
                amount: 50,
                data: json!({"outcome": "YES"}),
                last_commit_at: 1,
            },
        );
        assert_eq!(available_market_events(&m, "p1", 1_000), vec!["claim"]);
        assert!(available_market_events(&m, "p2", 1_000).is_empty());
    }

    #[test]
    fn contract_roles_gate_events() {
        let c = Contract {
            fiber_id: "c-1".into(),
            proposer: "a".into(),
            counterparty: "b".into(),
            state: ContractState::Proposed,
            terms: json!({"task": "x"}),
            created_generation: 0,
            expected_completion: 5,
        };
        assert_eq!(available_contract_events(&c, "b"), vec!["accept", "reject"]);
        assert!(available_contract_events(&c, "a").is_empty());
        assert!(available_contract_events(&c, "stranger").is_empty());
    }
}
