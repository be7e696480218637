//! The proposal phase: actors spawning new contract and market fibers.

use crate::sampling::weighted_sample;
use crate::scheduler::{Orchestrator, TickSummary};
use loom_types::agent::{Contract, ContractState, Market, MarketState, MarketType};
use loom_types::config::RunMode;
use rand::Rng;
use serde_json::json;
use std::collections::BTreeMap;

/// Peers sharing more than this many open contracts are not proposed to.
const CONNECTION_CAP: usize = 3;

/// Default workflow mix when `FIBER_WEIGHTS` is not configured.
fn default_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("Contract".to_string(), 0.5),
        ("Prediction".to_string(), 0.2),
        ("Auction".to_string(), 0.1),
        ("Crowdfund".to_string(), 0.1),
        ("GroupBuy".to_string(), 0.1),
    ])
}

impl Orchestrator {
    /// With probability `proposal_rate` per active agent, proposes a new
    /// contract or market and registers it in the in-memory maps.
    pub(crate) async fn proposal_phase(&mut self, summary: &mut TickSummary) {
        let actors: Vec<String> = self
            .population
            .actors()
            .into_iter()
            .map(|a| a.address.clone())
            .collect();
        for address in actors {
            if !self.rng.gen_bool(self.config.proposal_rate.clamp(0.0, 1.0)) {
                continue;
            }
            self.propose_one(&address, summary).await;
        }
    }

    /// Weighted mode: keep the in-flight fiber count at target by creating
    /// fibers drawn from the configured type distribution.
    pub(crate) async fn ensure_fiber_distribution(&mut self, summary: &mut TickSummary) {
        if self.config.mode != RunMode::Weighted {
            return;
        }
        let mut guard = 0;
        while self.active_fibers() < self.config.target_active_fibers && guard < 16 {
            guard += 1;
            let Some(address) = self.sample_actors().into_iter().next() else {
                return;
            };
            self.propose_one(&address, summary).await;
        }
    }

    async fn propose_one(&mut self, address: &str, summary: &mut TickSummary) {
        let weights = if self.config.fiber_weights.is_empty() {
            default_weights()
        } else {
            self.config.fiber_weights.clone()
        };
        let kinds: Vec<&String> = weights.keys().collect();
        let kind_weights: Vec<f64> = weights.values().copied().collect();
        let Some(i) = weighted_sample(&kind_weights, &mut self.rng) else {
            return;
        };
        match kinds[i].as_str() {
            "Contract" => self.propose_contract(address, summary).await,
            "Prediction" => {
                self.propose_market(address, MarketType::Prediction, summary)
                    .await
            }
            "Auction" => {
                self.propose_market(address, MarketType::Auction, summary)
                    .await
            }
            "Crowdfund" => {
                self.propose_market(address, MarketType::Crowdfund, summary)
                    .await
            }
            "GroupBuy" => {
                self.propose_market(address, MarketType::GroupBuy, summary)
                    .await
            }
            other => {
                tracing::debug!(target: "orchestrator", kind = other, "unweighted fiber kind ignored");
            }
        }
    }

    pub(crate) async fn propose_contract(&mut self, address: &str, summary: &mut TickSummary) {
        let Some(counterparty) = self.pick_counterparty(address, CONNECTION_CAP) else {
            return;
        };
        let Some(agent) = self.population.get(address) else {
            return;
        };
        let key = agent.private_key.clone();
        let task: u32 = self.rng.gen_range(1..=999);
        let value: u64 = self.rng.gen_range(10..=500);
        let horizon: u64 = self.rng.gen_range(2..=5);
        let terms = json!({ "task": format!("task-{task:03}"), "value": value });

        let result = self
            .engine
            .propose_contract(&key, &counterparty, terms.clone(), Some(horizon))
            .await;
        match result {
            Ok(created) => {
                summary.successes += 1;
                let generation = self.ctx.generation;
                self.contracts.insert(
                    created.fiber_id.clone(),
                    Contract {
                        fiber_id: created.fiber_id.clone(),
                        proposer: address.to_string(),
                        counterparty: counterparty.clone(),
                        state: ContractState::Proposed,
                        terms,
                        created_generation: generation,
                        expected_completion: generation + horizon,
                    },
                );
                for party in [address, counterparty.as_str()] {
                    if let Some(agent) = self.population.get_mut(party) {
                        agent.meta.active_contracts.insert(created.fiber_id.clone());
                    }
                }
            }
            Err(e) => {
                summary.record::<()>(&Err(e));
            }
        }
    }

    pub(crate) async fn propose_market(
        &mut self,
        address: &str,
        market_type: MarketType,
        summary: &mut TickSummary,
    ) {
        let oracles: Vec<String> = match market_type {
            MarketType::Prediction => {
                let mut oracles: Vec<String> = self
                    .population
                    .actors()
                    .into_iter()
                    .filter(|a| a.meta.is_oracle)
                    .map(|a| a.address.clone())
                    .take(3)
                    .collect();
                // The creator backstops markets with no oracle-capable peers.
                if oracles.is_empty() {
                    oracles.push(address.to_string());
                }
                oracles
            }
            _ => Vec::new(),
        };
        let quorum = match market_type {
            MarketType::Prediction => 1 + (oracles.len() as u32 - 1) / 2,
            _ => 0,
        };
        let deadline = Some(self.market_deadline());
        let threshold = match market_type {
            MarketType::Crowdfund | MarketType::GroupBuy => {
                Some(self.rng.gen_range(200..=800))
            }
            _ => None,
        };

        let Some(agent) = self.population.get(address) else {
            return;
        };
        let key = agent.private_key.clone();
        let result = self
            .engine
            .create_market(&key, market_type, &oracles, quorum, deadline, threshold, None)
            .await;
        match result {
            Ok(created) => {
                summary.successes += 1;
                self.markets.insert(
                    created.fiber_id.clone(),
                    Market {
                        fiber_id: created.fiber_id.clone(),
                        market_type,
                        creator: address.to_string(),
                        oracles: oracles.into_iter().collect(),
                        quorum,
                        deadline,
                        threshold,
                        state: MarketState::Proposed,
                        commitments: BTreeMap::new(),
                        total_committed: 0,
                        resolutions: Vec::new(),
                        claims: BTreeMap::new(),
                        final_outcome: None,
                        settlement: None,
                    },
                );
                if let Some(agent) = self.population.get_mut(address) {
                    agent.meta.active_markets.insert(created.fiber_id.clone());
                }
            }
            Err(e) => {
                summary.record::<()>(&Err(e));
            }
        }
    }
}
