//! The contract driver.
//!
//! Walks the in-memory contract table each tick: counterparties decide
//! pending proposals, parties record completions once the expected horizon
//! passes, and the proposer finalizes or disputes by softmax. Successful
//! submissions mirror back into the table; `NotReady`/`StateConflict`
//! outcomes leave the row untouched for the next tick.

use crate::sampling::{maybe_mutate, softmax_select};
use crate::scheduler::{Orchestrator, TickSummary};
use loom_types::agent::{ContractState};
use serde_json::json;

impl Orchestrator {
    pub(crate) async fn drive_contracts(&mut self, summary: &mut TickSummary) {
        let fiber_ids: Vec<String> = self.contracts.keys().cloned().collect();
        for fiber_id in fiber_ids {
            self.drive_contract(&fiber_id, summary).await;
        }
        // Terminal rows leave the active set once their bookkeeping is done.
        let terminal: Vec<String> = self
            .contracts
            .values()
            .filter(|c| c.state.is_terminal())
            .map(|c| c.fiber_id.clone())
            .collect();
        for fiber_id in terminal {
            self.retire_contract(&fiber_id);
        }
    }

    async fn drive_contract(&mut self, fiber_id: &str, summary: &mut TickSummary) {
        let Some(contract) = self.contracts.get(fiber_id).cloned() else {
            return;
        };
        match contract.state {
            ContractState::Proposed => {
                let Some(key) = self.acting_key(&contract.counterparty) else {
                    return;
                };
                // Accept leans on market health; rejection is the hedge.
                let accept_w = maybe_mutate(
                    0.7 * self.ctx.market_health,
                    self.config.mutation_rate,
                    &mut self.rng,
                );
                let reject_w = maybe_mutate(
                    0.3 * (1.0 - self.ctx.market_health) + 0.05,
                    self.config.mutation_rate,
                    &mut self.rng,
                );
                let Some(choice) =
                    softmax_select(&[accept_w, reject_w], self.ctx.temperature, &mut self.rng)
                else {
                    return;
                };
                if choice == 0 {
                    let result = self.engine.accept_contract(&key, fiber_id).await;
                    summary.record(&result);
                    if result.is_ok() {
                        if let Some(c) = self.contracts.get_mut(fiber_id) {
                            c.state = ContractState::Active;
                        }
                    }
                } else {
                    let result = self
                        .engine
                        .reject_contract(&key, fiber_id, Some("terms declined"))
                        .await;
                    summary.record(&result);
                    if result.is_ok() {
                        if let Some(c) = self.contracts.get_mut(fiber_id) {
                            c.state = ContractState::Rejected;
                        }
                    }
                }
            }
            ContractState::Active => {
                if self.ctx.generation < contract.expected_completion {
                    return;
                }
                // Parties that have not yet completed do so now.
                for party in [&contract.proposer, &contract.counterparty] {
                    let done = self
                        .completions
                        .get(fiber_id)
                        .map(|s| s.contains(party))
                        .unwrap_or(false);
                    if done {
                        continue;
                    }
                    let Some(key) = self.acting_key(party) else {
                        continue;
                    };
                    let proof: u64 = rand::Rng::gen(&mut self.rng);
                    let result = self
                        .engine
                        .complete_contract(&key, fiber_id, json!(format!("{proof:016x}")))
                        .await;
                    summary.record(&result);
                    if result.is_ok() {
                        self.completions
                            .entry(fiber_id.to_string())
                            .or_default()
                            .insert(party.clone());
                    }
                }

                let both_done = self
                    .completions
                    .get(fiber_id)
                    .map(|s| {
                        s.contains(&contract.proposer) && s.contains(&contract.counterparty)
                    })
                    .unwrap_or(false);
                if !both_done {
                    return;
                }
                let Some(key) = self.acting_key(&contract.proposer) else {
                    return;
                };
                let risk = self
                    .population
                    .get(&contract.proposer)
                    .map(|a| a.meta.risk_tolerance)
                    .unwrap_or(0.5);
                let finalize_w = maybe_mutate(
                    0.6 * self.ctx.market_health,
                    self.config.mutation_rate,
                    &mut self.rng,
                );
                let dispute_w = maybe_mutate(
                    0.1 * risk,
                    self.config.mutation_rate,
                    &mut self.rng,
                );
                let Some(choice) =
                    softmax_select(&[finalize_w, dispute_w], self.ctx.temperature, &mut self.rng)
                else {
                    return;
                };
                if choice == 0 {
                    let result = self.engine.finalize_contract(&key, fiber_id).await;
                    summary.record(&result);
                    if result.is_ok() {
                        self.settle_contract(fiber_id, ContractState::Completed);
                    }
                } else {
                    let result = self
                        .engine
                        .dispute_contract(&key, fiber_id, "deliverable contested")
                        .await;
                    summary.record(&result);
                    if result.is_ok() {
                        self.settle_contract(fiber_id, ContractState::Disputed);
                    }
                }
            }
            _ => {}
        }
    }

    fn settle_contract(&mut self, fiber_id: &str, outcome: ContractState) {
        let Some(contract) = self.contracts.get_mut(fiber_id) else {
            return;
        };
        contract.state = outcome;
        let parties = [contract.proposer.clone(), contract.counterparty.clone()];
        for party in parties {
            if let Some(agent) = self.population.get_mut(&party) {
                match outcome {
                    ContractState::Completed => agent.meta.completed_contracts += 1,
                    ContractState::Disputed => agent.meta.failed_contracts += 1,
                    _ => {}
                }
            }
        }
    }

    fn retire_contract(&mut self, fiber_id: &str) {
        if let Some(contract) = self.contracts.remove(fiber_id) {
            self.completions.remove(fiber_id);
            for party in [contract.proposer, contract.counterparty] {
                if let Some(agent) = self.population.get_mut(&party) {
                    agent.meta.active_contracts.remove(fiber_id);
                }
            }
        }
    }

    /// The signing key of an agent that may currently act, if any.
    pub(crate) fn acting_key(&self, address: &str) -> Option<String> {
        self.population
            .get(address)
            .filter(|a| a.can_act())
            .map(|a| a.private_key.clone())
    }
}
