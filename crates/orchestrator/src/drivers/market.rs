//! The market driver.
//!
//! Drives markets through `OPEN → CLOSED → RESOLVING → SETTLED`, honoring
//! the oracle quorum for finalization and the funding threshold for
//! refunds, and auto-closing once the deadline passes. Settled and
//! refunded markets stay tracked until every committer has claimed.

use crate::sampling::{maybe_mutate, softmax_select, weighted_sample_distinct};
use crate::scheduler::{Orchestrator, TickSummary};
use loom_types::agent::{MarketCommitment, MarketResolution, MarketState, MarketType};
use loom_types::time::now_ms;
use loom_workflows::{claim_amount, settle_market};
use rand::Rng;
use serde_json::json;
use std::collections::BTreeMap;

/// Commit attempts sampled per open market per tick.
const COMMITS_PER_TICK: usize = 3;

impl Orchestrator {
    pub(crate) async fn drive_markets(&mut self, summary: &mut TickSummary) {
        let fiber_ids: Vec<String> = self.markets.keys().cloned().collect();
        let mut retired = Vec::new();
        for fiber_id in fiber_ids {
            if self.drive_market(&fiber_id, summary).await {
                retired.push(fiber_id);
            }
        }
        for fiber_id in retired {
            self.retire_market(&fiber_id);
        }
    }

    /// Returns true when the market can leave the active table.
    async fn drive_market(&mut self, fiber_id: &str, summary: &mut TickSummary) -> bool {
        let Some(market) = self.markets.get(fiber_id).cloned() else {
            return true;
        };
        let now = now_ms();
        match market.state {
            MarketState::Proposed => {
                let Some(key) = self.acting_key(&market.creator) else {
                    return false;
                };
                let open_w = maybe_mutate(
                    0.9 * self.ctx.market_health,
                    self.config.mutation_rate,
                    &mut self.rng,
                );
                let cancel_w =
                    maybe_mutate(0.05, self.config.mutation_rate, &mut self.rng);
                match softmax_select(&[open_w, cancel_w], self.ctx.temperature, &mut self.rng) {
                    Some(0) => {
                        let result = self.engine.open_market(&key, fiber_id).await;
                        summary.record(&result);
                        if result.is_ok() {
                            if let Some(m) = self.markets.get_mut(fiber_id) {
                                m.state = MarketState::Open;
                            }
                        }
                    }
                    Some(_) => {
                        let result = self.engine.cancel_market(&key, fiber_id).await;
                        summary.record(&result);
                        if result.is_ok() {
                            if let Some(m) = self.markets.get_mut(fiber_id) {
                                m.state = MarketState::Cancelled;
                            }
                        }
                    }
                    None => {}
                }
                false
            }
            MarketState::Open => {
                self.market_commit_round(&market.fiber_id, summary).await;
                let market = match self.markets.get(fiber_id) {
                    Some(m) => m.clone(),
                    None => return true,
                };

                // Shortfall at the deadline refunds instead of closing.
                if let Some(threshold) = market.threshold {
                    if market.past_deadline(now) && market.total_committed < threshold {
                        if let Some(key) = self.any_participant_key(&market) {
                            let result = self.engine.refund_market(&key, fiber_id).await;
                            summary.record(&result);
                            if result.is_ok() {
                                self.mirror_refund(fiber_id);
                            }
                        }
                        return false;
                    }
                }

                let enough_commitments = market.commitments.len() >= COMMITS_PER_TICK;
                if market.past_deadline(now) || (enough_commitments && self.rng.gen_bool(0.5)) {
                    if let Some(key) = self.acting_key(&market.creator) {
                        let result = self.engine.close_market(&key, fiber_id).await;
                        summary.record(&result);
                        if result.is_ok() {
                            if let Some(m) = self.markets.get_mut(fiber_id) {
                                m.state = MarketState::Closed;
                            }
                        }
                    }
                }
                false
            }
            MarketState::Closed | MarketState::Resolving => {
                self.market_resolution_round(&market.fiber_id, summary).await;
                let market = match self.markets.get(fiber_id) {
                    Some(m) => m.clone(),
                    None => return true,
                };

                // Threshold markets that slipped through still refund.
                if market.state == MarketState::Closed {
                    if let Some(threshold) = market.threshold {
                        if market.total_committed < threshold {
                            if let Some(key) = self.any_participant_key(&market) {
                                let result = self.engine.refund_market(&key, fiber_id).await;
                                summary.record(&result);
                                if result.is_ok() {
                                    self.mirror_refund(fiber_id);
                                }
                            }
                            return false;
                        }
                    }
                }

                if market.state == MarketState::Resolving && market.quorum_met() {
                    if let Some(key) = self.any_participant_key(&market) {
                        let result = self.engine.finalize_market(&key, fiber_id).await;
                        summary.record(&result);
                        if result.is_ok() {
                            self.mirror_settlement(fiber_id);
                        }
                    }
                }
                false
            }
            MarketState::Settled | MarketState::Refunded => {
                self.market_claim_round(&market.fiber_id, summary).await;
                let market = match self.markets.get(fiber_id) {
                    Some(m) => m.clone(),
                    None => return true,
                };
                market.commitments.keys().all(|c| market.claims.contains_key(c))
            }
            MarketState::Cancelled => true,
        }
    }

    async fn market_commit_round(&mut self, fiber_id: &str, summary: &mut TickSummary) {
        let Some(market) = self.markets.get(fiber_id).cloned() else {
            return;
        };
        let candidates: Vec<(String, String, f64)> = self
            .population
            .actors()
            .into_iter()
            .filter(|a| a.address != market.creator)
            .map(|a| {
                (
                    a.address.clone(),
                    a.private_key.clone(),
                    a.fitness.total + 0.05,
                )
            })
            .collect();
        if candidates.is_empty() {
            return;
        }
        let weights: Vec<f64> = candidates.iter().map(|(_, _, w)| *w).collect();
        let picks = weighted_sample_distinct(&weights, COMMITS_PER_TICK, &mut self.rng);
        for i in picks {
            let (address, key, _) = &candidates[i];
            let amount: u64 = self.rng.gen_range(10..=200);
            let data = match market.market_type {
                MarketType::Prediction => {
                    let outcome = if self.rng.gen_bool(0.5) { "YES" } else { "NO" };
                    json!({ "outcome": outcome })
                }
                _ => json!({}),
            };
            let result = self
                .engine
                .commit_market(key, fiber_id, amount, data.clone())
                .await;
            summary.record(&result);
            if result.is_ok() {
                if let Some(m) = self.markets.get_mut(fiber_id) {
                    let entry =
                        m.commitments
                            .entry(address.clone())
                            .or_insert(MarketCommitment {
                                amount: 0,
                                data: data.clone(),
                                last_commit_at: 0,
                            });
                    entry.amount += amount;
                    entry.last_commit_at = now_ms();
                    m.total_committed += amount;
                }
                if let Some(agent) = self.population.get_mut(address) {
                    agent.meta.active_markets.insert(fiber_id.to_string());
                }
            }
        }
    }

    async fn market_resolution_round(&mut self, fiber_id: &str, summary: &mut TickSummary) {
        let Some(market) = self.markets.get(fiber_id).cloned() else {
            return;
        };
        for oracle in &market.oracles {
            if market.has_resolved(oracle) {
                continue;
            }
            let Some(key) = self.acting_key(oracle) else {
                continue;
            };
            let outcome = if self.rng.gen_bool(0.5) { "YES" } else { "NO" };
            let result = self
                .engine
                .submit_resolution(&key, fiber_id, outcome, None)
                .await;
            summary.record(&result);
            if result.is_ok() {
                if let Some(m) = self.markets.get_mut(fiber_id) {
                    m.state = MarketState::Resolving;
                    m.resolutions.push(MarketResolution {
                        oracle: oracle.clone(),
                        outcome: outcome.to_string(),
                        proof: None,
                        submitted_at: now_ms(),
                    });
                }
            }
        }
    }

    async fn market_claim_round(&mut self, fiber_id: &str, summary: &mut TickSummary) {
        let Some(market) = self.markets.get(fiber_id).cloned() else {
            return;
        };
        for (address, commitment) in &market.commitments {
            if market.claims.contains_key(address) {
                continue;
            }
            let Some(key) = self.acting_key(address) else {
                continue;
            };
            let result = self.engine.claim_market(&key, fiber_id).await;
            summary.record(&result);
            if result.is_ok() {
                let amount = match (&market.settlement, market.state) {
                    (Some(settlement), _) => claim_amount(settlement, address),
                    (None, MarketState::Refunded) => commitment.amount,
                    _ => 0,
                };
                if let Some(m) = self.markets.get_mut(fiber_id) {
                    m.claims.insert(
                        address.clone(),
                        loom_types::agent::MarketClaim {
                            claimed_at: now_ms(),
                            amount,
                        },
                    );
                }
            }
        }
    }

    /// Finalization mirror: majority outcome plus the deterministic payout
    /// table.
    fn mirror_settlement(&mut self, fiber_id: &str) {
        let Some(market) = self.markets.get(fiber_id).cloned() else {
            return;
        };
        let outcome = majority_outcome(&market.resolutions);
        let settlement = settle_market(&market, outcome.as_deref());
        if let Some(m) = self.markets.get_mut(fiber_id) {
            m.state = MarketState::Settled;
            m.final_outcome = outcome;
            m.settlement = Some(settlement);
        }
    }

    fn mirror_refund(&mut self, fiber_id: &str) {
        let Some(market) = self.markets.get(fiber_id).cloned() else {
            return;
        };
        let mut refunded = market.clone();
        refunded.state = MarketState::Refunded;
        let settlement = settle_market(&refunded, None);
        if let Some(m) = self.markets.get_mut(fiber_id) {
            m.state = MarketState::Refunded;
            m.settlement = Some(settlement);
        }
    }

    fn retire_market(&mut self, fiber_id: &str) {
        if let Some(market) = self.markets.remove(fiber_id) {
            let mut members: Vec<String> = market.commitments.keys().cloned().collect();
            members.push(market.creator);
            for member in members {
                if let Some(agent) = self.population.get_mut(&member) {
                    agent.meta.active_markets.remove(fiber_id);
                }
            }
        }
    }

    /// Any committed or creating agent able to act, preferring the creator.
    fn any_participant_key(&self, market: &loom_types::agent::Market) -> Option<String> {
        self.acting_key(&market.creator).or_else(|| {
            market
                .commitments
                .keys()
                .find_map(|addr| self.acting_key(addr))
        })
    }
}

fn majority_outcome(resolutions: &[MarketResolution]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for r in resolutions {
        *counts.entry(r.outcome.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|(a_outcome, a_count), (b_outcome, b_count)| {
            a_count.cmp(b_count).then(b_outcome.cmp(a_outcome))
        })
        .map(|(outcome, _)| outcome.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolution(oracle: &str, outcome: &str) -> MarketResolution {
        MarketResolution {
            oracle: oracle.into(),
            outcome: outcome.into(),
            proof: None,
            submitted_at: 0,
        }
    }

    #[test]
    fn majority_outcome_breaks_ties_deterministically() {
        assert_eq!(majority_outcome(&[]), None);
        assert_eq!(
            majority_outcome(&[
                resolution("a", "YES"),
                resolution("b", "NO"),
                resolution("c", "YES"),
            ]),
            Some("YES".to_string())
        );
        // A tie picks the lexicographically smaller outcome.
        assert_eq!(
            majority_outcome(&[resolution("a", "YES"), resolution("b", "NO")]),
            Some("NO".to_string())
        );
    }
}
