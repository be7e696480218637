//! The high-throughput loop.
//!
//! Shares the bridge and registries with the standard loop but
//! short-circuits population dynamics: a small fixed population drives
//! repeatable self-loop events (contract completions, market commitments)
//! across a maintained set of in-flight fibers, pacing submissions to the
//! TPS budget with a bounded in-flight cap.

use crate::scheduler::{Orchestrator, TickSummary};
use loom_bridge::engine::{BridgeEngine, OpReceipt};
use loom_types::agent::{ContractState, MarketState, MarketType};
use loom_types::error::BridgeError;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Hard cap on concurrently in-flight submissions.
const MAX_INFLIGHT: usize = 20;
/// Population floor for throughput runs; evolution is not the point here.
const THROUGHPUT_POPULATION: usize = 8;

/// One planned submission, prepared from an immutable snapshot of the
/// registries so the executing tasks never touch shared state.
#[derive(Clone, Debug)]
enum PlannedOp {
    Complete {
        key: String,
        fiber_id: String,
        proof: String,
    },
    Commit {
        key: String,
        fiber_id: String,
        amount: u64,
        data: Value,
    },
}

async fn execute(engine: Arc<BridgeEngine>, op: PlannedOp) -> Result<OpReceipt, BridgeError> {
    match op {
        PlannedOp::Complete {
            key,
            fiber_id,
            proof,
        } => {
            engine
                .complete_contract(&key, &fiber_id, json!(proof))
                .await
        }
        PlannedOp::Commit {
            key,
            fiber_id,
            amount,
            data,
        } => engine.commit_market(&key, &fiber_id, amount, data).await,
    }
}

impl Orchestrator {
    /// Runs the high-throughput loop until `max_generations` or shutdown.
    pub async fn run_high_throughput(&mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if self.config.max_generations > 0
                && self.ctx.generation >= self.config.max_generations
            {
                return;
            }
            let summary = self.throughput_tick().await;
            println!(
                "{summary} inflight-cap={MAX_INFLIGHT} tps-target={:.1}",
                self.config.target_tps
            );
            // The tick paces itself to the TPS budget; the outer select only
            // yields and watches for shutdown.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One paced high-throughput round.
    pub async fn throughput_tick(&mut self) -> TickSummary {
        let mut summary = TickSummary {
            generation: self.ctx.generation,
            healthy: true,
            ..Default::default()
        };

        // Minimal population, no evolution.
        while self.population.living() < THROUGHPUT_POPULATION.min(self.config.target_population)
        {
            match self.birth_one().await {
                Ok(_) => summary.births += 1,
                Err(e) => {
                    tracing::warn!(target: "orchestrator", error = %e, "throughput bootstrap birth failed");
                    break;
                }
            }
        }

        self.ensure_throughput_fibers(&mut summary).await;

        // Plan the round from an immutable snapshot.
        let tick_secs =
            Duration::from_millis(self.config.generation_interval_ms).as_secs_f64();
        let ops_target = ((self.config.target_tps * tick_secs).round() as usize).max(1);
        let plan = self.plan_ops(ops_target);
        if plan.is_empty() {
            self.advance_throughput(&mut summary);
            return summary;
        }

        // Bounded concurrency plus per-op pacing: when the cap is reached,
        // the acquire waits for the earliest in-flight to resolve.
        let slice = Duration::from_secs_f64(1.0 / self.config.target_tps.max(0.001));
        let semaphore = Arc::new(tokio::sync::Semaphore::new(MAX_INFLIGHT));
        let mut handles = Vec::with_capacity(plan.len());
        for op in plan {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let engine = self.engine.clone();
            handles.push(tokio::spawn(async move {
                let result = execute(engine, op).await;
                drop(permit);
                result
            }));
            tokio::time::sleep(slice).await;
        }
        for handle in handles {
            match handle.await {
                Ok(result) => summary.record(&result),
                Err(e) => {
                    summary.record::<OpReceipt>(&Err(BridgeError::Validation(format!(
                        "submission task failed: {e}"
                    ))));
                }
            }
        }

        self.advance_throughput(&mut summary);
        summary
    }

    fn advance_throughput(&mut self, summary: &mut TickSummary) {
        let successes = f64::from(summary.successes);
        let attempts = successes + f64::from(summary.failures);
        let rate = if attempts > 0.0 { successes / attempts } else { 1.0 };
        self.ctx.advance(&self.config, rate, 0.0);
        if let Err(e) = self.wallet_pool.flush_if_dirty() {
            tracing::error!(target: "orchestrator", error = %e, "wallet pool flush failed");
        }
    }

    /// Keeps `target_active_fibers` contracts/markets in flight, creating
    /// them in repeatable states (ACTIVE contracts, OPEN markets).
    async fn ensure_throughput_fibers(&mut self, summary: &mut TickSummary) {
        let mut guard = 0;
        while self.active_fibers() < self.config.target_active_fibers && guard < 8 {
            guard += 1;
            if self.rng.gen_bool(0.6) {
                let Some(proposer) = self.sample_actors().into_iter().next() else {
                    return;
                };
                self.propose_contract(&proposer, summary).await;
                // Drive straight to ACTIVE so completes are available.
                let pending: Vec<(String, String)> = self
                    .contracts
                    .values()
                    .filter(|c| c.state == ContractState::Proposed)
                    .map(|c| (c.fiber_id.clone(), c.counterparty.clone()))
                    .collect();
                for (fiber_id, counterparty) in pending {
                    let Some(key) = self.acting_key(&counterparty) else {
                        continue;
                    };
                    let result = self.engine.accept_contract(&key, &fiber_id).await;
                    summary.record(&result);
                    if result.is_ok() {
                        if let Some(c) = self.contracts.get_mut(&fiber_id) {
                            c.state = ContractState::Active;
                        }
                    }
                }
            } else {
                let Some(creator) = self.sample_actors().into_iter().next() else {
                    return;
                };
                self.propose_market(&creator, MarketType::Prediction, summary)
                    .await;
                let pending: Vec<(String, String)> = self
                    .markets
                    .values()
                    .filter(|m| m.state == MarketState::Proposed)
                    .map(|m| (m.fiber_id.clone(), m.creator.clone()))
                    .collect();
                for (fiber_id, creator) in pending {
                    let Some(key) = self.acting_key(&creator) else {
                        continue;
                    };
                    let result = self.engine.open_market(&key, &fiber_id).await;
                    summary.record(&result);
                    if result.is_ok() {
                        if let Some(m) = self.markets.get_mut(&fiber_id) {
                            m.state = MarketState::Open;
                        }
                    }
                }
            }
        }
    }

    /// Round-robins repeatable events across the in-flight fibers.
    fn plan_ops(&mut self, count: usize) -> Vec<PlannedOp> {
        let mut pool: Vec<PlannedOp> = Vec::new();
        for contract in self
            .contracts
            .values()
            .filter(|c| c.state == ContractState::Active)
        {
            for party in [&contract.proposer, &contract.counterparty] {
                if let Some(key) = self.acting_key(party) {
                    pool.push(PlannedOp::Complete {
                        key,
                        fiber_id: contract.fiber_id.clone(),
                        proof: String::new(),
                    });
                }
            }
        }
        for market in self
            .markets
            .values()
            .filter(|m| m.state == MarketState::Open)
        {
            for agent in self.population.actors() {
                if agent.address == market.creator {
                    continue;
                }
                pool.push(PlannedOp::Commit {
                    key: agent.private_key.clone(),
                    fiber_id: market.fiber_id.clone(),
                    amount: 0, // Filled per-op below.
                    data: json!({}),
                });
            }
        }
        if pool.is_empty() {
            return Vec::new();
        }

        let mut plan = Vec::with_capacity(count);
        for i in 0..count {
            let template = pool[i % pool.len()].clone();
            plan.push(match template {
                PlannedOp::Complete { key, fiber_id, .. } => {
                    let proof: u64 = self.rng.gen();
                    PlannedOp::Complete {
                        key,
                        fiber_id,
                        proof: format!("{proof:016x}"),
                    }
                }
                PlannedOp::Commit { key, fiber_id, .. } => {
                    let outcome = if self.rng.gen_bool(0.5) { "YES" } else { "NO" };
                    PlannedOp::Commit {
                        key,
                        fiber_id,
                        amount: self.rng.gen_range(10..=200),
                        data: json!({ "outcome": outcome }),
                    }
                }
            });
        }
        plan
    }
}
