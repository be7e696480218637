//! The generational scheduler.
//!
//! Each tick: gate on cluster health, run population dynamics, sample
//! actors by fitness, pick their next transition by softmax over mutated
//! weights, submit through the bridge, run the proposal phase and the
//! contract/market drivers, recompute fitness, and anneal the context.

use crate::context::SimContext;
use crate::population::Population;
use crate::rejections::RejectionLedger;
use crate::sampling::{maybe_mutate, softmax_select, weighted_sample, weighted_sample_distinct};
use crate::wallet_pool::WalletPool;
use loom_bridge::engine::{BridgeEngine, OpReceipt};
use loom_client::HealthApi;
use loom_crypto::KeyPair;
use loom_telemetry::{bridge_metrics, orchestrator_metrics};
use loom_types::agent::{AgentState, Contract, ContractState, Market};
use loom_types::config::{OrchestratorConfig, RunMode};
use loom_types::error::{BridgeError, ErrorCode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome counters for one generation tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickSummary {
    pub generation: u64,
    pub healthy: bool,
    pub successes: u32,
    pub failures: u32,
    pub skips: u32,
    pub births: u32,
    pub deaths: u32,
}

impl fmt::Display for TickSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gen={} ok={} fail={} skip={} births={} deaths={} health={}",
            self.generation,
            self.successes,
            self.failures,
            self.skips,
            self.births,
            self.deaths,
            if self.healthy { "ready" } else { "not-ready" }
        )
    }
}

impl TickSummary {
    pub(crate) fn record<T>(&mut self, result: &Result<T, BridgeError>) {
        match result {
            Ok(_) => {
                self.successes += 1;
                bridge_metrics().inc_submissions("ok");
            }
            Err(e) if !e.counts_as_failure() => {
                self.skips += 1;
                bridge_metrics().inc_submissions(e.code());
            }
            Err(e) => {
                self.failures += 1;
                bridge_metrics().inc_submissions(e.code());
            }
        }
    }

    fn success_rate(&self) -> f64 {
        let attempts = self.successes + self.failures;
        if attempts == 0 {
            1.0
        } else {
            f64::from(self.successes) / f64::from(attempts)
        }
    }
}

/// The orchestrator: population, in-memory fiber registries, and the tick
/// loop driving them against the bridge.
pub struct Orchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) engine: Arc<BridgeEngine>,
    health: Arc<dyn HealthApi>,
    pub(crate) population: Population,
    /// Single-writer per fiber: only the tick loop mutates these maps.
    pub(crate) contracts: HashMap<String, Contract>,
    pub(crate) markets: HashMap<String, Market>,
    /// Local mirror of `stateData.completions` per contract fiber.
    pub(crate) completions: HashMap<String, BTreeSet<String>>,
    pub(crate) wallet_pool: WalletPool,
    pub(crate) ctx: SimContext,
    pub(crate) rng: StdRng,
    name_counter: u64,
    /// Target picked during choice building, consumed when the challenge
    /// choice fires.
    challenge_target: Option<String>,
    /// Rejection-feed bookkeeping.
    pub(crate) rejections: RejectionLedger,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<BridgeEngine>,
        health: Arc<dyn HealthApi>,
        wallet_pool: WalletPool,
    ) -> Self {
        let ctx = SimContext::new(&config);
        Self {
            config,
            engine,
            health,
            population: Population::new(),
            contracts: HashMap::new(),
            markets: HashMap::new(),
            completions: HashMap::new(),
            wallet_pool,
            ctx,
            rng: StdRng::from_entropy(),
            name_counter: 0,
            challenge_target: None,
            rejections: RejectionLedger::default(),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(
        config: OrchestratorConfig,
        engine: Arc<BridgeEngine>,
        health: Arc<dyn HealthApi>,
        wallet_pool: WalletPool,
        seed: u64,
    ) -> Self {
        let mut this = Self::new(config, engine, health, wallet_pool);
        this.rng = StdRng::seed_from_u64(seed);
        this
    }

    /// Registers and activates agents until the target population exists.
    /// Intended for boot; the tick loop tops the population up afterwards.
    pub async fn bootstrap(&mut self) {
        let mut failures = 0u32;
        while self.population.living() < self.config.target_population && failures < 3 {
            match self.birth_one().await {
                Ok(address) => {
                    tracing::info!(target: "orchestrator", address = %address, "bootstrap agent ready")
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(target: "orchestrator", error = %e, "bootstrap birth failed");
                }
            }
        }
        if let Err(e) = self.wallet_pool.flush_if_dirty() {
            tracing::error!(target: "orchestrator", error = %e, "wallet pool flush failed");
        }
    }

    /// Runs ticks until `max_generations` (0 = forever) or shutdown.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.generation_interval_ms);
        loop {
            if self.config.max_generations > 0
                && self.ctx.generation >= self.config.max_generations
            {
                tracing::info!(target: "orchestrator", generation = self.ctx.generation, "max generations reached");
                return;
            }
            let summary = self.tick().await;
            println!("{summary} temp={:.2} mh={:.2}", self.ctx.temperature, self.ctx.market_health);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    tracing::info!(target: "orchestrator", "shutdown requested, stopping tick loop");
                    return;
                }
            }
        }
    }

    /// One generation.
    pub async fn tick(&mut self) -> TickSummary {
        let _timer = loom_telemetry::time::TickTimer::new(orchestrator_metrics());
        let mut summary = TickSummary {
            generation: self.ctx.generation,
            ..Default::default()
        };

        // 1. Health gate: a not-ready or forked cluster skips the tick
        //    entirely; zero submissions may be issued.
        match self.health.sync_status().await {
            Ok(status) if status.all_ready() && !status.fork_suspected() => {
                summary.healthy = true;
            }
            Ok(status) => {
                tracing::warn!(
                    target: "orchestrator",
                    all_ready = status.all_ready(),
                    fork = status.fork_suspected(),
                    "cluster not ready, skipping tick"
                );
                self.finish_tick(&mut summary);
                return summary;
            }
            Err(e) => {
                tracing::warn!(target: "orchestrator", error = %e, "health probe failed, skipping tick");
                self.finish_tick(&mut summary);
                return summary;
            }
        }

        // 2. Population dynamics.
        if self.config.mode != RunMode::Weighted {
            self.births(&mut summary).await;
            self.deaths(&mut summary).await;
        }

        // 3–6. Actor sampling and identity-event submission.
        self.actor_phase(&mut summary).await;

        // 7. Proposal phase (weighted mode tops up the fixed fiber mix
        //    instead of evolving proposals).
        if self.config.mode == RunMode::Weighted {
            self.ensure_fiber_distribution(&mut summary).await;
        } else {
            self.proposal_phase(&mut summary).await;
        }

        // Guard-rule rejections reported since the last tick feed back into
        // progression before the drivers run.
        self.absorb_rejections().await;

        // 8. Contract driver.
        self.drive_contracts(&mut summary).await;

        // 9. Market driver.
        self.drive_markets(&mut summary).await;

        // 10–11. Fitness recompute and context update.
        self.finish_tick(&mut summary);
        summary
    }

    fn finish_tick(&mut self, summary: &mut TickSummary) {
        self.population
            .recompute_fitness(&self.config.fitness_weights, self.ctx.generation);
        let perturbation = self.rng.gen_range(-0.02..=0.02);
        self.ctx
            .advance(&self.config, summary.success_rate(), perturbation);

        orchestrator_metrics().set_population(self.population.living() as u64);
        orchestrator_metrics().set_active_fibers(self.active_fibers() as u64);
        if let Err(e) = self.wallet_pool.flush_if_dirty() {
            tracing::error!(target: "orchestrator", error = %e, "wallet pool flush failed");
        }
    }

    /// Non-terminal fibers currently tracked.
    pub fn active_fibers(&self) -> usize {
        self.contracts.len() + self.markets.len()
    }

    pub fn generation(&self) -> u64 {
        self.ctx.generation
    }

    pub fn population(&self) -> &Population {
        &self.population
    }

    // --- Births & deaths -----------------------------------------------

    async fn births(&mut self, summary: &mut TickSummary) {
        let mut born = 0usize;
        while self.population.living() < self.config.target_population
            && born < self.config.birth_rate
        {
            match self.birth_one().await {
                Ok(address) => {
                    born += 1;
                    summary.births += 1;
                    tracing::info!(target: "orchestrator", address = %address, "agent born");
                }
                Err(e) => {
                    tracing::warn!(target: "orchestrator", error = %e, "birth failed");
                    summary.failures += 1;
                    break;
                }
            }
        }
        if summary.births > 0 {
            orchestrator_metrics().inc_births(u64::from(summary.births));
        }
    }

    /// Registers and activates one agent, drawing from the wallet pool
    /// before generating fresh keys.
    pub(crate) async fn birth_one(&mut self) -> Result<String, BridgeError> {
        self.name_counter += 1;
        let (keypair, handle) = match self.wallet_pool.draw_unregistered() {
            Some(wallet) => {
                let keypair = KeyPair::from_private_hex(&wallet.private_key)
                    .map_err(|e| BridgeError::SignatureRefused(e.to_string()))?;
                (keypair, wallet.handle)
            }
            None => {
                let keypair = KeyPair::generate();
                let handle = format!("agent-{:04}", self.name_counter);
                self.wallet_pool.add_generated(&keypair, handle.clone());
                (keypair, handle)
            }
        };

        let private_key = keypair.private_hex();
        let registered = self
            .engine
            .register_agent(&private_key, Some(&handle), Some("generated"), None)
            .await?;
        self.wallet_pool
            .mark_registered(&registered.address, &registered.fiber_id);

        // The freshly created fiber may not be snapshot-visible yet; wait,
        // then activate with escalating backoff on transient sync errors.
        self.engine
            .reconciler()
            .wait_for_fiber_visible(
                &registered.fiber_id,
                Duration::from_secs(30).min(Duration::from_millis(
                    self.config.generation_interval_ms.max(1_000) * 6,
                )),
            )
            .await?;

        let mut attempt = 0u32;
        loop {
            match self
                .engine
                .activate_agent(&private_key, &registered.fiber_id)
                .await
            {
                Ok(_) => break,
                Err(BridgeError::NotReady(_)) if attempt < 3 => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(250 * 2u64.pow(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }

        let is_oracle = self.rng.gen_bool(0.2);
        let risk_tolerance = self.rng.gen_range(0.1..0.9);
        let generation = self.ctx.generation;
        let agent = self.population.spawn(
            registered.address.clone(),
            private_key,
            handle,
            "generated".to_string(),
            generation,
            is_oracle,
            risk_tolerance,
        );
        agent.fiber_id = Some(registered.fiber_id);
        agent.state = AgentState::Active;
        Ok(registered.address)
    }

    async fn deaths(&mut self, summary: &mut TickSummary) {
        let quota = (self.config.death_rate * self.population.living() as f64).floor() as usize;
        if quota == 0 {
            return;
        }
        for address in self.population.lowest_fitness(quota) {
            let Some(agent) = self.population.get(&address) else {
                continue;
            };
            let Some(fiber_id) = agent.fiber_id.clone() else {
                continue;
            };
            let key = agent.private_key.clone();
            let result = self.engine.withdraw_agent(&key, &fiber_id).await;
            summary.record(&result);
            if result.is_ok() {
                if let Some(agent) = self.population.get_mut(&address) {
                    agent.state = AgentState::Withdrawn;
                }
                summary.deaths += 1;
                tracing::info!(target: "orchestrator", address = %address, "agent withdrawn");
            }
        }
        if summary.deaths > 0 {
            orchestrator_metrics().inc_deaths(u64::from(summary.deaths));
        }
    }

    // --- Actor phase ----------------------------------------------------

    async fn actor_phase(&mut self, summary: &mut TickSummary) {
        let actors = self.sample_actors();
        for address in actors {
            self.act_once(&address, summary).await;
        }
    }

    /// Fitness-weighted sample of `activity_rate · |pop|` actors.
    pub(crate) fn sample_actors(&mut self) -> Vec<String> {
        let actors = self.population.actors();
        if actors.is_empty() {
            return Vec::new();
        }
        let count = ((self.config.activity_rate * actors.len() as f64).ceil() as usize)
            .clamp(1, actors.len());
        let weights: Vec<f64> = actors.iter().map(|a| a.fitness.total + 0.05).collect();
        weighted_sample_distinct(&weights, count, &mut self.rng)
            .into_iter()
            .map(|i| actors[i].address.clone())
            .collect()
    }

    async fn act_once(&mut self, address: &str, summary: &mut TickSummary) {
        let (fiber_id, key, risk, state, events, is_active) = {
            let Some(agent) = self.population.get(address) else {
                return;
            };
            let Some(fiber_id) = agent.fiber_id.clone() else {
                return;
            };
            (
                fiber_id,
                agent.private_key.clone(),
                agent.meta.risk_tolerance,
                agent.state.to_string(),
                loom_workflows::available_identity_events(agent),
                agent.state == AgentState::Active,
            )
        };
        if events.is_empty() {
            return;
        }

        let spec = match loom_workflows::by_name("AgentIdentity") {
            Some(spec) => spec,
            None => return,
        };
        let mutation_rate = self.config.mutation_rate;
        let market_health = self.ctx.market_health;
        let mut choices: Vec<(&'static str, f64)> = Vec::new();
        for event in events {
            let base = spec
                .transition(&state, event)
                .map(|t| t.base_weight)
                .unwrap_or(0.2);
            // Risky moves scale with appetite; constructive ones with
            // observed market health.
            let modified = match event {
                "withdraw" => base * (1.0 - risk) * 0.3,
                "challenge" | "dispute" => base * risk,
                _ => base * market_health,
            };
            let weight = maybe_mutate(modified, mutation_rate, &mut self.rng);
            choices.push((event, weight));
        }
        // A challenge against a random peer is also on the table.
        if is_active {
            if let Some(target) = self.pick_counterparty(address, usize::MAX) {
                let base = 0.15 * risk;
                let weight = maybe_mutate(base, mutation_rate, &mut self.rng);
                choices.push(("challenge_peer", weight));
                self.challenge_target = Some(target);
            }
        }

        let weights: Vec<f64> = choices.iter().map(|(_, w)| *w).collect();
        let Some(selected) = softmax_select(&weights, self.ctx.temperature, &mut self.rng) else {
            return;
        };
        let event = choices[selected].0;
        let result = self.fire_identity_event(address, &key, &fiber_id, event).await;
        summary.record(&result);
    }

    async fn fire_identity_event(
        &mut self,
        address: &str,
        key: &str,
        fiber_id: &str,
        event: &'static str,
    ) -> Result<OpReceipt, BridgeError> {
        match event {
            "activate" => {
                let receipt = self.engine.activate_agent(key, fiber_id).await?;
                if let Some(agent) = self.population.get_mut(address) {
                    agent.state = AgentState::Active;
                }
                Ok(receipt)
            }
            "vouch" => {
                let target = self
                    .pick_counterparty(address, usize::MAX)
                    .ok_or_else(|| BridgeError::Validation("no vouch target".into()))?;
                let receipt = self.engine.vouch_for(key, fiber_id, &target).await?;
                if let Some(agent) = self.population.get_mut(address) {
                    agent.meta.vouched_for.insert(target.clone());
                }
                if let Some(target_agent) = self.population.get_mut(&target) {
                    target_agent
                        .meta
                        .received_vouches
                        .insert(address.to_string());
                }
                Ok(receipt)
            }
            "withdraw" => {
                let receipt = self.engine.withdraw_agent(key, fiber_id).await?;
                if let Some(agent) = self.population.get_mut(address) {
                    agent.state = AgentState::Withdrawn;
                }
                Ok(receipt)
            }
            "respond" | "restore" => {
                let receipt = self
                    .engine
                    .transition_state_machine(key, fiber_id, event, serde_json::json!({}))
                    .await?;
                if let Some(agent) = self.population.get_mut(address) {
                    agent.state = AgentState::Active;
                }
                Ok(receipt)
            }
            "challenge_peer" => {
                let Some(target) = self.challenge_target.take() else {
                    return Err(BridgeError::Validation("no challenge target".into()));
                };
                let target_fiber = self
                    .population
                    .get(&target)
                    .and_then(|a| a.fiber_id.clone())
                    .ok_or_else(|| BridgeError::Validation("target has no fiber".into()))?;
                let receipt = self
                    .engine
                    .transition_state_machine(key, &target_fiber, "challenge", serde_json::json!({}))
                    .await?;
                if let Some(target_agent) = self.population.get_mut(&target) {
                    target_agent.state = AgentState::Challenged;
                }
                Ok(receipt)
            }
            other => {
                self.engine
                    .transition_state_machine(key, fiber_id, other, serde_json::json!({}))
                    .await
            }
        }
    }

    /// Fitness-weighted counterparty pick, excluding the actor itself and
    /// peers already connected above the cap.
    pub(crate) fn pick_counterparty(&mut self, actor: &str, connection_cap: usize) -> Option<String> {
        let shared: HashMap<String, usize> = self
            .contracts
            .values()
            .filter(|c| c.state == ContractState::Active || c.state == ContractState::Proposed)
            .filter(|c| c.proposer == actor || c.counterparty == actor)
            .map(|c| {
                if c.proposer == actor {
                    c.counterparty.clone()
                } else {
                    c.proposer.clone()
                }
            })
            .fold(HashMap::new(), |mut acc, other| {
                *acc.entry(other).or_insert(0) += 1;
                acc
            });

        let candidates: Vec<&loom_types::agent::Agent> = self
            .population
            .actors()
            .into_iter()
            .filter(|a| a.address != actor)
            .filter(|a| shared.get(&a.address).copied().unwrap_or(0) < connection_cap)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let weights: Vec<f64> = candidates.iter().map(|a| a.fitness.total + 0.05).collect();
        weighted_sample(&weights, &mut self.rng).map(|i| candidates[i].address.clone())
    }
}

impl Orchestrator {
    pub(crate) fn market_deadline(&self) -> u64 {
        loom_types::time::now_ms() + self.config.generation_interval_ms.max(1) * 6
    }
}
