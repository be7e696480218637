//! The in-memory agent population and its fitness model.

use loom_types::agent::{Agent, AgentMeta, AgentState, Fitness};
use loom_types::config::FitnessWeights;
use std::collections::HashMap;

/// Generations after which an agent's age component saturates.
const AGE_SATURATION: f64 = 50.0;
/// Vouch edges after which the network-effect component saturates.
const NETWORK_SATURATION: f64 = 10.0;

/// Computes the fitness components for one agent.
///
/// `max_reputation` is the highest raw reputation seen across the
/// population, used to normalize; it is clamped to at least 1 so an empty
/// ledger never divides by zero.
pub fn compute_fitness(
    agent: &Agent,
    weights: &FitnessWeights,
    max_reputation: f64,
    generation: u64,
) -> Fitness {
    let reputation = (agent.raw_reputation() / max_reputation.max(1.0)).min(1.0);

    let completed = f64::from(agent.meta.completed_contracts);
    let failed = f64::from(agent.meta.failed_contracts);
    let completion_rate = if completed + failed > 0.0 {
        completed / (completed + failed)
    } else {
        0.5 // Neutral prior for newcomers.
    };

    let edges = (agent.meta.vouched_for.len() + agent.meta.received_vouches.len()) as f64;
    let network_effect = (edges / NETWORK_SATURATION).min(1.0);

    let lived = generation.saturating_sub(agent.meta.birth_generation) as f64;
    let age = (lived / AGE_SATURATION).min(1.0);

    let total = weights.reputation * reputation
        + weights.completion * completion_rate
        + weights.network * network_effect
        + weights.age * age;

    Fitness {
        reputation,
        completion_rate,
        network_effect,
        age,
        total,
    }
}

/// The orchestrator's population: a lossy in-memory cache of agent truth,
/// reconciled against the metagraph on each transition attempt.
#[derive(Default)]
pub struct Population {
    agents: HashMap<String, Agent>,
}

impl Population {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an agent record at birth.
    pub fn spawn(
        &mut self,
        address: String,
        private_key: String,
        display_name: String,
        platform: String,
        generation: u64,
        is_oracle: bool,
        risk_tolerance: f64,
    ) -> &mut Agent {
        let agent = Agent {
            address: address.clone(),
            private_key,
            fiber_id: None,
            state: AgentState::Unregistered,
            fitness: Fitness::default(),
            meta: AgentMeta {
                birth_generation: generation,
                display_name,
                platform,
                vouched_for: Default::default(),
                received_vouches: Default::default(),
                active_contracts: Default::default(),
                active_markets: Default::default(),
                completed_contracts: 0,
                failed_contracts: 0,
                risk_tolerance,
                is_oracle,
            },
        };
        self.agents.entry(address).or_insert(agent)
    }

    pub fn get(&self, address: &str) -> Option<&Agent> {
        self.agents.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut Agent> {
        self.agents.get_mut(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agents eligible to be sampled as actors this tick.
    pub fn actors(&self) -> Vec<&Agent> {
        let mut actors: Vec<&Agent> = self.agents.values().filter(|a| a.can_act()).collect();
        // Deterministic order so weighted sampling is reproducible per seed.
        actors.sort_by(|a, b| a.address.cmp(&b.address));
        actors
    }

    /// Count of agents not yet withdrawn.
    pub fn living(&self) -> usize {
        self.agents
            .values()
            .filter(|a| a.state != AgentState::Withdrawn)
            .count()
    }

    /// Highest raw reputation across the population.
    pub fn max_reputation(&self) -> f64 {
        self.agents
            .values()
            .map(|a| a.raw_reputation())
            .fold(0.0, f64::max)
    }

    /// Recomputes every agent's fitness for the given generation.
    pub fn recompute_fitness(&mut self, weights: &FitnessWeights, generation: u64) {
        let max_reputation = self.max_reputation();
        for agent in self.agents.values_mut() {
            agent.fitness = compute_fitness(agent, weights, max_reputation, generation);
        }
    }

    /// The `count` living agents with the lowest fitness, death candidates.
    pub fn lowest_fitness(&self, count: usize) -> Vec<String> {
        let mut living: Vec<&Agent> = self
            .agents
            .values()
            .filter(|a| a.can_act())
            .collect();
        living.sort_by(|a, b| {
            a.fitness
                .total
                .partial_cmp(&b.fitness.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.address.cmp(&b.address))
        });
        living
            .into_iter()
            .take(count)
            .map(|a| a.address.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(pop: &mut Population, address: &str, generation: u64) {
        pop.spawn(
            address.to_string(),
            "00".repeat(32),
            format!("agent {address}"),
            "generated".to_string(),
            generation,
            false,
            0.5,
        );
    }

    #[test]
    fn newcomers_get_the_neutral_completion_prior() {
        let mut pop = Population::new();
        agent(&mut pop, "a", 0);
        let f = compute_fitness(pop.get("a").unwrap(), &FitnessWeights::default(), 1.0, 0);
        assert_eq!(f.completion_rate, 0.5);
        assert_eq!(f.reputation, 0.0);
    }

    #[test]
    fn fitness_rises_with_completions_and_vouches() {
        let mut pop = Population::new();
        agent(&mut pop, "a", 0);
        agent(&mut pop, "b", 0);
        {
            let a = pop.get_mut("a").unwrap();
            a.state = AgentState::Active;
            a.meta.completed_contracts = 6;
            a.meta.received_vouches.insert("b".to_string());
        }
        pop.get_mut("b").unwrap().state = AgentState::Active;
        pop.recompute_fitness(&FitnessWeights::default(), 10);

        let a = pop.get("a").unwrap().fitness.total;
        let b = pop.get("b").unwrap().fitness.total;
        assert!(a > b, "a={a} b={b}");
    }

    #[test]
    fn lowest_fitness_selects_death_candidates() {
        let mut pop = Population::new();
        for (addr, completed, failed) in [("a", 5, 0), ("b", 0, 5), ("c", 2, 2)] {
            agent(&mut pop, addr, 0);
            let agent = pop.get_mut(addr).unwrap();
            agent.state = AgentState::Active;
            agent.meta.completed_contracts = completed;
            agent.meta.failed_contracts = failed;
        }
        pop.recompute_fitness(&FitnessWeights::default(), 20);
        assert_eq!(pop.lowest_fitness(1), vec!["b".to_string()]);
    }

    #[test]
    fn withdrawn_agents_are_retained_but_inert() {
        let mut pop = Population::new();
        agent(&mut pop, "a", 0);
        pop.get_mut("a").unwrap().state = AgentState::Withdrawn;
        assert_eq!(pop.len(), 1);
        assert_eq!(pop.living(), 0);
        assert!(pop.actors().is_empty());
    }
}
