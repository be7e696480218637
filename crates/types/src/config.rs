//! Shared configuration structures for the orchestrator and endpoints.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Which tick loop the orchestrator runs.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Full evolutionary loop at realistic pace.
    #[default]
    Standard,
    /// Fixed fiber-type distribution, no births or deaths.
    Weighted,
    /// Parallelized submissions paced to a TPS budget.
    HighThroughput,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "weighted" => Ok(Self::Weighted),
            "high-throughput" | "high_throughput" => Ok(Self::HighThroughput),
            other => Err(format!(
                "unknown mode '{other}' (expected standard | weighted | high-throughput)"
            )),
        }
    }
}

/// Weights for the fitness components. Must sum to 1.0.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FitnessWeights {
    /// Weight of normalized reputation.
    pub reputation: f64,
    /// Weight of the completion rate.
    pub completion: f64,
    /// Weight of the network effect.
    pub network: f64,
    /// Weight of normalized age.
    pub age: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            reputation: 0.3,
            completion: 0.3,
            network: 0.2,
            age: 0.2,
        }
    }
}

impl FitnessWeights {
    /// Validates that the weights sum to 1.0 within floating-point tolerance.
    pub fn validate(&self) -> Result<(), String> {
        let sum = self.reputation + self.completion + self.network + self.age;
        if (sum - 1.0).abs() > 1e-9 {
            return Err(format!("fitness weights must sum to 1.0, got {sum}"));
        }
        Ok(())
    }
}

/// Endpoint URLs for the metagraph layers and collaborators.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Endpoints {
    /// External HTTP bridge, when submissions are proxied.
    pub bridge_url: Option<String>,
    /// Metagraph L0 (snapshot layer) base URL.
    pub ml0_url: String,
    /// Data L1 node base URLs. More than one enables broadcast submission.
    pub dl1_urls: Vec<String>,
    /// Global L0 base URL, when configured.
    pub gl0_url: Option<String>,
    /// Indexer query API base URL, when configured.
    pub indexer_url: Option<String>,
}

/// The orchestrator's recognized configuration options (see the CLI for the
/// corresponding environment variables).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OrchestratorConfig {
    /// Steady-state population size.
    pub target_population: usize,
    /// Maximum births per generation while below target.
    pub birth_rate: usize,
    /// Fraction of the population eligible for death per generation.
    pub death_rate: f64,
    /// Fraction of the population sampled as actors per tick.
    pub activity_rate: f64,
    /// Per-actor probability of proposing a new contract or market.
    pub proposal_rate: f64,
    /// Probability of flipping a choice weight (`w' = 1 - w`).
    pub mutation_rate: f64,
    /// Softmax temperature at generation zero.
    pub initial_temperature: f64,
    /// Multiplicative temperature decay per generation.
    pub temperature_decay: f64,
    /// Temperature floor.
    pub min_temperature: f64,
    /// Tick interval in milliseconds.
    pub generation_interval_ms: u64,
    /// Stop after this many generations; 0 runs forever.
    pub max_generations: u64,
    /// Relative weight per workflow type for new-fiber selection.
    pub fiber_weights: BTreeMap<String, f64>,
    /// Target count of in-flight fibers (high-throughput mode).
    pub target_active_fibers: usize,
    /// Target submission rate (high-throughput mode).
    pub target_tps: f64,
    /// Where the wallet pool persists; in-memory only when unset.
    pub wallet_pool_path: Option<PathBuf>,
    /// Selected tick loop.
    pub mode: RunMode,
    /// Fitness component weights.
    pub fitness_weights: FitnessWeights,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            target_population: 25,
            birth_rate: 2,
            death_rate: 0.05,
            activity_rate: 0.3,
            proposal_rate: 0.15,
            mutation_rate: 0.05,
            initial_temperature: 1.2,
            temperature_decay: 0.995,
            min_temperature: 0.3,
            generation_interval_ms: 5_000,
            max_generations: 0,
            fiber_weights: BTreeMap::new(),
            target_active_fibers: 50,
            target_tps: 10.0,
            wallet_pool_path: None,
            mode: RunMode::Standard,
            fitness_weights: FitnessWeights::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Validates rates and weights; returns a human-readable reason on error.
    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("DEATH_RATE", self.death_rate),
            ("ACTIVITY_RATE", self.activity_rate),
            ("PROPOSAL_RATE", self.proposal_rate),
            ("MUTATION_RATE", self.mutation_rate),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("{name} must be within [0, 1], got {v}"));
            }
        }
        if self.min_temperature <= 0.0 || self.initial_temperature < self.min_temperature {
            return Err("temperature bounds must satisfy 0 < MIN <= INITIAL".to_string());
        }
        if !(0.0..=1.0).contains(&self.temperature_decay) {
            return Err("TEMPERATURE_DECAY must be within [0, 1]".to_string());
        }
        if self.target_tps <= 0.0 {
            return Err("TARGET_TPS must be positive".to_string());
        }
        self.fitness_weights.validate()
    }
}

/// Parses a `FIBER_WEIGHTS` string of the form `Contract=0.4,Prediction=0.2`.
pub fn parse_fiber_weights(raw: &str) -> Result<BTreeMap<String, f64>, String> {
    let mut out = BTreeMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, weight) = part
            .split_once('=')
            .ok_or_else(|| format!("malformed fiber weight '{part}' (expected Name=Weight)"))?;
        let w: f64 = weight
            .trim()
            .parse()
            .map_err(|_| format!("non-numeric fiber weight in '{part}'"))?;
        if w < 0.0 {
            return Err(format!("negative fiber weight in '{part}'"));
        }
        out.insert(name.trim().to_string(), w);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_weights_parse() {
        let w = parse_fiber_weights("Contract=0.4, Prediction=0.25,GroupBuy=0").unwrap();
        assert_eq!(w.len(), 3);
        assert_eq!(w["Contract"], 0.4);
        assert!(parse_fiber_weights("Contract").is_err());
        assert!(parse_fiber_weights("Contract=-1").is_err());
    }

    #[test]
    fn default_config_validates() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_rates_are_rejected() {
        let cfg = OrchestratorConfig {
            activity_rate: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
