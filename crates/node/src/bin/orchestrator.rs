#![forbid(unsafe_code)]

//! The orchestrator binary: boots the bridge and drives the agent economy
//! in the selected mode until SIGINT or `MAX_GENERATIONS`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use loom_bridge::{BridgeEngine, ReconcilerConfig};
use loom_client::{HttpDataLayer, IndexerClient};
use loom_node::{init_observability, shutdown_channel};
use loom_orchestrator::{Orchestrator, WalletPool};
use loom_types::config::{parse_fiber_weights, Endpoints, OrchestratorConfig, RunMode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "orchestrator", about = "Drives fiber lifecycles against the metagraph")]
struct OrchestratorOpts {
    #[clap(long, env = "MODE", default_value = "standard",
           help = "Tick loop: standard | weighted | high-throughput")]
    mode: RunMode,

    // --- Endpoints ---
    #[clap(long, env = "ML0_URL", help = "Metagraph L0 (snapshot layer) base URL")]
    ml0_url: String,
    #[clap(long, env = "DL1_URL", use_value_delimiter = true,
           help = "Data L1 base URLs, comma-separated; more than one enables broadcast submit")]
    dl1_url: Vec<String>,
    #[clap(long, env = "GL0_URL", help = "Global L0 base URL")]
    gl0_url: Option<String>,
    #[clap(long, env = "BRIDGE_URL", help = "External HTTP bridge base URL")]
    bridge_url: Option<String>,
    #[clap(long, env = "INDEXER_URL", help = "Indexer query API base URL")]
    indexer_url: Option<String>,

    // --- Population dynamics ---
    #[clap(long, env = "TARGET_POPULATION", default_value_t = 25)]
    target_population: usize,
    #[clap(long, env = "BIRTH_RATE", default_value_t = 2)]
    birth_rate: usize,
    #[clap(long, env = "DEATH_RATE", default_value_t = 0.05)]
    death_rate: f64,
    #[clap(long, env = "ACTIVITY_RATE", default_value_t = 0.3,
           help = "Fraction of the population sampled as actors per tick")]
    activity_rate: f64,
    #[clap(long, env = "PROPOSAL_RATE", default_value_t = 0.15)]
    proposal_rate: f64,
    #[clap(long, env = "MUTATION_RATE", default_value_t = 0.05)]
    mutation_rate: f64,

    // --- Annealing ---
    #[clap(long, env = "INITIAL_TEMPERATURE", default_value_t = 1.2)]
    initial_temperature: f64,
    #[clap(long, env = "TEMPERATURE_DECAY", default_value_t = 0.995)]
    temperature_decay: f64,
    #[clap(long, env = "MIN_TEMPERATURE", default_value_t = 0.3)]
    min_temperature: f64,

    // --- Pacing ---
    #[clap(long, env = "GENERATION_INTERVAL_MS", default_value_t = 5_000)]
    generation_interval_ms: u64,
    #[clap(long, env = "MAX_GENERATIONS", default_value_t = 0,
           help = "Stop after this many generations; 0 runs forever")]
    max_generations: u64,
    #[clap(long, env = "FIBER_WEIGHTS",
           help = "Workflow-type weights, e.g. Contract=0.5,Prediction=0.2")]
    fiber_weights: Option<String>,
    #[clap(long, env = "TARGET_ACTIVE_FIBERS", default_value_t = 50)]
    target_active_fibers: usize,
    #[clap(long, env = "TARGET_TPS", default_value_t = 10.0)]
    target_tps: f64,

    // --- Persistence & observability ---
    #[clap(long, env = "WALLET_POOL_PATH", help = "Where the wallet pool persists")]
    wallet_pool_path: Option<PathBuf>,
    #[clap(long, env = "METRICS_ADDR", help = "Telemetry listen address, e.g. 0.0.0.0:9464")]
    metrics_addr: Option<SocketAddr>,
}

impl OrchestratorOpts {
    fn into_configs(self) -> Result<(OrchestratorConfig, Endpoints, Option<SocketAddr>)> {
        let fiber_weights = match &self.fiber_weights {
            Some(raw) => parse_fiber_weights(raw).map_err(anyhow::Error::msg)?,
            None => Default::default(),
        };
        let config = OrchestratorConfig {
            target_population: self.target_population,
            birth_rate: self.birth_rate,
            death_rate: self.death_rate,
            activity_rate: self.activity_rate,
            proposal_rate: self.proposal_rate,
            mutation_rate: self.mutation_rate,
            initial_temperature: self.initial_temperature,
            temperature_decay: self.temperature_decay,
            min_temperature: self.min_temperature,
            generation_interval_ms: self.generation_interval_ms,
            max_generations: self.max_generations,
            fiber_weights,
            target_active_fibers: self.target_active_fibers,
            target_tps: self.target_tps,
            wallet_pool_path: self.wallet_pool_path,
            mode: self.mode,
            fitness_weights: Default::default(),
        };
        config.validate().map_err(anyhow::Error::msg)?;

        let endpoints = Endpoints {
            bridge_url: self.bridge_url,
            ml0_url: self.ml0_url,
            dl1_urls: self.dl1_url,
            gl0_url: self.gl0_url,
            indexer_url: self.indexer_url,
        };
        Ok((config, endpoints, self.metrics_addr))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = OrchestratorOpts::parse();
    let (config, endpoints, metrics_addr) = opts.into_configs()?;
    init_observability(metrics_addr)?;

    if endpoints.dl1_urls.is_empty() {
        bail!("at least one DL1_URL is required");
    }
    let client = Arc::new(
        HttpDataLayer::new(&endpoints).context("data-layer client construction failed")?,
    );
    let engine = Arc::new(BridgeEngine::new(client.clone(), ReconcilerConfig::default()));
    let wallet_pool = WalletPool::load(config.wallet_pool_path.clone())
        .context("wallet pool load failed")?;

    let mode = config.mode;
    let mut orchestrator = Orchestrator::new(config, engine, client, wallet_pool);
    if let Some(indexer_url) = &endpoints.indexer_url {
        match IndexerClient::new(indexer_url) {
            Ok(indexer) => {
                orchestrator = orchestrator.with_rejection_feed(Arc::new(indexer));
            }
            Err(e) => {
                tracing::warn!(target: "node", error = %e, "indexer client unavailable; rejection feedback disabled")
            }
        }
    }
    let shutdown = shutdown_channel();

    tracing::info!(target: "node", ?mode, "orchestrator starting");
    orchestrator.bootstrap().await;
    match mode {
        RunMode::HighThroughput => orchestrator.run_high_throughput(shutdown).await,
        _ => orchestrator.run(shutdown).await,
    }
    tracing::info!(target: "node", "orchestrator stopped");
    Ok(())
}
