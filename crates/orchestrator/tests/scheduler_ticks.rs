//! Generational ticks driven end to end against the mock data layer.

use loom_bridge::{BridgeEngine, ReconcilerConfig};
use loom_client::health::{ClusterHealth, NodeState, SyncStatus};
use loom_client::testing::{MockDataLayer, StaticHealth};
use loom_orchestrator::{Orchestrator, WalletPool};
use loom_types::config::{OrchestratorConfig, RunMode};
use std::sync::Arc;
use std::time::Duration;

fn fast_reconciler() -> ReconcilerConfig {
    ReconcilerConfig {
        visibility_timeout: Duration::from_secs(2),
        visibility_initial_backoff: Duration::from_millis(2),
        visibility_backoff_cap: Duration::from_millis(10),
        sequence_retries: 10,
        sequence_backoff: Duration::from_millis(2),
        cid_retries: 2,
        cid_backoff: Duration::from_millis(5),
    }
}

fn ready_status() -> SyncStatus {
    SyncStatus {
        clusters: vec![
            ClusterHealth {
                layer: "ml0".into(),
                peer_states: vec![NodeState::Ready, NodeState::Ready],
            },
            ClusterHealth {
                layer: "dl1-0".into(),
                peer_states: vec![NodeState::Ready],
            },
        ],
    }
}

fn degraded_status() -> SyncStatus {
    SyncStatus {
        clusters: vec![ClusterHealth {
            layer: "ml0".into(),
            peer_states: vec![NodeState::Ready, NodeState::Observing],
        }],
    }
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        target_population: 6,
        birth_rate: 6,
        death_rate: 0.0,
        activity_rate: 0.5,
        proposal_rate: 0.6,
        mutation_rate: 0.05,
        generation_interval_ms: 50,
        max_generations: 0,
        ..Default::default()
    }
}

fn orchestrator(
    mock: Arc<MockDataLayer>,
    status: SyncStatus,
    config: OrchestratorConfig,
) -> Orchestrator {
    let engine = Arc::new(BridgeEngine::new(mock, fast_reconciler()));
    let health = Arc::new(StaticHealth(status));
    let pool = WalletPool::load(None).unwrap();
    Orchestrator::with_seed(config, engine, health, pool, 1234)
}

#[tokio::test]
async fn unhealthy_cluster_issues_zero_submissions() {
    let mock = Arc::new(MockDataLayer::new());
    let mut orch = orchestrator(mock.clone(), degraded_status(), test_config());

    let summary = orch.tick().await;
    assert!(!summary.healthy);
    assert_eq!(summary.successes, 0);
    assert_eq!(mock.submit_count(), 0);

    // A degraded cluster also means no births.
    assert_eq!(orch.population().len(), 0);
}

#[tokio::test]
async fn fork_suspicion_gates_the_tick() {
    let mock = Arc::new(MockDataLayer::new());
    // Both peers report states, but they disagree.
    let status = SyncStatus {
        clusters: vec![ClusterHealth {
            layer: "dl1-0".into(),
            peer_states: vec![NodeState::Ready, NodeState::Observing, NodeState::Ready],
        }],
    };
    let mut orch = orchestrator(mock.clone(), status, test_config());
    let summary = orch.tick().await;
    assert!(!summary.healthy);
    assert_eq!(mock.submit_count(), 0);
}

#[tokio::test]
async fn bootstrap_registers_and_activates_agents() {
    let mock = Arc::new(MockDataLayer::new());
    let mut orch = orchestrator(mock.clone(), ready_status(), test_config());

    orch.bootstrap().await;
    assert_eq!(orch.population().living(), 6);

    // Every agent's identity fiber is ACTIVE on chain.
    for agent in orch.population().iter() {
        let fiber = mock.fiber(agent.fiber_id.as_deref().unwrap()).unwrap();
        assert_eq!(fiber.current_state, "ACTIVE");
    }
}

#[tokio::test]
async fn ticks_top_up_the_population() {
    let mock = Arc::new(MockDataLayer::new());
    let mut orch = orchestrator(mock.clone(), ready_status(), test_config());

    let summary = orch.tick().await;
    assert!(summary.healthy);
    assert_eq!(summary.births, 6);
    assert_eq!(orch.population().len(), 6);
}

#[tokio::test]
async fn generations_progress_fibers_to_terminal_states() {
    let mock = Arc::new(MockDataLayer::new());
    let mut config = test_config();
    config.proposal_rate = 0.8;
    let mut orch = orchestrator(mock.clone(), ready_status(), config);

    for _ in 0..12 {
        orch.tick().await;
    }

    // The economy actually moved: fibers were created and some contracts
    // or markets reached a terminal state and left the active tables.
    let submitted = mock.submitted();
    let creations = submitted
        .iter()
        .filter(|u| matches!(u, loom_types::fiber::DataUpdate::CreateStateMachine(_)))
        .count();
    // 6 identities plus at least one proposed contract/market.
    assert!(creations > 6, "only {creations} creations");
    let transitions = submitted.len() - creations;
    assert!(transitions > 6, "only {transitions} transitions");
    assert!(orch.generation() >= 12);
}

#[tokio::test]
async fn weighted_mode_keeps_population_static() {
    let mock = Arc::new(MockDataLayer::new());
    let mut config = test_config();
    config.mode = RunMode::Weighted;
    config.target_active_fibers = 3;
    let mut orch = orchestrator(mock.clone(), ready_status(), config);

    // Weighted mode never births; bootstrap explicitly.
    orch.bootstrap().await;
    let population_before = orch.population().len();
    assert_eq!(population_before, 6);

    for _ in 0..4 {
        orch.tick().await;
    }
    assert_eq!(orch.population().len(), population_before);
    // The fiber mix is topped up toward the target.
    assert!(orch.active_fibers() > 0);
}

#[tokio::test]
async fn high_throughput_round_respects_plan_and_caps() {
    let mock = Arc::new(MockDataLayer::new());
    let mut config = test_config();
    config.mode = RunMode::HighThroughput;
    config.target_active_fibers = 2;
    config.target_tps = 200.0; // Keep the paced test fast.
    config.generation_interval_ms = 100;
    let mut orch = orchestrator(mock.clone(), ready_status(), config);

    let summary = orch.throughput_tick().await;
    // ~20 ops planned for the 100ms window at 200 TPS.
    assert!(
        summary.successes + summary.failures + summary.skips > 0,
        "no submissions issued"
    );
    assert!(mock.submit_count() > 0);
}
