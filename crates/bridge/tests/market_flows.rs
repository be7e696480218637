//! Market lifecycle flows driven end to end against the mock data layer.

use loom_bridge::{BridgeEngine, ReconcilerConfig};
use loom_client::testing::MockDataLayer;
use loom_crypto::KeyPair;
use loom_types::agent::{Market, MarketState, MarketType};
use loom_types::error::BridgeError;
use loom_types::time::now_ms;
use loom_workflows::{claim_amount, settle_market};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        visibility_timeout: Duration::from_secs(2),
        visibility_initial_backoff: Duration::from_millis(5),
        visibility_backoff_cap: Duration::from_millis(20),
        sequence_retries: 10,
        sequence_backoff: Duration::from_millis(2),
        cid_retries: 3,
        cid_backoff: Duration::from_millis(5),
    }
}

/// Rebuilds the in-memory market row from the mock fiber, the way the
/// orchestrator mirrors observed state.
fn market_of(mock: &MockDataLayer, fiber_id: &str, market_type: MarketType) -> Market {
    let fiber = mock.fiber(fiber_id).unwrap();
    let data = &fiber.state_data;
    let state = match fiber.current_state.as_str() {
        "PROPOSED" => MarketState::Proposed,
        "OPEN" => MarketState::Open,
        "CLOSED" => MarketState::Closed,
        "RESOLVING" => MarketState::Resolving,
        "SETTLED" => MarketState::Settled,
        "REFUNDED" => MarketState::Refunded,
        _ => MarketState::Cancelled,
    };
    let commitments = data["commitments"]
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(addr, c)| {
                    (
                        addr.clone(),
                        loom_types::agent::MarketCommitment {
                            amount: c["amount"].as_u64().unwrap(),
                            data: c["data"].clone(),
                            last_commit_at: 0,
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    Market {
        fiber_id: fiber_id.to_string(),
        market_type,
        creator: data["creator"].as_str().unwrap().to_string(),
        oracles: data["oracles"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o.as_str().unwrap().to_string())
            .collect(),
        quorum: data["quorum"].as_u64().unwrap() as u32,
        deadline: data["deadline"].as_u64(),
        threshold: data["threshold"].as_u64(),
        state,
        commitments,
        total_committed: data["totalCommitted"].as_u64().unwrap_or(0),
        resolutions: vec![],
        claims: Default::default(),
        final_outcome: None,
        settlement: None,
    }
}

#[tokio::test]
async fn prediction_market_end_to_end() {
    let mock = Arc::new(MockDataLayer::new());
    let engine = BridgeEngine::new(mock.clone(), fast_config());
    let creator = KeyPair::generate();
    let oracle = KeyPair::generate();
    let participants: Vec<KeyPair> = (0..5).map(|_| KeyPair::generate()).collect();

    let created = engine
        .create_market(
            &creator.private_hex(),
            MarketType::Prediction,
            &[oracle.address().to_string()],
            1,
            Some(now_ms() + 60_000),
            None,
            Some("will it rain"),
        )
        .await
        .unwrap();
    let fiber_id = created.fiber_id;

    engine
        .open_market(&creator.private_hex(), &fiber_id)
        .await
        .unwrap();

    // P1/P2 back YES, P3..P5 back NO with varying amounts.
    let stakes = [(100, "YES"), (200, "YES"), (50, "NO"), (100, "NO"), (50, "NO")];
    for (p, (amount, outcome)) in participants.iter().zip(stakes) {
        engine
            .commit_market(
                &p.private_hex(),
                &fiber_id,
                amount,
                json!({ "outcome": outcome }),
            )
            .await
            .unwrap();
    }

    engine
        .close_market(&creator.private_hex(), &fiber_id)
        .await
        .unwrap();
    engine
        .submit_resolution(&oracle.private_hex(), &fiber_id, "YES", None)
        .await
        .unwrap();
    engine
        .finalize_market(&creator.private_hex(), &fiber_id)
        .await
        .unwrap();
    assert_eq!(mock.fiber(&fiber_id).unwrap().current_state, "SETTLED");

    // Winners receive stake plus a share of the losing pool minus the 2% fee.
    let market = market_of(&mock, &fiber_id, MarketType::Prediction);
    let settlement = settle_market(&market, Some("YES"));
    assert_eq!(settlement.fee, 4); // 2% of the 200 losing pool
    let p1 = participants[0].address();
    let p3 = participants[2].address();
    assert_eq!(claim_amount(&settlement, p1), 100 + 196 * 100 / 300);
    assert_eq!(claim_amount(&settlement, p3), 0);

    // Every committer claims exactly once.
    for p in &participants {
        engine
            .claim_market(&p.private_hex(), &fiber_id)
            .await
            .unwrap();
        let err = engine
            .claim_market(&p.private_hex(), &fiber_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::StateConflict { .. }));
    }
}

#[tokio::test]
async fn crowdfund_below_threshold_refunds() {
    let mock = Arc::new(MockDataLayer::new());
    let engine = BridgeEngine::new(mock.clone(), fast_config());
    let creator = KeyPair::generate();
    let p1 = KeyPair::generate();
    let p2 = KeyPair::generate();

    let created = engine
        .create_market(
            &creator.private_hex(),
            MarketType::Crowdfund,
            &[],
            0,
            Some(now_ms() - 1), // already past deadline
            Some(500),
            None,
        )
        .await
        .unwrap();
    let fiber_id = created.fiber_id;

    engine
        .open_market(&creator.private_hex(), &fiber_id)
        .await
        .unwrap();
    engine
        .commit_market(&p1.private_hex(), &fiber_id, 70, json!({}))
        .await
        .unwrap();
    engine
        .commit_market(&p2.private_hex(), &fiber_id, 50, json!({}))
        .await
        .unwrap();

    engine
        .refund_market(&p1.private_hex(), &fiber_id)
        .await
        .unwrap();
    assert_eq!(mock.fiber(&fiber_id).unwrap().current_state, "REFUNDED");

    // Full refunds for every committer.
    let market = market_of(&mock, &fiber_id, MarketType::Crowdfund);
    let settlement = settle_market(&market, None);
    assert_eq!(claim_amount(&settlement, p1.address()), 70);
    assert_eq!(claim_amount(&settlement, p2.address()), 50);
}

#[tokio::test]
async fn refund_is_refused_at_or_above_threshold() {
    let mock = Arc::new(MockDataLayer::new());
    let engine = BridgeEngine::new(mock.clone(), fast_config());
    let creator = KeyPair::generate();
    let p1 = KeyPair::generate();

    let created = engine
        .create_market(
            &creator.private_hex(),
            MarketType::Crowdfund,
            &[],
            0,
            None,
            Some(100),
            None,
        )
        .await
        .unwrap();
    engine
        .open_market(&creator.private_hex(), &created.fiber_id)
        .await
        .unwrap();
    engine
        .commit_market(&p1.private_hex(), &created.fiber_id, 150, json!({}))
        .await
        .unwrap();

    let err = engine
        .refund_market(&p1.private_hex(), &created.fiber_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::StateConflict { .. }));
}

#[tokio::test]
async fn state_illegal_market_operations_return_conflicts() {
    let mock = Arc::new(MockDataLayer::new());
    let engine = BridgeEngine::new(mock.clone(), fast_config());
    let creator = KeyPair::generate();
    let oracle = KeyPair::generate();

    let created = engine
        .create_market(
            &creator.private_hex(),
            MarketType::Prediction,
            &[oracle.address().to_string()],
            1,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    let fiber_id = created.fiber_id;
    let submitted = mock.submit_count();

    // Market is PROPOSED: commits, closes, and resolutions are all illegal.
    for err in [
        engine
            .commit_market(&creator.private_hex(), &fiber_id, 10, json!({}))
            .await
            .unwrap_err(),
        engine
            .close_market(&creator.private_hex(), &fiber_id)
            .await
            .unwrap_err(),
        engine
            .submit_resolution(&oracle.private_hex(), &fiber_id, "YES", None)
            .await
            .unwrap_err(),
    ] {
        assert!(matches!(err, BridgeError::StateConflict { .. }));
        assert_eq!(err.http_status(), 409);
    }
    // None of those attempts reached the data layer.
    assert_eq!(mock.submit_count(), submitted);

    // Non-creator cannot open.
    let err = engine
        .open_market(&oracle.private_hex(), &fiber_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Forbidden(_)));

    // Non-oracle cannot resolve even in the right state.
    engine
        .open_market(&creator.private_hex(), &fiber_id)
        .await
        .unwrap();
    engine
        .close_market(&creator.private_hex(), &fiber_id)
        .await
        .unwrap();
    let err = engine
        .submit_resolution(&creator.private_hex(), &fiber_id, "YES", None)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Forbidden(_)));

    // Finalize before quorum is a conflict.
    engine
        .submit_resolution(&oracle.private_hex(), &fiber_id, "YES", None)
        .await
        .unwrap();
    engine
        .finalize_market(&creator.private_hex(), &fiber_id)
        .await
        .unwrap();
    assert_eq!(mock.fiber(&fiber_id).unwrap().current_state, "SETTLED");
}
