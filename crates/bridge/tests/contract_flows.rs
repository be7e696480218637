//! Contract lifecycle flows driven end to end against the mock data layer.

use loom_bridge::{BridgeEngine, ReconcilerConfig};
use loom_client::testing::MockDataLayer;
use loom_crypto::KeyPair;
use loom_types::error::BridgeError;
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

#[tokio::test]
async fn contract_happy_path_reaches_completed() {
    let mock = Arc::new(MockDataLayer::new());
    let engine = BridgeEngine::new(mock.clone(), fast_config());
    let a = KeyPair::generate();
    let b = KeyPair::generate();

    let created = engine
        .propose_contract(
            &a.private_hex(),
            b.address(),
            json!({"task": "x", "value": 100}),
            None,
        )
        .await
        .unwrap();
    let fiber_id = created.fiber_id;
    assert_eq!(mock.fiber(&fiber_id).unwrap().current_state, "PROPOSED");

    engine
        .accept_contract(&b.private_hex(), &fiber_id)
        .await
        .unwrap();
    assert_eq!(mock.fiber(&fiber_id).unwrap().current_state, "ACTIVE");

    engine
        .complete_contract(&a.private_hex(), &fiber_id, json!("p1"))
        .await
        .unwrap();
    engine
        .complete_contract(&b.private_hex(), &fiber_id, json!("p2"))
        .await
        .unwrap();

    engine
        .finalize_contract(&a.private_hex(), &fiber_id)
        .await
        .unwrap();

    let fiber = mock.fiber(&fiber_id).unwrap();
    assert_eq!(fiber.current_state, "COMPLETED");
    assert!(fiber.state_data["completions"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn wrong_party_accept_is_refused_before_the_network() {
    let mock = Arc::new(MockDataLayer::new());
    let engine = BridgeEngine::new(mock.clone(), fast_config());
    let a = KeyPair::generate();
    let b = KeyPair::generate();

    let created = engine
        .propose_contract(&a.private_hex(), b.address(), json!({"task": "x"}), None)
        .await
        .unwrap();
    let submitted_after_propose = mock.submit_count();

    // The proposer tries to accept its own proposal.
    let err = engine
        .accept_contract(&a.private_hex(), &created.fiber_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Forbidden(_)));
    assert_eq!(err.http_status(), 403);

    // Nothing was submitted; the data layer is unchanged.
    assert_eq!(mock.submit_count(), submitted_after_propose);
    assert_eq!(
        mock.fiber(&created.fiber_id).unwrap().current_state,
        "PROPOSED"
    );
}

#[tokio::test]
async fn acceptance_races_visibility_and_retries_through() {
    // The fiber stays invisible to reads for a few polls after creation.
    let mock = Arc::new(MockDataLayer::with_creation_lag(2));
    let engine = BridgeEngine::new(mock.clone(), fast_config());
    let a = KeyPair::generate();
    let b = KeyPair::generate();

    let created = engine
        .propose_contract(&a.private_hex(), b.address(), json!({"task": "x"}), None)
        .await
        .unwrap();

    // Immediate accept hits the visibility race.
    let first = engine
        .accept_contract(&b.private_hex(), &created.fiber_id)
        .await;
    assert!(matches!(first, Err(BridgeError::NotReady(_))));

    // Retrying through the same endpoint succeeds within the window.
    let mut accepted = false;
    for _ in 0..10 {
        match engine
            .accept_contract(&b.private_hex(), &created.fiber_id)
            .await
        {
            Ok(_) => {
                accepted = true;
                break;
            }
            Err(BridgeError::NotReady(_)) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(accepted);
    assert_eq!(
        mock.fiber(&created.fiber_id).unwrap().current_state,
        "ACTIVE"
    );
}

#[tokio::test]
async fn finalize_requires_both_completions() {
    let mock = Arc::new(MockDataLayer::new());
    let engine = BridgeEngine::new(mock.clone(), fast_config());
    let a = KeyPair::generate();
    let b = KeyPair::generate();

    let created = engine
        .propose_contract(&a.private_hex(), b.address(), json!({"task": "x"}), None)
        .await
        .unwrap();
    engine
        .accept_contract(&b.private_hex(), &created.fiber_id)
        .await
        .unwrap();
    engine
        .complete_contract(&a.private_hex(), &created.fiber_id, json!("p1"))
        .await
        .unwrap();

    // Only one side has completed.
    let err = engine
        .finalize_contract(&a.private_hex(), &created.fiber_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::StateConflict { .. }));
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn stranger_cannot_complete() {
    let mock = Arc::new(MockDataLayer::new());
    let engine = BridgeEngine::new(mock.clone(), fast_config());
    let a = KeyPair::generate();
    let b = KeyPair::generate();
    let stranger = KeyPair::generate();

    let created = engine
        .propose_contract(&a.private_hex(), b.address(), json!({"task": "x"}), None)
        .await
        .unwrap();
    engine
        .accept_contract(&b.private_hex(), &created.fiber_id)
        .await
        .unwrap();

    let err = engine
        .complete_contract(&stranger.private_hex(), &created.fiber_id, json!("p"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Forbidden(_)));
}
