//! The sequence reconciler.
//!
//! Transitions are optimistic-concurrency writes: `targetSequenceNumber`
//! must equal the fiber's sequence at the moment of application. Two
//! writers can collide, and a writer can race the snapshot layer's
//! visibility of a just-created fiber. The reconciler owns both problems:
//! it rereads state and retries on sequence conflicts with jittered
//! backoff, retries `CidNotFound`-class failures on a longer schedule, and
//! offers visibility/sequence waits for callers that need serialized
//! downstream reads.

use loom_client::DataLayerApi;
use loom_crypto::{sign_envelope, KeyPair};
use loom_types::error::{upstream_codes, BridgeError, ClientError};
use loom_types::fiber::{
    CreateStateMachine, DataUpdate, Fiber, SubmitReceipt, TransitionStateMachine,
};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunables for the reconciliation loops. Defaults follow the production
/// profile; tests tighten or loosen them as needed.
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Overall deadline for visibility waits.
    pub visibility_timeout: Duration,
    /// First visibility poll backoff; doubles up to the cap.
    pub visibility_initial_backoff: Duration,
    /// Visibility backoff cap.
    pub visibility_backoff_cap: Duration,
    /// Retries after a sequence conflict before surfacing the failure.
    pub sequence_retries: u32,
    /// Base backoff for sequence-conflict retries (doubles, ±25% jitter).
    pub sequence_backoff: Duration,
    /// Retries for `CidNotFound`-class errors right after creation.
    pub cid_retries: u32,
    /// Base backoff for `CidNotFound` retries (doubles).
    pub cid_backoff: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            visibility_initial_backoff: Duration::from_millis(500),
            visibility_backoff_cap: Duration::from_secs(4),
            sequence_retries: 3,
            sequence_backoff: Duration::from_millis(100),
            cid_retries: 3,
            cid_backoff: Duration::from_secs(1),
        }
    }
}

/// Result of a reconciled transition submit.
#[derive(Clone, Debug)]
pub struct TransitionReceipt {
    /// The data-layer acknowledgement.
    pub receipt: SubmitReceipt,
    /// The `targetSequenceNumber` the accepted write used. The fiber is at
    /// `sequence + 1` once the write is applied.
    pub sequence: u64,
}

/// Serializes writes per fiber against the data layer.
pub struct SequenceReconciler {
    data: Arc<dyn DataLayerApi>,
    config: ReconcilerConfig,
}

impl SequenceReconciler {
    /// Builds a reconciler over the given data layer.
    pub fn new(data: Arc<dyn DataLayerApi>, config: ReconcilerConfig) -> Self {
        Self { data, config }
    }

    /// The underlying data layer, for read-only callers.
    pub fn data(&self) -> &Arc<dyn DataLayerApi> {
        &self.data
    }

    /// Fetches the fiber's current state, or `NotReady` when the snapshot
    /// layer does not know it yet.
    pub async fn current(&self, fiber_id: &str) -> Result<Fiber, BridgeError> {
        self.data
            .get_state_machine(fiber_id)
            .await
            .map_err(BridgeError::from)?
            .ok_or_else(|| BridgeError::NotReady(fiber_id.to_string()))
    }

    /// Signs and submits a fiber creation. Creations carry no sequence, so
    /// there is nothing to reconcile; `CidNotFound` retries still apply for
    /// dependency races.
    pub async fn submit_create(
        &self,
        keypair: &KeyPair,
        message: CreateStateMachine,
    ) -> Result<SubmitReceipt, BridgeError> {
        let update = DataUpdate::CreateStateMachine(message);
        let envelope = sign_envelope(keypair, update, true)
            .map_err(|e| BridgeError::SignatureRefused(e.to_string()))?;

        let mut attempt = 0u32;
        loop {
            match self.data.submit(&envelope).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if is_cid_not_found(&e) && attempt < self.config.cid_retries => {
                    attempt += 1;
                    let delay = self.config.cid_backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::debug!(target: "bridge", attempt, ?delay, "create hit CidNotFound, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(BridgeError::from(e)),
            }
        }
    }

    /// Submits a transition with sequence reconciliation.
    ///
    /// Each attempt rereads the fiber, stamps `targetSequenceNumber` with
    /// the observed sequence, signs, and submits. Sequence conflicts reread
    /// and retry up to the configured bound; `CidNotFound` failures retry on
    /// the longer schedule. Anything else surfaces immediately with its
    /// error kind so the caller's retry policy can differ per class.
    pub async fn submit_transition(
        &self,
        keypair: &KeyPair,
        fiber_id: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<TransitionReceipt, BridgeError> {
        let mut sequence_attempts = 0u32;
        let mut cid_attempts = 0u32;

        loop {
            let current = self.current(fiber_id).await?;
            let sequence = current.sequence_number;
            let update = DataUpdate::TransitionStateMachine(TransitionStateMachine {
                fiber_id: fiber_id.to_string(),
                event_name: event_name.to_string(),
                payload: payload.clone(),
                target_sequence_number: sequence,
            });
            let envelope = sign_envelope(keypair, update, true)
                .map_err(|e| BridgeError::SignatureRefused(e.to_string()))?;

            match self.data.submit(&envelope).await {
                Ok(receipt) => return Ok(TransitionReceipt { receipt, sequence }),
                Err(e) if is_sequence_conflict(&e) => {
                    sequence_attempts += 1;
                    if sequence_attempts > self.config.sequence_retries {
                        return Err(BridgeError::SequenceConflict {
                            fiber_id: fiber_id.to_string(),
                            attempts: sequence_attempts,
                        });
                    }
                    let delay = jittered(
                        self.config.sequence_backoff * 2u32.saturating_pow(sequence_attempts - 1),
                    );
                    tracing::debug!(
                        target: "bridge",
                        fiber_id,
                        event_name,
                        attempt = sequence_attempts,
                        ?delay,
                        "sequence conflict, rereading state"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_cid_not_found(&e) => {
                    cid_attempts += 1;
                    if cid_attempts > self.config.cid_retries {
                        return Err(BridgeError::NotReady(fiber_id.to_string()));
                    }
                    let delay = self.config.cid_backoff * 2u32.saturating_pow(cid_attempts - 1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(BridgeError::from(e)),
            }
        }
    }

    /// Polls the checkpoint until the fiber appears or the timeout elapses.
    pub async fn wait_for_fiber_visible(
        &self,
        fiber_id: &str,
        timeout: Duration,
    ) -> Result<Fiber, BridgeError> {
        let started = Instant::now();
        let mut backoff = self.config.visibility_initial_backoff;
        loop {
            let checkpoint = self.data.get_checkpoint().await.map_err(BridgeError::from)?;
            if let Some(fiber) = checkpoint.state.state_machines.get(fiber_id) {
                return Ok(fiber.clone());
            }
            if started.elapsed() >= timeout {
                return Err(BridgeError::NotReady(fiber_id.to_string()));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.visibility_backoff_cap);
        }
    }

    /// Polls until the fiber's sequence reaches `min_sequence`, so that
    /// serialized downstream transitions observe the new state.
    pub async fn wait_for_sequence(
        &self,
        fiber_id: &str,
        min_sequence: u64,
        timeout: Duration,
    ) -> Result<Fiber, BridgeError> {
        self.wait_until(fiber_id, timeout, |f| f.sequence_number >= min_sequence)
            .await
    }

    /// Polls until the fiber reaches the named state.
    pub async fn wait_for_state(
        &self,
        fiber_id: &str,
        state: &str,
        timeout: Duration,
    ) -> Result<Fiber, BridgeError> {
        self.wait_until(fiber_id, timeout, |f| f.current_state == state)
            .await
    }

    async fn wait_until(
        &self,
        fiber_id: &str,
        timeout: Duration,
        predicate: impl Fn(&Fiber) -> bool,
    ) -> Result<Fiber, BridgeError> {
        let started = Instant::now();
        let mut backoff = self.config.visibility_initial_backoff;
        loop {
            if let Some(fiber) = self
                .data
                .get_state_machine(fiber_id)
                .await
                .map_err(BridgeError::from)?
            {
                if predicate(&fiber) {
                    return Ok(fiber);
                }
            }
            if started.elapsed() >= timeout {
                return Err(BridgeError::NotReady(fiber_id.to_string()));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.visibility_backoff_cap);
        }
    }
}

fn is_sequence_conflict(e: &ClientError) -> bool {
    e.mentions_code(upstream_codes::STALE_SEQUENCE)
}

fn is_cid_not_found(e: &ClientError) -> bool {
    e.mentions_code(upstream_codes::CID_NOT_FOUND)
}

/// ±25% jitter around the base delay.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_client::testing::MockDataLayer;
    use loom_types::fiber::new_fiber_id;
    use loom_workflows::{by_name, defs::definition_for};
    use serde_json::json;

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig {
            visibility_timeout: Duration::from_secs(2),
            visibility_initial_backoff: Duration::from_millis(5),
            visibility_backoff_cap: Duration::from_millis(20),
            sequence_retries: 20,
            sequence_backoff: Duration::from_millis(2),
            cid_retries: 3,
            cid_backoff: Duration::from_millis(5),
        }
    }

    async fn create_active_contract(
        reconciler: &SequenceReconciler,
        keypair: &KeyPair,
    ) -> String {
        let fiber_id = new_fiber_id();
        let spec = by_name("Contract").unwrap();
        reconciler
            .submit_create(
                keypair,
                CreateStateMachine {
                    fiber_id: fiber_id.clone(),
                    definition: definition_for(spec),
                    initial_data: json!({
                        "proposer": keypair.address(),
                        "counterparty": "other",
                        "completions": []
                    }),
                    parent_fiber_id: None,
                },
            )
            .await
            .unwrap();
        reconciler
            .submit_transition(keypair, &fiber_id, "accept", json!({"agent": "other"}))
            .await
            .unwrap();
        fiber_id
    }

    #[tokio::test]
    async fn concurrent_writers_serialize_without_double_apply() {
        let mock = Arc::new(MockDataLayer::new());
        let reconciler = Arc::new(SequenceReconciler::new(mock.clone(), fast_config()));
        let keypair = KeyPair::generate();
        let fiber_id = create_active_contract(&reconciler, &keypair).await;

        let writers = 8usize;
        let mut handles = Vec::new();
        for i in 0..writers {
            let reconciler = reconciler.clone();
            let keypair = keypair.clone();
            let fiber_id = fiber_id.clone();
            handles.push(tokio::spawn(async move {
                reconciler
                    .submit_transition(
                        &keypair,
                        &fiber_id,
                        "complete",
                        json!({"agent": "other", "proof": format!("p{i}")}),
                    )
                    .await
            }));
        }
        let mut sequences = Vec::new();
        for handle in handles {
            let receipt = handle.await.unwrap().unwrap();
            sequences.push(receipt.sequence);
        }

        // Every writer claimed a distinct sequence slot.
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), writers);

        // Each sequence increment corresponds to exactly one accepted event.
        let fiber = mock.fiber(&fiber_id).unwrap();
        assert_eq!(fiber.sequence_number, 1 + writers as u64);
        let completions = fiber.state_data["completions"].as_array().unwrap();
        assert_eq!(completions.len(), writers);
    }

    #[tokio::test]
    async fn visibility_wait_outlasts_creation_lag() {
        let mock = Arc::new(MockDataLayer::with_creation_lag(3));
        let reconciler = SequenceReconciler::new(mock.clone(), fast_config());
        let keypair = KeyPair::generate();
        let fiber_id = new_fiber_id();
        reconciler
            .submit_create(
                &keypair,
                CreateStateMachine {
                    fiber_id: fiber_id.clone(),
                    definition: definition_for(by_name("AgentIdentity").unwrap()),
                    initial_data: json!({"owner": keypair.address()}),
                    parent_fiber_id: None,
                },
            )
            .await
            .unwrap();

        let fiber = reconciler
            .wait_for_fiber_visible(&fiber_id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(fiber.current_state, "REGISTERED");
    }

    #[tokio::test]
    async fn missing_fiber_is_not_ready() {
        let mock = Arc::new(MockDataLayer::new());
        let reconciler = SequenceReconciler::new(mock, fast_config());
        let keypair = KeyPair::generate();
        let err = reconciler
            .submit_transition(&keypair, "nope", "activate", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotReady(_)));
    }

    #[tokio::test]
    async fn wait_for_sequence_observes_new_state() {
        let mock = Arc::new(MockDataLayer::new());
        let reconciler = SequenceReconciler::new(mock, fast_config());
        let keypair = KeyPair::generate();
        let fiber_id = create_active_contract(&reconciler, &keypair).await;

        let receipt = reconciler
            .submit_transition(
                &keypair,
                &fiber_id,
                "complete",
                json!({"agent": "other", "proof": "p"}),
            )
            .await
            .unwrap();
        let fiber = reconciler
            .wait_for_sequence(&fiber_id, receipt.sequence + 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(fiber.sequence_number > receipt.sequence);
    }
}
