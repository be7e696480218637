//! Typed bridge operations.
//!
//! Thin wrappers over `CreateStateMachine` / `TransitionStateMachine`: each
//! operation validates its inputs, applies the client-side role and state
//! pre-checks, injects the sender as the acting agent, and delegates to the
//! sequence reconciler. State-illegal requests fail here with the fiber's
//! current status and never reach the network.

use crate::reconciler::{ReconcilerConfig, SequenceReconciler, TransitionReceipt};
use loom_client::DataLayerApi;
use loom_crypto::KeyPair;
use loom_types::agent::MarketType;
use loom_types::error::BridgeError;
use loom_types::fiber::{new_fiber_id, CreateStateMachine, Fiber, StateMachineDefinition};
use loom_types::time::now_ms;
use loom_workflows::defs::definition_for;
use loom_workflows::registry::{by_name, market_workflow};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Receipt for operations that create a fiber.
#[derive(Clone, Debug)]
pub struct CreatedReceipt {
    /// The new fiber's id.
    pub fiber_id: String,
    /// Data-layer hash of the accepted creation.
    pub hash: String,
}

/// Receipt for agent registration.
#[derive(Clone, Debug)]
pub struct RegisterAgentReceipt {
    /// The identity fiber's id.
    pub fiber_id: String,
    /// The registered agent's derived address.
    pub address: String,
    /// Data-layer hash of the accepted creation.
    pub hash: String,
}

/// Receipt for transition operations.
#[derive(Clone, Debug)]
pub struct OpReceipt {
    /// Data-layer hash of the accepted transition.
    pub hash: String,
    /// The sequence the write targeted; the fiber is at `sequence + 1` once
    /// applied. Feed into `wait_for_sequence` for serialized follow-ups.
    pub sequence: u64,
}

impl From<TransitionReceipt> for OpReceipt {
    fn from(r: TransitionReceipt) -> Self {
        Self {
            hash: r.receipt.hash,
            sequence: r.sequence,
        }
    }
}

/// The bridge submission engine.
pub struct BridgeEngine {
    reconciler: SequenceReconciler,
}

impl BridgeEngine {
    /// Builds an engine over the given data layer.
    pub fn new(data: Arc<dyn DataLayerApi>, config: ReconcilerConfig) -> Self {
        Self {
            reconciler: SequenceReconciler::new(data, config),
        }
    }

    /// The underlying reconciler, for visibility and sequence waits.
    pub fn reconciler(&self) -> &SequenceReconciler {
        &self.reconciler
    }

    fn keypair(private_key: &str) -> Result<KeyPair, BridgeError> {
        KeyPair::from_private_hex(private_key)
            .map_err(|e| BridgeError::SignatureRefused(e.to_string()))
    }

    // --- Agent identity -------------------------------------------------

    /// Creates an `AgentIdentity` fiber in `REGISTERED`.
    pub async fn register_agent(
        &self,
        private_key: &str,
        display_name: Option<&str>,
        platform: Option<&str>,
        platform_user_id: Option<&str>,
    ) -> Result<RegisterAgentReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let address = keypair.address().to_string();
        let fiber_id = new_fiber_id();
        let spec = by_name("AgentIdentity")
            .ok_or_else(|| BridgeError::Validation("AgentIdentity workflow missing".into()))?;

        let mut initial_data = json!({
            "schema": "AgentIdentity",
            "owner": address,
            "registeredAt": now_ms(),
        });
        let map = initial_data.as_object_mut().ok_or_else(|| {
            BridgeError::Validation("initial data must be an object".to_string())
        })?;
        if let Some(name) = display_name {
            map.insert("displayName".into(), json!(name));
        }
        if let Some(platform) = platform {
            map.insert("platform".into(), json!(platform));
        }
        if let Some(user_id) = platform_user_id {
            map.insert("platformUserId".into(), json!(user_id));
        }

        let receipt = self
            .reconciler
            .submit_create(
                &keypair,
                CreateStateMachine {
                    fiber_id: fiber_id.clone(),
                    definition: definition_for(spec),
                    initial_data,
                    parent_fiber_id: None,
                },
            )
            .await?;
        Ok(RegisterAgentReceipt {
            fiber_id,
            address,
            hash: receipt.hash,
        })
    }

    /// Fires `activate` on an identity fiber in `REGISTERED`.
    pub async fn activate_agent(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("activate", &fiber, &["REGISTERED"])?;
        self.transition(&keypair, fiber_id, "activate", json!({}))
            .await
    }

    /// Fires `withdraw`, retiring the identity.
    pub async fn withdraw_agent(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("withdraw", &fiber, &["ACTIVE", "PROBATION"])?;
        self.transition(&keypair, fiber_id, "withdraw", json!({}))
            .await
    }

    /// Fires `vouch` toward another agent's address.
    pub async fn vouch_for(
        &self,
        private_key: &str,
        fiber_id: &str,
        target: &str,
    ) -> Result<OpReceipt, BridgeError> {
        if target.is_empty() {
            return Err(BridgeError::Validation("vouch target is required".into()));
        }
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("vouch", &fiber, &["ACTIVE"])?;
        self.transition(&keypair, fiber_id, "vouch", json!({ "target": target }))
            .await
    }

    // --- Contracts ------------------------------------------------------

    /// Creates a `Contract` fiber in `PROPOSED`.
    pub async fn propose_contract(
        &self,
        private_key: &str,
        counterparty: &str,
        terms: Value,
        expected_completion: Option<u64>,
    ) -> Result<CreatedReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        if counterparty.is_empty() {
            return Err(BridgeError::Validation("counterparty is required".into()));
        }
        if counterparty == keypair.address() {
            return Err(BridgeError::Validation(
                "cannot propose a contract to yourself".into(),
            ));
        }
        let spec = by_name("Contract")
            .ok_or_else(|| BridgeError::Validation("Contract workflow missing".into()))?;
        let fiber_id = new_fiber_id();
        let mut initial_data = json!({
            "schema": "Contract",
            "proposer": keypair.address(),
            "counterparty": counterparty,
            "terms": terms,
            "completions": [],
            "createdAt": now_ms(),
        });
        if let Some(expected) = expected_completion {
            initial_data["expectedCompletion"] = json!(expected);
        }

        let receipt = self
            .reconciler
            .submit_create(
                &keypair,
                CreateStateMachine {
                    fiber_id: fiber_id.clone(),
                    definition: definition_for(spec),
                    initial_data,
                    parent_fiber_id: None,
                },
            )
            .await?;
        Ok(CreatedReceipt {
            fiber_id,
            hash: receipt.hash,
        })
    }

    /// Counterparty accepts a proposed contract.
    pub async fn accept_contract(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        self.contract_counterparty_op(private_key, fiber_id, "accept", json!({}))
            .await
    }

    /// Counterparty rejects a proposed contract.
    pub async fn reject_contract(
        &self,
        private_key: &str,
        fiber_id: &str,
        reason: Option<&str>,
    ) -> Result<OpReceipt, BridgeError> {
        let payload = match reason {
            Some(r) => json!({ "reason": r }),
            None => json!({}),
        };
        self.contract_counterparty_op(private_key, fiber_id, "reject", payload)
            .await
    }

    async fn contract_counterparty_op(
        &self,
        private_key: &str,
        fiber_id: &str,
        event: &str,
        payload: Value,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state(event, &fiber, &["PROPOSED"])?;
        let view = ContractView::of(&fiber)?;
        if keypair.address() != view.counterparty {
            return Err(BridgeError::Forbidden(format!(
                "only the counterparty may {event} this contract"
            )));
        }
        self.transition(&keypair, fiber_id, event, payload).await
    }

    /// A party records its completion with a proof.
    pub async fn complete_contract(
        &self,
        private_key: &str,
        fiber_id: &str,
        proof: Value,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("complete", &fiber, &["ACTIVE"])?;
        let view = ContractView::of(&fiber)?;
        view.require_party(keypair.address(), "complete")?;
        self.transition(&keypair, fiber_id, "complete", json!({ "proof": proof }))
            .await
    }

    /// A party escalates the contract to dispute.
    pub async fn dispute_contract(
        &self,
        private_key: &str,
        fiber_id: &str,
        reason: &str,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("dispute", &fiber, &["ACTIVE"])?;
        let view = ContractView::of(&fiber)?;
        view.require_party(keypair.address(), "dispute")?;
        self.transition(&keypair, fiber_id, "dispute", json!({ "reason": reason }))
            .await
    }

    /// Finalizes a contract once both parties have submitted completions.
    pub async fn finalize_contract(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("finalize", &fiber, &["ACTIVE"])?;
        let view = ContractView::of(&fiber)?;
        if !view.completers.contains(&view.proposer)
            || !view.completers.contains(&view.counterparty)
        {
            return Err(BridgeError::StateConflict {
                operation: "finalize".into(),
                current: format!(
                    "ACTIVE with {} of 2 required completions",
                    view.completers.len().min(2)
                ),
            });
        }
        self.transition(&keypair, fiber_id, "finalize", json!({}))
            .await
    }

    // --- Markets --------------------------------------------------------

    /// Creates a `Market` fiber in `PROPOSED`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_market(
        &self,
        private_key: &str,
        market_type: MarketType,
        oracles: &[String],
        quorum: u32,
        deadline: Option<u64>,
        threshold: Option<u64>,
        description: Option<&str>,
    ) -> Result<CreatedReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        if market_type == MarketType::Prediction {
            if oracles.is_empty() {
                return Err(BridgeError::Validation(
                    "prediction markets require at least one oracle".into(),
                ));
            }
            if quorum == 0 || quorum as usize > oracles.len() {
                return Err(BridgeError::Validation(format!(
                    "quorum must be within 1..={}",
                    oracles.len()
                )));
            }
        }
        if matches!(market_type, MarketType::Crowdfund | MarketType::GroupBuy)
            && threshold.is_none()
        {
            return Err(BridgeError::Validation(format!(
                "{market_type} markets require a threshold"
            )));
        }

        let spec = market_workflow(market_type);
        let fiber_id = new_fiber_id();
        let mut initial_data = json!({
            "schema": "Market",
            "marketType": market_type.to_string(),
            "creator": keypair.address(),
            "oracles": oracles,
            "quorum": quorum,
            "commitments": {},
            "totalCommitted": 0,
            "resolutions": [],
            "claims": {},
            "createdAt": now_ms(),
        });
        if let Some(deadline) = deadline {
            initial_data["deadline"] = json!(deadline);
        }
        if let Some(threshold) = threshold {
            initial_data["threshold"] = json!(threshold);
        }
        if let Some(description) = description {
            initial_data["description"] = json!(description);
        }

        let receipt = self
            .reconciler
            .submit_create(
                &keypair,
                CreateStateMachine {
                    fiber_id: fiber_id.clone(),
                    definition: definition_for(spec),
                    initial_data,
                    parent_fiber_id: None,
                },
            )
            .await?;
        Ok(CreatedReceipt {
            fiber_id,
            hash: receipt.hash,
        })
    }

    /// Creator opens a proposed market for commitments.
    pub async fn open_market(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        self.market_creator_op(private_key, fiber_id, "open", &["PROPOSED"])
            .await
    }

    /// Creator cancels a market before it opens.
    pub async fn cancel_market(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        self.market_creator_op(private_key, fiber_id, "cancel", &["PROPOSED"])
            .await
    }

    async fn market_creator_op(
        &self,
        private_key: &str,
        fiber_id: &str,
        event: &str,
        allowed: &[&str],
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state(event, &fiber, allowed)?;
        let view = MarketView::of(&fiber)?;
        if keypair.address() != view.creator {
            return Err(BridgeError::Forbidden(format!(
                "only the creator may {event} this market"
            )));
        }
        self.transition(&keypair, fiber_id, event, json!({})).await
    }

    /// Commits a stake (and optional data such as a predicted outcome).
    pub async fn commit_market(
        &self,
        private_key: &str,
        fiber_id: &str,
        amount: u64,
        data: Value,
    ) -> Result<OpReceipt, BridgeError> {
        if amount == 0 {
            return Err(BridgeError::Validation("amount must be positive".into()));
        }
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("commit", &fiber, &["OPEN"])?;
        self.transition(
            &keypair,
            fiber_id,
            "commit",
            json!({ "amount": amount, "data": data }),
        )
        .await
    }

    /// Closes an open market. Allowed for the creator, or for anyone once
    /// the deadline has passed.
    pub async fn close_market(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("close", &fiber, &["OPEN"])?;
        let view = MarketView::of(&fiber)?;
        let past_deadline = view.deadline.map(|d| now_ms() >= d).unwrap_or(false);
        if keypair.address() != view.creator && !past_deadline {
            return Err(BridgeError::Forbidden(
                "only the creator may close before the deadline".into(),
            ));
        }
        self.transition(&keypair, fiber_id, "close", json!({})).await
    }

    /// An oracle submits its resolution exactly once.
    pub async fn submit_resolution(
        &self,
        private_key: &str,
        fiber_id: &str,
        outcome: &str,
        proof: Option<Value>,
    ) -> Result<OpReceipt, BridgeError> {
        if outcome.is_empty() {
            return Err(BridgeError::Validation("outcome is required".into()));
        }
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("submit_resolution", &fiber, &["CLOSED", "RESOLVING"])?;
        let view = MarketView::of(&fiber)?;
        if !view.oracles.contains(keypair.address()) {
            return Err(BridgeError::Forbidden(
                "only a designated oracle may submit a resolution".into(),
            ));
        }
        if view.resolved_oracles.contains(keypair.address()) {
            return Err(BridgeError::StateConflict {
                operation: "submit_resolution".into(),
                current: format!("{} (oracle already resolved)", fiber.current_state),
            });
        }
        self.transition(
            &keypair,
            fiber_id,
            "submit_resolution",
            json!({ "outcome": outcome, "proof": proof }),
        )
        .await
    }

    /// Finalizes a resolving market once the oracle quorum is met.
    pub async fn finalize_market(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("finalize", &fiber, &["RESOLVING"])?;
        let view = MarketView::of(&fiber)?;
        if (view.resolved_oracles.len() as u32) < view.quorum {
            return Err(BridgeError::StateConflict {
                operation: "finalize".into(),
                current: format!(
                    "RESOLVING with {}/{} resolutions",
                    view.resolved_oracles.len(),
                    view.quorum
                ),
            });
        }
        self.transition(&keypair, fiber_id, "finalize", json!({}))
            .await
    }

    /// Refunds a threshold market that fell short at its deadline.
    pub async fn refund_market(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("refund", &fiber, &["OPEN", "CLOSED"])?;
        let view = MarketView::of(&fiber)?;
        let threshold = view.threshold.ok_or_else(|| BridgeError::StateConflict {
            operation: "refund".into(),
            current: format!("{} (no threshold)", fiber.current_state),
        })?;
        if view.total_committed >= threshold {
            return Err(BridgeError::StateConflict {
                operation: "refund".into(),
                current: format!(
                    "{} with {}/{threshold} committed",
                    fiber.current_state, view.total_committed
                ),
            });
        }
        self.transition(&keypair, fiber_id, "refund", json!({})).await
    }

    /// A committer claims its settlement or refund share.
    pub async fn claim_market(
        &self,
        private_key: &str,
        fiber_id: &str,
    ) -> Result<OpReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        let fiber = self.reconciler.current(fiber_id).await?;
        require_state("claim", &fiber, &["SETTLED", "REFUNDED"])?;
        let view = MarketView::of(&fiber)?;
        if !view.committed.contains(keypair.address()) {
            return Err(BridgeError::Forbidden(
                "only committers may claim from this market".into(),
            ));
        }
        if view.claimed.contains(keypair.address()) {
            return Err(BridgeError::StateConflict {
                operation: "claim".into(),
                current: format!("{} (already claimed)", fiber.current_state),
            });
        }
        self.transition(&keypair, fiber_id, "claim", json!({})).await
    }

    // --- Generic state machines ----------------------------------------

    /// Creates a fiber from an arbitrary definition.
    pub async fn create_state_machine(
        &self,
        private_key: &str,
        definition: StateMachineDefinition,
        initial_data: Value,
        fiber_id: Option<String>,
    ) -> Result<CreatedReceipt, BridgeError> {
        let keypair = Self::keypair(private_key)?;
        if !definition
            .states
            .contains_key(&definition.initial_state.value)
        {
            return Err(BridgeError::Validation(format!(
                "initial state '{}' is not declared",
                definition.initial_state.value
            )));
        }
        let fiber_id = match fiber_id {
            Some(id) if id.is_empty() => {
                return Err(BridgeError::Validation("fiberId must be non-empty".into()))
            }
            Some(id) => id,
            None => new_fiber_id(),
        };
        let receipt = self
            .reconciler
            .submit_create(
                &keypair,
                CreateStateMachine {
                    fiber_id: fiber_id.clone(),
                    definition,
                    initial_data,
                    parent_fiber_id: None,
                },
            )
            .await?;
        Ok(CreatedReceipt {
            fiber_id,
            hash: receipt.hash,
        })
    }

    /// Fires an arbitrary event against a fiber. The sender is injected as
    /// `payload.agent` when the payload does not carry one.
    pub async fn transition_state_machine(
        &self,
        private_key: &str,
        fiber_id: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<OpReceipt, BridgeError> {
        if event_name.is_empty() {
            return Err(BridgeError::Validation("eventName is required".into()));
        }
        let keypair = Self::keypair(private_key)?;
        self.transition(&keypair, fiber_id, event_name, payload)
            .await
    }

    async fn transition(
        &self,
        keypair: &KeyPair,
        fiber_id: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<OpReceipt, BridgeError> {
        let payload = with_agent(payload, keypair.address());
        self.reconciler
            .submit_transition(keypair, fiber_id, event_name, payload)
            .await
            .map(OpReceipt::from)
    }
}

/// Ensures the fiber sits in one of the allowed states; otherwise a
/// `StateConflict` carrying the current status.
fn require_state(operation: &str, fiber: &Fiber, allowed: &[&str]) -> Result<(), BridgeError> {
    if allowed.contains(&fiber.current_state.as_str()) {
        Ok(())
    } else {
        Err(BridgeError::StateConflict {
            operation: operation.to_string(),
            current: fiber.current_state.clone(),
        })
    }
}

fn with_agent(mut payload: Value, address: &str) -> Value {
    if !payload.is_object() {
        payload = json!({});
    }
    if let Some(map) = payload.as_object_mut() {
        map.entry("agent".to_string())
            .or_insert_with(|| json!(address));
    }
    payload
}

struct ContractView {
    proposer: String,
    counterparty: String,
    completers: BTreeSet<String>,
}

impl ContractView {
    fn of(fiber: &Fiber) -> Result<Self, BridgeError> {
        let proposer = str_field(fiber, "proposer")?;
        let counterparty = str_field(fiber, "counterparty")?;
        let completers = fiber.state_data["completions"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.get("agent").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            proposer,
            counterparty,
            completers,
        })
    }

    fn require_party(&self, address: &str, operation: &str) -> Result<(), BridgeError> {
        if address == self.proposer || address == self.counterparty {
            Ok(())
        } else {
            Err(BridgeError::Forbidden(format!(
                "only a contract party may {operation}"
            )))
        }
    }
}

struct MarketView {
    creator: String,
    oracles: BTreeSet<String>,
    quorum: u32,
    deadline: Option<u64>,
    threshold: Option<u64>,
    total_committed: u64,
    resolved_oracles: BTreeSet<String>,
    committed: BTreeSet<String>,
    claimed: BTreeSet<String>,
}

impl MarketView {
    fn of(fiber: &Fiber) -> Result<Self, BridgeError> {
        let data = &fiber.state_data;
        let creator = str_field(fiber, "creator")?;
        let oracles = data["oracles"]
            .as_array()
            .map(|o| {
                o.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let resolved_oracles = data["resolutions"]
            .as_array()
            .map(|r| {
                r.iter()
                    .filter_map(|e| e.get("oracle").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let committed = data["commitments"]
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        let claimed = data["claims"]
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        Ok(Self {
            creator,
            oracles,
            quorum: data["quorum"].as_u64().unwrap_or(0) as u32,
            deadline: data["deadline"].as_u64(),
            threshold: data["threshold"].as_u64(),
            total_committed: data["totalCommitted"].as_u64().unwrap_or(0),
            resolved_oracles,
            committed,
            claimed,
        })
    }
}

fn str_field(fiber: &Fiber, field: &str) -> Result<String, BridgeError> {
    fiber.state_data[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            BridgeError::Validation(format!(
                "fiber {} carries no '{field}' field",
                fiber.fiber_id
            ))
        })
}
