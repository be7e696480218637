//! In-process fakes for exercising the pipeline without a metagraph.
//!
//! [`MockDataLayer`] enforces the optimistic-concurrency contract
//! (`targetSequenceNumber` must match), applies definition transitions, and
//! simulates snapshot-visibility lag, which is enough to drive the sequence
//! reconciler, the bridge engine, and the orchestrator end to end.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::api::DataLayerApi;
use crate::health::{HealthApi, SyncStatus};
use async_trait::async_trait;
use loom_types::envelope::Signed;
use loom_types::error::{upstream_codes, ClientError};
use loom_types::fiber::{
    Checkpoint, CheckpointState, CreateStateMachine, DataUpdate, Fiber, SubmitReceipt,
    TransitionStateMachine,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    fibers: HashMap<String, Fiber>,
    /// Remaining visibility polls before a freshly created fiber appears.
    pending_visibility: HashMap<String, u32>,
    ordinal: u64,
    submit_count: u64,
    submitted: Vec<DataUpdate>,
}

/// A data layer double that honors sequence checks and visibility lag.
#[derive(Default)]
pub struct MockDataLayer {
    state: Mutex<MockState>,
    /// Polls a freshly created fiber stays invisible for.
    creation_lag: u32,
}

impl MockDataLayer {
    /// A mock with immediate snapshot visibility.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose new fibers stay invisible for `lag` polls, simulating
    /// the race between data-layer acceptance and snapshot inclusion.
    pub fn with_creation_lag(lag: u32) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            creation_lag: lag,
        }
    }

    /// Total accepted submissions.
    pub fn submit_count(&self) -> u64 {
        self.state.lock().unwrap().submit_count
    }

    /// Every update accepted so far, in order.
    pub fn submitted(&self) -> Vec<DataUpdate> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Current view of a fiber, ignoring visibility lag.
    pub fn fiber(&self, fiber_id: &str) -> Option<Fiber> {
        self.state.lock().unwrap().fibers.get(fiber_id).cloned()
    }

    /// Overwrites a fiber directly, for test setup.
    pub fn put_fiber(&self, fiber: Fiber) {
        self.state
            .lock()
            .unwrap()
            .fibers
            .insert(fiber.fiber_id.clone(), fiber);
    }

    fn reject(code: &str, detail: &str) -> ClientError {
        ClientError::HttpStatus {
            status: 400,
            body: json!({ "code": code, "message": detail }).to_string(),
        }
    }

    fn apply_create(state: &mut MockState, msg: &CreateStateMachine, lag: u32) -> Result<(), ClientError> {
        if state.fibers.contains_key(&msg.fiber_id) {
            return Err(Self::reject("AlreadyExists", &msg.fiber_id));
        }
        let mut state_data = msg.initial_data.clone();
        if let Value::Object(map) = &mut state_data {
            map.entry("status".to_string())
                .or_insert_with(|| json!(msg.definition.initial_state.value));
        }
        state.fibers.insert(
            msg.fiber_id.clone(),
            Fiber {
                fiber_id: msg.fiber_id.clone(),
                current_state: msg.definition.initial_state.value.clone(),
                definition: Some(msg.definition.clone()),
                state_data,
                sequence_number: 0,
                owners: None,
                parent_fiber_id: msg.parent_fiber_id.clone(),
            },
        );
        if lag > 0 {
            state.pending_visibility.insert(msg.fiber_id.clone(), lag);
        }
        Ok(())
    }

    fn apply_transition(
        state: &mut MockState,
        msg: &TransitionStateMachine,
    ) -> Result<(), ClientError> {
        let fiber = state
            .fibers
            .get_mut(&msg.fiber_id)
            .ok_or_else(|| Self::reject(upstream_codes::CID_NOT_FOUND, &msg.fiber_id))?;
        if msg.target_sequence_number != fiber.sequence_number {
            return Err(Self::reject(
                upstream_codes::STALE_SEQUENCE,
                &format!(
                    "expected {}, got {}",
                    fiber.sequence_number, msg.target_sequence_number
                ),
            ));
        }
        let next_state = fiber
            .definition
            .as_ref()
            .and_then(|d| {
                d.transitions
                    .iter()
                    .find(|t| t.from.value == fiber.current_state && t.event_name == msg.event_name)
            })
            .map(|t| t.to.value.clone())
            .ok_or_else(|| {
                Self::reject(
                    upstream_codes::GUARD_REJECTED,
                    &format!("no '{}' out of {}", msg.event_name, fiber.current_state),
                )
            })?;

        fiber.sequence_number += 1;
        fiber.current_state = next_state.clone();
        apply_effect(&mut fiber.state_data, &msg.event_name, &msg.payload, next_state);
        Ok(())
    }
}

/// Minimal interpretation of the on-chain effects the tests depend on.
fn apply_effect(state_data: &mut Value, event: &str, payload: &Value, next_state: String) {
    if !state_data.is_object() {
        *state_data = json!({});
    }
    let map = state_data.as_object_mut().unwrap();
    map.insert("status".to_string(), json!(next_state));
    map.insert("lastEvent".to_string(), json!(event));
    let agent = payload
        .get("agent")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match event {
        "complete" => {
            let entry = json!({ "agent": agent, "proof": payload.get("proof").cloned() });
            push(map, "completions", entry);
        }
        "commit" => {
            let amount = payload.get("amount").and_then(Value::as_u64).unwrap_or(0);
            let commitments = map
                .entry("commitments".to_string())
                .or_insert_with(|| json!({}));
            let existing = commitments
                .get(&agent)
                .and_then(|c| c.get("amount"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            commitments[&agent] = json!({
                "amount": existing + amount,
                "data": payload.get("data").cloned().unwrap_or(Value::Null),
                "lastCommitAt": 0
            });
            let total = map
                .get("totalCommitted")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            map.insert("totalCommitted".to_string(), json!(total + amount));
        }
        "submit_resolution" => {
            let entry = json!({
                "oracle": agent,
                "outcome": payload.get("outcome").cloned().unwrap_or(Value::Null),
                "proof": payload.get("proof").cloned(),
                "submittedAt": 0
            });
            push(map, "resolutions", entry);
        }
        "claim" => {
            let claims = map.entry("claims".to_string()).or_insert_with(|| json!({}));
            claims[&agent] = json!({ "claimedAt": 0, "amount": 0 });
        }
        "vouch" => {
            let entry = json!({ "from": agent, "target": payload.get("target").cloned() });
            push(map, "vouches", entry);
        }
        _ => {}
    }
}

fn push(map: &mut serde_json::Map<String, Value>, key: &str, entry: Value) {
    map.entry(key.to_string())
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .unwrap()
        .push(entry);
}

#[async_trait]
impl DataLayerApi for MockDataLayer {
    async fn submit(&self, envelope: &Signed<DataUpdate>) -> Result<SubmitReceipt, ClientError> {
        if envelope.proofs.is_empty() {
            return Err(Self::reject("NoProofs", "unsigned submission"));
        }
        let mut state = self.state.lock().unwrap();
        match &envelope.value {
            DataUpdate::CreateStateMachine(msg) => {
                Self::apply_create(&mut state, msg, self.creation_lag)?
            }
            DataUpdate::TransitionStateMachine(msg) => Self::apply_transition(&mut state, msg)?,
            DataUpdate::ArchiveStateMachine(msg) => {
                state.fibers.remove(&msg.fiber_id);
            }
        }
        state.submit_count += 1;
        state.ordinal += 1;
        state.submitted.push(envelope.value.clone());
        Ok(SubmitReceipt {
            hash: format!("{:064x}", state.submit_count),
            ordinal: Some(state.ordinal),
        })
    }

    async fn get_state_machine(&self, fiber_id: &str) -> Result<Option<Fiber>, ClientError> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.pending_visibility.get_mut(fiber_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
            state.pending_visibility.remove(fiber_id);
        }
        Ok(state.fibers.get(fiber_id).cloned())
    }

    async fn get_checkpoint(&self) -> Result<Checkpoint, ClientError> {
        let mut state = self.state.lock().unwrap();
        let mut became_visible = Vec::new();
        for (fiber_id, remaining) in state.pending_visibility.iter_mut() {
            if *remaining > 0 {
                *remaining -= 1;
            } else {
                became_visible.push(fiber_id.clone());
            }
        }
        for fiber_id in became_visible {
            state.pending_visibility.remove(&fiber_id);
        }
        let state_machines: BTreeMap<String, Fiber> = state
            .fibers
            .iter()
            .filter(|(id, _)| !state.pending_visibility.contains_key(*id))
            .map(|(id, f)| (id.clone(), f.clone()))
            .collect();
        Ok(Checkpoint {
            ordinal: state.ordinal,
            state: CheckpointState { state_machines },
        })
    }

    async fn get_latest_ordinal(&self) -> Result<Option<u64>, ClientError> {
        Ok(Some(self.state.lock().unwrap().ordinal))
    }
}

/// A health probe that always answers with a fixed status.
pub struct StaticHealth(pub SyncStatus);

#[async_trait]
impl HealthApi for StaticHealth {
    async fn sync_status(&self) -> Result<SyncStatus, ClientError> {
        Ok(self.0.clone())
    }
}
