//! The on-chain fiber model and the data-layer message shapes.
//!
//! A *fiber* is an on-chain instance of a state machine, identified by a
//! UUID. The shapes in this module mirror the metagraph wire protocol
//! exactly: field names are camelCase on the wire, and state references are
//! nested under a `{ "value": ... }` wrapper. Guards and effects inside a
//! definition are opaque JSON expression trees consumed only by the
//! metagraph; the client never evaluates them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A state reference as it appears on the wire: `{ "value": "<state name>" }`.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct StateRef {
    /// The referenced state name.
    pub value: String,
}

impl StateRef {
    /// Builds a reference to the named state.
    pub fn new(name: impl Into<String>) -> Self {
        Self { value: name.into() }
    }
}

impl From<&str> for StateRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// A numeric identifier wrapper: `{ "value": <n> }`.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct NumericId {
    /// The wrapped ordinal value.
    pub value: u32,
}

/// A single state inside a state-machine definition.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StateDef {
    /// Stable numeric id of the state within this definition.
    pub id: NumericId,
    /// Whether reaching this state terminates the fiber.
    pub is_final: bool,
    /// Optional free-form annotations (never interpreted client-side).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A single transition inside a state-machine definition.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TransitionDef {
    /// Source state.
    pub from: StateRef,
    /// Destination state.
    pub to: StateRef,
    /// The event that fires this transition.
    pub event_name: String,
    /// Guard expression deciding whether the transition may fire.
    /// Opaque to the client; evaluated by the metagraph over
    /// `state`, `event`, and `$timestamp`.
    pub guard: Value,
    /// Effect expression producing the next `stateData`. Opaque to the client.
    pub effect: Value,
    /// Optional fiber ids this transition depends on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
}

/// Descriptive metadata attached to a definition.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionMetadata {
    /// Human-readable workflow name (e.g. `"Contract"`).
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional definition version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A complete on-chain state-machine definition.
///
/// `states` is keyed by state name; map ordering is irrelevant to the
/// metagraph but a `BTreeMap` keeps our own encodings deterministic.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineDefinition {
    /// All states, keyed by name.
    pub states: BTreeMap<String, StateDef>,
    /// The state a freshly created fiber starts in.
    pub initial_state: StateRef,
    /// All legal transitions.
    pub transitions: Vec<TransitionDef>,
    /// Name/description/version metadata.
    pub metadata: DefinitionMetadata,
}

impl StateMachineDefinition {
    /// Returns true if the named state is final in this definition.
    pub fn is_final_state(&self, state: &str) -> bool {
        self.states.get(state).map(|s| s.is_final).unwrap_or(false)
    }
}

/// An on-chain state-machine instance as returned by the snapshot layer.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Fiber {
    /// UUID of this instance.
    pub fiber_id: String,
    /// The definition the fiber was created with, when the endpoint returns it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<StateMachineDefinition>,
    /// Name of the current state.
    pub current_state: String,
    /// Arbitrary JSON shaped by the definition's effects.
    #[serde(default)]
    pub state_data: Value,
    /// Monotonic counter incremented by every accepted transition.
    /// `(fiberId, sequenceNumber)` is a unique write coordinate.
    pub sequence_number: u64,
    /// Addresses with transition rights, when restricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owners: Option<Vec<String>>,
    /// Back-reference to a parent fiber (identifier only, never ownership).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_fiber_id: Option<String>,
}

/// The snapshot-layer checkpoint view.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Ordinal of the snapshot this view was taken at.
    pub ordinal: u64,
    /// The checkpointed application state.
    pub state: CheckpointState,
}

/// Application state carried inside a checkpoint.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    /// All known fibers, keyed by fiber id.
    #[serde(default)]
    pub state_machines: BTreeMap<String, Fiber>,
}

/// Acknowledgement returned by the data layer for an accepted submission.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    /// Hash of the accepted update.
    pub hash: String,
    /// Ordinal the update landed in, when already known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u64>,
}

/// Creates a new fiber from a definition.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateStateMachine {
    /// UUID for the new fiber, chosen by the caller.
    pub fiber_id: String,
    /// The state-machine definition to instantiate.
    pub definition: StateMachineDefinition,
    /// Initial `stateData` for the fiber.
    pub initial_data: Value,
    /// Optional parent fiber back-reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_fiber_id: Option<String>,
}

/// Fires an event against an existing fiber.
///
/// `target_sequence_number` must equal the fiber's current sequence at the
/// moment of application; the data layer rejects stale values. This is the
/// optimistic-concurrency handle the sequence reconciler drives.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TransitionStateMachine {
    /// Target fiber.
    pub fiber_id: String,
    /// Event to fire.
    pub event_name: String,
    /// Event payload. Role-guarded transitions carry `agent: <address>`.
    pub payload: Value,
    /// The sequence number the fiber is expected to be at.
    pub target_sequence_number: u64,
}

/// Archives a fiber, removing it from active checkpoints.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStateMachine {
    /// Target fiber.
    pub fiber_id: String,
    /// Optional operator-facing reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The union of messages accepted by the data layer, externally tagged on
/// the wire (`{ "CreateStateMachine": { ... } }`).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum DataUpdate {
    /// Create a new fiber.
    CreateStateMachine(CreateStateMachine),
    /// Transition an existing fiber.
    TransitionStateMachine(TransitionStateMachine),
    /// Archive a fiber.
    ArchiveStateMachine(ArchiveStateMachine),
}

impl DataUpdate {
    /// The fiber this update addresses.
    pub fn fiber_id(&self) -> &str {
        match self {
            Self::CreateStateMachine(m) => &m.fiber_id,
            Self::TransitionStateMachine(m) => &m.fiber_id,
            Self::ArchiveStateMachine(m) => &m.fiber_id,
        }
    }

    /// The update-type discriminator for this message.
    pub fn update_type(&self) -> UpdateType {
        match self {
            Self::CreateStateMachine(_) => UpdateType::CreateStateMachine,
            Self::TransitionStateMachine(_) => UpdateType::TransitionStateMachine,
            Self::ArchiveStateMachine(_) => UpdateType::ArchiveStateMachine,
        }
    }
}

/// Discriminator for update kinds as reported by the rejection webhook.
///
/// `CreateScript` / `InvokeScript` are produced by collaborators outside this
/// pipeline but still arrive through the shared rejection channel, so the
/// indexer must be able to store and filter them.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpdateType {
    /// A fiber creation.
    CreateStateMachine,
    /// A fiber transition.
    TransitionStateMachine,
    /// A fiber archival.
    ArchiveStateMachine,
    /// A script deployment.
    CreateScript,
    /// A script invocation.
    InvokeScript,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CreateStateMachine => "CreateStateMachine",
            Self::TransitionStateMachine => "TransitionStateMachine",
            Self::ArchiveStateMachine => "ArchiveStateMachine",
            Self::CreateScript => "CreateScript",
            Self::InvokeScript => "InvokeScript",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for UpdateType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CreateStateMachine" => Ok(Self::CreateStateMachine),
            "TransitionStateMachine" => Ok(Self::TransitionStateMachine),
            "ArchiveStateMachine" => Ok(Self::ArchiveStateMachine),
            "CreateScript" => Ok(Self::CreateScript),
            "InvokeScript" => Ok(Self::InvokeScript),
            other => Err(format!("unknown update type: {other}")),
        }
    }
}

/// Generates a fresh fiber id.
pub fn new_fiber_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transition_message_wire_shape() {
        let msg = DataUpdate::TransitionStateMachine(TransitionStateMachine {
            fiber_id: "f-1".into(),
            event_name: "accept".into(),
            payload: json!({"agent": "abc"}),
            target_sequence_number: 7,
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v["TransitionStateMachine"]["targetSequenceNumber"],
            json!(7)
        );
        assert_eq!(v["TransitionStateMachine"]["eventName"], json!("accept"));
    }

    #[test]
    fn definition_state_refs_are_wrapped() {
        let def = StateMachineDefinition {
            states: BTreeMap::from([(
                "PROPOSED".to_string(),
                StateDef {
                    id: NumericId { value: 0 },
                    is_final: false,
                    metadata: None,
                },
            )]),
            initial_state: StateRef::new("PROPOSED"),
            transitions: vec![],
            metadata: DefinitionMetadata {
                name: "Contract".into(),
                description: None,
                version: Some("1".into()),
            },
        };
        let v = serde_json::to_value(&def).unwrap();
        assert_eq!(v["initialState"]["value"], json!("PROPOSED"));
        assert_eq!(v["states"]["PROPOSED"]["isFinal"], json!(false));
    }

    #[test]
    fn checkpoint_tolerates_missing_state_machines() {
        let cp: Checkpoint = serde_json::from_value(json!({
            "ordinal": 12,
            "state": {}
        }))
        .unwrap();
        assert_eq!(cp.ordinal, 12);
        assert!(cp.state.state_machines.is_empty());
    }
}
