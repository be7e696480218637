//! Builds on-chain `StateMachineDefinition`s from workflow specs.
//!
//! Guards and effects are JSON expression trees evaluated by the metagraph
//! over `state`, `event`, and `$timestamp`. The client emits them once at
//! creation time and otherwise treats them as opaque blobs.

use crate::registry::{TransitionSpec, WorkflowSpec};
use loom_types::fiber::{
    DefinitionMetadata, NumericId, StateDef, StateMachineDefinition, StateRef, TransitionDef,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Materializes the on-chain definition for a workflow.
pub fn definition_for(spec: &WorkflowSpec) -> StateMachineDefinition {
    let states: BTreeMap<String, StateDef> = spec
        .states
        .iter()
        .enumerate()
        .map(|(i, name)| {
            (
                (*name).to_string(),
                StateDef {
                    id: NumericId { value: i as u32 },
                    is_final: spec.final_states.contains(name),
                    metadata: None,
                },
            )
        })
        .collect();

    let transitions = spec
        .transitions
        .iter()
        .map(|tr| TransitionDef {
            from: StateRef::new(tr.from),
            to: StateRef::new(tr.to),
            event_name: tr.event.to_string(),
            guard: guard_for(tr),
            effect: effect_for(tr),
            dependencies: None,
        })
        .collect();

    StateMachineDefinition {
        states,
        initial_state: StateRef::new(spec.initial_state),
        transitions,
        metadata: DefinitionMetadata {
            name: spec.name.to_string(),
            description: None,
            version: Some("1".to_string()),
        },
    }
}

/// Role guard expression for a transition.
fn guard_for(tr: &TransitionSpec) -> Value {
    let role_clause = match tr.actor_role {
        "creator" => eq_var("event.agent", "state.creator"),
        "proposer" => eq_var("event.agent", "state.proposer"),
        "counterparty" => eq_var("event.agent", "state.counterparty"),
        "owner" | "player" | "depositor" => eq_var("event.agent", "state.owner"),
        "beneficiary" => eq_var("event.agent", "state.beneficiary"),
        "arbiter" => eq_var("event.agent", "state.arbiter"),
        "approver" => eq_var("event.agent", "state.approver"),
        "party" => json!({
            "or": [
                eq_var("event.agent", "state.proposer"),
                eq_var("event.agent", "state.counterparty"),
            ]
        }),
        "oracle" => json!({ "in": [{ "var": "event.agent" }, { "var": "state.oracles" }] }),
        // participant / peer / anyone: no role restriction.
        _ => json!(true),
    };

    match tr.event {
        // Markets auto-close once the deadline passes, regardless of role.
        "close" => json!({
            "or": [
                role_clause,
                { ">=": [{ "var": "$timestamp" }, { "var": "state.deadline" }] },
            ]
        }),
        // Refunds require a funding shortfall at the deadline.
        "refund" => json!({
            "and": [
                { ">=": [{ "var": "$timestamp" }, { "var": "state.deadline" }] },
                { "<": [{ "var": "state.totalCommitted" }, { "var": "state.threshold" }] },
            ]
        }),
        // Finalization requires the oracle quorum.
        "finalize" if tr.from == "RESOLVING" => json!({
            ">=": [
                { "length": { "var": "state.resolutions" } },
                { "var": "state.quorum" },
            ]
        }),
        _ => role_clause,
    }
}

/// Effect expression for a transition: move the status, remember the event,
/// then apply any event-specific accumulation.
fn effect_for(tr: &TransitionSpec) -> Value {
    let mut ops = vec![json!({ "assign": { "status": tr.to, "lastEvent": tr.event } })];
    match tr.event {
        "complete" => ops.push(json!({
            "append": {
                "path": "completions",
                "value": { "agent": { "var": "event.agent" }, "proof": { "var": "event.proof" } }
            }
        })),
        "commit" => ops.push(json!({
            "accumulate": {
                "path": "commitments",
                "key": { "var": "event.agent" },
                "amount": { "var": "event.amount" },
                "data": { "var": "event.data" },
                "total": "totalCommitted"
            }
        })),
        "submit_resolution" => ops.push(json!({
            "append": {
                "path": "resolutions",
                "value": {
                    "oracle": { "var": "event.agent" },
                    "outcome": { "var": "event.outcome" },
                    "proof": { "var": "event.proof" },
                    "submittedAt": { "var": "$timestamp" }
                }
            }
        })),
        "claim" => ops.push(json!({
            "append": {
                "path": "claims",
                "value": { "agent": { "var": "event.agent" }, "claimedAt": { "var": "$timestamp" } }
            }
        })),
        "vouch" => ops.push(json!({
            "append": {
                "path": "vouches",
                "value": { "from": { "var": "event.agent" }, "target": { "var": "event.target" } }
            }
        })),
        "cast_vote" => ops.push(json!({
            "accumulate": {
                "path": "votes",
                "key": { "var": "event.agent" },
                "data": { "var": "event.choice" }
            }
        })),
        _ => {}
    }
    json!({ "sequence": ops })
}

fn eq_var(left: &str, right: &str) -> Value {
    json!({ "===": [{ "var": left }, { "var": right }] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::by_name;

    #[test]
    fn contract_definition_shape() {
        let def = definition_for(by_name("Contract").unwrap());
        assert_eq!(def.initial_state.value, "PROPOSED");
        assert!(def.is_final_state("COMPLETED"));
        assert!(!def.is_final_state("ACTIVE"));
        let accept = def
            .transitions
            .iter()
            .find(|t| t.event_name == "accept")
            .unwrap();
        assert_eq!(accept.from.value, "PROPOSED");
        assert_eq!(accept.to.value, "ACTIVE");
        // Counterparty guard references the stored counterparty.
        assert!(accept.guard.to_string().contains("state.counterparty"));
    }

    #[test]
    fn market_close_guard_uses_timestamp() {
        let def = definition_for(by_name("PredictionMarket").unwrap());
        let close = def
            .transitions
            .iter()
            .find(|t| t.event_name == "close")
            .unwrap();
        assert!(close.guard.to_string().contains("$timestamp"));
    }

    #[test]
    fn state_ids_are_distinct() {
        let def = definition_for(by_name("AgentIdentity").unwrap());
        let mut ids: Vec<u32> = def.states.values().map(|s| s.id.value).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), def.states.len());
    }
}
