//! Workflow specifications and the built-in registry.

use loom_types::agent::MarketType;
use once_cell::sync::Lazy;
use rand::Rng;
use serde_json::{json, Value};

/// Classification used for dispatch and for `FIBER_WEIGHTS` lookup.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkflowType {
    /// Agent identity lifecycle.
    AgentIdentity,
    /// Bilateral contract lifecycle.
    Contract,
    /// Market lifecycle, parameterized by flavor.
    Market(MarketType),
    /// Any other registered workflow.
    Custom(&'static str),
}

impl WorkflowType {
    /// The key this type is looked up under in `FIBER_WEIGHTS`.
    pub fn weight_key(&self) -> &'static str {
        match self {
            Self::AgentIdentity => "AgentIdentity",
            Self::Contract => "Contract",
            Self::Market(MarketType::Prediction) => "Prediction",
            Self::Market(MarketType::Auction) => "Auction",
            Self::Market(MarketType::Crowdfund) => "Crowdfund",
            Self::Market(MarketType::GroupBuy) => "GroupBuy",
            Self::Custom(name) => name,
        }
    }
}

/// Context handed to payload generators.
pub struct PayloadCtx<'a> {
    /// Acting agent's address.
    pub agent: &'a str,
    /// Millisecond epoch of the tick.
    pub now_ms: u64,
    /// Randomness source for generated amounts and choices.
    pub rng: &'a mut dyn rand::RngCore,
}

/// Generates the event payload for a transition attempt.
pub type PayloadGenerator = fn(&mut PayloadCtx<'_>) -> Value;

/// One legal transition of a workflow.
pub struct TransitionSpec {
    /// Source state.
    pub from: &'static str,
    /// Destination state.
    pub to: &'static str,
    /// Event name fired on the fiber.
    pub event: &'static str,
    /// Role allowed to fire this event.
    pub actor_role: &'static str,
    /// Base selection weight before agent and context modifiers.
    pub base_weight: f64,
    /// Payload generator.
    pub payload: PayloadGenerator,
}

/// A complete workflow declaration.
pub struct WorkflowSpec {
    /// Registry name, also the definition's metadata name.
    pub name: &'static str,
    /// Classification.
    pub workflow_type: WorkflowType,
    /// Roles appearing in `actor_role` fields.
    pub roles: &'static [&'static str],
    /// All states.
    pub states: &'static [&'static str],
    /// Initial state for new fibers.
    pub initial_state: &'static str,
    /// States that terminate the fiber.
    pub final_states: &'static [&'static str],
    /// All legal transitions.
    pub transitions: Vec<TransitionSpec>,
}

impl WorkflowSpec {
    /// Transitions available out of the given state.
    pub fn transitions_from<'a>(
        &'a self,
        state: &'a str,
    ) -> impl Iterator<Item = &'a TransitionSpec> + 'a {
        self.transitions.iter().filter(move |t| t.from == state)
    }

    /// Looks up a transition by event name and source state.
    pub fn transition(&self, from: &str, event: &str) -> Option<&TransitionSpec> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
    }
}

fn agent_only(ctx: &mut PayloadCtx<'_>) -> Value {
    json!({ "agent": ctx.agent })
}

fn completion_payload(ctx: &mut PayloadCtx<'_>) -> Value {
    let proof: u64 = ctx.rng.gen();
    json!({ "agent": ctx.agent, "proof": format!("{proof:016x}") })
}

fn dispute_payload(ctx: &mut PayloadCtx<'_>) -> Value {
    json!({ "agent": ctx.agent, "reason": "terms unmet" })
}

fn commit_payload(ctx: &mut PayloadCtx<'_>) -> Value {
    let amount: u64 = ctx.rng.gen_range(10..=200);
    let outcome = if ctx.rng.gen_bool(0.5) { "YES" } else { "NO" };
    json!({
        "agent": ctx.agent,
        "amount": amount,
        "data": { "outcome": outcome }
    })
}

fn resolution_payload(ctx: &mut PayloadCtx<'_>) -> Value {
    let outcome = if ctx.rng.gen_bool(0.5) { "YES" } else { "NO" };
    json!({
        "agent": ctx.agent,
        "outcome": outcome,
        "proof": { "observedAt": ctx.now_ms }
    })
}

fn vote_payload(ctx: &mut PayloadCtx<'_>) -> Value {
    let choice: u32 = ctx.rng.gen_range(0..3);
    json!({ "agent": ctx.agent, "choice": choice })
}

fn mark_payload(ctx: &mut PayloadCtx<'_>) -> Value {
    let cell: u32 = ctx.rng.gen_range(0..9);
    json!({ "agent": ctx.agent, "cell": cell })
}

fn escrow_fund_payload(ctx: &mut PayloadCtx<'_>) -> Value {
    let amount: u64 = ctx.rng.gen_range(50..=500);
    json!({ "agent": ctx.agent, "amount": amount })
}

fn comment_payload(ctx: &mut PayloadCtx<'_>) -> Value {
    json!({ "agent": ctx.agent, "data": { "at": ctx.now_ms } })
}

fn agent_identity_spec() -> WorkflowSpec {
    WorkflowSpec {
        name: "AgentIdentity",
        workflow_type: WorkflowType::AgentIdentity,
        roles: &["owner", "peer"],
        states: &[
            "REGISTERED",
            "ACTIVE",
            "CHALLENGED",
            "SUSPENDED",
            "PROBATION",
            "WITHDRAWN",
        ],
        initial_state: "REGISTERED",
        final_states: &["WITHDRAWN"],
        transitions: vec![
            t("REGISTERED", "ACTIVE", "activate", "owner", 1.0, agent_only),
            t("ACTIVE", "ACTIVE", "vouch", "owner", 0.6, agent_only),
            t("ACTIVE", "CHALLENGED", "challenge", "peer", 0.15, dispute_payload),
            t("CHALLENGED", "ACTIVE", "respond", "owner", 0.9, completion_payload),
            t("CHALLENGED", "SUSPENDED", "suspend", "peer", 0.2, dispute_payload),
            t("SUSPENDED", "PROBATION", "reinstate", "peer", 0.4, agent_only),
            t("PROBATION", "ACTIVE", "restore", "owner", 0.7, agent_only),
            t("ACTIVE", "WITHDRAWN", "withdraw", "owner", 0.05, agent_only),
            t("PROBATION", "WITHDRAWN", "withdraw", "owner", 0.1, agent_only),
        ],
    }
}

fn contract_spec() -> WorkflowSpec {
    WorkflowSpec {
        name: "Contract",
        workflow_type: WorkflowType::Contract,
        roles: &["proposer", "counterparty", "party"],
        states: &["PROPOSED", "ACTIVE", "COMPLETED", "REJECTED", "DISPUTED"],
        initial_state: "PROPOSED",
        final_states: &["COMPLETED", "REJECTED", "DISPUTED"],
        transitions: vec![
            t("PROPOSED", "ACTIVE", "accept", "counterparty", 0.7, agent_only),
            t("PROPOSED", "REJECTED", "reject", "counterparty", 0.3, dispute_payload),
            t("ACTIVE", "ACTIVE", "complete", "party", 0.8, completion_payload),
            t("ACTIVE", "COMPLETED", "finalize", "proposer", 0.6, agent_only),
            t("ACTIVE", "DISPUTED", "dispute", "party", 0.1, dispute_payload),
        ],
    }
}

fn market_spec(market_type: MarketType, name: &'static str) -> WorkflowSpec {
    WorkflowSpec {
        name,
        workflow_type: WorkflowType::Market(market_type),
        roles: &["creator", "participant", "oracle", "anyone"],
        states: &[
            "PROPOSED",
            "OPEN",
            "CLOSED",
            "RESOLVING",
            "SETTLED",
            "REFUNDED",
            "CANCELLED",
        ],
        initial_state: "PROPOSED",
        final_states: &["CANCELLED"],
        transitions: vec![
            t("PROPOSED", "OPEN", "open", "creator", 0.9, agent_only),
            t("PROPOSED", "CANCELLED", "cancel", "creator", 0.1, agent_only),
            t("OPEN", "OPEN", "commit", "participant", 0.8, commit_payload),
            t("OPEN", "CLOSED", "close", "creator", 0.4, agent_only),
            t("OPEN", "REFUNDED", "refund", "anyone", 0.2, agent_only),
            t(
                "CLOSED",
                "RESOLVING",
                "submit_resolution",
                "oracle",
                0.9,
                resolution_payload,
            ),
            t("CLOSED", "REFUNDED", "refund", "anyone", 0.2, agent_only),
            t(
                "RESOLVING",
                "RESOLVING",
                "submit_resolution",
                "oracle",
                0.9,
                resolution_payload,
            ),
            t("RESOLVING", "SETTLED", "finalize", "anyone", 0.7, agent_only),
            t("SETTLED", "SETTLED", "claim", "participant", 0.9, agent_only),
            t("REFUNDED", "REFUNDED", "claim", "participant", 0.9, agent_only),
        ],
    }
}

fn voting_spec() -> WorkflowSpec {
    WorkflowSpec {
        name: "Voting",
        workflow_type: WorkflowType::Custom("Voting"),
        roles: &["owner", "participant", "anyone"],
        states: &["OPEN", "TALLYING", "DECIDED"],
        initial_state: "OPEN",
        final_states: &["DECIDED"],
        transitions: vec![
            t("OPEN", "OPEN", "cast_vote", "participant", 0.8, vote_payload),
            t("OPEN", "TALLYING", "close_voting", "owner", 0.3, agent_only),
            t("TALLYING", "DECIDED", "tally", "anyone", 0.9, agent_only),
        ],
    }
}

fn token_escrow_spec() -> WorkflowSpec {
    WorkflowSpec {
        name: "TokenEscrow",
        workflow_type: WorkflowType::Custom("TokenEscrow"),
        roles: &["depositor", "beneficiary", "arbiter"],
        states: &["CREATED", "FUNDED", "RELEASED", "REFUNDED", "DISPUTED"],
        initial_state: "CREATED",
        final_states: &["RELEASED", "REFUNDED"],
        transitions: vec![
            t("CREATED", "FUNDED", "fund", "depositor", 0.9, escrow_fund_payload),
            t("FUNDED", "RELEASED", "release", "depositor", 0.6, agent_only),
            t("FUNDED", "DISPUTED", "dispute", "beneficiary", 0.1, dispute_payload),
            t("FUNDED", "REFUNDED", "refund", "arbiter", 0.2, agent_only),
            t("DISPUTED", "RELEASED", "resolve_release", "arbiter", 0.5, agent_only),
            t("DISPUTED", "REFUNDED", "resolve_refund", "arbiter", 0.5, agent_only),
        ],
    }
}

fn tictactoe_spec() -> WorkflowSpec {
    WorkflowSpec {
        name: "TicTacToe",
        workflow_type: WorkflowType::Custom("TicTacToe"),
        roles: &["player", "peer", "anyone"],
        states: &["WAITING_FOR_PLAYER", "IN_PLAY", "FINISHED"],
        initial_state: "WAITING_FOR_PLAYER",
        final_states: &["FINISHED"],
        transitions: vec![
            t("WAITING_FOR_PLAYER", "IN_PLAY", "join", "peer", 0.9, agent_only),
            t("IN_PLAY", "IN_PLAY", "place_mark", "player", 0.9, mark_payload),
            t("IN_PLAY", "FINISHED", "declare_result", "anyone", 0.3, agent_only),
            t("IN_PLAY", "FINISHED", "forfeit", "player", 0.05, agent_only),
        ],
    }
}

fn approval_spec() -> WorkflowSpec {
    WorkflowSpec {
        name: "Approval",
        workflow_type: WorkflowType::Custom("Approval"),
        roles: &["approver", "anyone"],
        states: &["PENDING", "APPROVED", "DECLINED"],
        initial_state: "PENDING",
        final_states: &["APPROVED", "DECLINED"],
        transitions: vec![
            t("PENDING", "PENDING", "comment", "anyone", 0.3, comment_payload),
            t("PENDING", "APPROVED", "approve", "approver", 0.6, agent_only),
            t("PENDING", "DECLINED", "decline", "approver", 0.2, dispute_payload),
        ],
    }
}

fn t(
    from: &'static str,
    to: &'static str,
    event: &'static str,
    actor_role: &'static str,
    base_weight: f64,
    payload: PayloadGenerator,
) -> TransitionSpec {
    TransitionSpec {
        from,
        to,
        event,
        actor_role,
        base_weight,
        payload,
    }
}

static REGISTRY: Lazy<Vec<WorkflowSpec>> = Lazy::new(|| {
    vec![
        agent_identity_spec(),
        contract_spec(),
        market_spec(MarketType::Prediction, "PredictionMarket"),
        market_spec(MarketType::Auction, "AuctionMarket"),
        market_spec(MarketType::Crowdfund, "CrowdfundMarket"),
        market_spec(MarketType::GroupBuy, "GroupBuyMarket"),
        voting_spec(),
        token_escrow_spec(),
        tictactoe_spec(),
        approval_spec(),
    ]
});

/// All registered workflows.
pub fn registry() -> &'static [WorkflowSpec] {
    &REGISTRY
}

/// Looks up a workflow by registry name.
pub fn by_name(name: &str) -> Option<&'static WorkflowSpec> {
    REGISTRY.iter().find(|w| w.name == name)
}

/// Looks up the shared market workflow for a flavor.
pub fn market_workflow(market_type: MarketType) -> &'static WorkflowSpec {
    REGISTRY
        .iter()
        .find(|w| w.workflow_type == WorkflowType::Market(market_type))
        .unwrap_or_else(|| &REGISTRY[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn registry_contains_all_builtins() {
        let names: Vec<&str> = registry().iter().map(|w| w.name).collect();
        for expected in [
            "AgentIdentity",
            "Contract",
            "PredictionMarket",
            "AuctionMarket",
            "CrowdfundMarket",
            "GroupBuyMarket",
            "Voting",
            "TokenEscrow",
            "TicTacToe",
            "Approval",
        ] {
            assert!(names.contains(&expected), "missing workflow {expected}");
        }
    }

    #[test]
    fn every_transition_references_known_states() {
        for wf in registry() {
            assert!(wf.states.contains(&wf.initial_state));
            for f in wf.final_states {
                assert!(wf.states.contains(f), "{}: unknown final state {f}", wf.name);
            }
            for tr in &wf.transitions {
                assert!(wf.states.contains(&tr.from), "{}: {}", wf.name, tr.from);
                assert!(wf.states.contains(&tr.to), "{}: {}", wf.name, tr.to);
                assert!(
                    wf.roles.contains(&tr.actor_role),
                    "{}: unknown role {}",
                    wf.name,
                    tr.actor_role
                );
            }
        }
    }

    #[test]
    fn no_transitions_leave_final_states() {
        for wf in registry() {
            for final_state in wf.final_states {
                assert_eq!(
                    wf.transitions_from(final_state).count(),
                    0,
                    "{}: transition out of final state {final_state}",
                    wf.name
                );
            }
        }
    }

    #[test]
    fn payload_generators_inject_the_agent() {
        let mut rng = StdRng::seed_from_u64(7);
        for wf in registry() {
            for tr in &wf.transitions {
                let mut ctx = PayloadCtx {
                    agent: "addr-1",
                    now_ms: 1_700_000_000_000,
                    rng: &mut rng,
                };
                let payload = (tr.payload)(&mut ctx);
                assert_eq!(
                    payload["agent"], "addr-1",
                    "{}/{} payload lacks agent",
                    wf.name, tr.event
                );
            }
        }
    }
}
