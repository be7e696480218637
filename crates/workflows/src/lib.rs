#![forbid(unsafe_code)]

//! # Loom Workflows
//!
//! The declarative registry of fiber workflows the orchestrator can drive:
//! which states exist, which transitions are legal, which role may fire them,
//! with what base weight, and how event payloads are generated.
//!
//! Role guards and state pre-checks here are authoritative on the client
//! side so we never submit a transaction the on-chain guard would reject;
//! the on-chain guard remains the source of truth. The guard/effect
//! expression trees emitted into on-chain definitions are opaque to every
//! client-side consumer.
//!
//! Adding a new workflow is a registry change: declare a [`WorkflowSpec`]
//! in [`registry`] and the scheduler picks it up through `FIBER_WEIGHTS`.

pub mod availability;
pub mod defs;
pub mod registry;
pub mod settlement;

pub use availability::{available_contract_events, available_identity_events, available_market_events};
pub use registry::{by_name, registry, PayloadCtx, TransitionSpec, WorkflowSpec, WorkflowType};
pub use settlement::{claim_amount, settle_market, PAYOUT_FEE_BPS};
