#![forbid(unsafe_code)]
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo
    )
)]

//! # Loom Bridge
//!
//! The write path to the metagraph: typed operations (register agents,
//! drive contracts and markets, generic state-machine create/transition)
//! layered over a sequence reconciler that resolves optimistic-concurrency
//! contention on `targetSequenceNumber`.
//!
//! Every operation validates its inputs and applies client-side role/state
//! pre-checks before anything touches the network, so requests the on-chain
//! guard would reject are refused locally with the matching error kind.

pub mod engine;
pub mod reconciler;

pub use engine::BridgeEngine;
pub use reconciler::{ReconcilerConfig, SequenceReconciler, TransitionReceipt};
