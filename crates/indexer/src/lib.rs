#![forbid(unsafe_code)]

//! # Loom Indexer
//!
//! The asynchronous read-back path from the metagraph: webhook intake for
//! guard-rule rejections and snapshot confirmations, a redb-backed store
//! with a unique `updateHash` constraint, a broadcast channel feeding the
//! orchestrator, and the filtered query API consumed by external tools.

pub mod intake;
pub mod query;
pub mod server;
pub mod store;

pub use server::{ensure_subscription, router, run_server, IndexerState};
pub use store::{RejectionFilter, RejectionPage, Store, SweepOutcome, UpsertOutcome};
