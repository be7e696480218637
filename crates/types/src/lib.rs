#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! # Loom Types
//!
//! This crate is the foundational library for the Loom pipeline, containing
//! all core data structures, error types, and configuration objects.
//!
//! ## Architectural Role
//!
//! As the base crate, `loom-types` has minimal dependencies and is itself a
//! dependency for almost every other crate in the workspace. This structure
//! prevents circular dependencies and provides a stable, canonical definition
//! for shared types like `Fiber`, `DataUpdate`, `Signed`, and the various
//! error enums.

/// The maximum accepted size in bytes for a webhook payload body.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 256 * 1024; // 256 KiB
/// The maximum `limit` accepted by paged query endpoints.
pub const MAX_QUERY_LIMIT: usize = 500;

/// A top-level, crate-wide `Result` type alias with a default error type.
pub type Result<T, E = crate::error::BridgeError> = std::result::Result<T, E>;

/// In-memory orchestrator models: agents, contracts, and markets.
pub mod agent;
/// Shared configuration structures for the orchestrator and endpoints.
pub mod config;
/// Signed envelopes and signature proofs attached to submitted messages.
pub mod envelope;
/// A unified set of all error types used across the workspace.
pub mod error;
/// The on-chain fiber model and the data-layer message shapes.
pub mod fiber;
/// Snapshot records, rejection records, and webhook event shapes.
pub mod snapshot;
/// Millisecond-epoch clock helpers.
pub mod time;
/// The persisted wallet-pool file format.
pub mod wallet;
