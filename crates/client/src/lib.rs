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

//! # Loom Client
//!
//! HTTP access to the metagraph's data layer (submissions) and snapshot
//! layer (checkpoints, per-fiber state, ordinals), plus cluster health and
//! webhook subscription administration.
//!
//! The [`DataLayerApi`] trait is the seam the bridge and orchestrator depend
//! on; [`HttpDataLayer`] is the production implementation, and tests supply
//! in-process fakes.

pub mod api;
pub mod health;
pub mod http;
pub mod indexer_api;
#[cfg(feature = "testing")]
pub mod testing;

pub use api::DataLayerApi;
pub use health::{ClusterHealth, HealthApi, NodeState, SyncStatus};
pub use http::HttpDataLayer;
pub use indexer_api::{IndexerClient, RejectionFeed};
