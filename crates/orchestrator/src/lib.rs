#![forbid(unsafe_code)]

//! # Loom Orchestrator
//!
//! The traffic generator: maintains an evolving population of agents,
//! selects fitness-weighted actors each generation, drives their fibers
//! through valid transitions via temperature-annealed softmax selection,
//! and walks the in-memory contract/market tables toward terminal states.
//!
//! Three operating modes share the core: `standard` (full evolutionary
//! loop), `weighted` (fixed fiber-type distribution, no evolution), and
//! `high-throughput` (bounded-concurrency submissions paced to a TPS
//! budget).

pub mod context;
pub mod drivers;
pub mod population;
pub mod proposals;
pub mod rejections;
pub mod sampling;
pub mod scheduler;
pub mod throughput;
pub mod wallet_pool;

pub use population::{compute_fitness, Population};
pub use scheduler::{Orchestrator, TickSummary};
pub use wallet_pool::{PoolError, WalletPool};
