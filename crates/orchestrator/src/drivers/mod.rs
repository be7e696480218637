//! Lifecycle drivers walking the in-memory contract and market tables.

pub mod contract;
pub mod market;
