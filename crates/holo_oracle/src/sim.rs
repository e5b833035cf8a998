//! Simulated sharded cluster.
//!
//! `cluster` implements `ClusterClient` and `NodeSession` over an in-memory
//! catalog evaluated by `store`; `relocation` implements the background
//! relocation whose snapshot boundary the oracle verifies against.

mod cluster;
mod relocation;
mod store;

pub use cluster::{FaultRecord, SimCluster, SimOptions, CODE_TRANSACTION_COMMITTED};
pub use relocation::{RelocationOptions, SimRelocation};
