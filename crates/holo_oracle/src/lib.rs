//! Exactly-once and transaction lifecycle oracle.
//!
//! `oracle` drives a scripted workload against a cluster that relocates data
//! ownership in the background, tracks every multi-statement transaction to a
//! terminal state, and verifies that retryable writes take effect exactly
//! once. The cluster is reached only through the traits in
//! `oracle::ClusterClient`; `sim` provides an in-memory sharded cluster that
//! implements them.

pub mod oracle;
pub mod sim;
