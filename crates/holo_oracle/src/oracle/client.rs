//! Collaborator interfaces consumed by the oracle.
//!
//! The oracle is cluster agnostic; concrete implementations can speak a real
//! wire protocol, route through a proxy, or simulate a cluster in memory (see
//! `crate::sim`). An `Err` from any of these methods means the harness could
//! not reach the cluster at all. Server-side failures are reported inside a
//! `CommandResult` instead.

use async_trait::async_trait;

use super::types::{
    ChangeLogEntry, ClusterTime, CommandRequest, CommandResult, FaultKind, FaultRole,
    IdempotencyKey, Namespace, NodeAddr, SessionId,
};

/// Options for `commitTransaction`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitOptions {
    /// Required when committing a prepared transaction.
    pub commit_timestamp: Option<ClusterTime>,
}

/// Reply to `prepareTransaction`.
#[derive(Clone, Debug, PartialEq)]
pub struct PrepareReply {
    pub result: CommandResult,
    pub prepare_clock: Option<ClusterTime>,
}

/// Routed client for the cluster under test.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Issue `request` against `ns`.
    ///
    /// With `key == None` the command is a plain, non-retryable operation.
    /// A key whose session has an open transaction with the same sequence
    /// number runs the command inside that transaction.
    async fn run_command(
        &self,
        ns: &Namespace,
        request: &CommandRequest,
        key: Option<&IdempotencyKey>,
    ) -> anyhow::Result<CommandResult>;

    async fn begin_transaction(&self, key: &IdempotencyKey) -> anyhow::Result<()>;

    async fn commit_transaction(
        &self,
        key: &IdempotencyKey,
        opts: CommitOptions,
    ) -> anyhow::Result<CommandResult>;

    async fn abort_transaction(&self, key: &IdempotencyKey) -> anyhow::Result<CommandResult>;

    async fn prepare_transaction(&self, key: &IdempotencyKey) -> anyhow::Result<PrepareReply>;

    /// Release server-side resources held for `session`.
    async fn end_session(&self, session: SessionId) -> anyhow::Result<()>;

    async fn collection_exists(&self, ns: &Namespace) -> anyhow::Result<bool>;

    async fn collection_is_append_only(&self, ns: &Namespace) -> anyhow::Result<bool>;

    /// Every data-bearing node, for direct (unrouted) connections.
    async fn nodes(&self) -> anyhow::Result<Vec<NodeAddr>>;

    async fn connect_direct(&self, node: &NodeAddr) -> anyhow::Result<Box<dyn NodeSession>>;

    async fn trigger_fault(
        &self,
        role: FaultRole,
        shard_index: usize,
        kind: FaultKind,
    ) -> anyhow::Result<()>;

    /// Route subsequent requests through `node` (used after a failover).
    async fn switch_primary(&self, node: &NodeAddr) -> anyhow::Result<()>;
}

/// Direct session against a single node.
#[async_trait]
pub trait NodeSession: Send + Sync {
    fn node(&self) -> &NodeAddr;

    async fn current_clock(&self) -> anyhow::Result<ClusterTime>;

    /// Gossip `clock` to the node so its clock is at least that value.
    async fn advance_clock(&self, clock: ClusterTime) -> anyhow::Result<()>;

    /// Durable change-log entries with `ts >= since`, in log order.
    async fn change_log_since(&self, since: ClusterTime) -> anyhow::Result<Vec<ChangeLogEntry>>;
}

/// Background data relocation running beside the migration phase.
#[async_trait]
pub trait Relocation: Send + Sync + 'static {
    /// Kick off relocation; returns without waiting for it to progress.
    async fn start(&self) -> anyhow::Result<()>;

    /// Block until relocation has captured its consistent snapshot and
    /// return the boundary clock.
    async fn await_boundary_clock(&self) -> anyhow::Result<ClusterTime>;
}
