use thiserror::Error;

use super::types::{
    ChangeLogEntry, ClusterTime, CommandRequest, CommandResult, IdempotencyKey, Namespace,
};
use super::txn::CoordinatorDecision;

/// Which comparison detected a retry mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStage {
    /// Immediate second execution during the run.
    Second,
    /// Post-run replay during exactly-once verification.
    Replay,
}

impl std::fmt::Display for RetryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStage::Second => f.write_str("second execution"),
            RetryStage::Replay => f.write_str("replay"),
        }
    }
}

/// Failures surfaced by the oracle.
///
/// Oracle violations (`RetryMismatch`, `GhostWrites`, `UndrainedTransactions`,
/// `DecisionFlip`) and caller misuse (`Config`) abort the run. Expected
/// transient failures and classified responses are handled internally and
/// never reach this type.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error(
        "retry mismatch on {stage} of {command_kind} {ns} (command {command_index}, key {key}, boundary {boundary:?}): first={first:?} other={other:?} command={command:?}"
    )]
    RetryMismatch {
        stage: RetryStage,
        command_kind: super::types::CommandKind,
        ns: Namespace,
        key: IdempotencyKey,
        command_index: usize,
        command: Box<CommandRequest>,
        first: Box<CommandResult>,
        other: Box<CommandResult>,
        boundary: Option<ClusterTime>,
    },
    #[error(
        "replay of {ns} (command {command_index}, key {key}, boundary {boundary}) produced {} new change-log entries: {entries:?}",
        .entries.len()
    )]
    GhostWrites {
        ns: Namespace,
        key: IdempotencyKey,
        command_index: usize,
        boundary: ClusterTime,
        entries: Vec<ChangeLogEntry>,
    },
    #[error("transactions left unresolved after drain at command {command_index}: {remaining:?}")]
    UndrainedTransactions {
        command_index: usize,
        remaining: Vec<IdempotencyKey>,
    },
    #[error("coordinator decision for {key} cannot change from {from:?} to {to:?}")]
    DecisionFlip {
        key: IdempotencyKey,
        from: CoordinatorDecision,
        to: CoordinatorDecision,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cluster collaborator failed: {0:#}")]
    Cluster(#[from] anyhow::Error),
}

pub type Result<T, E = OracleError> = std::result::Result<T, E>;
