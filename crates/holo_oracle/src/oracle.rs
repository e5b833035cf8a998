//! Oracle module wiring.
//!
//! `txn` tracks multi-statement transactions, `retry` executes and verifies
//! retryable writes, and `driver` sequences scripted steps across the seed
//! and migration phases. `types` and `client` define the shared vocabulary
//! and the collaborator contracts.

mod client;
mod config;
mod driver;
mod error;
mod log;
mod retry;
mod session;
mod stats;
#[cfg(test)]
mod testing;
mod txn;
mod types;

pub use client::{ClusterClient, CommitOptions, NodeSession, PrepareReply, Relocation};
pub use config::{DrainPolicy, OracleConfig};
pub use driver::{Script, Step, StepDriver};
pub use error::{OracleError, Result, RetryStage};
pub use log::RunLog;
pub use retry::{
    results_equivalent, wrote_every_statement, RetryOracle, RetryRecord, VerifyReport,
};
pub use session::{SessionAllocator, FIRST_SEQUENCE};
pub use stats::{EventOutcome, Phase, PhaseStats, RunStats, StatsSink, StepEvent};
pub use txn::{
    CoordinatorDecision, DrainSummary, TransactionRecord, TransactionStateMachine, TxnOutcome,
    TxnState, TxnStatement, TxnTransition,
};
pub use types::{
    ChangeLogEntry, ChangeOp, ClusterTime, CommandKind, CommandRequest, CommandResult,
    DeleteStatement, Document, ErrorClass, FaultKind, FaultRole, IdempotencyKey, Namespace,
    NodeAddr, SessionId, UpdateStatement, WriteError, CODE_DUPLICATE_KEY,
    CODE_INCOMPLETE_TRANSACTION_HISTORY, CODE_NO_SUCH_TRANSACTION, CODE_WOULD_CHANGE_OWNING_SHARD,
    CODE_WRITE_CONFLICT,
};
