//! Sequential step execution across the seed and migration phases.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::client::{ClusterClient, Relocation};
use super::config::OracleConfig;
use super::error::{OracleError, Result};
use super::log::RunLog;
use super::retry::{RetryOracle, VerifyReport};
use super::session::SessionAllocator;
use super::stats::{EventOutcome, Phase, RunStats, StatsSink, StepEvent};
use super::txn::{TransactionStateMachine, TxnOutcome, TxnStatement, TxnTransition};
use super::types::{
    CommandKind, CommandRequest, DeleteStatement, Document, FaultKind, FaultRole, Namespace,
    NodeAddr, UpdateStatement,
};

/// One scripted step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Direct commands without a session.
    Plain { commands: Vec<TxnStatement> },
    /// Begin and immediately commit.
    Transaction { operations: Vec<TxnStatement> },
    /// Begin and leave the transaction active for later steps.
    BeginTransaction { operations: Vec<TxnStatement> },
    PrepareTransaction,
    CommitTransaction,
    AbortTransaction,
    RetryableInsert {
        ns: Namespace,
        documents: Vec<Document>,
    },
    RetryableUpdate {
        ns: Namespace,
        updates: Vec<UpdateStatement>,
    },
    RetryableDelete {
        ns: Namespace,
        deletes: Vec<DeleteStatement>,
    },
    /// Independent retryable find-and-modify commands.
    RetryableFindAndModify { commands: Vec<TxnStatement> },
    Fault {
        role: FaultRole,
        shard_index: usize,
        kind: FaultKind,
    },
    MajorityCheckpoint,
    Failover { new_primary: NodeAddr },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Plain { .. } => "plain",
            Step::Transaction { .. } => "transaction",
            Step::BeginTransaction { .. } => "begin_transaction",
            Step::PrepareTransaction => "prepare_transaction",
            Step::CommitTransaction => "commit_transaction",
            Step::AbortTransaction => "abort_transaction",
            Step::RetryableInsert { .. } => "retryable_insert",
            Step::RetryableUpdate { .. } => "retryable_update",
            Step::RetryableDelete { .. } => "retryable_delete",
            Step::RetryableFindAndModify { .. } => "retryable_find_and_modify",
            Step::Fault { .. } => "fault",
            Step::MajorityCheckpoint => "majority_checkpoint",
            Step::Failover { .. } => "failover",
        }
    }
}

/// A step list plus the index of the first migration-phase step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub phase_boundary: usize,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_json(raw: &str) -> Result<Self> {
        let script: Script = serde_json::from_str(raw)
            .map_err(|err| OracleError::Config(format!("invalid step script: {err}")))?;
        script.validate()?;
        Ok(script)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            OracleError::Config(format!("failed to read script {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        validate_boundary(self.steps.len(), self.phase_boundary)?;
        for (index, step) in self.steps.iter().enumerate() {
            if let Step::RetryableFindAndModify { commands } = step {
                if let Some(stmt) = commands
                    .iter()
                    .find(|stmt| stmt.command.kind() != CommandKind::FindAndModify)
                {
                    return Err(OracleError::Config(format!(
                        "step {index}: retryable_find_and_modify carries a {} command",
                        stmt.command.kind()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_boundary(len: usize, phase_boundary: usize) -> Result<()> {
    if phase_boundary > len {
        return Err(OracleError::Config(format!(
            "phase boundary {phase_boundary} is past the end of a {len}-step script"
        )));
    }
    Ok(())
}

/// Replays a script through the transaction state machine, the retry oracle
/// and the cluster client, one step at a time.
pub struct StepDriver {
    client: Arc<dyn ClusterClient>,
    relocation: Arc<dyn Relocation>,
    txns: TransactionStateMachine,
    retry: RetryOracle,
    relax_find_and_modify: bool,
    log: RunLog,
}

impl StepDriver {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        relocation: Arc<dyn Relocation>,
        config: OracleConfig,
        log: RunLog,
    ) -> Self {
        let sessions = SessionAllocator::new();
        let relax_find_and_modify = config.relax_find_and_modify;
        let txns = TransactionStateMachine::new(
            client.clone(),
            sessions.clone(),
            config,
            log.child("txn"),
        );
        let retry = RetryOracle::new(client.clone(), sessions, log.child("retry"));
        Self {
            client,
            relocation,
            txns,
            retry,
            relax_find_and_modify,
            log,
        }
    }

    pub fn transactions(&self) -> &TransactionStateMachine {
        &self.txns
    }

    pub fn retry_oracle(&self) -> &RetryOracle {
        &self.retry
    }

    pub async fn run_script(&mut self, steps: &[Step], phase_boundary: usize) -> Result<RunStats> {
        let mut stats = RunStats::default();
        self.run_script_with(steps, phase_boundary, &mut stats).await?;
        Ok(stats)
    }

    /// Run the seed steps, drain, start relocation, then run the migration
    /// steps and drain again.
    pub async fn run_script_with(
        &mut self,
        steps: &[Step],
        phase_boundary: usize,
        sink: &mut dyn StatsSink,
    ) -> Result<()> {
        validate_boundary(steps.len(), phase_boundary)?;
        let (seed, migration) = steps.split_at(phase_boundary);
        tracing::info!(
            run = %self.log,
            seed_steps = seed.len(),
            migration_steps = migration.len(),
            "running script"
        );

        for (command_index, step) in seed.iter().enumerate() {
            let event = self.run_step(step, command_index).await?;
            sink.record_seed(&event);
        }
        let drained = self.txns.drain_all(phase_boundary).await?;
        sink.record_drain(Phase::Seed, &drained);

        self.relocation.start().await?;
        tracing::info!(run = %self.log, command_index = phase_boundary, "relocation started");

        for (offset, step) in migration.iter().enumerate() {
            let event = self.run_step(step, phase_boundary + offset).await?;
            sink.record_migration_event(&event);
        }
        let drained = self.txns.drain_all(steps.len()).await?;
        sink.record_drain(Phase::Migration, &drained);
        Ok(())
    }

    /// Verify every recorded retry. Find-and-modify replays after the boundary
    /// are skipped when either `relax_find_and_modify` or the configured flag
    /// is set.
    pub async fn verify_exactly_once(&self, relax_find_and_modify: bool) -> Result<VerifyReport> {
        let relax = relax_find_and_modify || self.relax_find_and_modify;
        self.retry
            .verify_exactly_once(self.relocation.as_ref(), relax)
            .await
    }

    async fn run_step(&mut self, step: &Step, command_index: usize) -> Result<StepEvent> {
        let outcome = match step {
            Step::Plain { commands } => {
                let mut outcome = EventOutcome::Ok;
                for stmt in commands {
                    let result = self.client.run_command(&stmt.ns, &stmt.command, None).await?;
                    if result.has_failure() {
                        tracing::debug!(
                            run = %self.log,
                            command_index,
                            ns = %stmt.ns,
                            error = ?result.error,
                            write_errors = ?result.write_errors,
                            "plain command failed"
                        );
                        outcome = EventOutcome::Failed;
                    }
                }
                outcome
            }
            Step::Transaction { operations } => {
                match self.txns.begin(operations.clone(), command_index).await? {
                    Some(record) => transition_outcome(
                        self.txns.commit_key(&record.id, command_index).await?,
                    ),
                    None => begin_failure(operations),
                }
            }
            Step::BeginTransaction { operations } => {
                match self.txns.begin(operations.clone(), command_index).await? {
                    Some(_) => EventOutcome::Started,
                    None => begin_failure(operations),
                }
            }
            Step::PrepareTransaction => transition_outcome(self.txns.prepare(command_index).await?),
            Step::CommitTransaction => transition_outcome(self.txns.commit(command_index).await?),
            Step::AbortTransaction => transition_outcome(self.txns.abort(command_index).await?),
            Step::RetryableInsert { ns, documents } => {
                let command = CommandRequest::Insert {
                    documents: documents.clone(),
                };
                self.retryable(ns, &command, command_index).await?
            }
            Step::RetryableUpdate { ns, updates } => {
                let command = CommandRequest::Update {
                    updates: updates.clone(),
                };
                self.retryable(ns, &command, command_index).await?
            }
            Step::RetryableDelete { ns, deletes } => {
                let command = CommandRequest::Delete {
                    deletes: deletes.clone(),
                };
                self.retryable(ns, &command, command_index).await?
            }
            Step::RetryableFindAndModify { commands } => {
                let mut outcome = EventOutcome::Ok;
                for stmt in commands {
                    if stmt.command.kind() != CommandKind::FindAndModify {
                        return Err(OracleError::Config(format!(
                            "step {command_index}: retryable_find_and_modify carries a {} command",
                            stmt.command.kind()
                        )));
                    }
                    if self.retryable(&stmt.ns, &stmt.command, command_index).await?
                        == EventOutcome::Failed
                    {
                        outcome = EventOutcome::Failed;
                    }
                }
                outcome
            }
            Step::Fault {
                role,
                shard_index,
                kind,
            } => {
                tracing::info!(
                    run = %self.log,
                    command_index,
                    role = %role,
                    shard_index,
                    kind = %kind,
                    "injecting fault"
                );
                self.client.trigger_fault(*role, *shard_index, *kind).await?;
                EventOutcome::Injected
            }
            Step::MajorityCheckpoint => {
                self.txns.snapshot_as_majority_committed();
                EventOutcome::Ok
            }
            Step::Failover { new_primary } => {
                self.txns.restore_from_majority_committed(new_primary).await?;
                EventOutcome::Ok
            }
        };
        Ok(StepEvent {
            command_index,
            step: step.name(),
            outcome,
        })
    }

    async fn retryable(
        &mut self,
        ns: &Namespace,
        command: &CommandRequest,
        command_index: usize,
    ) -> Result<EventOutcome> {
        let result = self.retry.execute(ns, command, command_index).await?;
        Ok(if result.has_failure() {
            EventOutcome::Failed
        } else {
            EventOutcome::Ok
        })
    }
}

fn transition_outcome(transition: Option<TxnTransition>) -> EventOutcome {
    match transition.map(|t| t.outcome) {
        Some(TxnOutcome::Prepared) => EventOutcome::Prepared,
        Some(TxnOutcome::Committed) => EventOutcome::Committed,
        Some(TxnOutcome::Aborted) => EventOutcome::Aborted,
        Some(TxnOutcome::Pending) => EventOutcome::Pending,
        None => EventOutcome::Skipped,
    }
}

fn begin_failure(operations: &[TxnStatement]) -> EventOutcome {
    if operations.is_empty() {
        EventOutcome::Skipped
    } else {
        EventOutcome::Aborted
    }
}
