//! Lifecycle tracking for multi-statement transactions.
//!
//! `Started -> Prepared -> Committed`, with `Aborted` reachable from both
//! non-terminal states. Records leave the active set once terminal, except in
//! failover replay mode where a record with a majority-committed baseline is
//! retained so a rollback can revive it.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::client::{ClusterClient, CommitOptions};
use super::config::OracleConfig;
use super::error::{OracleError, Result};
use super::log::RunLog;
use super::session::SessionAllocator;
use super::types::{
    ClusterTime, CommandRequest, CommandResult, ErrorClass, IdempotencyKey, Namespace, NodeAddr,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    Started,
    Prepared,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_active(self) -> bool {
        matches!(self, TxnState::Started | TxnState::Prepared)
    }
}

/// Decision recorded once a resolution of a prepared transaction was attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorDecision {
    None,
    Commit,
    Abort,
}

/// One statement of a transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxnStatement {
    pub ns: Namespace,
    #[serde(flatten)]
    pub command: CommandRequest,
}

/// Oracle-side view of one multi-statement transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionRecord {
    pub id: IdempotencyKey,
    pub operations: Vec<TxnStatement>,
    pub state: TxnState,
    pub can_prepare: bool,
    pub prepare_clock: Option<ClusterTime>,
    decision: CoordinatorDecision,
    pub majority_committed: Option<TxnState>,
    /// Script position of the step that began the transaction.
    pub command_index: usize,
}

impl TransactionRecord {
    pub fn decision(&self) -> CoordinatorDecision {
        self.decision
    }

    /// Set the coordinator decision. Once set it can only be re-affirmed.
    pub fn record_decision(&mut self, decision: CoordinatorDecision) -> Result<()> {
        match (self.decision, decision) {
            (_, CoordinatorDecision::None) => Ok(()),
            (CoordinatorDecision::None, _) => {
                self.decision = decision;
                Ok(())
            }
            (current, next) if current == next => Ok(()),
            (current, next) => Err(OracleError::DecisionFlip {
                key: self.id,
                from: current,
                to: next,
            }),
        }
    }

    pub fn eligible_for_prepare(&self) -> bool {
        self.state == TxnState::Started && self.can_prepare
    }

    pub fn eligible_for_commit(&self, failover_replay: bool) -> bool {
        match self.state {
            TxnState::Started => true,
            TxnState::Prepared => {
                self.decision != CoordinatorDecision::Abort
                    && (!failover_replay || self.majority_committed == Some(TxnState::Prepared))
            }
            TxnState::Committed | TxnState::Aborted => false,
        }
    }

    pub fn eligible_for_abort(&self) -> bool {
        match self.state {
            TxnState::Started => true,
            TxnState::Prepared => self.decision != CoordinatorDecision::Commit,
            TxnState::Committed | TxnState::Aborted => false,
        }
    }
}

/// Result of one prepare/commit/abort attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnOutcome {
    Prepared,
    Committed,
    Aborted,
    /// The resolution request failed transiently; the transaction stays
    /// prepared with its decision recorded.
    Pending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnTransition {
    pub key: IdempotencyKey,
    pub outcome: TxnOutcome,
}

/// Tallies from one `drain_all` pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSummary {
    pub prepared: u64,
    pub committed: u64,
    pub aborted: u64,
}

/// Owns every tracked transaction and drives it to a terminal state.
pub struct TransactionStateMachine {
    client: Arc<dyn ClusterClient>,
    sessions: SessionAllocator,
    config: OracleConfig,
    log: RunLog,
    txns: Vec<TransactionRecord>,
}

impl TransactionStateMachine {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        sessions: SessionAllocator,
        config: OracleConfig,
        log: RunLog,
    ) -> Self {
        Self {
            client,
            sessions,
            config,
            log,
            txns: Vec::new(),
        }
    }

    /// Started or prepared transactions, in begin order.
    pub fn active(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.txns.iter().filter(|t| t.state.is_active())
    }

    pub fn active_len(&self) -> usize {
        self.active().count()
    }

    /// Every tracked record, including terminal ones retained for failover replay.
    pub fn records(&self) -> &[TransactionRecord] {
        &self.txns
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<&TransactionRecord> {
        self.txns.iter().find(|t| &t.id == key)
    }

    /// Start a transaction and issue its statements.
    ///
    /// Returns `None` when `operations` is empty or a statement failed; in the
    /// latter case the transaction has been force-aborted.
    pub async fn begin(
        &mut self,
        operations: Vec<TxnStatement>,
        command_index: usize,
    ) -> Result<Option<TransactionRecord>> {
        if operations.is_empty() {
            tracing::info!(run = %self.log, command_index, "skipping transaction with no statements");
            return Ok(None);
        }

        let key = self.sessions.next_key();
        let mut creates_collection = false;
        let mut append_only = false;
        let mut seen = BTreeSet::new();
        for stmt in &operations {
            if matches!(stmt.command, CommandRequest::Create { capped: true }) {
                append_only = true;
            }
            if !seen.insert(stmt.ns.clone()) {
                continue;
            }
            if !self.client.collection_exists(&stmt.ns).await? {
                creates_collection = true;
            } else if self.client.collection_is_append_only(&stmt.ns).await? {
                append_only = true;
            }
        }

        match self.issue_statements(&key, &operations).await {
            Ok(None) => {}
            Ok(Some((index, result))) => {
                tracing::info!(
                    run = %self.log,
                    command_index,
                    key = %key,
                    statement = index,
                    error = ?result.error,
                    write_errors = ?result.write_errors,
                    "transaction statement failed; forcing abort"
                );
                self.forced_abort(key, command_index).await?;
                return Ok(None);
            }
            Err(err) => {
                if let Err(release) = self.client.end_session(key.session).await {
                    tracing::warn!(
                        run = %self.log,
                        command_index,
                        key = %key,
                        error = %release,
                        "failed to end session after statement error"
                    );
                }
                return Err(err);
            }
        }

        let record = TransactionRecord {
            id: key,
            operations,
            state: TxnState::Started,
            can_prepare: !append_only && creates_collection,
            prepare_clock: None,
            decision: CoordinatorDecision::None,
            majority_committed: None,
            command_index,
        };
        tracing::debug!(
            run = %self.log,
            command_index,
            key = %key,
            can_prepare = record.can_prepare,
            statements = record.operations.len(),
            "transaction started"
        );
        self.txns.push(record.clone());
        Ok(Some(record))
    }

    /// Issue every statement; returns the first failing statement, if any.
    async fn issue_statements(
        &self,
        key: &IdempotencyKey,
        operations: &[TxnStatement],
    ) -> Result<Option<(usize, CommandResult)>> {
        self.client.begin_transaction(key).await?;
        for (index, stmt) in operations.iter().enumerate() {
            let result = self
                .client
                .run_command(&stmt.ns, &stmt.command, Some(key))
                .await?;
            if result.has_failure() {
                return Ok(Some((index, result)));
            }
        }
        Ok(None)
    }

    /// Terminate a failed, undecided transaction on every participant.
    ///
    /// The direct abort may race the server's own auto-abort, so
    /// `NoSuchTransaction` is accepted. A superseding transaction with a higher
    /// sequence number then touches every participant through the pre-sharded
    /// scratch collection, so nodes that never saw the abort drop the stale
    /// transaction.
    async fn forced_abort(&self, key: IdempotencyKey, command_index: usize) -> Result<()> {
        let outcome = self.fence_session(key, command_index).await;
        let released = self.client.end_session(key.session).await;
        outcome?;
        released?;
        Ok(())
    }

    async fn fence_session(&self, key: IdempotencyKey, command_index: usize) -> Result<()> {
        let reply = self.client.abort_transaction(&key).await?;
        if !reply.ok && !reply.is_classified(&ErrorClass::NoSuchTransaction) {
            tracing::warn!(
                run = %self.log,
                command_index,
                key = %key,
                error = ?reply.error,
                "direct abort failed; relying on superseding transaction"
            );
        }

        let fence = key.successor();
        self.client.begin_transaction(&fence).await?;
        let scratch = &self.config.scratch_namespace;
        let read = self
            .client
            .run_command(
                scratch,
                &CommandRequest::Find {
                    filter: serde_json::json!({}),
                },
                Some(&fence),
            )
            .await?;
        if read.has_failure() {
            return Err(anyhow::anyhow!(
                "superseding read for {key} on {scratch} failed: {:?}",
                read.error
            )
            .into());
        }
        let commit = self
            .client
            .commit_transaction(&fence, CommitOptions::default())
            .await?;
        if commit.has_failure() {
            return Err(anyhow::anyhow!(
                "superseding commit for {key} failed: {:?}",
                commit.error
            )
            .into());
        }
        tracing::debug!(run = %self.log, command_index, key = %key, fence = %fence, "forced abort complete");
        Ok(())
    }

    /// The `command_index`-th entry of the eligible set, wrapping around.
    fn select(&self, command_index: usize, eligible: impl Fn(&TransactionRecord) -> bool) -> Option<usize> {
        let positions = self
            .txns
            .iter()
            .enumerate()
            .filter(|(_, t)| eligible(t))
            .map(|(pos, _)| pos)
            .collect::<Vec<_>>();
        if positions.is_empty() {
            return None;
        }
        Some(positions[command_index % positions.len()])
    }

    fn position_active(&self, key: &IdempotencyKey) -> Option<usize> {
        self.txns
            .iter()
            .position(|t| &t.id == key && t.state.is_active())
    }

    pub async fn prepare(&mut self, command_index: usize) -> Result<Option<TxnTransition>> {
        let Some(pos) = self.select(command_index, TransactionRecord::eligible_for_prepare) else {
            tracing::debug!(run = %self.log, command_index, "no transaction eligible to prepare");
            return Ok(None);
        };
        self.prepare_at(pos, command_index).await.map(Some)
    }

    async fn prepare_at(&mut self, pos: usize, command_index: usize) -> Result<TxnTransition> {
        let key = self.txns[pos].id;
        let reply = self.client.prepare_transaction(&key).await?;
        match reply.prepare_clock {
            Some(clock) if !reply.result.has_failure() => {
                let record = &mut self.txns[pos];
                record.state = TxnState::Prepared;
                record.prepare_clock = Some(clock);
                tracing::debug!(run = %self.log, command_index, key = %key, prepare_clock = %clock, "transaction prepared");
                Ok(TxnTransition {
                    key,
                    outcome: TxnOutcome::Prepared,
                })
            }
            _ => {
                tracing::info!(
                    run = %self.log,
                    command_index,
                    key = %key,
                    error = ?reply.result.error,
                    "prepare failed; forcing abort"
                );
                self.forced_abort(key, command_index).await?;
                self.finish(pos, TxnState::Aborted, false).await?;
                Ok(TxnTransition {
                    key,
                    outcome: TxnOutcome::Aborted,
                })
            }
        }
    }

    pub async fn commit(&mut self, command_index: usize) -> Result<Option<TxnTransition>> {
        let failover_replay = self.config.failover_replay;
        let Some(pos) = self.select(command_index, |t| t.eligible_for_commit(failover_replay)) else {
            tracing::debug!(run = %self.log, command_index, "no transaction eligible to commit");
            return Ok(None);
        };
        self.commit_at(pos, command_index).await.map(Some)
    }

    /// Commit the transaction identified by `key`, if it is still active.
    pub async fn commit_key(
        &mut self,
        key: &IdempotencyKey,
        command_index: usize,
    ) -> Result<Option<TxnTransition>> {
        match self.position_active(key) {
            Some(pos) => self.commit_at(pos, command_index).await.map(Some),
            None => Ok(None),
        }
    }

    async fn commit_at(&mut self, pos: usize, command_index: usize) -> Result<TxnTransition> {
        let key = self.txns[pos].id;
        let prepared = self.txns[pos].state == TxnState::Prepared;
        let opts = if prepared {
            self.txns[pos].record_decision(CoordinatorDecision::Commit)?;
            CommitOptions {
                commit_timestamp: self.txns[pos].prepare_clock,
            }
        } else {
            CommitOptions::default()
        };

        let reply = self.client.commit_transaction(&key, opts).await?;
        let mut fenced = false;
        let outcome = if !reply.has_failure() {
            TxnOutcome::Committed
        } else if reply.is_classified(&ErrorClass::WriteConflict) {
            TxnOutcome::Aborted
        } else if prepared {
            TxnOutcome::Pending
        } else {
            self.forced_abort(key, command_index).await?;
            fenced = true;
            TxnOutcome::Aborted
        };

        tracing::debug!(
            run = %self.log,
            command_index,
            key = %key,
            prepared,
            outcome = ?outcome,
            error = ?reply.error,
            "commit attempted"
        );
        match outcome {
            TxnOutcome::Committed => self.finish(pos, TxnState::Committed, true).await?,
            TxnOutcome::Aborted => self.finish(pos, TxnState::Aborted, !fenced).await?,
            TxnOutcome::Pending | TxnOutcome::Prepared => {}
        }
        Ok(TxnTransition { key, outcome })
    }

    pub async fn abort(&mut self, command_index: usize) -> Result<Option<TxnTransition>> {
        let Some(pos) = self.select(command_index, TransactionRecord::eligible_for_abort) else {
            tracing::debug!(run = %self.log, command_index, "no transaction eligible to abort");
            return Ok(None);
        };
        self.abort_at(pos, command_index).await.map(Some)
    }

    async fn abort_at(&mut self, pos: usize, command_index: usize) -> Result<TxnTransition> {
        let key = self.txns[pos].id;
        let prepared = self.txns[pos].state == TxnState::Prepared;
        if prepared {
            self.txns[pos].record_decision(CoordinatorDecision::Abort)?;
        }

        let reply = self.client.abort_transaction(&key).await?;
        let acknowledged = reply.ok || reply.is_classified(&ErrorClass::NoSuchTransaction);
        let mut fenced = false;
        let outcome = if acknowledged {
            TxnOutcome::Aborted
        } else if prepared {
            TxnOutcome::Pending
        } else {
            self.forced_abort(key, command_index).await?;
            fenced = true;
            TxnOutcome::Aborted
        };

        tracing::debug!(
            run = %self.log,
            command_index,
            key = %key,
            prepared,
            outcome = ?outcome,
            error = ?reply.error,
            "abort attempted"
        );
        if outcome == TxnOutcome::Aborted {
            self.finish(pos, TxnState::Aborted, !fenced).await?;
        }
        Ok(TxnTransition { key, outcome })
    }

    /// Mark a record terminal and optionally release its session. The record
    /// is dropped unless failover replay needs its majority-committed baseline.
    async fn finish(&mut self, pos: usize, state: TxnState, release_session: bool) -> Result<()> {
        let record = &mut self.txns[pos];
        record.state = state;
        let session = record.id.session;
        let retain = self.config.failover_replay && record.majority_committed.is_some();
        if !retain {
            self.txns.remove(pos);
        }
        if release_session {
            self.client.end_session(session).await?;
        }
        Ok(())
    }

    /// Resolve every active transaction.
    ///
    /// Every `prepare_every`-th preparable transaction is prepared first. Each
    /// transaction is then committed when its decision already favors commit
    /// or it falls on the `commit_every` stride, and aborted otherwise.
    pub async fn drain_all(&mut self, command_index: usize) -> Result<DrainSummary> {
        let policy = self.config.drain;
        let failover_replay = self.config.failover_replay;
        let keys = self.active().map(|t| t.id).collect::<Vec<_>>();
        let mut summary = DrainSummary::default();

        for (index, key) in keys.iter().enumerate() {
            if index % policy.prepare_every.max(1) != 0 {
                continue;
            }
            let Some(pos) = self.position_active(key) else {
                continue;
            };
            if self.txns[pos].eligible_for_prepare() {
                let transition = self.prepare_at(pos, command_index).await?;
                match transition.outcome {
                    TxnOutcome::Prepared => summary.prepared += 1,
                    TxnOutcome::Aborted => summary.aborted += 1,
                    TxnOutcome::Committed | TxnOutcome::Pending => {}
                }
            }
        }

        for (index, key) in keys.iter().enumerate() {
            for _ in 0..policy.max_attempts.max(1) {
                let Some(pos) = self.position_active(key) else {
                    break;
                };
                let record = &self.txns[pos];
                let commit = match record.decision() {
                    CoordinatorDecision::Commit => true,
                    CoordinatorDecision::Abort => false,
                    CoordinatorDecision::None => {
                        record.eligible_for_commit(failover_replay)
                            && index % policy.commit_every.max(1) == 0
                    }
                };
                let transition = if commit {
                    self.commit_at(pos, command_index).await?
                } else {
                    self.abort_at(pos, command_index).await?
                };
                match transition.outcome {
                    TxnOutcome::Committed => summary.committed += 1,
                    TxnOutcome::Aborted => summary.aborted += 1,
                    TxnOutcome::Pending | TxnOutcome::Prepared => {}
                }
            }
        }

        let remaining = self.active().map(|t| t.id).collect::<Vec<_>>();
        if !remaining.is_empty() {
            return Err(OracleError::UndrainedTransactions {
                command_index,
                remaining,
            });
        }
        tracing::info!(
            run = %self.log,
            command_index,
            prepared = summary.prepared,
            committed = summary.committed,
            aborted = summary.aborted,
            "drained transactions"
        );
        Ok(summary)
    }

    /// Record every tracked transaction's state as its majority-committed
    /// baseline and forget those that are already terminal.
    pub fn snapshot_as_majority_committed(&mut self) {
        for record in &mut self.txns {
            record.majority_committed = Some(record.state);
        }
        self.txns.retain(|t| t.state.is_active());
        tracing::info!(run = %self.log, retained = self.txns.len(), "majority-committed checkpoint");
    }

    /// Retarget the client after a failover and roll every record back to its
    /// baseline. Only transactions whose baseline was prepared survive.
    pub async fn restore_from_majority_committed(&mut self, new_primary: &NodeAddr) -> Result<usize> {
        self.client.switch_primary(new_primary).await?;

        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(self.txns.len());
        for mut record in self.txns.drain(..) {
            if let Some(baseline) = record.majority_committed {
                record.state = baseline;
            }
            if record.majority_committed == Some(TxnState::Prepared) {
                kept.push(record);
            } else {
                dropped.push(record.id);
            }
        }
        self.txns = kept;

        for key in &dropped {
            self.client.end_session(key.session).await?;
        }
        tracing::info!(
            run = %self.log,
            new_primary = %new_primary,
            restored = self.txns.len(),
            dropped = dropped.len(),
            "restored transactions after failover"
        );
        Ok(self.txns.len())
    }
}
