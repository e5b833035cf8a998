//! Exactly-once checks for retryable writes.
//!
//! Every retryable command is executed twice under one idempotency key and
//! the two replies are compared immediately. Commands that wrote every
//! statement are recorded; after the run, `verify_exactly_once` replays each
//! record a third time and checks that no node logged a new durable write and
//! that the reply still matches, classifying records against the boundary
//! clock captured by the relocation process.

use std::sync::Arc;

use futures_util::future::try_join_all;
use serde::Serialize;

use super::client::{ClusterClient, NodeSession, Relocation};
use super::error::{OracleError, Result, RetryStage};
use super::log::RunLog;
use super::session::SessionAllocator;
use super::types::{
    ChangeLogEntry, ClusterTime, CommandKind, CommandRequest, CommandResult, ErrorClass,
    IdempotencyKey, Namespace,
};

/// A retryable command whose first two executions wrote every statement.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryRecord {
    pub key: IdempotencyKey,
    pub ns: Namespace,
    pub command: CommandRequest,
    pub first: CommandResult,
    pub command_index: usize,
    /// Last clock the session observed when the record was created.
    pub session_clock: ClusterTime,
}

/// Whether `result` reports a write for every statement of `command`.
pub fn wrote_every_statement(command: &CommandRequest, result: &CommandResult) -> bool {
    if result.has_failure() {
        return false;
    }
    match command {
        CommandRequest::Insert { documents } => result.n == documents.len() as u64,
        CommandRequest::Update { updates } => result.n_modified == Some(updates.len() as u64),
        CommandRequest::Delete { deletes } => result.n == deletes.len() as u64,
        CommandRequest::FindAndModify { .. } => result.value.is_some(),
        CommandRequest::Find { .. } | CommandRequest::Create { .. } => false,
    }
}

/// Equivalence of a repeated execution against the first one.
///
/// Update and delete may fan out to several owners whose partial tallies
/// differ between executions, so their counts only need to be non-decreasing.
/// Inserts must report the same inserted ids. Find-and-modify must match
/// exactly.
pub fn results_equivalent(kind: CommandKind, first: &CommandResult, other: &CommandResult) -> bool {
    if other.has_failure() {
        return false;
    }
    match kind {
        CommandKind::Update | CommandKind::Delete => {
            other.n >= first.n && other.n_modified.unwrap_or(0) >= first.n_modified.unwrap_or(0)
        }
        CommandKind::Insert => {
            other.n >= first.n && other.n_modified == first.n_modified && other.value == first.value
        }
        CommandKind::FindAndModify | CommandKind::Find | CommandKind::Create => {
            other.n == first.n && other.n_modified == first.n_modified && other.value == first.value
        }
    }
}

/// Outcome of the post-run verification pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub boundary: ClusterTime,
    pub records: usize,
    pub pre_boundary_matched: usize,
    pub pre_boundary_incomplete_history: usize,
    pub post_boundary_matched: usize,
    pub post_boundary_skipped: usize,
    /// The earliest post-boundary record, exempt from comparison.
    pub post_boundary_exempt: Option<IdempotencyKey>,
}

/// Executes retryable writes and keeps the records verified after the run.
pub struct RetryOracle {
    client: Arc<dyn ClusterClient>,
    sessions: SessionAllocator,
    log: RunLog,
    records: Vec<RetryRecord>,
}

impl RetryOracle {
    pub fn new(client: Arc<dyn ClusterClient>, sessions: SessionAllocator, log: RunLog) -> Self {
        Self {
            client,
            sessions,
            log,
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[RetryRecord] {
        &self.records
    }

    /// Run `command` as a retryable write and return the first reply.
    pub async fn execute(
        &mut self,
        ns: &Namespace,
        command: &CommandRequest,
        command_index: usize,
    ) -> Result<CommandResult> {
        if !command.is_retryable_write() {
            return Err(OracleError::Config(format!(
                "{} at command {command_index} is not a retryable write",
                command.kind()
            )));
        }
        let key = self.sessions.next_key();
        let outcome = self.execute_with_key(key, ns, command, command_index).await;
        let released = self.client.end_session(key.session).await;
        let result = outcome?;
        released?;
        Ok(result)
    }

    async fn execute_with_key(
        &mut self,
        key: IdempotencyKey,
        ns: &Namespace,
        command: &CommandRequest,
        command_index: usize,
    ) -> Result<CommandResult> {
        let first = self.client.run_command(ns, command, Some(&key)).await?;
        if !wrote_every_statement(command, &first) {
            tracing::debug!(
                run = %self.log,
                command_index,
                ns = %ns,
                key = %key,
                n = first.n,
                n_modified = ?first.n_modified,
                "first execution did not write every statement; not retrying"
            );
            return Ok(first);
        }

        let second = self.client.run_command(ns, command, Some(&key)).await?;
        let kind = command.kind();
        if matches!(kind, CommandKind::Update | CommandKind::FindAndModify)
            && second.is_classified(&ErrorClass::WouldChangeOwningShard)
        {
            tracing::debug!(
                run = %self.log,
                command_index,
                ns = %ns,
                key = %key,
                "retry was upgraded to a transaction; excluded from comparison"
            );
            return Ok(first);
        }

        if !results_equivalent(kind, &first, &second) {
            return Err(OracleError::RetryMismatch {
                stage: RetryStage::Second,
                command_kind: kind,
                ns: ns.clone(),
                key,
                command_index,
                command: Box::new(command.clone()),
                first: Box::new(first),
                other: Box::new(second),
                boundary: None,
            });
        }

        self.records.push(RetryRecord {
            key,
            ns: ns.clone(),
            command: command.clone(),
            first: first.clone(),
            command_index,
            session_clock: first.observed_clock.max(second.observed_clock),
        });
        Ok(first)
    }

    /// Wait for the relocation boundary and verify every record against it.
    pub async fn verify_exactly_once(
        &self,
        relocation: &dyn Relocation,
        relax_find_and_modify: bool,
    ) -> Result<VerifyReport> {
        let boundary = relocation.await_boundary_clock().await?;
        self.verify_against_boundary(boundary, relax_find_and_modify)
            .await
    }

    pub async fn verify_against_boundary(
        &self,
        boundary: ClusterTime,
        relax_find_and_modify: bool,
    ) -> Result<VerifyReport> {
        let nodes = self.client.nodes().await?;
        let sessions = try_join_all(nodes.iter().map(|node| self.client.connect_direct(node))).await?;
        let clocks = try_join_all(sessions.iter().map(|s| s.current_clock())).await?;
        let max_clock = clocks.iter().copied().max().unwrap_or_default();
        try_join_all(sessions.iter().map(|s| s.advance_clock(max_clock))).await?;
        // Anything logged after a node's recorded clock is a new side effect.
        let lower_bounds = clocks.iter().map(|c| c.next()).collect::<Vec<_>>();
        tracing::info!(
            run = %self.log,
            boundary = %boundary,
            nodes = sessions.len(),
            max_clock = %max_clock,
            records = self.records.len(),
            "verifying retryable writes"
        );

        let mut report = VerifyReport {
            boundary,
            records: self.records.len(),
            ..VerifyReport::default()
        };
        for record in &self.records {
            let replay = self
                .client
                .run_command(&record.ns, &record.command, Some(&record.key))
                .await?;

            let ghosts = scan_user_writes(&sessions, &lower_bounds).await?;
            if !ghosts.is_empty() {
                return Err(OracleError::GhostWrites {
                    ns: record.ns.clone(),
                    key: record.key,
                    command_index: record.command_index,
                    boundary,
                    entries: ghosts,
                });
            }

            let kind = record.command.kind();
            if record.session_clock < boundary {
                if replay.is_classified(&ErrorClass::IncompleteTransactionHistory) {
                    report.pre_boundary_incomplete_history += 1;
                    continue;
                }
                self.check_replay(record, replay, boundary)?;
                report.pre_boundary_matched += 1;
                continue;
            }

            // Statements of one command can straddle the boundary even when the
            // command as a whole observed a later clock. Clocks are monotonic,
            // so only the earliest post-boundary record can be affected.
            if report.post_boundary_exempt.is_none() {
                tracing::debug!(
                    run = %self.log,
                    key = %record.key,
                    command_index = record.command_index,
                    "exempting earliest post-boundary record"
                );
                report.post_boundary_exempt = Some(record.key);
                continue;
            }
            if relax_find_and_modify && kind == CommandKind::FindAndModify {
                report.post_boundary_skipped += 1;
                continue;
            }
            self.check_replay(record, replay, boundary)?;
            report.post_boundary_matched += 1;
        }

        tracing::info!(
            run = %self.log,
            pre_matched = report.pre_boundary_matched,
            pre_incomplete = report.pre_boundary_incomplete_history,
            post_matched = report.post_boundary_matched,
            post_skipped = report.post_boundary_skipped,
            "exactly-once verification passed"
        );
        Ok(report)
    }

    fn check_replay(
        &self,
        record: &RetryRecord,
        replay: CommandResult,
        boundary: ClusterTime,
    ) -> Result<()> {
        let kind = record.command.kind();
        if results_equivalent(kind, &record.first, &replay) {
            return Ok(());
        }
        Err(OracleError::RetryMismatch {
            stage: RetryStage::Replay,
            command_kind: kind,
            ns: record.ns.clone(),
            key: record.key,
            command_index: record.command_index,
            command: Box::new(record.command.clone()),
            first: Box::new(record.first.clone()),
            other: Box::new(replay),
            boundary: Some(boundary),
        })
    }
}

/// Query every node concurrently for user writes at or after its lower bound.
async fn scan_user_writes(
    sessions: &[Box<dyn NodeSession>],
    lower_bounds: &[ClusterTime],
) -> Result<Vec<ChangeLogEntry>> {
    let scans = try_join_all(
        sessions
            .iter()
            .zip(lower_bounds)
            .map(|(session, since)| session.change_log_since(*since)),
    )
    .await?;
    Ok(scans
        .into_iter()
        .flatten()
        .filter(ChangeLogEntry::is_user_write)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::{Call, FakeNode, ScriptedClient};
    use crate::oracle::types::{ChangeOp, DeleteStatement, UpdateStatement};
    use serde_json::json;

    fn oracle(client: Arc<ScriptedClient>) -> RetryOracle {
        RetryOracle::new(client, SessionAllocator::new(), RunLog::new("test"))
    }

    fn insert3() -> CommandRequest {
        CommandRequest::Insert {
            documents: vec![json!({"_id": 1}), json!({"_id": 2}), json!({"_id": 3})],
        }
    }

    fn inserted(ids: serde_json::Value, n: u64, clock: u64) -> CommandResult {
        CommandResult::ok(n, ClusterTime(clock)).with_value(Some(ids))
    }

    fn fam() -> CommandRequest {
        CommandRequest::FindAndModify {
            query: json!({"_id": 1}),
            update: Some(json!({"$inc": {"x": 1}})),
            remove: false,
            upsert: false,
            return_new: true,
        }
    }

    fn update1() -> CommandRequest {
        CommandRequest::Update {
            updates: vec![UpdateStatement {
                q: json!({"_id": 1}),
                u: json!({"$set": {"x": 1}}),
                upsert: false,
                multi: false,
            }],
        }
    }

    fn ns() -> Namespace {
        Namespace::new("db", "c")
    }

    #[tokio::test]
    async fn fan_out_insert_tally_is_accepted() {
        let client = Arc::new(ScriptedClient::new());
        client.push_run(inserted(json!([1, 2, 3]), 3, 1));
        client.push_run(inserted(json!([1, 2, 3]), 5, 2));
        let mut retry = oracle(client);
        let first = retry.execute(&ns(), &insert3(), 0).await.expect("execute");
        assert_eq!(first.n, 3);
        assert_eq!(retry.records().len(), 1);
        assert_eq!(retry.records()[0].session_clock, ClusterTime(2));
    }

    #[tokio::test]
    async fn insert_with_different_ids_is_rejected() {
        let client = Arc::new(ScriptedClient::new());
        client.push_run(inserted(json!([1, 2, 3]), 3, 1));
        client.push_run(inserted(json!([1, 2, 4]), 3, 2));
        let mut retry = oracle(client);
        let err = retry.execute(&ns(), &insert3(), 5).await.expect_err("mismatch");
        match err {
            OracleError::RetryMismatch {
                stage,
                command_index,
                ..
            } => {
                assert_eq!(stage, RetryStage::Second);
                assert_eq!(command_index, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(retry.records().is_empty());
    }

    #[tokio::test]
    async fn partial_first_execution_is_not_retried() {
        let client = Arc::new(ScriptedClient::new());
        client.push_run(inserted(json!([1, 2]), 2, 1));
        let mut retry = oracle(client.clone());
        retry.execute(&ns(), &insert3(), 0).await.expect("execute");
        assert!(retry.records().is_empty());
        let runs = client
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Run { .. }))
            .count();
        assert_eq!(runs, 1);
        // The session is released even though nothing was recorded.
        assert!(matches!(client.calls().last(), Some(Call::EndSession(_))));
    }

    #[tokio::test]
    async fn update_counts_may_grow_but_not_shrink() {
        let client = Arc::new(ScriptedClient::new());
        client.push_run(CommandResult::ok(1, ClusterTime(1)).with_n_modified(1));
        client.push_run(CommandResult::ok(2, ClusterTime(2)).with_n_modified(2));
        client.push_run(CommandResult::ok(1, ClusterTime(3)).with_n_modified(1));
        client.push_run(CommandResult::ok(1, ClusterTime(4)).with_n_modified(0));
        let mut retry = oracle(client);
        retry.execute(&ns(), &update1(), 0).await.expect("grow is fine");
        let err = retry.execute(&ns(), &update1(), 1).await.expect_err("shrink");
        assert!(matches!(err, OracleError::RetryMismatch { .. }));
    }

    #[tokio::test]
    async fn delete_tally_uses_n() {
        let client = Arc::new(ScriptedClient::new());
        let command = CommandRequest::Delete {
            deletes: vec![DeleteStatement {
                q: json!({"_id": 1}),
                limit: 1,
            }],
        };
        client.push_run(CommandResult::ok(1, ClusterTime(1)));
        client.push_run(CommandResult::ok(1, ClusterTime(2)));
        let mut retry = oracle(client);
        retry.execute(&ns(), &command, 0).await.expect("execute");
        assert_eq!(retry.records().len(), 1);
    }

    #[tokio::test]
    async fn upgraded_retry_is_excluded() {
        let client = Arc::new(ScriptedClient::new());
        client.push_run(
            CommandResult::ok(1, ClusterTime(1)).with_value(Some(json!({"_id": 1, "x": 2}))),
        );
        client.push_run(CommandResult::failed(
            ErrorClass::WouldChangeOwningShard,
            ClusterTime(2),
        ));
        let mut retry = oracle(client);
        let first = retry.execute(&ns(), &fam(), 0).await.expect("execute");
        assert!(first.value.is_some());
        assert!(retry.records().is_empty());
    }

    #[tokio::test]
    async fn non_write_commands_are_misuse() {
        let client = Arc::new(ScriptedClient::new());
        let mut retry = oracle(client);
        let err = retry
            .execute(&ns(), &CommandRequest::Find { filter: json!({}) }, 3)
            .await
            .expect_err("misuse");
        assert!(matches!(err, OracleError::Config(_)));
    }

    /// Build one record per `(first, second)` clock pair, all inserts of ids `[i]`.
    async fn recorded(client: &Arc<ScriptedClient>, clocks: &[u64]) -> RetryOracle {
        let mut retry = oracle(client.clone());
        for (i, clock) in clocks.iter().enumerate() {
            let command = CommandRequest::Insert {
                documents: vec![json!({"_id": i})],
            };
            client.push_run(inserted(json!([i]), 1, *clock));
            client.push_run(inserted(json!([i]), 1, *clock));
            retry.execute(&ns(), &command, i).await.expect("execute");
        }
        retry
    }

    #[tokio::test]
    async fn pre_boundary_replay_may_lack_history() {
        let client = Arc::new(ScriptedClient::with_nodes(vec![FakeNode::new("n1", 10)]));
        let retry = recorded(&client, &[3, 4]).await;
        client.push_run(CommandResult::failed(
            ErrorClass::IncompleteTransactionHistory,
            ClusterTime(11),
        ));
        client.push_run(inserted(json!([1]), 1, 12));
        let report = retry
            .verify_against_boundary(ClusterTime(5), false)
            .await
            .expect("verify");
        assert_eq!(report.pre_boundary_incomplete_history, 1);
        assert_eq!(report.pre_boundary_matched, 1);
        assert!(report.post_boundary_exempt.is_none());
    }

    #[tokio::test]
    async fn pre_boundary_replay_with_a_different_result_fails() {
        let client = Arc::new(ScriptedClient::with_nodes(vec![FakeNode::new("n1", 10)]));
        let retry = recorded(&client, &[3]).await;
        client.push_run(inserted(json!([9]), 1, 11));
        let err = retry
            .verify_against_boundary(ClusterTime(5), false)
            .await
            .expect_err("replay differs from the first result");
        match err {
            OracleError::RetryMismatch {
                stage,
                command_index,
                boundary,
                ..
            } => {
                assert_eq!(stage, RetryStage::Replay);
                assert_eq!(command_index, 0);
                assert_eq!(boundary, Some(ClusterTime(5)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn only_the_earliest_post_boundary_record_is_exempt() {
        let client = Arc::new(ScriptedClient::with_nodes(vec![FakeNode::new("n1", 10)]));
        let retry = recorded(&client, &[6, 7, 8]).await;
        // Record 0 replays with a wrong result but is exempt.
        client.push_run(inserted(json!([99]), 1, 11));
        client.push_run(inserted(json!([1]), 1, 12));
        client.push_run(inserted(json!([77]), 1, 13));
        let err = retry
            .verify_against_boundary(ClusterTime(5), false)
            .await
            .expect_err("third record mismatches");
        match err {
            OracleError::RetryMismatch {
                stage,
                command_index,
                boundary,
                ..
            } => {
                assert_eq!(stage, RetryStage::Replay);
                assert_eq!(command_index, 2);
                assert_eq!(boundary, Some(ClusterTime(5)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn relaxed_mode_skips_post_boundary_find_and_modify() {
        let client = Arc::new(ScriptedClient::with_nodes(vec![FakeNode::new("n1", 10)]));
        let mut retry = oracle(client.clone());
        for i in 0..2 {
            let value = Some(json!({"_id": 1, "x": i}));
            client.push_run(CommandResult::ok(1, ClusterTime(8)).with_value(value.clone()));
            client.push_run(CommandResult::ok(1, ClusterTime(8)).with_value(value));
            retry.execute(&ns(), &fam(), i).await.expect("execute");
        }
        client.push_run(CommandResult::ok(1, ClusterTime(11)).with_value(None));
        client.push_run(CommandResult::ok(1, ClusterTime(12)).with_value(None));
        let report = retry
            .verify_against_boundary(ClusterTime(5), true)
            .await
            .expect("relaxed");
        assert_eq!(report.post_boundary_skipped, 1);
        assert!(report.post_boundary_exempt.is_some());
    }

    #[tokio::test]
    async fn replay_that_logs_a_user_write_is_a_ghost() {
        let node = FakeNode::new("n1", 10);
        // Bookkeeping entries after the lower bound are ignored.
        node.push_entry(ChangeLogEntry {
            ts: ClusterTime(20),
            ns: Namespace::new("config", "transactions"),
            op: ChangeOp::Update,
            document_id: None,
        });
        node.push_entry(ChangeLogEntry {
            ts: ClusterTime(21),
            ns: ns(),
            op: ChangeOp::Noop,
            document_id: None,
        });
        // Entries at or before the recorded clock predate verification.
        node.push_entry(ChangeLogEntry {
            ts: ClusterTime(10),
            ns: ns(),
            op: ChangeOp::Insert,
            document_id: Some("0".to_string()),
        });
        let client = Arc::new(ScriptedClient::with_nodes(vec![node.clone()]));
        let retry = recorded(&client, &[3]).await;
        client.push_run(inserted(json!([0]), 1, 11));
        retry
            .verify_against_boundary(ClusterTime(5), false)
            .await
            .expect("no user writes after the bound");

        node.push_entry(ChangeLogEntry {
            ts: ClusterTime(22),
            ns: ns(),
            op: ChangeOp::Insert,
            document_id: Some("0".to_string()),
        });
        client.push_run(inserted(json!([0]), 1, 12));
        let err = retry
            .verify_against_boundary(ClusterTime(5), false)
            .await
            .expect_err("ghost write");
        match err {
            OracleError::GhostWrites { entries, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].ts, ClusterTime(22));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn find_and_modify_needs_a_matched_document() {
        let none = CommandResult::ok(0, ClusterTime(1));
        assert!(!wrote_every_statement(&fam(), &none));
        let some = none.clone().with_value(Some(json!({"_id": 1})));
        assert!(wrote_every_statement(&fam(), &some));
    }
}
