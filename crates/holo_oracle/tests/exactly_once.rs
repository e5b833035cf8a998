//! Retryable writes across a relocation, verified end to end against the
//! simulated cluster.

mod common;

use common::{capture_on_first_op, fam_inc, harness, inc, insert, ns};
use holo_oracle::oracle::{
    CommandRequest, DeleteStatement, FaultKind, FaultRole, OracleConfig, OracleError, RetryStage,
    Step, TxnStatement,
};
use holo_oracle::sim::{RelocationOptions, SimOptions};
use serde_json::json;

fn mixed_script() -> (Vec<Step>, usize) {
    let steps = vec![
        Step::Plain {
            commands: vec![TxnStatement {
                ns: ns("db.log"),
                command: CommandRequest::Create { capped: true },
            }],
        },
        Step::RetryableInsert {
            ns: ns("db.a"),
            documents: vec![json!({"_id": 1, "x": 0}), json!({"_id": 2, "x": 0})],
        },
        Step::RetryableUpdate {
            ns: ns("db.a"),
            updates: vec![inc(1)],
        },
        Step::Transaction {
            operations: vec![insert("db.b", vec![json!({"_id": 1})])],
        },
        // Migration phase.
        Step::RetryableInsert {
            ns: ns("db.a"),
            documents: vec![json!({"_id": 3})],
        },
        Step::RetryableFindAndModify {
            commands: vec![fam_inc("db.a", 1)],
        },
        Step::Fault {
            role: FaultRole::Donor,
            shard_index: 0,
            kind: FaultKind::Stepup,
        },
        Step::RetryableDelete {
            ns: ns("db.a"),
            deletes: vec![DeleteStatement {
                q: json!({"_id": 2}),
                limit: 1,
            }],
        },
    ];
    (steps, 4)
}

#[tokio::test]
async fn retries_are_exactly_once_across_relocation() {
    let mut h = harness(
        SimOptions::default(),
        capture_on_first_op(),
        OracleConfig::default(),
    );
    let (steps, boundary) = mixed_script();
    let stats = h.driver.run_script(&steps, boundary).await.expect("run");
    assert_eq!(stats.seed.steps, 4);
    assert_eq!(stats.migration.steps, 4);
    assert_eq!(h.driver.retry_oracle().records().len(), 5);

    let report = h.driver.verify_exactly_once(false).await.expect("verify");
    assert_eq!(report.records, 5);
    assert_eq!(report.pre_boundary_matched, 2);
    assert_eq!(report.pre_boundary_incomplete_history, 0);
    assert!(report.post_boundary_exempt.is_some());
    assert_eq!(report.post_boundary_matched, 2);

    // Replays left the data as the first executions did.
    assert_eq!(
        h.cluster.documents(&ns("db.a")),
        vec![json!({"_id": 1, "x": 2}), json!({"_id": 3})]
    );
    assert_eq!(h.cluster.faults().len(), 1);
}

#[tokio::test]
async fn relaxed_verification_skips_post_boundary_find_and_modify() {
    let mut h = harness(
        SimOptions::default(),
        capture_on_first_op(),
        OracleConfig::default(),
    );
    let (steps, boundary) = mixed_script();
    h.driver.run_script(&steps, boundary).await.expect("run");
    let report = h.driver.verify_exactly_once(true).await.expect("verify");
    assert_eq!(report.post_boundary_skipped, 1);
    assert_eq!(report.post_boundary_matched, 1);
}

#[tokio::test]
async fn new_owners_without_history_are_tolerated_before_the_boundary() {
    let mut h = harness(
        SimOptions {
            drop_pre_boundary_history: true,
            ..SimOptions::default()
        },
        capture_on_first_op(),
        OracleConfig::default(),
    );
    let (steps, boundary) = mixed_script();
    h.driver.run_script(&steps, boundary).await.expect("run");
    let report = h.driver.verify_exactly_once(false).await.expect("verify");
    assert_eq!(report.pre_boundary_incomplete_history, 2);
    assert_eq!(report.pre_boundary_matched, 0);
}

#[tokio::test]
async fn reapplied_update_is_reported_as_a_ghost_write() {
    let mut h = harness(
        SimOptions {
            faulty_replays: true,
            ..SimOptions::default()
        },
        RelocationOptions::default(),
        OracleConfig::default(),
    );
    let steps = vec![
        Step::Plain {
            commands: vec![insert("db.a", vec![json!({"_id": 1, "x": 0})])],
        },
        Step::RetryableUpdate {
            ns: ns("db.a"),
            updates: vec![inc(1)],
        },
    ];
    h.driver.run_script(&steps, 1).await.expect("run");
    let err = h
        .driver
        .verify_exactly_once(false)
        .await
        .expect_err("ghost write");
    match err {
        OracleError::GhostWrites { entries, ns, .. } => {
            assert_eq!(ns.to_string(), "db.a");
            assert!(entries.iter().all(|e| e.is_user_write()));
            assert!(!entries.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn reapplied_insert_fails_the_immediate_retry() {
    let mut h = harness(
        SimOptions {
            faulty_replays: true,
            ..SimOptions::default()
        },
        RelocationOptions::default(),
        OracleConfig::default(),
    );
    let steps = vec![Step::RetryableInsert {
        ns: ns("db.a"),
        documents: vec![json!({"_id": 1})],
    }];
    let err = h.driver.run_script(&steps, 1).await.expect_err("mismatch");
    match err {
        OracleError::RetryMismatch {
            stage,
            command_index,
            other,
            ..
        } => {
            assert_eq!(stage, RetryStage::Second);
            assert_eq!(command_index, 0);
            assert!(other.has_failure());
        }
        other => panic!("unexpected error: {other}"),
    }
}
