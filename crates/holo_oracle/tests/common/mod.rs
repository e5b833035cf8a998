//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use holo_oracle::oracle::{
    CommandRequest, Namespace, OracleConfig, RunLog, StepDriver, TxnStatement, UpdateStatement,
};
use holo_oracle::sim::{RelocationOptions, SimCluster, SimOptions, SimRelocation};
use serde_json::{json, Value};

/// A simulated cluster, its relocation, and a driver wired to both.
pub struct Harness {
    pub cluster: SimCluster,
    pub relocation: Arc<SimRelocation>,
    pub driver: StepDriver,
}

pub fn harness(options: SimOptions, relocation: RelocationOptions, config: OracleConfig) -> Harness {
    let cluster = SimCluster::new(options);
    let relocation = Arc::new(cluster.relocation(relocation));
    let driver = StepDriver::new(
        Arc::new(cluster.clone()),
        relocation.clone(),
        config,
        RunLog::new("it"),
    );
    Harness {
        cluster,
        relocation,
        driver,
    }
}

/// Boundary captured by the first routed command after relocation starts.
pub fn capture_on_first_op() -> RelocationOptions {
    RelocationOptions {
        capture_after_ops: Some(1),
        capture_delay: None,
    }
}

pub fn ns(raw: &str) -> Namespace {
    Namespace::parse(raw).expect("namespace")
}

pub fn insert(raw_ns: &str, docs: Vec<Value>) -> TxnStatement {
    TxnStatement {
        ns: ns(raw_ns),
        command: CommandRequest::Insert { documents: docs },
    }
}

pub fn inc(id: i64) -> UpdateStatement {
    UpdateStatement {
        q: json!({"_id": id}),
        u: json!({"$inc": {"x": 1}}),
        upsert: false,
        multi: false,
    }
}

pub fn fam_inc(raw_ns: &str, id: i64) -> TxnStatement {
    TxnStatement {
        ns: ns(raw_ns),
        command: CommandRequest::FindAndModify {
            query: json!({"_id": id}),
            update: Some(json!({"$inc": {"x": 1}})),
            remove: false,
            upsert: false,
            return_new: true,
        },
    }
}
