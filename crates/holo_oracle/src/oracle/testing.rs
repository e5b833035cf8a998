//! Scripted cluster client for unit tests.
//!
//! Responses are queued per request kind; when a queue is empty the client
//! answers with a success that wrote every statement.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::client::{ClusterClient, CommitOptions, NodeSession, PrepareReply, Relocation};
use super::types::{
    ChangeLogEntry, ClusterTime, CommandKind, CommandRequest, CommandResult, FaultKind,
    FaultRole, IdempotencyKey, Namespace, NodeAddr, SessionId,
};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    Run {
        ns: Namespace,
        kind: CommandKind,
        key: Option<IdempotencyKey>,
    },
    Begin(IdempotencyKey),
    Commit(IdempotencyKey, CommitOptions),
    Abort(IdempotencyKey),
    Prepare(IdempotencyKey),
    EndSession(SessionId),
    Fault(FaultRole, usize, FaultKind),
    SwitchPrimary(NodeAddr),
}

#[derive(Default)]
struct Inner {
    run_results: VecDeque<CommandResult>,
    commit_results: VecDeque<CommandResult>,
    abort_results: VecDeque<CommandResult>,
    prepare_results: VecDeque<PrepareReply>,
    existing: HashSet<Namespace>,
    append_only: HashSet<Namespace>,
    calls: Vec<Call>,
    clock: u64,
}

#[derive(Default)]
pub(crate) struct ScriptedClient {
    inner: Mutex<Inner>,
    nodes: Vec<Arc<FakeNode>>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_nodes(nodes: Vec<Arc<FakeNode>>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            nodes,
        }
    }

    pub(crate) fn push_run(&self, result: CommandResult) {
        self.inner.lock().unwrap().run_results.push_back(result);
    }

    pub(crate) fn push_commit(&self, result: CommandResult) {
        self.inner.lock().unwrap().commit_results.push_back(result);
    }

    pub(crate) fn push_abort(&self, result: CommandResult) {
        self.inner.lock().unwrap().abort_results.push_back(result);
    }

    pub(crate) fn push_prepare(&self, reply: PrepareReply) {
        self.inner.lock().unwrap().prepare_results.push_back(reply);
    }

    pub(crate) fn add_existing(&self, ns: &Namespace) {
        self.inner.lock().unwrap().existing.insert(ns.clone());
    }

    pub(crate) fn add_append_only(&self, ns: &Namespace) {
        let mut inner = self.inner.lock().unwrap();
        inner.existing.insert(ns.clone());
        inner.append_only.insert(ns.clone());
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn tick(inner: &mut Inner) -> ClusterTime {
        inner.clock += 1;
        ClusterTime(inner.clock)
    }
}

#[async_trait]
impl ClusterClient for ScriptedClient {
    async fn run_command(
        &self,
        ns: &Namespace,
        request: &CommandRequest,
        key: Option<&IdempotencyKey>,
    ) -> anyhow::Result<CommandResult> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Run {
            ns: ns.clone(),
            kind: request.kind(),
            key: key.copied(),
        });
        let clock = Self::tick(&mut inner);
        Ok(inner.run_results.pop_front().unwrap_or_else(|| {
            let n = request.statement_count() as u64;
            let result = CommandResult::ok(n, clock).with_n_modified(n);
            match request {
                CommandRequest::FindAndModify { .. } => {
                    result.with_value(Some(serde_json::json!({"_id": 1})))
                }
                _ => result,
            }
        }))
    }

    async fn begin_transaction(&self, key: &IdempotencyKey) -> anyhow::Result<()> {
        self.inner.lock().unwrap().calls.push(Call::Begin(*key));
        Ok(())
    }

    async fn commit_transaction(
        &self,
        key: &IdempotencyKey,
        opts: CommitOptions,
    ) -> anyhow::Result<CommandResult> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Commit(*key, opts));
        let clock = Self::tick(&mut inner);
        Ok(inner
            .commit_results
            .pop_front()
            .unwrap_or_else(|| CommandResult::ok(0, clock)))
    }

    async fn abort_transaction(&self, key: &IdempotencyKey) -> anyhow::Result<CommandResult> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Abort(*key));
        let clock = Self::tick(&mut inner);
        Ok(inner
            .abort_results
            .pop_front()
            .unwrap_or_else(|| CommandResult::ok(0, clock)))
    }

    async fn prepare_transaction(&self, key: &IdempotencyKey) -> anyhow::Result<PrepareReply> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Prepare(*key));
        let clock = Self::tick(&mut inner);
        Ok(inner.prepare_results.pop_front().unwrap_or(PrepareReply {
            result: CommandResult::ok(0, clock),
            prepare_clock: Some(clock),
        }))
    }

    async fn end_session(&self, session: SessionId) -> anyhow::Result<()> {
        self.inner.lock().unwrap().calls.push(Call::EndSession(session));
        Ok(())
    }

    async fn collection_exists(&self, ns: &Namespace) -> anyhow::Result<bool> {
        Ok(self.inner.lock().unwrap().existing.contains(ns))
    }

    async fn collection_is_append_only(&self, ns: &Namespace) -> anyhow::Result<bool> {
        Ok(self.inner.lock().unwrap().append_only.contains(ns))
    }

    async fn nodes(&self) -> anyhow::Result<Vec<NodeAddr>> {
        Ok(self.nodes.iter().map(|n| n.addr.clone()).collect())
    }

    async fn connect_direct(&self, node: &NodeAddr) -> anyhow::Result<Box<dyn NodeSession>> {
        let found = self
            .nodes
            .iter()
            .find(|n| &n.addr == node)
            .ok_or_else(|| anyhow::anyhow!("unknown node {node}"))?;
        Ok(Box::new(FakeNodeSession {
            node: found.clone(),
        }))
    }

    async fn trigger_fault(
        &self,
        role: FaultRole,
        shard_index: usize,
        kind: FaultKind,
    ) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(Call::Fault(role, shard_index, kind));
        Ok(())
    }

    async fn switch_primary(&self, node: &NodeAddr) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(Call::SwitchPrimary(node.clone()));
        Ok(())
    }
}

/// Node with a fixed clock and a hand-written change log.
pub(crate) struct FakeNode {
    addr: NodeAddr,
    clock: Mutex<ClusterTime>,
    log: Mutex<Vec<ChangeLogEntry>>,
}

impl FakeNode {
    pub(crate) fn new(addr: &str, clock: u64) -> Arc<Self> {
        Arc::new(Self {
            addr: NodeAddr(addr.to_string()),
            clock: Mutex::new(ClusterTime(clock)),
            log: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn push_entry(&self, entry: ChangeLogEntry) {
        self.log.lock().unwrap().push(entry);
    }

    pub(crate) fn clock(&self) -> ClusterTime {
        *self.clock.lock().unwrap()
    }
}

struct FakeNodeSession {
    node: Arc<FakeNode>,
}

#[async_trait]
impl NodeSession for FakeNodeSession {
    fn node(&self) -> &NodeAddr {
        &self.node.addr
    }

    async fn current_clock(&self) -> anyhow::Result<ClusterTime> {
        Ok(self.node.clock())
    }

    async fn advance_clock(&self, clock: ClusterTime) -> anyhow::Result<()> {
        let mut current = self.node.clock.lock().unwrap();
        *current = (*current).max(clock);
        Ok(())
    }

    async fn change_log_since(&self, since: ClusterTime) -> anyhow::Result<Vec<ChangeLogEntry>> {
        Ok(self
            .node
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.ts >= since)
            .cloned()
            .collect())
    }
}

/// Relocation that reports a fixed boundary.
pub(crate) struct FakeRelocation {
    boundary: ClusterTime,
    started: AtomicBool,
}

impl FakeRelocation {
    pub(crate) fn new(boundary: ClusterTime) -> Self {
        Self {
            boundary,
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Relocation for FakeRelocation {
    async fn start(&self) -> anyhow::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn await_boundary_clock(&self) -> anyhow::Result<ClusterTime> {
        anyhow::ensure!(self.started(), "relocation was never started");
        Ok(self.boundary)
    }
}
