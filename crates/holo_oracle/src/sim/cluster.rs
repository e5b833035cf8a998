//! In-memory sharded cluster.
//!
//! All state lives behind one mutex and every request advances a shared
//! logical clock. Shard primaries keep a durable change log; the config node
//! logs relocation bookkeeping. Placement of a document is a hash of its
//! `skey` (or `_id`) rotated by an ownership epoch that relocation advances.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::watch;

use super::relocation::{RelocationOptions, SimRelocation};
use super::store::{self, Catalog, Touched, CODE_BAD_VALUE};
use crate::oracle::{
    ChangeLogEntry, ChangeOp, ClusterClient, ClusterTime, CommandKind, CommandRequest,
    CommandResult, CommitOptions, Document, ErrorClass, FaultKind, FaultRole, IdempotencyKey,
    Namespace, NodeAddr, NodeSession, PrepareReply, SessionId,
};

/// Reported when aborting or re-preparing a committed transaction.
pub const CODE_TRANSACTION_COMMITTED: i32 = 256;

/// Topology, seed and fault knobs for a `SimCluster`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimOptions {
    pub shards: usize,
    /// Seeds placement and relocation choices.
    pub seed: u64,
    /// New owners lose retry history recorded before the relocation boundary.
    pub drop_pre_boundary_history: bool,
    /// Retries re-apply their writes instead of answering from history.
    pub faulty_replays: bool,
    /// Created up front so forced-abort recovery can read it.
    pub scratch_namespace: Namespace,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            shards: 2,
            seed: 0,
            drop_pre_boundary_history: false,
            faulty_replays: false,
            scratch_namespace: Namespace::new("oracle", "scratch"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    pub role: FaultRole,
    pub shard_index: usize,
    pub kind: FaultKind,
    pub at: ClusterTime,
    /// Unprepared transactions aborted by the fault.
    pub aborted_transactions: usize,
}

struct Node {
    addr: NodeAddr,
    clock: ClusterTime,
    log: Vec<ChangeLogEntry>,
}

struct HistoryEntry {
    result: CommandResult,
    clock: ClusterTime,
    owner_keys: Vec<String>,
    /// The write moved a document across shards and ran as a transaction.
    upgraded: bool,
    dropped: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxnPhase {
    Open,
    Prepared,
    Committed,
    Aborted,
}

struct SimTxn {
    number: u64,
    phase: TxnPhase,
    overlay: Catalog,
    base_versions: BTreeMap<Namespace, Option<u64>>,
    written: BTreeSet<Namespace>,
    touched: Vec<(Namespace, Touched)>,
    prepare_clock: Option<ClusterTime>,
}

impl SimTxn {
    fn new(number: u64) -> Self {
        Self {
            number,
            phase: TxnPhase::Open,
            overlay: Catalog::new(),
            base_versions: BTreeMap::new(),
            written: BTreeSet::new(),
            touched: Vec::new(),
            prepare_clock: None,
        }
    }

    fn abort(&mut self) {
        self.phase = TxnPhase::Aborted;
        self.overlay.clear();
        self.written.clear();
        self.touched.clear();
    }
}

#[derive(Default)]
pub(super) struct RelocationState {
    pub started: bool,
    pub capture_after_ops: Option<u64>,
    pub ops_since_start: u64,
    pub boundary: Option<ClusterTime>,
    pub completed: bool,
}

fn fnv1a(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn placement(owner_key: &str, salt: u64, epoch: u64, shards: usize) -> usize {
    let shards = shards.max(1) as u64;
    (((fnv1a(owner_key) ^ salt) % shards + epoch) % shards) as usize
}

fn failed(error: ErrorClass, clock: ClusterTime) -> CommandResult {
    CommandResult::failed(error, clock)
}

fn committed_error(clock: ClusterTime) -> CommandResult {
    failed(
        ErrorClass::Other {
            code: CODE_TRANSACTION_COMMITTED,
            message: "transaction has already been committed".to_string(),
        },
        clock,
    )
}

pub(super) struct State {
    clock: u64,
    salt: u64,
    epoch: u64,
    rng: SmallRng,
    shards: usize,
    nodes: Vec<Node>,
    primary: NodeAddr,
    catalog: Catalog,
    history: HashMap<IdempotencyKey, HistoryEntry>,
    txns: HashMap<SessionId, SimTxn>,
    faults: Vec<FaultRecord>,
    pub(super) relocation: RelocationState,
    options: SimOptions,
}

impl State {
    fn new(options: SimOptions) -> Self {
        let shards = options.shards.max(1);
        let mut rng = SmallRng::seed_from_u64(options.seed);
        let salt = rng.gen::<u64>();
        let mut nodes = (0..shards)
            .map(|i| Node {
                addr: NodeAddr(format!("shard{i}-primary")),
                clock: ClusterTime::zero(),
                log: Vec::new(),
            })
            .collect::<Vec<_>>();
        nodes.push(Node {
            addr: NodeAddr("config-primary".to_string()),
            clock: ClusterTime::zero(),
            log: Vec::new(),
        });
        let primary = nodes[0].addr.clone();
        let mut catalog = Catalog::new();
        catalog.insert(options.scratch_namespace.clone(), store::Collection::default());
        Self {
            clock: 0,
            salt,
            epoch: 0,
            rng,
            shards,
            nodes,
            primary,
            catalog,
            history: HashMap::new(),
            txns: HashMap::new(),
            faults: Vec::new(),
            relocation: RelocationState::default(),
            options,
        }
    }

    fn tick(&mut self) -> ClusterTime {
        self.clock += 1;
        ClusterTime(self.clock)
    }

    fn shard_for(&self, owner_key: &str) -> usize {
        placement(owner_key, self.salt, self.epoch, self.shards)
    }

    fn config_node(&self) -> usize {
        self.shards
    }

    fn node_index(&self, addr: &NodeAddr) -> Option<usize> {
        self.nodes.iter().position(|n| &n.addr == addr)
    }

    fn append(&mut self, node: usize, entry: ChangeLogEntry) {
        let node = &mut self.nodes[node];
        node.clock = node.clock.max(entry.ts);
        node.log.push(entry);
    }

    fn log_touched(&mut self, ns: &Namespace, touched: &[Touched], ts: ClusterTime) {
        for t in touched {
            let node = self.shard_for(&t.owner_key);
            self.append(
                node,
                ChangeLogEntry {
                    ts,
                    ns: ns.clone(),
                    op: t.op,
                    document_id: t.document_id.clone(),
                },
            );
        }
    }

    /// Session bookkeeping written alongside every retryable write and retry.
    fn log_session_write(&mut self, key: IdempotencyKey, owner_key: Option<&str>, ts: ClusterTime) {
        let node = owner_key.map_or(0, |k| self.shard_for(k));
        self.append(
            node,
            ChangeLogEntry {
                ts,
                ns: Namespace::new("config", "transactions"),
                op: ChangeOp::Update,
                document_id: Some(key.session.to_string()),
            },
        );
    }

    fn prepared_namespaces(&self, except: Option<SessionId>) -> BTreeSet<Namespace> {
        self.txns
            .iter()
            .filter(|(session, txn)| Some(**session) != except && txn.phase == TxnPhase::Prepared)
            .flat_map(|(_, txn)| txn.written.iter().cloned())
            .collect()
    }

    fn transaction_for(&self, key: &IdempotencyKey) -> Option<&SimTxn> {
        self.txns
            .get(&key.session)
            .filter(|txn| txn.number == key.sequence)
    }

    pub(super) fn capture_boundary(&mut self) -> ClusterTime {
        if let Some(boundary) = self.relocation.boundary {
            return boundary;
        }
        let boundary = self.tick();
        self.relocation.boundary = Some(boundary);
        let config = self.config_node();
        self.append(
            config,
            ChangeLogEntry {
                ts: boundary,
                ns: Namespace::new("config", "migrations"),
                op: ChangeOp::Insert,
                document_id: None,
            },
        );
        boundary
    }

    fn note_operation(&mut self) -> Option<ClusterTime> {
        let relocation = &mut self.relocation;
        if !relocation.started || relocation.boundary.is_some() {
            return None;
        }
        let threshold = relocation.capture_after_ops?;
        relocation.ops_since_start += 1;
        if relocation.ops_since_start < threshold {
            return None;
        }
        Some(self.capture_boundary())
    }

    /// Rotate ownership and, when configured, forget pre-boundary history for
    /// data that moved.
    pub(super) fn complete_relocation(&mut self) {
        if self.relocation.completed {
            return;
        }
        let boundary = self.capture_boundary();
        let old_epoch = self.epoch;
        let shift = self.rng.gen_range(1..self.shards.max(2)) as u64;
        self.epoch += shift;

        let (salt, epoch, shards) = (self.salt, self.epoch, self.shards);
        let mut dropped = 0usize;
        if self.options.drop_pre_boundary_history {
            for entry in self.history.values_mut() {
                let moved = entry.owner_keys.is_empty()
                    || entry.owner_keys.iter().any(|k| {
                        placement(k, salt, old_epoch, shards) != placement(k, salt, epoch, shards)
                    });
                if entry.clock < boundary && moved && !entry.dropped {
                    entry.dropped = true;
                    dropped += 1;
                }
            }
        }

        let ts = self.tick();
        let config = self.config_node();
        self.append(
            config,
            ChangeLogEntry {
                ts,
                ns: Namespace::new("config", "collections"),
                op: ChangeOp::Update,
                document_id: None,
            },
        );
        self.relocation.completed = true;
        tracing::info!(
            boundary = %boundary,
            epoch = self.epoch,
            dropped_history = dropped,
            "sim relocation completed"
        );
    }

    fn apply_plain(
        &mut self,
        ns: &Namespace,
        command: &CommandRequest,
        clock: ClusterTime,
    ) -> store::Applied {
        if command.kind() != CommandKind::Find && self.prepared_namespaces(None).contains(ns) {
            return store::Applied {
                result: failed(ErrorClass::WriteConflict, clock),
                touched: Vec::new(),
            };
        }
        let applied = store::apply(&mut self.catalog, ns, command, clock);
        self.log_touched(ns, &applied.touched, clock);
        applied
    }

    fn run_retryable(
        &mut self,
        ns: &Namespace,
        command: &CommandRequest,
        key: IdempotencyKey,
        clock: ClusterTime,
    ) -> CommandResult {
        if let Some(entry) = self.history.get(&key) {
            if entry.upgraded {
                return failed(ErrorClass::WouldChangeOwningShard, clock);
            }
            if entry.dropped {
                return failed(ErrorClass::IncompleteTransactionHistory, clock);
            }
            let owner = entry.owner_keys.first().cloned();
            let result = if self.options.faulty_replays {
                self.apply_plain(ns, command, clock).result
            } else {
                CommandResult {
                    observed_clock: clock,
                    ..entry.result.clone()
                }
            };
            self.log_session_write(key, owner.as_deref(), clock);
            return result;
        }

        let applied = self.apply_plain(ns, command, clock);
        if applied.result.has_failure() {
            return applied.result;
        }
        let upgraded = matches!(command.kind(), CommandKind::Update | CommandKind::FindAndModify)
            && applied.touched.iter().any(|t| {
                t.previous_owner_key
                    .as_ref()
                    .is_some_and(|prev| self.shard_for(prev) != self.shard_for(&t.owner_key))
            });
        let owner_keys = applied
            .touched
            .iter()
            .filter(|t| t.op != ChangeOp::Command)
            .map(|t| t.owner_key.clone())
            .collect::<Vec<_>>();
        self.log_session_write(key, owner_keys.first().map(String::as_str), clock);
        self.history.insert(
            key,
            HistoryEntry {
                result: applied.result.clone(),
                clock,
                owner_keys,
                upgraded,
                dropped: false,
            },
        );
        applied.result
    }

    fn run_in_transaction(
        &mut self,
        ns: &Namespace,
        command: &CommandRequest,
        key: IdempotencyKey,
        clock: ClusterTime,
    ) -> CommandResult {
        let locked = self.prepared_namespaces(Some(key.session)).contains(ns);
        let catalog = &self.catalog;
        let Some(txn) = self.txns.get_mut(&key.session) else {
            return failed(ErrorClass::NoSuchTransaction, clock);
        };
        match txn.phase {
            TxnPhase::Open => {}
            TxnPhase::Aborted => return failed(ErrorClass::NoSuchTransaction, clock),
            TxnPhase::Prepared | TxnPhase::Committed => return committed_error(clock),
        }

        if !txn.base_versions.contains_key(ns) {
            let base = catalog.get(ns);
            txn.base_versions.insert(ns.clone(), base.map(|c| c.version));
            if let Some(coll) = base {
                txn.overlay.insert(ns.clone(), coll.clone());
            }
        }
        if command.kind() != CommandKind::Find && locked {
            txn.abort();
            return failed(ErrorClass::WriteConflict, clock);
        }

        let applied = store::apply(&mut txn.overlay, ns, command, clock);
        if applied.result.has_failure() {
            // Any failed statement aborts the whole transaction server side.
            txn.abort();
            return applied.result;
        }
        if !applied.touched.is_empty() {
            txn.written.insert(ns.clone());
            txn.touched
                .extend(applied.touched.into_iter().map(|t| (ns.clone(), t)));
        }
        applied.result
    }

    /// True when a namespace written by the transaction changed since it was
    /// first read, or is held by another prepared transaction.
    fn conflicts(&self, session: SessionId) -> bool {
        let Some(txn) = self.txns.get(&session) else {
            return false;
        };
        let prepared = self.prepared_namespaces(Some(session));
        txn.written.iter().any(|ns| {
            let base = txn.base_versions.get(ns).copied().flatten();
            self.catalog.get(ns).map(|c| c.version) != base || prepared.contains(ns)
        })
    }

    fn abort_session(&mut self, session: SessionId) {
        if let Some(txn) = self.txns.get_mut(&session) {
            txn.abort();
        }
    }

    fn apply_commit(&mut self, session: SessionId, clock: ClusterTime) -> CommandResult {
        let Some(txn) = self.txns.get_mut(&session) else {
            return failed(ErrorClass::NoSuchTransaction, clock);
        };
        txn.phase = TxnPhase::Committed;
        let mut overlay = std::mem::take(&mut txn.overlay);
        let written = std::mem::take(&mut txn.written);
        let touched = std::mem::take(&mut txn.touched);

        for ns in written {
            if let Some(mut coll) = overlay.remove(&ns) {
                coll.version = self.catalog.get(&ns).map_or(0, |c| c.version) + 1;
                self.catalog.insert(ns, coll);
            }
        }
        for (ns, t) in &touched {
            self.log_touched(ns, std::slice::from_ref(t), clock);
        }
        CommandResult::ok(0, clock)
    }

    fn commit(&mut self, key: IdempotencyKey, opts: CommitOptions, clock: ClusterTime) -> CommandResult {
        let Some((phase, prepare_clock)) = self
            .transaction_for(&key)
            .map(|txn| (txn.phase, txn.prepare_clock))
        else {
            return failed(ErrorClass::NoSuchTransaction, clock);
        };
        match phase {
            TxnPhase::Aborted => failed(ErrorClass::NoSuchTransaction, clock),
            TxnPhase::Committed => CommandResult::ok(0, clock),
            TxnPhase::Open => {
                if self.conflicts(key.session) {
                    self.abort_session(key.session);
                    return failed(ErrorClass::WriteConflict, clock);
                }
                self.apply_commit(key.session, clock)
            }
            TxnPhase::Prepared => match (opts.commit_timestamp, prepare_clock) {
                (Some(ts), Some(prepared_at)) if ts >= prepared_at => {
                    self.apply_commit(key.session, clock)
                }
                _ => failed(
                    ErrorClass::Other {
                        code: CODE_BAD_VALUE,
                        message: "prepared transaction requires a commit timestamp at or after its prepare timestamp"
                            .to_string(),
                    },
                    clock,
                ),
            },
        }
    }

    fn prepare(&mut self, key: IdempotencyKey, clock: ClusterTime) -> PrepareReply {
        let phase = self.transaction_for(&key).map(|t| (t.phase, t.prepare_clock));
        let (result, prepare_clock) = match phase {
            None | Some((TxnPhase::Aborted, _)) => {
                (failed(ErrorClass::NoSuchTransaction, clock), None)
            }
            Some((TxnPhase::Committed, _)) => (committed_error(clock), None),
            Some((TxnPhase::Prepared, prepared_at)) => (CommandResult::ok(0, clock), prepared_at),
            Some((TxnPhase::Open, _)) => {
                if self.conflicts(key.session) {
                    self.abort_session(key.session);
                    (failed(ErrorClass::WriteConflict, clock), None)
                } else {
                    if let Some(txn) = self.txns.get_mut(&key.session) {
                        txn.phase = TxnPhase::Prepared;
                        txn.prepare_clock = Some(clock);
                    }
                    (CommandResult::ok(0, clock), Some(clock))
                }
            }
        };
        PrepareReply {
            result,
            prepare_clock,
        }
    }

    fn abort(&mut self, key: IdempotencyKey, clock: ClusterTime) -> CommandResult {
        match self.transaction_for(&key).map(|t| t.phase) {
            None | Some(TxnPhase::Aborted) => failed(ErrorClass::NoSuchTransaction, clock),
            Some(TxnPhase::Committed) => committed_error(clock),
            Some(TxnPhase::Open | TxnPhase::Prepared) => {
                self.abort_session(key.session);
                CommandResult::ok(0, clock)
            }
        }
    }

    fn begin(&mut self, key: IdempotencyKey) -> anyhow::Result<()> {
        if let Some(existing) = self.txns.get(&key.session) {
            anyhow::ensure!(
                existing.number < key.sequence,
                "transaction number {} on {} is not newer than {}",
                key.sequence,
                key.session,
                existing.number
            );
            anyhow::ensure!(
                existing.phase != TxnPhase::Prepared,
                "{} still has a prepared transaction",
                key.session
            );
        }
        // A higher transaction number supersedes whatever the session ran before.
        self.txns.insert(key.session, SimTxn::new(key.sequence));
        Ok(())
    }

    /// Abort every unprepared transaction, as a primary change does.
    fn abort_open_transactions(&mut self) -> usize {
        let mut aborted = 0;
        for txn in self.txns.values_mut() {
            if txn.phase == TxnPhase::Open {
                txn.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

pub(super) struct Shared {
    state: Mutex<State>,
    pub(super) boundary_tx: watch::Sender<Option<ClusterTime>>,
}

impl Shared {
    pub(super) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("sim cluster state lock")
    }

    /// Capture the relocation boundary if needed and publish it.
    pub(super) fn capture_boundary(&self) -> ClusterTime {
        let boundary = self.state().capture_boundary();
        self.boundary_tx.send_replace(Some(boundary));
        boundary
    }
}

/// Deterministic in-memory cluster implementing the oracle collaborators.
#[derive(Clone)]
pub struct SimCluster {
    shared: Arc<Shared>,
}

impl SimCluster {
    pub fn new(options: SimOptions) -> Self {
        let (boundary_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new(options)),
                boundary_tx,
            }),
        }
    }

    /// The background relocation bound to this cluster.
    pub fn relocation(&self, options: RelocationOptions) -> SimRelocation {
        SimRelocation::new(self.shared.clone(), options)
    }

    pub fn clock(&self) -> ClusterTime {
        ClusterTime(self.shared.state().clock)
    }

    pub fn primary(&self) -> NodeAddr {
        self.shared.state().primary.clone()
    }

    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.shared
            .state()
            .catalog
            .get(ns)
            .map(|coll| coll.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Transactions the cluster still considers open or prepared.
    pub fn open_transactions(&self) -> Vec<IdempotencyKey> {
        let state = self.shared.state();
        let mut keys = state
            .txns
            .iter()
            .filter(|(_, txn)| matches!(txn.phase, TxnPhase::Open | TxnPhase::Prepared))
            .map(|(session, txn)| IdempotencyKey::new(*session, txn.number))
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn faults(&self) -> Vec<FaultRecord> {
        self.shared.state().faults.clone()
    }

    pub fn change_log(&self, node: &NodeAddr) -> Vec<ChangeLogEntry> {
        let state = self.shared.state();
        state
            .node_index(node)
            .map(|i| state.nodes[i].log.clone())
            .unwrap_or_default()
    }

    /// Shard currently owning documents whose `skey` is `skey`.
    pub fn shard_for_skey(&self, skey: &Document) -> usize {
        self.shared.state().shard_for(&skey.to_string())
    }
}

#[async_trait]
impl ClusterClient for SimCluster {
    async fn run_command(
        &self,
        ns: &Namespace,
        request: &CommandRequest,
        key: Option<&IdempotencyKey>,
    ) -> anyhow::Result<CommandResult> {
        let (result, captured) = {
            let mut state = self.shared.state();
            let captured = state.note_operation();
            let clock = state.tick();
            let result = match key {
                Some(key) if state.transaction_for(key).is_some() => {
                    state.run_in_transaction(ns, request, *key, clock)
                }
                Some(key) if request.is_retryable_write() => {
                    state.run_retryable(ns, request, *key, clock)
                }
                _ => state.apply_plain(ns, request, clock).result,
            };
            (result, captured)
        };
        if let Some(boundary) = captured {
            self.shared.boundary_tx.send_replace(Some(boundary));
        }
        Ok(result)
    }

    async fn begin_transaction(&self, key: &IdempotencyKey) -> anyhow::Result<()> {
        self.shared.state().begin(*key)
    }

    async fn commit_transaction(
        &self,
        key: &IdempotencyKey,
        opts: CommitOptions,
    ) -> anyhow::Result<CommandResult> {
        let mut state = self.shared.state();
        let clock = state.tick();
        Ok(state.commit(*key, opts, clock))
    }

    async fn abort_transaction(&self, key: &IdempotencyKey) -> anyhow::Result<CommandResult> {
        let mut state = self.shared.state();
        let clock = state.tick();
        Ok(state.abort(*key, clock))
    }

    async fn prepare_transaction(&self, key: &IdempotencyKey) -> anyhow::Result<PrepareReply> {
        let mut state = self.shared.state();
        let clock = state.tick();
        Ok(state.prepare(*key, clock))
    }

    async fn end_session(&self, session: SessionId) -> anyhow::Result<()> {
        let mut state = self.shared.state();
        if let Some(txn) = state.txns.get_mut(&session) {
            if txn.phase == TxnPhase::Open {
                txn.abort();
            }
        }
        Ok(())
    }

    async fn collection_exists(&self, ns: &Namespace) -> anyhow::Result<bool> {
        Ok(self.shared.state().catalog.contains_key(ns))
    }

    async fn collection_is_append_only(&self, ns: &Namespace) -> anyhow::Result<bool> {
        Ok(self
            .shared
            .state()
            .catalog
            .get(ns)
            .is_some_and(|coll| coll.capped))
    }

    async fn nodes(&self) -> anyhow::Result<Vec<NodeAddr>> {
        Ok(self
            .shared
            .state()
            .nodes
            .iter()
            .map(|n| n.addr.clone())
            .collect())
    }

    async fn connect_direct(&self, node: &NodeAddr) -> anyhow::Result<Box<dyn NodeSession>> {
        let index = self
            .shared
            .state()
            .node_index(node)
            .ok_or_else(|| anyhow::anyhow!("unknown node {node}"))?;
        Ok(Box::new(SimNodeSession {
            shared: self.shared.clone(),
            index,
            addr: node.clone(),
        }))
    }

    async fn trigger_fault(
        &self,
        role: FaultRole,
        shard_index: usize,
        kind: FaultKind,
    ) -> anyhow::Result<()> {
        let mut state = self.shared.state();
        let limit = match role {
            FaultRole::Donor | FaultRole::Recipient => state.shards,
            FaultRole::Config => 1,
        };
        anyhow::ensure!(
            shard_index < limit,
            "{role} shard index {shard_index} out of range (have {limit})"
        );
        let at = state.tick();
        let aborted_transactions = match role {
            FaultRole::Config => 0,
            FaultRole::Donor | FaultRole::Recipient => state.abort_open_transactions(),
        };
        tracing::info!(
            role = %role,
            shard_index,
            kind = %kind,
            aborted_transactions,
            "sim fault"
        );
        state.faults.push(FaultRecord {
            role,
            shard_index,
            kind,
            at,
            aborted_transactions,
        });
        Ok(())
    }

    async fn switch_primary(&self, node: &NodeAddr) -> anyhow::Result<()> {
        let mut state = self.shared.state();
        anyhow::ensure!(state.node_index(node).is_some(), "unknown node {node}");
        state.primary = node.clone();
        let aborted = state.abort_open_transactions();
        tracing::info!(primary = %node, aborted, "sim primary switched");
        Ok(())
    }
}

struct SimNodeSession {
    shared: Arc<Shared>,
    index: usize,
    addr: NodeAddr,
}

#[async_trait]
impl NodeSession for SimNodeSession {
    fn node(&self) -> &NodeAddr {
        &self.addr
    }

    async fn current_clock(&self) -> anyhow::Result<ClusterTime> {
        Ok(self.shared.state().nodes[self.index].clock)
    }

    async fn advance_clock(&self, clock: ClusterTime) -> anyhow::Result<()> {
        let mut state = self.shared.state();
        state.clock = state.clock.max(clock.0);
        if state.nodes[self.index].clock < clock {
            let index = self.index;
            state.append(
                index,
                ChangeLogEntry {
                    ts: clock,
                    ns: Namespace::new("admin", "$cmd"),
                    op: ChangeOp::Noop,
                    document_id: None,
                },
            );
        }
        Ok(())
    }

    async fn change_log_since(&self, since: ClusterTime) -> anyhow::Result<Vec<ChangeLogEntry>> {
        Ok(self.shared.state().nodes[self.index]
            .log
            .iter()
            .filter(|entry| entry.ts >= since)
            .cloned()
            .collect())
    }
}
