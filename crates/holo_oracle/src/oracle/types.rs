//! Shared vocabulary for the oracle.
//!
//! These types are protocol agnostic: a `ClusterClient` implementation maps
//! them onto whatever wire format the cluster speaks. They are kept in a
//! small module because the transaction machine, the retry oracle, the step
//! driver and the simulated cluster all depend on them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque document payload.
pub type Document = Value;

/// Error code reported when a transaction number is unknown or already aborted.
pub const CODE_NO_SUCH_TRANSACTION: i32 = 251;
/// Error code reported when a node no longer holds retry history for a key.
pub const CODE_INCOMPLETE_TRANSACTION_HISTORY: i32 = 217;
/// Error code reported when a retried write had been upgraded to a transaction.
pub const CODE_WOULD_CHANGE_OWNING_SHARD: i32 = 283;
/// Error code reported for write-write conflicts.
pub const CODE_WRITE_CONFLICT: i32 = 112;
/// Error code reported for unique index violations.
pub const CODE_DUPLICATE_KEY: i32 = 11000;

/// Logical cluster clock value. Every node advances a shared clock on each request.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClusterTime(pub u64);

impl ClusterTime {
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The smallest clock value strictly greater than `self`.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for ClusterTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side logical session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsid-{}", self.0)
    }
}

/// Identifies one logical operation that may be physically issued many times.
///
/// Two requests carrying the same key and the same command must be treated by
/// the cluster as the same operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub session: SessionId,
    pub sequence: u64,
}

impl IdempotencyKey {
    pub const fn new(session: SessionId, sequence: u64) -> Self {
        Self { session, sequence }
    }

    /// Same session, next sequence number.
    pub const fn successor(self) -> Self {
        Self {
            session: self.session,
            sequence: self.sequence + 1,
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.sequence)
    }
}

/// Fully qualified collection name (`db.coll`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse `db.coll`. The collection part may itself contain dots.
    pub fn parse(raw: &str) -> Option<Self> {
        let (db, coll) = raw.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Self::new(db, coll))
    }

    /// Internal or administrative namespaces never count as user writes.
    pub fn is_internal(&self) -> bool {
        matches!(self.db.as_str(), "admin" | "config" | "local") || self.coll.starts_with("system.")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl TryFrom<String> for Namespace {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Namespace::parse(&value).ok_or_else(|| format!("invalid namespace {value:?} (expected db.coll)"))
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

/// One statement of an update command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub q: Document,
    pub u: Document,
    #[serde(default)]
    pub upsert: bool,
    #[serde(default)]
    pub multi: bool,
}

/// One statement of a delete command. `limit == 0` deletes every match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub q: Document,
    #[serde(default = "default_delete_limit")]
    pub limit: u32,
}

fn default_delete_limit() -> u32 {
    1
}

fn empty_document() -> Document {
    Value::Object(serde_json::Map::new())
}

/// A single command issued against one namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandRequest {
    Insert {
        documents: Vec<Document>,
    },
    Update {
        updates: Vec<UpdateStatement>,
    },
    Delete {
        deletes: Vec<DeleteStatement>,
    },
    /// Exactly one of `update` or `remove` is meaningful.
    FindAndModify {
        query: Document,
        #[serde(default)]
        update: Option<Document>,
        #[serde(default)]
        remove: bool,
        #[serde(default)]
        upsert: bool,
        #[serde(default)]
        return_new: bool,
    },
    Find {
        #[serde(default = "empty_document")]
        filter: Document,
    },
    Create {
        #[serde(default)]
        capped: bool,
    },
}

/// Discriminant of `CommandRequest`, used for equivalence rules and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
    FindAndModify,
    Find,
    Create,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Insert => "insert",
            CommandKind::Update => "update",
            CommandKind::Delete => "delete",
            CommandKind::FindAndModify => "findAndModify",
            CommandKind::Find => "find",
            CommandKind::Create => "create",
        };
        f.write_str(name)
    }
}

impl CommandRequest {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandRequest::Insert { .. } => CommandKind::Insert,
            CommandRequest::Update { .. } => CommandKind::Update,
            CommandRequest::Delete { .. } => CommandKind::Delete,
            CommandRequest::FindAndModify { .. } => CommandKind::FindAndModify,
            CommandRequest::Find { .. } => CommandKind::Find,
            CommandRequest::Create { .. } => CommandKind::Create,
        }
    }

    /// Number of statements carried by the command; used to detect partial execution.
    pub fn statement_count(&self) -> usize {
        match self {
            CommandRequest::Insert { documents } => documents.len(),
            CommandRequest::Update { updates } => updates.len(),
            CommandRequest::Delete { deletes } => deletes.len(),
            CommandRequest::FindAndModify { .. }
            | CommandRequest::Find { .. }
            | CommandRequest::Create { .. } => 1,
        }
    }

    /// Whether the command can be issued as a retryable write.
    pub fn is_retryable_write(&self) -> bool {
        matches!(
            self.kind(),
            CommandKind::Insert | CommandKind::Update | CommandKind::Delete | CommandKind::FindAndModify
        )
    }
}

/// Classified server error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum ErrorClass {
    NoSuchTransaction,
    IncompleteTransactionHistory,
    WouldChangeOwningShard,
    WriteConflict,
    DuplicateKey,
    Other { code: i32, message: String },
}

impl ErrorClass {
    pub fn code(&self) -> i32 {
        match self {
            ErrorClass::NoSuchTransaction => CODE_NO_SUCH_TRANSACTION,
            ErrorClass::IncompleteTransactionHistory => CODE_INCOMPLETE_TRANSACTION_HISTORY,
            ErrorClass::WouldChangeOwningShard => CODE_WOULD_CHANGE_OWNING_SHARD,
            ErrorClass::WriteConflict => CODE_WRITE_CONFLICT,
            ErrorClass::DuplicateKey => CODE_DUPLICATE_KEY,
            ErrorClass::Other { code, .. } => *code,
        }
    }

    /// Map a raw server code onto a class; unknown codes keep their message.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        match code {
            CODE_NO_SUCH_TRANSACTION => ErrorClass::NoSuchTransaction,
            CODE_INCOMPLETE_TRANSACTION_HISTORY => ErrorClass::IncompleteTransactionHistory,
            CODE_WOULD_CHANGE_OWNING_SHARD => ErrorClass::WouldChangeOwningShard,
            CODE_WRITE_CONFLICT => ErrorClass::WriteConflict,
            CODE_DUPLICATE_KEY => ErrorClass::DuplicateKey,
            other => ErrorClass::Other {
                code: other,
                message: message.into(),
            },
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::NoSuchTransaction => write!(f, "NoSuchTransaction({})", self.code()),
            ErrorClass::IncompleteTransactionHistory => {
                write!(f, "IncompleteTransactionHistory({})", self.code())
            }
            ErrorClass::WouldChangeOwningShard => {
                write!(f, "WouldChangeOwningShard({})", self.code())
            }
            ErrorClass::WriteConflict => write!(f, "WriteConflict({})", self.code()),
            ErrorClass::DuplicateKey => write!(f, "DuplicateKey({})", self.code()),
            ErrorClass::Other { code, message } => write!(f, "{message}({code})"),
        }
    }
}

/// Per-statement failure inside an otherwise accepted command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteError {
    pub index: usize,
    pub error: ErrorClass,
}

/// Structured reply to a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub ok: bool,
    pub n: u64,
    pub n_modified: Option<u64>,
    pub value: Option<Document>,
    pub error: Option<ErrorClass>,
    pub write_errors: Vec<WriteError>,
    /// Clock value at which the operation was observed to complete.
    pub observed_clock: ClusterTime,
}

impl CommandResult {
    pub fn ok(n: u64, observed_clock: ClusterTime) -> Self {
        Self {
            ok: true,
            n,
            n_modified: None,
            value: None,
            error: None,
            write_errors: Vec::new(),
            observed_clock,
        }
    }

    pub fn failed(error: ErrorClass, observed_clock: ClusterTime) -> Self {
        Self {
            ok: false,
            n: 0,
            n_modified: None,
            value: None,
            error: Some(error),
            write_errors: Vec::new(),
            observed_clock,
        }
    }

    pub fn with_n_modified(mut self, n_modified: u64) -> Self {
        self.n_modified = Some(n_modified);
        self
    }

    pub fn with_value(mut self, value: Option<Document>) -> Self {
        self.value = value;
        self
    }

    pub fn with_write_error(mut self, index: usize, error: ErrorClass) -> Self {
        self.write_errors.push(WriteError { index, error });
        self
    }

    /// True when the command failed outright or any statement reported an error.
    pub fn has_failure(&self) -> bool {
        !self.ok || !self.write_errors.is_empty()
    }

    /// True when the command-level error or any write error matches `class`.
    pub fn is_classified(&self, class: &ErrorClass) -> bool {
        self.error.as_ref() == Some(class) || self.write_errors.iter().any(|e| &e.error == class)
    }
}

/// Kind of a durable change-log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    Command,
    Noop,
}

/// One entry of a node's durable change log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub ts: ClusterTime,
    pub ns: Namespace,
    pub op: ChangeOp,
    pub document_id: Option<String>,
}

impl ChangeLogEntry {
    /// Entries that represent a durable side effect of a user write.
    pub fn is_user_write(&self) -> bool {
        self.op != ChangeOp::Noop && !self.ns.is_internal()
    }
}

/// Address of a single cluster node, reachable outside of routing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddr(pub String);

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the relocation a fault targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultRole {
    Donor,
    Recipient,
    Config,
}

impl fmt::Display for FaultRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultRole::Donor => "donor",
            FaultRole::Recipient => "recipient",
            FaultRole::Config => "config",
        };
        f.write_str(name)
    }
}

/// How the targeted primary is disrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Stepup,
    Terminate,
    Kill,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Stepup => "stepup",
            FaultKind::Terminate => "terminate",
            FaultKind::Kill => "kill",
        };
        f.write_str(name)
    }
}
