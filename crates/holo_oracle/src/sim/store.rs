//! Document storage and command evaluation for the simulated cluster.
//!
//! Commands are evaluated against a catalog of collections. The same code
//! serves committed state and transaction overlays; the caller decides where
//! the resulting change-log entries land.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::oracle::{
    ChangeOp, ClusterTime, CommandRequest, CommandResult, DeleteStatement, Document, ErrorClass,
    Namespace, UpdateStatement,
};

pub(crate) const CODE_BAD_VALUE: i32 = 2;
const CODE_FAILED_TO_PARSE: i32 = 9;
const CODE_ILLEGAL_OPERATION: i32 = 20;
const CODE_NAMESPACE_EXISTS: i32 = 48;
const CODE_IMMUTABLE_FIELD: i32 = 66;

pub(crate) type Catalog = BTreeMap<Namespace, Collection>;

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Collection {
    pub capped: bool,
    pub docs: BTreeMap<String, Document>,
    /// Bumped on every committed change; used for write-conflict detection.
    pub version: u64,
}

/// A document-level side effect of a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Touched {
    pub op: ChangeOp,
    pub document_id: Option<String>,
    /// Placement key after the write (`skey` when present, else `_id`).
    pub owner_key: String,
    /// Placement key before the write, for updates.
    pub previous_owner_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Applied {
    pub result: CommandResult,
    pub touched: Vec<Touched>,
}

pub(crate) fn document_key(id: &Value) -> String {
    id.to_string()
}

pub(crate) fn owner_key(doc: &Document) -> String {
    match doc.get("skey") {
        Some(skey) => skey.to_string(),
        None => doc.get("_id").map(document_key).unwrap_or_default(),
    }
}

fn other(code: i32, message: &str) -> ErrorClass {
    ErrorClass::Other {
        code,
        message: message.to_string(),
    }
}

/// Equality match on every top-level field of `filter`.
pub(crate) fn matches(doc: &Document, filter: &Document) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| doc.get(k) == Some(v)),
        None => false,
    }
}

fn is_operator_update(update: &Document) -> bool {
    update
        .as_object()
        .is_some_and(|fields| fields.keys().any(|k| k.starts_with('$')))
}

fn add_numbers(current: Option<&Value>, delta: &Value) -> Result<Value, ErrorClass> {
    let current = current.cloned().unwrap_or(Value::from(0));
    match (current.as_i64(), delta.as_i64()) {
        (Some(a), Some(b)) => Ok(Value::from(a.wrapping_add(b))),
        _ => match (current.as_f64(), delta.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::from(a + b)),
            _ => Err(other(CODE_BAD_VALUE, "cannot apply $inc to a non-numeric value")),
        },
    }
}

/// Apply an update document (`$set`/`$inc`/`$unset` or a replacement).
pub(crate) fn apply_update(doc: &Document, update: &Document) -> Result<Document, ErrorClass> {
    let Some(current) = doc.as_object() else {
        return Err(other(CODE_BAD_VALUE, "stored document is not an object"));
    };
    let id = current.get("_id").cloned();

    if !is_operator_update(update) {
        let Some(replacement) = update.as_object() else {
            return Err(other(CODE_FAILED_TO_PARSE, "update must be a document"));
        };
        if let (Some(new_id), Some(old_id)) = (replacement.get("_id"), &id) {
            if new_id != old_id {
                return Err(other(CODE_IMMUTABLE_FIELD, "_id is immutable"));
            }
        }
        let mut next = Map::new();
        if let Some(id) = id {
            next.insert("_id".to_string(), id);
        }
        for (k, v) in replacement {
            if k != "_id" {
                next.insert(k.clone(), v.clone());
            }
        }
        return Ok(Value::Object(next));
    }

    let mut next = current.clone();
    for (op, fields) in update.as_object().into_iter().flatten() {
        let Some(fields) = fields.as_object() else {
            return Err(other(CODE_FAILED_TO_PARSE, "update operator argument must be a document"));
        };
        for (field, value) in fields {
            if field == "_id" {
                return Err(other(CODE_IMMUTABLE_FIELD, "_id is immutable"));
            }
            match op.as_str() {
                "$set" => {
                    next.insert(field.clone(), value.clone());
                }
                "$inc" => {
                    let sum = add_numbers(next.get(field), value)?;
                    next.insert(field.clone(), sum);
                }
                "$unset" => {
                    next.remove(field);
                }
                _ => return Err(other(CODE_FAILED_TO_PARSE, "unsupported update operator")),
            }
        }
    }
    Ok(Value::Object(next))
}

/// Seed document for an upsert: the equality fields of the query.
fn upsert_seed(query: &Document, clock: ClusterTime, index: usize) -> Document {
    let mut seed = Map::new();
    if let Some(fields) = query.as_object() {
        for (k, v) in fields {
            if !k.starts_with('$') {
                seed.insert(k.clone(), v.clone());
            }
        }
    }
    seed.entry("_id")
        .or_insert_with(|| Value::from(format!("upsert-{clock}-{index}")));
    Value::Object(seed)
}

fn matching_keys(coll: &Collection, filter: &Document, limit: Option<usize>) -> Vec<String> {
    let iter = coll
        .docs
        .iter()
        .filter(|(_, doc)| matches(doc, filter))
        .map(|(k, _)| k.clone());
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

/// Evaluate `command` against `catalog`, mutating it in place.
pub(crate) fn apply(
    catalog: &mut Catalog,
    ns: &Namespace,
    command: &CommandRequest,
    clock: ClusterTime,
) -> Applied {
    match command {
        CommandRequest::Find { filter } => {
            let docs = catalog
                .get(ns)
                .map(|coll| {
                    coll.docs
                        .values()
                        .filter(|doc| matches(doc, filter))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            Applied {
                result: CommandResult::ok(docs.len() as u64, clock).with_value(Some(Value::Array(docs))),
                touched: Vec::new(),
            }
        }
        CommandRequest::Create { capped } => {
            if catalog.contains_key(ns) {
                return Applied {
                    result: CommandResult::failed(
                        other(CODE_NAMESPACE_EXISTS, "collection already exists"),
                        clock,
                    ),
                    touched: Vec::new(),
                };
            }
            catalog.insert(
                ns.clone(),
                Collection {
                    capped: *capped,
                    ..Collection::default()
                },
            );
            Applied {
                result: CommandResult::ok(0, clock),
                touched: vec![create_entry(ns)],
            }
        }
        _ => {
            let existed = catalog.contains_key(ns);
            let coll = catalog.entry(ns.clone()).or_default();
            let mut applied = match command {
                CommandRequest::Insert { documents } => insert(coll, documents, clock),
                CommandRequest::Update { updates } => update(coll, updates, clock),
                CommandRequest::Delete { deletes } => delete(coll, deletes, clock),
                CommandRequest::FindAndModify {
                    query,
                    update,
                    remove,
                    upsert,
                    return_new,
                } => find_and_modify(coll, query, update.as_ref(), *remove, *upsert, *return_new, clock),
                CommandRequest::Find { .. } | CommandRequest::Create { .. } => Applied {
                    result: CommandResult::ok(0, clock),
                    touched: Vec::new(),
                },
            };
            if !applied.touched.is_empty() {
                coll.version += 1;
            }
            if !existed {
                if applied.touched.is_empty() {
                    catalog.remove(ns);
                } else {
                    applied.touched.insert(0, create_entry(ns));
                }
            }
            applied
        }
    }
}

fn create_entry(ns: &Namespace) -> Touched {
    Touched {
        op: ChangeOp::Command,
        document_id: None,
        owner_key: ns.to_string(),
        previous_owner_key: None,
    }
}

fn insert(coll: &mut Collection, documents: &[Document], clock: ClusterTime) -> Applied {
    let mut ids = Vec::with_capacity(documents.len());
    let mut touched = Vec::new();
    let mut failure = None;
    for (index, doc) in documents.iter().enumerate() {
        let mut doc = doc.clone();
        let Some(fields) = doc.as_object_mut() else {
            failure = Some((index, other(CODE_BAD_VALUE, "document must be an object")));
            break;
        };
        let id = fields
            .entry("_id")
            .or_insert_with(|| Value::from(format!("gen-{clock}-{index}")))
            .clone();
        let key = document_key(&id);
        if coll.docs.contains_key(&key) {
            failure = Some((index, ErrorClass::DuplicateKey));
            break;
        }
        touched.push(Touched {
            op: ChangeOp::Insert,
            document_id: Some(key.clone()),
            owner_key: owner_key(&doc),
            previous_owner_key: None,
        });
        coll.docs.insert(key, doc);
        ids.push(id);
    }
    let mut result = CommandResult::ok(ids.len() as u64, clock).with_value(Some(Value::Array(ids)));
    if let Some((index, error)) = failure {
        result = result.with_write_error(index, error);
    }
    Applied { result, touched }
}

fn update(coll: &mut Collection, updates: &[UpdateStatement], clock: ClusterTime) -> Applied {
    let mut n = 0u64;
    let mut n_modified = 0u64;
    let mut touched = Vec::new();
    let mut failure = None;

    'statements: for (index, stmt) in updates.iter().enumerate() {
        let keys = matching_keys(coll, &stmt.q, (!stmt.multi).then_some(1));
        if keys.is_empty() && stmt.upsert {
            let seed = upsert_seed(&stmt.q, clock, index);
            let doc = match apply_update(&seed, &stmt.u) {
                Ok(doc) => doc,
                Err(error) => {
                    failure = Some((index, error));
                    break;
                }
            };
            let key = doc.get("_id").map(document_key).unwrap_or_default();
            touched.push(Touched {
                op: ChangeOp::Insert,
                document_id: Some(key.clone()),
                owner_key: owner_key(&doc),
                previous_owner_key: None,
            });
            coll.docs.insert(key, doc);
            n += 1;
            continue;
        }
        for key in keys {
            let Some(current) = coll.docs.get(&key) else {
                continue;
            };
            let next = match apply_update(current, &stmt.u) {
                Ok(doc) => doc,
                Err(error) => {
                    failure = Some((index, error));
                    break 'statements;
                }
            };
            n += 1;
            if &next != current {
                n_modified += 1;
                touched.push(Touched {
                    op: ChangeOp::Update,
                    document_id: Some(key.clone()),
                    owner_key: owner_key(&next),
                    previous_owner_key: Some(owner_key(current)),
                });
                coll.docs.insert(key, next);
            }
        }
    }

    let mut result = CommandResult::ok(n, clock).with_n_modified(n_modified);
    if let Some((index, error)) = failure {
        result = result.with_write_error(index, error);
    }
    Applied { result, touched }
}

fn delete(coll: &mut Collection, deletes: &[DeleteStatement], clock: ClusterTime) -> Applied {
    if coll.capped {
        return Applied {
            result: CommandResult::failed(
                other(CODE_ILLEGAL_OPERATION, "cannot remove from an append-only collection"),
                clock,
            ),
            touched: Vec::new(),
        };
    }
    let mut n = 0u64;
    let mut touched = Vec::new();
    for stmt in deletes {
        let limit = (stmt.limit > 0).then_some(stmt.limit as usize);
        for key in matching_keys(coll, &stmt.q, limit) {
            if let Some(doc) = coll.docs.remove(&key) {
                n += 1;
                touched.push(Touched {
                    op: ChangeOp::Delete,
                    document_id: Some(key),
                    owner_key: owner_key(&doc),
                    previous_owner_key: None,
                });
            }
        }
    }
    Applied {
        result: CommandResult::ok(n, clock),
        touched,
    }
}

fn find_and_modify(
    coll: &mut Collection,
    query: &Document,
    update: Option<&Document>,
    remove: bool,
    upsert: bool,
    return_new: bool,
    clock: ClusterTime,
) -> Applied {
    let failed = |error| Applied {
        result: CommandResult::failed(error, clock),
        touched: Vec::new(),
    };
    if !remove && update.is_none() {
        return failed(other(CODE_FAILED_TO_PARSE, "either update or remove is required"));
    }
    if remove && coll.capped {
        return failed(other(CODE_ILLEGAL_OPERATION, "cannot remove from an append-only collection"));
    }

    let existing = matching_keys(coll, query, Some(1)).into_iter().next();
    match (existing, update) {
        (Some(key), _) if remove => {
            let old = coll.docs.remove(&key);
            let touched = old
                .as_ref()
                .map(|doc| Touched {
                    op: ChangeOp::Delete,
                    document_id: Some(key.clone()),
                    owner_key: owner_key(doc),
                    previous_owner_key: None,
                })
                .into_iter()
                .collect();
            Applied {
                result: CommandResult::ok(1, clock).with_value(old),
                touched,
            }
        }
        (Some(key), Some(update)) => {
            let Some(current) = coll.docs.get(&key).cloned() else {
                return Applied {
                    result: CommandResult::ok(0, clock),
                    touched: Vec::new(),
                };
            };
            let next = match apply_update(&current, update) {
                Ok(doc) => doc,
                Err(error) => return failed(error),
            };
            let mut touched = Vec::new();
            if next != current {
                touched.push(Touched {
                    op: ChangeOp::Update,
                    document_id: Some(key.clone()),
                    owner_key: owner_key(&next),
                    previous_owner_key: Some(owner_key(&current)),
                });
                coll.docs.insert(key, next.clone());
            }
            let value = if return_new { next } else { current };
            Applied {
                result: CommandResult::ok(1, clock).with_value(Some(value)),
                touched,
            }
        }
        (None, Some(update)) if upsert && !remove => {
            let doc = match apply_update(&upsert_seed(query, clock, 0), update) {
                Ok(doc) => doc,
                Err(error) => return failed(error),
            };
            let key = doc.get("_id").map(document_key).unwrap_or_default();
            let touched = vec![Touched {
                op: ChangeOp::Insert,
                document_id: Some(key.clone()),
                owner_key: owner_key(&doc),
                previous_owner_key: None,
            }];
            coll.docs.insert(key, doc.clone());
            Applied {
                result: CommandResult::ok(1, clock).with_value(return_new.then_some(doc)),
                touched,
            }
        }
        _ => Applied {
            result: CommandResult::ok(0, clock),
            touched: Vec::new(),
        },
    }
}
