//! Transactions: snapshots, write-set buffering, and the CRUD pipelines.
//!
//! A transaction captures a snapshot at begin and buffers its writes as an
//! ordered op log, so reads inside the transaction observe its own pending
//! writes (newest enqueued op wins per document) layered over the
//! snapshot. Nothing touches the WAL until commit; rollback simply
//! discards the buffer. Isolation levels: `ReadCommitted` re-stamps the
//! read snapshot per statement, `RepeatableRead` pins the begin snapshot,
//! and `Serializable` is documented as equivalent to `RepeatableRead` in
//! this version — there is no write-write conflict detection, the later
//! committer wins on a given document.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tracing::trace;

use crate::db::config::Deadline;
use crate::db::database::Database;
use crate::db::mvcc::{read_visible, Timestamp};
use crate::db::refs::{OnDelete, RefRule};
use crate::error::{DbError, Result};
use crate::model::Document;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Snapshot refreshed per statement.
    ReadCommitted,
    /// One snapshot for the transaction lifetime.
    RepeatableRead,
    /// Equivalent to `RepeatableRead` in v1.
    Serializable,
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting operations.
    Active,
    /// Commit finished; effects durable and visible.
    Committed,
    /// Discarded; no effects.
    RolledBack,
}

/// A buffered write, replayed against storage at commit.
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Insert {
        collection: String,
        id: String,
        payload: Vec<u8>,
    },
    Update {
        collection: String,
        id: String,
        payload: Vec<u8>,
    },
    Delete {
        collection: String,
        id: String,
    },
}

#[derive(Debug, Clone)]
enum Pending {
    Doc(Vec<u8>),
    Deleted,
}

/// An open transaction on one database.
#[derive(Debug)]
pub struct Transaction<'db> {
    db: &'db Database,
    tx_id: u64,
    isolation: Isolation,
    state: TxState,
    /// Snapshot registered with the oracle; released at completion.
    begin_ts: Timestamp,
    /// Stamp used for reads; equals `begin_ts` except under RC.
    read_ts: Timestamp,
    deadline: Deadline,
    write_set: Vec<WriteOp>,
    pending: HashMap<(String, String), Pending>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, isolation: Isolation) -> Self {
        let tx_id = db.oracle.allocate();
        let begin_ts = db.oracle.begin_snapshot(tx_id);
        trace!(tx_id, begin_ts, ?isolation, "transaction started");
        Self {
            db,
            tx_id,
            isolation,
            state: TxState::Active,
            begin_ts,
            read_ts: begin_ts,
            deadline: Deadline::none(),
            write_set: Vec::new(),
            pending: HashMap::new(),
        }
    }

    /// Applies an execution deadline to every subsequent operation.
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.tx_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// The snapshot stamp reads currently use.
    pub fn snapshot_ts(&self) -> Timestamp {
        self.read_ts
    }

    fn begin_statement(&mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(DbError::TransactionInactive);
        }
        self.deadline.check()?;
        if self.isolation == Isolation::ReadCommitted {
            self.read_ts = self.db.oracle.allocate();
        }
        Ok(())
    }

    /// Inserts a document, generating an `_id` when absent.
    pub fn insert(&mut self, collection: &str, doc: Value) -> Result<Document> {
        self.begin_statement()?;
        self.db.ensure_writable()?;

        let mut doc = Document::from_value(doc)?;
        let id = doc.ensure_id()?;

        if self.visible(collection, &id)?.is_some() {
            return Err(DbError::DuplicateKey(id));
        }

        let value = doc.to_value();
        self.validate_schema(collection, &value)?;
        self.check_outbound_refs(collection, &value)?;

        let payload = doc.to_bytes();
        self.enqueue(WriteOp::Insert {
            collection: collection.to_string(),
            id: id.clone(),
            payload: payload.clone(),
        });
        self.pending
            .insert((collection.to_string(), id), Pending::Doc(payload));
        Ok(doc)
    }

    /// Point read by `_id`.
    pub fn find_by_id(&mut self, collection: &str, id: &str) -> Result<Document> {
        self.begin_statement()?;
        self.visible(collection, id)?
            .ok_or_else(|| DbError::DocumentNotFound(id.to_string()))
    }

    /// Full document replace.
    pub fn update(&mut self, collection: &str, id: &str, doc: Value) -> Result<Document> {
        self.begin_statement()?;
        self.db.ensure_writable()?;

        if self.visible(collection, id)?.is_none() {
            return Err(DbError::DocumentNotFound(id.to_string()));
        }

        let mut doc = Document::from_value(doc)?;
        let body_id = doc.id().map(str::to_owned);
        match body_id.as_deref() {
            None => doc.set_id(id),
            Some(existing) if existing == id => {}
            Some(other) => {
                return Err(DbError::InvalidDocument(format!(
                    "body _id {other:?} does not match {id:?}"
                )))
            }
        }

        let value = doc.to_value();
        self.validate_schema(collection, &value)?;
        self.check_outbound_refs(collection, &value)?;

        let payload = doc.to_bytes();
        self.enqueue(WriteOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            payload: payload.clone(),
        });
        self.pending
            .insert((collection.to_string(), id.to_string()), Pending::Doc(payload));
        Ok(doc)
    }

    /// Shallow merge of `partial` into the stored document. An explicit
    /// JSON `null` is stored as a null value, never a field removal.
    pub fn patch(&mut self, collection: &str, id: &str, partial: Value) -> Result<Document> {
        self.begin_statement()?;
        self.db.ensure_writable()?;

        let partial = match partial {
            Value::Object(map) => map,
            other => {
                return Err(DbError::InvalidDocument(format!(
                    "patch body must be a JSON object, got {other}"
                )))
            }
        };

        let mut doc = self
            .visible(collection, id)?
            .ok_or_else(|| DbError::DocumentNotFound(id.to_string()))?;
        doc.apply_patch(&partial)?;

        let value = doc.to_value();
        self.validate_schema(collection, &value)?;
        self.check_outbound_refs(collection, &value)?;

        let payload = doc.to_bytes();
        self.enqueue(WriteOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            payload: payload.clone(),
        });
        self.pending
            .insert((collection.to_string(), id.to_string()), Pending::Doc(payload));
        Ok(doc)
    }

    /// Deletes a document, executing inbound reference delete policies
    /// inside this same transaction.
    pub fn delete(&mut self, collection: &str, id: &str) -> Result<()> {
        self.begin_statement()?;
        self.db.ensure_writable()?;

        if self.visible(collection, id)?.is_none() {
            return Err(DbError::DocumentNotFound(id.to_string()));
        }
        let mut visited = HashSet::new();
        self.delete_inner(collection, id, &mut visited)
    }

    /// `_id`-ordered scan. `cap` of 0 means unlimited; the boolean reports
    /// truncation.
    pub fn list(&mut self, collection: &str, cap: usize) -> Result<(Vec<Document>, bool)> {
        self.begin_statement()?;
        let mut docs = self.scan(collection)?;
        let truncated = cap != 0 && docs.len() > cap;
        if truncated {
            docs.truncate(cap);
        }
        Ok((docs, truncated))
    }

    /// Durably applies the write set: WAL append, commit record, group
    /// flush, then version publish.
    pub fn commit(mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(DbError::TransactionInactive);
        }
        self.deadline.check().inspect_err(|_| {
            self.finish(TxState::RolledBack);
        })?;

        if self.write_set.is_empty() {
            self.finish(TxState::Committed);
            return Ok(());
        }

        match self.db.commit_writes(self.tx_id, &self.write_set) {
            Ok(commit_ts) => {
                trace!(tx_id = self.tx_id, commit_ts, "commit published");
                self.finish(TxState::Committed);
                Ok(())
            }
            Err(err) => {
                self.finish(TxState::RolledBack);
                Err(err)
            }
        }
    }

    /// Discards the write set. Appends nothing to the WAL: recovery treats
    /// commit-less transactions as aborted.
    pub fn rollback(mut self) {
        if self.state == TxState::Active {
            self.finish(TxState::RolledBack);
        }
    }

    fn finish(&mut self, state: TxState) {
        self.db.oracle.release_snapshot(self.begin_ts);
        self.state = state;
        self.write_set.clear();
        self.pending.clear();
    }

    fn enqueue(&mut self, op: WriteOp) {
        self.write_set.push(op);
    }

    /// Resolves the document visible to this transaction: its own pending
    /// writes first, then the snapshot.
    fn visible(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        match self.pending.get(&(collection.to_string(), id.to_string())) {
            Some(Pending::Deleted) => return Ok(None),
            Some(Pending::Doc(payload)) => return Document::from_bytes(payload).map(Some),
            None => {}
        }

        let state = self.db.collection(collection)?;
        let Some(head) = state.btree.get(id.as_bytes())? else {
            return Ok(None);
        };
        match read_visible(&self.db.heap, head, self.read_ts)? {
            Some(version) => Document::from_bytes(&version.payload).map(Some),
            None => Ok(None),
        }
    }

    /// All documents of `collection` visible to this transaction, ordered
    /// by `_id`, with the pending overlay applied.
    fn scan(&mut self, collection: &str) -> Result<Vec<Document>> {
        let state = self.db.collection(collection)?;

        let mut by_id: std::collections::BTreeMap<String, Document> =
            std::collections::BTreeMap::new();
        for (key, head) in state.btree.range(None, None, None)? {
            self.deadline.check()?;
            let id = String::from_utf8_lossy(&key).into_owned();
            if let Some(version) = read_visible(&self.db.heap, head, self.read_ts)? {
                by_id.insert(id, Document::from_bytes(&version.payload)?);
            }
        }

        for ((pending_collection, id), pending) in &self.pending {
            if pending_collection != collection {
                continue;
            }
            match pending {
                Pending::Doc(payload) => {
                    by_id.insert(id.clone(), Document::from_bytes(payload)?);
                }
                Pending::Deleted => {
                    by_id.remove(id);
                }
            }
        }
        Ok(by_id.into_values().collect())
    }

    fn validate_schema(&self, collection: &str, doc: &Value) -> Result<()> {
        let state = self.db.collection(collection)?;
        let schema = state.schema.read();
        if let Some(schema) = schema.as_ref() {
            schema.validate(doc)?;
        }
        Ok(())
    }

    /// Resolves every reference-annotated field of `doc` against its
    /// target collection; a non-null value whose target is missing fails.
    fn check_outbound_refs(&self, collection: &str, doc: &Value) -> Result<()> {
        let rules: Vec<RefRule> = self.db.refs.read().outbound(collection).to_vec();
        for rule in rules {
            let value = doc.get(&rule.source_field);
            let target_id = match value {
                None | Some(Value::Null) => continue,
                Some(Value::String(id)) => id.clone(),
                Some(other) => {
                    return Err(DbError::SchemaViolation(format!(
                        "reference field {:?} must be a string or null, got {other}",
                        rule.source_field
                    )))
                }
            };
            if self.visible(&rule.target_collection, &target_id)?.is_none() {
                return Err(DbError::ReferenceTargetNotFound {
                    collection: rule.target_collection.clone(),
                    field: rule.source_field.clone(),
                    target: target_id,
                });
            }
        }
        Ok(())
    }

    fn delete_inner(
        &mut self,
        collection: &str,
        id: &str,
        visited: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        if !visited.insert((collection.to_string(), id.to_string())) {
            return Ok(());
        }
        self.deadline.check()?;

        let inbound: Vec<RefRule> = self.db.refs.read().inbound(collection).to_vec();
        for rule in inbound {
            let dependents = self.dependents_of(&rule, id)?;
            if dependents.is_empty() {
                continue;
            }
            match rule.on_delete {
                OnDelete::Restrict => {
                    return Err(DbError::ReferenceRestrictViolation {
                        collection: collection.to_string(),
                        id: id.to_string(),
                    })
                }
                OnDelete::SetNull => {
                    let source = self.db.collection(&rule.source_collection)?;
                    let allows_null = source
                        .schema
                        .read()
                        .as_ref()
                        .map(|schema| schema.allows_null(&rule.source_field))
                        .unwrap_or(true);
                    if !allows_null {
                        return Err(DbError::SchemaViolation(format!(
                            "cannot null reference field {:?} in {:?}: schema forbids null",
                            rule.source_field, rule.source_collection
                        )));
                    }
                    for mut dependent in dependents {
                        let dep_id = dependent
                            .id()
                            .ok_or_else(|| {
                                DbError::Corruption("stored document lost its _id".into())
                            })?
                            .to_string();
                        if visited.contains(&(rule.source_collection.clone(), dep_id.clone())) {
                            continue;
                        }
                        let mut nulled = Map::new();
                        nulled.insert(rule.source_field.clone(), Value::Null);
                        dependent.apply_patch(&nulled)?;
                        let payload = dependent.to_bytes();
                        self.enqueue(WriteOp::Update {
                            collection: rule.source_collection.clone(),
                            id: dep_id.clone(),
                            payload: payload.clone(),
                        });
                        self.pending.insert(
                            (rule.source_collection.clone(), dep_id),
                            Pending::Doc(payload),
                        );
                    }
                }
                OnDelete::Cascade => {
                    for dependent in dependents {
                        let dep_id = dependent
                            .id()
                            .ok_or_else(|| {
                                DbError::Corruption("stored document lost its _id".into())
                            })?
                            .to_string();
                        self.delete_inner(&rule.source_collection, &dep_id, visited)?;
                    }
                }
            }
        }

        self.enqueue(WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        self.pending
            .insert((collection.to_string(), id.to_string()), Pending::Deleted);
        Ok(())
    }

    /// Documents in the rule's source collection whose reference field
    /// currently equals `target_id`, as seen by this transaction.
    fn dependents_of(&mut self, rule: &RefRule, target_id: &str) -> Result<Vec<Document>> {
        let docs = self.scan(&rule.source_collection)?;
        Ok(docs
            .into_iter()
            .filter(|doc| {
                doc.get(&rule.source_field)
                    .and_then(Value::as_str)
                    .is_some_and(|value| value == target_id)
            })
            .collect())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            trace!(tx_id = self.tx_id, "transaction dropped without commit; rolling back");
            self.finish(TxState::RolledBack);
        }
    }
}
