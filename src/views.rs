//! Typed views — thin materializations over the ordered entry sequence.
//!
//! A view never touches the oplog directly: writes go through
//! [`Database::add`] with a CBOR record `{op, key?, value?}` as the payload,
//! and reads replay the coordinator's total order. Conflicting writes resolve
//! last-writer-wins in that order. Records that fail to decode are skipped on
//! read, so one malformed payload cannot poison a view.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::address::StoreType;
use crate::cid::Cid;
use crate::db::{Database, DbError, IterOptions};
use crate::entry::{decode_cbor, encode_cbor, Entry, EntryError};

pub const OP_ADD: &str = "ADD";
pub const OP_DEL: &str = "DEL";
pub const OP_PUT: &str = "PUT";
pub const OP_COUNTER: &str = "COUNTER";

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ViewError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Codec(#[from] EntryError),
    #[error("wrong database type: expected {expected}, found {found}")]
    WrongType { expected: StoreType, found: StoreType },
    #[error("document has no string \"{0}\" field")]
    MissingIndexField(String),
}

// ─── Record format ───────────────────────────────────────────────────────────

/// The payload every view writes into an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOp {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

fn decode_record(entry: &Entry) -> Option<RecordOp> {
    decode_cbor(&entry.payload).ok()
}

fn expect_type(db: &Database, expected: StoreType) -> Result<(), ViewError> {
    let found = db.store_type();
    if found != expected {
        return Err(ViewError::WrongType { expected, found });
    }
    Ok(())
}

// ─── Event log ───────────────────────────────────────────────────────────────

/// Append-only sequence of values.
pub struct EventLog {
    db: Database,
}

impl EventLog {
    pub fn new(db: Database) -> Result<Self, ViewError> {
        expect_type(&db, StoreType::EventLog)?;
        Ok(EventLog { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn add(&self, value: Value) -> Result<Cid, ViewError> {
        let payload = encode_cbor(&RecordOp {
            op: OP_ADD.to_string(),
            key: None,
            value: Some(value),
        })?;
        Ok(self.db.add(payload).await?.hash)
    }

    pub async fn get(&self, cid: &Cid) -> Option<Value> {
        let all = self.db.all().await;
        let entry = all.iter().find(|e| &e.hash == cid)?;
        decode_record(entry)?.value
    }

    /// Values in total order, windowed by `options`.
    pub async fn iterator(&self, options: IterOptions) -> Vec<(Cid, Value)> {
        self.db
            .iterator(options)
            .await
            .iter()
            .filter_map(|e| decode_record(e).and_then(|r| r.value.map(|v| (e.hash, v))))
            .collect()
    }
}

// ─── Feed ────────────────────────────────────────────────────────────────────

/// Like an event log, but entries can be retracted by CID.
pub struct Feed {
    db: Database,
}

impl Feed {
    pub fn new(db: Database) -> Result<Self, ViewError> {
        expect_type(&db, StoreType::Feed)?;
        Ok(Feed { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn add(&self, value: Value) -> Result<Cid, ViewError> {
        let payload = encode_cbor(&RecordOp {
            op: OP_ADD.to_string(),
            key: None,
            value: Some(value),
        })?;
        Ok(self.db.add(payload).await?.hash)
    }

    /// Retract a previously added value by its entry CID.
    pub async fn remove(&self, cid: &Cid) -> Result<Cid, ViewError> {
        let payload = encode_cbor(&RecordOp {
            op: OP_DEL.to_string(),
            key: Some(cid.to_hex()),
            value: None,
        })?;
        Ok(self.db.add(payload).await?.hash)
    }

    /// Surviving values in total order, windowed by `options`. Tombstones are
    /// collected over the whole log so a removal outside the window still
    /// applies.
    pub async fn iterator(&self, options: IterOptions) -> Vec<(Cid, Value)> {
        let removed: std::collections::HashSet<String> = self
            .db
            .all()
            .await
            .iter()
            .filter_map(|e| decode_record(e))
            .filter(|r| r.op == OP_DEL)
            .filter_map(|r| r.key)
            .collect();

        self.db
            .iterator(options)
            .await
            .iter()
            .filter(|e| !removed.contains(&e.hash.to_hex()))
            .filter_map(|e| {
                let record = decode_record(e)?;
                if record.op != OP_ADD {
                    return None;
                }
                record.value.map(|v| (e.hash, v))
            })
            .collect()
    }
}

// ─── Key-value ───────────────────────────────────────────────────────────────

/// Last-writer-wins map keyed by string.
pub struct KeyValue {
    db: Database,
}

impl KeyValue {
    pub fn new(db: Database) -> Result<Self, ViewError> {
        expect_type(&db, StoreType::KeyValue)?;
        Ok(KeyValue { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<Cid, ViewError> {
        let payload = encode_cbor(&RecordOp {
            op: OP_PUT.to_string(),
            key: Some(key.to_string()),
            value: Some(value),
        })?;
        Ok(self.db.add(payload).await?.hash)
    }

    pub async fn del(&self, key: &str) -> Result<Cid, ViewError> {
        let payload = encode_cbor(&RecordOp {
            op: OP_DEL.to_string(),
            key: Some(key.to_string()),
            value: None,
        })?;
        Ok(self.db.add(payload).await?.hash)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.all().await.remove(key)
    }

    /// Materialize the map by replaying the log in total order.
    pub async fn all(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        for entry in self.db.all().await {
            let Some(record) = decode_record(&entry) else { continue };
            match (record.op.as_str(), record.key) {
                (OP_PUT, Some(key)) => {
                    if let Some(value) = record.value {
                        map.insert(key, value);
                    }
                }
                (OP_DEL, Some(key)) => {
                    map.remove(&key);
                }
                _ => {}
            }
        }
        map
    }
}

// ─── Counter ─────────────────────────────────────────────────────────────────

/// Grow-only counter: the value is the sum of all increments.
pub struct Counter {
    db: Database,
}

impl Counter {
    pub fn new(db: Database) -> Result<Self, ViewError> {
        expect_type(&db, StoreType::Counter)?;
        Ok(Counter { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn inc(&self, amount: u64) -> Result<Cid, ViewError> {
        let payload = encode_cbor(&RecordOp {
            op: OP_COUNTER.to_string(),
            key: None,
            value: Some(Value::from(amount)),
        })?;
        Ok(self.db.add(payload).await?.hash)
    }

    pub async fn value(&self) -> u64 {
        self.db
            .all()
            .await
            .iter()
            .filter_map(|e| decode_record(e))
            .filter(|r| r.op == OP_COUNTER)
            .filter_map(|r| r.value.and_then(|v| v.as_u64()))
            .sum()
    }
}

// ─── Document store ──────────────────────────────────────────────────────────

/// Documents keyed by one of their own string fields (`_id` by default).
pub struct DocStore {
    db: Database,
    index_field: String,
}

impl DocStore {
    pub fn new(db: Database) -> Result<Self, ViewError> {
        Self::with_index(db, "_id")
    }

    pub fn with_index(db: Database, index_field: &str) -> Result<Self, ViewError> {
        expect_type(&db, StoreType::DocStore)?;
        Ok(DocStore { db, index_field: index_field.to_string() })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn put(&self, doc: Value) -> Result<Cid, ViewError> {
        let key = doc
            .get(&self.index_field)
            .and_then(Value::as_str)
            .ok_or_else(|| ViewError::MissingIndexField(self.index_field.clone()))?
            .to_string();
        let payload = encode_cbor(&RecordOp {
            op: OP_PUT.to_string(),
            key: Some(key),
            value: Some(doc),
        })?;
        Ok(self.db.add(payload).await?.hash)
    }

    pub async fn del(&self, key: &str) -> Result<Cid, ViewError> {
        let payload = encode_cbor(&RecordOp {
            op: OP_DEL.to_string(),
            key: Some(key.to_string()),
            value: None,
        })?;
        Ok(self.db.add(payload).await?.hash)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.all().await.remove(key)
    }

    /// Documents whose value satisfies the predicate.
    pub async fn query(&self, predicate: impl Fn(&Value) -> bool) -> Vec<Value> {
        self.all().await.into_values().filter(|doc| predicate(doc)).collect()
    }

    pub async fn all(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        for entry in self.db.all().await {
            let Some(record) = decode_record(&entry) else { continue };
            match (record.op.as_str(), record.key) {
                (OP_PUT, Some(key)) => {
                    if let Some(doc) = record.value {
                        map.insert(key, doc);
                    }
                }
                (OP_DEL, Some(key)) => {
                    map.remove(&key);
                }
                _ => {}
            }
        }
        map
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
