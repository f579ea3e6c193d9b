//! Database identity — addresses, store types, and the manifest.
//!
//! A database is named by an immutable manifest object
//! `{name, type, accessController}` stored in the object store; the
//! manifest's CID plus the name form the address `/eddy/<manifestCid>/<name>`.
//! Changing the access policy produces a new manifest and therefore a new
//! database address.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cid::Cid;
use crate::store::{ObjectStore, StoreError};

pub const SCHEME: &str = "eddy";

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid database address: {0}")]
    InvalidAddress(String),
    #[error("unknown store type: {0}")]
    InvalidType(String),
    #[error("manifest store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),
}

// ─── Store types ─────────────────────────────────────────────────────────────

/// The kinds of typed view a database can materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    EventLog,
    Feed,
    KeyValue,
    Counter,
    DocStore,
}

impl StoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreType::EventLog => "eventlog",
            StoreType::Feed => "feed",
            StoreType::KeyValue => "keyvalue",
            StoreType::Counter => "counter",
            StoreType::DocStore => "docstore",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "eventlog" => Some(StoreType::EventLog),
            "feed" => Some(StoreType::Feed),
            "keyvalue" => Some(StoreType::KeyValue),
            "counter" => Some(StoreType::Counter),
            "docstore" => Some(StoreType::DocStore),
            _ => None,
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Address ─────────────────────────────────────────────────────────────────

/// `/eddy/<manifestCid>/<name>`. Equality is string equality after
/// normalization (trailing slashes stripped).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub root: Cid,
    pub name: String,
}

impl Address {
    pub fn new(root: Cid, name: impl Into<String>) -> Self {
        Address { root, name: name.into() }
    }

    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let invalid = || AddressError::InvalidAddress(s.to_string());

        let trimmed = s.trim_end_matches('/');
        let rest = trimmed
            .strip_prefix('/')
            .and_then(|r| r.strip_prefix(SCHEME))
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(invalid)?;

        let (cid_str, name) = rest.split_once('/').ok_or_else(invalid)?;
        let root = Cid::from_hex(cid_str).map_err(|_| invalid())?;
        if name.is_empty() {
            return Err(invalid());
        }

        Ok(Address { root, name: name.to_string() })
    }

    pub fn is_valid(s: &str) -> bool {
        Address::parse(s).is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", SCHEME, self.root, self.name)
    }
}

// ─── Manifest ────────────────────────────────────────────────────────────────

/// Canonical JSON: `{"name": .., "type": .., "accessController": ..}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(rename = "type")]
    pub store_type: StoreType,
    #[serde(rename = "accessController")]
    pub access_controller: Cid,
}

/// Encode and store a manifest, returning its CID (pinned).
pub async fn create_manifest(
    store: &dyn ObjectStore,
    name: &str,
    store_type: StoreType,
    access_controller: Cid,
) -> Result<Cid, AddressError> {
    let manifest = Manifest {
        name: name.to_string(),
        store_type,
        access_controller,
    };
    let bytes = serde_json::to_vec(&manifest)
        .map_err(|e| AddressError::MalformedManifest(e.to_string()))?;
    let cid = store.put(bytes).await?;
    store.pin(&cid).await?;
    Ok(cid)
}

pub async fn load_manifest(store: &dyn ObjectStore, cid: &Cid) -> Result<Manifest, AddressError> {
    let bytes = store.get(cid).await?;
    serde_json::from_slice(&bytes).map_err(|e| AddressError::MalformedManifest(e.to_string()))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
