//! Per-database append policy.
//!
//! A policy is an immutable object `{admin, write}` in the object store; the
//! manifest references it by CID, so changing the policy means a new manifest
//! and a new database address. An entry may be appended iff its signer is in
//! the `write` set or the set contains the `"*"` wildcard. The `admin` set is
//! reserved: it is persisted and round-tripped but not consulted when
//! authorizing appends.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cid::Cid;
use crate::entry::Entry;
use crate::store::{ObjectStore, StoreError};

/// Grants append to any key.
pub const WILDCARD: &str = "*";

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("policy store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed access policy: {0}")]
    Malformed(String),
}

// ─── Roles ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Write,
}

// ─── AccessController ────────────────────────────────────────────────────────

/// Canonical JSON: `{"admin": [..], "write": [..]}`. Key sets are held in
/// `BTreeSet` so equal policies serialize to equal bytes and therefore equal
/// CIDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessController {
    pub admin: BTreeSet<String>,
    pub write: BTreeSet<String>,
}

impl AccessController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for a freshly created database: the supplied `write` list
    /// verbatim, or the creator's own key if none was given. The creator is
    /// always recorded as admin.
    pub fn for_creator(write: &[String], creator_key_hex: &str) -> Self {
        let mut ac = AccessController::new();
        ac.add(Role::Admin, creator_key_hex);
        if write.is_empty() {
            ac.add(Role::Write, creator_key_hex);
        } else {
            for key in write {
                ac.add(Role::Write, key);
            }
        }
        ac
    }

    pub fn add(&mut self, role: Role, key_hex: &str) {
        match role {
            Role::Admin => self.admin.insert(key_hex.to_string()),
            Role::Write => self.write.insert(key_hex.to_string()),
        };
    }

    /// Authorization rule: signer in `write`, or `write` contains `"*"`.
    pub fn can_append(&self, entry: &Entry) -> bool {
        self.write.contains(WILDCARD) || self.write.contains(&entry.identity)
    }

    /// Encode and store the policy, returning its CID (pinned).
    /// Deterministic: equal policies produce equal CIDs.
    pub async fn save(&self, store: &dyn ObjectStore) -> Result<Cid, AccessError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| AccessError::Malformed(e.to_string()))?;
        let cid = store.put(bytes).await?;
        store.pin(&cid).await?;
        Ok(cid)
    }

    pub async fn load(store: &dyn ObjectStore, cid: &Cid) -> Result<Self, AccessError> {
        let bytes = store.get(cid).await?;
        serde_json::from_slice(&bytes).map_err(|e| AccessError::Malformed(e.to_string()))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
