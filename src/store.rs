//! Content-addressed object store seam.
//!
//! Coordinators and replicators only ever talk to the store through the
//! [`ObjectStore`] trait: `put(bytes) → cid` is deterministic (equal bytes,
//! equal CID), `get` fetches by CID, and pinning protects an object from the
//! store's own garbage collection. The store is shared process-wide and must
//! be safe for concurrent use; coordinators never own its lifetime.
//!
//! [`MemoryObjectStore`] is the in-process reference implementation used by
//! the test harness and local setups.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::cid::Cid;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(Cid),
    #[error("fetch timed out: {0}")]
    Timeout(Cid),
    #[error("transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Transient failures are retried by the replicator; `NotFound` is not
    /// (a content-addressed object either exists or never will).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Transport(_))
    }
}

// ─── ObjectStore trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` and return their content id. Idempotent.
    async fn put(&self, bytes: Vec<u8>) -> Result<Cid, StoreError>;

    /// Fetch the bytes stored under `cid`.
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StoreError>;

    /// Protect `cid` from garbage collection.
    async fn pin(&self, cid: &Cid) -> Result<(), StoreError>;

    /// Release a pin. Unpinning an unpinned object is a no-op.
    async fn unpin(&self, cid: &Cid) -> Result<(), StoreError>;
}

// ─── In-memory implementation ────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<Cid, Vec<u8>>>,
    pins: RwLock<HashSet<Cid>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_pinned(&self, cid: &Cid) -> bool {
        self.pins.read().await.contains(cid)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<Cid, StoreError> {
        let cid = Cid::digest(&bytes);
        self.objects.write().await.insert(cid, bytes);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(cid)
            .cloned()
            .ok_or(StoreError::NotFound(*cid))
    }

    async fn pin(&self, cid: &Cid) -> Result<(), StoreError> {
        if !self.objects.read().await.contains_key(cid) {
            return Err(StoreError::NotFound(*cid));
        }
        self.pins.write().await.insert(*cid);
        Ok(())
    }

    async fn unpin(&self, cid: &Cid) -> Result<(), StoreError> {
        self.pins.write().await.remove(cid);
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
