//! Database coordinator — wires local writes, gossip, and replication.
//!
//! A [`Database`] owns one oplog, one replicator, one gossip subscription
//! (topic = database address), and an outbound event channel. Local writes go
//! through [`Database::add`]; remote heads arrive via gossip and flow through
//! [`Database::sync`] into the replicator. On every peer joining the topic
//! the coordinator pushes its current heads directly to that peer.
//!
//! Subscribers consume typed [`DbEvent`] messages from a broadcast channel —
//! event payloads are snapshots, and handlers can never reenter the
//! coordinator from inside an emit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::access::{AccessController, AccessError};
use crate::address::{self, Address, AddressError, Manifest, StoreType};
use crate::cache::{Cache, CacheError, FileCache, MemoryCache};
use crate::cid::Cid;
use crate::entry::{Entry, EntryError};
use crate::gossip::{GossipBus, GossipError, GossipSubscriber, HeadsMessage};
use crate::keys::Keypair;
use crate::oplog::{OpLog, OplogError};
use crate::replicator::{ReplicationInfo, Replicator, RetryPolicy, DEFAULT_CONCURRENCY};
use crate::store::{ObjectStore, StoreError};

/// Capacity of the per-database event channel.
const EVENT_CAPACITY: usize = 8192;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid database address: {0}")]
    InvalidAddress(String),
    #[error("no locally known database: {0}")]
    UnknownDatabase(String),
    #[error("type mismatch: manifest says {found}, requested {requested}")]
    TypeMismatch { found: StoreType, requested: StoreType },
    #[error("invalid store type: {0}")]
    InvalidType(String),
    #[error("database already exists: {0}")]
    AlreadyExists(String),
    #[error("not authorized: {0} lacks write access")]
    NotAuthorized(String),
    #[error("database is closed: {0}")]
    Closed(String),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Gossip(#[from] GossipError),
}

impl From<OplogError> for DbError {
    fn from(e: OplogError) -> Self {
        match e {
            OplogError::Entry(EntryError::Unauthorized(key)) => DbError::NotAuthorized(key),
            OplogError::Entry(other) => DbError::Entry(other),
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum DbEvent {
    /// A local write is durable in the object store and the oplog.
    Write { address: String, entry: Entry, heads: Vec<Cid> },
    /// Loading from the local cache finished.
    Ready { address: String },
    /// One cached entry replayed during load.
    LoadProgress { address: String, entry: Entry },
    /// A remote entry was fetched and validated.
    Replicate { address: String, entry: Entry },
    /// A remote entry was merged; `info` is a snapshot taken at emit time.
    ReplicateProgress { address: String, hash: Cid, entry: Entry, info: ReplicationInfo },
    /// A merge batch completed; `length` entries were merged.
    Replicated { address: String, length: usize },
    Closed { address: String },
    PeerConnected { address: String, peer: String },
}

// ─── Collaborators ───────────────────────────────────────────────────────────

/// The process-wide collaborators a coordinator runs against. Shared across
/// databases; a coordinator never owns or shuts these down.
pub struct Peer {
    pub keypair: Arc<Keypair>,
    pub store: Arc<dyn ObjectStore>,
    pub gossip: Arc<dyn GossipBus>,
}

impl Peer {
    pub fn new(
        keypair: Arc<Keypair>,
        store: Arc<dyn ObjectStore>,
        gossip: Arc<dyn GossipBus>,
    ) -> Arc<Self> {
        Arc::new(Peer { keypair, store, gossip })
    }

    pub fn id(&self) -> String {
        self.keypair.public_key_hex()
    }
}

// ─── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Create the database if the address is a bare name.
    pub create: bool,
    /// Allow `create` to replace a locally cached database of the same name.
    pub overwrite: bool,
    /// Fail unless the database is already known locally; stay offline.
    pub local_only: bool,
    /// Skip seeding from the local cache and wait for remote heads.
    pub sync: bool,
    /// Act on incoming gossip (serving heads to joiners is always on).
    pub replicate: bool,
    pub store_type: Option<StoreType>,
    /// Write-access keys granted at creation; empty grants the creator.
    pub write: Vec<String>,
    /// Cache directory; in-memory cache when absent.
    pub directory: Option<PathBuf>,
    /// Concurrent fetch budget for the replicator.
    pub concurrency: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            create: false,
            overwrite: false,
            local_only: false,
            sync: false,
            replicate: true,
            store_type: None,
            write: Vec::new(),
            directory: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Iterator bounds over the total order. `limit` keeps the newest N entries
/// of the window (`-1` = all); bounds name entry CIDs, exclusive (`gt`/`lt`)
/// or inclusive (`gte`/`lte`).
#[derive(Debug, Clone)]
pub struct IterOptions {
    pub limit: i64,
    pub gt: Option<Cid>,
    pub gte: Option<Cid>,
    pub lt: Option<Cid>,
    pub lte: Option<Cid>,
}

impl Default for IterOptions {
    fn default() -> Self {
        IterOptions { limit: 1, gt: None, gte: None, lt: None, lte: None }
    }
}

impl IterOptions {
    /// The whole log, oldest to newest.
    pub fn unbounded() -> Self {
        IterOptions { limit: -1, ..Default::default() }
    }
}

// ─── Database ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

struct DbInner {
    address: Address,
    address_str: String,
    manifest: Manifest,
    peer: Arc<Peer>,
    peer_id: String,
    cache: Arc<dyn Cache>,
    oplog: Arc<Mutex<OpLog>>,
    info: Arc<Mutex<ReplicationInfo>>,
    events: broadcast::Sender<DbEvent>,
    replicator: Arc<Replicator>,
    replicate: bool,
    closed: AtomicBool,
}

impl DbInner {
    fn cache_key(&self, suffix: &str) -> String {
        format!("{}/{}", self.address_str, suffix)
    }

    async fn save_heads(&self, heads: &[Cid]) -> Result<(), CacheError> {
        let msg = HeadsMessage { heads: heads.to_vec() };
        match msg.to_bytes() {
            Ok(bytes) => self.cache.set(&self.cache_key("_heads"), bytes).await,
            Err(e) => {
                debug!("failed to encode heads for cache: {e}");
                Ok(())
            }
        }
    }

    /// Replay cached heads from the object store into the oplog.
    async fn load_from_cache(&self) {
        let heads = match self.cache.get(&self.cache_key("_heads")).await {
            Ok(Some(bytes)) => match HeadsMessage::from_bytes(&bytes) {
                Ok(msg) => msg.heads,
                Err(e) => {
                    debug!("ignoring undecodable cached heads: {e}");
                    return;
                }
            },
            Ok(None) => return,
            Err(e) => {
                debug!("cache read failed during load: {e}");
                return;
            }
        };

        // Walk the DAG from the cached heads; entries missing from the store
        // are skipped (the cache may be ahead of a pruned store).
        let mut queue: Vec<Cid> = heads;
        let mut seen: std::collections::HashSet<Cid> = queue.iter().copied().collect();
        let mut fetched: Vec<Entry> = Vec::new();
        while let Some(cid) = queue.pop() {
            if self.oplog.lock().await.has(&cid) {
                continue;
            }
            let bytes = match self.peer.store.get(&cid).await {
                Ok(b) => b,
                Err(e) => {
                    debug!("cached entry {cid} unavailable: {e}");
                    continue;
                }
            };
            match Entry::from_bytes(&bytes) {
                Ok(entry) => {
                    for parent in &entry.next {
                        if seen.insert(*parent) {
                            queue.push(*parent);
                        }
                    }
                    fetched.push(entry);
                }
                Err(e) => debug!("cached entry {cid} undecodable: {e}"),
            }
        }

        let added = self.oplog.lock().await.merge(fetched);
        for entry in added {
            let _ = self.events.send(DbEvent::LoadProgress {
                address: self.address_str.clone(),
                entry,
            });
        }
    }
}

#[async_trait]
impl GossipSubscriber for DbInner {
    async fn on_message(&self, _topic: &str, payload: &[u8]) {
        if self.closed.load(Ordering::SeqCst) || !self.replicate {
            return;
        }
        match HeadsMessage::from_bytes(payload) {
            Ok(msg) => self.replicator.process(msg.heads).await,
            Err(e) => debug!("ignoring undecodable gossip payload: {e}"),
        }
    }

    async fn on_peer_joined(&self, topic: &str, peer: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(DbEvent::PeerConnected {
            address: self.address_str.clone(),
            peer: peer.to_string(),
        });

        let heads = self.oplog.lock().await.head_cids();
        if heads.is_empty() {
            return;
        }
        if let Ok(bytes) = (HeadsMessage { heads }).to_bytes() {
            // Best effort: the peer may already have left the topic.
            let _ = self.peer.gossip.send_to(topic, peer, &bytes).await;
        }
    }
}

impl Database {
    /// Open a database by address, or create one from a bare name when
    /// `create` is set and a store type is given.
    pub async fn open(
        peer: Arc<Peer>,
        address: &str,
        options: OpenOptions,
    ) -> Result<Database, DbError> {
        let cache: Arc<dyn Cache> = match &options.directory {
            Some(dir) => Arc::new(FileCache::load(dir).await?),
            None => Arc::new(MemoryCache::new()),
        };

        let (addr, manifest, access) = if Address::is_valid(address) {
            Self::resolve(&peer, address, &options).await?
        } else {
            Self::create_by_name(&peer, address, &options).await?
        };

        let address_str = addr.to_string();
        let manifest_key = format!("{address_str}/_manifest");

        if options.local_only && cache.get(&manifest_key).await?.is_none() {
            return Err(DbError::UnknownDatabase(address.to_string()));
        }
        if options.create {
            if !options.overwrite && cache.get(&manifest_key).await?.is_some() {
                return Err(DbError::AlreadyExists(address_str));
            }
            if options.overwrite {
                cache.delete(&format!("{address_str}/_heads")).await?;
            }
        }
        cache
            .set(&manifest_key, addr.root.to_hex().into_bytes())
            .await?;

        let access = Arc::new(access);
        let oplog = Arc::new(Mutex::new(OpLog::new(
            address_str.clone(),
            peer.keypair.clone(),
            access.clone(),
        )));
        let info = Arc::new(Mutex::new(ReplicationInfo::default()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let replicator = Replicator::new(
            address_str.clone(),
            peer.store.clone(),
            access,
            oplog.clone(),
            info.clone(),
            events.clone(),
            options.concurrency,
            RetryPolicy::default(),
        );

        let inner = Arc::new(DbInner {
            address: addr,
            address_str: address_str.clone(),
            manifest,
            peer_id: peer.id(),
            peer,
            cache,
            oplog,
            info,
            events,
            replicator,
            replicate: options.replicate,
            closed: AtomicBool::new(false),
        });

        // Seed from the local cache unless the caller wants remote heads only.
        if !options.sync {
            inner.load_from_cache().await;
        }
        let _ = inner.events.send(DbEvent::Ready { address: address_str.clone() });

        if !options.local_only {
            inner
                .peer
                .gossip
                .subscribe(&address_str, &inner.peer_id, inner.clone())
                .await?;
        }

        Ok(Database { inner })
    }

    /// Address form: load the manifest and its access policy from the store.
    async fn resolve(
        peer: &Arc<Peer>,
        address: &str,
        options: &OpenOptions,
    ) -> Result<(Address, Manifest, AccessController), DbError> {
        let addr = Address::parse(address)?;
        let manifest = address::load_manifest(peer.store.as_ref(), &addr.root).await?;
        if let Some(requested) = options.store_type {
            if requested != manifest.store_type {
                return Err(DbError::TypeMismatch {
                    found: manifest.store_type,
                    requested,
                });
            }
        }
        let access =
            AccessController::load(peer.store.as_ref(), &manifest.access_controller).await?;
        Ok((addr, manifest, access))
    }

    /// Bare-name form: only valid when creating with an explicit type.
    async fn create_by_name(
        peer: &Arc<Peer>,
        name: &str,
        options: &OpenOptions,
    ) -> Result<(Address, Manifest, AccessController), DbError> {
        if name.is_empty() || name.starts_with('/') {
            return Err(DbError::InvalidAddress(name.to_string()));
        }
        if !options.create {
            return Err(if options.local_only {
                DbError::UnknownDatabase(name.to_string())
            } else {
                DbError::InvalidAddress(name.to_string())
            });
        }
        let Some(store_type) = options.store_type else {
            return Err(DbError::InvalidType("store type required to create".into()));
        };

        let access = AccessController::for_creator(&options.write, &peer.id());
        let access_cid = access.save(peer.store.as_ref()).await?;
        let manifest_cid =
            address::create_manifest(peer.store.as_ref(), name, store_type, access_cid).await?;
        let manifest = Manifest {
            name: name.to_string(),
            store_type,
            access_controller: access_cid,
        };
        Ok((Address::new(manifest_cid, name), manifest, access))
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    pub fn store_type(&self) -> StoreType {
        self.inner.manifest.store_type
    }

    /// Receive typed events. A receiver sees every event emitted from the
    /// moment it subscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<DbEvent> {
        self.inner.events.subscribe()
    }

    pub async fn replication_info(&self) -> ReplicationInfo {
        self.inner.info.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.oplog.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.oplog.lock().await.is_empty()
    }

    pub async fn heads(&self) -> Vec<Entry> {
        self.inner.oplog.lock().await.heads()
    }

    pub async fn all(&self) -> Vec<Entry> {
        self.inner.oplog.lock().await.all()
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Append a local write, persist it, and advertise the new heads.
    ///
    /// The entry is durable in the object store and the oplog before the
    /// `Write` event fires; gossip delivery is best-effort and may still be
    /// in flight when this returns. Persistence failures propagate — a local
    /// add is never silently dropped.
    pub async fn add(&self, payload: Vec<u8>) -> Result<Entry, DbError> {
        self.ensure_open()?;

        let (entry, heads) = {
            let mut oplog = self.inner.oplog.lock().await;
            let entry = oplog.append(payload)?;
            (entry, oplog.head_cids())
        };

        let cid = self.inner.peer.store.put(entry.to_bytes()?).await?;
        self.inner.peer.store.pin(&cid).await?;
        self.inner.save_heads(&heads).await?;

        let _ = self.inner.events.send(DbEvent::Write {
            address: self.inner.address_str.clone(),
            entry: entry.clone(),
            heads: heads.clone(),
        });

        if let Ok(bytes) = (HeadsMessage { heads }).to_bytes() {
            let _ = self
                .inner
                .peer
                .gossip
                .publish(&self.inner.address_str, &bytes)
                .await;
        }

        Ok(entry)
    }

    /// Feed remote head CIDs to the replicator. Idempotent.
    pub async fn sync(&self, heads: Vec<Cid>) {
        if self.inner.closed.load(Ordering::SeqCst) || !self.inner.replicate {
            return;
        }
        self.inner.replicator.process(heads).await;
    }

    /// Read entries in total order within the given bounds.
    pub async fn iterator(&self, options: IterOptions) -> Vec<Entry> {
        let all = self.inner.oplog.lock().await.all();
        let position = |cid: &Option<Cid>| {
            cid.as_ref().and_then(|c| all.iter().position(|e| &e.hash == c))
        };

        let mut start = 0usize;
        let mut end = all.len();
        if let Some(i) = position(&options.gte) {
            start = i;
        }
        if let Some(i) = position(&options.gt) {
            start = i + 1;
        }
        if let Some(i) = position(&options.lte) {
            end = i + 1;
        }
        if let Some(i) = position(&options.lt) {
            end = i;
        }
        if start >= end {
            return Vec::new();
        }

        let window = &all[start..end];
        let take = if options.limit < 0 {
            window.len()
        } else {
            (options.limit as usize).min(window.len())
        };
        window[window.len() - take..].to_vec()
    }

    /// Flush the cache, leave the gossip topic, and stop replication work.
    /// Idempotent.
    pub async fn close(&self) -> Result<(), DbError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.replicator.shutdown().await;
        let _ = self
            .inner
            .peer
            .gossip
            .unsubscribe(&self.inner.address_str, &self.inner.peer_id)
            .await;

        let heads = self.inner.oplog.lock().await.head_cids();
        self.inner.save_heads(&heads).await?;

        let _ = self.inner.events.send(DbEvent::Closed {
            address: self.inner.address_str.clone(),
        });
        Ok(())
    }

    /// Close, then wipe this database's cache entries and replication info.
    pub async fn drop_db(&self) -> Result<(), DbError> {
        self.close().await?;
        self.inner.cache.delete(&self.inner.cache_key("_manifest")).await?;
        self.inner.cache.delete(&self.inner.cache_key("_heads")).await?;
        self.inner.info.lock().await.reset();
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed(self.inner.address_str.clone()));
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::LocalGossip;
    use crate::store::MemoryObjectStore;
    use std::time::Duration;

    struct Net {
        store: Arc<MemoryObjectStore>,
        gossip: Arc<LocalGossip>,
    }

    impl Net {
        fn new() -> Self {
            Net {
                store: Arc::new(MemoryObjectStore::new()),
                gossip: Arc::new(LocalGossip::new()),
            }
        }

        fn peer(&self) -> Arc<Peer> {
            Peer::new(
                Arc::new(Keypair::generate()),
                self.store.clone(),
                self.gossip.clone(),
            )
        }
    }

    fn create_opts(ty: StoreType) -> OpenOptions {
        OpenOptions {
            create: true,
            store_type: Some(ty),
            write: vec!["*".to_string()],
            ..Default::default()
        }
    }

    async fn wait_until_len(db: &Database, n: usize) {
        for _ in 0..1000 {
            if db.len().await >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("database never reached {n} entries");
    }

    #[tokio::test]
    async fn create_open_and_type_checks() {
        let net = Net::new();
        let a = net.peer();

        let db = Database::open(a.clone(), "orders", create_opts(StoreType::EventLog))
            .await
            .unwrap();
        let addr = db.address().to_string();
        assert!(Address::is_valid(&addr));
        assert_eq!(db.store_type(), StoreType::EventLog);

        // Reopening by address with the right type works, wrong type fails.
        let reopened = Database::open(a.clone(), &addr, OpenOptions {
            store_type: Some(StoreType::EventLog),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(reopened.address().to_string(), addr);

        let mismatch = Database::open(a.clone(), &addr, OpenOptions {
            store_type: Some(StoreType::KeyValue),
            ..Default::default()
        })
        .await;
        assert!(matches!(mismatch, Err(DbError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn bare_name_without_create_fails() {
        let net = Net::new();
        let err = Database::open(net.peer(), "nope", OpenOptions::default()).await;
        assert!(matches!(err, Err(DbError::InvalidAddress(_))));

        let err = Database::open(net.peer(), "nope", OpenOptions {
            local_only: true,
            ..Default::default()
        })
        .await;
        assert!(matches!(err, Err(DbError::UnknownDatabase(_))));

        let err = Database::open(net.peer(), "nope", OpenOptions {
            create: true,
            ..Default::default()
        })
        .await;
        assert!(matches!(err, Err(DbError::InvalidType(_))));
    }

    #[tokio::test]
    async fn same_name_and_policy_give_same_address() {
        let net = Net::new();
        let kp = Arc::new(Keypair::generate());
        let a = Peer::new(kp.clone(), net.store.clone(), net.gossip.clone());
        let b = Peer::new(kp, net.store.clone(), net.gossip.clone());

        let opts = create_opts(StoreType::Feed);
        let d1 = Database::open(a, "shared", opts.clone()).await.unwrap();
        let d2 = Database::open(b, "shared", OpenOptions {
            overwrite: true,
            ..opts
        })
        .await
        .unwrap();
        // Content addressing: identical manifests collapse to one address.
        assert_eq!(d1.address(), d2.address());
    }

    #[tokio::test]
    async fn add_appends_persists_and_emits_write() {
        let net = Net::new();
        let db = Database::open(net.peer(), "log", create_opts(StoreType::EventLog))
            .await
            .unwrap();
        let mut events = db.subscribe();

        let entry = db.add(b"hello".to_vec()).await.unwrap();
        assert_eq!(entry.clock.time, 1);
        assert_eq!(db.len().await, 1);
        // Durable in the shared object store under its own CID.
        assert!(net.store.get(&entry.hash).await.is_ok());
        assert!(net.store.is_pinned(&entry.hash).await);

        match events.recv().await.unwrap() {
            DbEvent::Write { entry: e, heads, .. } => {
                assert_eq!(e, entry);
                assert_eq!(heads, vec![entry.hash]);
            }
            other => panic!("expected Write, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_entry_replicates_to_second_peer() {
        let net = Net::new();
        let a = Database::open(net.peer(), "db", create_opts(StoreType::EventLog))
            .await
            .unwrap();
        let b = Database::open(net.peer(), &a.address().to_string(), OpenOptions::default())
            .await
            .unwrap();

        a.add(b"hello".to_vec()).await.unwrap();
        wait_until_len(&b, 1).await;

        let entries = b.iterator(IterOptions::unbounded()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"hello");
    }

    #[tokio::test]
    async fn hundred_entries_replicate_in_order() {
        let net = Net::new();
        let a = Database::open(net.peer(), "db", create_opts(StoreType::EventLog))
            .await
            .unwrap();
        let b = Database::open(net.peer(), &a.address().to_string(), OpenOptions::default())
            .await
            .unwrap();

        for i in 0..100 {
            a.add(format!("hello{i}").into_bytes()).await.unwrap();
        }
        wait_until_len(&b, 100).await;

        let entries = b.iterator(IterOptions::unbounded()).await;
        assert_eq!(entries.len(), 100);
        assert_eq!(entries[0].payload, b"hello0");
        assert_eq!(entries[99].payload, b"hello99");

        // Convergent total order on both replicas.
        let seq_a: Vec<Cid> = a.all().await.iter().map(|e| e.hash).collect();
        let seq_b: Vec<Cid> = b.all().await.iter().map(|e| e.hash).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[tokio::test]
    async fn replication_emits_exact_event_counts() {
        let net = Net::new();
        let a = Database::open(net.peer(), "db", create_opts(StoreType::EventLog))
            .await
            .unwrap();
        let b = Database::open(net.peer(), &a.address().to_string(), OpenOptions::default())
            .await
            .unwrap();
        let mut events = b.subscribe();

        const N: usize = 99;
        for i in 0..N {
            a.add(format!("hello{i}").into_bytes()).await.unwrap();
        }
        wait_until_len(&b, N).await;

        let mut replicate = 0usize;
        let mut progress = 0usize;
        let mut replicated_sum = 0usize;
        let mut first_progress = None;
        while let Ok(event) = events.try_recv() {
            match event {
                DbEvent::Replicate { .. } => replicate += 1,
                DbEvent::ReplicateProgress { entry, info, .. } => {
                    progress += 1;
                    assert_eq!(info.progress, progress as u64);
                    first_progress.get_or_insert((entry, info));
                }
                DbEvent::Replicated { length, .. } => replicated_sum += length,
                _ => {}
            }
        }

        assert_eq!(replicate, N);
        assert_eq!(progress, N);
        assert_eq!(replicated_sum, N);

        let (entry, info) = first_progress.unwrap();
        assert!(entry.payload.starts_with(b"hello"));
        assert_eq!(entry.clock.time, 1);
        assert_eq!(info.progress, 1);
        assert!(info.has(1));
    }

    #[tokio::test]
    async fn peer_join_pushes_heads_to_newcomer() {
        let net = Net::new();
        let a = Database::open(net.peer(), "db", create_opts(StoreType::EventLog))
            .await
            .unwrap();
        for i in 0..16 {
            a.add(format!("hello{i}").into_bytes()).await.unwrap();
        }

        // B joins the topic after the fact; A pushes its heads directly.
        let b = Database::open(
            net.peer(),
            &a.address().to_string(),
            OpenOptions { sync: true, ..Default::default() },
        )
        .await
        .unwrap();
        wait_until_len(&b, 16).await;
        assert_eq!(b.heads().await, a.heads().await);
    }

    #[tokio::test]
    async fn fresh_peer_bulk_replicates_whole_log() {
        let net = Net::new();
        let a = Database::open(net.peer(), "db", create_opts(StoreType::EventLog))
            .await
            .unwrap();

        const N: usize = 512;
        for i in 0..N {
            a.add(format!("hello{i}").into_bytes()).await.unwrap();
        }
        let head = a.heads().await[0].clone();
        assert_eq!(head.clock.time, N as u64);

        // B starts over on an isolated bus so the whole session is driven by
        // one explicit head advertisement and every event is observable.
        let b_peer = Peer::new(
            Arc::new(Keypair::generate()),
            net.store.clone(),
            Arc::new(LocalGossip::new()),
        );
        let b = Database::open(
            b_peer,
            &a.address().to_string(),
            OpenOptions { sync: true, overwrite: true, ..Default::default() },
        )
        .await
        .unwrap();
        let mut events = b.subscribe();

        b.sync(vec![head.hash]).await;
        wait_until_len(&b, N).await;

        let info = b.replication_info().await;
        assert_eq!(info.max, N as u64);
        assert_eq!(info.progress, N as u64);
        assert!(info.has(N as u64));

        let mut replicate = 0usize;
        let mut progress_times = Vec::new();
        let mut replicated_sum = 0usize;
        let mut first_info: Option<ReplicationInfo> = None;
        while let Ok(event) = events.try_recv() {
            match event {
                DbEvent::Replicate { .. } => replicate += 1,
                DbEvent::ReplicateProgress { entry, info, .. } => {
                    if progress_times.is_empty() {
                        first_info = Some(info);
                    }
                    progress_times.push(entry.clock.time);
                }
                DbEvent::Replicated { length, .. } => replicated_sum += length,
                _ => {}
            }
        }

        assert_eq!(replicate, N);
        assert_eq!(progress_times.len(), N);
        assert_eq!(replicated_sum, N);
        // Ancestors surface before descendants: the chain merges oldest-first.
        assert_eq!(progress_times, (1..=N as u64).collect::<Vec<_>>());

        // The head's time slot was observed before its ancestors merged.
        let first = first_info.unwrap();
        assert_eq!(first.max, N as u64);
        assert_eq!(first.progress, 1);
        assert!(first.has(N as u64));
    }

    #[tokio::test]
    async fn unauthorized_local_add_is_rejected() {
        let net = Net::new();
        let owner = net.peer();
        let owner_key = owner.id();
        let db = Database::open(owner.clone(), "private", OpenOptions {
            create: true,
            store_type: Some(StoreType::EventLog),
            write: vec![owner_key],
            ..Default::default()
        })
        .await
        .unwrap();
        db.add(b"mine".to_vec()).await.unwrap();

        // A different peer opens the same address and tries to write.
        let intruder = Database::open(
            net.peer(),
            &db.address().to_string(),
            OpenOptions::default(),
        )
        .await
        .unwrap();
        wait_until_len(&intruder, 1).await;

        let err = intruder.add(b"forged".to_vec()).await;
        assert!(matches!(err, Err(DbError::NotAuthorized(_))));
        assert_eq!(intruder.len().await, 1);
        assert_eq!(db.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_gossip_is_idempotent() {
        let net = Net::new();
        let a = Database::open(net.peer(), "db", create_opts(StoreType::EventLog))
            .await
            .unwrap();
        let b = Database::open(net.peer(), &a.address().to_string(), OpenOptions::default())
            .await
            .unwrap();

        let entry = a.add(b"once".to_vec()).await.unwrap();
        wait_until_len(&b, 1).await;

        let mut events = b.subscribe();
        b.sync(vec![entry.hash]).await;
        b.sync(vec![entry.hash]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(b.len().await, 1);
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, DbEvent::ReplicateProgress { .. }),
                "duplicate heads must not replay progress"
            );
        }
    }

    #[tokio::test]
    async fn iterator_bounds_and_limit() {
        let net = Net::new();
        let db = Database::open(net.peer(), "db", create_opts(StoreType::EventLog))
            .await
            .unwrap();
        let mut cids = Vec::new();
        for i in 0..5u8 {
            cids.push(db.add(vec![i]).await.unwrap().hash);
        }

        // Default limit yields only the newest entry.
        let latest = db.iterator(IterOptions::default()).await;
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].hash, cids[4]);

        let all = db.iterator(IterOptions::unbounded()).await;
        assert_eq!(all.len(), 5);

        let after = db
            .iterator(IterOptions { gt: Some(cids[1]), ..IterOptions::unbounded() })
            .await;
        assert_eq!(after.iter().map(|e| e.hash).collect::<Vec<_>>(), &cids[2..]);

        let upto = db
            .iterator(IterOptions { lte: Some(cids[2]), ..IterOptions::unbounded() })
            .await;
        assert_eq!(upto.iter().map(|e| e.hash).collect::<Vec<_>>(), &cids[..3]);

        let middle = db
            .iterator(IterOptions {
                gte: Some(cids[1]),
                lt: Some(cids[4]),
                ..IterOptions::unbounded()
            })
            .await;
        assert_eq!(middle.iter().map(|e| e.hash).collect::<Vec<_>>(), &cids[1..4]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_writes() {
        let net = Net::new();
        let db = Database::open(net.peer(), "db", create_opts(StoreType::EventLog))
            .await
            .unwrap();
        db.add(b"x".to_vec()).await.unwrap();

        db.close().await.unwrap();
        db.close().await.unwrap();
        assert!(matches!(db.add(b"y".to_vec()).await, Err(DbError::Closed(_))));
    }

    #[tokio::test]
    async fn cached_log_reloads_without_network() {
        let net = Net::new();
        let dir = tempfile::tempdir().unwrap();
        let kp = Arc::new(Keypair::generate());
        let opts = OpenOptions {
            create: true,
            store_type: Some(StoreType::EventLog),
            write: vec!["*".to_string()],
            directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let peer = Peer::new(kp.clone(), net.store.clone(), net.gossip.clone());
        let db = Database::open(peer, "persistent", opts).await.unwrap();
        let address = db.address().to_string();
        for i in 0..10u8 {
            db.add(vec![i]).await.unwrap();
        }
        db.close().await.unwrap();

        let peer = Peer::new(kp, net.store.clone(), net.gossip.clone());
        let reopened = Database::open(peer, &address, OpenOptions {
            directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(reopened.len().await, 10);
        assert_eq!(reopened.heads().await[0].clock.time, 10);
    }

    #[tokio::test]
    async fn drop_db_wipes_cache_and_info() {
        let net = Net::new();
        let dir = tempfile::tempdir().unwrap();
        let kp = Arc::new(Keypair::generate());
        let opts = OpenOptions {
            create: true,
            store_type: Some(StoreType::EventLog),
            write: vec!["*".to_string()],
            directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let peer = Peer::new(kp.clone(), net.store.clone(), net.gossip.clone());
        let db = Database::open(peer, "doomed", opts).await.unwrap();
        let address = db.address().to_string();
        db.add(b"gone".to_vec()).await.unwrap();
        db.drop_db().await.unwrap();
        assert_eq!(db.replication_info().await, ReplicationInfo::default());

        // A fresh open on the same directory finds no cached heads.
        let peer = Peer::new(kp, net.store.clone(), net.gossip.clone());
        let reopened = Database::open(peer, &address, OpenOptions {
            directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(reopened.len().await, 0);
    }

    #[tokio::test]
    async fn create_on_existing_directory_requires_overwrite() {
        let net = Net::new();
        let dir = tempfile::tempdir().unwrap();
        let kp = Arc::new(Keypair::generate());
        let opts = OpenOptions {
            create: true,
            store_type: Some(StoreType::EventLog),
            directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let peer = Peer::new(kp.clone(), net.store.clone(), net.gossip.clone());
        let db = Database::open(peer.clone(), "dup", opts.clone()).await.unwrap();
        db.close().await.unwrap();

        let again = Database::open(peer.clone(), "dup", opts.clone()).await;
        assert!(matches!(again, Err(DbError::AlreadyExists(_))));

        let forced = Database::open(peer, "dup", OpenOptions {
            overwrite: true,
            ..opts
        })
        .await;
        assert!(forced.is_ok());
    }
}
