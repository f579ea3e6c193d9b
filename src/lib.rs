//! Eddy — a peer-to-peer, eventually-consistent database toolkit.
//!
//! Peers append signed operations to per-database causal logs (Merkle-DAGs
//! with Lamport clocks), advertise their log heads over a gossip topic, and
//! reconcile by fetching missing ancestors from a shared content-addressed
//! object store. Every replica converges on the same deterministic total
//! order, which the typed views (event log, feed, key-value, counter,
//! document store) materialize.
//!
//! The object store and gossip transport are trait seams
//! ([`store::ObjectStore`], [`gossip::GossipBus`]); the in-memory
//! implementations shipped here wire any number of in-process peers together.
//!
//! ```no_run
//! use std::sync::Arc;
//! use eddy_core::{Database, Keypair, LocalGossip, MemoryObjectStore, OpenOptions, Peer, StoreType};
//!
//! # async fn demo() -> Result<(), eddy_core::DbError> {
//! let peer = Peer::new(
//!     Arc::new(Keypair::generate()),
//!     Arc::new(MemoryObjectStore::new()),
//!     Arc::new(LocalGossip::new()),
//! );
//! let db = Database::open(peer, "journal", OpenOptions {
//!     create: true,
//!     store_type: Some(StoreType::EventLog),
//!     ..Default::default()
//! })
//! .await?;
//! db.add(b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod address;
pub mod cache;
pub mod cid;
pub mod db;
pub mod entry;
pub mod gossip;
pub mod keys;
pub mod oplog;
pub mod replicator;
pub mod store;
pub mod views;

pub use access::{AccessController, AccessError, Role};
pub use address::{Address, AddressError, Manifest, StoreType};
pub use cache::{Cache, CacheError, FileCache, MemoryCache};
pub use cid::{Cid, CidError};
pub use db::{Database, DbError, DbEvent, IterOptions, OpenOptions, Peer};
pub use entry::{Entry, EntryError, LamportClock};
pub use gossip::{GossipBus, GossipError, GossipSubscriber, HeadsMessage, LocalGossip};
pub use keys::{KeyError, KeyStore, Keypair};
pub use oplog::{OpLog, OplogError};
pub use replicator::{ReplicationInfo, Replicator, RetryPolicy};
pub use store::{MemoryObjectStore, ObjectStore, StoreError};
pub use views::{Counter, DocStore, EventLog, Feed, KeyValue, RecordOp, ViewError};
