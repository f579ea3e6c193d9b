//! Replication engine — pulls the transitive closure of missing entries
//! behind remote heads into the local oplog.
//!
//! Per target CID the engine moves through: queued → fetching → validating →
//! pending (parents unresolved) → ready → resolved (merged). Fetches run on
//! spawned tasks behind a semaphore (the concurrency budget); the merge/emit
//! side is serialized behind the state and oplog locks, so consumers observe
//! a single ordered stream. Transient store failures retry with jittered
//! exponential backoff; validation failures drop the entry and its pending
//! descendants at debug level and are never retried.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::access::AccessController;
use crate::cid::Cid;
use crate::db::DbEvent;
use crate::entry::{self, Entry};
use crate::oplog::OpLog;
use crate::store::{ObjectStore, StoreError};

/// Default admission budget for concurrent fetches.
pub const DEFAULT_CONCURRENCY: usize = 32;

// ─── Replication info ────────────────────────────────────────────────────────

/// Monotonic progress accumulator. `max` is the highest clock time observed
/// across known heads, `progress` counts entries merged this session, and
/// `have` marks time-slots *observed to exist* — a slot turns true when its
/// entry is first inspected, which may be before the entry's ancestors have
/// arrived. Reset only by `drop`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationInfo {
    pub max: u64,
    pub progress: u64,
    pub have: BTreeMap<u64, bool>,
}

impl ReplicationInfo {
    pub fn has(&self, time: u64) -> bool {
        self.have.get(&time).copied().unwrap_or(false)
    }

    pub(crate) fn observe(&mut self, time: u64) {
        if time > self.max {
            self.max = time;
        }
        self.have.insert(time, true);
    }

    pub(crate) fn merged(&mut self, time: u64) {
        self.progress += 1;
        self.have.insert(time, true);
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

// ─── Retry policy ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per CID before it is marked failed.
    pub attempts: u32,
    /// First backoff; doubles per attempt.
    pub base_delay: Duration,
    /// Per-attempt fetch timeout.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// "Equal jitter": delay lands in [backoff/2, backoff].
fn jittered_backoff(backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }
    let half_ms = backoff_ms / 2;
    let jitter_ms = rand::thread_rng().gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

// ─── State ───────────────────────────────────────────────────────────────────

struct PendingEntry {
    entry: Entry,
    missing: HashSet<Cid>,
}

#[derive(Default)]
struct ReplState {
    /// Every CID seen this session (queued, in flight, pending, or merged).
    tracked: HashSet<Cid>,
    /// Terminal fetch failures; retried when the next gossip arrives.
    failed: HashSet<Cid>,
    /// Validation failures; never retried.
    rejected: HashSet<Cid>,
    /// Fetched and validated, waiting on parents.
    pending: HashMap<Cid, PendingEntry>,
    /// Parent CID → pending children waiting on it.
    dependents: HashMap<Cid, Vec<Cid>>,
}

// ─── Replicator ──────────────────────────────────────────────────────────────

pub struct Replicator {
    address: String,
    store: Arc<dyn ObjectStore>,
    access: Arc<AccessController>,
    oplog: Arc<Mutex<OpLog>>,
    info: Arc<Mutex<ReplicationInfo>>,
    events: broadcast::Sender<DbEvent>,
    limiter: Arc<Semaphore>,
    state: Mutex<ReplState>,
    tasks: Mutex<JoinSet<()>>,
    retry: RetryPolicy,
}

impl Replicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: String,
        store: Arc<dyn ObjectStore>,
        access: Arc<AccessController>,
        oplog: Arc<Mutex<OpLog>>,
        info: Arc<Mutex<ReplicationInfo>>,
        events: broadcast::Sender<DbEvent>,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Replicator {
            address,
            store,
            access,
            oplog,
            info,
            events,
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
            state: Mutex::new(ReplState::default()),
            tasks: Mutex::new(JoinSet::new()),
            retry,
        })
    }

    /// Feed a set of remote head CIDs into the engine. Idempotent: CIDs
    /// already merged, in flight, or pending are skipped; CIDs that failed a
    /// previous fetch are retried.
    pub async fn process(self: &Arc<Self>, heads: Vec<Cid>) {
        let to_fetch: Vec<Cid> = {
            let mut st = self.state.lock().await;
            let oplog = self.oplog.lock().await;

            let retries: Vec<Cid> = st.failed.drain().collect();
            for cid in &retries {
                st.tracked.remove(cid);
            }

            retries
                .into_iter()
                .chain(heads)
                .filter(|cid| {
                    !oplog.has(cid) && !st.rejected.contains(cid) && st.tracked.insert(*cid)
                })
                .collect()
        };

        for cid in to_fetch {
            self.spawn_fetch(cid).await;
        }
    }

    /// Abort in-flight work and refuse new admissions. Partially fetched
    /// entries are discarded; the oplog is untouched (merges are idempotent,
    /// so nothing can be left corrupted).
    pub async fn shutdown(&self) {
        self.limiter.close();
        let mut tasks = self.tasks.lock().await;
        tasks.abort_all();
        let mut st = self.state.lock().await;
        st.pending.clear();
        st.dependents.clear();
    }

    async fn spawn_fetch(self: &Arc<Self>, cid: Cid) {
        let this = Arc::clone(self);
        let mut tasks = self.tasks.lock().await;
        // Reap finished tasks so the set doesn't grow with the session.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(this.fetch_one(cid));
    }

    fn fetch_one(
        self: Arc<Self>,
        cid: Cid,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.fetch_one_inner(cid))
    }

    async fn fetch_one_inner(self: Arc<Self>, cid: Cid) {
        // Closed semaphore means the coordinator shut down.
        let Ok(_permit) = self.limiter.clone().acquire_owned().await else {
            return;
        };

        let mut attempt = 0u32;
        let bytes = loop {
            attempt += 1;
            let err = match tokio::time::timeout(self.retry.attempt_timeout, self.store.get(&cid))
                .await
            {
                Ok(Ok(bytes)) => break bytes,
                Ok(Err(e)) => e,
                Err(_) => StoreError::Timeout(cid),
            };

            if err.is_transient() && attempt < self.retry.attempts {
                let backoff = self.retry.base_delay * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(jittered_backoff(backoff)).await;
                continue;
            }

            warn!("fetch failed for {cid} after {attempt} attempts: {err}");
            self.state.lock().await.failed.insert(cid);
            return;
        };

        let entry = match Entry::from_bytes(&bytes) {
            Ok(e) => e,
            Err(e) => {
                debug!("dropping undecodable entry {cid}: {e}");
                self.reject(cid).await;
                return;
            }
        };
        if entry.hash != cid {
            debug!("dropping entry with cid mismatch: wanted {cid}, got {}", entry.hash);
            self.reject(cid).await;
            return;
        }
        if let Err(e) = entry::verify(&entry, &self.access) {
            debug!("dropping invalid entry {cid}: {e}");
            self.reject(cid).await;
            return;
        }

        // The entry is now known to exist: record its time-slot and announce
        // the fetch before resolving ancestry.
        self.info.lock().await.observe(entry.clock.time);
        let _ = self.events.send(DbEvent::Replicate {
            address: self.address.clone(),
            entry: entry.clone(),
        });

        self.settle(entry).await;
    }

    /// Mark a CID as dropped by validation, along with every pending
    /// descendant that can no longer resolve.
    async fn reject(&self, cid: Cid) {
        let mut st = self.state.lock().await;
        st.rejected.insert(cid);

        let mut doomed = vec![cid];
        while let Some(parent) = doomed.pop() {
            for child in st.dependents.remove(&parent).unwrap_or_default() {
                if st.pending.remove(&child).is_some() {
                    debug!("dropping pending descendant {child} of rejected {parent}");
                    st.rejected.insert(child);
                    doomed.push(child);
                }
            }
        }
    }

    /// Place a fetched, validated entry: merge it if its parents are all
    /// resolved (cascading into any waiting descendants), otherwise park it
    /// as pending and fan out fetches for unseen parents.
    async fn settle(self: &Arc<Self>, entry: Entry) {
        let parent_fetches: Vec<Cid> = {
            let mut st = self.state.lock().await;
            let mut oplog = self.oplog.lock().await;

            let missing: HashSet<Cid> = entry
                .next
                .iter()
                .filter(|p| !oplog.has(*p))
                .copied()
                .collect();

            if missing.is_empty() {
                let merged = self.merge_cascade(&mut st, &mut oplog, entry).await;
                if merged > 0 {
                    let _ = self.events.send(DbEvent::Replicated {
                        address: self.address.clone(),
                        length: merged,
                    });
                }
                Vec::new()
            } else {
                let unseen: Vec<Cid> = missing
                    .iter()
                    .filter(|p| !st.rejected.contains(*p) && !st.tracked.contains(*p))
                    .copied()
                    .collect();
                for parent in &unseen {
                    st.tracked.insert(*parent);
                }
                for parent in &missing {
                    st.dependents.entry(*parent).or_default().push(entry.hash);
                }
                st.pending.insert(entry.hash, PendingEntry { entry, missing });
                unseen
            }
        };

        for cid in parent_fetches {
            self.spawn_fetch(cid).await;
        }
    }

    /// Merge `root` and every pending descendant it unblocks, wave by wave.
    /// Each wave is emitted in the log's total order; descendants always land
    /// after their ancestors, so `replicate.progress` respects causality.
    /// Returns the number of entries merged.
    async fn merge_cascade(
        &self,
        st: &mut ReplState,
        oplog: &mut OpLog,
        root: Entry,
    ) -> usize {
        let mut merged = 0usize;
        let mut wave = vec![root];

        while !wave.is_empty() {
            wave.sort();
            let mut next_wave = Vec::new();

            for e in wave.drain(..) {
                if !oplog.apply(e.clone()) {
                    continue; // lost a race with a direct merge; no double count
                }
                merged += 1;

                let snapshot = {
                    let mut info = self.info.lock().await;
                    info.merged(e.clock.time);
                    info.clone()
                };
                let _ = self.events.send(DbEvent::ReplicateProgress {
                    address: self.address.clone(),
                    hash: e.hash,
                    entry: e.clone(),
                    info: snapshot,
                });

                for child_cid in st.dependents.remove(&e.hash).unwrap_or_default() {
                    if let Some(pending) = st.pending.get_mut(&child_cid) {
                        pending.missing.remove(&e.hash);
                        if pending.missing.is_empty() {
                            let ready = st
                                .pending
                                .remove(&child_cid)
                                .map(|p| p.entry)
                                .filter(|entry| !oplog.has(&entry.hash));
                            if let Some(entry) = ready {
                                next_wave.push(entry);
                            }
                        }
                    }
                }
            }
            wave = next_wave;
        }
        merged
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
