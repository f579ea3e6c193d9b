//! The operation log — an append-only Merkle-DAG of signed entries.
//!
//! The log is closed under `next`: every parent CID either resolves to an
//! entry in the log or is still being replicated (the replicator never feeds
//! an entry in before its ancestors). `heads` is exactly the set of entries
//! no other entry references as a parent; `tails` the entries whose parents
//! are absent or empty. All mutation happens through [`OpLog::append`] and
//! [`OpLog::merge`] on the coordinator's serialized context; the log itself
//! does no I/O.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::access::AccessController;
use crate::cid::Cid;
use crate::entry::{self, Entry, EntryError};
use crate::keys::Keypair;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum OplogError {
    #[error(transparent)]
    Entry(#[from] EntryError),
}

// ─── OpLog ───────────────────────────────────────────────────────────────────

pub struct OpLog {
    id: String,
    identity: Arc<Keypair>,
    access: Arc<AccessController>,
    entries: HashMap<Cid, Entry>,
    heads: BTreeSet<Cid>,
    /// Every CID referenced as a parent by some entry in the log.
    referenced: HashSet<Cid>,
}

impl OpLog {
    pub fn new(id: impl Into<String>, identity: Arc<Keypair>, access: Arc<AccessController>) -> Self {
        OpLog {
            id: id.into(),
            identity,
            access,
            entries: HashMap::new(),
            heads: BTreeSet::new(),
            referenced: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn access(&self) -> &Arc<AccessController> {
        &self.access
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.entries.contains_key(cid)
    }

    pub fn get(&self, cid: &Cid) -> Option<&Entry> {
        self.entries.get(cid)
    }

    /// Current heads, ordered by CID.
    pub fn heads(&self) -> Vec<Entry> {
        self.heads
            .iter()
            .filter_map(|c| self.entries.get(c))
            .cloned()
            .collect()
    }

    pub fn head_cids(&self) -> Vec<Cid> {
        self.heads.iter().copied().collect()
    }

    /// Entries whose parents are empty or not present locally, in total order.
    pub fn tails(&self) -> Vec<Entry> {
        let mut tails: Vec<Entry> = self
            .entries
            .values()
            .filter(|e| e.next.iter().all(|p| !self.entries.contains_key(p)))
            .cloned()
            .collect();
        tails.sort();
        tails
    }

    /// Append a local write on top of the current heads.
    ///
    /// The new entry's clock is one past the maximum head clock; the entry is
    /// verified against the access policy before the log is touched, so an
    /// unauthorized local write fails without side effects.
    pub fn append(&mut self, payload: Vec<u8>) -> Result<Entry, OplogError> {
        let parents: Vec<&Entry> = self
            .heads
            .iter()
            .filter_map(|c| self.entries.get(c))
            .collect();
        let entry = Entry::create(&self.identity, &self.id, payload, &parents)?;
        entry::verify(&entry, &self.access)?;
        self.apply(entry.clone());
        Ok(entry)
    }

    /// Merge a batch of candidate entries: skip known, verify each against
    /// the access policy, insert, recompute heads. Idempotent. Entries that
    /// fail verification are dropped (logged at debug), never an error.
    ///
    /// Returns the newly added entries in total order.
    pub fn merge(&mut self, candidates: Vec<Entry>) -> Vec<Entry> {
        let mut added = Vec::new();
        for entry in candidates {
            if self.entries.contains_key(&entry.hash) {
                continue;
            }
            if let Err(e) = entry::verify(&entry, &self.access) {
                debug!("merge drops entry {}: {e}", entry.hash);
                continue;
            }
            self.apply(entry.clone());
            added.push(entry);
        }
        added.sort();
        added
    }

    /// Insert an already-verified entry and maintain the head set. Returns
    /// false if the entry was already present.
    pub(crate) fn apply(&mut self, entry: Entry) -> bool {
        if self.entries.contains_key(&entry.hash) {
            return false;
        }
        for parent in &entry.next {
            self.referenced.insert(*parent);
            self.heads.remove(parent);
        }
        if !self.referenced.contains(&entry.hash) {
            self.heads.insert(entry.hash);
        }
        self.entries.insert(entry.hash, entry);
        true
    }

    /// All entries in the deterministic total order
    /// `(clock.time, clock.id, cid)` ascending.
    pub fn all(&self) -> Vec<Entry> {
        let mut all: Vec<Entry> = self.entries.values().cloned().collect();
        all.sort();
        all
    }

    /// Walk the DAG from `start` toward the tails, breadth-first, yielding
    /// locally present entries. Stops once `amount` entries have been
    /// yielded (`-1` = no bound) and never crosses into `end`.
    pub fn traverse(&self, start: &[Cid], amount: i64, end: &HashSet<Cid>) -> Vec<Entry> {
        let mut queue: VecDeque<Cid> = {
            let mut seed: Vec<Cid> = start.to_vec();
            seed.sort();
            seed.into_iter().collect()
        };
        let mut visited: HashSet<Cid> = queue.iter().copied().collect();
        let mut out = Vec::new();

        while let Some(cid) = queue.pop_front() {
            if end.contains(&cid) {
                continue;
            }
            let Some(entry) = self.entries.get(&cid) else {
                continue;
            };
            out.push(entry.clone());
            if amount >= 0 && out.len() as i64 >= amount {
                break;
            }
            for parent in &entry.next {
                if visited.insert(*parent) {
                    queue.push_back(*parent);
                }
            }
        }
        out
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessController;

    fn open_log(kp: Arc<Keypair>) -> OpLog {
        let access = Arc::new(AccessController::for_creator(&["*".to_string()], "x"));
        OpLog::new("/eddy/t/db", kp, access)
    }

    fn writer_log(kp: Arc<Keypair>) -> OpLog {
        let access = Arc::new(AccessController::for_creator(&[], &kp.public_key_hex()));
        OpLog::new("/eddy/t/db", kp, access)
    }

    #[test]
    fn append_advances_clock_monotonically() {
        let kp = Arc::new(Keypair::generate());
        let mut log = writer_log(kp);
        for i in 1..=5u64 {
            let e = log.append(format!("e{i}").into_bytes()).unwrap();
            assert_eq!(e.clock.time, i);
        }
        assert_eq!(log.len(), 5);
        assert_eq!(log.heads().len(), 1);
        assert_eq!(log.heads()[0].clock.time, 5);
    }

    #[test]
    fn unauthorized_append_fails_without_mutation() {
        let owner = Keypair::generate();
        let stranger = Arc::new(Keypair::generate());
        let access = Arc::new(AccessController::for_creator(&[], &owner.public_key_hex()));
        let mut log = OpLog::new("/eddy/t/db", stranger, access);

        assert!(log.append(b"nope".to_vec()).is_err());
        assert!(log.is_empty());
        assert!(log.heads().is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let kp = Arc::new(Keypair::generate());
        let mut a = open_log(kp.clone());
        for i in 0..3 {
            a.append(vec![i]).unwrap();
        }

        let kp2 = Arc::new(Keypair::generate());
        let mut b = open_log(kp2);
        let added = b.merge(a.all());
        assert_eq!(added.len(), 3);

        let again = b.merge(a.all());
        assert!(again.is_empty());
        assert_eq!(b.len(), 3);
        assert_eq!(b.head_cids(), a.head_cids());
    }

    #[test]
    fn merge_drops_invalid_entries() {
        let kp = Arc::new(Keypair::generate());
        let mut a = open_log(kp.clone());
        let good = a.append(b"good".to_vec()).unwrap();
        let mut forged = good.clone();
        forged.payload = b"forged".to_vec();
        forged.hash = Cid::digest(b"different");

        let kp2 = Arc::new(Keypair::generate());
        let mut b = open_log(kp2);
        let added = b.merge(vec![good.clone(), forged]);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0], good);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn concurrent_writers_converge_on_two_heads() {
        let kp1 = Arc::new(Keypair::generate());
        let kp2 = Arc::new(Keypair::generate());
        let mut a = open_log(kp1);
        let mut b = open_log(kp2);

        a.append(b"a1".to_vec()).unwrap();
        b.append(b"b1".to_vec()).unwrap();

        let merged = a.merge(b.all());
        assert_eq!(merged.len(), 1);
        // Neither entry references the other: both are heads.
        assert_eq!(a.heads().len(), 2);

        // The next append joins both branches.
        let join = a.append(b"join".to_vec()).unwrap();
        assert_eq!(join.next.len(), 2);
        assert_eq!(join.clock.time, 2);
        assert_eq!(a.heads().len(), 1);
    }

    #[test]
    fn total_order_is_replica_independent() {
        let kp1 = Arc::new(Keypair::generate());
        let kp2 = Arc::new(Keypair::generate());
        let mut a = open_log(kp1);
        let mut b = open_log(kp2);

        a.append(b"a1".to_vec()).unwrap();
        a.append(b"a2".to_vec()).unwrap();
        b.append(b"b1".to_vec()).unwrap();

        // Merge in opposite directions; orders must match.
        a.merge(b.all());
        b.merge(a.all());

        let seq_a: Vec<Cid> = a.all().iter().map(|e| e.hash).collect();
        let seq_b: Vec<Cid> = b.all().iter().map(|e| e.hash).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn tails_are_parentless_entries() {
        let kp = Arc::new(Keypair::generate());
        let mut log = open_log(kp);
        let first = log.append(b"t".to_vec()).unwrap();
        log.append(b"u".to_vec()).unwrap();

        let tails = log.tails();
        assert_eq!(tails.len(), 1);
        assert_eq!(tails[0], first);
    }

    #[test]
    fn traverse_bounded_and_ended() {
        let kp = Arc::new(Keypair::generate());
        let mut log = open_log(kp);
        let mut cids = Vec::new();
        for i in 0..5u8 {
            cids.push(log.append(vec![i]).unwrap().hash);
        }

        let from_head = log.traverse(&log.head_cids(), -1, &HashSet::new());
        assert_eq!(from_head.len(), 5);
        // Traversal runs from the head toward the tail.
        assert_eq!(from_head[0].hash, cids[4]);
        assert_eq!(from_head[4].hash, cids[0]);

        let bounded = log.traverse(&log.head_cids(), 2, &HashSet::new());
        assert_eq!(bounded.len(), 2);

        let end: HashSet<Cid> = [cids[1]].into_iter().collect();
        let ended = log.traverse(&log.head_cids(), -1, &end);
        assert_eq!(ended.len(), 3); // entries 5, 4, 3; stops before 2
    }
}
