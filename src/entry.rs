//! Log entries — signed, content-addressed, causally clocked records.
//!
//! An entry's canonical form is CBOR with fields in fixed order:
//! `id`, `payload`, `next`, `v`, `clock{id,time}`, `key`, `identity`, `sig`.
//! The `hash` is omitted from the stored bytes and recomputed on decode. The
//! signature covers `{payload, next, clock, identity}`; the CID covers the
//! whole canonical form including the signature. Equal content therefore
//! yields equal CIDs on every replica.

use std::cmp::Ordering;

use ciborium::{from_reader, into_writer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::AccessController;
use crate::cid::Cid;
use crate::keys::{self, Keypair};

pub const ENTRY_VERSION: u8 = 1;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("CBOR encode error: {0}")]
    Encode(String),
    #[error("CBOR decode error: {0}")]
    Decode(String),
    #[error("malformed entry: {0}")]
    Malformed(String),
    #[error("invalid entry: {0}")]
    Invalid(String),
    #[error("not authorized: {0} lacks write access")]
    Unauthorized(String),
}

// ─── CBOR helpers ────────────────────────────────────────────────────────────

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, EntryError> {
    let mut buf = Vec::new();
    into_writer(value, &mut buf).map_err(|e| EntryError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, EntryError> {
    from_reader(bytes).map_err(|e| EntryError::Decode(e.to_string()))
}

// ─── Clock ───────────────────────────────────────────────────────────────────

/// Logical timestamp: the writer's public key plus a Lamport time that is one
/// greater than the maximum time among the entry's parents (1 for a tail).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    pub id: String,
    pub time: u64,
}

impl LamportClock {
    /// Causality-respecting comparison: time first, writer id as tiebreak.
    pub fn cmp_order(&self, other: &LamportClock) -> Ordering {
        self.time.cmp(&other.time).then_with(|| self.id.cmp(&other.id))
    }
}

// ─── Entry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Address of the database this entry belongs to.
    pub id: String,
    /// Opaque payload supplied by the view layer.
    pub payload: Vec<u8>,
    /// CIDs of the immediate predecessors (empty for a tail).
    pub next: Vec<Cid>,
    pub v: u8,
    pub clock: LamportClock,
    /// Hex public key the entry was signed with.
    pub key: String,
    /// Hex public key of the signer's identity.
    pub identity: String,
    /// Hex Ed25519 signature over `{payload, next, clock, identity}`.
    pub sig: String,
    /// Content id of the canonical bytes. Not part of the stored form.
    #[serde(skip, default = "Cid::unresolved")]
    pub hash: Cid,
}

#[derive(Serialize)]
struct SigningView<'a> {
    payload: &'a [u8],
    next: &'a [Cid],
    clock: &'a LamportClock,
    identity: &'a str,
}

fn signing_bytes(
    payload: &[u8],
    next: &[Cid],
    clock: &LamportClock,
    identity: &str,
) -> Result<Vec<u8>, EntryError> {
    encode_cbor(&SigningView { payload, next, clock, identity })
}

impl Entry {
    /// Build and sign a new entry on top of `parents`.
    pub fn create(
        keypair: &Keypair,
        log_id: &str,
        payload: Vec<u8>,
        parents: &[&Entry],
    ) -> Result<Entry, EntryError> {
        let identity = keypair.public_key_hex();
        let time = parents.iter().map(|p| p.clock.time).max().unwrap_or(0) + 1;
        let clock = LamportClock { id: identity.clone(), time };
        let next: Vec<Cid> = parents.iter().map(|p| p.hash).collect();

        let sig = keypair.sign_hex(&signing_bytes(&payload, &next, &clock, &identity)?);

        let mut entry = Entry {
            id: log_id.to_string(),
            payload,
            next,
            v: ENTRY_VERSION,
            clock,
            key: identity.clone(),
            identity,
            sig,
            hash: Cid::unresolved(),
        };
        entry.hash = Cid::digest(&entry.to_bytes()?);
        Ok(entry)
    }

    /// Canonical bytes as stored in the object store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EntryError> {
        encode_cbor(self)
    }

    /// Decode stored bytes and recompute the CID from the canonical
    /// re-encoding (so a non-canonical encoding of the same fields cannot
    /// impersonate another entry).
    pub fn from_bytes(bytes: &[u8]) -> Result<Entry, EntryError> {
        let mut entry: Entry = decode_cbor(bytes)?;
        entry.hash = Cid::digest(&entry.to_bytes()?);
        Ok(entry)
    }
}

/// Entries are content-addressed: equal CID means equal entry.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Entry {}

/// The deterministic total order exposed to the view layer:
/// `(clock.time, clock.id, cid)` ascending.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp_order(&other.clock)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ─── Verification ────────────────────────────────────────────────────────────

/// Structural checks, signature check, then the access policy.
pub fn verify(entry: &Entry, access: &AccessController) -> Result<(), EntryError> {
    if entry.v != ENTRY_VERSION {
        return Err(EntryError::Malformed(format!("unsupported version {}", entry.v)));
    }
    if entry.clock.time == 0 {
        return Err(EntryError::Malformed("clock time must be positive".into()));
    }
    if entry.clock.id != entry.identity || entry.key != entry.identity {
        return Err(EntryError::Malformed("clock id / key / identity disagree".into()));
    }

    let bytes = signing_bytes(&entry.payload, &entry.next, &entry.clock, &entry.identity)?;
    match keys::verify_hex(&entry.identity, &bytes, &entry.sig) {
        Ok(true) => {}
        Ok(false) => return Err(EntryError::Invalid("signature mismatch".into())),
        Err(e) => return Err(EntryError::Malformed(e.to_string())),
    }

    if !access.can_append(entry) {
        return Err(EntryError::Unauthorized(entry.identity.clone()));
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
