//! Content identifiers — SHA-256 over an object's canonical bytes.
//!
//! A [`Cid`] is both the name of an object in the store and its integrity
//! check: re-hashing fetched bytes must reproduce the CID they were fetched
//! under. CIDs travel hex-encoded (64 lowercase chars) and compare
//! lexicographically, which on the raw bytes and on the hex form yields the
//! same order.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CidError {
    #[error("invalid cid hex: {0}")]
    BadHex(String),
    #[error("cid must be 32 bytes (64 hex chars)")]
    BadLength,
}

// ─── Cid ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Hash `bytes` into a content id.
    pub fn digest(bytes: &[u8]) -> Self {
        Cid(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CidError> {
        let bytes = hex::decode(s).map_err(|e| CidError::BadHex(e.to_string()))?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| CidError::BadLength)?;
        Ok(Cid(array))
    }

    /// Placeholder used only while decoding, before the real hash is computed.
    pub(crate) fn unresolved() -> Self {
        Cid([0u8; 32])
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_hex())
    }
}

// Hex string on the wire so CBOR and JSON carry the same representation.
impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
