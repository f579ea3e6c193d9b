//! Ed25519 identities and the long-lived key store.
//!
//! Public keys and signatures travel hex-encoded; the hex public key is the
//! peer identity and the `clock.id` of every entry a key signs.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use tokio::sync::Mutex;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key hex: {0}")]
    BadHex(String),
    #[error("invalid key bytes")]
    BadKey,
    #[error("invalid signature encoding")]
    BadSignature,
}

// ─── Keypair ─────────────────────────────────────────────────────────────────

pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Keypair { signing: SigningKey::generate(&mut OsRng) }
    }

    /// Rebuild a keypair from a 32-byte seed (64 hex chars).
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(seed_hex).map_err(|e| KeyError::BadHex(e.to_string()))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| KeyError::BadKey)?;
        Ok(Keypair { signing: SigningKey::from_bytes(&seed) })
    }

    /// Hex-encoded public key (32 bytes → 64 hex chars). This is the peer identity.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    /// Sign `bytes` and return the hex-encoded signature.
    pub fn sign_hex(&self, bytes: &[u8]) -> String {
        hex::encode(self.signing.sign(bytes).to_bytes())
    }
}

/// Verify a hex signature over `bytes` against a hex-encoded public key.
///
/// Returns `Ok(false)` on a well-formed but wrong signature; `Err` only when
/// the key or signature cannot be decoded at all.
pub fn verify_hex(public_key_hex: &str, bytes: &[u8], sig_hex: &str) -> Result<bool, KeyError> {
    let pk_bytes = hex::decode(public_key_hex).map_err(|e| KeyError::BadHex(e.to_string()))?;
    let pk_array: [u8; 32] = pk_bytes.try_into().map_err(|_| KeyError::BadKey)?;
    let key = VerifyingKey::from_bytes(&pk_array).map_err(|_| KeyError::BadKey)?;

    let sig_bytes = hex::decode(sig_hex).map_err(|_| KeyError::BadSignature)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| KeyError::BadSignature)?;

    Ok(key.verify(bytes, &sig).is_ok())
}

// ─── KeyStore ────────────────────────────────────────────────────────────────

/// Named signing keys, created on demand and shared across coordinators.
#[derive(Default)]
pub struct KeyStore {
    keys: Mutex<HashMap<String, Arc<Keypair>>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_key(&self, id: &str) -> Option<Arc<Keypair>> {
        self.keys.lock().await.get(id).cloned()
    }

    /// Returns the existing key for `id`, creating one if absent.
    pub async fn create_key(&self, id: &str) -> Arc<Keypair> {
        let mut keys = self.keys.lock().await;
        keys.entry(id.to_string())
            .or_insert_with(|| Arc::new(Keypair::generate()))
            .clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
