//! Seams for public-key lookup and signature verification.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::crypto;
use crate::error::{CryptoError, SigningError};

/// Resolves an agent's encoded public key (`ed25519:<base64>`).
#[async_trait]
pub trait KeyLookup: Send + Sync {
    /// `Ok(None)` for agents without a registered key.
    async fn public_key(&self, agent_id: &str) -> Result<Option<String>, SigningError>;
}

/// Checks a signature over the canonical `(message, nonce)` payload.
///
/// `Ok(false)` for anything that simply does not verify; `Err` only for
/// key material that cannot be decoded at all.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        message: &str,
        nonce: &str,
        signature: &str,
        public_key: &str,
    ) -> Result<bool, CryptoError>;
}

/// Ed25519 over the `moltnet:v1` payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        message: &str,
        nonce: &str,
        signature: &str,
        public_key: &str,
    ) -> Result<bool, CryptoError> {
        crypto::verify_with_nonce(message, nonce, signature, public_key)
    }
}

/// Fixed agent → key map, for tests and single-node setups.
#[derive(Debug, Default)]
pub struct StaticKeyLookup {
    keys: RwLock<HashMap<String, String>>,
}

impl StaticKeyLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, agent_id: impl Into<String>, public_key: impl Into<String>) -> Self {
        self.insert(agent_id, public_key);
        self
    }

    pub fn insert(&self, agent_id: impl Into<String>, public_key: impl Into<String>) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(agent_id.into(), public_key.into());
        }
    }
}

#[async_trait]
impl KeyLookup for StaticKeyLookup {
    async fn public_key(&self, agent_id: &str) -> Result<Option<String>, SigningError> {
        let keys = self.keys.read().map_err(|_| SigningError::KeyLookup {
            agent_id: agent_id.to_string(),
            reason: "key map lock poisoned".to_string(),
        })?;
        Ok(keys.get(agent_id).cloned())
    }
}
