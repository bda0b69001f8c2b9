//! Key-recovery challenges.
//!
//! Lets a key holder prove possession of a private key without an existing
//! session. The server hands out a challenge plus an HMAC over it, keeps no
//! state, and later checks the MAC, the age, the Ed25519 signature and that
//! the challenge nonce was never used before.
//!
//! Challenge format: `moltnet:recovery:<public_key>:<nonce>:<unix_millis>`

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::crypto;
use crate::error::{CryptoError, RecoveryError};
use crate::signing::NonceLedger;

type HmacSha256 = Hmac<Sha256>;

const CHALLENGE_PREFIX: &str = "moltnet:recovery:";

/// A challenge as handed to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedChallenge {
    pub challenge: String,
    pub hmac: String,
}

/// Fields recovered from a challenge string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChallenge {
    pub public_key: String,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
}

/// Issues and verifies recovery challenges.
pub struct RecoveryChallenges {
    secret: SecretString,
    ttl: Duration,
    ledger: NonceLedger,
}

impl RecoveryChallenges {
    /// Fails with [`RecoveryError::Disabled`] when no secret is configured.
    pub fn new(config: &RecoveryConfig, ledger: NonceLedger) -> Result<Self, RecoveryError> {
        let secret = config.secret.clone().ok_or(RecoveryError::Disabled)?;
        Ok(Self {
            secret,
            ttl: config.challenge_ttl,
            ledger,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// New challenge for `public_key`.
    pub fn issue(&self, public_key: &str) -> Result<IssuedChallenge, RecoveryError> {
        self.issue_at(public_key, Utc::now())
    }

    pub(crate) fn issue_at(
        &self,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedChallenge, RecoveryError> {
        // Rejects anything that is not an `ed25519:` key up front.
        crypto::fingerprint(public_key)?;

        let challenge = format!(
            "{CHALLENGE_PREFIX}{}:{}:{}",
            public_key.trim(),
            Uuid::new_v4(),
            now.timestamp_millis()
        );
        let hmac = BASE64.encode(self.mac(&challenge)?);
        tracing::debug!(fingerprint = %crypto::fingerprint(public_key)?, "recovery challenge issued");
        Ok(IssuedChallenge { challenge, hmac })
    }

    /// Check a signed challenge and burn its nonce.
    ///
    /// `signature` covers the codec bytes of `(challenge, nonce)`.
    pub async fn verify(
        &self,
        challenge: &str,
        hmac: &str,
        signature: &str,
        public_key: &str,
    ) -> Result<(), RecoveryError> {
        self.verify_at(challenge, hmac, signature, public_key, Utc::now())
            .await
    }

    #[tracing::instrument(skip_all)]
    pub(crate) async fn verify_at(
        &self,
        challenge: &str,
        hmac: &str,
        signature: &str,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RecoveryError> {
        let expected = self.mac(challenge)?;
        let provided = BASE64
            .decode(hmac.trim())
            .map_err(|_| RecoveryError::InvalidMac)?;
        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(RecoveryError::InvalidMac);
        }

        let parsed = parse_challenge(challenge)?;
        if parsed.public_key != public_key.trim() {
            return Err(RecoveryError::KeyMismatch);
        }

        let age = (now - parsed.issued_at).to_std().unwrap_or(Duration::ZERO);
        if age > self.ttl {
            return Err(RecoveryError::ChallengeExpired { age, ttl: self.ttl });
        }

        if !crypto::verify_with_nonce(challenge, &parsed.nonce, signature, &parsed.public_key)? {
            return Err(RecoveryError::InvalidSignature);
        }

        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = parsed
            .issued_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if !self.ledger.consume(&parsed.nonce, expires_at).await? {
            tracing::warn!("recovery challenge replayed");
            return Err(RecoveryError::Replayed);
        }

        tracing::info!("recovery challenge verified");
        Ok(())
    }

    fn mac(&self, challenge: &str) -> Result<Vec<u8>, RecoveryError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| CryptoError::InvalidKeyEncoding {
                reason: format!("recovery secret: {e}"),
            })?;
        mac.update(challenge.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Split a challenge into its parts.
///
/// The public key itself contains `:`, so the nonce and timestamp are taken
/// from the right.
pub fn parse_challenge(challenge: &str) -> Result<ParsedChallenge, RecoveryError> {
    let malformed = |reason: &str| RecoveryError::MalformedChallenge {
        reason: reason.to_string(),
    };

    let body = challenge
        .strip_prefix(CHALLENGE_PREFIX)
        .ok_or_else(|| malformed("missing moltnet:recovery: prefix"))?;

    let mut parts = body.rsplitn(3, ':');
    let millis = parts.next().ok_or_else(|| malformed("missing timestamp"))?;
    let nonce = parts.next().ok_or_else(|| malformed("missing nonce"))?;
    let public_key = parts.next().ok_or_else(|| malformed("missing public key"))?;

    if public_key.is_empty() || nonce.is_empty() {
        return Err(malformed("empty public key or nonce"));
    }
    let millis: i64 = millis
        .parse()
        .map_err(|_| malformed("timestamp is not an integer"))?;
    let issued_at = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| malformed("timestamp out of range"))?;

    Ok(ParsedChallenge {
        public_key: public_key.to_string(),
        nonce: nonce.to_string(),
        issued_at,
    })
}
